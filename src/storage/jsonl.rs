//! JSONL file market store
//!
//! One line-delimited JSON file per (symbol, kind) under a data directory.
//! Each dataset is loaded into memory on first touch and kept keyed by the
//! natural key; `flush` rewrites dirty datasets sorted by key into a
//! temporary file and atomically renames it over the target, so a reader
//! never observes a partially written file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::schema::{AggTrade, Candle, FundingRate, KeyedRecord, OpenInterestSample};
use crate::storage::{MarketStore, StorageError, StorageResult, UpsertStats};

/// File-backed market store rooted at a data directory
pub struct JsonlStore {
    root: PathBuf,
    candles: DatasetMap<Candle>,
    trades: DatasetMap<AggTrade>,
    open_interest: DatasetMap<OpenInterestSample>,
    funding: DatasetMap<FundingRate>,
}

impl JsonlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            candles: DatasetMap::default(),
            trades: DatasetMap::default(),
            open_interest: DatasetMap::default(),
            funding: DatasetMap::default(),
        }
    }

    /// Directory holding the dataset files
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Lazily opened datasets per symbol; the outer lock guards only the
/// registry so distinct datasets never block each other.
struct DatasetMap<T> {
    datasets: RwLock<HashMap<String, Arc<Mutex<Dataset<T>>>>>,
}

impl<T> Default for DatasetMap<T> {
    fn default() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> DatasetMap<T>
where
    T: KeyedRecord + Serialize + DeserializeOwned,
{
    fn open(&self, root: &Path, symbol: &str) -> StorageResult<Arc<Mutex<Dataset<T>>>> {
        let key = symbol.to_uppercase();
        if let Some(existing) = self.datasets.read().get(&key) {
            return Ok(Arc::clone(existing));
        }
        let mut guard = self.datasets.write();
        if let Some(existing) = guard.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let file = format!("{}_{}.jsonl", symbol.to_lowercase(), T::KIND.as_str());
        let dataset = Arc::new(Mutex::new(Dataset::load(root.join(file))?));
        guard.insert(key, Arc::clone(&dataset));
        Ok(dataset)
    }

    fn flush_all(&self) -> StorageResult<()> {
        for dataset in self.datasets.read().values() {
            dataset.lock().flush()?;
        }
        Ok(())
    }
}

/// One (symbol, kind) dataset held in memory, keyed by the natural key
struct Dataset<T> {
    path: PathBuf,
    records: BTreeMap<i64, T>,
    dirty: bool,
}

impl<T> Dataset<T>
where
    T: KeyedRecord + Serialize + DeserializeOwned,
{
    fn load(path: PathBuf) -> StorageResult<Self> {
        let mut records = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for (idx, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: T =
                    serde_json::from_str(line).map_err(|source| StorageError::Corrupt {
                        path: path.display().to_string(),
                        line: idx + 1,
                        source,
                    })?;
                records.insert(record.key(), record);
            }
            debug!(path = %path.display(), records = records.len(), "loaded dataset");
        }
        Ok(Self {
            path,
            records,
            dirty: false,
        })
    }

    fn upsert_many(&mut self, rows: &[T]) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for row in rows {
            match self.records.get(&row.key()) {
                Some(existing) if existing == row => {
                    stats.unchanged += 1;
                    continue;
                }
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }
            self.records.insert(row.key(), row.clone());
            self.dirty = true;
        }
        stats
    }

    fn max_key(&self) -> Option<i64> {
        self.records.keys().next_back().copied()
    }

    fn newest(&self, limit: usize) -> Vec<T> {
        if limit == 0 {
            return Vec::new();
        }
        let mut rows: Vec<T> = self.records.values().rev().take(limit).cloned().collect();
        rows.reverse();
        rows
    }

    fn flush(&mut self) -> StorageResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for record in self.records.values() {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.dirty = false;
        debug!(path = %self.path.display(), records = self.records.len(), "flushed dataset");
        Ok(())
    }
}

#[async_trait]
impl MarketStore for JsonlStore {
    async fn latest_candle_open_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(self.candles.open(&self.root, symbol)?.lock().max_key())
    }

    async fn latest_trade_id(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(self.trades.open(&self.root, symbol)?.lock().max_key())
    }

    async fn latest_open_interest_timestamp(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(self.open_interest.open(&self.root, symbol)?.lock().max_key())
    }

    async fn latest_funding_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(self.funding.open(&self.root, symbol)?.lock().max_key())
    }

    async fn upsert_candles(&self, symbol: &str, rows: &[Candle]) -> StorageResult<UpsertStats> {
        Ok(self
            .candles
            .open(&self.root, symbol)?
            .lock()
            .upsert_many(rows))
    }

    async fn upsert_trades(&self, symbol: &str, rows: &[AggTrade]) -> StorageResult<UpsertStats> {
        Ok(self
            .trades
            .open(&self.root, symbol)?
            .lock()
            .upsert_many(rows))
    }

    async fn upsert_open_interest(
        &self,
        symbol: &str,
        rows: &[OpenInterestSample],
    ) -> StorageResult<UpsertStats> {
        Ok(self
            .open_interest
            .open(&self.root, symbol)?
            .lock()
            .upsert_many(rows))
    }

    async fn upsert_funding_rates(
        &self,
        symbol: &str,
        rows: &[FundingRate],
    ) -> StorageResult<UpsertStats> {
        Ok(self
            .funding
            .open(&self.root, symbol)?
            .lock()
            .upsert_many(rows))
    }

    async fn fetch_latest_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<Candle>> {
        Ok(self.candles.open(&self.root, symbol)?.lock().newest(limit))
    }

    async fn fetch_latest_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<AggTrade>> {
        Ok(self.trades.open(&self.root, symbol)?.lock().newest(limit))
    }

    async fn fetch_latest_open_interest(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<OpenInterestSample>> {
        Ok(self
            .open_interest
            .open(&self.root, symbol)?
            .lock()
            .newest(limit))
    }

    async fn fetch_latest_funding(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<FundingRate>> {
        Ok(self.funding.open(&self.root, symbol)?.lock().newest(limit))
    }

    async fn flush(&self) -> StorageResult<()> {
        self.candles.flush_all()?;
        self.trades.flush_all()?;
        self.open_interest.flush_all()?;
        self.funding.flush_all()?;
        Ok(())
    }
}
