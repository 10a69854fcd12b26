//! Per-source harvest record history. At most one record per guid is current.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use gnh_core::HarvestRecord;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{read_json, write_json, StorageError};

#[async_trait]
pub trait HarvestLedger: Send + Sync {
    /// `guid -> owner_ref` for every current record of `source_id`.
    async fn current_owner_refs(
        &self,
        source_id: &str,
    ) -> Result<BTreeMap<String, String>, StorageError>;

    async fn current_record(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, StorageError>;

    async fn previous_content(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .current_record(source_id, guid)
            .await?
            .and_then(|record| record.content))
    }

    /// Makes `record` the current one for its guid. The displaced record is
    /// either kept as history or dropped when `discard_previous` is set.
    async fn promote(&self, record: HarvestRecord, discard_previous: bool)
        -> Result<(), StorageError>;

    /// Ends the current record for `guid` and stores the non-current tombstone.
    async fn retire(&self, tombstone: HarvestRecord) -> Result<(), StorageError>;

    /// Stores a failed attempt as history without touching the current record.
    async fn record_failure(&self, record: HarvestRecord) -> Result<(), StorageError>;

    async fn records(&self, source_id: &str) -> Result<Vec<HarvestRecord>, StorageError>;
}

fn owner_refs(records: &[HarvestRecord]) -> BTreeMap<String, String> {
    records
        .iter()
        .filter(|r| r.current)
        .filter_map(|r| r.owner_ref.clone().map(|owner| (r.guid.clone(), owner)))
        .collect()
}

fn current_of<'a>(records: &'a [HarvestRecord], guid: &str) -> Option<&'a HarvestRecord> {
    records.iter().find(|r| r.current && r.guid == guid)
}

fn promote_into(records: &mut Vec<HarvestRecord>, mut record: HarvestRecord, discard_previous: bool) {
    if discard_previous {
        records.retain(|r| !(r.current && r.guid == record.guid));
    } else {
        for previous in records.iter_mut().filter(|r| r.current && r.guid == record.guid) {
            previous.current = false;
        }
    }
    record.current = true;
    records.push(record);
}

fn retire_into(records: &mut Vec<HarvestRecord>, mut tombstone: HarvestRecord) {
    for previous in records
        .iter_mut()
        .filter(|r| r.current && r.guid == tombstone.guid)
    {
        previous.current = false;
    }
    tombstone.current = false;
    records.push(tombstone);
}

fn push_failure(records: &mut Vec<HarvestRecord>, mut record: HarvestRecord) {
    record.current = false;
    records.push(record);
}

/// Non-current records kept per guid by [`JsonLedger`] unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 3;

/// Drops all but the newest `limit` non-current records of every guid.
/// Records are stored oldest first.
fn prune_history(records: &mut Vec<HarvestRecord>, limit: usize) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let keep: Vec<bool> = records
        .iter()
        .rev()
        .map(|record| {
            if record.current {
                return true;
            }
            let count = seen.entry(record.guid.as_str()).or_default();
            *count += 1;
            *count <= limit
        })
        .collect();
    let mut flags = keep.into_iter().rev();
    records.retain(|_| flags.next().unwrap_or(true));
}

/// One JSON file per source under `root`, rewritten atomically on every change.
///
/// Sources are loaded once and served from memory afterwards, so the ledger
/// must be the only writer of its directory. History is pruned on write.
#[derive(Debug)]
pub struct JsonLedger {
    root: PathBuf,
    history_limit: usize,
    sources: Mutex<HashMap<String, Vec<HarvestRecord>>>,
}

impl JsonLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sources: Mutex::default(),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn path_for(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.json"))
    }

    async fn loaded<'a>(
        &self,
        sources: &'a mut HashMap<String, Vec<HarvestRecord>>,
        source_id: &str,
    ) -> Result<&'a mut Vec<HarvestRecord>, StorageError> {
        if !sources.contains_key(source_id) {
            let records: Vec<HarvestRecord> =
                read_json(&self.path_for(source_id)).await?.unwrap_or_default();
            debug!(source_id, records = records.len(), "loaded harvest ledger");
            sources.insert(source_id.to_string(), records);
        }
        Ok(sources.entry(source_id.to_string()).or_default())
    }

    async fn read<R, F>(&self, source_id: &str, view: F) -> Result<R, StorageError>
    where
        F: FnOnce(&[HarvestRecord]) -> R + Send,
    {
        let mut sources = self.sources.lock().await;
        let records = self.loaded(&mut sources, source_id).await?;
        Ok(view(records))
    }

    async fn modify<F>(&self, source_id: &str, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Vec<HarvestRecord>) + Send,
    {
        let mut sources = self.sources.lock().await;
        let records = self.loaded(&mut sources, source_id).await?;
        let mut next = records.clone();
        change(&mut next);
        prune_history(&mut next, self.history_limit);
        write_json(&self.path_for(source_id), &next).await?;
        *records = next;
        Ok(())
    }
}

#[async_trait]
impl HarvestLedger for JsonLedger {
    async fn current_owner_refs(
        &self,
        source_id: &str,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        self.read(source_id, owner_refs).await
    }

    async fn current_record(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, StorageError> {
        self.read(source_id, |records| current_of(records, guid).cloned())
            .await
    }

    async fn promote(
        &self,
        record: HarvestRecord,
        discard_previous: bool,
    ) -> Result<(), StorageError> {
        let source_id = record.source_id.clone();
        self.modify(&source_id, move |records| {
            promote_into(records, record, discard_previous)
        })
        .await
    }

    async fn retire(&self, tombstone: HarvestRecord) -> Result<(), StorageError> {
        let source_id = tombstone.source_id.clone();
        self.modify(&source_id, move |records| retire_into(records, tombstone))
            .await
    }

    async fn record_failure(&self, record: HarvestRecord) -> Result<(), StorageError> {
        let source_id = record.source_id.clone();
        self.modify(&source_id, move |records| push_failure(records, record))
            .await
    }

    async fn records(&self, source_id: &str) -> Result<Vec<HarvestRecord>, StorageError> {
        self.read(source_id, <[HarvestRecord]>::to_vec).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    sources: Mutex<HashMap<String, Vec<HarvestRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HarvestLedger for MemoryLedger {
    async fn current_owner_refs(
        &self,
        source_id: &str,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        let sources = self.sources.lock().await;
        Ok(sources
            .get(source_id)
            .map(|records| owner_refs(records))
            .unwrap_or_default())
    }

    async fn current_record(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Option<HarvestRecord>, StorageError> {
        let sources = self.sources.lock().await;
        Ok(sources
            .get(source_id)
            .and_then(|records| current_of(records, guid))
            .cloned())
    }

    async fn promote(
        &self,
        record: HarvestRecord,
        discard_previous: bool,
    ) -> Result<(), StorageError> {
        let mut sources = self.sources.lock().await;
        let records = sources.entry(record.source_id.clone()).or_default();
        promote_into(records, record, discard_previous);
        Ok(())
    }

    async fn retire(&self, tombstone: HarvestRecord) -> Result<(), StorageError> {
        let mut sources = self.sources.lock().await;
        let records = sources.entry(tombstone.source_id.clone()).or_default();
        retire_into(records, tombstone);
        Ok(())
    }

    async fn record_failure(&self, record: HarvestRecord) -> Result<(), StorageError> {
        let mut sources = self.sources.lock().await;
        let records = sources.entry(record.source_id.clone()).or_default();
        push_failure(records, record);
        Ok(())
    }

    async fn records(&self, source_id: &str) -> Result<Vec<HarvestRecord>, StorageError> {
        let sources = self.sources.lock().await;
        Ok(sources.get(source_id).cloned().unwrap_or_default())
    }
}
