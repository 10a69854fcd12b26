//! Target catalog writers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use gnh_core::NormalizedRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{read_json, write_json, StorageError};

/// Identity of a record as the catalog currently holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub title: String,
}

#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Creates a record and returns its owner reference.
    async fn create(&self, record: &NormalizedRecord) -> Result<String, StorageError>;

    async fn update(
        &self,
        owner_ref: &str,
        record: &NormalizedRecord,
    ) -> Result<String, StorageError>;

    async fn delete(&self, owner_ref: &str) -> Result<(), StorageError>;

    /// `None` when the catalog holds nothing under `owner_ref`.
    async fn entry(&self, owner_ref: &str) -> Result<Option<CatalogEntry>, StorageError>;

    /// Names of the groups records may be assigned to.
    async fn list_groups(&self) -> Result<BTreeSet<String>, StorageError>;
}

fn reject_blank_name(record: &NormalizedRecord) -> Result<(), StorageError> {
    if record.name.trim().is_empty() {
        return Err(StorageError::Rejected {
            name: record.guid.clone(),
            reason: "record name is empty".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCatalogRecord {
    owner_ref: String,
    guid: String,
    written_at: chrono::DateTime<Utc>,
    payload: JsonValue,
}

/// JSON-file catalog: `records/<owner_ref>.json`, a `name -> owner_ref` index
/// and an operator-maintained `groups.json`.
#[derive(Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, owner_ref: &str) -> PathBuf {
        self.root.join("records").join(format!("{owner_ref}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn groups_path(&self) -> PathBuf {
        self.root.join("groups.json")
    }

    pub async fn register_groups<I, S>(&self, names: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.write_lock.lock().await;
        let mut groups: BTreeSet<String> =
            read_json(&self.groups_path()).await?.unwrap_or_default();
        groups.extend(names.into_iter().map(Into::into));
        write_json(&self.groups_path(), &groups).await
    }

    pub async fn read_payload(&self, owner_ref: &str) -> Result<Option<JsonValue>, StorageError> {
        let stored: Option<StoredCatalogRecord> = read_json(&self.record_path(owner_ref)).await?;
        Ok(stored.map(|s| s.payload))
    }

    async fn load_index(&self) -> Result<BTreeMap<String, String>, StorageError> {
        Ok(read_json(&self.index_path()).await?.unwrap_or_default())
    }

    async fn write_record(
        &self,
        owner_ref: &str,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError> {
        let stored = StoredCatalogRecord {
            owner_ref: owner_ref.to_string(),
            guid: record.guid.clone(),
            written_at: Utc::now(),
            payload: record.catalog_payload(),
        };
        write_json(&self.record_path(owner_ref), &stored).await?;
        debug!(owner_ref, name = %record.name, "wrote catalog record");
        Ok(())
    }
}

#[async_trait]
impl CatalogWriter for DirectoryCatalog {
    async fn create(&self, record: &NormalizedRecord) -> Result<String, StorageError> {
        reject_blank_name(record)?;
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        if index.contains_key(&record.name) {
            return Err(StorageError::Rejected {
                name: record.name.clone(),
                reason: "that name is already in use".to_string(),
            });
        }

        let owner_ref = Uuid::new_v4().to_string();
        self.write_record(&owner_ref, record).await?;
        index.insert(record.name.clone(), owner_ref.clone());
        write_json(&self.index_path(), &index).await?;
        Ok(owner_ref)
    }

    async fn update(
        &self,
        owner_ref: &str,
        record: &NormalizedRecord,
    ) -> Result<String, StorageError> {
        reject_blank_name(record)?;
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        if !index.values().any(|existing| existing == owner_ref) {
            return Err(StorageError::MissingRecord(owner_ref.to_string()));
        }
        if let Some(other) = index.get(&record.name).filter(|other| *other != owner_ref) {
            return Err(StorageError::Rejected {
                name: record.name.clone(),
                reason: format!("that name is already used by {other}"),
            });
        }

        self.write_record(owner_ref, record).await?;
        index.retain(|_, existing| existing != owner_ref);
        index.insert(record.name.clone(), owner_ref.to_string());
        write_json(&self.index_path(), &index).await?;
        Ok(owner_ref.to_string())
    }

    async fn delete(&self, owner_ref: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.load_index().await?;
        let before = index.len();
        index.retain(|_, existing| existing != owner_ref);
        if index.len() == before {
            return Err(StorageError::MissingRecord(owner_ref.to_string()));
        }

        let path = self.record_path(owner_ref);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::io(&path, err)),
        }
        write_json(&self.index_path(), &index).await
    }

    async fn entry(&self, owner_ref: &str) -> Result<Option<CatalogEntry>, StorageError> {
        let Some(payload) = self.read_payload(owner_ref).await? else {
            return Ok(None);
        };
        let field = |key: &str| payload.get(key).and_then(JsonValue::as_str).map(str::to_string);
        Ok(field("name").map(|name| CatalogEntry {
            name,
            title: field("title").unwrap_or_default(),
        }))
    }

    async fn list_groups(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(read_json(&self.groups_path()).await?.unwrap_or_default())
    }
}

/// A mutating call observed by [`MemoryCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogCall {
    Create { name: String },
    Update { owner_ref: String, name: String },
    Delete { owner_ref: String },
}

#[derive(Debug, Default)]
struct MemoryCatalogState {
    records: BTreeMap<String, NormalizedRecord>,
    calls: Vec<CatalogCall>,
    next_ref: u64,
}

/// In-process catalog that records every mutating call.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    groups: BTreeSet<String>,
    rejected_names: BTreeSet<String>,
    state: Mutex<MemoryCatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(names.into_iter().map(Into::into));
        self
    }

    /// Create and update calls for a record with this name fail.
    pub fn rejecting(mut self, name: impl Into<String>) -> Self {
        self.rejected_names.insert(name.into());
        self
    }

    pub async fn calls(&self) -> Vec<CatalogCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn record(&self, owner_ref: &str) -> Option<NormalizedRecord> {
        self.state.lock().await.records.get(owner_ref).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check(&self, record: &NormalizedRecord) -> Result<(), StorageError> {
        reject_blank_name(record)?;
        if self.rejected_names.contains(&record.name) {
            return Err(StorageError::Rejected {
                name: record.name.clone(),
                reason: "rejected by catalog validation".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogWriter for MemoryCatalog {
    async fn create(&self, record: &NormalizedRecord) -> Result<String, StorageError> {
        let mut state = self.state.lock().await;
        state.calls.push(CatalogCall::Create {
            name: record.name.clone(),
        });
        self.check(record)?;
        state.next_ref += 1;
        let owner_ref = format!("ref-{}", state.next_ref);
        state.records.insert(owner_ref.clone(), record.clone());
        Ok(owner_ref)
    }

    async fn update(
        &self,
        owner_ref: &str,
        record: &NormalizedRecord,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock().await;
        state.calls.push(CatalogCall::Update {
            owner_ref: owner_ref.to_string(),
            name: record.name.clone(),
        });
        self.check(record)?;
        let slot = state
            .records
            .get_mut(owner_ref)
            .ok_or_else(|| StorageError::MissingRecord(owner_ref.to_string()))?;
        *slot = record.clone();
        Ok(owner_ref.to_string())
    }

    async fn delete(&self, owner_ref: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.calls.push(CatalogCall::Delete {
            owner_ref: owner_ref.to_string(),
        });
        state
            .records
            .remove(owner_ref)
            .map(|_| ())
            .ok_or_else(|| StorageError::MissingRecord(owner_ref.to_string()))
    }

    async fn entry(&self, owner_ref: &str) -> Result<Option<CatalogEntry>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.records.get(owner_ref).map(|record| CatalogEntry {
            name: record.name.clone(),
            title: record.title.clone(),
        }))
    }

    async fn list_groups(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self.groups.clone())
    }
}
