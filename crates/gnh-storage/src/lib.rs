//! Harvest ledger, catalog writers and the file helpers they share.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod catalog;
pub mod ledger;

pub use catalog::{CatalogCall, CatalogEntry, CatalogWriter, DirectoryCatalog, MemoryCatalog};
pub use ledger::{HarvestLedger, JsonLedger, MemoryLedger, DEFAULT_HISTORY_LIMIT};

pub const CRATE_NAME: &str = "gnh-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog record {0} not found")]
    MissingRecord(String),
    #[error("catalog rejected record {name}: {reason}")]
    Rejected { name: String, reason: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replaces `path` with `bytes` via a temp file in the same directory and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|err| StorageError::io(&parent, err))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    file.flush()
        .await
        .map_err(|err| StorageError::io(&temp_path, err))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

pub(crate) async fn write_json<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| StorageError::json(path, err))?;
    write_atomic(path, &bytes).await
}

/// Reads and decodes `path`; a missing file is `Ok(None)`.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StorageError::json(path, err)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"{\"v\":1}").await.expect("first write");
        write_atomic(&path, b"{\"v\":2}").await.expect("second write");

        let text = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(text, "{\"v\":2}");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_json_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let missing: Option<Vec<String>> = read_json(&dir.path().join("none.json")).await.unwrap();
        assert!(missing.is_none());

        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let bad: Result<Option<Vec<String>>, _> = read_json(&dir.path().join("bad.json")).await;
        assert!(matches!(bad, Err(StorageError::Json { .. })));
    }
}
