use gnh_adapters::AdapterError;
use gnh_core::{CoreError, RecordStatus, ResourceKind};
use gnh_storage::StorageError;
use thiserror::Error;

/// Cycle-level failure while building the observed record set.
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("listing {kind} resources failed: {source}")]
    Upstream {
        kind: ResourceKind,
        #[source]
        source: AdapterError,
    },
    #[error("no records received from upstream and none previously harvested")]
    NoRecords,
}

/// Failure of a single record during import. Sibling records are unaffected.
#[derive(Debug, Error)]
pub enum RecordImportError {
    #[error("record content is unusable: {0}")]
    Content(#[from] CoreError),
    #[error("could not generate a name from the title or the resource name")]
    NoName,
    #[error("{status} intent for {guid} has no {missing}")]
    IncompleteIntent {
        guid: String,
        status: RecordStatus,
        missing: &'static str,
    },
    #[error("catalog call failed: {0}")]
    Catalog(#[source] StorageError),
    #[error("harvest ledger write failed: {0}")]
    Ledger(#[source] StorageError),
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("gathering source {source_id}: {source}")]
    Gather {
        source_id: String,
        #[source]
        source: GatherError,
    },
    #[error("reading harvest ledger for {source_id}: {source}")]
    Ledger {
        source_id: String,
        #[source]
        source: StorageError,
    },
    #[error("listing catalog groups: {0}")]
    Groups(#[source] StorageError),
    #[error("writing cycle report: {0}")]
    Report(#[source] anyhow::Error),
}
