//! Import stage: applies one reconciliation intent to the catalog and the
//! harvest ledger. Failures stay with the record that caused them.

use gnh_core::{HarvestRecord, RecordStatus};
use gnh_rules::MappingWarning;
use gnh_storage::{CatalogWriter, HarvestLedger, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::RecordImportError;
use crate::mapper::{map_record, CycleContext};
use crate::reconcile::{IntentAction, RecordIntent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Created { owner_ref: String },
    Updated { owner_ref: String },
    Unchanged,
    Deleted,
    Failed { error: String },
}

impl ImportOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ImportOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportResult {
    pub outcome: ImportOutcome,
    pub warnings: Vec<MappingWarning>,
}

pub async fn import_intent(
    ctx: &CycleContext<'_>,
    ledger: &dyn HarvestLedger,
    catalog: &dyn CatalogWriter,
    intent: &RecordIntent,
) -> ImportResult {
    match try_import(ctx, ledger, catalog, intent).await {
        Ok(result) => result,
        Err(err) => {
            error!(guid = %intent.guid, action = ?intent.action, error = %err, "record import failed");
            let message = err.to_string();
            let mut failed = match intent.content.as_deref() {
                Some(content) => HarvestRecord::captured(
                    ctx.source.source_id.as_str(),
                    ctx.run_id,
                    intent.guid.as_str(),
                    intent.action.status(),
                    content,
                    intent.owner_ref.clone(),
                    ctx.started_at,
                ),
                None => HarvestRecord::tombstone(
                    ctx.source.source_id.as_str(),
                    ctx.run_id,
                    intent.guid.as_str(),
                    intent.owner_ref.clone(),
                    ctx.started_at,
                ),
            };
            failed.error = Some(message.clone());
            if let Err(ledger_err) = ledger.record_failure(failed).await {
                warn!(guid = %intent.guid, error = %ledger_err, "could not store failed record");
            }
            ImportResult {
                outcome: ImportOutcome::Failed { error: message },
                warnings: Vec::new(),
            }
        }
    }
}

fn required<'a>(
    intent: &'a RecordIntent,
    value: Option<&'a str>,
    missing: &'static str,
) -> Result<&'a str, RecordImportError> {
    value.ok_or_else(|| RecordImportError::IncompleteIntent {
        guid: intent.guid.clone(),
        status: intent.action.status(),
        missing,
    })
}

async fn try_import(
    ctx: &CycleContext<'_>,
    ledger: &dyn HarvestLedger,
    catalog: &dyn CatalogWriter,
    intent: &RecordIntent,
) -> Result<ImportResult, RecordImportError> {
    let source_id = ctx.source.source_id.as_str();
    let guid = intent.guid.as_str();

    match intent.action {
        IntentAction::New => {
            let content = required(intent, intent.content.as_deref(), "content")?;
            let mapped = map_record(ctx, guid, content, None)?;
            let owner_ref = catalog
                .create(&mapped.record)
                .await
                .map_err(RecordImportError::Catalog)?;
            info!(guid, owner_ref = %owner_ref, name = %mapped.record.name, "created catalog record");
            let record = HarvestRecord::captured(
                source_id,
                ctx.run_id,
                guid,
                RecordStatus::New,
                content,
                Some(owner_ref.clone()),
                ctx.started_at,
            );
            if let Err(err) = ledger.promote(record, false).await {
                // Without a ledger entry the next cycle plans a create again.
                match catalog.delete(&owner_ref).await {
                    Ok(()) => warn!(guid, owner_ref = %owner_ref, "withdrew catalog record after ledger failure"),
                    Err(undo) => {
                        error!(guid, owner_ref = %owner_ref, error = %undo, "could not withdraw catalog record")
                    }
                }
                return Err(RecordImportError::Ledger(err));
            }
            Ok(ImportResult {
                outcome: ImportOutcome::Created { owner_ref },
                warnings: mapped.warnings,
            })
        }
        IntentAction::Change => {
            let content = required(intent, intent.content.as_deref(), "content")?;
            let owner_ref = required(intent, intent.owner_ref.as_deref(), "owner reference")?;
            let previous = ledger
                .current_record(source_id, guid)
                .await
                .map_err(RecordImportError::Ledger)?;

            if let Some(previous) = previous.filter(|p| p.has_same_content(content)) {
                debug!(guid, "content unchanged, skipping catalog update");
                let mut record = HarvestRecord::captured(
                    source_id,
                    previous.job_id,
                    guid,
                    RecordStatus::Unchanged,
                    content,
                    previous.owner_ref.clone().or_else(|| Some(owner_ref.to_string())),
                    ctx.started_at,
                );
                record.metadata_modified = previous.metadata_modified;
                ledger.promote(record, true).await.map_err(RecordImportError::Ledger)?;
                return Ok(ImportResult {
                    outcome: ImportOutcome::Unchanged,
                    warnings: Vec::new(),
                });
            }

            let existing = catalog.entry(owner_ref).await.map_err(RecordImportError::Catalog)?;
            let mapped = map_record(ctx, guid, content, existing.as_ref())?;
            let owner_ref = catalog
                .update(owner_ref, &mapped.record)
                .await
                .map_err(RecordImportError::Catalog)?;
            info!(guid, owner_ref = %owner_ref, name = %mapped.record.name, "updated catalog record");
            let record = HarvestRecord::captured(
                source_id,
                ctx.run_id,
                guid,
                RecordStatus::Change,
                content,
                Some(owner_ref.clone()),
                ctx.started_at,
            );
            ledger.promote(record, false).await.map_err(RecordImportError::Ledger)?;
            Ok(ImportResult {
                outcome: ImportOutcome::Updated { owner_ref },
                warnings: mapped.warnings,
            })
        }
        IntentAction::Delete => {
            let owner_ref = required(intent, intent.owner_ref.as_deref(), "owner reference")?;
            match catalog.delete(owner_ref).await {
                Ok(()) => info!(guid, owner_ref, "deleted catalog record"),
                Err(StorageError::MissingRecord(_)) => {
                    warn!(guid, owner_ref, "catalog record already gone")
                }
                Err(err) => return Err(RecordImportError::Catalog(err)),
            }
            let tombstone = HarvestRecord::tombstone(
                source_id,
                ctx.run_id,
                guid,
                Some(owner_ref.to_string()),
                ctx.started_at,
            );
            ledger.retire(tombstone).await.map_err(RecordImportError::Ledger)?;
            Ok(ImportResult {
                outcome: ImportOutcome::Deleted,
                warnings: Vec::new(),
            })
        }
    }
}
