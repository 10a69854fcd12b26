//! One harvest cycle for one source: gather, reconcile, import.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gnh_adapters::UpstreamSource;
use gnh_storage::{sha256_hex, CatalogWriter, HarvestLedger};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarvestSource;
use crate::error::{GatherError, HarvestError};
use crate::import::{import_intent, ImportOutcome};
use crate::mapper::CycleContext;
use crate::reconcile::{reconcile, IntentAction, ObservedRecord, PlanCounts, ReconciliationPlan};
use crate::report::write_cycle_report;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl CycleCounts {
    fn record(&mut self, outcome: &ImportOutcome) {
        match outcome {
            ImportOutcome::Created { .. } => self.created += 1,
            ImportOutcome::Updated { .. } => self.updated += 1,
            ImportOutcome::Unchanged => self.unchanged += 1,
            ImportOutcome::Deleted => self.deleted += 1,
            ImportOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Create, update and delete calls that reached the catalog.
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentReport {
    pub guid: String,
    pub action: IntentAction,
    #[serde(flatten)]
    pub outcome: ImportOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub content_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: PlanCounts,
    pub counts: CycleCounts,
    pub cancelled: bool,
    pub skipped: usize,
    pub intents: Vec<IntentReport>,
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

impl CycleSummary {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.intents.iter().filter_map(|i| match &i.outcome {
            ImportOutcome::Failed { error } => Some((i.guid.as_str(), error.as_str())),
            _ => None,
        })
    }
}

pub struct HarvestPipeline {
    ledger: Arc<dyn HarvestLedger>,
    catalog: Arc<dyn CatalogWriter>,
    reports_dir: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl HarvestPipeline {
    pub fn new(ledger: Arc<dyn HarvestLedger>, catalog: Arc<dyn CatalogWriter>) -> Self {
        Self {
            ledger,
            catalog,
            reports_dir: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Setting the flag stops the running cycle before its next record.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Lists every configured kind. Any listing failure fails the whole gather.
    pub async fn gather(
        &self,
        source: &HarvestSource,
        upstream: &dyn UpstreamSource,
    ) -> Result<Vec<ObservedRecord>, GatherError> {
        let mut observed = Vec::new();
        for &kind in &source.kinds {
            let records = upstream
                .fetch_all(kind)
                .await
                .map_err(|source| GatherError::Upstream { kind, source })?;
            info!(kind = %kind, count = records.len(), "listed upstream resources");
            observed.extend(
                records
                    .into_iter()
                    .map(|record| ObservedRecord::new(record.guid.clone(), record.content())),
            );
        }
        Ok(observed)
    }

    pub async fn plan(
        &self,
        source: &HarvestSource,
        upstream: &dyn UpstreamSource,
    ) -> Result<ReconciliationPlan, HarvestError> {
        let gather_error = |source: GatherError, source_id: &str| HarvestError::Gather {
            source_id: source_id.to_string(),
            source,
        };
        let observed = self
            .gather(source, upstream)
            .await
            .map_err(|err| gather_error(err, &source.source_id))?;
        let previous = self
            .ledger
            .current_owner_refs(&source.source_id)
            .await
            .map_err(|err| HarvestError::Ledger {
                source_id: source.source_id.clone(),
                source: err,
            })?;
        reconcile(&previous, observed).map_err(|err| gather_error(err, &source.source_id))
    }

    pub async fn run_cycle(
        &self,
        run_id: Uuid,
        source: &HarvestSource,
        upstream: &dyn UpstreamSource,
    ) -> Result<CycleSummary, HarvestError> {
        let span = info_span!("harvest_cycle", %run_id, source_id = %source.source_id);
        self.run_cycle_inner(run_id, source, upstream).instrument(span).await
    }

    async fn run_cycle_inner(
        &self,
        run_id: Uuid,
        source: &HarvestSource,
        upstream: &dyn UpstreamSource,
    ) -> Result<CycleSummary, HarvestError> {
        let plan = self.plan(source, upstream).await?;
        let groups = self.catalog.list_groups().await.map_err(HarvestError::Groups)?;
        let mut ctx = CycleContext::new(source, groups);
        ctx.run_id = run_id;

        let plan_counts = plan.counts();
        info!(
            new = plan_counts.new,
            change = plan_counts.change,
            delete = plan_counts.delete,
            "reconciled"
        );

        let mut counts = CycleCounts::default();
        let mut intents = Vec::with_capacity(plan.len());
        let mut cancelled = false;
        let mut skipped = 0;
        for (index, intent) in plan.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                skipped = plan.len() - index;
                warn!(skipped, "harvest cycle cancelled");
                break;
            }
            let result =
                import_intent(&ctx, self.ledger.as_ref(), self.catalog.as_ref(), intent).await;
            counts.record(&result.outcome);
            intents.push(IntentReport {
                guid: intent.guid.clone(),
                action: intent.action,
                outcome: result.outcome,
                warnings: result.warnings.iter().map(ToString::to_string).collect(),
                content_sha256: intent.content.as_deref().map(|c| sha256_hex(c.as_bytes())),
            });
        }

        let mut summary = CycleSummary {
            run_id,
            source_id: source.source_id.clone(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            plan: plan_counts,
            counts,
            cancelled,
            skipped,
            intents,
            report_dir: None,
        };
        info!(
            created = counts.created,
            updated = counts.updated,
            unchanged = counts.unchanged,
            deleted = counts.deleted,
            failed = counts.failed,
            "harvest cycle finished"
        );

        if let Some(root) = &self.reports_dir {
            let dir = write_cycle_report(root, &summary)
                .await
                .map_err(HarvestError::Report)?;
            summary.report_dir = Some(dir);
        }
        Ok(summary)
    }
}
