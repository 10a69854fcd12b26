//! Harvest orchestration: source configuration, reconciliation, record
//! mapping, import and scheduling.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gnh_adapters::{upstream_for_source, HttpSettings, PageFetcher, RetryPolicy};
use gnh_storage::{CatalogWriter, DirectoryCatalog, HarvestLedger, JsonLedger, DEFAULT_HISTORY_LIMIT};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod dcat;
pub mod error;
pub mod import;
pub mod mapper;
pub mod pipeline;
pub mod reconcile;
pub mod report;

pub use config::{HarvestSource, SourceConfigError, SourceEntry, SourceRegistry};
pub use error::{GatherError, HarvestError, RecordImportError};
pub use import::{import_intent, ImportOutcome, ImportResult};
pub use mapper::{map_record, CycleContext, MappedRecord};
pub use pipeline::{CycleCounts, CycleSummary, HarvestPipeline, IntentReport};
pub use reconcile::{reconcile, IntentAction, ObservedRecord, ReconciliationPlan, RecordIntent};
pub use report::{recent_reports_markdown, write_cycle_report};

pub const CRATE_NAME: &str = "gnh-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub ledger_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_attempts: u32,
    pub http_min_interval_ms: u64,
    pub ledger_history: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("GNH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            ledger_dir: std::env::var("GNH_LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/ledger")),
            catalog_dir: std::env::var("GNH_CATALOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/catalog")),
            reports_dir: std::env::var("GNH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("GNH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("GNH_SYNC_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            user_agent: std::env::var("GNH_USER_AGENT")
                .unwrap_or_else(|_| "gnh-harvester/0.1".to_string()),
            http_timeout_secs: std::env::var("GNH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_attempts: std::env::var("GNH_HTTP_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(RetryPolicy::default().attempts),
            http_min_interval_ms: std::env::var("GNH_HTTP_MIN_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            ledger_history: std::env::var("GNH_LEDGER_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_LIMIT),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

/// Per-source result of [`HarvestRunner::run_sources`].
#[derive(Debug)]
pub struct SourceRun {
    pub source_id: String,
    pub result: Result<CycleSummary, HarvestError>,
}

/// Wires configuration, storage and upstreams together for the CLI and the
/// scheduler.
pub struct HarvestRunner {
    config: SyncConfig,
    fetcher: Arc<PageFetcher>,
    pipeline: HarvestPipeline,
}

impl HarvestRunner {
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let ledger: Arc<dyn HarvestLedger> = Arc::new(
            JsonLedger::new(&config.ledger_dir).with_history_limit(config.ledger_history),
        );
        let catalog: Arc<dyn CatalogWriter> = Arc::new(DirectoryCatalog::new(&config.catalog_dir));
        Self::with_storage(config, ledger, catalog)
    }

    pub fn with_storage(
        config: SyncConfig,
        ledger: Arc<dyn HarvestLedger>,
        catalog: Arc<dyn CatalogWriter>,
    ) -> Result<Self> {
        let fetcher = Arc::new(
            PageFetcher::new(HttpSettings {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: config.user_agent.clone(),
                retry: RetryPolicy {
                    attempts: config.http_attempts,
                    ..RetryPolicy::default()
                },
                min_interval: Duration::from_millis(config.http_min_interval_ms),
            })
            .context("building http client")?,
        );
        let pipeline = HarvestPipeline::new(ledger, catalog).with_reports_dir(&config.reports_dir);
        Ok(Self {
            config,
            fetcher,
            pipeline,
        })
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.pipeline.cancel_handle()
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path()).await
    }

    pub async fn validate_sources(&self) -> Result<Vec<Result<HarvestSource, SourceConfigError>>> {
        let registry = self.load_registry().await?;
        Ok(registry.validate_all(&self.config.workspace_root))
    }

    async fn resolve(&self, source_id: &str) -> Result<HarvestSource> {
        let registry = self.load_registry().await?;
        let entry = registry
            .find(source_id)
            .with_context(|| format!("source {source_id} is not in {}", self.config.sources_path().display()))?;
        entry
            .validate(&self.config.workspace_root)
            .with_context(|| format!("validating source {source_id}"))
    }

    fn upstream_for(
        &self,
        source: &HarvestSource,
        run_id: Uuid,
    ) -> Result<Box<dyn gnh_adapters::UpstreamSource>> {
        upstream_for_source(
            &source.source_id,
            source.mode,
            &source.url,
            source.fixture_dir.as_deref(),
            Arc::clone(&self.fetcher),
            run_id,
        )
        .with_context(|| format!("building upstream for {}", source.source_id))
    }

    /// Gathers and reconciles one source without importing anything.
    pub async fn plan_source(&self, source_id: &str) -> Result<ReconciliationPlan> {
        let source = self.resolve(source_id).await?;
        let upstream = self.upstream_for(&source, Uuid::new_v4())?;
        Ok(self.pipeline.plan(&source, upstream.as_ref()).await?)
    }

    /// Runs one cycle for every enabled source, or only `only`. A failing
    /// source does not stop the others. Invalid sources are skipped.
    pub async fn run_sources(&self, only: Option<&str>) -> Result<Vec<SourceRun>> {
        let registry = self.load_registry().await?;
        if let Some(id) = only {
            if registry.find(id).is_none() {
                anyhow::bail!("source {id} is not in {}", self.config.sources_path().display());
            }
        }

        let mut runs = Vec::new();
        for validated in registry.validate_all(&self.config.workspace_root) {
            let source = match validated {
                Ok(source) => source,
                Err(err) => {
                    if only.map_or(true, |id| id == err.source_id()) {
                        error!(source_id = err.source_id(), error = %err, "source configuration rejected");
                    }
                    continue;
                }
            };
            if only.is_some_and(|id| id != source.source_id) {
                continue;
            }

            let run_id = Uuid::new_v4();
            let upstream = self.upstream_for(&source, run_id)?;
            let result = self.pipeline.run_cycle(run_id, &source, upstream.as_ref()).await;
            match &result {
                Ok(summary) => info!(
                    source_id = %source.source_id,
                    failed = summary.counts.failed,
                    "source harvested"
                ),
                Err(err) => error!(source_id = %source.source_id, error = %err, "harvest cycle failed"),
            }
            runs.push(SourceRun {
                source_id: source.source_id.clone(),
                result,
            });
        }
        Ok(runs)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let runner = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                match runner.run_sources(None).await {
                    Ok(runs) => info!(sources = runs.len(), "scheduled harvest finished"),
                    Err(err) => warn!(error = %err, "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub fn reports_overview(config: &SyncConfig, runs: usize) -> Result<String> {
    recent_reports_markdown(&config.reports_dir, runs)
}
