use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gnh_sync::{HarvestRunner, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gnh")]
#[command(about = "GeoNode catalog harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest cycle for every enabled source.
    Harvest {
        #[arg(long)]
        source: Option<String>,
    },
    /// Gather and reconcile a source without importing.
    Plan {
        #[arg(long)]
        source: String,
    },
    /// Validate sources.yaml.
    Validate,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Summarize the latest cycle reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gnh_sync=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Harvest { source: None }) {
        Commands::Harvest { source } => {
            let runner = HarvestRunner::from_config(config)?;
            let cancel = runner.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current record");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let runs = runner.run_sources(source.as_deref()).await?;
            let mut failed_sources = 0;
            for run in &runs {
                match &run.result {
                    Ok(summary) => {
                        let c = summary.counts;
                        println!(
                            "{}: run_id={} created={} updated={} unchanged={} deleted={} failed={}{}",
                            run.source_id,
                            summary.run_id,
                            c.created,
                            c.updated,
                            c.unchanged,
                            c.deleted,
                            c.failed,
                            if summary.cancelled { " (cancelled)" } else { "" }
                        );
                        for (guid, error) in summary.failures() {
                            println!("  failed {guid}: {error}");
                        }
                    }
                    Err(err) => {
                        failed_sources += 1;
                        println!("{}: harvest failed: {err:#}", run.source_id);
                    }
                }
            }
            if failed_sources > 0 {
                anyhow::bail!("{failed_sources} source(s) failed to harvest");
            }
        }
        Commands::Plan { source } => {
            let runner = HarvestRunner::from_config(config)?;
            let plan = runner.plan_source(&source).await?;
            let counts = plan.counts();
            println!(
                "{source}: new={} change={} delete={}",
                counts.new, counts.change, counts.delete
            );
            for intent in plan.iter() {
                println!(
                    "  {:<6} {} {}",
                    intent.action.status().as_str(),
                    intent.guid,
                    intent.owner_ref.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Validate => {
            let runner = HarvestRunner::from_config(config)?;
            let mut invalid = 0;
            for result in runner.validate_sources().await? {
                match result {
                    Ok(source) => println!(
                        "ok      {} ({} rules, kinds: {})",
                        source.source_id,
                        source.rules.len(),
                        source
                            .kinds
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                    Err(err) => {
                        invalid += 1;
                        println!("invalid {err}");
                    }
                }
            }
            if invalid > 0 {
                anyhow::bail!("{invalid} source(s) have invalid configuration");
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let runner = Arc::new(HarvestRunner::from_config(config)?);
            let Some(mut sched) = runner.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            runner.cancel_handle().store(true, Ordering::SeqCst);
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", gnh_sync::reports_overview(&config, runs)?);
        }
    }

    Ok(())
}
