use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::CycleSummary;

/// Writes `<root>/<run_id>/cycle.json` and `brief.md`, returning the run directory.
pub async fn write_cycle_report(root: &Path, summary: &CycleSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let mut with_dir = summary.clone();
    with_dir.report_dir = Some(dir.clone());
    let json = serde_json::to_vec_pretty(&with_dir).context("serializing cycle summary")?;
    fs::write(dir.join("cycle.json"), json)
        .await
        .context("writing cycle.json")?;

    fs::write(dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;

    Ok(dir)
}

pub fn render_brief(summary: &CycleSummary) -> String {
    let c = &summary.counts;
    let mut lines = vec![
        format!("# Harvest brief: {}", summary.source_id),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Plan: {} new, {} change, {} delete",
            summary.plan.new, summary.plan.change, summary.plan.delete
        ),
        format!(
            "- Outcome: {} created, {} updated, {} unchanged, {} deleted, {} failed",
            c.created, c.updated, c.unchanged, c.deleted, c.failed
        ),
    ];
    if summary.cancelled {
        lines.push(format!("- Cancelled with {} intents left", summary.skipped));
    }

    let failures: Vec<_> = summary.failures().collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.extend(failures.iter().map(|(guid, error)| format!("- `{guid}`: {error}")));
    }

    let warned: Vec<_> = summary.intents.iter().filter(|i| !i.warnings.is_empty()).collect();
    if !warned.is_empty() {
        lines.push(String::new());
        lines.push("## Mapping warnings".to_string());
        for intent in warned {
            for warning in &intent.warnings {
                lines.push(format!("- `{}`: {warning}", intent.guid));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Markdown overview of the most recent `runs` cycle reports under `root`.
pub fn recent_reports_markdown(root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("cycle.json").is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent harvest cycles".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join("cycle.json");
        let summary: CycleSummary = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        let c = summary.counts;
        lines.push(format!("## `{}` ({})", summary.run_id, summary.source_id));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- created {} / updated {} / unchanged {} / deleted {} / failed {}",
            c.created, c.updated, c.unchanged, c.deleted, c.failed
        ));
        lines.push(format!("- report: `{}`", path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
