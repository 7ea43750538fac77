use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::model::{DateRangeSpec, DateStatus, ImportRun};

/// `<prefix>-<start>[_<end>]`, the stem shared by run artifacts.
pub fn dates_stem(prefix: &str, range: &DateRangeSpec) -> String {
    if range.start == range.end {
        format!("{prefix}-{}", range.start)
    } else {
        format!("{prefix}-{}_{}", range.start, range.end)
    }
}

pub fn report_file_name(range: &DateRangeSpec, dry_run: bool) -> String {
    let stem = dates_stem("import-report", range);
    if dry_run {
        format!("{stem}-dry-run.json")
    } else {
        format!("{stem}.json")
    }
}

pub fn assessment_file_name(range: &DateRangeSpec) -> String {
    format!("{}.json", dates_stem("assessment", range))
}

/// Pretty-print `value` to `dir/name`, flushing it to disk before returning.
pub async fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(name);
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize report")?;
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    Ok(path)
}

pub fn render_summary(run: &ImportRun) -> String {
    let mut output = String::new();
    let mode = if run.dry_run { "DRY RUN" } else { "LIVE" };
    let t = &run.totals;

    let _ = writeln!(output, "# BTC Import Summary ({mode})");
    let _ = writeln!(
        output,
        "Dates {} to {} ({} processed{})",
        run.date_range.start,
        run.date_range.end,
        run.dates.len(),
        if run.cancelled { ", cancelled" } else { "" }
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Totals");
    let _ = writeln!(
        output,
        "- BTC events: {} found, {} processed",
        t.btc_events.total, t.btc_events.processed
    );
    let _ = writeln!(
        output,
        "- Entity resolution: {} resolved, {} unresolved",
        run.entity_resolution.success, run.entity_resolution.failure
    );
    let _ = writeln!(
        output,
        "- Validation: {} valid, {} invalid",
        run.validation.valid, run.validation.invalid
    );
    if run.dry_run {
        let _ = writeln!(
            output,
            "- TT events: {} would be created, {} would be updated, {} skipped, {} failed",
            t.tt_events.simulated,
            t.tt_events.simulated_updates,
            t.tt_events.skipped,
            t.tt_events.failed
        );
    } else {
        let _ = writeln!(
            output,
            "- TT events: {} created, {} updated, {} skipped, {} failed",
            t.tt_events.created, t.tt_events.updated, t.tt_events.skipped, t.tt_events.failed
        );
    }

    let failed: Vec<_> = run
        .dates
        .iter()
        .filter(|d| d.status == DateStatus::Failed)
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Failed Dates");
        for d in failed {
            let _ = writeln!(
                output,
                "- {}: {}",
                d.date,
                d.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if let Some(a) = &run.assessment {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Assessment: {}", a.verdict());
        let _ = writeln!(
            output,
            "- Resolution rate {:.1}% (min {:.1}%)",
            a.metrics.entity_resolution_rate * 100.0,
            a.thresholds.minimum_resolution_rate * 100.0
        );
        let _ = writeln!(
            output,
            "- Validation rate {:.1}% (min {:.1}%)",
            a.metrics.validation_rate * 100.0,
            a.thresholds.minimum_validation_rate * 100.0
        );
        let _ = writeln!(
            output,
            "- Overall success rate {:.1}% (min {:.1}%)",
            a.metrics.overall_success_rate * 100.0,
            a.thresholds.minimum_overall_rate * 100.0
        );
        for rec in &a.recommendations {
            let _ = writeln!(output, "- Recommendation: {rec}");
        }
    }

    output
}
