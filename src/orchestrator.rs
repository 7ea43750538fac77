//! Date-range batch driver: one [`ImportRunner::run_date`] per day, in
//! ascending order, folded into a single [`ImportRun`] report.
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::assessment::assess_run;
use crate::config::{parse_date, ConfigError, Thresholds};
use crate::model::{DateRangeSpec, ImportRun};
use crate::report::{assessment_file_name, report_file_name, write_json};
use crate::runner::ImportRunner;

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if end < start {
            return Err(ConfigError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Every date in the range, ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = self.start;
        while current <= self.end {
            days.push(current);
            current += Duration::days(1);
        }
        days
    }

    pub fn spec(&self) -> DateRangeSpec {
        DateRangeSpec {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub run: ImportRun,
    pub report_file: PathBuf,
}

pub struct BatchOrchestrator {
    runner: ImportRunner,
    thresholds: Thresholds,
    results_dir: PathBuf,
    stop: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    pub fn new(runner: ImportRunner, thresholds: Thresholds, results_dir: PathBuf) -> Self {
        Self {
            runner,
            thresholds,
            results_dir,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between dates; setting it ends the batch after the
    /// date in progress.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    #[instrument(skip_all, fields(start = %range.start(), end = %range.end()))]
    pub async fn run(&self, range: DateRange) -> Result<BatchOutcome> {
        let started = Instant::now();
        let dry_run = self.runner.dry_run();
        let mut run = ImportRun::new(range.spec(), dry_run);
        let days = range.days();
        info!(run_id = %run.run_id, days = days.len(), dry_run, "batch started");

        for date in days {
            if self.stop.load(Ordering::SeqCst) {
                warn!(%date, "stop requested; remaining dates skipped");
                run.cancelled = true;
                break;
            }
            let outcome = self.runner.run_date(date).await;
            run.absorb(outcome.result, outcome.logs);
        }

        run.assessment = Some(assess_run(&run, &self.thresholds));
        run.finished_at = Some(Utc::now());
        run.duration_ms = started.elapsed().as_millis() as u64;

        if !dry_run {
            let name = assessment_file_name(&run.date_range);
            let path = write_json(&self.results_dir, &name, &run.assessment)
                .await
                .context("failed to write assessment")?;
            run.assessment_file = Some(path.display().to_string());
        }

        let report_file = write_json(
            &self.results_dir,
            &report_file_name(&run.date_range, dry_run),
            &run,
        )
        .await
        .context("failed to write import report")?;

        info!(
            run_id = %run.run_id,
            failed_dates = run.totals.failed_dates,
            cancelled = run.cancelled,
            report = %report_file.display(),
            "batch finished"
        );
        Ok(BatchOutcome { run, report_file })
    }
}
