//! Per-date import: fetch -> resolve -> validate -> (dry-run skip | mutate).
//!
//! A fault while fetching aborts only the current date; it is reported as a
//! failed [`DateResult`] and the batch moves on. Once events are in hand,
//! every failure is per event and merely counted.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::btc::SourceFeed;
use crate::destination::{record_id, Condition};
use crate::fallback::{DestinationAccess, FallbackError, Need};
use crate::model::{
    Collection, DateResult, DateStatus, ResolutionLog, ResolvedEntity, SourceEvent,
    IMPORTED_ON_FIELD, IMPORT_SOURCE, IMPORT_SOURCE_FIELD,
};
use crate::resolver::{EntityResolver, EXTERNAL_ID_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Resolving,
    Validating,
    DryRunSkip,
    Mutating,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetching => "fetching",
            Phase::Resolving => "resolving",
            Phase::Validating => "validating",
            Phase::DryRunSkip => "dry_run_skip",
            Phase::Mutating => "mutating",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub dry_run: bool,
    pub update_existing: bool,
    /// Pause after each destination-mutating call.
    pub throttle: Duration,
    pub id_field: String,
}

/// Everything one date produced.
#[derive(Debug, Clone)]
pub struct DateOutcome {
    pub result: DateResult,
    pub logs: Vec<ResolutionLog>,
    pub final_phase: Phase,
}

/// Inclusive UTC bounds of a calendar day.
pub fn day_window(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::default()));
    let end = start + ChronoDuration::days(1) - ChronoDuration::milliseconds(1);
    (start, end)
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Names of required fields missing from an assembled event.
pub fn missing_fields(
    event: &SourceEvent,
    organizer: Option<&ResolvedEntity>,
    venue: Option<&ResolvedEntity>,
) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if event.title.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        missing.push("title");
    }
    if event.start.is_none() {
        missing.push("startDate");
    }
    if organizer.is_none() {
        missing.push("organizer");
    }
    if venue.is_none() {
        missing.push("location");
    }
    missing
}

/// Destination document for a validated source event.
pub fn build_destination_event(
    event: &SourceEvent,
    organizer: &ResolvedEntity,
    venue: &ResolvedEntity,
    app_id: &str,
    date: NaiveDate,
) -> Value {
    let start = event.start.map(iso);
    let end = event.end.or(event.start).map(iso);
    json!({
        "title": event.title.as_deref().map(str::trim),
        "startDate": start,
        "endDate": end,
        "description": event.description,
        "organizerId": organizer.id,
        "venueId": venue.id,
        EXTERNAL_ID_FIELD: event.id,
        "appId": app_id,
        IMPORT_SOURCE_FIELD: IMPORT_SOURCE,
        IMPORTED_ON_FIELD: date.to_string(),
    })
}

pub struct ImportRunner {
    source: Arc<dyn SourceFeed>,
    access: DestinationAccess,
    resolver: EntityResolver,
    options: RunnerOptions,
}

impl ImportRunner {
    pub fn new(
        source: Arc<dyn SourceFeed>,
        access: DestinationAccess,
        resolver: EntityResolver,
        options: RunnerOptions,
    ) -> Self {
        Self {
            source,
            access,
            resolver,
            options,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    #[instrument(skip_all, fields(date = %date, dry_run = self.options.dry_run))]
    pub async fn run_date(&self, date: NaiveDate) -> DateOutcome {
        let started = Instant::now();
        let mut result = DateResult {
            date,
            status: DateStatus::Done,
            error: None,
            btc_events: Default::default(),
            tt_events: Default::default(),
            entity_resolution: Default::default(),
            validation: Default::default(),
            duration_ms: 0,
        };
        let mut logs = Vec::new();

        let (from, to) = day_window(date);
        let final_phase = match self.source.fetch_events(from, to).await {
            Ok(items) => {
                let mut events = Vec::with_capacity(items.len());
                for raw in &items {
                    match SourceEvent::from_feed(raw) {
                        Ok(event) if event.overlaps(from, to) => events.push(event),
                        Ok(_) => {}
                        Err(err) => {
                            // Unreadable items have no usable organizer either.
                            result.btc_events.total += 1;
                            result.entity_resolution.failure += 1;
                            result.validation.invalid += 1;
                            warn!(item = %raw.get("id").unwrap_or(&serde_json::Value::Null), error = %err, "malformed source event");
                        }
                    }
                }
                result.btc_events.total += events.len() as u64;
                for event in &events {
                    self.process_event(date, event, &mut result, &mut logs).await;
                }
                Phase::Done
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "source feed unavailable; date failed");
                result.status = DateStatus::Failed;
                result.error = Some(format!("{}: {err:#}", Phase::Fetching.as_str()));
                Phase::Error
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            total = result.btc_events.total,
            resolved = result.entity_resolution.success,
            valid = result.validation.valid,
            created = result.tt_events.created,
            updated = result.tt_events.updated,
            failed = result.tt_events.failed,
            simulated = result.tt_events.simulated,
            simulated_updates = result.tt_events.simulated_updates,
            "date finished"
        );
        DateOutcome {
            result,
            logs,
            final_phase,
        }
    }

    async fn process_event(
        &self,
        date: NaiveDate,
        event: &SourceEvent,
        result: &mut DateResult,
        logs: &mut Vec<ResolutionLog>,
    ) {
        let mut phase = Phase::Resolving;
        debug!(event_id = %event.id, phase = phase.as_str());
        let organizer_log = self
            .resolver
            .resolve(Collection::Organizers, &event.organizer, Some(&event.id))
            .await;
        if organizer_log.success {
            result.entity_resolution.success += 1;
        } else {
            result.entity_resolution.failure += 1;
        }
        let venue_log = self
            .resolver
            .resolve(Collection::Venues, &event.location, Some(&event.id))
            .await;
        let organizer = organizer_log.result.clone();
        let venue = venue_log.result.clone();
        logs.push(organizer_log);
        logs.push(venue_log);

        phase = Phase::Validating;
        debug!(event_id = %event.id, phase = phase.as_str());
        let missing = missing_fields(event, organizer.as_ref(), venue.as_ref());
        let (Some(organizer), Some(venue), true) = (organizer, venue, missing.is_empty()) else {
            result.validation.invalid += 1;
            warn!(event_id = %event.id, ?missing, "event failed validation");
            return;
        };
        result.validation.valid += 1;
        result.btc_events.processed += 1;

        let record = build_destination_event(event, &organizer, &venue, self.access.app_id(), date);

        let existing = match self.find_existing(event).await {
            Ok(existing) => existing,
            Err(err) => {
                result.tt_events.failed += 1;
                warn!(event_id = %event.id, error = %err, "existence check failed");
                return;
            }
        };

        if existing.is_some() && !self.options.update_existing {
            result.tt_events.skipped += 1;
            debug!(event_id = %event.id, "already imported; skipping");
            return;
        }

        if self.options.dry_run {
            phase = Phase::DryRunSkip;
            if existing.is_some() {
                result.tt_events.simulated_updates += 1;
            } else {
                result.tt_events.simulated += 1;
            }
            debug!(event_id = %event.id, phase = phase.as_str(), update = existing.is_some());
            return;
        }

        phase = Phase::Mutating;
        debug!(event_id = %event.id, phase = phase.as_str());
        let outcome = match &existing {
            Some(id) => self
                .access
                .update(Collection::Events, id, &record)
                .await
                .map(|_| true),
            None => self
                .access
                .create(Collection::Events, &record)
                .await
                .map(|_| false),
        };
        match outcome {
            Ok(true) => result.tt_events.updated += 1,
            Ok(false) => result.tt_events.created += 1,
            Err(err) => {
                result.tt_events.failed += 1;
                warn!(event_id = %event.id, error = %format!("{err:#}"), "destination mutation failed");
            }
        }
        if !self.options.throttle.is_zero() {
            tokio::time::sleep(self.options.throttle).await;
        }
    }

    /// Destination id of an event this tenant previously imported from
    /// `event`. The first backend that answers decides, even with nothing.
    async fn find_existing(&self, event: &SourceEvent) -> Result<Option<String>, FallbackError> {
        let filter = self
            .access
            .filter()
            .tenant_only()
            .with(Condition::eq(EXTERNAL_ID_FIELD, event.id.clone()));
        let outcome = self
            .access
            .list(Collection::Events, &filter, Need::AnyResult)
            .await?;
        Ok(outcome
            .value
            .first()
            .and_then(|r| record_id(r, &self.options.id_field)))
    }
}
