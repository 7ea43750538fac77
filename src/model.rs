use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::assessment::Assessment;

/// Marker fields stamped on every record the import creates; cleanup
/// selects on them.
pub const IMPORT_SOURCE_FIELD: &str = "importSource";
pub const IMPORT_SOURCE: &str = "btc";
pub const IMPORTED_ON_FIELD: &str = "importedOn";

/// Logical destination collections touched by the import and cleanup paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Events,
    Organizers,
    Users,
    Venues,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Events => "events",
            Collection::Organizers => "organizers",
            Collection::Users => "users",
            Collection::Venues => "venues",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "events" => Some(Collection::Events),
            "organizers" => Some(Collection::Organizers),
            "users" => Some(Collection::Users),
            "venues" => Some(Collection::Venues),
            _ => None,
        }
    }
}

/// Loose reference to an organizer or location as the source names it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl SourceRef {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.email.is_none()
    }
}

/// One event as returned by the BTC feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceEvent {
    #[serde(deserialize_with = "source_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(
        default,
        alias = "startDate",
        alias = "start_date",
        deserialize_with = "source_time"
    )]
    pub start: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "endDate",
        alias = "end_date",
        deserialize_with = "source_time"
    )]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub organizer: SourceRef,
    #[serde(default, alias = "venue")]
    pub location: SourceRef,
}

/// Feed ids arrive as strings or numbers.
fn source_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unusable event id {other}"))),
    }
}

fn source_time<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    parse_source_time(&raw)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp '{raw}'")))
}

/// RFC 3339, or a local-looking timestamp without offset taken as UTC.
pub fn parse_source_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    .map(|naive| Utc.from_utc_datetime(&naive))
}

impl SourceEvent {
    /// Convert one raw feed item. Errors stay with the item.
    pub fn from_feed(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }

    /// True when the event's window touches `[from, to]` (both inclusive).
    /// An event without an end is treated as instantaneous.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let Some(start) = self.start else {
            // Undated events cannot be placed; let validation reject them.
            return true;
        };
        let end = self.end.unwrap_or(start).max(start);
        start <= to && end >= from
    }
}

/// One try of one resolution strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionAttempt {
    pub method: String,
    pub query: Option<String>,
    pub success: bool,
    /// -1 when the strategy never ran a lookup.
    pub result_count: i64,
    /// Backend that answered the lookup.
    pub via: Option<String>,
    /// HTTP status of the last failed backend call.
    pub status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntity {
    pub id: String,
    pub name: Option<String>,
    pub strategy: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingInput,
    NoMatch,
    Ambiguous,
    Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub message: String,
}

/// Audit trail for resolving one source reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionLog {
    pub collection: Collection,
    pub source: SourceRef,
    pub source_event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempts: Vec<ResolutionAttempt>,
    pub success: bool,
    pub result: Option<ResolvedEntity>,
    pub error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BtcCounts {
    pub total: u64,
    /// Events that passed validation and reached the mutating step.
    pub processed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TtCounts {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    /// Existing events left alone because updates were not requested.
    pub skipped: u64,
    /// Creations a dry run would have performed.
    pub simulated: u64,
    /// Updates a dry run would have performed.
    pub simulated_updates: u64,
}

impl TtCounts {
    pub fn absorb(&mut self, other: &TtCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.simulated += other.simulated;
        self.simulated_updates += other.simulated_updates;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCounts {
    pub valid: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Done,
    Failed,
}

/// Outcome for one calendar date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateResult {
    pub date: NaiveDate,
    pub status: DateStatus,
    pub error: Option<String>,
    pub btc_events: BtcCounts,
    pub tt_events: TtCounts,
    pub entity_resolution: ResolutionCounts,
    pub validation: ValidationCounts,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DateRangeSpec {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Run-level totals summed over every date.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub btc_events: BtcCounts,
    pub tt_events: TtCounts,
    pub failed_dates: u64,
}

/// One batch import over a date range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub run_id: uuid::Uuid,
    pub date_range: DateRangeSpec,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub dates: Vec<DateResult>,
    pub totals: RunTotals,
    pub entity_resolution: ResolutionCounts,
    pub validation: ValidationCounts,
    pub assessment: Option<Assessment>,
    pub assessment_file: Option<String>,
    pub resolution_logs: Vec<ResolutionLog>,
    pub duration_ms: u64,
}

impl ImportRun {
    pub fn new(date_range: DateRangeSpec, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            date_range,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            dates: Vec::new(),
            totals: RunTotals::default(),
            entity_resolution: ResolutionCounts::default(),
            validation: ValidationCounts::default(),
            assessment: None,
            assessment_file: None,
            resolution_logs: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Fold one date's outcome into the run totals.
    pub fn absorb(&mut self, date: DateResult, logs: Vec<ResolutionLog>) {
        self.totals.btc_events.total += date.btc_events.total;
        self.totals.btc_events.processed += date.btc_events.processed;
        self.totals.tt_events.absorb(&date.tt_events);
        if date.status == DateStatus::Failed {
            self.totals.failed_dates += 1;
        }
        self.entity_resolution.success += date.entity_resolution.success;
        self.entity_resolution.failure += date.entity_resolution.failure;
        self.validation.valid += date.validation.valid;
        self.validation.invalid += date.validation.invalid;
        self.resolution_logs.extend(logs);
        self.dates.push(date);
    }
}

/// A saved snapshot of one record, tagged with its collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupItem {
    pub collection: Collection,
    pub record: Value,
}

/// Backup written before a destructive cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub target_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<BackupItem>,
    pub file_path: std::path::PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub total_events: u64,
    pub total_users: u64,
    pub total_organizers: u64,
    pub deleted: u64,
    pub failed: u64,
    pub dry_run: bool,
    pub backup_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub total_events: u64,
    pub total_users: u64,
    pub total_organizers: u64,
    pub restored: u64,
    pub failed: u64,
    pub dry_run: bool,
    pub backup_file: String,
}

/// Tally one backed-up item into the per-collection counters.
pub(crate) fn count_item(
    collection: Collection,
    events: &mut u64,
    users: &mut u64,
    organizers: &mut u64,
) {
    match collection {
        Collection::Events => *events += 1,
        Collection::Users => *users += 1,
        Collection::Organizers => *organizers += 1,
        Collection::Venues => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> SourceEvent {
        SourceEvent {
            id: "e1".into(),
            title: Some("Gig".into()),
            start,
            end,
            description: None,
            organizer: SourceRef::default(),
            location: SourceRef::default(),
        }
    }

    #[test]
    fn overlap_is_inclusive() {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap();

        let exact_start = event(Some(from), None);
        assert!(exact_start.overlaps(from, to));

        let spanning = event(
            Some(Utc.with_ymd_and_hms(2024, 4, 30, 20, 0, 0).unwrap()),
            Some(from),
        );
        assert!(spanning.overlaps(from, to));

        let before = event(
            Some(Utc.with_ymd_and_hms(2024, 4, 30, 20, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2024, 4, 30, 23, 0, 0).unwrap()),
        );
        assert!(!before.overlaps(from, to));
    }

    #[test]
    fn source_event_accepts_aliases() {
        let raw = serde_json::json!({
            "id": "42",
            "title": "Jazz night",
            "startDate": "2024-05-01T19:00:00Z",
            "venue": { "name": "Blue Room" },
            "organizer": { "email": "a@b.c" }
        });
        let ev: SourceEvent = serde_json::from_value(raw).unwrap();
        assert!(ev.start.is_some());
        assert_eq!(ev.location.name.as_deref(), Some("Blue Room"));
        assert_eq!(ev.organizer.email.as_deref(), Some("a@b.c"));
        assert!(ev.end.is_none());
    }

    #[test]
    fn feed_items_tolerate_numeric_ids_and_naive_times() {
        let ev = SourceEvent::from_feed(&serde_json::json!({
            "id": 2,
            "start": "2024-05-01 19:00",
            "end": "2024-05-01T21:30:00"
        }))
        .unwrap();
        assert_eq!(ev.id, "2");
        assert_eq!(ev.start, Some(Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap()));
        assert_eq!(ev.end, Some(Utc.with_ymd_and_hms(2024, 5, 1, 21, 30, 0).unwrap()));

        let offset = parse_source_time("2024-05-01T21:00:00+02:00").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap());

        assert!(SourceEvent::from_feed(&serde_json::json!({ "id": { "n": 1 } })).is_err());
        assert!(SourceEvent::from_feed(&serde_json::json!({ "title": "no id" })).is_err());
        assert!(SourceEvent::from_feed(&serde_json::json!({ "id": "x", "start": "soon" })).is_err());
    }

    #[test]
    fn collection_round_trips_through_str() {
        for c in [
            Collection::Events,
            Collection::Organizers,
            Collection::Users,
            Collection::Venues,
        ] {
            assert_eq!(Collection::parse(c.as_str()), Some(c));
        }
        assert_eq!(Collection::parse("calendars"), None);
    }
}
