#![allow(dead_code)]

use anyhow::{anyhow, Result};
use btc_import::btc::SourceFeed;
use btc_import::config::Resolution;
use btc_import::destination::{ApiError, Condition, RecordBackend, RecordFilter, RecordWriter};
use btc_import::fallback::DestinationAccess;
use btc_import::model::{Collection, SourceEvent, SourceRef};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const APP_ID: &str = "tt-app";

/// In-memory destination backend that records every call.
#[derive(Clone, Default)]
pub struct RecordingDestination {
    label: String,
    records: Arc<Mutex<BTreeMap<Collection, Vec<Value>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    failing_ids: Arc<Mutex<HashSet<String>>>,
    down: Arc<AtomicBool>,
    next_id: Arc<AtomicUsize>,
}

impl RecordingDestination {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub async fn insert(&self, collection: Collection, record: Value) {
        self.records
            .lock()
            .await
            .entry(collection)
            .or_default()
            .push(record);
    }

    pub async fn records(&self, collection: Collection) -> Vec<Value> {
        self.records
            .lock()
            .await
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Every call fails with a 503 while set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Deletes of `id`, and creates of a record whose title or name is
    /// `id`, fail with a 500.
    pub async fn fail_on(&self, id: &str) {
        self.failing_ids.lock().await.insert(id.to_string());
    }

    async fn check(&self, call: String, key: Option<&str>) -> Result<()> {
        self.calls.lock().await.push(call);
        if self.down.load(Ordering::SeqCst) {
            return Err(api_error(&self.label, 503));
        }
        if let Some(key) = key {
            if self.failing_ids.lock().await.contains(key) {
                return Err(api_error(&self.label, 500));
            }
        }
        Ok(())
    }
}

pub fn api_error(api: &str, status: u16) -> anyhow::Error {
    ApiError {
        api: api.to_string(),
        status: reqwest::StatusCode::from_u16(status).unwrap(),
        body: "scripted failure".into(),
    }
    .into()
}

fn field_str(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn matches(record: &Value, filter: &RecordFilter) -> bool {
    if let Some(app_id) = &filter.app_id {
        if field_str(record, "appId").as_deref() != Some(app_id.as_str()) {
            return false;
        }
    }
    filter.conditions.iter().all(|cond| match cond {
        Condition::Eq { field, value } => field_str(record, field).as_deref() == Some(value.as_str()),
        Condition::EqIgnoreCase { field, value } => field_str(record, field)
            .map(|v| v.to_lowercase() == value.to_lowercase())
            .unwrap_or(false),
        Condition::Contains { field, value } => field_str(record, field)
            .map(|v| v.to_lowercase().contains(&value.to_lowercase()))
            .unwrap_or(false),
        Condition::Range { field, from, to } => match field_str(record, field) {
            Some(v) => {
                from.as_ref().map(|f| v >= *f).unwrap_or(true)
                    && to.as_ref().map(|t| v <= *t).unwrap_or(true)
            }
            None => false,
        },
    })
}

#[async_trait::async_trait]
impl RecordBackend for RecordingDestination {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list(&self, collection: Collection, filter: &RecordFilter) -> Result<Vec<Value>> {
        self.check(format!("list:{}:{}", collection.as_str(), filter.describe()), None)
            .await?;
        Ok(self
            .records(collection)
            .await
            .into_iter()
            .filter(|r| matches(r, filter))
            .collect())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.check(format!("delete:{}:{id}", collection.as_str()), Some(id))
            .await?;
        let mut records = self.records.lock().await;
        let rows = records.entry(collection).or_default();
        let before = rows.len();
        rows.retain(|r| field_str(r, "_id").as_deref() != Some(id));
        if rows.len() == before {
            return Err(api_error(&self.label, 404));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordWriter for RecordingDestination {
    async fn create(&self, collection: Collection, record: &Value) -> Result<Value> {
        let key = field_str(record, "title").or_else(|| field_str(record, "name"));
        self.check(format!("create:{}", collection.as_str()), key.as_deref())
            .await?;
        if record.get("_id").is_some() {
            return Err(anyhow!("create payload must not carry an _id"));
        }
        let id = format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut stored = record.clone();
        stored["_id"] = json!(id);
        self.insert(collection, stored.clone()).await;
        Ok(stored)
    }

    async fn update(&self, collection: Collection, id: &str, record: &Value) -> Result<Value> {
        self.check(format!("update:{}:{id}", collection.as_str()), Some(id))
            .await?;
        let mut records = self.records.lock().await;
        let rows = records.entry(collection).or_default();
        let Some(existing) = rows
            .iter_mut()
            .find(|r| field_str(r, "_id").as_deref() == Some(id))
        else {
            return Err(api_error(&self.label, 404));
        };
        if let (Some(target), Some(patch)) = (existing.as_object_mut(), record.as_object()) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(existing.clone())
    }
}

/// Source feed scripted per date. Dates without a script return no events.
#[derive(Clone, Default)]
pub struct ScriptedFeed {
    by_date: Arc<Mutex<BTreeMap<NaiveDate, Result<Vec<Value>, String>>>>,
    calls: Arc<Mutex<Vec<NaiveDate>>>,
    /// Raised when the given date is fetched.
    trip: Arc<Mutex<Option<(NaiveDate, Arc<AtomicBool>)>>>,
}

impl ScriptedFeed {
    pub async fn events(&self, date: NaiveDate, events: Vec<SourceEvent>) {
        let items = events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect();
        self.raw(date, items).await;
    }

    /// Feed items exactly as the source would send them.
    pub async fn raw(&self, date: NaiveDate, items: Vec<Value>) {
        self.by_date.lock().await.insert(date, Ok(items));
    }

    pub async fn fail(&self, date: NaiveDate, message: &str) {
        self.by_date
            .lock()
            .await
            .insert(date, Err(message.to_string()));
    }

    pub async fn trip_on(&self, date: NaiveDate, flag: Arc<AtomicBool>) {
        *self.trip.lock().await = Some((date, flag));
    }

    pub async fn calls(&self) -> Vec<NaiveDate> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SourceFeed for ScriptedFeed {
    async fn fetch_events(&self, from: DateTime<Utc>, _to: DateTime<Utc>) -> Result<Vec<Value>> {
        let date = from.date_naive();
        self.calls.lock().await.push(date);
        if let Some((trip_date, flag)) = self.trip.lock().await.as_ref() {
            if *trip_date == date {
                flag.store(true, Ordering::SeqCst);
            }
        }
        match self.by_date.lock().await.get(&date) {
            Some(Ok(events)) => Ok(events.clone()),
            Some(Err(message)) => Err(anyhow!(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}

pub fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

pub fn resolution() -> Resolution {
    Resolution::default()
}

pub fn access(
    primary: &RecordingDestination,
    secondary: Option<&RecordingDestination>,
    store: Option<&RecordingDestination>,
) -> DestinationAccess {
    DestinationAccess::new(
        Arc::new(primary.clone()),
        secondary.map(|s| Arc::new(s.clone()) as Arc<dyn RecordBackend>),
        store.map(|s| Arc::new(s.clone()) as Arc<dyn RecordBackend>),
        APP_ID,
    )
}

pub fn organizer(id: &str, name: &str, btc_id: Option<&str>, email: Option<&str>) -> Value {
    let mut record = json!({ "_id": id, "name": name, "appId": APP_ID });
    if let Some(btc_id) = btc_id {
        record["btcId"] = json!(btc_id);
    }
    if let Some(email) = email {
        record["email"] = json!(email);
    }
    record
}

pub fn venue(id: &str, name: &str) -> Value {
    json!({ "_id": id, "name": name, "appId": APP_ID })
}

pub fn source_ref(id: Option<&str>, name: Option<&str>, email: Option<&str>) -> SourceRef {
    SourceRef {
        id: id.map(str::to_string),
        name: name.map(str::to_string),
        email: email.map(str::to_string),
    }
}

/// A well-formed source event at 19:00 UTC on `day`.
pub fn event(id: &str, day: NaiveDate, organizer: SourceRef, venue_name: &str) -> SourceEvent {
    let start = Utc.from_utc_datetime(&day.and_hms_opt(19, 0, 0).unwrap());
    SourceEvent {
        id: id.to_string(),
        title: Some(format!("Event {id}")),
        start: Some(start),
        end: Some(start + chrono::Duration::hours(2)),
        description: None,
        organizer,
        location: source_ref(None, Some(venue_name), None),
    }
}
