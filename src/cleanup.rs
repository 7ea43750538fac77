//! Destructive removal of imported records, always behind a verified
//! backup, plus replay of such a backup.
//!
//! A backup is written, synced, renamed into place and read back before
//! any delete is issued. Per-record failures are counted; a backup that
//! cannot be read or parsed aborts the whole operation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, instrument, warn};

use crate::destination::{record_id, Condition, RecordFilter};
use crate::fallback::{DestinationAccess, FallbackError, Need};
use crate::model::{
    count_item, BackupItem, BackupRecord, CleanupResult, Collection, RestoreResult,
    IMPORTED_ON_FIELD, IMPORT_SOURCE, IMPORT_SOURCE_FIELD,
};
use crate::runner::day_window;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to read backup {path}: {source}")]
    BackupRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backup {path} is corrupt: {source}")]
    BackupCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("backup {path} holds {found} items, expected {expected}")]
    BackupVerify {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("operation not confirmed")]
    NotConfirmed,
    #[error("failed to fetch {collection} records: {source}")]
    Fetch {
        collection: &'static str,
        #[source]
        source: FallbackError,
    },
    #[error("confirmation prompt failed: {0:#}")]
    Prompt(anyhow::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode backup: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a cleanup removes: records imported on `date` in `collections`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCriterion {
    pub date: NaiveDate,
    pub collections: Vec<Collection>,
}

impl CleanupCriterion {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            collections: vec![Collection::Events, Collection::Organizers, Collection::Users],
        }
    }

    pub fn filter_for(&self, collection: Collection, base: RecordFilter) -> RecordFilter {
        let filter = base.with(Condition::eq(IMPORT_SOURCE_FIELD, IMPORT_SOURCE));
        match collection {
            Collection::Events => {
                let (from, to) = day_window(self.date);
                filter.with(Condition::range(
                    "startDate",
                    from.to_rfc3339_opts(SecondsFormat::Secs, true),
                    to.to_rfc3339_opts(SecondsFormat::Secs, true),
                ))
            }
            _ => filter.with(Condition::eq(IMPORTED_ON_FIELD, self.date.to_string())),
        }
    }
}

/// Gate in front of destructive steps.
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, summary: &str, phrase: &str) -> Result<bool>;
}

/// Always confirms (`--confirm`).
pub struct AutoConfirm;

#[async_trait]
impl Confirmation for AutoConfirm {
    async fn confirm(&self, _summary: &str, _phrase: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Asks on stdout and requires the phrase to be typed back on stdin.
pub struct StdinConfirmation;

#[async_trait]
impl Confirmation for StdinConfirmation {
    async fn confirm(&self, summary: &str, phrase: &str) -> Result<bool> {
        let mut out = tokio::io::stdout();
        out.write_all(format!("{summary}\nType {phrase} to continue: ").as_bytes())
            .await?;
        out.flush().await?;
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line.trim() == phrase)
    }
}

/// `backup-<date>-<timestamp>.json` with `:` and `.` made filesystem safe.
pub fn backup_file_name(date: NaiveDate, timestamp: DateTime<Utc>) -> String {
    let ts = timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("backup-{date}-{ts}.json")
}

/// Drop identity fields so the record can be created anew.
pub fn strip_identity(record: &Value, id_field: &str, version_field: &str) -> Value {
    let mut record = record.clone();
    if let Some(map) = record.as_object_mut() {
        map.remove(id_field);
        map.remove(version_field);
    }
    record
}

pub struct BackupCleanupFacility {
    access: DestinationAccess,
    results_dir: PathBuf,
    id_field: String,
    version_field: String,
    throttle: Duration,
    confirmation: Box<dyn Confirmation>,
}

impl BackupCleanupFacility {
    pub fn new(
        access: DestinationAccess,
        results_dir: PathBuf,
        id_field: impl Into<String>,
        version_field: impl Into<String>,
        throttle: Duration,
        confirmation: Box<dyn Confirmation>,
    ) -> Self {
        Self {
            access,
            results_dir,
            id_field: id_field.into(),
            version_field: version_field.into(),
            throttle,
            confirmation,
        }
    }

    #[instrument(skip_all, fields(date = %criterion.date, dry_run = dry_run))]
    pub async fn cleanup(
        &self,
        criterion: &CleanupCriterion,
        dry_run: bool,
    ) -> Result<CleanupResult, CleanupError> {
        let mut result = CleanupResult {
            dry_run,
            ..Default::default()
        };

        let mut items = Vec::new();
        for &collection in &criterion.collections {
            let filter = criterion.filter_for(collection, self.access.filter().tenant_only());
            let outcome = self
                .access
                .list(collection, &filter, Need::AnyResult)
                .await
                .map_err(|source| CleanupError::Fetch {
                    collection: collection.as_str(),
                    source,
                })?;
            info!(
                collection = collection.as_str(),
                count = outcome.value.len(),
                via = %outcome.strategy,
                "matched records"
            );
            for record in outcome.value {
                count_item(
                    collection,
                    &mut result.total_events,
                    &mut result.total_users,
                    &mut result.total_organizers,
                );
                items.push(BackupItem { collection, record });
            }
        }

        if items.is_empty() {
            info!("nothing matched; no backup written");
            return Ok(result);
        }

        let backup = self.write_backup(criterion.date, items).await?;
        result.backup_file = Some(backup.file_path.display().to_string());

        if dry_run {
            info!(items = backup.items.len(), "dry run; nothing deleted");
            return Ok(result);
        }

        let summary = format!(
            "About to delete {} records ({} events, {} organizers, {} users). Backup: {}",
            backup.items.len(),
            result.total_events,
            result.total_organizers,
            result.total_users,
            backup.file_path.display()
        );
        if !self
            .confirmation
            .confirm(&summary, "DELETE")
            .await
            .map_err(CleanupError::Prompt)?
        {
            return Err(CleanupError::NotConfirmed);
        }

        for item in &backup.items {
            let Some(id) = record_id(&item.record, &self.id_field) else {
                result.failed += 1;
                warn!(collection = item.collection.as_str(), "record has no id; cannot delete");
                continue;
            };
            match self.access.delete(item.collection, &id).await {
                Ok(_) => result.deleted += 1,
                Err(err) if err.is_not_found() => {
                    result.deleted += 1;
                    warn!(collection = item.collection.as_str(), %id, "record already absent");
                }
                Err(err) => {
                    result.failed += 1;
                    warn!(collection = item.collection.as_str(), %id, error = %err, "delete failed");
                }
            }
            if !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }

        info!(deleted = result.deleted, failed = result.failed, "cleanup finished");
        Ok(result)
    }

    /// Persist `items` and read them back before returning.
    pub async fn write_backup(
        &self,
        date: NaiveDate,
        items: Vec<BackupItem>,
    ) -> Result<BackupRecord, CleanupError> {
        tokio::fs::create_dir_all(&self.results_dir).await?;
        let timestamp = Utc::now();
        let path = self.results_dir.join(backup_file_name(date, timestamp));
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(&items)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        let stored = read_backup(&path).await?;
        if stored.len() != items.len() {
            return Err(CleanupError::BackupVerify {
                path,
                expected: items.len(),
                found: stored.len(),
            });
        }
        info!(path = %path.display(), items = items.len(), "backup written");
        Ok(BackupRecord {
            target_date: date,
            timestamp,
            items,
            file_path: path,
        })
    }

    #[instrument(skip_all, fields(path = %path.display(), dry_run = dry_run))]
    pub async fn restore(&self, path: &Path, dry_run: bool) -> Result<RestoreResult, CleanupError> {
        let items = read_backup(path).await?;
        let mut result = RestoreResult {
            dry_run,
            backup_file: path.display().to_string(),
            ..Default::default()
        };
        for item in &items {
            count_item(
                item.collection,
                &mut result.total_events,
                &mut result.total_users,
                &mut result.total_organizers,
            );
        }
        if dry_run || items.is_empty() {
            info!(items = items.len(), "nothing restored");
            return Ok(result);
        }

        let summary = format!(
            "About to re-create {} records from {}",
            items.len(),
            path.display()
        );
        if !self
            .confirmation
            .confirm(&summary, "RESTORE")
            .await
            .map_err(CleanupError::Prompt)?
        {
            return Err(CleanupError::NotConfirmed);
        }

        for item in &items {
            let record = strip_identity(&item.record, &self.id_field, &self.version_field);
            match self.access.create(item.collection, &record).await {
                Ok(_) => result.restored += 1,
                Err(err) => {
                    result.failed += 1;
                    warn!(collection = item.collection.as_str(), error = %format!("{err:#}"), "restore failed");
                }
            }
            if !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }
        info!(restored = result.restored, failed = result.failed, "restore finished");
        Ok(result)
    }
}

/// Load every item of a backup file.
pub async fn read_backup(path: &Path) -> Result<Vec<BackupItem>, CleanupError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| CleanupError::BackupRead {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&raw).map_err(|source| CleanupError::BackupCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn backup_name_is_filesystem_safe() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 2, 10, 30, 15).unwrap();
        let name = backup_file_name(date, ts);
        assert_eq!(name, "backup-2024-05-01-2024-05-02T10-30-15-000Z.json");
    }

    #[test]
    fn identity_fields_are_stripped() {
        let record = json!({ "_id": "abc", "__v": 3, "title": "Gig" });
        let stripped = strip_identity(&record, "_id", "__v");
        assert_eq!(stripped, json!({ "title": "Gig" }));
    }

    #[test]
    fn events_are_selected_by_day_window() {
        let criterion = CleanupCriterion::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let filter = criterion.filter_for(
            Collection::Events,
            RecordFilter::new(Some("app".into())).tenant_only(),
        );
        assert!(filter.tenant_only);
        let pairs = filter.to_query_pairs();
        assert!(pairs.contains(&("importSource".into(), "btc".into())));
        assert!(pairs.contains(&("startDate__gte".into(), "2024-05-01T00:00:00Z".into())));
        assert!(pairs.contains(&("startDate__lte".into(), "2024-05-01T23:59:59Z".into())));

        let users = criterion.filter_for(Collection::Users, RecordFilter::new(None));
        assert!(users
            .to_query_pairs()
            .contains(&("importedOn".into(), "2024-05-01".into())));
    }

    #[tokio::test]
    async fn corrupt_backup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        std::fs::write(&path, b"[{\"collection\": \"events\"").unwrap();
        let err = read_backup(&path).await.unwrap_err();
        assert!(matches!(err, CleanupError::BackupCorrupt { .. }));

        let missing = read_backup(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(missing, CleanupError::BackupRead { .. }));
    }
}
