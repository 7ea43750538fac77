//! Direct SQLite access to the destination store.
//!
//! This is the last link of the fallback chain. Every physical table holds
//! `(id TEXT PRIMARY KEY, app_id TEXT, data TEXT)` where `data` is the JSON
//! document; filters are evaluated with `json_extract`.
//!
//! Table names come from the configured logical -> physical mapping. When a
//! mapped name is missing from the schema, case variants are probed through
//! `sqlite_master` and the hit is logged so the mapping can be fixed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Row};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::destination::{Condition, RecordBackend, RecordFilter};
use crate::model::Collection;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no table for collection {collection} (tried {candidates:?})")]
    UnknownTable {
        collection: &'static str,
        candidates: Vec<String>,
    },
    #[error("refusing to query with identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("record {id} not found in {table}")]
    NotFound { table: String, id: String },
}

#[derive(Debug, Clone)]
pub struct DirectStore {
    url: String,
    mapping: BTreeMap<Collection, String>,
    widen_tenant_filter: bool,
    id_field: String,
}

impl DirectStore {
    pub fn new(
        url: &str,
        mapping: BTreeMap<Collection, String>,
        widen_tenant_filter: bool,
        id_field: &str,
    ) -> Self {
        Self {
            url: normalize_sqlite_url(url),
            mapping,
            widen_tenant_filter,
            id_field: id_field.to_string(),
        }
    }

    /// Build from configuration; `None` when no direct store is configured.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let url = cfg.destination.database_url.as_deref()?;
        let mapping = [
            Collection::Events,
            Collection::Organizers,
            Collection::Users,
            Collection::Venues,
        ]
        .into_iter()
        .map(|c| (c, cfg.physical_name(c)))
        .collect();
        Some(Self::new(
            url,
            mapping,
            cfg.destination.widen_tenant_filter,
            &cfg.destination.id_field,
        ))
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        SqliteConnection::connect(&self.url)
            .await
            .with_context(|| format!("failed to open direct store {}", self.url))
    }

    /// Close a scoped connection, logging rather than masking the caller's result.
    async fn release(conn: SqliteConnection) {
        if let Err(err) = conn.close().await {
            warn!(?err, "failed to close direct store connection");
        }
    }

    /// List every table in the store (diagnostic use).
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.connect().await?;
        let tables = table_names(&mut conn).await;
        Self::release(conn).await;
        tables
    }

    /// Resolve the physical table for `collection` against the live schema.
    pub async fn resolve_table(&self, collection: Collection) -> Result<String> {
        let mut conn = self.connect().await?;
        let table = self.resolve_table_with(&mut conn, collection).await;
        Self::release(conn).await;
        table
    }

    async fn resolve_table_with(
        &self,
        conn: &mut SqliteConnection,
        collection: Collection,
    ) -> Result<String> {
        let configured = self
            .mapping
            .get(&collection)
            .cloned()
            .unwrap_or_else(|| collection.as_str().to_string());
        let existing = table_names(conn).await?;
        if existing.iter().any(|t| t == &configured) {
            return Ok(configured);
        }

        let candidates = name_variants(&configured, collection.as_str());
        match candidates.iter().find(|c| existing.contains(c)) {
            Some(found) => {
                warn!(
                    collection = collection.as_str(),
                    configured = %configured,
                    found = %found,
                    "collection mapping does not match schema; using introspected table"
                );
                Ok(found.clone())
            }
            None => Err(StoreError::UnknownTable {
                collection: collection.as_str(),
                candidates,
            }
            .into()),
        }
    }

    async fn query(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<Value>> {
        ensure_identifier(table)?;
        let mut sql = format!("SELECT id, data FROM \"{table}\" WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();
        for cond in &filter.conditions {
            ensure_identifier(cond.field())?;
            match cond {
                Condition::Eq { field, value } => {
                    sql.push_str(&format!(" AND json_extract(data, '$.{field}') = ?"));
                    binds.push(value.clone());
                }
                Condition::EqIgnoreCase { field, value } => {
                    sql.push_str(&format!(
                        " AND LOWER(json_extract(data, '$.{field}')) = LOWER(?)"
                    ));
                    binds.push(value.clone());
                }
                Condition::Contains { field, value } => {
                    sql.push_str(&format!(
                        " AND LOWER(json_extract(data, '$.{field}')) LIKE '%' || LOWER(?) || '%'"
                    ));
                    binds.push(value.clone());
                }
                Condition::Range { field, from, to } => {
                    if let Some(from) = from {
                        sql.push_str(&format!(" AND json_extract(data, '$.{field}') >= ?"));
                        binds.push(from.clone());
                    }
                    if let Some(to) = to {
                        sql.push_str(&format!(" AND json_extract(data, '$.{field}') <= ?"));
                        binds.push(to.clone());
                    }
                }
            }
        }
        if let Some(app_id) = &filter.app_id {
            sql.push_str(" AND app_id = ?");
            binds.push(app_id.clone());
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b.as_str());
        }
        let rows = query.fetch_all(&mut *conn).await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let data: String = row.get("data");
                let mut doc: Value = serde_json::from_str(&data)
                    .with_context(|| format!("row {id} in {table} holds invalid JSON"))?;
                if let Value::Object(map) = &mut doc {
                    map.entry(self.id_field.clone())
                        .or_insert_with(|| Value::String(id.clone()));
                }
                Ok(doc)
            })
            .collect()
    }

    /// Narrow, then widen: a tenant-scoped query that yields nothing is
    /// retried once without the tenant filter when widening is enabled and
    /// the filter is not `tenant_only`.
    async fn list_with(
        &self,
        conn: &mut SqliteConnection,
        collection: Collection,
        filter: &RecordFilter,
    ) -> Result<Vec<Value>> {
        let table = self.resolve_table_with(conn, collection).await?;
        let rows = self.query(conn, &table, filter).await?;
        if !rows.is_empty() || filter.app_id.is_none() {
            return Ok(rows);
        }
        if filter.tenant_only {
            debug!(table = %table, "tenant-scoped query returned no rows; filter is tenant-only");
            return Ok(rows);
        }
        if !self.widen_tenant_filter {
            info!(table = %table, "tenant-scoped query returned no rows; widening disabled");
            return Ok(rows);
        }
        let widened = self.query(conn, &table, &filter.without_tenant()).await?;
        if !widened.is_empty() {
            warn!(
                table = %table,
                app_id = filter.app_id.as_deref().unwrap_or_default(),
                rows = widened.len(),
                "tenant-scoped query was empty; returning rows from other tenants"
            );
        }
        Ok(widened)
    }

    async fn delete_with(
        &self,
        conn: &mut SqliteConnection,
        collection: Collection,
        id: &str,
    ) -> Result<()> {
        let table = self.resolve_table_with(conn, collection).await?;
        ensure_identifier(&table)?;
        let done = sqlx::query(&format!("DELETE FROM \"{table}\" WHERE id = ?"))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table,
                id: id.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl RecordBackend for DirectStore {
    fn label(&self) -> &str {
        "direct-store"
    }

    #[instrument(skip_all, fields(collection = collection.as_str()))]
    async fn list(&self, collection: Collection, filter: &RecordFilter) -> Result<Vec<Value>> {
        let mut conn = self.connect().await?;
        let rows = self.list_with(&mut conn, collection, filter).await;
        Self::release(conn).await;
        rows
    }

    #[instrument(skip_all, fields(collection = collection.as_str(), id = %id))]
    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        let done = self.delete_with(&mut conn, collection, id).await;
        Self::release(conn).await;
        done
    }
}

async fn table_names(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

fn ensure_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()).into())
    }
}

/// Candidate physical names: configured, logical, then capitalized,
/// lowercase, snake_case and camelCase variants of both, deduplicated.
pub fn name_variants(configured: &str, logical: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for base in [configured, logical] {
        for v in [
            base.to_string(),
            capitalize(base),
            base.to_lowercase(),
            to_snake(base),
            to_camel(base),
        ] {
            if !out.contains(&v) {
                out.push(v);
            }
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn to_camel(s: &str) -> String {
    let snake = to_snake(s);
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Expand a leading `~/` in a file-backed SQLite URL. In-memory and
/// non-sqlite URLs are returned untouched.
fn normalize_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    match path_with_query.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("sqlite://{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => url.to_string(),
        },
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_cover_case_styles() {
        let v = name_variants("eventOrganizers", "organizers");
        assert_eq!(v[0], "eventOrganizers");
        assert!(v.contains(&"EventOrganizers".to_string()));
        assert!(v.contains(&"event_organizers".to_string()));
        assert!(v.contains(&"eventorganizers".to_string()));
        assert!(v.contains(&"Organizers".to_string()));
        let unique: std::collections::HashSet<_> = v.iter().collect();
        assert_eq!(unique.len(), v.len());
    }

    #[test]
    fn camel_and_snake_conversions() {
        assert_eq!(to_snake("EventOrganizers"), "event_organizers");
        assert_eq!(to_camel("event_organizers"), "eventOrganizers");
        assert_eq!(to_camel("Events"), "events");
        assert_eq!(capitalize("venues"), "Venues");
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(ensure_identifier("startDate").is_ok());
        assert!(ensure_identifier("name') OR 1=1 --").is_err());
        assert!(ensure_identifier("").is_err());
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(normalize_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_sqlite_url("postgres://x"), "postgres://x");
        assert_eq!(normalize_sqlite_url("sqlite://./tt.db"), "sqlite://./tt.db");
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                normalize_sqlite_url("sqlite://~/tt.db"),
                format!("sqlite://{}/tt.db", home.trim_end_matches('/'))
            );
        }
    }
}
