use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::model::Collection;

pub mod model;

use model::ListResponse;

/// Non-success answer from a remote API. Callers recover the status with
/// `anyhow::Error::downcast_ref::<ApiError>()`.
#[derive(Debug, Error)]
#[error("{api} returned {status}: {body}")]
pub struct ApiError {
    pub api: String,
    pub status: StatusCode,
    pub body: String,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// HTTP status carried by an error chain, if any.
pub fn error_status(err: &anyhow::Error) -> Option<StatusCode> {
    err.downcast_ref::<ApiError>().map(|e| e.status)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Eq { field: String, value: String },
    /// Case-insensitive equality.
    EqIgnoreCase { field: String, value: String },
    /// Case-insensitive substring match.
    Contains { field: String, value: String },
    /// Inclusive range on an RFC 3339 / ISO-8601 string field.
    Range {
        field: String,
        from: Option<String>,
        to: Option<String>,
    },
}

impl Condition {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Condition::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn eq_ignore_case(field: &str, value: impl Into<String>) -> Self {
        Condition::EqIgnoreCase {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn contains(field: &str, value: impl Into<String>) -> Self {
        Condition::Contains {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn range(field: &str, from: impl Into<String>, to: impl Into<String>) -> Self {
        Condition::Range {
            field: field.to_string(),
            from: Some(from.into()),
            to: Some(to.into()),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Condition::Eq { field, .. }
            | Condition::EqIgnoreCase { field, .. }
            | Condition::Contains { field, .. }
            | Condition::Range { field, .. } => field,
        }
    }
}

/// Filter for a list call: field conditions plus an optional tenant scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub conditions: Vec<Condition>,
    pub app_id: Option<String>,
    /// An empty tenant-scoped answer is final; backends must not retry
    /// without the tenant.
    pub tenant_only: bool,
}

impl RecordFilter {
    pub fn new(app_id: Option<String>) -> Self {
        Self {
            conditions: Vec::new(),
            app_id,
            tenant_only: false,
        }
    }

    pub fn tenant_only(mut self) -> Self {
        self.tenant_only = true;
        self
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn without_tenant(&self) -> Self {
        Self {
            conditions: self.conditions.clone(),
            app_id: None,
            tenant_only: false,
        }
    }

    /// Encode as query parameters for the HTTP APIs.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for cond in &self.conditions {
            match cond {
                Condition::Eq { field, value } => pairs.push((field.clone(), value.clone())),
                Condition::EqIgnoreCase { field, value } => {
                    pairs.push((format!("{field}__iexact"), value.clone()))
                }
                Condition::Contains { field, value } => {
                    pairs.push((format!("{field}__icontains"), value.clone()))
                }
                Condition::Range { field, from, to } => {
                    if let Some(from) = from {
                        pairs.push((format!("{field}__gte"), from.clone()));
                    }
                    if let Some(to) = to {
                        pairs.push((format!("{field}__lte"), to.clone()));
                    }
                }
            }
        }
        if let Some(app_id) = &self.app_id {
            pairs.push(("appId".into(), app_id.clone()));
        }
        pairs
    }

    /// Human-readable rendering used in attempt logs.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .conditions
            .iter()
            .map(|c| match c {
                Condition::Eq { field, value } => format!("{field}={value}"),
                Condition::EqIgnoreCase { field, value } => format!("{field}=~{value}"),
                Condition::Contains { field, value } => format!("{field}~{value}"),
                Condition::Range { field, from, to } => format!(
                    "{field} in [{}, {}]",
                    from.as_deref().unwrap_or("-"),
                    to.as_deref().unwrap_or("-")
                ),
            })
            .collect();
        if let Some(app_id) = &self.app_id {
            parts.push(format!("appId={app_id}"));
        }
        parts.join(", ")
    }
}

/// Read and delete access to destination records. Implemented by both HTTP
/// APIs and the direct store.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Short label used in attempt logs (e.g. `primary-api`).
    fn label(&self) -> &str;

    async fn list(&self, collection: Collection, filter: &RecordFilter) -> Result<Vec<Value>>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;
}

/// Creation and update, only available through the primary API.
#[async_trait]
pub trait RecordWriter: RecordBackend {
    async fn create(&self, collection: Collection, record: &Value) -> Result<Value>;

    async fn update(&self, collection: Collection, id: &str, record: &Value) -> Result<Value>;
}

/// Extract a record's identifier from `id_field`, falling back to `id`.
pub fn record_id(record: &Value, id_field: &str) -> Option<String> {
    [id_field, "id"]
        .iter()
        .filter_map(|f| record.get(*f))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Client for one destination REST API (primary or admin).
#[derive(Clone)]
pub struct DestinationClient {
    http: Client,
    label: String,
    base_url: Url,
    token: String,
}

impl fmt::Debug for DestinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationClient")
            .field("label", &self.label)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DestinationClient {
    pub fn new(label: impl Into<String>, base_url: &str, token: String) -> Result<Self> {
        // `Url::join` drops the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid destination URL {base_url}"))?;
        let http = Client::builder()
            .user_agent("btc-import/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            label: label.into(),
            base_url,
            token,
        })
    }

    fn endpoint(&self, collection: Collection, id: Option<&str>) -> Result<Url> {
        let path = match id {
            Some(id) => format!("{}/{}", collection.as_str(), id),
            None => collection.as_str().to_string(),
        };
        self.base_url
            .join(&path)
            .with_context(|| format!("invalid endpoint for {path}"))
    }

    pub fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build destination request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Option<Value>> {
        debug!(api = %self.label, method = %request.method(), url = %request.url(), "destination request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach {}", self.label))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(api = %self.label, "rate limited: {}", body);
            }
            return Err(ApiError {
                api: self.label.clone(),
                status,
                body,
            }
            .into());
        }

        let text = res
            .text()
            .await
            .with_context(|| format!("failed to read {} response", self.label))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON from {}", self.label))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl RecordBackend for DestinationClient {
    fn label(&self) -> &str {
        &self.label
    }

    #[instrument(skip_all, fields(api = %self.label, collection = collection.as_str()))]
    async fn list(&self, collection: Collection, filter: &RecordFilter) -> Result<Vec<Value>> {
        let mut url = self.endpoint(collection, None)?;
        url.query_pairs_mut().extend_pairs(filter.to_query_pairs());
        let request = self.build_request(Method::GET, url, None)?;
        let Some(body) = self.execute(request).await? else {
            return Ok(Vec::new());
        };
        let parsed: ListResponse = serde_json::from_value(body)
            .with_context(|| format!("unexpected list payload from {}", self.label))?;
        Ok(parsed.into_records())
    }

    #[instrument(skip_all, fields(api = %self.label, collection = collection.as_str(), id = %id))]
    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let url = self.endpoint(collection, Some(id))?;
        let request = self.build_request(Method::DELETE, url, None)?;
        self.execute(request).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordWriter for DestinationClient {
    #[instrument(skip_all, fields(api = %self.label, collection = collection.as_str()))]
    async fn create(&self, collection: Collection, record: &Value) -> Result<Value> {
        let url = self.endpoint(collection, None)?;
        let request = self.build_request(Method::POST, url, Some(record))?;
        self.execute(request)
            .await?
            .ok_or_else(|| anyhow!("{} returned an empty body on create", self.label))
    }

    #[instrument(skip_all, fields(api = %self.label, collection = collection.as_str(), id = %id))]
    async fn update(&self, collection: Collection, id: &str, record: &Value) -> Result<Value> {
        let url = self.endpoint(collection, Some(id))?;
        let request = self.build_request(Method::PATCH, url, Some(record))?;
        Ok(self.execute(request).await?.unwrap_or(Value::Null))
    }
}
