use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{info, instrument};

use crate::destination::ApiError;

/// Read-only access to the source calendar.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Raw event items whose window overlaps `[from, to]`. Items are
    /// converted one by one with [`crate::model::SourceEvent::from_feed`].
    async fn fetch_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Value>>;
}

#[derive(Clone)]
pub struct BtcClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for BtcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtcClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventsResponse {
    Bare(Vec<Value>),
    Wrapped { events: Vec<Value> },
}

impl BtcClient {
    pub fn new(base_url: &str, token: String) -> Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url =
            Url::parse(&normalized).with_context(|| format!("invalid BTC URL {base_url}"))?;
        let http = Client::builder()
            .user_agent("btc-import/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn build_request(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<reqwest::Request> {
        let mut url = self.base_url.join("events").context("invalid BTC base URL")?;
        url.query_pairs_mut()
            .append_pair("start", &from.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("end", &to.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut builder = self.http.get(url).header("Accept", "application/json");
        if !self.token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.token));
        }
        builder.build().context("failed to build BTC request")
    }
}

#[async_trait]
impl SourceFeed for BtcClient {
    #[instrument(skip_all, fields(from = %from, to = %to))]
    async fn fetch_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Value>> {
        let request = self.build_request(from, to)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach BTC")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError {
                api: "btc".into(),
                status,
                body,
            }
            .into());
        }
        let parsed: EventsResponse = res.json().await.context("invalid BTC events payload")?;
        let events = match parsed {
            EventsResponse::Bare(v) => v,
            EventsResponse::Wrapped { events } => events,
        };
        info!(count = events.len(), "fetched BTC events");
        Ok(events)
    }
}
