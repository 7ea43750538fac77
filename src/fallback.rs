//! Ordered "first success wins" access over heterogeneous backends.
//!
//! A [`Strategy`] is a named, independently runnable operation. The
//! combinator [`first_success`] runs strategies in order, stops at the first
//! one whose result is accepted, and reports every attempt it made.
//! [`DestinationAccess`] builds the primary API -> admin API -> direct store
//! chain used by entity resolution, existence checks and cleanup.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::destination::{
    error_status, ApiError, DestinationClient, RecordBackend, RecordFilter, RecordWriter,
};
use crate::model::Collection;
use crate::store::{DirectStore, StoreError};

pub struct Strategy<'a, T> {
    name: String,
    run: Box<dyn FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a>,
}

impl<'a, T: 'a> Strategy<'a, T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move || f().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Record of one strategy invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessAttempt {
    pub strategy: String,
    pub success: bool,
    /// The strategy answered, but with a result the caller does not accept
    /// (typically an empty list).
    pub rejected: bool,
    pub not_found: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub strategy: String,
    pub attempts: Vec<AccessAttempt>,
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("no access strategy configured")]
    NoStrategies,
    /// At least one strategy answered, none with an accepted result.
    #[error("no strategy produced an accepted result ({} attempts)", attempts.len())]
    Empty { attempts: Vec<AccessAttempt> },
    /// Every strategy failed.
    #[error("all strategies failed; last error: {last_error}")]
    Failed {
        attempts: Vec<AccessAttempt>,
        last_error: String,
    },
}

impl FallbackError {
    pub fn attempts(&self) -> &[AccessAttempt] {
        match self {
            FallbackError::NoStrategies => &[],
            FallbackError::Empty { attempts } | FallbackError::Failed { attempts, .. } => attempts,
        }
    }

    /// True when every backend reported the target as absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            FallbackError::Failed { attempts, .. } => attempts.iter().all(|a| a.not_found),
            _ => false,
        }
    }

    /// Status of the last failed attempt, if it was an HTTP error.
    pub fn last_status(&self) -> Option<u16> {
        self.attempts().iter().rev().find_map(|a| a.status)
    }
}

/// True for "record absent" answers from either an API or the store.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map(ApiError::is_not_found)
        .unwrap_or(false)
        || matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound { .. }))
}

/// Run `strategies` in order and return the first result `accept` approves.
/// Later strategies are never invoked once one has been accepted.
pub async fn first_success<'a, T, A>(
    strategies: Vec<Strategy<'a, T>>,
    accept: A,
) -> Result<FallbackOutcome<T>, FallbackError>
where
    A: Fn(&T) -> bool,
{
    if strategies.is_empty() {
        return Err(FallbackError::NoStrategies);
    }
    let mut attempts = Vec::with_capacity(strategies.len());
    let mut last_error = None;

    for strategy in strategies {
        let Strategy { name, run } = strategy;
        match run().await {
            Ok(value) if accept(&value) => {
                debug!(strategy = %name, "strategy succeeded");
                attempts.push(AccessAttempt {
                    strategy: name.clone(),
                    success: true,
                    rejected: false,
                    not_found: false,
                    status: None,
                    error: None,
                });
                return Ok(FallbackOutcome {
                    value,
                    strategy: name,
                    attempts,
                });
            }
            Ok(_) => {
                debug!(strategy = %name, "strategy returned no usable result");
                attempts.push(AccessAttempt {
                    strategy: name,
                    success: false,
                    rejected: true,
                    not_found: false,
                    status: None,
                    error: None,
                });
            }
            Err(err) => {
                warn!(strategy = %name, error = %err, "strategy failed");
                attempts.push(AccessAttempt {
                    strategy: name,
                    success: false,
                    rejected: false,
                    not_found: is_not_found(&err),
                    status: error_status(&err).map(|s| s.as_u16()),
                    error: Some(format!("{err:#}")),
                });
                last_error = Some(format!("{err:#}"));
            }
        }
    }

    if attempts.iter().any(|a| a.rejected) {
        Err(FallbackError::Empty { attempts })
    } else {
        Err(FallbackError::Failed {
            attempts,
            last_error: last_error.unwrap_or_default(),
        })
    }
}

/// Whether an empty list counts as an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    AnyResult,
    NonEmpty,
}

/// Destination access chain: primary API, optional admin API, optional
/// direct store.
#[derive(Clone)]
pub struct DestinationAccess {
    primary: Arc<dyn RecordWriter>,
    secondary: Option<Arc<dyn RecordBackend>>,
    store: Option<Arc<dyn RecordBackend>>,
    app_id: String,
}

impl DestinationAccess {
    pub fn new(
        primary: Arc<dyn RecordWriter>,
        secondary: Option<Arc<dyn RecordBackend>>,
        store: Option<Arc<dyn RecordBackend>>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            secondary,
            store,
            app_id: app_id.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let token = cfg.destination.token.clone();
        let primary = DestinationClient::new("primary-api", &cfg.destination.api_base_url, token.clone())
            .context("failed to configure primary destination API")?;
        let secondary = match &cfg.destination.admin_base_url {
            Some(url) => Some(Arc::new(
                DestinationClient::new("admin-api", url, token)
                    .context("failed to configure admin destination API")?,
            ) as Arc<dyn RecordBackend>),
            None => None,
        };
        let store = DirectStore::from_config(cfg).map(|s| Arc::new(s) as Arc<dyn RecordBackend>);
        Ok(Self::new(Arc::new(primary), secondary, store, cfg.destination.app_id.clone()))
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// A filter scoped to this tenant.
    pub fn filter(&self) -> RecordFilter {
        RecordFilter::new(Some(self.app_id.clone()))
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names = vec![self.primary.label().to_string()];
        names.extend(self.secondary.iter().map(|s| s.label().to_string()));
        names.extend(self.store.iter().map(|s| s.label().to_string()));
        names
    }

    #[instrument(skip_all, fields(collection = collection.as_str()))]
    pub async fn list(
        &self,
        collection: Collection,
        filter: &RecordFilter,
        need: Need,
    ) -> Result<FallbackOutcome<Vec<Value>>, FallbackError> {
        let primary = &self.primary;
        let mut strategies = vec![Strategy::new(primary.label(), move || {
            primary.list(collection, filter)
        })];
        for backend in self.secondary.iter().chain(self.store.iter()) {
            strategies.push(Strategy::new(backend.label(), move || {
                backend.list(collection, filter)
            }));
        }
        first_success(strategies, |rows: &Vec<Value>| {
            need == Need::AnyResult || !rows.is_empty()
        })
        .await
    }

    #[instrument(skip_all, fields(collection = collection.as_str(), id = %id))]
    pub async fn delete(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<FallbackOutcome<()>, FallbackError> {
        let primary = &self.primary;
        let mut strategies = vec![Strategy::new(primary.label(), move || {
            primary.delete(collection, id)
        })];
        for backend in self.secondary.iter().chain(self.store.iter()) {
            strategies.push(Strategy::new(backend.label(), move || {
                backend.delete(collection, id)
            }));
        }
        first_success(strategies, |_| true).await
    }

    /// Creation goes through the primary API only.
    pub async fn create(&self, collection: Collection, record: &Value) -> Result<Value> {
        self.primary.create(collection, record).await
    }

    pub async fn update(&self, collection: Collection, id: &str, record: &Value) -> Result<Value> {
        self.primary.update(collection, id, record).await
    }
}
