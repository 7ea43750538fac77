//! Organizer and venue resolution against the destination store.
//!
//! Strategies run in the configured order and the first one yielding exactly
//! one candidate wins. Zero or several candidates are recorded as failed
//! attempts, never as errors. Every configured strategy that is reached
//! leaves an attempt in the log, including those that had no input to work
//! with, so two resolutions against the same store state produce the same
//! attempt list.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::{Resolution, StrategyKind};
use crate::destination::{record_id, Condition};
use crate::fallback::{DestinationAccess, FallbackError, Need};
use crate::model::{
    Collection, ErrorDetails, FailureKind, ResolutionAttempt, ResolutionLog, ResolvedEntity,
    SourceRef,
};

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid regex"));

/// Destination field holding the source system's identifier.
pub const EXTERNAL_ID_FIELD: &str = "btcId";
const NAME_FIELD: &str = "name";
const EMAIL_FIELD: &str = "email";

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_name(raw: &str) -> String {
    NON_ALNUM
        .replace_all(&raw.to_lowercase(), " ")
        .trim()
        .to_string()
}

pub struct EntityResolver {
    access: DestinationAccess,
    settings: Resolution,
    id_field: String,
}

/// Outcome of a single strategy before it is turned into an attempt.
struct StrategyResult {
    attempt: ResolutionAttempt,
    kind: Option<FailureKind>,
    resolved: Option<ResolvedEntity>,
}

impl StrategyResult {
    fn skipped(method: StrategyKind, kind: FailureKind, message: String) -> Self {
        Self {
            attempt: ResolutionAttempt {
                method: method.as_str().to_string(),
                query: None,
                success: false,
                result_count: -1,
                via: None,
                status: None,
                error: Some(message),
            },
            kind: Some(kind),
            resolved: None,
        }
    }
}

impl EntityResolver {
    pub fn new(access: DestinationAccess, settings: Resolution, id_field: impl Into<String>) -> Self {
        Self {
            access,
            settings,
            id_field: id_field.into(),
        }
    }

    /// Resolve `source` within `collection`. Never mutates the destination.
    #[instrument(skip_all, fields(collection = collection.as_str(), event_id = source_event_id.unwrap_or_default()))]
    pub async fn resolve(
        &self,
        collection: Collection,
        source: &SourceRef,
        source_event_id: Option<&str>,
    ) -> ResolutionLog {
        let mut attempts = Vec::with_capacity(self.settings.strategies.len());
        let mut last_failure: Option<(FailureKind, String)> = None;
        let mut result = None;

        for kind in &self.settings.strategies {
            let outcome = self.run_strategy(*kind, collection, source).await;
            debug!(
                method = kind.as_str(),
                success = outcome.attempt.success,
                count = outcome.attempt.result_count,
                "resolution attempt"
            );
            if let Some(failure) = outcome.kind {
                let message = outcome
                    .attempt
                    .error
                    .clone()
                    .unwrap_or_else(|| "no match".into());
                last_failure = Some((failure, message));
            }
            attempts.push(outcome.attempt);
            if outcome.resolved.is_some() {
                result = outcome.resolved;
                break;
            }
        }

        let success = result.is_some();
        let error_details = if success {
            None
        } else {
            let (kind, message) =
                last_failure.unwrap_or((FailureKind::NoMatch, "no strategy configured".into()));
            Some(ErrorDetails {
                kind,
                message: format!(
                    "{} unresolved after {} attempts: {}",
                    collection.as_str(),
                    attempts.len(),
                    message
                ),
            })
        };

        ResolutionLog {
            collection,
            source: source.clone(),
            source_event_id: source_event_id.map(str::to_string),
            timestamp: Utc::now(),
            attempts,
            success,
            result,
            error_details,
        }
    }

    async fn run_strategy(
        &self,
        kind: StrategyKind,
        collection: Collection,
        source: &SourceRef,
    ) -> StrategyResult {
        let input = match kind {
            StrategyKind::ExactId => source.id.as_deref(),
            StrategyKind::ExactName | StrategyKind::FuzzyName => source.name.as_deref(),
            StrategyKind::Email => source.email.as_deref(),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty());

        let Some(input) = input else {
            return StrategyResult::skipped(
                kind,
                FailureKind::MissingInput,
                format!("source reference has no input for {}", kind.as_str()),
            );
        };

        let condition = match kind {
            StrategyKind::ExactId => Condition::eq(EXTERNAL_ID_FIELD, input),
            StrategyKind::ExactName => Condition::eq(NAME_FIELD, input),
            StrategyKind::FuzzyName => {
                let normalized = normalize_name(input);
                if normalized.chars().count() < self.settings.fuzzy_min_len {
                    return StrategyResult::skipped(
                        kind,
                        FailureKind::MissingInput,
                        format!(
                            "fuzzy query '{}' shorter than {} characters",
                            normalized, self.settings.fuzzy_min_len
                        ),
                    );
                }
                Condition::contains(NAME_FIELD, input)
            }
            StrategyKind::Email => Condition::eq_ignore_case(EMAIL_FIELD, input),
        };
        let filter = self.access.filter().with(condition);
        let query = filter.describe();

        let mut attempt = ResolutionAttempt {
            method: kind.as_str().to_string(),
            query: Some(query),
            success: false,
            result_count: 0,
            via: None,
            status: None,
            error: None,
        };

        let candidates = match self.access.list(collection, &filter, Need::NonEmpty).await {
            Ok(outcome) => {
                attempt.via = Some(outcome.strategy);
                outcome.value
            }
            Err(FallbackError::Empty { .. }) => {
                attempt.error = Some("no candidates".into());
                return StrategyResult {
                    attempt,
                    kind: Some(FailureKind::NoMatch),
                    resolved: None,
                };
            }
            Err(err) => {
                attempt.result_count = -1;
                attempt.status = err.last_status().map(|s| s.to_string());
                attempt.error = Some(err.to_string());
                return StrategyResult {
                    attempt,
                    kind: Some(FailureKind::Transport),
                    resolved: None,
                };
            }
        };
        attempt.result_count = candidates.len() as i64;

        let chosen = match candidates.len() {
            1 => candidates.first(),
            n if kind == StrategyKind::FuzzyName && self.settings.fuzzy_normalized_tiebreak => {
                let wanted = normalize_name(input);
                let mut equal = candidates.iter().filter(|c| {
                    candidate_name(c)
                        .map(|name| normalize_name(&name) == wanted)
                        .unwrap_or(false)
                });
                match (equal.next(), equal.next()) {
                    (Some(only), None) => Some(only),
                    _ => {
                        attempt.error = Some(format!("ambiguous: {n} candidates"));
                        None
                    }
                }
            }
            n => {
                attempt.error = Some(format!("ambiguous: {n} candidates"));
                None
            }
        };

        let Some(record) = chosen else {
            return StrategyResult {
                attempt,
                kind: Some(FailureKind::Ambiguous),
                resolved: None,
            };
        };

        match record_id(record, &self.id_field) {
            Some(id) => {
                attempt.success = true;
                StrategyResult {
                    attempt,
                    kind: None,
                    resolved: Some(ResolvedEntity {
                        id,
                        name: candidate_name(record),
                        strategy: kind.as_str().to_string(),
                    }),
                }
            }
            None => {
                attempt.error = Some(format!("candidate has no {} field", self.id_field));
                StrategyResult {
                    attempt,
                    kind: Some(FailureKind::NoMatch),
                    resolved: None,
                }
            }
        }
    }
}

fn candidate_name(record: &Value) -> Option<String> {
    record
        .get(NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
}
