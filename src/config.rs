//! Configuration loader and validator for the BTC import engine.
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::Collection;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Invalid date range: end {end} is before start {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

static DATE_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub btc: Btc,
    pub destination: Destination,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub assessment: Thresholds,
    #[serde(default)]
    pub import: Import,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub results_dir: String,
    /// Delay between successive destination-mutating calls.
    #[serde(default)]
    pub throttle_ms: u64,
}

/// Source calendar (BTC) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Btc {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
}

/// Destination (TT) store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub api_base_url: String,
    #[serde(default)]
    pub admin_base_url: Option<String>,
    #[serde(default)]
    pub token: String,
    /// Tenant/application identifier stamped on imported records.
    pub app_id: String,
    /// Direct-store fallback (SQLite URL). Absent disables the fallback.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Logical collection name -> physical table name.
    #[serde(default)]
    pub collections: BTreeMap<String, String>,
    /// Retry a tenant-scoped direct-store query without the tenant filter
    /// when it returns zero rows.
    #[serde(default = "default_true")]
    pub widen_tenant_filter: bool,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_version_field")]
    pub version_field: String,
}

/// Entity-resolution parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    #[serde(default = "default_strategy_order")]
    pub strategies: Vec<StrategyKind>,
    /// Fuzzy queries shorter than this are recorded as failed attempts.
    #[serde(default = "default_fuzzy_min_len")]
    pub fuzzy_min_len: usize,
    /// When a fuzzy lookup yields several candidates, accept the single one
    /// whose normalized name equals the normalized query.
    #[serde(default = "default_true")]
    pub fuzzy_normalized_tiebreak: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ExactId,
    ExactName,
    FuzzyName,
    Email,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ExactId => "exact_id",
            StrategyKind::ExactName => "exact_name",
            StrategyKind::FuzzyName => "fuzzy_name",
            StrategyKind::Email => "email",
        }
    }
}

/// Go/no-go thresholds, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default = "default_min_resolution", alias = "minimum_resolution_rate")]
    pub minimum_resolution_rate: f64,
    #[serde(default = "default_min_validation", alias = "minimum_validation_rate")]
    pub minimum_validation_rate: f64,
    #[serde(default = "default_min_overall", alias = "minimum_overall_rate")]
    pub minimum_overall_rate: f64,
}

/// Import behavior toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Import {
    /// Update destination events that already exist instead of skipping them.
    #[serde(default)]
    pub update_existing: bool,
}

fn default_true() -> bool {
    true
}

fn default_id_field() -> String {
    "_id".into()
}

fn default_version_field() -> String {
    "__v".into()
}

fn default_strategy_order() -> Vec<StrategyKind> {
    vec![
        StrategyKind::ExactId,
        StrategyKind::ExactName,
        StrategyKind::FuzzyName,
        StrategyKind::Email,
    ]
}

fn default_fuzzy_min_len() -> usize {
    3
}

fn default_min_resolution() -> f64 {
    0.90
}

fn default_min_validation() -> f64 {
    0.95
}

fn default_min_overall() -> f64 {
    0.85
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            strategies: default_strategy_order(),
            fuzzy_min_len: default_fuzzy_min_len(),
            fuzzy_normalized_tiebreak: true,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            minimum_resolution_rate: default_min_resolution(),
            minimum_validation_rate: default_min_validation(),
            minimum_overall_rate: default_min_overall(),
        }
    }
}

impl Config {
    /// Ensure the results directory exists.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.results_dir)
    }

    pub fn results_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.results_dir)
    }

    /// Physical table name for a logical collection. Falls back to the
    /// logical name when the mapping has no entry.
    pub fn physical_name(&self, collection: Collection) -> String {
        self.destination
            .collections
            .get(collection.as_str())
            .cloned()
            .unwrap_or_else(|| collection.as_str().to_string())
    }

    /// Apply credential overrides (e.g. from `AUTH_TOKEN`) and require that
    /// the destination credential is present.
    pub fn with_credentials(
        mut self,
        auth_token: Option<String>,
        btc_token: Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(token) = auth_token.filter(|t| !t.trim().is_empty()) {
            self.destination.token = token;
        }
        if let Some(token) = btc_token.filter(|t| !t.trim().is_empty()) {
            self.btc.token = token;
        }
        if self.destination.token.trim().is_empty() {
            return Err(ConfigError::MissingCredential(
                "destination token (set AUTH_TOKEN or destination.token)",
            ));
        }
        Ok(self)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.results_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.results_dir must be non-empty"));
    }
    if cfg.btc.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("btc.base_url must be non-empty"));
    }
    if cfg.destination.api_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "destination.api_base_url must be non-empty",
        ));
    }
    if cfg.destination.app_id.trim().is_empty() {
        return Err(ConfigError::Invalid("destination.app_id must be non-empty"));
    }
    if cfg.destination.id_field.trim().is_empty() {
        return Err(ConfigError::Invalid("destination.id_field must be non-empty"));
    }
    for logical in cfg.destination.collections.keys() {
        if Collection::parse(logical).is_none() {
            return Err(ConfigError::Invalid(
                "destination.collections has an unknown logical collection",
            ));
        }
    }
    if cfg.resolution.strategies.is_empty() {
        return Err(ConfigError::Invalid("resolution.strategies must be non-empty"));
    }
    let t = &cfg.assessment;
    for rate in [
        t.minimum_resolution_rate,
        t.minimum_validation_rate,
        t.minimum_overall_rate,
    ] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Invalid(
                "assessment thresholds must be within [0, 1]",
            ));
        }
    }
    Ok(())
}

/// Parse a `YYYY-MM-DD` date, rejecting anything else.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ConfigError> {
    let raw = raw.trim();
    if !DATE_SHAPE.is_match(raw) {
        return Err(ConfigError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ConfigError::InvalidDate(raw.to_string()))
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  results_dir: "./results"
  throttle_ms: 250

btc:
  base_url: "https://btc.example.org/api/"
  token: ""

destination:
  api_base_url: "https://tt.example.org/api/"
  admin_base_url: "https://tt.example.org/admin/api/"
  token: ""
  app_id: "tt-calendar"
  database_url: "sqlite://./data/tt.db"
  widen_tenant_filter: true
  id_field: "_id"
  version_field: "__v"
  collections:
    events: "Events"
    organizers: "Organizers"
    users: "Users"
    venues: "Venues"

resolution:
  strategies: [exact_id, exact_name, fuzzy_name, email]
  fuzzy_min_len: 3
  fuzzy_normalized_tiebreak: true

assessment:
  minimumResolutionRate: 0.90
  minimumValidationRate: 0.95
  minimumOverallRate: 0.85

import:
  update_existing: false
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.resolution.strategies.len(), 4);
        assert_eq!(cfg.assessment, Thresholds::default());
        assert_eq!(cfg.physical_name(Collection::Events), "Events");
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  results_dir: "./out"
btc:
  base_url: "http://btc"
destination:
  api_base_url: "http://tt"
  app_id: "app"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.throttle_ms, 0);
        assert_eq!(cfg.destination.id_field, "_id");
        assert_eq!(cfg.destination.version_field, "__v");
        assert!(cfg.destination.widen_tenant_filter);
        assert!(!cfg.import.update_existing);
        assert_eq!(cfg.physical_name(Collection::Organizers), "organizers");
        assert_eq!(cfg.assessment.minimum_resolution_rate, 0.90);
    }

    #[test]
    fn invalid_app_id() {
        let mut cfg = example_cfg();
        cfg.destination.app_id = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app_id")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_thresholds_and_collections() {
        let mut cfg = example_cfg();
        cfg.assessment.minimum_overall_rate = 1.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.destination
            .collections
            .insert("calendars".into(), "Calendars".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.resolution.strategies.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn credentials_are_required() {
        let cfg = example_cfg();
        let err = cfg.clone().with_credentials(None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(_)));

        let cfg = cfg
            .with_credentials(Some("secret".into()), Some("btc".into()))
            .unwrap();
        assert_eq!(cfg.destination.token, "secret");
        assert_eq!(cfg.btc.token, "btc");
    }

    #[test]
    fn parse_date_rejects_malformed_input() {
        assert_eq!(
            parse_date("2024-03-09").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );
        assert!(matches!(parse_date("2024-3-9"), Err(ConfigError::InvalidDate(_))));
        assert!(matches!(parse_date("2024-02-30"), Err(ConfigError::InvalidDate(_))));
        assert!(matches!(parse_date("09/03/2024"), Err(ConfigError::InvalidDate(_))));
    }

    #[test]
    fn ensure_dirs_creates_results_dir() {
        let td = tempdir().unwrap();
        let results = td.path().join("results");
        let mut cfg = example_cfg();
        cfg.app.results_dir = results.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(results.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.destination.app_id, "tt-calendar");
    }
}
