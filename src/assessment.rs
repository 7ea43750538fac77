//! Go/no-go release gate computed from run totals.
use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::model::{ImportRun, ResolutionCounts, ValidationCounts};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub entity_resolution_rate: f64,
    pub validation_rate: f64,
    pub overall_success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub metrics: Metrics,
    pub thresholds: Thresholds,
    pub can_proceed: bool,
    pub recommendations: Vec<String>,
}

impl Assessment {
    pub fn verdict(&self) -> &'static str {
        if self.can_proceed {
            "GO"
        } else {
            "NO-GO"
        }
    }
}

/// Inputs the calculator reads from a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssessmentInput {
    pub entity_resolution: ResolutionCounts,
    pub validation: ValidationCounts,
    /// Events created (live) or that would have been created (dry run).
    pub created: u64,
    pub total: u64,
}

impl AssessmentInput {
    /// A dry run's would-be creations stand in for creations so that dry
    /// and live assessments are comparable. Updates count in neither mode.
    pub fn from_run(run: &ImportRun) -> Self {
        Self {
            entity_resolution: run.entity_resolution,
            validation: run.validation,
            created: run.totals.tt_events.created + run.totals.tt_events.simulated,
            total: run.totals.btc_events.total,
        }
    }
}

/// `numerator / denominator`, with an empty denominator yielding 0.
pub fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn assess(input: &AssessmentInput, thresholds: &Thresholds) -> Assessment {
    let res = input.entity_resolution;
    let val = input.validation;
    let metrics = Metrics {
        entity_resolution_rate: rate(res.success, res.success + res.failure),
        validation_rate: rate(val.valid, val.valid + val.invalid),
        overall_success_rate: rate(input.created, input.total),
    };

    let checks = [
        (
            "Entity resolution rate",
            metrics.entity_resolution_rate,
            thresholds.minimum_resolution_rate,
            "map unresolved organizers to destination records (btcId, name or email) before a live run",
        ),
        (
            "Validation rate",
            metrics.validation_rate,
            thresholds.minimum_validation_rate,
            "fix source events missing title, start time, organizer or location",
        ),
        (
            "Overall success rate",
            metrics.overall_success_rate,
            thresholds.minimum_overall_rate,
            "review failed and skipped events in the run report",
        ),
    ];

    let recommendations: Vec<String> = checks
        .iter()
        .filter(|(_, value, minimum, _)| value < minimum)
        .map(|(label, value, minimum, fix)| {
            format!(
                "{label} {:.1}% is below the {:.1}% minimum (shortfall {:.1} points): {fix}",
                value * 100.0,
                minimum * 100.0,
                (minimum - value) * 100.0
            )
        })
        .collect();

    Assessment {
        metrics,
        thresholds: *thresholds,
        can_proceed: recommendations.is_empty(),
        recommendations,
    }
}

pub fn assess_run(run: &ImportRun, thresholds: &Thresholds) -> Assessment {
    assess(&AssessmentInput::from_run(run), thresholds)
}
