//! Multi-trial statistical aggregation.
//!
//! Reduces noisy per-trial outcomes into per-case pass-rate estimates with
//! Wilson score intervals, then applies thresholds and the optional cost
//! ceiling to produce the release gate decision. The Wilson interval stays
//! honest at pass rates near 0 or 1 with small N, where a symmetric normal
//! interval collapses.

use crate::case::{CompiledCase, ConfigError};
use crate::orchestrator::TrialResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Critical z value for a two-sided interval at the given confidence level.
/// Only the standard levels are supported; anything else is a config error.
pub fn z_for_confidence(level: f64) -> Result<f64, ConfigError> {
    let centi = (level * 100.0).round() as i64;
    match centi {
        80 => Ok(1.282),
        90 => Ok(1.645),
        95 => Ok(1.960),
        99 => Ok(2.576),
        _ => Err(ConfigError::UnsupportedConfidenceLevel { level }),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

impl ConfidenceInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Wilson score interval for a binomial proportion.
pub fn wilson_interval(passed: usize, trials: usize, level: f64, z: f64) -> ConfidenceInterval {
    if trials == 0 {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 1.0,
            level,
        };
    }

    let n = trials as f64;
    let p = passed as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let margin = (z * ((p * (1.0 - p) / n) + (z2 / (4.0 * n * n))).sqrt()) / denom;

    ConfidenceInterval {
        lower: (center - margin).max(0.0),
        upper: (center + margin).min(1.0),
        level,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStatistic {
    pub case_id: String,
    pub trials: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub interval: ConfidenceInterval,
    /// Set when the case is non-deterministic (some trials pass, some
    /// fail) and enough trials ran for the signal to mean something.
    pub high_variance: bool,
    pub threshold: f64,
    pub required: bool,
    pub total_cost_usd: f64,
    pub total_latency: Duration,
}

/// Which quantity is compared against a case's pass threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdRule {
    /// Compare the observed pass rate. The default: N = 1 behaves exactly
    /// like a single gating run.
    #[default]
    PointEstimate,
    /// Compare the Wilson lower bound: stricter, demands statistical
    /// confidence that the true rate clears the threshold.
    IntervalLowerBound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub threshold_rule: ThresholdRule,
    pub cost_ceiling_usd: Option<f64>,
    /// Minimum trial count before the high-variance flag is meaningful.
    pub min_variance_trials: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold_rule: ThresholdRule::default(),
            cost_ceiling_usd: None,
            min_variance_trials: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseFailure {
    pub case_id: String,
    pub pass_rate: f64,
    pub threshold: f64,
    /// Distinct reasons observed across the case's failing trials.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    /// Every failing required case, never just the first.
    pub failing_cases: Vec<CaseFailure>,
    pub cost_ceiling_exceeded: bool,
    pub total_cost_usd: f64,
    pub total_latency: Duration,
}

/// Reduce per-trial results to per-case statistics and the gate decision.
///
/// `trials` may arrive in any completion order. A case's N always equals
/// its configured trial count: trials that failed to produce a verdict
/// count as non-passing, never as missing data.
pub fn aggregate(
    cases: &[CompiledCase],
    trials: &[TrialResult],
    config: &GateConfig,
    confidence_level: f64,
) -> Result<(Vec<CaseStatistic>, GateDecision), ConfigError> {
    let z = z_for_confidence(confidence_level)?;

    let mut by_case: HashMap<&str, Vec<&TrialResult>> = HashMap::new();
    for trial in trials {
        by_case.entry(trial.case_id.as_str()).or_default().push(trial);
    }

    let mut statistics = Vec::with_capacity(cases.len());
    let mut failing_cases = Vec::new();
    let mut total_cost_usd = 0.0;
    let mut total_latency = Duration::ZERO;

    for case in cases {
        let case_trials = by_case.remove(case.spec.id.as_str()).unwrap_or_default();
        let n = case.spec.trials as usize;
        let passed = case_trials.iter().filter(|t| t.passed).count();
        let pass_rate = passed as f64 / n as f64;
        let interval = wilson_interval(passed, n, confidence_level, z);

        let cost: f64 = case_trials.iter().map(|t| t.cost_usd).sum();
        let latency: Duration = case_trials.iter().map(|t| t.latency).sum();
        total_cost_usd += cost;
        total_latency += latency;

        let high_variance =
            pass_rate > 0.0 && pass_rate < 1.0 && n >= config.min_variance_trials;

        let effective = match config.threshold_rule {
            ThresholdRule::PointEstimate => pass_rate,
            ThresholdRule::IntervalLowerBound => interval.lower,
        };

        if case.spec.required && effective < case.spec.threshold {
            let mut reasons = Vec::new();
            for trial in case_trials.iter().filter(|t| !t.passed) {
                for summary in trial.verdict.failure_summaries() {
                    if !reasons.contains(&summary) {
                        reasons.push(summary);
                    }
                }
            }
            failing_cases.push(CaseFailure {
                case_id: case.spec.id.clone(),
                pass_rate,
                threshold: case.spec.threshold,
                reasons,
            });
        }

        statistics.push(CaseStatistic {
            case_id: case.spec.id.clone(),
            trials: n,
            passed,
            pass_rate,
            interval,
            high_variance,
            threshold: case.spec.threshold,
            required: case.spec.required,
            total_cost_usd: cost,
            total_latency: latency,
        });
    }

    let cost_ceiling_exceeded = config
        .cost_ceiling_usd
        .map(|ceiling| total_cost_usd > ceiling)
        .unwrap_or(false);

    let passed = failing_cases.is_empty() && !cost_ceiling_exceeded;
    info!(
        passed,
        failing = failing_cases.len(),
        total_cost_usd,
        "gate decision"
    );

    Ok((
        statistics,
        GateDecision {
            passed,
            failing_cases,
            cost_ceiling_exceeded,
            total_cost_usd,
            total_latency,
        },
    ))
}
