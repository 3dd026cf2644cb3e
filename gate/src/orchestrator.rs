//! Concurrent execution of M cases x N trials.
//!
//! Every (case, trial) pair is one independent unit: it builds its own
//! conversation driver, runs to a terminal state, and yields exactly one
//! `TrialResult`. Units share nothing but the provider handle, the tool
//! registry, and the per-provider rate limiter. A unit failing — provider
//! error, timeout, tool explosion — never cancels its siblings; run-level
//! cancellation resolves every outstanding unit as `Failed(Cancelled)`.

use crate::case::{CompiledCase, ConfigError};
use crate::driver::{
    Conversation, ConversationDriver, ConversationOutcome, DriverConfig, FailureReason,
};
use crate::evaluator::{self, CaseVerdict};
use crate::stats::{self, CaseStatistic, GateConfig, GateDecision};
use crate::tools::ToolRegistry;
use chrono::{DateTime, Utc};
use model::provider::ModelProvider;
use model::types::Usage;
use model::{CostModel, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one (case_id, trial_index) unit. Produced exactly once per
/// pair, in arbitrary completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub case_id: String,
    pub trial_index: u32,
    pub conversation: Conversation,
    pub outcome: ConversationOutcome,
    pub verdict: CaseVerdict,
    pub passed: bool,
    pub usage: Usage,
    pub latency: Duration,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Global bound on concurrently executing (case, trial) units.
    pub concurrency: usize,
    pub confidence_level: f64,
    pub driver: DriverConfig,
    pub gate: GateConfig,
    pub cost: CostModel,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            confidence_level: 0.95,
            driver: DriverConfig::default(),
            gate: GateConfig::default(),
            cost: CostModel::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        stats::z_for_confidence(self.confidence_level)?;
        Ok(())
    }
}

/// Everything a run produces, for external reporters: all trials, all
/// per-case statistics, and the gate decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trials: Vec<TrialResult>,
    pub statistics: Vec<CaseStatistic>,
    pub decision: GateDecision,
}

/// Cancels a run from outside; safe to clone and to call more than once.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct TrialOrchestrator {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    limiter: Arc<RateLimiter>,
    config: RunConfig,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl TrialOrchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        limiter: Arc<RateLimiter>,
        config: RunConfig,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            provider,
            tools,
            limiter,
            config,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Run every (case, trial) unit to completion and aggregate the
    /// results. Configuration problems surface here, before any provider
    /// call is made.
    pub async fn run(&self, cases: Vec<CompiledCase>) -> Result<RunResult, ConfigError> {
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total_units: usize = cases.iter().map(|c| c.spec.trials as usize).sum();
        info!(
            %run_id,
            cases = cases.len(),
            units = total_units,
            concurrency = self.config.concurrency,
            "starting run"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let cases: Vec<Arc<CompiledCase>> = cases.into_iter().map(Arc::new).collect();

        let mut join_set = JoinSet::new();
        let mut expected: Vec<(String, u32)> = Vec::with_capacity(total_units);

        for case in &cases {
            for trial_index in 0..case.spec.trials {
                expected.push((case.spec.id.clone(), trial_index));

                let case = Arc::clone(case);
                let semaphore = Arc::clone(&semaphore);
                let driver = ConversationDriver::new(
                    Arc::clone(&self.provider),
                    Arc::clone(&self.tools),
                    Arc::clone(&self.limiter),
                    self.config.driver.clone(),
                );
                let cost = self.config.cost;
                let mut cancel_rx = self.cancel_rx.clone();

                join_set.spawn(async move {
                    tokio::select! {
                        _ = wait_for_cancel(&mut cancel_rx) => {
                            debug!(case_id = %case.spec.id, trial_index, "unit cancelled");
                            cancelled_result(&case, trial_index)
                        }
                        result = run_unit(driver, case.clone(), trial_index, semaphore, cost) => result,
                    }
                });
            }
        }

        let mut by_key: HashMap<(String, u32), TrialResult> = HashMap::with_capacity(total_units);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    by_key.insert((result.case_id.clone(), result.trial_index), result);
                }
                Err(error) => {
                    // A panicked unit is filled in below from the expected
                    // cover; it is never silently dropped.
                    warn!(%error, "trial unit aborted");
                }
            }
        }

        let mut trials = Vec::with_capacity(total_units);
        for key in expected {
            match by_key.remove(&key) {
                Some(result) => trials.push(result),
                None => {
                    let case = cases
                        .iter()
                        .find(|c| c.spec.id == key.0)
                        .expect("expected key always references a known case");
                    trials.push(cancelled_result(case, key.1));
                }
            }
        }
        debug_assert_eq!(trials.len(), total_units);

        let (statistics, decision) = stats::aggregate(
            &cases.iter().map(|c| (**c).clone()).collect::<Vec<_>>(),
            &trials,
            &self.config.gate,
            self.config.confidence_level,
        )?;

        Ok(RunResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            trials,
            statistics,
            decision,
        })
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone: the orchestrator is being torn down.
            return;
        }
    }
}

async fn run_unit(
    driver: ConversationDriver,
    case: Arc<CompiledCase>,
    trial_index: u32,
    semaphore: Arc<Semaphore>,
    cost: CostModel,
) -> TrialResult {
    let _permit = semaphore
        .acquire()
        .await
        .expect("run semaphore is never closed");

    debug!(case_id = %case.spec.id, trial_index, "unit started");
    let transcript = driver.run(&case).await;
    let verdict = evaluator::evaluate(&case, &transcript);
    let passed = verdict.passed;

    TrialResult {
        case_id: case.spec.id.clone(),
        trial_index,
        conversation: transcript.conversation,
        outcome: transcript.outcome,
        verdict,
        passed,
        usage: transcript.usage,
        latency: transcript.latency,
        cost_usd: cost.cost_of(transcript.usage),
    }
}

fn cancelled_result(case: &CompiledCase, trial_index: u32) -> TrialResult {
    TrialResult {
        case_id: case.spec.id.clone(),
        trial_index,
        conversation: Conversation::default(),
        outcome: ConversationOutcome::Failed {
            reason: FailureReason::Cancelled,
        },
        verdict: CaseVerdict {
            passed: false,
            schema_valid: false,
            schema_violation: None,
            failure: Some(FailureReason::Cancelled),
            invariants: Vec::new(),
            output_length: None,
        },
        passed: false,
        usage: Usage::default(),
        latency: Duration::ZERO,
        cost_usd: 0.0,
    }
}
