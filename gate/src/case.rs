//! Case and contract data model.
//!
//! Cases arrive from an external bundle loader, already parsed into these
//! structures. `CaseSpec::compile` is the engine's admission gate: every
//! invariant must compile and every numeric knob must be sane before a
//! single provider call is made.

use crate::expr::{compile, Invariant, ParseError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use model::types::JsonSchema;

/// Fatal configuration problems, detected before execution starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("case `{case_id}`: trial count must be at least 1")]
    ZeroTrials { case_id: String },

    #[error("case `{case_id}`: max_turns must be at least 1")]
    ZeroMaxTurns { case_id: String },

    #[error("case `{case_id}`: pass threshold {threshold} is outside [0.0, 1.0]")]
    InvalidThreshold { case_id: String, threshold: f64 },

    #[error("case `{case_id}`: invariant failed to compile: {error}")]
    InvalidInvariant {
        case_id: String,
        #[source]
        error: ParseError,
    },

    #[error("duplicate case id `{case_id}`")]
    DuplicateCase { case_id: String },

    #[error("unsupported confidence level {level}; supported levels are 0.80, 0.90, 0.95, 0.99")]
    UnsupportedConfidenceLevel { level: f64 },

    #[error("concurrency bound must be at least 1")]
    ZeroConcurrency,
}

/// What a case's final output must satisfy: an optional structural schema
/// plus invariant expressions over the output context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputContract {
    pub schema: Option<JsonSchema>,
    pub invariants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSpec {
    pub id: String,
    pub system_prompt: Option<String>,
    pub user_messages: Vec<String>,
    /// Names into the run's tool registry; definitions are resolved at
    /// driver start.
    pub tool_names: Vec<String>,
    pub contract: OutputContract,
    /// Minimum pass rate for the gate. 1.0 preserves single-trial
    /// semantics when trials == 1.
    pub threshold: f64,
    pub trials: u32,
    pub max_turns: u32,
    pub timeout: Duration,
    /// Non-required cases are measured and reported but never block the gate.
    pub required: bool,
}

impl CaseSpec {
    pub fn new(id: impl Into<String>, initial_message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: None,
            user_messages: vec![initial_message.into()],
            tool_names: Vec::new(),
            contract: OutputContract::default(),
            threshold: 1.0,
            trials: 1,
            max_turns: 10,
            timeout: Duration::from_secs(120),
            required: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, names: Vec<String>) -> Self {
        self.tool_names = names;
        self
    }

    pub fn with_schema(mut self, schema: JsonSchema) -> Self {
        self.contract.schema = Some(schema);
        self
    }

    pub fn with_invariant(mut self, source: impl Into<String>) -> Self {
        self.contract.invariants.push(source.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_trials(mut self, trials: u32) -> Self {
        self.trials = trials;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Validate the spec and compile its invariants.
    pub fn compile(self) -> Result<CompiledCase, ConfigError> {
        if self.trials == 0 {
            return Err(ConfigError::ZeroTrials { case_id: self.id });
        }
        if self.max_turns == 0 {
            return Err(ConfigError::ZeroMaxTurns { case_id: self.id });
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::InvalidThreshold {
                case_id: self.id,
                threshold: self.threshold,
            });
        }

        let invariants = self
            .contract
            .invariants
            .iter()
            .map(|source| {
                compile(source).map_err(|error| ConfigError::InvalidInvariant {
                    case_id: self.id.clone(),
                    error,
                })
            })
            .collect::<Result<Vec<Invariant>, ConfigError>>()?;

        Ok(CompiledCase {
            spec: self,
            invariants,
        })
    }
}

/// A validated case with its invariants compiled once, shared read-only
/// across all of the case's trials.
#[derive(Debug, Clone)]
pub struct CompiledCase {
    pub spec: CaseSpec,
    pub invariants: Vec<Invariant>,
}

/// Compile a whole dataset, rejecting duplicates up front.
pub fn compile_cases(specs: Vec<CaseSpec>) -> Result<Vec<CompiledCase>, ConfigError> {
    let mut seen = HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.id.clone()) {
            return Err(ConfigError::DuplicateCase {
                case_id: spec.id.clone(),
            });
        }
    }
    specs.into_iter().map(CaseSpec::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_defaults() {
        let case = CaseSpec::new("smoke", "Say hello");
        assert_eq!(case.threshold, 1.0);
        assert_eq!(case.trials, 1);
        assert!(case.required);
        assert!(case.contract.invariants.is_empty());
    }

    #[test]
    fn test_compile_accepts_valid_case() {
        let compiled = CaseSpec::new("ok", "hi")
            .with_invariant("output.length < 500")
            .with_trials(5)
            .with_threshold(0.8)
            .compile()
            .unwrap();
        assert_eq!(compiled.invariants.len(), 1);
        assert_eq!(compiled.spec.trials, 5);
    }

    #[test]
    fn test_zero_trials_rejected() {
        let result = CaseSpec::new("bad", "hi").with_trials(0).compile();
        assert!(matches!(result, Err(ConfigError::ZeroTrials { .. })));
    }

    #[test]
    fn test_threshold_bounds_rejected() {
        let result = CaseSpec::new("bad", "hi").with_threshold(1.5).compile();
        assert!(matches!(result, Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn test_bad_invariant_rejected() {
        let result = CaseSpec::new("bad", "hi")
            .with_invariant("output.length <")
            .compile();
        assert!(matches!(result, Err(ConfigError::InvalidInvariant { .. })));
    }

    #[test]
    fn test_duplicate_case_ids_rejected() {
        let result = compile_cases(vec![
            CaseSpec::new("dup", "one"),
            CaseSpec::new("dup", "two"),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateCase { .. })));
    }
}
