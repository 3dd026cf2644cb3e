//! Agent test execution engine.
//!
//! Runs a declared agent against a dataset of cases, observes multi-turn
//! tool-calling behavior, checks outputs against declarative invariants,
//! and aggregates repeated trials into a pass/fail release decision.

pub mod case;
pub mod driver;
pub mod evaluator;
pub mod expr;
pub mod orchestrator;
pub mod stats;
pub mod tools;

pub use case::{compile_cases, CaseSpec, CompiledCase, ConfigError, OutputContract};
pub use driver::{
    Conversation, ConversationDriver, ConversationOutcome, DriverConfig, FailureReason, Transcript,
};
pub use evaluator::{evaluate, validate_schema, CaseVerdict, InvariantOutcome};
pub use expr::{compile, Context, EvalError, Invariant, ParseError};
pub use orchestrator::{
    CancelHandle, RunConfig, RunResult, TrialOrchestrator, TrialResult,
};
pub use stats::{
    aggregate, wilson_interval, z_for_confidence, CaseFailure, CaseStatistic, ConfidenceInterval,
    GateConfig, GateDecision, ThresholdRule,
};
pub use tools::{FixtureTool, Tool, ToolError, ToolRegistry, ToolResult};
