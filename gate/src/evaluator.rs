//! Output-contract checking for terminal transcripts.
//!
//! Check order: terminal failure short-path, then structural schema
//! validation, then every invariant. Invariants never short-circuit each
//! other — all outcomes are reported so a failing case explains itself.

use crate::case::CompiledCase;
use crate::driver::{FailureReason, Transcript};
use crate::expr::Context;
use model::types::{JsonSchema, PropertySchema, SchemaType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantOutcome {
    pub source: String,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseVerdict {
    pub passed: bool,
    pub schema_valid: bool,
    pub schema_violation: Option<String>,
    /// Terminal failure of the conversation, when it never completed.
    pub failure: Option<FailureReason>,
    pub invariants: Vec<InvariantOutcome>,
    /// Character count of the raw final output, when the conversation
    /// completed.
    pub output_length: Option<usize>,
}

impl CaseVerdict {
    /// Human-readable reasons for a non-passing verdict, one per problem.
    pub fn failure_summaries(&self) -> Vec<String> {
        let mut summaries = Vec::new();
        if let Some(reason) = &self.failure {
            summaries.push(format!("conversation failed: {}", reason));
        }
        if !self.schema_valid {
            match &self.schema_violation {
                Some(violation) => summaries.push(format!("schema mismatch: {}", violation)),
                None => summaries.push("schema mismatch".to_string()),
            }
        }
        for invariant in &self.invariants {
            if !invariant.passed {
                match &invariant.error {
                    Some(error) => summaries.push(format!(
                        "invariant `{}` errored: {}",
                        invariant.source, error
                    )),
                    None => summaries.push(format!("invariant `{}` failed", invariant.source)),
                }
            }
        }
        summaries
    }
}

/// Apply a case's output contract to its terminal transcript.
pub fn evaluate(case: &CompiledCase, transcript: &Transcript) -> CaseVerdict {
    let final_text = match &transcript.outcome {
        crate::driver::ConversationOutcome::Completed { final_text } => final_text,
        crate::driver::ConversationOutcome::Failed { reason } => {
            return CaseVerdict {
                passed: false,
                schema_valid: false,
                schema_violation: None,
                failure: Some(reason.clone()),
                invariants: Vec::new(),
                output_length: None,
            };
        }
    };

    let parsed_output: Option<Value> = serde_json::from_str(final_text.trim()).ok();

    let (schema_valid, schema_violation) = match &case.spec.contract.schema {
        None => (true, None),
        Some(schema) => match &parsed_output {
            Some(value) => match validate_schema(value, schema) {
                Ok(()) => (true, None),
                Err(violation) => (false, Some(violation)),
            },
            None => (
                false,
                Some("final output is not valid JSON".to_string()),
            ),
        },
    };

    let context = build_context(transcript, final_text, parsed_output);
    let invariants: Vec<InvariantOutcome> = case
        .invariants
        .iter()
        .map(|invariant| match invariant.evaluate(&context) {
            Ok(passed) => InvariantOutcome {
                source: invariant.source().to_string(),
                passed,
                error: None,
            },
            Err(error) => InvariantOutcome {
                source: invariant.source().to_string(),
                passed: false,
                error: Some(error.to_string()),
            },
        })
        .collect();

    let passed = schema_valid && invariants.iter().all(|i| i.passed);
    debug!(
        case_id = %case.spec.id,
        passed,
        schema_valid,
        invariants = invariants.len(),
        "case evaluated"
    );

    CaseVerdict {
        passed,
        schema_valid,
        schema_violation,
        failure: None,
        invariants,
        output_length: Some(final_text.chars().count()),
    }
}

/// Assemble the read-only context invariants evaluate against.
fn build_context(transcript: &Transcript, final_text: &str, parsed: Option<Value>) -> Context {
    let mut output = json!({
        "text": final_text,
        "length": final_text.chars().count(),
    });
    if let Some(parsed) = parsed {
        output["json"] = parsed;
    }

    let calls: Vec<Value> = transcript
        .conversation
        .tool_calls()
        .iter()
        .map(|call| {
            json!({
                "name": call.function.name,
                "arguments": call.function.arguments,
            })
        })
        .collect();
    let names: Vec<Value> = transcript
        .conversation
        .tool_calls()
        .iter()
        .map(|call| Value::String(call.function.name.clone()))
        .collect();

    Context::new()
        .with("output", output)
        .with(
            "tools",
            json!({
                "count": calls.len(),
                "names": names,
                "calls": calls,
            }),
        )
        .with(
            "usage",
            json!({
                "prompt_tokens": transcript.usage.prompt_tokens,
                "completion_tokens": transcript.usage.completion_tokens,
                "total_tokens": transcript.usage.total_tokens,
            }),
        )
        .with("turns", json!(transcript.conversation.turn_count()))
}

/// Structural validation of a value against a declared schema.
pub fn validate_schema(value: &Value, schema: &JsonSchema) -> Result<(), String> {
    if !type_matches(schema.schema_type, value) {
        return Err(format!(
            "expected {:?} at $, found {}",
            schema.schema_type,
            json_type_name(value)
        ));
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = &schema.required {
            for key in required {
                if !object.contains_key(key) {
                    return Err(format!("missing required property `{}`", key));
                }
            }
        }
        if let Some(properties) = &schema.properties {
            for (key, property) in properties {
                if let Some(child) = object.get(key) {
                    validate_property(child, property, key)?;
                }
            }
        }
    }

    Ok(())
}

fn validate_property(value: &Value, property: &PropertySchema, path: &str) -> Result<(), String> {
    if !type_matches(property.schema_type, value) {
        return Err(format!(
            "expected {:?} at `{}`, found {}",
            property.schema_type,
            path,
            json_type_name(value)
        ));
    }
    if let (Some(items), Some(array)) = (&property.items, value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            validate_property(item, items, &format!("{}[{}]", path, i))?;
        }
    }
    Ok(())
}

fn type_matches(schema_type: SchemaType, value: &Value) -> bool {
    match schema_type {
        SchemaType::Object => value.is_object(),
        SchemaType::String => value.is_string(),
        SchemaType::Number => value.is_number(),
        SchemaType::Integer => value.as_f64().map(|n| n.fract() == 0.0).unwrap_or(false),
        SchemaType::Boolean => value.is_boolean(),
        SchemaType::Array => value.is_array(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
