use async_trait::async_trait;
use model::types::{FunctionDefinition, JsonSchema, ToolDefinition};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ToolResult<T> = Result<T, ToolError>;

/// One executable tool. `execute` takes `&self` so calls within the same
/// assistant turn can run concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, args: Value) -> ToolResult<Value>;
    fn name(&self) -> &str;
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get_tool(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn list_tools(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Definitions for a case's declared tool set, in declaration order.
    /// Unknown names are skipped; the case fails later through the model's
    /// inability to call them, not through a registry panic.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> ToolResult<Value> {
        match self.tools.get(name) {
            Some(tool) => tool.execute(args).await,
            None => Err(ToolError::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic scripted tool for CI runs that never touch real systems.
///
/// Responds with a fixed output, or with the first argument-matched
/// response when any are registered. A scripted error exercises the
/// model-sees-tool-failure path.
pub struct FixtureTool {
    definition: ToolDefinition,
    default_response: Option<Value>,
    matched_responses: Vec<(Value, Value)>,
    scripted_error: Option<String>,
}

impl FixtureTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonSchema,
    ) -> Self {
        Self {
            definition: ToolDefinition {
                function: FunctionDefinition {
                    name: name.into(),
                    description: description.into(),
                    parameters,
                },
            },
            default_response: None,
            matched_responses: Vec::new(),
            scripted_error: None,
        }
    }

    pub fn responding(mut self, response: Value) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Respond with `response` when the call arguments equal `args` exactly.
    pub fn responding_to(mut self, args: Value, response: Value) -> Self {
        self.matched_responses.push((args, response));
        self
    }

    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.scripted_error = Some(message.into());
        self
    }
}

#[async_trait]
impl Tool for FixtureTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, args: Value) -> ToolResult<Value> {
        if let Some(message) = &self.scripted_error {
            return Err(ToolError::ExecutionFailed {
                message: message.clone(),
            });
        }

        for (expected, response) in &self.matched_responses {
            if *expected == args {
                return Ok(response.clone());
            }
        }

        self.default_response
            .clone()
            .ok_or_else(|| ToolError::InvalidArguments {
                message: format!(
                    "no fixture response registered for arguments: {}",
                    args
                ),
            })
    }

    fn name(&self) -> &str {
        &self.definition.function.name
    }
}
