//! OpenAI-compatible chat completions provider.
//!
//! Works against any endpoint speaking the `/chat/completions` wire format
//! (OpenAI, vLLM, llama.cpp server, most gateways). The HTTP client and its
//! connection pool are built once per provider and reused for the whole run.

use crate::config::ProviderConfig;
use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, FunctionCall, JsonSchema, MessageRole,
    PropertySchema, ToolCall, ToolDefinition, Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiToolCallFunction,
}

#[derive(Serialize, Deserialize, Clone)]
struct ApiToolCallFunction {
    name: String,
    // The wire format carries arguments as a JSON-encoded string.
    arguments: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct OpenAiProvider {
    http_client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> ModelResult<Self> {
        config
            .validate()
            .map_err(|msg| ModelError::InvalidConfig { message: msg })?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ModelError::Network)?;

        Ok(Self {
            http_client,
            config,
        })
    }

    fn completions_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    fn convert_message(msg: &ChatMessage) -> ApiMessage {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        ApiMessage {
            role: role.to_string(),
            content: msg.content.clone(),
            tool_calls: msg
                .requested_tool_calls()
                .iter()
                .map(|call| ApiToolCall {
                    id: call.id.clone(),
                    tool_type: "function".to_string(),
                    function: ApiToolCallFunction {
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    fn convert_tool_def(tool: &ToolDefinition) -> ApiTool {
        ApiTool {
            tool_type: "function".to_string(),
            function: ApiFunctionDef {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: Self::convert_schema_to_json(&tool.function.parameters),
            },
        }
    }

    fn convert_schema_to_json(schema: &JsonSchema) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "type".to_string(),
            serde_json::to_value(schema.schema_type)
                .unwrap_or(serde_json::Value::String("object".to_string())),
        );

        if let Some(properties) = &schema.properties {
            let mut props = serde_json::Map::new();
            for (name, prop) in properties {
                props.insert(name.clone(), Self::convert_property_to_json(prop));
            }
            obj.insert("properties".to_string(), serde_json::Value::Object(props));
        }

        if let Some(required) = &schema.required {
            obj.insert(
                "required".to_string(),
                serde_json::to_value(required).unwrap_or_default(),
            );
        }

        serde_json::Value::Object(obj)
    }

    fn convert_property_to_json(prop: &PropertySchema) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "type".to_string(),
            serde_json::to_value(prop.schema_type)
                .unwrap_or(serde_json::Value::String("string".to_string())),
        );

        if let Some(description) = &prop.description {
            obj.insert(
                "description".to_string(),
                serde_json::Value::String(description.clone()),
            );
        }

        if let Some(items) = &prop.items {
            obj.insert("items".to_string(), Self::convert_property_to_json(items));
        }

        serde_json::Value::Object(obj)
    }

    fn convert_response(response: ApiResponse) -> ModelResult<ChatResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedResponse {
                message: "response contained no choices".to_string(),
            })?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
                    ModelError::MalformedResponse {
                        message: format!(
                            "tool call '{}' carried undecodable arguments: {}",
                            call.function.name, e
                        ),
                    }
                })?;
                Ok(ToolCall {
                    id: call.id,
                    function: FunctionCall {
                        name: call.function.name,
                        arguments,
                    },
                })
            })
            .collect::<ModelResult<_>>()?;

        let message = if tool_calls.is_empty() {
            ChatMessage::assistant(choice.message.content.unwrap_or_default())
        } else {
            ChatMessage::assistant_with_tools(choice.message.content, tool_calls)
        };

        let finish_reason = choice.finish_reason.as_deref().and_then(|r| match r {
            "stop" => Some(FinishReason::Stop),
            "tool_calls" => Some(FinishReason::ToolCalls),
            "length" => Some(FinishReason::Length),
            "content_filter" => Some(FinishReason::ContentFilter),
            _ => None,
        });

        Ok(ChatResponse {
            message,
            finish_reason,
            usage: response
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse> {
        let api_request = ApiRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            tools: request
                .tools
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .map(Self::convert_tool_def)
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let mut builder = self
            .http_client
            .post(self.completions_url())
            .json(&api_request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(self.config.timeout)
            } else {
                ModelError::Network(e)
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ModelError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::MalformedResponse {
                    message: format!("undecodable completion body: {}", e),
                })?;

        Self::convert_response(body)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}
