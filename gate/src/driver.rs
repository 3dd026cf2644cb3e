//! Multi-turn tool-calling conversation driver.
//!
//! One driver instance runs one (case, trial) unit: it owns its
//! `Conversation` exclusively, walks the
//! `AwaitingModel -> ToolDispatch -> AwaitingModel` loop until a terminal
//! state, and emits a `Transcript` for the case evaluator. Turns are
//! strictly sequential; only tool executions inside a single turn run
//! concurrently.

use crate::case::CompiledCase;
use crate::tools::ToolRegistry;
use futures::future;
use model::provider::{ModelProvider, ModelResult};
use model::types::{ChatMessage, ChatRequest, ChatResponse, ToolCall, ToolDefinition, Usage};
use model::{RateLimiter, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ordered message history of one trial. Messages are append-only and the
/// turn count increases by exactly one per model exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    turn_count: u32,
}

impl Conversation {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Every tool call issued by the assistant, in issue order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.messages
            .iter()
            .flat_map(|m| m.requested_tool_calls())
            .collect()
    }

    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    MaxTurnsExceeded,
    Timeout,
    ProviderError(String),
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MaxTurnsExceeded => write!(f, "max turns exceeded"),
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::ProviderError(detail) => write!(f, "provider error: {}", detail),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConversationOutcome {
    Completed { final_text: String },
    Failed { reason: FailureReason },
}

impl ConversationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ConversationOutcome::Completed { .. })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            ConversationOutcome::Completed { .. } => None,
            ConversationOutcome::Failed { reason } => Some(reason),
        }
    }
}

/// Terminal record of one (case, trial) conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub conversation: Conversation,
    pub outcome: ConversationOutcome,
    pub usage: Usage,
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub retry: RetryPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.0),
            max_tokens: None,
            retry: RetryPolicy::default(),
        }
    }
}

enum DriverState {
    AwaitingModel,
    ToolDispatch(Vec<ToolCall>),
    Completed(String),
    Failed(FailureReason),
}

impl DriverState {
    fn name(&self) -> &'static str {
        match self {
            DriverState::AwaitingModel => "AwaitingModel",
            DriverState::ToolDispatch(_) => "ToolDispatch",
            DriverState::Completed(_) => "Completed",
            DriverState::Failed(_) => "Failed",
        }
    }
}

pub struct ConversationDriver {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    limiter: Arc<RateLimiter>,
    config: DriverConfig,
}

impl ConversationDriver {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        limiter: Arc<RateLimiter>,
        config: DriverConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            limiter,
            config,
        }
    }

    /// Run the conversation to a terminal state. The case timeout covers
    /// the whole loop; in-flight work is abandoned when it fires.
    pub async fn run(&self, case: &CompiledCase) -> Transcript {
        let started = Instant::now();
        let mut conversation = seed_conversation(case);
        let mut usage = Usage::default();

        let outcome = match tokio::time::timeout(
            case.spec.timeout,
            self.drive(&mut conversation, &mut usage, case),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(case_id = %case.spec.id, "conversation hit case timeout");
                ConversationOutcome::Failed {
                    reason: FailureReason::Timeout,
                }
            }
        };

        Transcript {
            conversation,
            outcome,
            usage,
            latency: started.elapsed(),
        }
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        usage: &mut Usage,
        case: &CompiledCase,
    ) -> ConversationOutcome {
        let definitions = self.tools.definitions_for(&case.spec.tool_names);
        let mut state = DriverState::AwaitingModel;

        loop {
            let next = match state {
                DriverState::AwaitingModel => {
                    self.await_model(conversation, usage, case, &definitions).await
                }
                DriverState::ToolDispatch(calls) => {
                    self.dispatch_tools(conversation, calls).await
                }
                DriverState::Completed(final_text) => {
                    return ConversationOutcome::Completed { final_text };
                }
                DriverState::Failed(reason) => {
                    return ConversationOutcome::Failed { reason };
                }
            };
            debug!(
                case_id = %case.spec.id,
                turn = conversation.turn_count(),
                state = next.name(),
                "driver state transition"
            );
            state = next;
        }
    }

    async fn await_model(
        &self,
        conversation: &mut Conversation,
        usage: &mut Usage,
        case: &CompiledCase,
        definitions: &[ToolDefinition],
    ) -> DriverState {
        if conversation.turn_count >= case.spec.max_turns {
            return DriverState::Failed(FailureReason::MaxTurnsExceeded);
        }

        let request = ChatRequest::new(self.config.model.clone(), conversation.messages.clone())
            .with_tools(definitions.to_vec());
        let request = match (self.config.temperature, self.config.max_tokens) {
            (Some(t), Some(m)) => request.with_temperature(t).with_max_tokens(m),
            (Some(t), None) => request.with_temperature(t),
            (None, Some(m)) => request.with_max_tokens(m),
            (None, None) => request,
        };

        match self.chat_with_retry(request, &case.spec.id).await {
            Ok(response) => {
                if let Some(turn_usage) = response.usage {
                    usage.absorb(turn_usage);
                }
                let final_text = response.message.content.clone().unwrap_or_default();
                let tool_calls = response.message.requested_tool_calls().to_vec();
                conversation.push(response.message);
                conversation.turn_count += 1;

                if tool_calls.is_empty() {
                    DriverState::Completed(final_text)
                } else {
                    DriverState::ToolDispatch(tool_calls)
                }
            }
            Err(error) => DriverState::Failed(FailureReason::ProviderError(error.to_string())),
        }
    }

    /// Transient provider errors retry with backoff before the exchange
    /// counts as a turn; anything else terminates the conversation.
    async fn chat_with_retry(&self, request: ChatRequest, case_id: &str) -> ModelResult<ChatResponse> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            match self.provider.chat(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        case_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Calls within one assistant turn are independent by construction, so
    /// they execute concurrently. Results append in call order, and the
    /// next model call never happens before every result is in.
    async fn dispatch_tools(
        &self,
        conversation: &mut Conversation,
        calls: Vec<ToolCall>,
    ) -> DriverState {
        let executions = calls.iter().map(|call| {
            self.tools
                .execute(&call.function.name, call.function.arguments.clone())
        });
        let results = future::join_all(executions).await;

        for (call, result) in calls.iter().zip(results) {
            let content = match result {
                Ok(output) => output.to_string(),
                // Tool failures are not retried: the model sees the error
                // and decides how to proceed.
                Err(error) => json!({ "error": error.to_string() }).to_string(),
            };
            conversation.push(ChatMessage::tool_response(&call.id, content));
        }

        DriverState::AwaitingModel
    }
}

fn seed_conversation(case: &CompiledCase) -> Conversation {
    let mut conversation = Conversation::default();
    if let Some(system) = &case.spec.system_prompt {
        conversation.push(ChatMessage::system(system.clone()));
    }
    for message in &case.spec.user_messages {
        conversation.push(ChatMessage::user(message.clone()));
    }
    conversation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::CaseSpec;
    use crate::tools::FixtureTool;
    use async_trait::async_trait;
    use model::provider::ModelError;
    use model::types::{FunctionCall, JsonSchema};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider that replays a scripted sequence of responses or errors.
    pub struct ScriptedProvider {
        script: Mutex<VecDeque<ModelResult<ChatResponse>>>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<ModelResult<ChatResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }

        pub fn text(content: &str) -> ModelResult<ChatResponse> {
            Ok(ChatResponse {
                message: ChatMessage::assistant(content),
                finish_reason: None,
                usage: Some(Usage::new(10, 5)),
            })
        }

        pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ModelResult<ChatResponse> {
            Ok(ChatResponse {
                message: ChatMessage::assistant_with_tools(
                    None,
                    vec![ToolCall {
                        id: id.to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments: args,
                        },
                    }],
                ),
                finish_reason: None,
                usage: Some(Usage::new(10, 5)),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn chat(&self, _request: ChatRequest) -> ModelResult<ChatResponse> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::text("script exhausted"))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn driver_with(script: Vec<ModelResult<ChatResponse>>) -> ConversationDriver {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(
            FixtureTool::new("get_weather", "Look up weather", JsonSchema::object())
                .responding(serde_json::json!({"temp": 72})),
        ));
        registry.register(Box::new(
            FixtureTool::new("broken", "Always fails", JsonSchema::object())
                .failing_with("fixture exploded"),
        ));

        ConversationDriver::new(
            Arc::new(ScriptedProvider::new(script)),
            Arc::new(registry),
            Arc::new(RateLimiter::new("scripted", 6000)),
            DriverConfig {
                retry: RetryPolicy {
                    jitter_factor: 0.0,
                    ..RetryPolicy::default()
                },
                ..DriverConfig::default()
            },
        )
    }

    fn weather_case() -> CompiledCase {
        CaseSpec::new("weather", "What's the weather in Oakland?")
            .with_system_prompt("You are a weather agent")
            .with_tools(vec!["get_weather".to_string()])
            .compile()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tool_round_trip_completes_in_two_turns() {
        let driver = driver_with(vec![
            ScriptedProvider::tool_call("call_1", "get_weather", serde_json::json!({"city": "Oakland"})),
            ScriptedProvider::text("It is 72F in Oakland."),
        ]);

        let transcript = driver.run(&weather_case()).await;

        assert!(transcript.outcome.is_completed());
        assert_eq!(transcript.conversation.turn_count(), 2);

        // system, user, assistant(tool_call), tool, assistant(final)
        let messages = transcript.conversation.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert!(messages[3].content.as_deref().unwrap().contains("72"));

        match &transcript.outcome {
            ConversationOutcome::Completed { final_text } => {
                assert_eq!(final_text, "It is 72F in Oakland.");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Usage accumulated across both turns.
        assert_eq!(transcript.usage.total_tokens, 30);
    }

    #[tokio::test]
    async fn test_always_tool_calling_model_hits_max_turns() {
        let script: Vec<_> = (0..10)
            .map(|i| {
                ScriptedProvider::tool_call(
                    &format!("call_{}", i),
                    "get_weather",
                    serde_json::json!({"city": "Oakland"}),
                )
            })
            .collect();
        let driver = driver_with(script);
        let case = CaseSpec::new("loop", "never stops")
            .with_tools(vec!["get_weather".to_string()])
            .with_max_turns(5)
            .compile()
            .unwrap();

        let transcript = driver.run(&case).await;

        assert_eq!(
            transcript.outcome.failure_reason(),
            Some(&FailureReason::MaxTurnsExceeded)
        );
        assert_eq!(transcript.conversation.turn_count(), 5);
    }

    #[tokio::test]
    async fn test_tool_error_surfaces_to_model() {
        let driver = driver_with(vec![
            ScriptedProvider::tool_call("call_1", "broken", serde_json::json!({})),
            ScriptedProvider::text("The tool failed, sorry."),
        ]);
        let case = CaseSpec::new("tool-error", "break the tool")
            .with_tools(vec!["broken".to_string()])
            .compile()
            .unwrap();

        let transcript = driver.run(&case).await;

        assert!(transcript.outcome.is_completed());
        let tool_msg = &transcript.conversation.messages()[2];
        assert!(tool_msg.content.as_deref().unwrap().contains("error"));
        assert!(tool_msg
            .content
            .as_deref()
            .unwrap()
            .contains("fixture exploded"));
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_message() {
        let driver = driver_with(vec![
            ScriptedProvider::tool_call("call_1", "no_such_tool", serde_json::json!({})),
            ScriptedProvider::text("done"),
        ]);

        let transcript = driver.run(&weather_case()).await;

        assert!(transcript.outcome.is_completed());
        let tool_msg = &transcript.conversation.messages()[3];
        assert!(tool_msg.content.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_without_counting_a_turn() {
        let driver = driver_with(vec![
            Err(ModelError::RateLimited),
            ScriptedProvider::text("recovered"),
        ]);

        let transcript = driver.run(&weather_case()).await;

        assert!(transcript.outcome.is_completed());
        assert_eq!(transcript.conversation.turn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_conversation() {
        let driver = driver_with(vec![
            Err(ModelError::RateLimited),
            Err(ModelError::RateLimited),
            Err(ModelError::RateLimited),
            Err(ModelError::RateLimited),
        ]);

        let transcript = driver.run(&weather_case()).await;

        match transcript.outcome.failure_reason() {
            Some(FailureReason::ProviderError(detail)) => {
                assert!(detail.contains("Rate limit"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_response_is_not_retried() {
        let driver = driver_with(vec![
            Err(ModelError::MalformedResponse {
                message: "no choices".to_string(),
            }),
            ScriptedProvider::text("never reached"),
        ]);

        let transcript = driver.run(&weather_case()).await;
        assert!(matches!(
            transcript.outcome.failure_reason(),
            Some(FailureReason::ProviderError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_case_timeout_abandons_inflight_work() {
        struct StalledProvider;

        #[async_trait]
        impl ModelProvider for StalledProvider {
            async fn chat(&self, _request: ChatRequest) -> ModelResult<ChatResponse> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                ScriptedProvider::text("too late")
            }

            fn name(&self) -> &str {
                "stalled"
            }
        }

        let driver = ConversationDriver::new(
            Arc::new(StalledProvider),
            Arc::new(ToolRegistry::new()),
            Arc::new(RateLimiter::new("stalled", 6000)),
            DriverConfig::default(),
        );
        let case = CaseSpec::new("slow", "hang")
            .with_timeout(Duration::from_secs(5))
            .compile()
            .unwrap();

        let transcript = driver.run(&case).await;

        assert_eq!(
            transcript.outcome.failure_reason(),
            Some(&FailureReason::Timeout)
        );
        assert!(transcript.latency >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_concurrent_tool_calls_append_in_call_order() {
        let response = Ok(ChatResponse {
            message: ChatMessage::assistant_with_tools(
                None,
                vec![
                    ToolCall {
                        id: "call_a".to_string(),
                        function: FunctionCall {
                            name: "get_weather".to_string(),
                            arguments: serde_json::json!({"city": "Oakland"}),
                        },
                    },
                    ToolCall {
                        id: "call_b".to_string(),
                        function: FunctionCall {
                            name: "get_weather".to_string(),
                            arguments: serde_json::json!({"city": "Nome"}),
                        },
                    },
                ],
            ),
            finish_reason: None,
            usage: None,
        });
        let driver = driver_with(vec![response, ScriptedProvider::text("done")]);

        let transcript = driver.run(&weather_case()).await;

        let ids: Vec<_> = transcript
            .conversation
            .messages()
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["call_a", "call_b"]);
    }
}
