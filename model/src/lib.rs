pub mod config;
pub mod limiter;
pub mod openai;
pub mod provider;
pub mod types;

pub use config::{CostModel, ProviderConfig};
pub use limiter::RateLimiter;
pub use openai::OpenAiProvider;
pub use provider::{ModelError, ModelProvider, ModelResult, RetryPolicy};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, FunctionCall, FunctionDefinition,
    JsonSchema, MessageRole, PropertySchema, SchemaType, ToolCall, ToolDefinition, Usage,
};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::limiter::*;
    pub use crate::openai::*;
    pub use crate::provider::*;
    pub use crate::types::*;
}
