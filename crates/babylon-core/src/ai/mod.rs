//! Provider communication: normalized types, vendor clients, retry.

pub mod provider;
pub mod retry;
pub mod types;

pub use provider::{AnthropicProvider, OpenAiProvider, Provider, ProviderError};
pub use retry::call_with_retry;
pub use types::{ChatRequest, ChatResponse, Content, MessageRole, ModelMessage, ToolCall, ToolSpec};
