//! Inference capability for toolgate.
//!
//! Providers stream a conversation turn; the adapter in [`provider`] reshapes
//! their chunks into stable [`InferenceEvent`]s so nothing downstream depends
//! on a particular provider's wire format.

mod error;
mod openai;
mod provider;
mod scripted;
mod types;

pub use error::{LlmError, Result};
pub use openai::{OPENAI_DEFAULT_BASE_URL, OpenAiProvider};
pub use provider::{InferenceProvider, InferenceStream, assemble_events};
pub use scripted::ScriptedProvider;
pub use types::{
    ChatMessage, InferenceEvent, Role, StreamChunk, ToolCall, ToolDefinition,
    ToolInvocationRequest, Usage, validate_tool_name,
};
