use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider misconfigured: {0}")]
    Config(String),

    #[error("invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// A chunk or frame from the provider could not be decoded.
    #[error("stream decode error: {0}")]
    Decode(String),

    #[error("malformed tool call {invocation_id}: {reason}")]
    MalformedToolCall {
        invocation_id: String,
        reason: String,
    },
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
