use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The path would leave the workspace root.
    #[error("path rejected: {0}")]
    OutsideWorkspace(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("duplicate tool registration: {0}")]
    DuplicateTool(String),

    #[error("{what} too large: {bytes} bytes (max {max})")]
    TooLarge {
        what: &'static str,
        bytes: usize,
        max: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
