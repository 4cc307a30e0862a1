use crate::error::{Result, ToolError};
use async_trait::async_trait;

/// Name, description and JSON Schema advertised to the model.
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A side-effecting capability the model can ask for by name.
///
/// Risk is never read from the implementation; see [`crate::ToolClassifier`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

impl From<ToolSpec> for tg_llm::ToolDefinition {
    fn from(spec: ToolSpec) -> Self {
        tg_llm::ToolDefinition {
            name: spec.name,
            description: spec.description,
            parameters: spec.parameters_schema,
        }
    }
}

/// String argument that may be absent or null.
pub(crate) fn string_arg(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "`{key}` must be a string, got {other}"
        ))),
    }
}

pub(crate) fn required_arg(args: &serde_json::Value, key: &str) -> Result<String> {
    string_arg(args, key)?
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing `{key}`")))
}
