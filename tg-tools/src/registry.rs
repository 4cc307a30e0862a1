use crate::error::{Result, ToolError};
use crate::traits::Tool;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name-keyed set of tools available to a conversation.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.spec().name;
        tg_llm::validate_tool_name(&name)
            .map_err(|e| ToolError::InvalidArguments(format!("tool {name:?}: {e}")))?;
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        tracing::debug!(tool_name = %name, "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<tg_llm::ToolDefinition> {
        self.tools
            .values()
            .map(|tool| tool.spec().into())
            .collect()
    }

    /// Run a registered tool. Unknown names are an error, not a panic.
    #[tracing::instrument(level = "debug", skip(self, arguments))]
    pub async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(arguments).await
    }
}
