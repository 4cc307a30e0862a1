//! toolgate configuration loader.
//!
//! Every section is optional; an empty file is a valid configuration.

use crate::orchestrator::TurnSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tg_tools::{DEFAULT_SAFE_TOOLS, ToolClassifier};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolgateConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    TurnSettings::default().system_prompt
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Scripted,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Events buffered per client stream before the turn waits on the client.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default)]
    pub cors_allow_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            stream_buffer: default_stream_buffer(),
            cors_allow_origins: Vec::new(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    60
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_stream_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    /// Tool names to register. Unknown names are rejected at startup.
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            enabled: default_enabled_tools(),
        }
    }
}

fn default_workspace_root() -> String {
    ".".to_string()
}

fn default_enabled_tools() -> Vec<String> {
    ["read_file", "list_dir", "search_files", "write_file"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds to wait for a decision before the call is denied.
    #[serde(default = "default_approval_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_safe_tools")]
    pub safe_tools: Vec<String>,
    #[serde(default = "default_gated_tools")]
    pub gated_tools: Vec<String>,
    /// Gated tools approved without asking. They still announce `ApprovalRequired`.
    #[serde(default)]
    pub auto_approve: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_approval_timeout_seconds(),
            safe_tools: default_safe_tools(),
            gated_tools: default_gated_tools(),
            auto_approve: Vec::new(),
        }
    }
}

fn default_approval_timeout_seconds() -> u64 {
    30
}

fn default_safe_tools() -> Vec<String> {
    DEFAULT_SAFE_TOOLS.iter().map(|s| s.to_string()).collect()
}

fn default_gated_tools() -> Vec<String> {
    vec!["write_file".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_tool_loops_max")]
    pub tool_loops_max: usize,
    #[serde(default = "default_max_tool_chars")]
    pub max_tool_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tool_loops_max: default_tool_loops_max(),
            max_tool_chars: default_max_tool_chars(),
        }
    }
}

fn default_tool_loops_max() -> usize {
    4
}

fn default_max_tool_chars() -> usize {
    16_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    /// SQLite file for sessions. Absent means sessions live in memory only.
    #[serde(default)]
    pub path: Option<String>,
}

impl ToolgateConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("TOOLGATE_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = var("TOOLGATE_LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = var("TOOLGATE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.approval.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("approval.timeout_seconds must be > 0"));
        }
        if self.server.stream_buffer == 0 {
            return Err(anyhow::anyhow!("server.stream_buffer must be >= 1"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.context.tool_loops_max == 0 {
            return Err(anyhow::anyhow!("context.tool_loops_max must be > 0"));
        }
        for name in self
            .approval
            .safe_tools
            .iter()
            .chain(&self.approval.gated_tools)
            .chain(&self.approval.auto_approve)
            .chain(&self.tools.enabled)
        {
            tg_llm::validate_tool_name(name)
                .map_err(|e| anyhow::anyhow!("invalid tool name {name:?}: {e}"))?;
        }
        if self.llm.provider == ProviderKind::OpenAi
            && self.llm.api_key.as_deref().is_none_or(|k| k.trim().is_empty())
        {
            tracing::warn!("llm.api_key is not set; requests to the provider will likely be rejected");
        }
        Ok(())
    }

    pub fn classifier(&self) -> ToolClassifier {
        ToolClassifier::new(
            self.approval.safe_tools.iter().cloned(),
            self.approval.gated_tools.iter().cloned(),
        )
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            system_prompt: self.general.system_prompt.clone(),
            tool_loops_max: self.context.tool_loops_max,
            approval_timeout: Duration::from_secs(self.approval.timeout_seconds),
            max_tool_chars: self.context.max_tool_chars,
            auto_approve: self.approval.auto_approve.iter().cloned().collect(),
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        expand_home(&self.tools.workspace_root)
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.state
            .path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_home)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".toolgate").join("config.toml")
}

pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_tools::RiskTier;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = ToolgateConfig::parse("").expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.approval.timeout_seconds, 30);
        assert_eq!(cfg.context.tool_loops_max, 4);
        assert_eq!(cfg.llm.provider, ProviderKind::OpenAi);
        assert!(cfg.state_path().is_none());
        let classifier = cfg.classifier();
        assert_eq!(classifier.classify("read_file"), RiskTier::Safe);
        assert_eq!(classifier.classify("write_file"), RiskTier::RequiresApproval);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = ToolgateConfig::parse(
            r#"
[general]
model = "local-model"

[llm]
provider = "scripted"

[approval]
timeout_seconds = 5
safe_tools = ["read_file"]
auto_approve = ["write_file"]

[state]
path = "/tmp/toolgate.db"
"#,
        )
        .expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.general.model, "local-model");
        assert_eq!(cfg.llm.provider, ProviderKind::Scripted);
        let settings = cfg.turn_settings();
        assert_eq!(settings.approval_timeout, Duration::from_secs(5));
        assert!(settings.auto_approve.contains("write_file"));
        assert_eq!(cfg.classifier().classify("list_dir"), RiskTier::RequiresApproval);
        assert_eq!(cfg.state_path(), Some(PathBuf::from("/tmp/toolgate.db")));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = ToolgateConfig::parse("[approval]\ntimeout_seconds = 0\n").expect("parse");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn invalid_tool_names_are_rejected() {
        let cfg = ToolgateConfig::parse("[approval]\nsafe_tools = [\"read file\"]\n").expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_ignore_blank_values() {
        let mut cfg = ToolgateConfig::default();
        cfg.apply_env_overrides(|key| match key {
            "TOOLGATE_MODEL" => Some("override-model".to_string()),
            "TOOLGATE_BIND_ADDR" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.general.model, "override-model");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8787");
    }
}
