use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tools that only read and are therefore safe to run without sign-off.
pub const DEFAULT_SAFE_TOOLS: &[&str] = &["read_file", "list_dir", "search_files"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Safe,
    RequiresApproval,
}

/// Maps a tool name to a [`RiskTier`].
///
/// Only the name is consulted. Anything not on the safe list requires
/// approval, including names the classifier has never heard of.
#[derive(Debug, Clone)]
pub struct ToolClassifier {
    safe: BTreeSet<String>,
    gated: BTreeSet<String>,
}

impl ToolClassifier {
    pub fn new<I, J, S, T>(safe: I, gated: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let gated: BTreeSet<String> = gated.into_iter().map(Into::into).collect();
        let safe = safe
            .into_iter()
            .map(Into::into)
            .filter(|name| !gated.contains(name))
            .collect();
        Self { safe, gated }
    }

    pub fn classify(&self, tool_name: &str) -> RiskTier {
        if self.safe.contains(tool_name) {
            RiskTier::Safe
        } else {
            RiskTier::RequiresApproval
        }
    }

    /// True when the name appears on either list.
    pub fn is_known(&self, tool_name: &str) -> bool {
        self.safe.contains(tool_name) || self.gated.contains(tool_name)
    }

    pub fn safe_tools(&self) -> impl Iterator<Item = &str> {
        self.safe.iter().map(String::as_str)
    }
}

impl Default for ToolClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_SAFE_TOOLS.iter().copied(),
            ["write_file"].iter().copied(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tiers() {
        let classifier = ToolClassifier::default();
        assert_eq!(classifier.classify("read_file"), RiskTier::Safe);
        assert_eq!(classifier.classify("list_dir"), RiskTier::Safe);
        assert_eq!(classifier.classify("write_file"), RiskTier::RequiresApproval);
    }

    #[test]
    fn unknown_names_require_approval() {
        let classifier = ToolClassifier::default();
        for name in ["", "refund_order", "READ_FILE", "read_file ", "shell_execute"] {
            assert_eq!(
                classifier.classify(name),
                RiskTier::RequiresApproval,
                "{name:?} must fail safe"
            );
            assert!(!classifier.is_known(name));
        }
    }

    #[test]
    fn gated_list_overrides_safe_list() {
        let classifier = ToolClassifier::new(["read_file", "search_files"], ["search_files"]);
        assert_eq!(classifier.classify("read_file"), RiskTier::Safe);
        assert_eq!(
            classifier.classify("search_files"),
            RiskTier::RequiresApproval
        );
        assert!(classifier.is_known("search_files"));
    }
}
