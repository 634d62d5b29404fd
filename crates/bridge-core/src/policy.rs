//! Ordered-rule tool policy.
//!
//! Evaluation is strictly top-to-bottom over a list fixed at startup; the
//! first matching rule decides. The rule list either comes from the
//! `TOOL_POLICY` override or from the built-in defaults for the configured
//! tool mode.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::ToolMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Deny,
    Passthrough,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolPolicyRule {
    pub tool: String,
    pub action: PolicyDecision,
    #[serde(default)]
    pub input_contains: Option<String>,
}

impl ToolPolicyRule {
    fn matches(&self, tool_name: &str, serialized_input: &str) -> bool {
        let tool_ok = self.tool == "*" || self.tool.eq_ignore_ascii_case(tool_name);
        if !tool_ok {
            return false;
        }
        match &self.input_contains {
            Some(needle) => serialized_input.contains(needle.as_str()),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolPolicy {
    rules: Vec<ToolPolicyRule>,
}

impl ToolPolicy {
    /// Built-in rule list: read-only tools auto-allowed, catch-all decided
    /// by the global tool mode.
    pub fn defaults(mode: ToolMode) -> Self {
        let allow = |tool: &str| ToolPolicyRule {
            tool: tool.to_string(),
            action: PolicyDecision::Allow,
            input_contains: None,
        };
        let catch_all = ToolPolicyRule {
            tool: "*".to_string(),
            action: match mode {
                ToolMode::Auto => PolicyDecision::Allow,
                ToolMode::Passthrough => PolicyDecision::Passthrough,
            },
            input_contains: None,
        };
        let mut rules: Vec<ToolPolicyRule> = ["Read", "Glob", "Grep", "WebSearch", "Task"]
            .iter()
            .map(|t| allow(t))
            .collect();
        rules.push(catch_all);
        Self { rules }
    }

    /// Load the policy, preferring a `TOOL_POLICY` JSON override. A
    /// malformed override logs a warning and falls back to the defaults.
    pub fn load(mode: ToolMode, override_json: Option<&str>) -> Self {
        let Some(raw) = override_json else {
            return Self::defaults(mode);
        };
        match serde_json::from_str::<Vec<ToolPolicyRule>>(raw) {
            Ok(rules) if !rules.is_empty() => Self { rules },
            Ok(_) => {
                warn!("TOOL_POLICY override is empty, using defaults");
                Self::defaults(mode)
            }
            Err(error) => {
                warn!("TOOL_POLICY override is malformed ({error}), using defaults");
                Self::defaults(mode)
            }
        }
    }

    pub fn decide(&self, tool_name: &str, input: &Value) -> PolicyDecision {
        let serialized = input.to_string();
        self.rules
            .iter()
            .find(|rule| rule.matches(tool_name, &serialized))
            .map(|rule| rule.action)
            .unwrap_or(PolicyDecision::Allow)
    }
}
