//! Process configuration, resolved once from the environment at startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COMPANION_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_PORT: u16 = 8084;
pub const DEFAULT_MODEL_NAME: &str = "claude-code-companion";
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1_800_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_800_000;
pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_SUMMARY_TRIGGER_PCT: u8 = 40;
pub const DEFAULT_SUMMARY_RECOMPACT_PCT: u8 = 20;
/// Agent context window assumed when turning token counts into percentages.
pub const DEFAULT_CONTEXT_TOKEN_BUDGET: u64 = 200_000;

pub const SUMMARY_FILE_NAME: &str = ".companion-summary.md";
pub const STATE_FILE_NAME: &str = ".companion-state.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    Auto,
    Passthrough,
}

impl ToolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolMode::Auto => "auto",
            ToolMode::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    None,
    Summary,
    Stateful,
    Hybrid,
}

impl ContextStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextStrategy::None => "none",
            ContextStrategy::Summary => "summary",
            ContextStrategy::Stateful => "stateful",
            ContextStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(ContextStrategy::None),
            "summary" => Some(ContextStrategy::Summary),
            "stateful" => Some(ContextStrategy::Stateful),
            "hybrid" => Some(ContextStrategy::Hybrid),
            _ => None,
        }
    }

    pub fn wants_summary(self) -> bool {
        matches!(self, ContextStrategy::Summary | ContextStrategy::Hybrid)
    }

    pub fn wants_state(self) -> bool {
        matches!(self, ContextStrategy::Stateful | ContextStrategy::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub companion_url: String,
    pub port: u16,
    pub session_cwd: String,
    pub permission_mode: String,
    pub model_name: String,
    pub tool_mode: ToolMode,
    pub tool_policy_json: Option<String>,
    pub log_format: LogFormat,
    pub response_timeout_ms: u64,
    pub session_idle_timeout_ms: u64,
    pub max_sessions: usize,
    pub context_strategy: ContextStrategy,
    pub summary_trigger_pct: u8,
    pub summary_recompact_pct: u8,
    pub context_dir: PathBuf,
    pub context_token_budget: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            companion_url: DEFAULT_COMPANION_URL.to_string(),
            port: DEFAULT_PORT,
            session_cwd: ".".to_string(),
            permission_mode: "default".to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            tool_mode: ToolMode::Auto,
            tool_policy_json: None,
            log_format: LogFormat::Pretty,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            session_idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            context_strategy: ContextStrategy::Hybrid,
            summary_trigger_pct: DEFAULT_SUMMARY_TRIGGER_PCT,
            summary_recompact_pct: DEFAULT_SUMMARY_RECOMPACT_PCT,
            context_dir: PathBuf::from("."),
            context_token_budget: DEFAULT_CONTEXT_TOKEN_BUDGET,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            companion_url: env_string("COMPANION_URL")
                .unwrap_or(defaults.companion_url)
                .trim_end_matches('/')
                .to_string(),
            port: env_parse("ADAPTER_PORT").unwrap_or(defaults.port),
            session_cwd: env_string("SESSION_CWD").unwrap_or_else(|| {
                std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| ".".to_string())
            }),
            permission_mode: env_string("PERMISSION_MODE").unwrap_or(defaults.permission_mode),
            model_name: env_string("MODEL_NAME").unwrap_or(defaults.model_name),
            tool_mode: env_string("TOOL_MODE")
                .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "auto" => Some(ToolMode::Auto),
                    "passthrough" => Some(ToolMode::Passthrough),
                    _ => None,
                })
                .unwrap_or(defaults.tool_mode),
            tool_policy_json: env_string("TOOL_POLICY"),
            log_format: env_string("LOG_FORMAT")
                .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "json" => Some(LogFormat::Json),
                    "pretty" => Some(LogFormat::Pretty),
                    _ => None,
                })
                .unwrap_or(defaults.log_format),
            response_timeout_ms: env_parse("RESPONSE_TIMEOUT_MS")
                .unwrap_or(defaults.response_timeout_ms),
            session_idle_timeout_ms: env_parse("SESSION_IDLE_TIMEOUT_MS")
                .unwrap_or(defaults.session_idle_timeout_ms),
            max_sessions: env_parse::<usize>("MAX_SESSIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_sessions),
            context_strategy: env_string("CONTEXT_STRATEGY")
                .and_then(|v| ContextStrategy::parse(&v))
                .unwrap_or(defaults.context_strategy),
            summary_trigger_pct: env_parse("SUMMARY_TRIGGER_PCT")
                .filter(|p| *p > 0 && *p <= 100)
                .unwrap_or(defaults.summary_trigger_pct),
            summary_recompact_pct: env_parse("SUMMARY_RECOMPACT_PCT")
                .filter(|p| *p > 0 && *p <= 100)
                .unwrap_or(defaults.summary_recompact_pct),
            context_dir: env_string("CONTEXT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.context_dir),
            context_token_budget: env_parse("CONTEXT_TOKEN_BUDGET")
                .filter(|b| *b > 0)
                .unwrap_or(defaults.context_token_budget),
        }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.context_dir.join(SUMMARY_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.context_dir.join(STATE_FILE_NAME)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.response_timeout_ms, 1_800_000);
        assert_eq!(cfg.session_idle_timeout_ms, 1_800_000);
        assert_eq!(cfg.max_sessions, 10);
        assert_eq!(cfg.summary_trigger_pct, 40);
        assert_eq!(cfg.summary_recompact_pct, 20);
        assert_eq!(cfg.context_token_budget, 200_000);
        assert_eq!(cfg.model_name, "claude-code-companion");
    }

    #[test]
    fn strategy_parse_rejects_unknown() {
        assert_eq!(ContextStrategy::parse("Hybrid"), Some(ContextStrategy::Hybrid));
        assert_eq!(ContextStrategy::parse(" summary "), Some(ContextStrategy::Summary));
        assert_eq!(ContextStrategy::parse("bogus"), None);
    }
}
