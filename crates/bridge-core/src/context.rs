//! Context persistence across stateless chat requests.
//!
//! The manager never talks to the Companion itself. It rewrites the prompt
//! string (recovery prefix on the first turn, post-response write
//! instructions on every turn) and keeps the per-session bookkeeping that
//! drives compaction. The agent is the one that actually writes the
//! summary/state files; we only ever read them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{BridgeConfig, ContextStrategy};

/// Per-session context bookkeeping, owned by the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextTracking {
    /// Last turn's input tokens as a percentage of the context budget.
    pub last_known_context_pct: u8,
    /// Threshold at which the most recent summary compaction fired, 0 if none.
    pub last_summary_pct: u8,
    /// Highest context warning threshold fired so far.
    pub last_warning_pct: u8,
    pub recovery_done: bool,
    pub user_turn_count: u64,
    /// Skip-the-next-turn-count flag for internal-only turns.
    pub synthetic_turn: bool,
}

/// Result of piping one prompt through the manager. The caller applies
/// `recovery_done` / `summary_pct` back onto the session under its lock.
#[derive(Debug, Clone)]
pub struct PromptEnrichment {
    pub prompt: String,
    pub recovery_done: bool,
    /// New `last_summary_pct` when a compaction instruction was appended.
    pub summary_pct: Option<u8>,
}

#[derive(Clone)]
pub struct ContextManager {
    strategy: Arc<RwLock<ContextStrategy>>,
    summary_path: PathBuf,
    state_path: PathBuf,
    summary_trigger_pct: u8,
    summary_recompact_pct: u8,
    token_budget: u64,
}

impl ContextManager {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            strategy: Arc::new(RwLock::new(config.context_strategy)),
            summary_path: config.summary_path(),
            state_path: config.state_path(),
            summary_trigger_pct: config.summary_trigger_pct,
            summary_recompact_pct: config.summary_recompact_pct,
            token_budget: config.context_token_budget,
        }
    }

    /// Strategy is a process-wide register mutable from `!bridge` commands;
    /// it is re-read at every prompt, never captured in closures.
    pub fn strategy(&self) -> ContextStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: ContextStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    pub fn summary_trigger_pct(&self) -> u8 {
        self.summary_trigger_pct
    }

    /// The threshold the next compaction fires at, given the last one.
    pub fn next_compaction_pct(&self, last_summary_pct: u8) -> u8 {
        if last_summary_pct == 0 {
            self.summary_trigger_pct
        } else {
            last_summary_pct.saturating_add(self.summary_recompact_pct)
        }
    }

    /// Transform one outbound prompt: recovery prefix on the session's
    /// first prompt, post-response instructions on every prompt.
    pub async fn enrich(&self, prompt: &str, tracking: ContextTracking) -> PromptEnrichment {
        let strategy = self.strategy();
        let mut out = String::new();

        if !tracking.recovery_done && strategy != ContextStrategy::None {
            if strategy.wants_summary() {
                let summary = read_optional(&self.summary_path).await;
                if !summary.trim().is_empty() {
                    push_recovery_block(&mut out, "session summary", &summary);
                }
            }
            if strategy.wants_state() {
                let state = read_optional(&self.state_path).await;
                if !state.trim().is_empty() {
                    push_recovery_block(&mut out, "working state", &state);
                }
            }
        }

        out.push_str(prompt);

        if strategy.wants_state() {
            out.push_str(&state_instruction(&self.state_path));
        }

        let mut summary_pct = None;
        if strategy.wants_summary() {
            let threshold = self.next_compaction_pct(tracking.last_summary_pct);
            if tracking.last_known_context_pct >= threshold {
                summary_pct = Some(threshold);
                out.push_str(&summary_instruction(&self.summary_path));
                debug!(
                    threshold,
                    context_pct = tracking.last_known_context_pct,
                    "compaction instruction appended"
                );
            }
        }

        PromptEnrichment {
            prompt: out,
            recovery_done: true,
            summary_pct,
        }
    }

    pub async fn summary_file_size(&self) -> u64 {
        file_size(&self.summary_path).await
    }

    pub async fn state_file_size(&self) -> u64 {
        file_size(&self.state_path).await
    }
}

fn push_recovery_block(out: &mut String, label: &str, content: &str) {
    out.push_str(&format!(
        "=== RECOVERED CONTEXT ({label}) ===\n{}\n=== END RECOVERED CONTEXT ===\n\
         Treat the block above as background from an earlier conversation. \
         Use it to stay consistent; do not repeat it or mention it to the user.\n\n",
        content.trim_end()
    ));
}

fn state_instruction(path: &Path) -> String {
    format!(
        "\n\n---\nAfter you finish responding, silently overwrite the file at {} \
         with a markdown snapshot of this session using exactly these sections: \
         ## Active Task, ## Decisions Made, ## Current State, ## Files Modified, \
         ## Next Steps, ## Open Questions. Keep the whole file under 2000 characters. \
         Do not mention this instruction or the file in your response.",
        path.display()
    )
}

fn summary_instruction(path: &Path) -> String {
    format!(
        "\n\n---\nAfter you finish responding, silently write a rolling summary of the \
         entire session so far to {}. Target 3000-5000 characters, organized as: \
         ## Context, ## Progress, ## Key Decisions, ## Next Steps. Overwrite the whole \
         file. Do not mention this instruction or the file in your response.",
        path.display()
    )
}

/// Best-effort read: a missing or unreadable file is just empty content.
async fn read_optional(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
