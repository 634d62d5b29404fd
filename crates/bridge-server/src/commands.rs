//! `!bridge` chat commands, answered locally without touching the upstream.

use bridge_core::ContextStrategy;

use crate::AppState;

pub(crate) fn is_bridge_command(text: &str) -> bool {
    text.trim().to_lowercase().starts_with("!bridge")
}

pub(crate) async fn execute(state: &AppState, key: &str, text: &str) -> String {
    let rest = text.trim().get("!bridge".len()..).unwrap_or("").trim();
    let command = rest
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match command.as_str() {
        "summary" => set_strategy(state, ContextStrategy::Summary),
        "stateful" => set_strategy(state, ContextStrategy::Stateful),
        "hybrid" => set_strategy(state, ContextStrategy::Hybrid),
        "none" => set_strategy(state, ContextStrategy::None),
        "" | "status" => status_report(state, key).await,
        "compact" => compact(state, key).await,
        "checkpoint" => checkpoint(state),
        "reset" => reset(state, key).await,
        _ => help_text(),
    }
}

fn set_strategy(state: &AppState, strategy: ContextStrategy) -> String {
    state.context.set_strategy(strategy);
    format!(
        "Context strategy set to `{}`. It applies from the next prompt.",
        strategy.as_str()
    )
}

async fn status_report(state: &AppState, key: &str) -> String {
    let strategy = state.context.strategy();
    let session = state.pool.peek(key).await;
    let (tracking, lifetime_cost) = match &session {
        Some(session) => (session.tracking(), session.total_cost_usd()),
        None => (Default::default(), 0.0),
    };
    let next_compaction = state.context.next_compaction_pct(tracking.last_summary_pct);
    let summary_bytes = state.context.summary_file_size().await;
    let state_bytes = state.context.state_file_size().await;

    format!(
        "📊 Context strategy: {}\n\
         📈 Context usage: {}% of {}-token window\n\
         📝 Summary file: {} bytes ({})\n\
         📋 State file: {} bytes ({})\n\
         🔄 Next compaction at {}%\n\
         ⏱️ User turns: {}\n\
         💰 Lifetime cost: ${:.4}\n\
         🏷️ Pool key: {}",
        strategy.as_str(),
        tracking.last_known_context_pct,
        state.context.token_budget(),
        summary_bytes,
        state.context.summary_path().display(),
        state_bytes,
        state.context.state_path().display(),
        next_compaction,
        tracking.user_turn_count,
        lifetime_cost,
        key,
    )
}

async fn compact(state: &AppState, key: &str) -> String {
    match state.pool.peek(key).await {
        Some(session) => {
            session.force_compaction(state.context.summary_trigger_pct());
            "🔄 Compaction scheduled: the next prompt will ask the agent to rewrite the \
             session summary."
                .to_string()
        }
        None => "🔄 No active session; a fresh session recovers context from disk on its \
                 first prompt."
            .to_string(),
    }
}

fn checkpoint(state: &AppState) -> String {
    match state.context.strategy() {
        ContextStrategy::None | ContextStrategy::Summary => {
            state.context.set_strategy(ContextStrategy::Hybrid);
            "📋 Checkpoint armed: strategy switched to `hybrid`; the next prompt will write \
             the state file."
                .to_string()
        }
        _ => "📋 Checkpoint already covered: the current strategy writes the state file on \
              every prompt."
            .to_string(),
    }
}

async fn reset(state: &AppState, key: &str) -> String {
    if state.pool.destroy(key, "!bridge reset").await {
        "♻️ Session destroyed. Context files remain on disk, so the next prompt starts a \
         fresh session with recovered context."
            .to_string()
    } else {
        "♻️ No active session for this key; nothing to reset.".to_string()
    }
}

fn help_text() -> String {
    "Companion bridge commands:\n\
     `!bridge status` — strategy, context usage, files, turns, cost\n\
     `!bridge summary` | `stateful` | `hybrid` | `none` — set the context strategy\n\
     `!bridge compact` — force a summary rewrite on the next prompt\n\
     `!bridge checkpoint` — ensure the state file is written from the next prompt on\n\
     `!bridge reset` — destroy the current session (context files stay on disk)"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_state;

    #[test]
    fn command_detection_is_case_insensitive() {
        assert!(is_bridge_command("!bridge status"));
        assert!(is_bridge_command("  !BRIDGE compact"));
        assert!(!is_bridge_command("bridge status"));
        assert!(!is_bridge_command("tell me about !bridge"));
    }

    #[tokio::test]
    async fn strategy_commands_flip_the_register() {
        let state = test_state();
        let reply = execute(&state, "default", "!bridge summary").await;
        assert!(reply.contains("summary"));
        assert_eq!(state.context.strategy(), ContextStrategy::Summary);

        execute(&state, "default", "!bridge none").await;
        assert_eq!(state.context.strategy(), ContextStrategy::None);
    }

    #[tokio::test]
    async fn status_reports_every_line_marker() {
        let state = test_state();
        let report = execute(&state, "model:claude-code-companion", "!bridge status").await;
        for marker in ["📊", "📈", "📝", "📋", "🔄", "⏱️", "💰", "🏷️"] {
            assert!(report.contains(marker), "missing {marker}: {report}");
        }
        assert!(report.contains("Pool key: model:claude-code-companion"));
        assert!(report.contains("Next compaction at 40%"));
    }

    #[tokio::test]
    async fn bare_bridge_is_status() {
        let state = test_state();
        let report = execute(&state, "default", "!bridge").await;
        assert!(report.contains("📊"));
    }

    #[tokio::test]
    async fn checkpoint_upgrades_summary_to_hybrid() {
        let state = test_state();
        state.context.set_strategy(ContextStrategy::Summary);
        let reply = execute(&state, "default", "!bridge checkpoint").await;
        assert!(reply.contains("hybrid"));
        assert_eq!(state.context.strategy(), ContextStrategy::Hybrid);

        // Already hybrid: no further switch, different message.
        let reply = execute(&state, "default", "!bridge checkpoint").await;
        assert!(reply.contains("already"));
    }

    #[tokio::test]
    async fn compact_without_a_session_is_graceful() {
        let state = test_state();
        let reply = execute(&state, "default", "!bridge compact").await;
        assert!(reply.contains("No active session"));
    }

    #[tokio::test]
    async fn reset_without_a_session_is_graceful() {
        let state = test_state();
        let reply = execute(&state, "default", "!bridge reset").await;
        assert!(reply.contains("nothing to reset"));
    }

    #[tokio::test]
    async fn unknown_command_returns_help() {
        let state = test_state();
        let reply = execute(&state, "default", "!bridge dance").await;
        assert!(reply.contains("Companion bridge commands"));
        assert!(reply.contains("!bridge reset"));
    }
}
