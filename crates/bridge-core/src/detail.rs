//! Human-readable one-liners for tool activity shown in streamed output.

use serde_json::Value;

const COMMAND_PREVIEW_LEN: usize = 60;

pub fn tool_icon(tool: &str) -> &'static str {
    match tool.to_ascii_lowercase().as_str() {
        "read" => "📖",
        "write" => "📝",
        "edit" | "multiedit" => "✏️",
        "bash" => "💻",
        "glob" | "grep" => "🔍",
        "websearch" | "webfetch" => "🌐",
        "task" => "🤖",
        _ => "🔧",
    }
}

/// Turn a `(tool, input)` pair into a one-liner: a path verb when the input
/// names a file, the command preview when it runs one, the search pattern
/// when it searches, otherwise whatever description the agent supplied.
pub fn tool_detail(tool: &str, input: &Value) -> String {
    if let Some(path) = string_field(input, &["file_path", "path", "filename"]) {
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        return format!("{} {name}", path_verb(tool));
    }
    if let Some(command) = string_field(input, &["command"]) {
        return format!("Running: {}", truncate(command, COMMAND_PREVIEW_LEN));
    }
    if let Some(pattern) = string_field(input, &["pattern", "query", "regex"]) {
        return format!("Searching: {pattern}");
    }
    if let Some(description) = string_field(input, &["description"]) {
        return truncate(description, COMMAND_PREVIEW_LEN).to_string();
    }
    tool.to_string()
}

fn path_verb(tool: &str) -> &'static str {
    match tool.to_ascii_lowercase().as_str() {
        "read" => "Reading",
        "write" => "Writing",
        "edit" | "multiedit" => "Editing",
        "glob" | "grep" => "Searching",
        _ => "Using",
    }
}

fn string_field<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| input.get(key).and_then(Value::as_str))
        .filter(|v| !v.is_empty())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_tools_use_verb_and_basename() {
        assert_eq!(
            tool_detail("Read", &json!({"file_path": "/repo/src/main.rs"})),
            "Reading main.rs"
        );
        assert_eq!(
            tool_detail("Edit", &json!({"path": "src\\lib.rs"})),
            "Editing lib.rs"
        );
    }

    #[test]
    fn commands_are_truncated() {
        let long = "x".repeat(100);
        let detail = tool_detail("Bash", &json!({ "command": long }));
        assert_eq!(detail, format!("Running: {}", "x".repeat(60)));
    }

    #[test]
    fn search_tools_show_the_pattern() {
        assert_eq!(
            tool_detail("Grep", &json!({"pattern": "fn main"})),
            "Searching: fn main"
        );
    }

    #[test]
    fn falls_back_to_description_then_tool_name() {
        assert_eq!(
            tool_detail("Task", &json!({"description": "audit deps"})),
            "audit deps"
        );
        assert_eq!(tool_detail("Mystery", &json!({})), "Mystery");
    }

    #[test]
    fn every_known_tool_has_a_distinct_icon() {
        assert_eq!(tool_icon("Read"), "📖");
        assert_eq!(tool_icon("bash"), "💻");
        assert_eq!(tool_icon("NotATool"), "🔧");
    }
}
