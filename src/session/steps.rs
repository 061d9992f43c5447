//! Maps agent tool lifecycle events onto the session's UI state.
//!
//! Events may arrive in either order (permission request before or after
//! tool start) and may repeat; every handler is idempotent against the
//! current state.

use serde_json::Value;
use tracing::debug;

use super::StreamingSession;
use crate::state::ToolStatus;

const BASH_DETAIL_CHARS: usize = 20;
const PATTERN_DETAIL_CHARS: usize = 25;
const WEB_DETAIL_CHARS: usize = 30;
const DETAIL_BLOCK_CHARS: usize = 150;

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

fn take_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Short inline detail next to the tool name (file basename, command word,
/// search pattern).
fn extract_detail(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "read" | "write" | "edit" | "notebookedit" => {
            let path = match str_field(tool_input, "file_path") {
                "" => str_field(tool_input, "notebook_path"),
                path => path,
            };
            path.rsplit('/').next().unwrap_or("").to_string()
        }
        "bash" => {
            let command = str_field(tool_input, "command");
            command
                .split_whitespace()
                .next()
                .map(|word| take_chars(word, BASH_DETAIL_CHARS))
                .unwrap_or_default()
        }
        "glob" | "grep" => take_chars(str_field(tool_input, "pattern"), PATTERN_DETAIL_CHARS),
        "webfetch" | "websearch" => {
            let target = match str_field(tool_input, "url") {
                "" => str_field(tool_input, "query"),
                url => url,
            };
            take_chars(target, WEB_DETAIL_CHARS)
        }
        _ => String::new(),
    }
}

/// Longer detail shown as output under a completed tool (full command or
/// path).
fn detail_block(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "bash" => {
            let command = str_field(tool_input, "command");
            if command.chars().count() > DETAIL_BLOCK_CHARS {
                format!("{}...", take_chars(command, DETAIL_BLOCK_CHARS - 3))
            } else {
                command.to_string()
            }
        }
        "read" | "write" | "edit" | "notebookedit" => match str_field(tool_input, "file_path") {
            "" => str_field(tool_input, "notebook_path").to_string(),
            path => path.to_string(),
        },
        "glob" | "grep" => {
            let pattern = str_field(tool_input, "pattern");
            let path = str_field(tool_input, "path");
            if pattern.is_empty() {
                String::new()
            } else if path.is_empty() {
                pattern.to_string()
            } else {
                format!("{pattern} in {path}")
            }
        }
        "webfetch" | "websearch" => match str_field(tool_input, "url") {
            "" => str_field(tool_input, "query").to_string(),
            url => url.to_string(),
        },
        _ => String::new(),
    }
}

/// Per-session adapter from tool lifecycle events to UI transitions.
#[derive(Debug)]
pub struct StepProgressAdapter {
    last_message_index: usize,
    current_tool_input: Value,
}

impl Default for StepProgressAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StepProgressAdapter {
    pub fn new() -> Self {
        Self {
            last_message_index: 1,
            current_tool_input: Value::Null,
        }
    }

    /// The session may have rolled over to a continuation message since the
    /// last event; its UI state starts empty then.
    fn check_message_transition(&mut self, session: &mut StreamingSession) {
        let index = session.message_index();
        if index != self.last_message_index {
            debug!(
                from = self.last_message_index,
                to = index,
                "message transition, resetting segment ui"
            );
            session.ui.reset();
            self.last_message_index = index;
        }
    }

    /// A tool is waiting for permission. No-op when the tool is already
    /// executing (grant raced ahead of the request event).
    pub async fn on_permission_request(
        &mut self,
        session: &mut StreamingSession,
        tool_name: &str,
        tool_input: &Value,
    ) {
        let tool_name = tool_name.to_ascii_lowercase();
        debug!(%tool_name, "permission requested");
        self.check_message_transition(session);
        session.ui.collapse_all_thinking();

        if session.ui.has_tool(&tool_name, ToolStatus::Executing) {
            return;
        }

        let detail = extract_detail(&tool_name, tool_input);
        // Flush streamed text first so the tool lands after it.
        session.sync_ui();
        session.ui.add_tool(&tool_name, &detail, ToolStatus::Pending);
        session.refresh().await;
    }

    /// Permission granted: pending becomes executing. No-op without a
    /// pending entry (the start event already ran).
    pub async fn on_permission_granted(&mut self, session: &mut StreamingSession, tool_name: &str) {
        let tool_name = tool_name.to_ascii_lowercase();
        debug!(%tool_name, "permission granted");
        self.check_message_transition(session);
        if !session.ui.transition_pending_to_executing(&tool_name, None) {
            return;
        }
        session.refresh().await;
    }

    /// Tool started executing. Upgrades a pending entry, otherwise creates
    /// an executing one; never duplicates.
    pub async fn on_tool_start(
        &mut self,
        session: &mut StreamingSession,
        tool_name: &str,
        tool_input: &Value,
    ) {
        let tool_name = tool_name.to_ascii_lowercase();
        debug!(%tool_name, "tool started");
        self.check_message_transition(session);
        session.ui.collapse_all_thinking();
        session.ui.collapse_previous_content();

        self.current_tool_input = tool_input.clone();
        session.track_file_change(&tool_name, tool_input);

        let detail = extract_detail(&tool_name, tool_input);
        if session
            .ui
            .transition_pending_to_executing(&tool_name, Some(&detail))
        {
            // Upgraded the pending entry in place.
        } else if !session.ui.has_tool(&tool_name, ToolStatus::Executing) {
            session.sync_ui();
            session
                .ui
                .add_tool(&tool_name, &detail, ToolStatus::Executing);
        }

        session.refresh().await;
    }

    /// Tool finished. Duplicate completions leave the state untouched.
    pub async fn on_tool_complete(
        &mut self,
        session: &mut StreamingSession,
        tool_name: &str,
        tool_input: Option<&Value>,
        success: bool,
    ) {
        let tool_name = tool_name.to_ascii_lowercase();
        debug!(%tool_name, success, "tool completed");
        self.check_message_transition(session);

        let input = tool_input.unwrap_or(&self.current_tool_input).clone();

        let change_info = if matches!(tool_name.as_str(), "write" | "edit") {
            let path = str_field(&input, "file_path");
            session
                .file_tracker()
                .change_for(path)
                .map(|change| {
                    let mut parts = Vec::new();
                    if change.lines_added > 0 {
                        parts.push(format!("+{}", change.lines_added));
                    }
                    if change.lines_removed > 0 {
                        parts.push(format!("-{}", change.lines_removed));
                    }
                    if parts.is_empty() {
                        String::new()
                    } else {
                        format!("{} lines", parts.join(" "))
                    }
                })
                .unwrap_or_default()
        } else {
            String::new()
        };

        let output = detail_block(&tool_name, &input);
        session.ui.complete_tool(
            &tool_name,
            success,
            Some(&output),
            Some(&change_info),
        );

        self.current_tool_input = Value::Null;
        session.refresh().await;
    }

    /// Streamed reasoning text; the UI state batches it into blocks.
    pub async fn on_thinking(&mut self, session: &mut StreamingSession, text: &str) {
        if text.is_empty() {
            return;
        }
        self.check_message_transition(session);
        session.ui.add_thinking(text);
        session.refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_detail_per_tool() {
        assert_eq!(
            extract_detail("edit", &json!({"file_path": "/app/src/main.rs"})),
            "main.rs"
        );
        assert_eq!(
            extract_detail("bash", &json!({"command": "cargo build --release"})),
            "cargo"
        );
        assert_eq!(
            extract_detail("grep", &json!({"pattern": "fn main"})),
            "fn main"
        );
        assert_eq!(
            extract_detail("websearch", &json!({"query": "rust async traits"})),
            "rust async traits"
        );
        assert_eq!(extract_detail("task", &json!({})), "");
    }

    #[test]
    fn test_detail_block_truncates_long_commands() {
        let command = "x".repeat(200);
        let block = detail_block("bash", &json!({ "command": command }));
        assert_eq!(block.chars().count(), DETAIL_BLOCK_CHARS);
        assert!(block.ends_with("..."));
    }

    #[test]
    fn test_detail_block_combines_pattern_and_path() {
        assert_eq!(
            detail_block("grep", &json!({"pattern": "todo", "path": "src"})),
            "todo in src"
        );
        assert_eq!(detail_block("grep", &json!({"pattern": "todo"})), "todo");
    }
}
