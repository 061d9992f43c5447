//! File-change ledger and heartbeat status updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use super::StreamingSession;
use crate::markup::escape_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileAction {
    Create,
    Edit,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub lines_added: usize,
    pub lines_removed: usize,
}

fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.matches('\n').count() + 1
    }
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Ledger of files touched during a session, fed from tool invocations and
/// summarized at the end.
#[derive(Debug, Default)]
pub struct FileChangeTracker {
    changes: HashMap<String, FileChange>,
}

impl FileChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tool invocation. Only file-writing tools (and `rm` shell
    /// commands) affect the ledger.
    pub fn track_tool_use(&mut self, tool_name: &str, tool_input: &Value) {
        match tool_name.to_ascii_lowercase().as_str() {
            "write" => {
                let path = str_field(tool_input, "file_path");
                if path.is_empty() {
                    return;
                }
                let lines = count_lines(str_field(tool_input, "content"));
                match self.changes.get_mut(path) {
                    Some(change) => {
                        // Rewriting a known file counts as an edit.
                        change.lines_added += lines;
                        change.action = FileAction::Edit;
                    }
                    None => {
                        self.changes.insert(
                            path.to_string(),
                            FileChange {
                                path: path.to_string(),
                                action: FileAction::Create,
                                lines_added: lines,
                                lines_removed: 0,
                            },
                        );
                    }
                }
            }
            "edit" => {
                let path = str_field(tool_input, "file_path");
                if path.is_empty() {
                    return;
                }
                let removed = count_lines(str_field(tool_input, "old_string"));
                let added = count_lines(str_field(tool_input, "new_string"));
                match self.changes.get_mut(path) {
                    Some(change) => {
                        change.lines_added += added;
                        change.lines_removed += removed;
                    }
                    None => {
                        self.changes.insert(
                            path.to_string(),
                            FileChange {
                                path: path.to_string(),
                                action: FileAction::Edit,
                                lines_added: added,
                                lines_removed: removed,
                            },
                        );
                    }
                }
            }
            "bash" => {
                let command = str_field(tool_input, "command");
                if command.contains("git add") || command.contains("git commit") {
                    return;
                }
                let mut words = command.split_whitespace();
                while let Some(word) = words.next() {
                    if word != "rm" && word != "del" {
                        continue;
                    }
                    let target = words
                        .clone()
                        .find(|candidate| !candidate.starts_with('-'));
                    if let Some(path) = target {
                        self.changes.insert(
                            path.to_string(),
                            FileChange {
                                path: path.to_string(),
                                action: FileAction::Delete,
                                lines_added: 0,
                                lines_removed: 0,
                            },
                        );
                    }
                    break;
                }
            }
            _ => {}
        }
    }

    pub fn change_for(&self, path: &str) -> Option<&FileChange> {
        self.changes.get(path)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn reset(&mut self) {
        self.changes.clear();
    }

    /// Markup summary of every change, creations first, with per-file and
    /// total line counts. None when nothing was tracked.
    pub fn summary(&self) -> Option<String> {
        if self.changes.is_empty() {
            return None;
        }

        let mut sorted: Vec<&FileChange> = self.changes.values().collect();
        sorted.sort_by(|a, b| a.action.cmp(&b.action).then_with(|| a.path.cmp(&b.path)));

        let mut lines = vec!["📊 <b>Changed files:</b>\n".to_string()];
        let mut total_added = 0;
        let mut total_removed = 0;

        for change in sorted {
            let filename = change
                .path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&change.path);
            let emoji = match change.action {
                FileAction::Create => "✨",
                FileAction::Edit => "📝",
                FileAction::Delete => "🗑️",
            };

            let mut counts = String::new();
            if change.lines_added > 0 {
                counts.push_str(&format!("<code>+{}</code>", change.lines_added));
                total_added += change.lines_added;
            }
            if change.lines_removed > 0 {
                if !counts.is_empty() {
                    counts.push(' ');
                }
                counts.push_str(&format!("<code>-{}</code>", change.lines_removed));
                total_removed += change.lines_removed;
            }

            let name = escape_code(filename);
            if counts.is_empty() {
                lines.push(format!("  {emoji} <code>{name}</code>"));
            } else {
                lines.push(format!("  {emoji} <code>{name}</code> {counts}"));
            }
        }

        if total_added > 0 || total_removed > 0 {
            let mut totals = String::new();
            if total_added > 0 {
                totals.push_str(&format!("<code>+{total_added}</code>"));
            }
            if total_removed > 0 {
                if !totals.is_empty() {
                    totals.push(' ');
                }
                totals.push_str(&format!("<code>-{total_removed}</code>"));
            }
            lines.push(format!(
                "\n<i>Total: {} file(s), {totals}</i>",
                self.changes.len()
            ));
        }

        Some(lines.join("\n"))
    }
}

/// What the agent is doing right now, for the heartbeat status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatAction {
    Thinking,
    Reading,
    Writing,
    Editing,
    Searching,
    Executing,
    Planning,
    Analyzing,
    Waiting,
    #[default]
    Working,
}

impl HeartbeatAction {
    fn emoji(self) -> &'static str {
        match self {
            Self::Thinking => "🧠",
            Self::Reading => "📖",
            Self::Writing => "✍️",
            Self::Editing => "✏️",
            Self::Searching => "🔎",
            Self::Executing => "⚡",
            Self::Planning => "🎯",
            Self::Analyzing => "🔬",
            Self::Waiting => "⏳",
            Self::Working => "🤖",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Thinking => "Thinking",
            Self::Reading => "Reading",
            Self::Writing => "Writing",
            Self::Editing => "Editing",
            Self::Searching => "Searching",
            Self::Executing => "Running",
            Self::Planning => "Planning",
            Self::Analyzing => "Analyzing",
            Self::Waiting => "Waiting for input",
            Self::Working => "Working",
        }
    }
}

const SPINNERS: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const DETAIL_MAX_CHARS: usize = 30;

#[derive(Debug, Default)]
struct HeartbeatState {
    action: HeartbeatAction,
    detail: String,
}

/// Periodic status line with elapsed time and a spinner, pushed through the
/// session so the coordinator paces the edits.
pub struct HeartbeatTracker {
    session: Arc<tokio::sync::Mutex<StreamingSession>>,
    interval: Duration,
    state: Arc<Mutex<HeartbeatState>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatTracker {
    pub fn new(session: Arc<tokio::sync::Mutex<StreamingSession>>) -> Self {
        Self::with_interval(session, DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(
        session: Arc<tokio::sync::Mutex<StreamingSession>>,
        interval: Duration,
    ) -> Self {
        Self {
            session,
            // Faster than the coordinator window would just queue no-ops.
            interval: interval.max(DEFAULT_HEARTBEAT_INTERVAL),
            state: Arc::new(Mutex::new(HeartbeatState::default())),
            task: None,
        }
    }

    pub fn set_action(&self, action: HeartbeatAction, detail: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.action = action;
        state.detail = shorten_detail(detail);
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let session = Arc::clone(&self.session);
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let started_at = Instant::now();
            let mut tick: usize = 0;
            loop {
                let status = {
                    let state = state.lock().unwrap_or_else(|e| e.into_inner());
                    render_status(state.action, &state.detail, started_at.elapsed(), tick)
                };
                tick += 1;
                session.lock().await.set_status(&status).await;
                sleep(interval).await;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("heartbeat stopped");
        }
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shorten_detail(detail: &str) -> String {
    let chars: Vec<char> = detail.chars().collect();
    if chars.len() <= DETAIL_MAX_CHARS {
        return detail.to_string();
    }
    let tail: String = chars[chars.len() - (DETAIL_MAX_CHARS - 3)..].iter().collect();
    format!("...{tail}")
}

fn render_status(
    action: HeartbeatAction,
    detail: &str,
    elapsed: Duration,
    tick: usize,
) -> String {
    let seconds = elapsed.as_secs();
    let time_str = if seconds < 60 {
        format!("{seconds}s")
    } else {
        format!("{}m {}s", seconds / 60, seconds % 60)
    };
    let spinner = SPINNERS[tick % SPINNERS.len()];
    let emoji = action.emoji();
    let label = action.label();

    if detail.is_empty() {
        format!("{emoji} <b>{label}...</b> {spinner} ({time_str})")
    } else {
        format!("{emoji} <b>{label}</b> {spinner} ({time_str}) · <i>{detail}</i>")
    }
}
