//! Structured UI state for one streaming message segment.
//!
//! Instead of splicing strings into a flat buffer, the segment is modeled as
//! an ordered element list (content blocks interleaved with tool status
//! lines) plus thinking blocks on top. Rendering is a deterministic fold
//! over that state, which is what makes in-place edits stable.

use serde::{Deserialize, Serialize};

use crate::markup::{escape_code, escape_text, format};

/// Thinking buffer commits to a block at this size.
const THINKING_COMMIT_CHARS: usize = 100;
/// Cap on rendered thinking text.
const THINKING_PREVIEW_CHARS: usize = 800;
/// Cap on a collapsed content block's preview.
const CONTENT_PREVIEW_CHARS: usize = 200;
/// Cap on tool output shown under a completed tool line.
const TOOL_OUTPUT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Waiting for the user to grant permission.
    Pending,
    Executing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    pub detail: String,
    pub output: String,
    pub change_info: String,
}

/// One element of the rendered segment, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiElement {
    Content { text: String, collapsed: bool },
    Tool(ToolState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub id: String,
    pub content: String,
    pub collapsed: bool,
}

fn tool_icon(name: &str) -> &'static str {
    match name {
        "bash" => "🔧",
        "write" => "📝",
        "edit" => "✏️",
        "read" => "📖",
        "glob" => "🔍",
        "grep" => "🔎",
        "webfetch" => "🌐",
        "websearch" => "🔎",
        "task" => "🤖",
        "notebookedit" => "📓",
        _ => "⏳",
    }
}

/// (executing label, done label) per tool.
fn tool_actions(name: &str) -> (&'static str, &'static str) {
    match name {
        "bash" => ("Running", "Ran"),
        "write" => ("Writing", "Wrote"),
        "edit" => ("Editing", "Edited"),
        "read" => ("Reading", "Read"),
        "glob" => ("Finding files", "Found files"),
        "grep" => ("Searching code", "Searched code"),
        "webfetch" => ("Fetching", "Fetched"),
        "websearch" => ("Searching the web", "Searched the web"),
        "task" => ("Launching agent", "Agent finished"),
        "notebookedit" => ("Editing notebook", "Edited notebook"),
        _ => ("Working", "Done"),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    let mut result = String::new();
    for (count, ch) in text.chars().enumerate() {
        if count >= max_chars {
            return (result, true);
        }
        result.push(ch);
    }
    (result, false)
}

impl ToolState {
    pub fn render(&self) -> String {
        let icon = match self.status {
            ToolStatus::Pending => "⏳",
            ToolStatus::Executing => tool_icon(&self.name),
            ToolStatus::Completed => "✅",
            ToolStatus::Error => "❌",
        };
        let (running, done) = tool_actions(&self.name);
        let label = match self.status {
            ToolStatus::Pending => {
                return format!(
                    "⏳ Waiting for permission: <code>{}</code>",
                    escape_code(&self.name)
                );
            }
            ToolStatus::Executing => running,
            ToolStatus::Completed | ToolStatus::Error => done,
        };

        let mut line = if self.detail.is_empty() {
            format!("{icon} {label}")
        } else {
            format!("{icon} {label} <code>{}</code>", escape_code(&self.detail))
        };

        if self.status == ToolStatus::Executing {
            line.push_str("...");
        }

        if self.status == ToolStatus::Completed {
            if !self.change_info.is_empty() {
                line.push_str(&format!(" ({})", escape_text(&self.change_info)));
            }
            if !self.output.is_empty() {
                let (shown, truncated) = truncate_chars(&self.output, TOOL_OUTPUT_CHARS);
                let mut escaped = escape_code(&shown);
                if truncated {
                    escaped.push_str("...");
                }
                line.push_str(&format!("\n<pre>{escaped}</pre>"));
            }
        }

        line
    }
}

impl ThinkingBlock {
    pub fn render(&self) -> String {
        let escaped = escape_text(&self.content);
        if self.collapsed {
            format!("<blockquote expandable>💭 {escaped}</blockquote>")
        } else {
            format!("💭 <i>{escaped}</i>")
        }
    }
}

/// Complete UI state for one message segment; the single source of truth for
/// what the segment should display.
#[derive(Debug, Clone, Default)]
pub struct StreamingUiState {
    elements: Vec<UiElement>,
    content_buffer: String,
    /// Bytes of the session's raw buffer already committed into elements.
    flushed_bytes: usize,
    thinking: Vec<ThinkingBlock>,
    thinking_buffer: String,
    completion_info: String,
    completion_status: String,
    finalized: bool,
}

impl StreamingUiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> &[UiElement] {
        &self.elements
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Bytes of the external raw buffer consumed into committed elements.
    pub fn flushed_bytes(&self) -> usize {
        self.flushed_bytes
    }

    /// Extend the uncommitted content buffer with freshly streamed text.
    pub fn append_content(&mut self, text: &str) {
        self.content_buffer.push_str(text);
    }

    /// Replace the uncommitted buffer outright (committed elements keep
    /// whatever was flushed before).
    pub fn set_content(&mut self, text: &str) {
        self.content_buffer.clear();
        self.content_buffer.push_str(text);
    }

    /// Sync the uncommitted buffer from the session's full raw buffer,
    /// taking only the suffix past what was already flushed into elements.
    pub fn sync_from_buffer(&mut self, full_buffer: &str) {
        if full_buffer.len() > self.flushed_bytes {
            let suffix = &full_buffer[self.flushed_bytes..];
            if self.content_buffer != suffix {
                self.content_buffer.clear();
                self.content_buffer.push_str(suffix);
            }
        } else {
            self.content_buffer.clear();
        }
    }

    fn flush_content_buffer(&mut self) {
        if !self.content_buffer.trim().is_empty() {
            self.elements.push(UiElement::Content {
                text: std::mem::take(&mut self.content_buffer),
                collapsed: false,
            });
            if let Some(UiElement::Content { text, .. }) = self.elements.last() {
                self.flushed_bytes += text.len();
            }
        } else {
            self.flushed_bytes += self.content_buffer.len();
            self.content_buffer.clear();
        }
    }

    fn tool_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| matches!(element, UiElement::Tool(_)))
            .count()
    }

    /// Append a tool element, flushing pending content first so the element
    /// order matches the chronological stream.
    pub fn add_tool(&mut self, name: &str, detail: &str, status: ToolStatus) -> &ToolState {
        self.flush_content_buffer();

        let tool = ToolState {
            id: format!("tool_{}", self.tool_count()),
            name: name.to_ascii_lowercase(),
            status,
            detail: detail.to_string(),
            output: String::new(),
            change_info: String::new(),
        };
        self.elements.push(UiElement::Tool(tool));
        match self.elements.last() {
            Some(UiElement::Tool(tool)) => tool,
            _ => unreachable!("just pushed a tool element"),
        }
    }

    pub fn current_tool(&self) -> Option<&ToolState> {
        self.elements.iter().rev().find_map(|element| match element {
            UiElement::Tool(tool) => Some(tool),
            _ => None,
        })
    }

    fn find_tool_mut(&mut self, name: &str, status: ToolStatus) -> Option<&mut ToolState> {
        let name = name.to_ascii_lowercase();
        self.elements.iter_mut().rev().find_map(|element| match element {
            UiElement::Tool(tool) if tool.name == name && tool.status == status => Some(tool),
            _ => None,
        })
    }

    pub fn has_tool(&self, name: &str, status: ToolStatus) -> bool {
        let name = name.to_ascii_lowercase();
        self.elements.iter().any(|element| {
            matches!(element, UiElement::Tool(tool) if tool.name == name && tool.status == status)
        })
    }

    /// Pending → Executing transition; false (and no change) when no pending
    /// tool of that name exists.
    pub fn transition_pending_to_executing(&mut self, name: &str, detail: Option<&str>) -> bool {
        match self.find_tool_mut(name, ToolStatus::Pending) {
            Some(tool) => {
                tool.status = ToolStatus::Executing;
                if let Some(detail) = detail {
                    if !detail.is_empty() {
                        tool.detail = detail.to_string();
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Executing → Completed/Error transition; false when no executing tool
    /// of that name exists (e.g. a duplicate completion event).
    pub fn complete_tool(
        &mut self,
        name: &str,
        success: bool,
        output: Option<&str>,
        change_info: Option<&str>,
    ) -> bool {
        match self.find_tool_mut(name, ToolStatus::Executing) {
            Some(tool) => {
                tool.status = if success {
                    ToolStatus::Completed
                } else {
                    ToolStatus::Error
                };
                if let Some(output) = output {
                    if !output.is_empty() {
                        tool.output = output.to_string();
                    }
                }
                if let Some(change_info) = change_info {
                    if !change_info.is_empty() {
                        tool.change_info = change_info.to_string();
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Buffer thinking text; commits a block once the buffer is long enough,
    /// the chunk carries a newline, or the text ends a sentence. This bounds
    /// latency-to-visible without an edit per token.
    pub fn add_thinking(&mut self, text: &str) {
        self.thinking_buffer.push_str(text);

        let trimmed = self.thinking_buffer.trim_end();
        let should_commit = self.thinking_buffer.chars().count() >= THINKING_COMMIT_CHARS
            || text.contains('\n')
            || trimmed.ends_with(['.', '!', '?', ':']);

        if should_commit {
            self.flush_thinking_buffer(false);
        }
    }

    fn flush_thinking_buffer(&mut self, collapsed: bool) {
        if self.thinking_buffer.is_empty() {
            return;
        }

        if let Some(previous) = self.thinking.last_mut() {
            previous.collapsed = true;
        }

        let (mut content, truncated) =
            truncate_chars(&self.thinking_buffer, THINKING_PREVIEW_CHARS);
        if truncated {
            content.push_str("...");
        }

        self.thinking.push(ThinkingBlock {
            id: format!("thinking_{}", self.thinking.len()),
            content,
            collapsed,
        });
        self.thinking_buffer.clear();
    }

    pub fn thinking_blocks(&self) -> &[ThinkingBlock] {
        &self.thinking
    }

    /// Collapse all thinking into expandable quotes (called before tool
    /// output takes over the message).
    pub fn collapse_all_thinking(&mut self) {
        for block in &mut self.thinking {
            block.collapsed = true;
        }
        if !self.thinking_buffer.is_empty() {
            self.flush_thinking_buffer(true);
        }
    }

    /// Collapse every content element except the most recent one.
    pub fn collapse_previous_content(&mut self) {
        let last_content = self
            .elements
            .iter()
            .rposition(|element| matches!(element, UiElement::Content { .. }));
        for (index, element) in self.elements.iter_mut().enumerate() {
            if Some(index) == last_content {
                continue;
            }
            if let UiElement::Content { collapsed, .. } = element {
                *collapsed = true;
            }
        }
    }

    pub fn set_completion_info(&mut self, info: &str) {
        self.completion_info = info.to_string();
    }

    pub fn set_completion_status(&mut self, status: &str) {
        self.completion_status = status.to_string();
    }

    /// Flush remaining buffers and mark the segment final.
    pub fn finalize(&mut self) {
        self.flush_content_buffer();
        self.finalized = true;
        if !self.thinking_buffer.is_empty() {
            self.flush_thinking_buffer(true);
        }
    }

    /// Clear everything for reuse by the next message segment.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Deterministic render of the whole segment, in order: thinking, then
    /// elements as streamed, then the live tail, then completion lines.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        for block in &self.thinking {
            parts.push(block.render());
        }

        if !self.thinking_buffer.is_empty() {
            let (mut shown, truncated) =
                truncate_chars(&self.thinking_buffer, THINKING_PREVIEW_CHARS);
            if truncated {
                shown.push_str("...");
            }
            parts.push(format!("💭 <i>{}</i>", escape_text(&shown)));
        }

        for element in &self.elements {
            match element {
                UiElement::Content { text, collapsed } => {
                    if *collapsed {
                        let (mut preview, truncated) =
                            truncate_chars(text, CONTENT_PREVIEW_CHARS);
                        if truncated {
                            preview.push_str("...");
                        }
                        parts.push(format!(
                            "<blockquote expandable>📝 {}</blockquote>",
                            escape_text(&preview)
                        ));
                    } else {
                        let html = format(text, !self.finalized);
                        if !html.is_empty() {
                            parts.push(html);
                        }
                    }
                }
                UiElement::Tool(tool) => parts.push(tool.render()),
            }
        }

        if !self.content_buffer.is_empty() {
            let html = format(&self.content_buffer, true);
            if !html.is_empty() {
                parts.push(html);
            }
        }

        if !self.completion_info.is_empty() {
            parts.push(self.completion_info.clone());
        }

        if !self.completion_status.is_empty() {
            parts.push(self.completion_status.clone());
        }

        parts.join("\n\n")
    }
}
