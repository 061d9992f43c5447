//! Streaming session: one agent run streamed into one chat.
//!
//! Owns the append-only raw buffer and the structured UI state, renders
//! them into transport markup, and splits into "Part N" continuation
//! messages when a segment outgrows the length limit. All edits go through
//! the [`MessageUpdateCoordinator`].

mod plan;
pub mod steps;
pub mod trackers;

pub use plan::{render_plan, PlanItem, PlanStatus};
pub use steps::StepProgressAdapter;
pub use trackers::{FileChangeTracker, HeartbeatAction, HeartbeatTracker};

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TRANSPORT_HARD_CAP};
use crate::coordinator::MessageUpdateCoordinator;
use crate::markup::{close_tags, MarkdownStreamFormatter};
use crate::state::StreamingUiState;
use crate::transport::{InlineKeyboard, MessageHandle, ParseMode, TransportError};

/// Rough token estimate: one token per four characters.
const CHARS_PER_TOKEN: usize = 4;
const CONTINUATION_MARKER: &str = "\n\n<i>...continued in the next message...</i>";
/// Headroom kept when a segment has to be hard-truncated.
const TRUNCATION_HEADROOM: usize = 100;
const ERROR_DETAIL_CHARS: usize = 1000;

pub struct StreamingSession {
    coordinator: Arc<MessageUpdateCoordinator>,
    config: Config,
    chat_id: i64,
    current: Option<MessageHandle>,
    handles: Vec<MessageHandle>,
    /// Raw streamed markdown for the current segment; append-only between
    /// segment transitions.
    buffer: String,
    pub ui: StreamingUiState,
    formatter: MarkdownStreamFormatter,
    status_line: String,
    plan_html: String,
    reply_markup: Option<InlineKeyboard>,
    message_index: usize,
    /// Right after a continuation message is created the split threshold is
    /// relaxed, so one oversized chunk does not spawn a near-empty part.
    just_created_continuation: bool,
    finalized: bool,
    estimated_tokens: u64,
    file_tracker: FileChangeTracker,
}

impl StreamingSession {
    pub fn new(
        coordinator: Arc<MessageUpdateCoordinator>,
        chat_id: i64,
        config: Config,
        reply_markup: Option<InlineKeyboard>,
    ) -> Self {
        Self {
            coordinator,
            config,
            chat_id,
            current: None,
            handles: Vec::new(),
            buffer: String::new(),
            ui: StreamingUiState::new(),
            formatter: MarkdownStreamFormatter::new(),
            status_line: String::new(),
            plan_html: String::new(),
            reply_markup,
            message_index: 1,
            just_created_continuation: false,
            finalized: false,
            estimated_tokens: 0,
            file_tracker: FileChangeTracker::new(),
        }
    }

    pub fn current_handle(&self) -> Option<MessageHandle> {
        self.current
    }

    /// Every message this session has produced, in order.
    pub fn handles(&self) -> &[MessageHandle] {
        &self.handles
    }

    pub fn message_index(&self) -> usize {
        self.message_index
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn file_tracker(&self) -> &FileChangeTracker {
        &self.file_tracker
    }

    /// Push the raw buffer's unflushed suffix into the UI state.
    pub fn sync_ui(&mut self) {
        self.ui.sync_from_buffer(&self.buffer);
    }

    /// Send the opening message. A no-op returning the existing handle when
    /// the session already started.
    pub async fn start(&mut self, initial_text: &str) -> Result<MessageHandle, TransportError> {
        if let Some(handle) = self.current {
            return Ok(handle);
        }
        let (html, _) = self.formatter.format(initial_text, false);
        let handle = self
            .coordinator
            .send_new(self.chat_id, &html, ParseMode::Html, self.reply_markup.as_ref())
            .await?;
        info!(chat_id = self.chat_id, message_id = handle.message_id, "session started");
        self.current = Some(handle);
        self.handles.push(handle);
        self.buffer = initial_text.to_string();
        Ok(handle)
    }

    /// Append streamed text and refresh the display.
    pub async fn append(&mut self, text: &str) {
        if self.finalized {
            debug!("append ignored, session finalized");
            return;
        }
        self.buffer.push_str(text);
        self.refresh().await;
    }

    pub async fn append_line(&mut self, text: &str) {
        self.append(&format!("{text}\n")).await;
    }

    /// Replace the status line shown at the bottom of the live message.
    pub async fn set_status(&mut self, status: &str) {
        if self.finalized {
            return;
        }
        self.status_line = status.to_string();
        self.refresh().await;
    }

    /// Replace the plan footer. Unchanged plans are not re-rendered.
    pub async fn set_plan(&mut self, items: &[PlanItem]) {
        if self.finalized {
            return;
        }
        let html = render_plan(items);
        if html == self.plan_html {
            return;
        }
        self.plan_html = html;
        self.refresh().await;
    }

    pub fn set_completion_info(&mut self, info: &str) {
        self.ui.set_completion_info(info);
    }

    /// Mark the run finished with a completion banner, then finalize.
    pub async fn send_completion(&mut self, success: bool) {
        if success {
            self.ui.set_completion_status("✅ <b>Done</b>");
        } else {
            self.ui.set_completion_status("⚠️ <b>Completed with issues</b>");
        }
        self.finalize(None).await;
    }

    /// Append an error block and finalize the stream.
    pub async fn send_error(&mut self, error: &str) {
        let detail: String = error.chars().take(ERROR_DETAIL_CHARS).collect();
        self.append(&format!("\n\n❌ **Error**\n```\n{detail}\n```\n")).await;
        self.finalize(None).await;
    }

    /// Estimate and accumulate tokens for `text`; the multiplier lets
    /// callers weight compressed payloads lower. Returns the tokens added.
    pub fn add_tokens(&mut self, text: &str, multiplier: f64) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let tokens =
            (text.chars().count() as f64 / CHARS_PER_TOKEN as f64 * multiplier) as u64;
        self.estimated_tokens += tokens;
        tokens
    }

    /// (estimated tokens, context limit, percent used capped at 100).
    pub fn context_usage(&self) -> (u64, u64, u8) {
        let limit = self.config.context_limit;
        if limit == 0 {
            return (self.estimated_tokens, limit, 0);
        }
        let pct = (100 * self.estimated_tokens / limit).min(100) as u8;
        (self.estimated_tokens, limit, pct)
    }

    pub fn track_file_change(&mut self, tool_name: &str, tool_input: &Value) {
        self.file_tracker.track_tool_use(tool_name, tool_input);
    }

    /// Send the end-of-run file change summary as its own message.
    pub async fn send_file_change_summary(&mut self) -> Option<MessageHandle> {
        let summary = self.file_tracker.summary()?;
        match self
            .coordinator
            .send_new(self.chat_id, &summary, ParseMode::Html, None)
            .await
        {
            Ok(handle) => Some(handle),
            Err(transport_error) => {
                warn!(%transport_error, "failed to send file change summary");
                None
            }
        }
    }

    /// Re-render the segment and push it out, splitting first when the
    /// render exceeds the limit.
    pub async fn refresh(&mut self) {
        if self.finalized {
            return;
        }
        self.sync_ui();
        let html = self.compose();
        if html.is_empty() {
            return;
        }

        let threshold = if self.just_created_continuation {
            let relaxed =
                (self.config.max_message_length as f64 * self.config.overflow_relax_factor) as usize;
            // Relaxation never licenses an edit the transport would reject.
            relaxed.min(TRANSPORT_HARD_CAP)
        } else {
            self.config.max_message_length
        };
        self.just_created_continuation = false;

        if html.chars().count() > threshold {
            info!(
                rendered_chars = html.chars().count(),
                threshold, "segment overflow, splitting"
            );
            self.handle_overflow().await;
        } else {
            self.edit_current(&html, false).await;
        }
    }

    /// Finalize the stream: drop status, plan, and buttons, then deliver the
    /// remaining content, spilling into continuation messages as needed.
    pub async fn finalize(&mut self, final_text: Option<&str>) {
        if self.finalized {
            return;
        }
        self.status_line.clear();
        self.plan_html.clear();
        self.reply_markup = None;
        if let Some(text) = final_text {
            self.buffer = text.to_string();
            self.ui.reset();
        }

        loop {
            self.sync_ui();
            let (head, carry) = self.split_for_limit();
            if let Some(handle) = self.current {
                if !head.is_empty() {
                    self.coordinator
                        .update(handle, &head, ParseMode::Html, None, 0, true)
                        .await;
                }
            }
            if carry.is_empty() {
                break;
            }
            self.start_continuation(&carry).await;
            if self.current.is_none() {
                break;
            }
        }

        self.ui.finalize();
        self.finalized = true;
    }

    /// Body plus footer (plan, then status) joined for display.
    fn compose(&self) -> String {
        let body = self.ui.render();

        let mut footer: Vec<&str> = Vec::new();
        if !self.plan_html.is_empty() {
            footer.push(&self.plan_html);
        }
        if !self.finalized && !self.status_line.is_empty() {
            if !footer.is_empty() {
                footer.push("");
            }
            footer.push(&self.status_line);
        }

        if footer.is_empty() {
            body
        } else if body.is_empty() {
            footer.join("\n")
        } else {
            format!("{body}\n\n{}", footer.join("\n"))
        }
    }

    async fn edit_current(&mut self, html: &str, is_final: bool) {
        let Some(handle) = self.current else {
            debug!("no live message to edit, skipping update");
            return;
        };
        self.coordinator
            .update(
                handle,
                html,
                ParseMode::Html,
                self.reply_markup.as_ref(),
                0,
                is_final,
            )
            .await;
    }

    /// Close out the current message within the limit and continue streaming
    /// in a fresh one; the unflushed buffer tail moves over verbatim.
    async fn handle_overflow(&mut self) {
        let (head, carry) = self.split_for_limit();
        if let Some(handle) = self.current {
            // The old message loses its status line and buttons for good.
            self.coordinator
                .update(handle, &head, ParseMode::Html, None, 0, true)
                .await;
        }
        self.start_continuation(&carry).await;
        self.just_created_continuation = true;
    }

    async fn start_continuation(&mut self, carry: &str) {
        self.message_index += 1;
        self.ui.reset();
        self.formatter.reset();
        self.buffer = format!("📨 <b>Part {}</b>\n\n", self.message_index);
        self.buffer.push_str(carry);

        // The carry may itself exceed the limit; the initial send shows a
        // clipped prefix and the follow-up split edits deliver the rest.
        let (html, _) = self.formatter.format(&self.buffer, false);
        let max = self.config.max_message_length;
        let initial = if html.chars().count() > max {
            let clipped: String = html
                .chars()
                .take(max.saturating_sub(TRUNCATION_HEADROOM))
                .collect();
            close_tags(&clipped)
        } else {
            html
        };
        match self
            .coordinator
            .send_new(self.chat_id, &initial, ParseMode::Html, self.reply_markup.as_ref())
            .await
        {
            Ok(handle) => {
                info!(
                    message_id = handle.message_id,
                    part = self.message_index,
                    "continuation message created"
                );
                self.current = Some(handle);
                self.handles.push(handle);
            }
            Err(transport_error) => {
                error!(%transport_error, "failed to create continuation message");
                self.current = None;
            }
        }
    }

    /// Finalized render of the current segment that fits the length limit,
    /// plus the raw buffer tail that did not fit. Every carried character is
    /// preserved exactly; only when committed elements alone exceed the
    /// limit is the render itself truncated.
    fn split_for_limit(&self) -> (String, String) {
        let max = self.config.max_message_length;
        let flushed = self.ui.flushed_bytes().min(self.buffer.len());
        let tail = &self.buffer[flushed..];

        let render_with = |bytes: usize| -> String {
            let mut trial = self.ui.clone();
            trial.set_content(&tail[..bytes]);
            trial.finalize();
            trial.render()
        };

        let full = render_with(tail.len());
        if full.chars().count() <= max {
            return (full, String::new());
        }

        let marker_chars = CONTINUATION_MARKER.chars().count();
        let budget = max.saturating_sub(marker_chars);

        // Largest tail prefix whose finalized render still fits the budget;
        // the render length grows with the prefix, so bisect.
        let boundaries: Vec<usize> = tail
            .char_indices()
            .map(|(index, _)| index)
            .chain(std::iter::once(tail.len()))
            .collect();
        let mut lo = 0usize;
        let mut hi = boundaries.len() - 1;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if render_with(boundaries[mid]).chars().count() <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let cut = boundaries[lo];
        let head = render_with(cut);

        if head.chars().count() <= budget {
            return (
                format!("{head}{CONTINUATION_MARKER}"),
                tail[cut..].to_string(),
            );
        }

        // Committed elements alone exceed the limit. Truncate the render and
        // rebalance its tags; the whole tail carries over.
        let shortened: String = render_with(0)
            .chars()
            .take(budget.saturating_sub(TRUNCATION_HEADROOM))
            .collect();
        let balanced = close_tags(&shortened);
        warn!(
            kept_chars = balanced.chars().count(),
            "committed elements exceed limit, truncating segment"
        );
        (
            format!("{balanced}{CONTINUATION_MARKER}"),
            tail.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn session_with(config: Config) -> (StreamingSession, MockTransport) {
        let transport = MockTransport::new();
        let coordinator =
            MessageUpdateCoordinator::new(Arc::new(transport.clone()), &config);
        (
            StreamingSession::new(coordinator, 42, config, None),
            transport,
        )
    }

    #[test]
    fn test_add_tokens_and_context_usage() {
        let (mut session, _) = session_with(Config::default());
        assert_eq!(session.add_tokens(&"x".repeat(400), 1.0), 100);
        assert_eq!(session.add_tokens(&"y".repeat(400), 0.5), 50);
        assert_eq!(session.add_tokens("", 1.0), 0);

        let (tokens, limit, pct) = session.context_usage();
        assert_eq!(tokens, 150);
        assert_eq!(limit, 200_000);
        assert_eq!(pct, 0);
    }

    #[test]
    fn test_context_usage_percent_caps_at_100() {
        let config = Config {
            context_limit: 100,
            ..Config::default()
        };
        let (mut session, _) = session_with(config);
        session.add_tokens(&"x".repeat(4000), 1.0);
        assert_eq!(session.context_usage().2, 100);
    }

    #[test]
    fn test_compose_orders_body_plan_status() {
        let (mut session, _) = session_with(Config::default());
        session.buffer.push_str("hello");
        session.sync_ui();
        session.plan_html = "📋 <b>Plan</b> <i>(0/1)</i>\n  ⬜ step".to_string();
        session.status_line = "🤖 <b>Working...</b> ⠋ (2s)".to_string();

        let html = session.compose();
        let body = html.find("hello").expect("body");
        let plan = html.find("📋").expect("plan");
        let status = html.find("🤖").expect("status");
        assert!(body < plan && plan < status);
        // Blank separator line between plan and status.
        assert!(html.contains("⬜ step\n\n🤖"));
    }

    #[test]
    fn test_split_keeps_every_character() {
        let config = Config {
            max_message_length: 200,
            ..Config::default()
        };
        let (mut session, _) = session_with(config);
        let text: String = ('a'..='z').cycle().take(500).collect();
        session.buffer.push_str(&text);
        session.sync_ui();

        let (head, carry) = session.split_for_limit();
        assert!(head.chars().count() <= 200);
        assert!(head.ends_with(CONTINUATION_MARKER));
        assert!(!carry.is_empty());

        // head-without-marker + carry reassembles the original text.
        let kept = head.strip_suffix(CONTINUATION_MARKER).unwrap();
        let mut reassembled = kept.to_string();
        reassembled.push_str(&carry);
        assert_eq!(reassembled, text);
    }

    #[test]
    fn test_split_noop_when_render_fits() {
        let (mut session, _) = session_with(Config::default());
        session.buffer.push_str("short message");
        session.sync_ui();
        let (head, carry) = session.split_for_limit();
        assert_eq!(head, "short message");
        assert!(carry.is_empty());
    }
}
