//! Chat transport boundary.
//!
//! The streaming core never talks to a concrete chat network; it drives this
//! trait. Implementations are expected to surface the four error classes the
//! coordinator knows how to recover from.

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// Identity of one editable message on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Plain,
}

/// One inline button row set attached below a message (cancel button etc.).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport asks us to back off for the given duration.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: std::time::Duration },
    /// Edit carried the same content the message already has.
    #[error("message content not modified")]
    NotModified,
    /// The target message no longer exists (deleted by the user).
    #[error("target message gone")]
    TargetGone,
    /// Anything else: malformed markup, network failure, ...
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: ParseMode,
        reply_markup: Option<&InlineKeyboard>,
    ) -> Result<MessageHandle, TransportError>;

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        text: &str,
        parse_mode: ParseMode,
        reply_markup: Option<&InlineKeyboard>,
    ) -> Result<(), TransportError>;
}

/// Strip all `<...>` tags, leaving plain text for the markup-rejected
/// fallback path.
pub fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}
