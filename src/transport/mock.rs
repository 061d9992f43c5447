//! Scriptable in-memory transport for tests and the demo binary.

use super::{ChatTransport, InlineKeyboard, MessageHandle, ParseMode, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Send {
        chat_id: i64,
        message_id: i64,
        text: String,
        parse_mode_html: bool,
        has_markup: bool,
    },
    Edit {
        message_id: i64,
        text: String,
        parse_mode_html: bool,
        has_markup: bool,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<TransportCall>,
    // Errors injected for upcoming edit calls, consumed front to back.
    scripted_edit_errors: VecDeque<TransportError>,
    scripted_send_errors: VecDeque<TransportError>,
    next_message_id: i64,
}

/// Records every send/edit and replays scripted failures.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_edit_error(&self, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .scripted_edit_errors
            .push_back(error);
    }

    pub fn script_send_error(&self, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .scripted_send_errors
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn edit_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Edit { .. }))
            .count()
    }

    pub fn send_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Send { .. }))
            .count()
    }

    /// Last text delivered for the given message id, send or edit.
    pub fn last_text_for(&self, message_id: i64) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .rev()
            .find_map(|call| match call {
                TransportCall::Edit {
                    message_id: id,
                    text,
                    ..
                } if *id == message_id => Some(text.clone()),
                TransportCall::Send {
                    message_id: id,
                    text,
                    ..
                } if *id == message_id => Some(text.clone()),
                _ => None,
            })
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: ParseMode,
        reply_markup: Option<&InlineKeyboard>,
    ) -> Result<MessageHandle, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.scripted_send_errors.pop_front() {
            return Err(error);
        }
        state.next_message_id += 1;
        let handle = MessageHandle {
            chat_id,
            message_id: state.next_message_id,
        };
        state.calls.push(TransportCall::Send {
            chat_id,
            message_id: handle.message_id,
            text: text.to_string(),
            parse_mode_html: parse_mode == ParseMode::Html,
            has_markup: reply_markup.is_some(),
        });
        Ok(handle)
    }

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        text: &str,
        parse_mode: ParseMode,
        reply_markup: Option<&InlineKeyboard>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.scripted_edit_errors.pop_front() {
            return Err(error);
        }
        state.calls.push(TransportCall::Edit {
            message_id: handle.message_id,
            text: text.to_string(),
            parse_mode_html: parse_mode == ParseMode::Html,
            has_markup: reply_markup.is_some(),
        });
        Ok(())
    }
}
