//! Per-message edit gate.
//!
//! Every edit of a live message funnels through [`MessageUpdateCoordinator`],
//! which enforces a minimum interval between edits of the same message,
//! coalesces bursts into the latest payload, and absorbs the transport's
//! rate-limit and error responses so callers can fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::transport::{
    strip_markup, ChatTransport, InlineKeyboard, MessageHandle, ParseMode, TransportError,
};

/// Slack added on top of the transport's requested backoff.
const RETRY_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct PendingUpdate {
    text: String,
    parse_mode: ParseMode,
    markup: Option<InlineKeyboard>,
    priority: i32,
    is_final: bool,
}

#[derive(Default)]
struct MessageSlot {
    last_update_at: Option<Instant>,
    last_sent_text: String,
    pending: Option<PendingUpdate>,
    scheduled: Option<JoinHandle<()>>,
    finalized: bool,
}

impl MessageSlot {
    /// Latest-wins among equals; a queued final payload is never displaced
    /// by a non-final one, and a higher-priority payload only yields to an
    /// equal-or-higher priority or a final.
    fn queue(&mut self, update: PendingUpdate) {
        match &self.pending {
            Some(existing) if existing.is_final && !update.is_final => {}
            Some(existing) if existing.priority > update.priority && !update.is_final => {}
            _ => self.pending = Some(update),
        }
    }

    fn has_live_schedule(&self) -> bool {
        self.scheduled
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn abort_schedule(&mut self) {
        if let Some(task) = self.scheduled.take() {
            task.abort();
        }
    }
}

/// Serializes and rate-limits edits across all live messages of a process.
pub struct MessageUpdateCoordinator {
    transport: Arc<dyn ChatTransport>,
    min_update_interval: Duration,
    max_rate_limit_wait: Duration,
    slots: Mutex<HashMap<MessageHandle, MessageSlot>>,
}

impl MessageUpdateCoordinator {
    pub fn new(transport: Arc<dyn ChatTransport>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            transport,
            min_update_interval: config.min_update_interval,
            max_rate_limit_wait: config.max_rate_limit_wait,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Send a brand-new message, retrying through short rate limits, and
    /// register it for coordinated edits.
    pub async fn send_new(
        self: &Arc<Self>,
        chat_id: i64,
        text: &str,
        parse_mode: ParseMode,
        markup: Option<&InlineKeyboard>,
    ) -> Result<MessageHandle, TransportError> {
        let handle = self.send_with_backoff(chat_id, text, parse_mode, markup).await?;

        let mut slots = self.slots.lock().await;
        let slot = slots.entry(handle).or_default();
        slot.last_update_at = Some(Instant::now());
        slot.last_sent_text = text.to_string();
        Ok(handle)
    }

    fn send_with_backoff<'a>(
        self: &'a Arc<Self>,
        chat_id: i64,
        text: &'a str,
        parse_mode: ParseMode,
        markup: Option<&'a InlineKeyboard>,
    ) -> BoxFuture<'a, Result<MessageHandle, TransportError>> {
        async move {
            match self
                .transport
                .send_message(chat_id, text, parse_mode, markup)
                .await
            {
                Ok(handle) => Ok(handle),
                Err(TransportError::RateLimited { retry_after })
                    if retry_after <= self.max_rate_limit_wait =>
                {
                    debug!(chat_id, ?retry_after, "send rate limited, backing off");
                    sleep(retry_after + RETRY_MARGIN).await;
                    self.send_with_backoff(chat_id, text, parse_mode, markup).await
                }
                Err(TransportError::Other(reason)) if parse_mode == ParseMode::Html => {
                    warn!(chat_id, %reason, "send rejected, falling back to plain text");
                    let plain = strip_markup(text);
                    self.transport
                        .send_message(chat_id, &plain, ParseMode::Plain, markup)
                        .await
                }
                Err(error) => Err(error),
            }
        }
        .boxed()
    }

    /// Request that the message show `text`. Delivery may be immediate,
    /// deferred behind the per-message interval, or skipped when superseded.
    pub async fn update(
        self: &Arc<Self>,
        handle: MessageHandle,
        text: &str,
        parse_mode: ParseMode,
        markup: Option<&InlineKeyboard>,
        priority: i32,
        is_final: bool,
    ) {
        let deliver_now = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(handle).or_default();

            // Only non-final traffic stops at a finalized slot; a later
            // final payload (a corrected closing render) still goes out.
            if slot.finalized && !is_final {
                debug!(message_id = handle.message_id, "update after finalize ignored");
                return;
            }
            if !is_final && slot.last_sent_text == text {
                return;
            }

            slot.queue(PendingUpdate {
                text: text.to_string(),
                parse_mode,
                markup: markup.cloned(),
                priority,
                is_final,
            });

            let due = is_final
                || slot
                    .last_update_at
                    .map(|at| at.elapsed() >= self.min_update_interval)
                    .unwrap_or(true);

            if due {
                slot.abort_schedule();
                true
            } else {
                if !slot.has_live_schedule() {
                    let delay = slot
                        .last_update_at
                        .map(|at| {
                            self.min_update_interval
                                .saturating_sub(at.elapsed())
                        })
                        .unwrap_or(Duration::ZERO);
                    let coordinator = Arc::clone(self);
                    slot.scheduled = Some(tokio::spawn(async move {
                        sleep(delay).await;
                        coordinator.deliver_pending(handle).await;
                    }));
                }
                false
            }
        };

        if deliver_now {
            Arc::clone(self).deliver_pending(handle).await;
        }
    }

    /// Take the queued payload for `handle` (if any) and push it to the
    /// transport, handling every recoverable failure class.
    fn deliver_pending(self: Arc<Self>, handle: MessageHandle) -> BoxFuture<'static, ()> {
        async move {
            let update = {
                let mut slots = self.slots.lock().await;
                let Some(slot) = slots.get_mut(&handle) else {
                    return;
                };
                match slot.pending.take() {
                    Some(update) => update,
                    None => return,
                }
            };

            let result = self
                .transport
                .edit_message(
                    &handle,
                    &update.text,
                    update.parse_mode,
                    update.markup.as_ref(),
                )
                .await;

            match result {
                Ok(()) | Err(TransportError::NotModified) => {
                    self.record_success(handle, &update).await;
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    if retry_after <= self.max_rate_limit_wait {
                        debug!(
                            message_id = handle.message_id,
                            ?retry_after,
                            "edit rate limited, retrying after backoff"
                        );
                        sleep(retry_after + RETRY_MARGIN).await;
                        self.requeue_and_retry(handle, update).await;
                    } else if update.is_final {
                        // Never drop the final payload; wait out the cap.
                        warn!(
                            message_id = handle.message_id,
                            ?retry_after,
                            "final edit heavily rate limited, retrying at cap"
                        );
                        sleep(self.max_rate_limit_wait).await;
                        self.requeue_and_retry(handle, update).await;
                    } else {
                        warn!(
                            message_id = handle.message_id,
                            ?retry_after,
                            "edit dropped: rate limit exceeds wait cap"
                        );
                    }
                }
                Err(TransportError::TargetGone) => {
                    warn!(
                        message_id = handle.message_id,
                        "message gone, dropping coordination state"
                    );
                    self.cleanup(handle).await;
                }
                Err(TransportError::Other(reason)) => {
                    if update.parse_mode == ParseMode::Html {
                        warn!(
                            message_id = handle.message_id,
                            %reason,
                            "edit rejected, retrying as plain text"
                        );
                        let plain = strip_markup(&update.text);
                        let fallback = self
                            .transport
                            .edit_message(&handle, &plain, ParseMode::Plain, update.markup.as_ref())
                            .await;
                        match fallback {
                            Ok(()) | Err(TransportError::NotModified) => {
                                let delivered = PendingUpdate {
                                    text: plain,
                                    parse_mode: ParseMode::Plain,
                                    ..update
                                };
                                self.record_success(handle, &delivered).await;
                            }
                            Err(fallback_error) => {
                                error!(
                                    message_id = handle.message_id,
                                    %fallback_error,
                                    "plain-text fallback failed, dropping update"
                                );
                            }
                        }
                    } else {
                        error!(message_id = handle.message_id, %reason, "edit failed");
                    }
                }
            }
        }
        .boxed()
    }

    async fn requeue_and_retry(self: &Arc<Self>, handle: MessageHandle, update: PendingUpdate) {
        {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(&handle) else {
                return;
            };
            slot.queue(update);
        }
        Arc::clone(self).deliver_pending(handle).await;
    }

    async fn record_success(&self, handle: MessageHandle, update: &PendingUpdate) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&handle) {
            slot.last_update_at = Some(Instant::now());
            slot.last_sent_text = update.text.clone();
            if update.is_final {
                slot.finalized = true;
                slot.abort_schedule();
                slot.pending = None;
            }
        }
    }

    /// Time until the message may be edited again; zero when an edit could
    /// go out right now.
    pub async fn time_until_next_update(&self, handle: MessageHandle) -> Duration {
        let slots = self.slots.lock().await;
        slots
            .get(&handle)
            .and_then(|slot| slot.last_update_at)
            .map(|at| self.min_update_interval.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub async fn is_finalized(&self, handle: MessageHandle) -> bool {
        let slots = self.slots.lock().await;
        slots.get(&handle).map(|slot| slot.finalized).unwrap_or(false)
    }

    /// Drop all coordination state for one message.
    pub async fn cleanup(&self, handle: MessageHandle) {
        let mut slots = self.slots.lock().await;
        if let Some(mut slot) = slots.remove(&handle) {
            slot.abort_schedule();
        }
    }

    /// Drop state for every message in a chat (conversation reset).
    pub async fn cleanup_chat(&self, chat_id: i64) {
        let mut slots = self.slots.lock().await;
        let stale: Vec<MessageHandle> = slots
            .keys()
            .filter(|handle| handle.chat_id == chat_id)
            .copied()
            .collect();
        for handle in stale {
            if let Some(mut slot) = slots.remove(&handle) {
                slot.abort_schedule();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, TransportCall};

    fn setup() -> (Arc<MessageUpdateCoordinator>, MockTransport) {
        let transport = MockTransport::new();
        let coordinator =
            MessageUpdateCoordinator::new(Arc::new(transport.clone()), &Config::default());
        (coordinator, transport)
    }

    async fn fresh_handle(
        coordinator: &Arc<MessageUpdateCoordinator>,
        transport: &MockTransport,
    ) -> MessageHandle {
        let handle = coordinator
            .send_new(7, "hello", ParseMode::Html, None)
            .await
            .expect("send succeeds");
        assert_eq!(transport.send_count(), 1);
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_within_window_is_deferred() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "v1", ParseMode::Html, None, 0, false)
            .await;
        assert_eq!(transport.edit_count(), 0);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(transport.edit_count(), 1);
        assert_eq!(transport.last_text_for(handle.message_id).unwrap(), "v1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest_payload() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        for text in ["v1", "v2", "v3", "v4", "v5"] {
            coordinator
                .update(handle, text, ParseMode::Html, None, 0, false)
                .await;
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(transport.edit_count(), 1);
        assert_eq!(transport.last_text_for(handle.message_id).unwrap(), "v5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_after_window_is_immediate() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        tokio::time::sleep(Duration::from_millis(2100)).await;
        coordinator
            .update(handle, "later", ParseMode::Html, None, 0, false)
            .await;
        assert_eq!(transport.edit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_update_bypasses_window() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "done", ParseMode::Html, None, 0, true)
            .await;
        assert_eq!(transport.edit_count(), 1);
        assert!(coordinator.is_finalized(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_after_finalize_are_ignored() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "done", ParseMode::Html, None, 0, true)
            .await;
        coordinator
            .update(handle, "too late", ParseMode::Html, None, 0, false)
            .await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.edit_count(), 1);
        assert_eq!(transport.last_text_for(handle.message_id).unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_after_finalize_still_delivers() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "closing v1", ParseMode::Html, None, 0, true)
            .await;
        coordinator
            .update(handle, "closing v2", ParseMode::Html, None, 0, true)
            .await;

        assert_eq!(transport.edit_count(), 2);
        assert_eq!(
            transport.last_text_for(handle.message_id).unwrap(),
            "closing v2"
        );
        assert!(coordinator.is_finalized(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_priority_does_not_displace_queued_update() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "important", ParseMode::Html, None, 5, false)
            .await;
        coordinator
            .update(handle, "noise", ParseMode::Html, None, 0, false)
            .await;
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(transport.edit_count(), 1);
        assert_eq!(
            transport.last_text_for(handle.message_id).unwrap(),
            "important"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_text_is_not_resent() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator
            .update(handle, "hello", ParseMode::Html, None, 0, false)
            .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.edit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_final_retries_and_finalizes() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        transport.script_edit_error(TransportError::RateLimited {
            retry_after: Duration::from_secs(3),
        });
        coordinator
            .update(handle, "final text", ParseMode::Html, None, 0, true)
            .await;

        // The scripted failure consumed the first attempt; the retry landed.
        assert_eq!(transport.edit_count(), 1);
        assert_eq!(
            transport.last_text_for(handle.message_id).unwrap(),
            "final text"
        );
        assert!(coordinator.is_finalized(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excessive_rate_limit_drops_non_final() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        transport.script_edit_error(TransportError::RateLimited {
            retry_after: Duration::from_secs(60),
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        coordinator
            .update(handle, "doomed", ParseMode::Html, None, 0, false)
            .await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        // The single attempt failed and was never retried.
        assert_eq!(transport.edit_count(), 0);
        assert!(!coordinator.is_finalized(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_gone_deregisters_message() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        transport.script_edit_error(TransportError::TargetGone);
        coordinator
            .update(handle, "final", ParseMode::Html, None, 0, true)
            .await;

        // State was dropped rather than marked finalized.
        assert!(!coordinator.is_finalized(handle).await);
        assert_eq!(transport.edit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_markup_rejection_falls_back_to_plain() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        transport.script_edit_error(TransportError::Other("can't parse entities".into()));
        coordinator
            .update(handle, "<b>bold</b> text", ParseMode::Html, None, 0, true)
            .await;

        let calls = transport.calls();
        let edits: Vec<&TransportCall> = calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Edit { .. }))
            .collect();
        assert_eq!(edits.len(), 1);
        match edits[0] {
            TransportCall::Edit {
                text,
                parse_mode_html,
                ..
            } => {
                assert_eq!(text, "bold text");
                assert!(!parse_mode_html);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified_counts_as_success() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        transport.script_edit_error(TransportError::NotModified);
        coordinator
            .update(handle, "same-ish", ParseMode::Html, None, 0, true)
            .await;
        assert!(coordinator.is_finalized(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_new_retries_through_rate_limit() {
        let (coordinator, transport) = setup();
        transport.script_send_error(TransportError::RateLimited {
            retry_after: Duration::from_secs(2),
        });

        let handle = coordinator
            .send_new(9, "hi", ParseMode::Html, None)
            .await
            .expect("retry succeeds");
        assert_eq!(transport.send_count(), 1);
        assert_eq!(handle.chat_id, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_chat_drops_all_chat_state() {
        let (coordinator, transport) = setup();
        let handle = fresh_handle(&coordinator, &transport).await;

        coordinator.cleanup_chat(handle.chat_id).await;
        assert!(!coordinator.is_finalized(handle).await);
        assert_eq!(
            coordinator.time_until_next_update(handle).await,
            Duration::ZERO
        );
    }
}
