//! Cross-message behavior of the update coordinator.

use std::sync::Arc;

use streamgate::config::Config;
use streamgate::coordinator::MessageUpdateCoordinator;
use streamgate::transport::mock::MockTransport;
use streamgate::transport::ParseMode;
use tokio::time::Duration;

fn setup() -> (Arc<MessageUpdateCoordinator>, MockTransport) {
    let transport = MockTransport::new();
    let coordinator =
        MessageUpdateCoordinator::new(Arc::new(transport.clone()), &Config::default());
    (coordinator, transport)
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_rate_limited_independently() {
    let (coordinator, transport) = setup();
    let first = coordinator
        .send_new(1, "a", ParseMode::Html, None)
        .await
        .unwrap();
    let second = coordinator
        .send_new(1, "b", ParseMode::Html, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2100)).await;
    coordinator
        .update(first, "a2", ParseMode::Html, None, 0, false)
        .await;
    coordinator
        .update(second, "b2", ParseMode::Html, None, 0, false)
        .await;

    // Both edits went out immediately; one message does not throttle the
    // other.
    assert_eq!(transport.edit_count(), 2);
    assert_eq!(transport.last_text_for(first.message_id).unwrap(), "a2");
    assert_eq!(transport.last_text_for(second.message_id).unwrap(), "b2");
}

#[tokio::test(start_paused = true)]
async fn test_final_supersedes_queued_update() {
    let (coordinator, transport) = setup();
    let handle = coordinator
        .send_new(1, "start", ParseMode::Html, None)
        .await
        .unwrap();

    // Queued behind the interval window.
    coordinator
        .update(handle, "interim", ParseMode::Html, None, 0, false)
        .await;
    assert_eq!(transport.edit_count(), 0);

    // The final payload jumps the queue and replaces the interim one.
    coordinator
        .update(handle, "final", ParseMode::Html, None, 0, true)
        .await;
    assert_eq!(transport.edit_count(), 1);
    assert_eq!(transport.last_text_for(handle.message_id).unwrap(), "final");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.edit_count(), 1);
    assert!(coordinator.is_finalized(handle).await);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_forgets_message_state() {
    let (coordinator, transport) = setup();
    let handle = coordinator
        .send_new(1, "start", ParseMode::Html, None)
        .await
        .unwrap();
    coordinator
        .update(handle, "done", ParseMode::Html, None, 0, true)
        .await;
    assert!(coordinator.is_finalized(handle).await);

    coordinator.cleanup(handle).await;
    assert!(!coordinator.is_finalized(handle).await);

    // A fresh update works again after cleanup.
    coordinator
        .update(handle, "revived", ParseMode::Html, None, 0, false)
        .await;
    assert_eq!(transport.last_text_for(handle.message_id).unwrap(), "revived");
}
