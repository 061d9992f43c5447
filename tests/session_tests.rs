//! End-to-end streaming session behavior against the mock transport.

use std::sync::Arc;

use serde_json::json;
use streamgate::config::Config;
use streamgate::coordinator::MessageUpdateCoordinator;
use streamgate::session::{PlanItem, PlanStatus, StepProgressAdapter, StreamingSession};
use streamgate::state::ToolStatus;
use streamgate::transport::mock::{MockTransport, TransportCall};
use streamgate::transport::TransportError;
use tokio::time::Duration;

const CONTINUATION_MARKER: &str = "\n\n<i>...continued in the next message...</i>";

fn setup(config: Config) -> (StreamingSession, MockTransport) {
    let transport = MockTransport::new();
    let coordinator = MessageUpdateCoordinator::new(Arc::new(transport.clone()), &config);
    (
        StreamingSession::new(coordinator, 10, config, None),
        transport,
    )
}

#[tokio::test(start_paused = true)]
async fn test_text_tool_text_ordering_survives_edits() {
    let (mut session, transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    let handle = session.start("starting").await.unwrap();

    session.append("Alpha paragraph.\n").await;
    steps
        .on_tool_start(&mut session, "bash", &json!({"command": "ls -la"}))
        .await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    steps.on_tool_complete(&mut session, "bash", None, true).await;
    session.append("Beta paragraph.\n").await;
    session.finalize(None).await;

    let text = transport.last_text_for(handle.message_id).unwrap();
    let alpha = text.find("Alpha paragraph.").expect("alpha present");
    let tool = text.find("✅ Ran").expect("tool line present");
    let beta = text.find("Beta paragraph.").expect("beta present");
    assert!(alpha < tool && tool < beta);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_appends_coalesces_into_one_edit() {
    let (mut session, transport) = setup(Config::default());
    session.start("starting").await.unwrap();

    for chunk in ["one ", "two ", "three ", "four ", "five"] {
        session.append(chunk).await;
    }
    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(transport.edit_count(), 1);
    let handle = session.current_handle().unwrap();
    let text = transport.last_text_for(handle.message_id).unwrap();
    assert!(text.contains("one two three four five"));
}

#[tokio::test(start_paused = true)]
async fn test_overflow_splits_with_no_loss_or_duplication() {
    let config = Config {
        max_message_length: 300,
        ..Config::default()
    };
    let (mut session, transport) = setup(config);
    session.start("x").await.unwrap();

    let streamed: String = ('a'..='z').cycle().take(1000).collect();
    for chunk in streamed.as_bytes().chunks(200) {
        session.append(std::str::from_utf8(chunk).unwrap()).await;
    }
    session.finalize(None).await;

    let handles: Vec<_> = session.handles().to_vec();
    assert!(handles.len() >= 2, "expected at least one continuation");

    let mut rebuilt = String::new();
    for (index, handle) in handles.iter().enumerate() {
        let text = transport.last_text_for(handle.message_id).unwrap();
        let mut body = text
            .strip_suffix(CONTINUATION_MARKER)
            .unwrap_or(&text)
            .to_string();
        if index > 0 {
            let header = format!("📨 <b>Part {}</b>\n\n", index + 1);
            body = body
                .strip_prefix(&header)
                .unwrap_or_else(|| panic!("missing part header in {body:?}"))
                .to_string();
        }
        rebuilt.push_str(&body);
    }

    // The first message started from "x" plus the streamed text.
    assert_eq!(rebuilt, format!("x{streamed}"));
}

#[tokio::test(start_paused = true)]
async fn test_default_limits_split_4500_chars_into_two_messages() {
    let (mut session, transport) = setup(Config::default());
    session.start("x").await.unwrap();

    let streamed: String = ('a'..='z').cycle().take(4500).collect();
    for chunk in streamed.as_bytes().chunks(1500) {
        session.append(std::str::from_utf8(chunk).unwrap()).await;
    }
    session.finalize(None).await;

    let handles: Vec<_> = session.handles().to_vec();
    assert_eq!(handles.len(), 2);

    let first = transport.last_text_for(handles[0].message_id).unwrap();
    let second = transport.last_text_for(handles[1].message_id).unwrap();
    assert!(first.chars().count() <= 4000);
    assert!(first.ends_with(CONTINUATION_MARKER));
    assert!(second.starts_with("📨 <b>Part 2</b>\n\n"));

    let mut rebuilt = first
        .strip_suffix(CONTINUATION_MARKER)
        .unwrap()
        .to_string();
    rebuilt.push_str(second.strip_prefix("📨 <b>Part 2</b>\n\n").unwrap());
    assert_eq!(rebuilt, format!("x{streamed}"));
}

#[tokio::test(start_paused = true)]
async fn test_finalize_keeps_every_physical_message_under_limit() {
    let config = Config {
        max_message_length: 200,
        ..Config::default()
    };
    let (mut session, transport) = setup(config);
    session.start("x").await.unwrap();

    let text: String = ('a'..='z').cycle().take(1000).collect();
    session.finalize(Some(&text)).await;

    for call in transport.calls() {
        let payload = match &call {
            TransportCall::Send { text, .. } | TransportCall::Edit { text, .. } => text,
        };
        assert!(
            payload.chars().count() <= 200,
            "oversized payload of {} chars reached the transport",
            payload.chars().count()
        );
    }

    let handles: Vec<_> = session.handles().to_vec();
    assert!(handles.len() >= 2);
    let mut rebuilt = String::new();
    for (index, handle) in handles.iter().enumerate() {
        let mut part = transport.last_text_for(handle.message_id).unwrap();
        if let Some(stripped) = part.strip_suffix(CONTINUATION_MARKER) {
            part = stripped.to_string();
        }
        if index > 0 {
            let header = format!("📨 <b>Part {}</b>\n\n", index + 1);
            part = part.strip_prefix(&header).unwrap().to_string();
        }
        rebuilt.push_str(&part);
    }
    assert_eq!(rebuilt, text);
}

#[tokio::test(start_paused = true)]
async fn test_permission_grant_checks_segment_transition_first() {
    let config = Config {
        max_message_length: 200,
        ..Config::default()
    };
    let (mut session, _transport) = setup(config);
    let mut steps = StepProgressAdapter::new();
    session.start("x").await.unwrap();

    let filler: String = ('a'..='z').cycle().take(300).collect();
    session.append(&filler).await;
    assert_eq!(session.message_index(), 2);

    // A tool recorded outside the adapter's view of the new segment is
    // stale; the grant must reset the segment UI before transitioning.
    session.ui.add_tool("bash", "ls", ToolStatus::Pending);
    steps.on_permission_granted(&mut session, "bash").await;
    assert!(!session.ui.has_tool("bash", ToolStatus::Executing));
    assert!(!session.ui.has_tool("bash", ToolStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_resets_ui_after_segment_transition() {
    let config = Config {
        max_message_length: 200,
        ..Config::default()
    };
    let (mut session, _transport) = setup(config);
    let mut steps = StepProgressAdapter::new();
    session.start("x").await.unwrap();

    let filler: String = ('a'..='z').cycle().take(300).collect();
    session.append(&filler).await;
    assert_eq!(session.message_index(), 2);

    steps
        .on_tool_start(&mut session, "bash", &json!({"command": "ls"}))
        .await;
    assert!(session.ui.has_tool("bash", ToolStatus::Executing));
}

#[tokio::test(start_paused = true)]
async fn test_thinking_commits_on_sentence_boundary() {
    let (mut session, transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    let handle = session.start("starting").await.unwrap();

    steps.on_thinking(&mut session, "Let me check the file").await;
    assert!(session.ui.thinking_blocks().is_empty());

    steps.on_thinking(&mut session, ". ").await;
    assert_eq!(session.ui.thinking_blocks().len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let text = transport.last_text_for(handle.message_id).unwrap();
    assert!(text.contains("Let me check the file. "));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_tool_completion_is_idempotent() {
    let (mut session, transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    let handle = session.start("starting").await.unwrap();

    steps
        .on_tool_start(&mut session, "bash", &json!({"command": "cargo check"}))
        .await;
    steps.on_tool_complete(&mut session, "bash", None, true).await;
    steps.on_tool_complete(&mut session, "bash", None, true).await;
    session.finalize(None).await;

    let text = transport.last_text_for(handle.message_id).unwrap();
    assert_eq!(text.matches("✅ Ran").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_events_are_order_tolerant() {
    let (mut session, _transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    session.start("starting").await.unwrap();

    // Grant-before-start ordering.
    steps
        .on_permission_request(&mut session, "read", &json!({"file_path": "a.rs"}))
        .await;
    steps.on_permission_granted(&mut session, "read").await;
    steps
        .on_tool_start(&mut session, "read", &json!({"file_path": "a.rs"}))
        .await;
    assert!(session.ui.has_tool("read", ToolStatus::Executing));
    assert!(!session.ui.has_tool("read", ToolStatus::Pending));
    steps.on_tool_complete(&mut session, "read", None, true).await;

    // Start-before-request ordering must not add a second entry.
    steps
        .on_tool_start(&mut session, "bash", &json!({"command": "ls"}))
        .await;
    steps
        .on_permission_request(&mut session, "bash", &json!({"command": "ls"}))
        .await;
    steps.on_permission_granted(&mut session, "bash").await;
    assert!(session.ui.has_tool("bash", ToolStatus::Executing));
    assert!(!session.ui.has_tool("bash", ToolStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_finalize_still_finalizes() {
    let (mut session, transport) = setup(Config::default());
    let handle = session.start("starting").await.unwrap();
    session.append("closing remarks").await;

    transport.script_edit_error(TransportError::RateLimited {
        retry_after: Duration::from_secs(3),
    });
    session.finalize(None).await;

    assert!(session.is_finalized());
    let text = transport.last_text_for(handle.message_id).unwrap();
    assert!(text.contains("closing remarks"));
}

#[tokio::test(start_paused = true)]
async fn test_plan_and_status_footer_order_and_removal_on_finalize() {
    let (mut session, transport) = setup(Config::default());
    let handle = session.start("starting").await.unwrap();

    session.append("Body text.\n").await;
    session
        .set_plan(&[PlanItem {
            content: "Refactor parser".to_string(),
            active_form: "Refactoring parser".to_string(),
            status: PlanStatus::InProgress,
        }])
        .await;
    session.set_status("🤖 <b>Working...</b> ⠋ (2s)").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let live = transport.last_text_for(handle.message_id).unwrap();
    let body = live.find("Body text.").expect("body");
    let plan = live.find("📋 <b>Plan</b>").expect("plan footer");
    let status = live.find("🤖 <b>Working...</b>").expect("status line");
    assert!(body < plan && plan < status);

    session.finalize(None).await;
    let final_text = transport.last_text_for(handle.message_id).unwrap();
    assert!(!final_text.contains("📋 <b>Plan</b>"));
    assert!(!final_text.contains("Working..."));
}

#[tokio::test(start_paused = true)]
async fn test_completion_surface_renders_at_bottom() {
    let (mut session, transport) = setup(Config::default());
    let handle = session.start("starting").await.unwrap();

    session.append("Result text.\n").await;
    session.set_completion_info("$0.02 | ~3K tokens");
    session.send_completion(true).await;

    let text = transport.last_text_for(handle.message_id).unwrap();
    let body = text.find("Result text.").expect("body");
    let info = text.find("$0.02").expect("completion info");
    let status = text.find("✅ <b>Done</b>").expect("completion status");
    assert!(body < info && info < status);
    assert!(session.is_finalized());
}

#[tokio::test(start_paused = true)]
async fn test_file_change_summary_is_sent_separately() {
    let (mut session, transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    session.start("starting").await.unwrap();

    steps
        .on_tool_start(
            &mut session,
            "write",
            &json!({"file_path": "/app/demo.txt", "content": "a\nb"}),
        )
        .await;
    steps
        .on_tool_complete(&mut session, "write", None, true)
        .await;
    session.send_completion(true).await;

    let summary_handle = session
        .send_file_change_summary()
        .await
        .expect("summary sent");
    let summary = transport.last_text_for(summary_handle.message_id).unwrap();
    assert!(summary.contains("📊 <b>Changed files:</b>"));
    assert!(summary.contains("✨ <code>demo.txt</code> <code>+2</code>"));
}

#[tokio::test(start_paused = true)]
async fn test_change_info_annotates_completed_edit() {
    let (mut session, transport) = setup(Config::default());
    let mut steps = StepProgressAdapter::new();
    let handle = session.start("starting").await.unwrap();

    steps
        .on_tool_start(
            &mut session,
            "edit",
            &json!({
                "file_path": "/app/src/lib.rs",
                "old_string": "a\nb\nc",
                "new_string": "a\nb\nc\nd\ne"
            }),
        )
        .await;
    steps
        .on_tool_complete(&mut session, "edit", None, true)
        .await;
    session.finalize(None).await;

    let text = transport.last_text_for(handle.message_id).unwrap();
    assert!(text.contains("✅ Edited <code>lib.rs</code> (+5 -3 lines)"));
}

#[tokio::test(start_paused = true)]
async fn test_append_after_finalize_is_ignored() {
    let (mut session, transport) = setup(Config::default());
    let handle = session.start("starting").await.unwrap();
    session.append("kept").await;
    session.finalize(None).await;
    session.append(" dropped").await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let text = transport.last_text_for(handle.message_id).unwrap();
    assert!(text.contains("kept"));
    assert!(!text.contains("dropped"));
}
