//! Demo: streams a scripted agent run against a console transport, showing
//! pacing, tool status lines, and the completion surface.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use streamgate::config::Config;
use streamgate::coordinator::MessageUpdateCoordinator;
use streamgate::session::{StepProgressAdapter, StreamingSession};
use streamgate::transport::{
    ChatTransport, InlineKeyboard, MessageHandle, ParseMode, TransportError,
};

/// Prints every send and edit; stands in for a real chat network.
struct ConsoleTransport {
    next_id: AtomicI64,
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: ParseMode,
        _reply_markup: Option<&InlineKeyboard>,
    ) -> Result<MessageHandle, TransportError> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        println!("--- send #{message_id} ({parse_mode:?}) ---\n{text}\n");
        Ok(MessageHandle {
            chat_id,
            message_id,
        })
    }

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        text: &str,
        parse_mode: ParseMode,
        _reply_markup: Option<&InlineKeyboard>,
    ) -> Result<(), TransportError> {
        println!("--- edit #{} ({parse_mode:?}) ---\n{text}\n", handle.message_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    config.validate()?;

    let transport = Arc::new(ConsoleTransport {
        next_id: AtomicI64::new(1),
    });
    let coordinator = MessageUpdateCoordinator::new(transport, &config);
    let mut session = StreamingSession::new(coordinator, 1, config, None);
    let mut steps = StepProgressAdapter::new();

    session.start("🤖 Starting up...").await?;

    steps
        .on_thinking(&mut session, "Let me look at the project layout first.\n")
        .await;
    session
        .append("Scanning the workspace for build files.\n")
        .await;

    steps
        .on_tool_start(&mut session, "bash", &json!({"command": "ls -la"}))
        .await;
    sleep(Duration::from_millis(2500)).await;
    steps.on_tool_complete(&mut session, "bash", None, true).await;

    steps
        .on_tool_start(
            &mut session,
            "write",
            &json!({"file_path": "/tmp/demo.txt", "content": "hello\nworld"}),
        )
        .await;
    sleep(Duration::from_millis(2500)).await;
    steps
        .on_tool_complete(&mut session, "write", None, true)
        .await;

    session
        .append("\nAll steps finished. **Summary**: wrote `demo.txt`.\n")
        .await;
    let streamed = session.buffer().to_string();
    session.add_tokens(&streamed, 1.0);
    let (tokens, _, pct) = session.context_usage();
    session.set_completion_info(&format!("~{tokens} tokens | {pct}% context"));
    session.send_completion(true).await;
    let _ = session.send_file_change_summary().await;

    info!("demo complete");
    Ok(())
}
