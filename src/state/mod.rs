//! Structured segment state driving the rendered message.

mod ui;

pub use ui::{StreamingUiState, ThinkingBlock, ToolState, ToolStatus, UiElement};
