//! Plan footer rendered under the streaming message.

use serde::{Deserialize, Serialize};

use crate::markup::escape_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

/// One plan entry as reported by the agent's task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub content: String,
    /// Present-tense form shown while the item is in progress.
    #[serde(default, rename = "activeForm")]
    pub active_form: String,
    pub status: PlanStatus,
}

/// Renders the plan as a compact footer: header with progress count, one
/// line per item. Returns an empty string for an empty plan.
pub fn render_plan(items: &[PlanItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let completed = items
        .iter()
        .filter(|item| item.status == PlanStatus::Completed)
        .count();
    let mut lines = vec![format!(
        "📋 <b>Plan</b> <i>({completed}/{})</i>",
        items.len()
    )];

    for item in items {
        let text = match item.status {
            PlanStatus::InProgress if !item.active_form.is_empty() => &item.active_form,
            _ => &item.content,
        };
        let escaped = escape_text(text);
        let line = match item.status {
            PlanStatus::Completed => format!("  ✅ <s>{escaped}</s>"),
            PlanStatus::InProgress => format!("  ⏳ <b>{escaped}</b>"),
            PlanStatus::Pending => format!("  ⬜ {escaped}"),
        };
        lines.push(line);
    }

    lines.join("\n")
}
