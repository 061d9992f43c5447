//! Rate-limited streaming of agent output into an editable chat transport.
//!
//! The pipeline: raw agent events land in a [`session::StreamingSession`],
//! which keeps structured per-segment state ([`state::StreamingUiState`]),
//! renders it through the streaming-safe markup converter ([`markup`]), and
//! pushes edits through the [`coordinator::MessageUpdateCoordinator`], which
//! paces and coalesces them per message.

pub mod config;
pub mod coordinator;
pub mod markup;
pub mod session;
pub mod state;
pub mod transport;

pub use config::Config;
pub use coordinator::MessageUpdateCoordinator;
pub use session::{
    HeartbeatAction, HeartbeatTracker, PlanItem, PlanStatus, StepProgressAdapter,
    StreamingSession,
};
pub use state::{StreamingUiState, ToolStatus};
pub use transport::{ChatTransport, MessageHandle, ParseMode, TransportError};
