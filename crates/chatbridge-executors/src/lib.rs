//! Executor adapters and the subprocess runner.
//!
//! An executor adapter knows how to turn a [`Job`] into an argv for one
//! backend CLI and how to interpret that CLI's streamed output. Adapters
//! that can resume a backend-side conversation expose the optional
//! [`SessionAware`] capability; the orchestrator probes for it instead of
//! branching on adapter names.

mod claude;
mod codex;
mod render;
mod runner;

use async_trait::async_trait;

use chatbridge_protocol::{BrokerResult, Job, StreamEvent};

pub use claude::ClaudeExecutor;
pub use codex::CodexExecutor;
pub use render::truncate_command_for_display;
pub use runner::Runner;

pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full argv including the program path. Must incorporate the job's
    /// resume session id and permission mode where the backend supports
    /// them.
    fn build_command(&self, job: &Job) -> BrokerResult<Vec<String>>;

    /// Optional session-continuity capability.
    fn session_layer(&self) -> Option<&dyn SessionAware> {
        None
    }

    /// Whether the child's exit code counts as success. Only exit code 0
    /// unless the adapter overrides it.
    fn is_success_exit_code(&self, code: i32) -> bool {
        code == 0
    }
}

pub trait SessionAware: Send + Sync {
    fn load_session(&self, job: &Job) -> BrokerResult<String>;

    fn save_session(&self, job: &Job, session_id: &str) -> BrokerResult<()>;

    /// Rewrites the event in place (extracting user-visible text from
    /// backend control frames; an empty chunk afterwards means "suppress
    /// from chat while still persisting") and returns the backend session
    /// id when the frame advertises one.
    fn handle_event(&self, event: &mut StreamEvent) -> Option<String>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: StreamEvent) -> BrokerResult<()>;
}
