//! Broker composition: the session cache and the orchestrator that routes
//! chat commands into executor jobs.

pub mod orchestrator;
pub mod session;

pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use session::{PendingInput, SessionManager};
