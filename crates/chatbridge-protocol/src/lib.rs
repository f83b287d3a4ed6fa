//! Shared protocol types for the ChatBridge broker.

pub mod error;
pub mod job;
pub mod session;
pub mod transport;

pub use error::{BrokerError, BrokerResult};
pub use job::{Job, JobStatus, MessageFormat, StreamEvent, StreamKind};
pub use session::{Message, OutboundMessage, PermissionMode, Platform, SessionKey};
pub use transport::{chat_commands, CommandSpec, MessageHandler, SessionStore, Transport};
