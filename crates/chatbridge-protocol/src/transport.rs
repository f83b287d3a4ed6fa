use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerResult;
use crate::session::{Message, OutboundMessage, SessionKey};

/// Inbound message source and outbound message sink for one chat platform.
/// Implementations may filter inbound traffic down to a single allowed
/// sender id; the broker selects the transport by `SessionKey.platform`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the inbound loop until `shutdown` fires, delivering every
    /// accepted message to `handler`.
    async fn start(
        &self,
        shutdown: CancellationToken,
        handler: std::sync::Arc<dyn MessageHandler>,
    ) -> BrokerResult<()>;

    async fn send(&self, outbound: OutboundMessage) -> BrokerResult<()>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> BrokerResult<()>;
}

/// Durable executor-side conversation ids, keyed so that different chats,
/// threads, and workdirs never share a conversation.
pub trait SessionStore: Send + Sync {
    fn executor_session(
        &self,
        executor: &str,
        key: &SessionKey,
        workdir: &str,
    ) -> BrokerResult<String>;

    fn upsert_executor_session(
        &self,
        executor: &str,
        key: &SessionKey,
        workdir: &str,
        session_id: &str,
    ) -> BrokerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: &'static str,
    pub description: &'static str,
}

/// Canonical chat command surface, in the order transports advertise it.
pub fn chat_commands() -> &'static [CommandSpec] {
    const COMMANDS: &[CommandSpec] = &[
        CommandSpec {
            command: "new",
            description: "Create and switch workdir: /new <project_dir>",
        },
        CommandSpec {
            command: "cd",
            description: "Set workdir: /cd [project_dir], empty uses project root",
        },
        CommandSpec {
            command: "list",
            description: "List projects under project root",
        },
        CommandSpec {
            command: "codex",
            description: "Use codex or run once: /codex <prompt>",
        },
        CommandSpec {
            command: "claude",
            description: "Use claude or run once: /claude <prompt>",
        },
        CommandSpec {
            command: "mode",
            description: "Set session permission mode: /mode <sandbox|full-access>",
        },
        CommandSpec {
            command: "status",
            description: "Show current session status",
        },
        CommandSpec {
            command: "reset",
            description: "Reset current session",
        },
        CommandSpec {
            command: "stop",
            description: "Stop running job: /stop <job_id>",
        },
    ];
    COMMANDS
}
