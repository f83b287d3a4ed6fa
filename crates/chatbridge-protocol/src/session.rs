use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Telegram,
    WhatsApp,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::WhatsApp => "whatsapp",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one conversation: `(platform, chat, thread)`. The thread id
/// is empty on platforms without a thread concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub platform: Platform,
    pub chat_id: String,
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(platform: Platform, chat_id: impl Into<String>) -> Self {
        Self {
            platform,
            chat_id: chat_id.into(),
            thread_id: String::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.thread_id.is_empty() {
            write!(f, "{}:{}", self.platform, self.chat_id)
        } else {
            write!(f, "{}:{}:{}", self.platform, self.chat_id, self.thread_id)
        }
    }
}

/// `sandbox` restricts executor writes to the workspace, `full-access`
/// bypasses the executor sandbox. Anything unrecognized normalizes to
/// `sandbox`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    Sandbox,
    FullAccess,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Sandbox => "sandbox",
            PermissionMode::FullAccess => "full-access",
        }
    }

    pub fn normalize(value: &str) -> Self {
        match value.trim() {
            "full-access" => PermissionMode::FullAccess,
            _ => PermissionMode::Sandbox,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "sandbox" => Some(PermissionMode::Sandbox),
            "full-access" => Some(PermissionMode::FullAccess),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub session_key: SessionKey,
    pub sender_id: String,
    pub text: String,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub session_key: SessionKey,
    pub text: String,
    pub format: Option<crate::job::MessageFormat>,
}

impl OutboundMessage {
    pub fn plain(session_key: SessionKey, text: impl Into<String>) -> Self {
        Self {
            session_key,
            text: text.into(),
            format: None,
        }
    }
}
