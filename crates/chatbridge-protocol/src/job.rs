use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::session::{PermissionMode, SessionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prompt execution against one executor in one workdir.
///
/// `session` carries the executor-side conversation id loaded for this run;
/// it is in-memory only and never persisted on the job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub session_key: SessionKey,
    pub executor: String,
    pub session: String,
    pub prompt: String,
    pub workdir: String,
    pub permission_mode: PermissionMode,
    pub status: JobStatus,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub error_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Meta,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageFormat {
    Html,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Html => "html",
        }
    }
}

/// One line (or the synthetic terminal marker) from a job's output stream.
/// `seq` is monotonic per job starting at 1; exactly one event per job has
/// `is_final` set and it carries the child's exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub job_id: String,
    pub seq: i64,
    pub chunk: String,
    pub stream: StreamKind,
    pub format: Option<MessageFormat>,
    pub is_final: bool,
    pub ts: OffsetDateTime,
    pub exit_code: Option<i32>,
}

impl StreamEvent {
    pub fn line(job_id: impl Into<String>, seq: i64, stream: StreamKind, chunk: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            seq,
            chunk: chunk.into(),
            stream,
            format: None,
            is_final: false,
            ts: OffsetDateTime::now_utc(),
            exit_code: None,
        }
    }

    pub fn terminal(job_id: impl Into<String>, seq: i64, exit_code: i32) -> Self {
        Self {
            job_id: job_id.into(),
            seq,
            chunk: String::new(),
            stream: StreamKind::Meta,
            format: None,
            is_final: true,
            ts: OffsetDateTime::now_utc(),
            exit_code: Some(exit_code),
        }
    }
}
