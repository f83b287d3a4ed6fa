use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;

use chatbridge_protocol::{
    BrokerError, BrokerResult, Job, MessageFormat, PermissionMode, SessionStore, StreamEvent,
};

use crate::render::format_command_execution_html;
use crate::{Executor, SessionAware};

fn thread_id_regex() -> &'static Regex {
    static THREAD_ID: OnceLock<Regex> = OnceLock::new();
    THREAD_ID.get_or_init(|| {
        Regex::new(r"(?i)thread[_ ]id:\s*([0-9a-f-]{36})").expect("codex thread id regex")
    })
}

/// Adapter for the codex CLI in `exec --json` mode.
pub struct CodexExecutor {
    binary: String,
    sessions: Arc<dyn SessionStore>,
}

impl CodexExecutor {
    pub fn new(binary: impl Into<String>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            binary: binary.into(),
            sessions,
        }
    }
}

impl Executor for CodexExecutor {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(&self, job: &Job) -> BrokerResult<Vec<String>> {
        if self.binary.is_empty() {
            return Err(BrokerError::Configuration("codex binary is empty".to_owned()));
        }
        let sandbox_mode = match job.permission_mode {
            PermissionMode::FullAccess => "danger-full-access",
            PermissionMode::Sandbox => "workspace-write",
        };
        let mut argv = vec![
            self.binary.clone(),
            "--full-auto".to_owned(),
            "--sandbox".to_owned(),
            sandbox_mode.to_owned(),
            "exec".to_owned(),
            "--json".to_owned(),
            "--skip-git-repo-check".to_owned(),
        ];
        if !job.session.is_empty() {
            argv.push("resume".to_owned());
            argv.push(job.session.clone());
        }
        argv.push(job.prompt.clone());
        Ok(argv)
    }

    fn session_layer(&self) -> Option<&dyn SessionAware> {
        Some(self)
    }
}

impl SessionAware for CodexExecutor {
    fn load_session(&self, job: &Job) -> BrokerResult<String> {
        self.sessions
            .executor_session(self.name(), &job.session_key, &job.workdir)
    }

    fn save_session(&self, job: &Job, session_id: &str) -> BrokerResult<()> {
        if session_id.trim().is_empty() {
            return Ok(());
        }
        self.sessions
            .upsert_executor_session(self.name(), &job.session_key, &job.workdir, session_id)
    }

    fn handle_event(&self, event: &mut StreamEvent) -> Option<String> {
        let Some((session_id, text, format)) = parse_codex_json_event(&event.chunk) else {
            event.chunk = String::new();
            return None;
        };
        event.chunk = text;
        event.format = format;
        if let Some(session_id) = session_id {
            return Some(session_id);
        }
        extract_thread_id_fallback(&event.chunk)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CodexFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: Option<CodexFrameError>,
    #[serde(default)]
    item: Option<CodexFrameItem>,
    #[serde(default)]
    session: Option<CodexFrameSession>,
}

#[derive(Debug, Default, Deserialize)]
struct CodexFrameError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct CodexFrameItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    aggregated_output: String,
}

#[derive(Debug, Default, Deserialize)]
struct CodexFrameSession {
    #[serde(default)]
    id: String,
}

/// `None` when the line is not a JSON frame (suppressed). Otherwise the
/// advertised session id, the rewritten chunk, and its format.
fn parse_codex_json_event(chunk: &str) -> Option<(Option<String>, String, Option<MessageFormat>)> {
    let line = chunk.trim();
    if !line.starts_with('{') {
        return None;
    }
    let frame: CodexFrame = serde_json::from_str(line).ok()?;
    let session_id = extract_codex_session_id(&frame);
    let (mut text, format) = extract_codex_event_text(&frame);
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    Some((session_id, text, format))
}

fn extract_codex_session_id(frame: &CodexFrame) -> Option<String> {
    for candidate in [&frame.thread_id, &frame.session_id] {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_owned());
        }
    }
    frame
        .session
        .as_ref()
        .map(|session| session.id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

fn extract_codex_event_text(frame: &CodexFrame) -> (String, Option<MessageFormat>) {
    match frame.kind.as_str() {
        "error" => return (frame.message.clone(), None),
        "turn.failed" => {
            if let Some(error) = &frame.error {
                if !error.message.is_empty() {
                    return (error.message.clone(), None);
                }
            }
            return (frame.message.clone(), None);
        }
        "item.completed" => {
            let Some(item) = &frame.item else {
                return (String::new(), None);
            };
            match item.kind.as_str() {
                "agent_message" | "reasoning" => return (item.text.clone(), None),
                "command_execution" => {
                    return (
                        format_command_execution_html(&item.command, &item.aggregated_output),
                        Some(MessageFormat::Html),
                    );
                }
                _ => {}
            }
        }
        _ => {}
    }
    if !frame.message.is_empty() {
        return (frame.message.clone(), None);
    }
    (String::new(), None)
}

fn extract_thread_id_fallback(chunk: &str) -> Option<String> {
    if chunk.is_empty() {
        return None;
    }
    thread_id_regex()
        .captures_iter(chunk)
        .last()
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().trim().to_owned())
        .filter(|id| !id.is_empty())
}
