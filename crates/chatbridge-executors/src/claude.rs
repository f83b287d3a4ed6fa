use std::sync::Arc;

use serde::Deserialize;
use serde_json::value::RawValue;

use chatbridge_protocol::{
    BrokerError, BrokerResult, Job, MessageFormat, SessionStore, StreamEvent, StreamKind,
};

use crate::render::{escape_html, format_tool_use_html};
use crate::{Executor, SessionAware};

/// Adapter for the claude CLI in `--output-format stream-json` mode.
pub struct ClaudeExecutor {
    binary: String,
    sessions: Arc<dyn SessionStore>,
}

impl ClaudeExecutor {
    pub fn new(binary: impl Into<String>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            binary: binary.into(),
            sessions,
        }
    }
}

impl Executor for ClaudeExecutor {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(&self, job: &Job) -> BrokerResult<Vec<String>> {
        if self.binary.is_empty() {
            return Err(BrokerError::Configuration(
                "claude binary is empty".to_owned(),
            ));
        }
        let mut argv = vec![
            self.binary.clone(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
            "--permission-mode".to_owned(),
            "bypassPermissions".to_owned(),
        ];
        if !job.session.is_empty() {
            argv.push("--resume".to_owned());
            argv.push(job.session.clone());
        }
        argv.push("-p".to_owned());
        argv.push(job.prompt.clone());
        Ok(argv)
    }

    fn session_layer(&self) -> Option<&dyn SessionAware> {
        Some(self)
    }

    /// Exit code 1 is non-fatal: in stream-json mode the CLI exits with 1
    /// when a tool call failed mid-run even though a valid result event was
    /// already emitted. Exit code 2 (usage error) is still fatal.
    fn is_success_exit_code(&self, code: i32) -> bool {
        code == 0 || code == 1
    }
}

impl SessionAware for ClaudeExecutor {
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
        if event.stream != StreamKind::Stdout {
            // stderr and meta pass through unchanged so CLI error output
            // stays visible to the user.
            return None;
        }
        let Some((session_id, text, format)) = parse_claude_json_event(&event.chunk) else {
            event.chunk = String::new();
            return None;
        };
        event.chunk = text;
        event.format = format;
        session_id
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClaudeFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    message: Option<ClaudeFrameMessage>,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct ClaudeFrameMessage {
    #[serde(default)]
    content: Vec<ClaudeContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaudeContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<Box<RawValue>>,
}

/// `None` when the line is not a JSON frame (suppressed).
fn parse_claude_json_event(
    chunk: &str,
) -> Option<(Option<String>, String, Option<MessageFormat>)> {
    let line = chunk.trim();
    if !line.starts_with('{') {
        return None;
    }
    let frame: ClaudeFrame = serde_json::from_str(line).ok()?;
    match frame.kind.as_str() {
        "system" if frame.subtype == "init" => {
            Some((non_empty(frame.session_id), String::new(), None))
        }
        "result" => {
            let session_id = non_empty(frame.session_id);
            if frame.subtype == "error" && !frame.error.is_empty() {
                return Some((session_id, format!("{}\n", frame.error), None));
            }
            Some((session_id, String::new(), None))
        }
        "assistant" => {
            let (text, format) = frame
                .message
                .as_ref()
                .map(extract_claude_message_text)
                .unwrap_or_default();
            Some((None, text, format))
        }
        _ => Some((None, String::new(), None)),
    }
}

fn extract_claude_message_text(message: &ClaudeFrameMessage) -> (String, Option<MessageFormat>) {
    let has_tool_use = message.content.iter().any(|block| block.kind == "tool_use");
    let mut parts = Vec::new();
    for block in &message.content {
        match block.kind.as_str() {
            "text" => {
                let text = block.text.trim();
                if !text.is_empty() {
                    if has_tool_use {
                        parts.push(escape_html(text));
                    } else {
                        parts.push(text.to_owned());
                    }
                }
            }
            "tool_use" => {
                let input = block.input.as_ref().map(|raw| raw.get()).unwrap_or("");
                let rendered = format_tool_use_html(&block.name, input);
                if !rendered.is_empty() {
                    parts.push(rendered);
                }
            }
            _ => {}
        }
    }
    let mut text = parts.join("\n");
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    if has_tool_use {
        (text, Some(MessageFormat::Html))
    } else {
        (text, None)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
