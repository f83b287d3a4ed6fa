//! Display-only rendering helpers for executor output.

const COMMAND_TRUNCATE_LIMIT: usize = 800;
const TRUNCATION_MARKER: &str = "\n ...... [truncated] ...... \n\n";

/// Escapes text for HTML-format chat messages, matching the escaping the
/// rich-rendering transports expect.
pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&#39;"),
            '"' => escaped.push_str("&#34;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Shortens long multi-line command text for chat display. Applies only
/// when the text exceeds 800 bytes and 6 lines; keeps the first and last
/// three lines. Never used for text sent to an executor.
pub fn truncate_command_for_display(command: &str) -> String {
    if command.len() <= COMMAND_TRUNCATE_LIMIT {
        return command.to_owned();
    }
    let lines: Vec<&str> = command.split('\n').collect();
    if lines.len() <= 6 {
        return command.to_owned();
    }
    let head = lines[..3].join("\n");
    let tail = lines[lines.len() - 3..].join("\n");
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

pub(crate) fn format_command_execution_html(command: &str, output: &str) -> String {
    let command = truncate_command_for_display(command.trim());
    let output = output.trim();
    if command.is_empty() && output.is_empty() {
        return String::new();
    }
    let mut rendered = String::from("<b>command_execution</b>");
    if !command.is_empty() {
        rendered.push_str("\n<code>");
        rendered.push_str(&escape_html(&command));
        rendered.push_str("</code>");
    }
    if !output.is_empty() {
        rendered.push_str("\n<pre>");
        rendered.push_str(&escape_html(output));
        rendered.push_str("</pre>\n");
    }
    rendered
}

pub(crate) fn format_tool_use_html(name: &str, input: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return String::new();
    }
    let input = input.trim();
    let mut rendered = String::from("<b>");
    rendered.push_str(&escape_html(name));
    rendered.push_str("</b>");
    if !input.is_empty() && input != "null" && input != "{}" {
        rendered.push_str("\n<code>");
        rendered.push_str(&escape_html(&truncate_command_for_display(input)));
        rendered.push_str("</code>");
    }
    rendered.push('\n');
    rendered
}
