//! Event classifier. Some normalized messages read better as a terse event
//! than as a chat message: a slash-command echo the client mirrored back,
//! or a tool result carrying a known system signal. This is a pure
//! function; the reducer decides what to do with the result.

use crate::wire::{AgentEvent, AgentItem, NormalizedMessage, RecordContent, UserPayload};

const COMMAND_OPEN: &str = "<command-name>";
const COMMAND_CLOSE: &str = "</command-name>";
const LIMIT_SIGNAL: &str = "usage limit reached|";

/// Classify a normalized message as a terse event, or `None` to let it flow
/// through the conversational phases.
pub fn parse_message_as_event(msg: &NormalizedMessage) -> Option<AgentEvent> {
    match &msg.content {
        RecordContent::User { content } => parse_command_echo(content),
        RecordContent::Agent { content } => content.iter().find_map(parse_system_signal),
        // Event-role records are already events; the reducer handles them.
        RecordContent::Event { .. } => None,
    }
}

/// `<command-name>/compact</command-name>` style echoes of a slash command
/// the user ran.
fn parse_command_echo(content: &UserPayload) -> Option<AgentEvent> {
    let text = match content {
        UserPayload::Text(text) => text.as_str(),
        UserPayload::Parts(_) => return None,
    };
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix(COMMAND_OPEN)?;
    let (command, _) = rest.split_once(COMMAND_CLOSE)?;
    if command.is_empty() {
        return None;
    }
    Some(AgentEvent::Message {
        message: command.to_string(),
    })
}

/// Tool results whose payload matches `... usage limit reached|<epoch>`.
fn parse_system_signal(item: &AgentItem) -> Option<AgentEvent> {
    let AgentItem::ToolResult { content, .. } = item else {
        return None;
    };
    let text = content.as_str()?;
    let idx = text.find(LIMIT_SIGNAL)?;
    let resets_at = text[idx + LIMIT_SIGNAL.len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse::<u64>()
        .ok();
    Some(AgentEvent::LimitReached { resets_at })
}
