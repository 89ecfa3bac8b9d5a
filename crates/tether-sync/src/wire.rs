//! Normalized message shapes: the canonical, decrypted representation of
//! one raw record, as produced by the external normalizer and consumed by
//! the reducer.

use crate::agent_state::PermissionStatus;
use crate::crypto::BoxCrypto;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Stable identifier, globally unique per record.
    pub id: String,
    /// Client-generated idempotency token, present only for locally-authored
    /// user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    /// Epoch millis. Immutable once assigned.
    pub created_at: u64,
    #[serde(default)]
    pub is_sidechain: bool,
    /// Causal link ids used by the sidechain tracer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(flatten)]
    pub content: RecordContent,
    /// Opaque per-message metadata forwarded to display untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageData>,
}

/// Role-specific payload of a normalized record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum RecordContent {
    User { content: UserPayload },
    Agent { content: Vec<AgentItem> },
    Event { event: AgentEvent },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserPayload {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPart {
    Text { text: String },
    Image { image: ImageRef },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentItem {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<u64>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permission: Option<PermissionUpdate>,
    },
    /// Root of a nested sub-conversation spawned by a tool invocation.
    /// `tool_use_id` names the spawning tool call.
    SidechainRoot {
        tool_use_id: String,
        prompt: String,
    },
    Summary {
        summary: String,
    },
}

/// Permission info carried on an authoritative tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionUpdate {
    pub status: PermissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<u64>,
}

/// Terse event shapes, both as wire payloads (`role = event`) and as the
/// event classifier's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    Ready,
    Switch {
        mode: String,
    },
    Message {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    LimitReached {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resets_at: Option<u64>,
    },
}

/// Token accounting snapshot attached to an agent record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageData {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Bulk-decrypt a batch of raw records and parse each plaintext.
///
/// One output slot per input, order preserved. Tampered ciphertexts and
/// records that match no known shape come back as `None`; they still consume
/// their slot so callers can mark the record processed and not retry it
/// forever.
pub fn decode_records(
    crypto: &dyn BoxCrypto,
    ciphertexts: &[Vec<u8>],
) -> Result<Vec<Option<NormalizedMessage>>> {
    let plaintexts = crypto.decrypt(ciphertexts)?;
    let mut out = Vec::with_capacity(plaintexts.len());
    for (i, plaintext) in plaintexts.into_iter().enumerate() {
        match plaintext {
            Some(value) => match serde_json::from_value::<NormalizedMessage>(value) {
                Ok(msg) => out.push(Some(msg)),
                Err(err) => {
                    tracing::debug!(index = i, %err, "dropping record with unknown shape");
                    out.push(None);
                }
            },
            None => {
                tracing::debug!(index = i, "dropping undecryptable record");
                out.push(None);
            }
        }
    }
    Ok(out)
}

impl NormalizedMessage {
    /// Flatten user content into display text plus image references.
    pub(crate) fn flatten_user(content: &UserPayload) -> (String, Vec<ImageRef>) {
        match content {
            UserPayload::Text(text) => (text.clone(), Vec::new()),
            UserPayload::Parts(parts) => {
                let mut text_parts = Vec::new();
                let mut images = Vec::new();
                for part in parts {
                    match part {
                        UserPart::Text { text } => text_parts.push(text.as_str()),
                        UserPart::Image { image } => images.push(image.clone()),
                    }
                }
                (text_parts.join("\n"), images)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PlainCrypto;
    use serde_json::json;

    #[test]
    fn normalized_message_wire_shape() {
        let value = json!({
            "id": "rec-1",
            "createdAt": 100,
            "role": "agent",
            "content": [
                { "type": "text", "text": "hi" },
                { "type": "tool_call", "id": "t1", "name": "Bash", "input": {"cmd": "ls"} },
                { "type": "tool_result", "tool_use_id": "t1", "content": "ok",
                  "permission": { "status": "approved", "date": 150 } }
            ]
        });
        let msg: NormalizedMessage = serde_json::from_value(value).unwrap();
        assert_eq!(msg.id, "rec-1");
        let RecordContent::Agent { content } = &msg.content else {
            panic!("expected agent role");
        };
        assert_eq!(content.len(), 3);
        assert!(matches!(
            &content[2],
            AgentItem::ToolResult { permission: Some(p), .. } if p.date == Some(150)
        ));
    }

    #[test]
    fn event_role_uses_kebab_case_tags() {
        let value = json!({
            "id": "rec-2",
            "createdAt": 100,
            "role": "event",
            "event": { "type": "limit-reached", "resetsAt": 5 }
        });
        let msg: NormalizedMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(
            msg.content,
            RecordContent::Event {
                event: AgentEvent::LimitReached { resets_at: Some(5) }
            }
        ));
    }

    #[test]
    fn decode_records_keeps_one_slot_per_input() {
        let crypto = PlainCrypto;
        let good = serde_json::to_vec(&json!({
            "id": "rec-1",
            "createdAt": 100,
            "role": "user",
            "content": "hello"
        }))
        .unwrap();
        let tampered = b"not json".to_vec();
        let wrong_shape = serde_json::to_vec(&json!({"surprise": true})).unwrap();

        let out = decode_records(&crypto, &[good, tampered, wrong_shape]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_none());
    }

    #[test]
    fn user_parts_flatten_to_text_and_images() {
        let content = UserPayload::Parts(vec![
            UserPart::Text {
                text: "look at".to_string(),
            },
            UserPart::Image {
                image: ImageRef {
                    url: "blob:1".to_string(),
                    mime_type: None,
                },
            },
            UserPart::Text {
                text: "this".to_string(),
            },
        ]);
        let (text, images) = NormalizedMessage::flatten_user(&content);
        assert_eq!(text, "look at\nthis");
        assert_eq!(images.len(), 1);
    }
}
