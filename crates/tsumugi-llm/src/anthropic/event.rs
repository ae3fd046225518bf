//! Typed Anthropic Messages stream events.
//!
//! Each `data:` payload is first decoded into a generic [`RawEvent`]; the
//! `type` tag then selects a concrete structure here. Fields the assembler
//! never reads are ignored, fields it does read are required.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use tsumugi_core::error::StreamError;

use crate::sse::RawEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart(MessageStart),
    ContentBlockStart(ContentBlockStart),
    ContentBlockDelta(ContentBlockDelta),
    ContentBlockStop(ContentBlockStop),
    MessageDelta(MessageDelta),
    MessageStop,
    Ping,
    Error(ErrorEvent),
    /// An event type this assembler does not know about.
    Unknown { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageStart {
    pub message: MessageStartBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageStartBody {
    pub id: String,
    pub model: String,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub usage: StartUsage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartUsage {
    pub input_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentBlockStart {
    pub index: usize,
    pub content_block: BlockStart,
}

/// The `content_block` of a `content_block_start` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse { id: String, name: String },
    #[serde(skip)]
    Unsupported { block_type: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentBlockDelta {
    pub index: usize,
    pub delta: BlockDelta,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(skip)]
    Unsupported { delta_type: String },
}

impl BlockDelta {
    pub fn kind(&self) -> &str {
        match self {
            BlockDelta::TextDelta { .. } => "text_delta",
            BlockDelta::InputJsonDelta { .. } => "input_json_delta",
            BlockDelta::Unsupported { delta_type } => delta_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContentBlockStop {
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub delta: MessageDeltaBody,
    pub usage: DeltaUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeltaUsage {
    pub output_tokens: u64,
}

/// Provider-reported failure carried by an `error` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    pub payload: Value,
}

impl ErrorEvent {
    fn from_payload(payload: Value) -> Self {
        let detail = payload.get("error");
        let error_type = detail
            .and_then(|d| d.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let message = detail
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        Self {
            error_type,
            message,
            payload,
        }
    }
}

impl From<ErrorEvent> for StreamError {
    fn from(event: ErrorEvent) -> Self {
        StreamError::ProtocolErrorEvent {
            error_type: event.error_type,
            message: event.message,
            payload: event.payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WireBlockStart {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct WireBlockDelta {
    index: usize,
    delta: Value,
}

fn typed<T: DeserializeOwned>(event_type: &str, value: &Value) -> Result<T, StreamError> {
    T::deserialize(value).map_err(|e| StreamError::malformed(event_type, e.to_string()))
}

/// Decode a tagged sub-object, falling back to `unsupported` for tags outside `known`.
fn tagged<T: DeserializeOwned>(
    event_type: &str,
    field: &str,
    value: &Value,
    known: &[&str],
    unsupported: impl FnOnce(String) -> T,
) -> Result<T, StreamError> {
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::malformed(event_type, format!("missing string `{field}.type`")))?;
    if known.contains(&tag) {
        typed(event_type, value)
    } else {
        Ok(unsupported(tag.to_string()))
    }
}

impl StreamEvent {
    pub fn from_raw(raw: RawEvent) -> Result<Self, StreamError> {
        let RawEvent {
            event_type,
            payload,
        } = raw;
        let event = match event_type.as_str() {
            "message_start" => StreamEvent::MessageStart(typed(&event_type, &payload)?),
            "content_block_start" => {
                let wire: WireBlockStart = typed(&event_type, &payload)?;
                let content_block = tagged(
                    &event_type,
                    "content_block",
                    &wire.content_block,
                    &["text", "tool_use"],
                    |block_type| BlockStart::Unsupported { block_type },
                )?;
                StreamEvent::ContentBlockStart(ContentBlockStart {
                    index: wire.index,
                    content_block,
                })
            }
            "content_block_delta" => {
                let wire: WireBlockDelta = typed(&event_type, &payload)?;
                let delta = tagged(
                    &event_type,
                    "delta",
                    &wire.delta,
                    &["text_delta", "input_json_delta"],
                    |delta_type| BlockDelta::Unsupported { delta_type },
                )?;
                StreamEvent::ContentBlockDelta(ContentBlockDelta {
                    index: wire.index,
                    delta,
                })
            }
            "content_block_stop" => StreamEvent::ContentBlockStop(typed(&event_type, &payload)?),
            "message_delta" => StreamEvent::MessageDelta(typed(&event_type, &payload)?),
            "message_stop" => StreamEvent::MessageStop,
            "ping" => StreamEvent::Ping,
            "error" => StreamEvent::Error(ErrorEvent::from_payload(payload)),
            _ => StreamEvent::Unknown { event_type },
        };
        Ok(event)
    }
}
