//! In-progress state of a streamed message.

use serde::Serialize;
use serde_json::{Map, Value};

use tsumugi_core::error::StreamError;
use tsumugi_core::message::{AIContent, ToolCall, UsageMetadata};
use tsumugi_core::model::ChatResult;

use super::event::{BlockStart, MessageDelta, MessageStartBody};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TextSegment {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolUseSegment {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub(crate) partial_arguments: String,
    /// Parsed arguments; `None` until the block is closed.
    #[serde(rename = "input", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl ToolUseSegment {
    /// Raw argument JSON received so far.
    pub fn partial_arguments(&self) -> &str {
        &self.partial_arguments
    }
}

/// One content unit of a completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text(TextSegment),
    ToolUse(ToolUseSegment),
}

impl Segment {
    pub fn kind(&self) -> &'static str {
        match self {
            Segment::Text(_) => "text",
            Segment::ToolUse(_) => "tool_use",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text(t) => Some(&t.text),
            Segment::ToolUse(_) => None,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUseSegment> {
        match self {
            Segment::Text(_) => None,
            Segment::ToolUse(t) => Some(t),
        }
    }
}

/// A fully assembled streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamedMessage {
    pub id: String,
    pub model: String,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    pub content: Vec<Segment>,
}

impl StreamedMessage {
    /// Concatenated text of every text segment.
    pub fn text(&self) -> String {
        self.content.iter().filter_map(Segment::as_text).collect()
    }

    /// Tool invocations whose arguments were parsed.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(Segment::as_tool_use)
            .filter_map(|tool| {
                tool.arguments.as_ref().map(|args| ToolCall {
                    id: tool.id.clone(),
                    name: tool.name.clone(),
                    arguments: Value::Object(args.clone()),
                })
            })
            .collect()
    }

    pub fn usage_metadata(&self) -> UsageMetadata {
        UsageMetadata::new(self.usage.input_tokens, self.usage.output_tokens)
    }
}

impl From<StreamedMessage> for ChatResult {
    fn from(message: StreamedMessage) -> Self {
        let usage = message.usage_metadata();
        ChatResult {
            message: AIContent {
                content: message.text(),
                tool_calls: message.tool_calls(),
                usage: Some(usage.clone()),
            },
            usage: Some(usage),
            stop_reason: message.stop_reason,
        }
    }
}

/// Bookkeeping for one protocol index.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Position in `content`; `None` for block types this assembler skips.
    position: Option<usize>,
    closed: bool,
}

/// Outcome of routing a delta to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Yes,
    /// The block is of a skipped type; the delta was dropped.
    Skipped,
}

/// Owns the message under construction and enforces block sequencing.
#[derive(Debug, Default)]
pub struct Accumulator {
    message: StreamedMessage,
    slots: Vec<Slot>,
    started: bool,
    output_recorded: bool,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self) -> &StreamedMessage {
        &self.message
    }

    pub fn into_message(self) -> StreamedMessage {
        self.message
    }

    /// Number of blocks started so far, including skipped ones.
    pub fn blocks_started(&self) -> usize {
        self.slots.len()
    }

    pub fn start_message(&mut self, body: MessageStartBody) -> Result<(), StreamError> {
        if self.started {
            return Err(StreamError::malformed(
                "message_start",
                "message already started",
            ));
        }
        self.started = true;
        self.message.id = body.id;
        self.message.model = body.model;
        self.message.role = body.role;
        self.message.kind = body.kind;
        self.message.usage.input_tokens = body.usage.input_tokens;
        Ok(())
    }

    pub fn start_block(&mut self, index: usize, block: BlockStart) -> Result<(), StreamError> {
        if index != self.slots.len() {
            return Err(StreamError::IndexOutOfRange {
                index,
                started: self.slots.len(),
            });
        }
        let segment = match block {
            BlockStart::Text { text } => Some(Segment::Text(TextSegment { text })),
            BlockStart::ToolUse { id, name } => Some(Segment::ToolUse(ToolUseSegment {
                id,
                name,
                ..Default::default()
            })),
            BlockStart::Unsupported { .. } => None,
        };
        let position = segment.map(|segment| {
            self.message.content.push(segment);
            self.message.content.len() - 1
        });
        self.slots.push(Slot {
            position,
            closed: false,
        });
        Ok(())
    }

    /// Resolve an index to an open block, or report why it cannot take input.
    fn open_slot(&self, index: usize) -> Result<Slot, StreamError> {
        let slot = self
            .slots
            .get(index)
            .copied()
            .ok_or(StreamError::IndexOutOfRange {
                index,
                started: self.slots.len(),
            })?;
        if slot.closed {
            return Err(StreamError::BlockClosed { index });
        }
        Ok(slot)
    }

    /// Check that `index` addresses an open block without touching it.
    pub fn check_open(&self, index: usize) -> Result<(), StreamError> {
        self.open_slot(index).map(|_| ())
    }

    pub fn append_text(&mut self, index: usize, fragment: &str) -> Result<Applied, StreamError> {
        let Some(position) = self.open_slot(index)?.position else {
            return Ok(Applied::Skipped);
        };
        match &mut self.message.content[position] {
            Segment::Text(segment) => {
                segment.text.push_str(fragment);
                Ok(Applied::Yes)
            }
            Segment::ToolUse(_) => Err(StreamError::VariantMismatch {
                index,
                segment: "tool_use",
                delta: "text_delta",
            }),
        }
    }

    pub fn append_arguments(
        &mut self,
        index: usize,
        fragment: &str,
    ) -> Result<Applied, StreamError> {
        let Some(position) = self.open_slot(index)?.position else {
            return Ok(Applied::Skipped);
        };
        match &mut self.message.content[position] {
            Segment::ToolUse(segment) => {
                segment.partial_arguments.push_str(fragment);
                Ok(Applied::Yes)
            }
            Segment::Text(_) => Err(StreamError::VariantMismatch {
                index,
                segment: "text",
                delta: "input_json_delta",
            }),
        }
    }

    /// Close a block; tool-use blocks parse their accumulated arguments here.
    pub fn close_block(&mut self, index: usize) -> Result<(), StreamError> {
        let slot = self.open_slot(index)?;
        if let Some(position) = slot.position {
            if let Segment::ToolUse(segment) = &mut self.message.content[position] {
                segment.arguments = Some(parse_arguments(index, &segment.partial_arguments)?);
            }
        }
        self.slots[index].closed = true;
        Ok(())
    }

    pub fn apply_message_delta(&mut self, delta: MessageDelta) -> Result<(), StreamError> {
        if self.output_recorded {
            return Err(StreamError::malformed(
                "message_delta",
                "output usage already recorded",
            ));
        }
        self.output_recorded = true;
        if let Some(stop_reason) = delta.delta.stop_reason {
            self.message.stop_reason = Some(stop_reason);
        }
        if let Some(stop_sequence) = delta.delta.stop_sequence {
            self.message.stop_sequence = Some(stop_sequence);
        }
        self.message.usage.output_tokens = delta.usage.output_tokens;
        Ok(())
    }
}

fn parse_arguments(index: usize, raw: &str) -> Result<Map<String, Value>, StreamError> {
    // Tools without parameters may stream no argument JSON at all.
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw).map_err(|e| StreamError::ToolArgumentParse {
        index,
        reason: e.to_string(),
    })
}
