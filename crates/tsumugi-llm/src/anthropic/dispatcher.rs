//! Event routing for the Anthropic Messages stream.
//!
//! [`MessageAssembler`] is a flat dispatch table over event types. Structural
//! fields it depends on (index continuity, required fields on start and delta
//! events) are checked strictly and fail fast; unknown event types, block
//! types, and delta kinds are reported and skipped so that protocol additions
//! do not break the stream.

use std::sync::Arc;

use tsumugi_core::error::StreamError;

use super::accumulator::{Accumulator, Applied, StreamedMessage};
use super::event::{BlockDelta, BlockStart, ContentBlockDelta, StreamEvent};
use crate::sink::StreamingSink;
use crate::sse::decode_line;

/// Protocol additions the assembler skipped over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    UnknownEvent { event_type: String },
    UnsupportedBlock { index: usize, block_type: String },
    UnsupportedDelta { index: usize, delta_type: String },
}

pub type DiagnosticHook = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Whether the stream should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

pub struct MessageAssembler {
    accumulator: Accumulator,
    sink: Option<Box<dyn StreamingSink>>,
    diagnostics: Option<DiagnosticHook>,
    finished: bool,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            accumulator: Accumulator::new(),
            sink: None,
            diagnostics: None,
            finished: false,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn StreamingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_diagnostics(mut self, hook: DiagnosticHook) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    /// The message as assembled so far.
    pub fn message(&self) -> &StreamedMessage {
        self.accumulator.message()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode and dispatch one raw SSE line.
    pub fn handle_line(&mut self, line: &str) -> Result<Flow, StreamError> {
        if self.finished {
            return Ok(Flow::Done);
        }
        match decode_line(line)? {
            Some(raw) => self.handle_event(StreamEvent::from_raw(raw)?),
            None => Ok(Flow::Continue),
        }
    }

    /// Apply one event. Once `message_stop` has been seen nothing else is evaluated.
    pub fn handle_event(&mut self, event: StreamEvent) -> Result<Flow, StreamError> {
        if self.finished {
            return Ok(Flow::Done);
        }
        match event {
            StreamEvent::MessageStart(start) => {
                tracing::debug!(id = %start.message.id, model = %start.message.model, "message_start");
                self.accumulator.start_message(start.message)?;
            }
            StreamEvent::ContentBlockStart(start) => {
                let unsupported = match &start.content_block {
                    BlockStart::Unsupported { block_type } => Some(block_type.clone()),
                    BlockStart::Text { .. } | BlockStart::ToolUse { .. } => None,
                };
                self.accumulator.start_block(start.index, start.content_block)?;
                if let Some(block_type) = unsupported {
                    tracing::debug!(index = start.index, %block_type, "skipping unsupported content block");
                    self.report(Diagnostic::UnsupportedBlock {
                        index: start.index,
                        block_type,
                    });
                }
            }
            StreamEvent::ContentBlockDelta(delta) => self.apply_delta(delta)?,
            StreamEvent::ContentBlockStop(stop) => self.accumulator.close_block(stop.index)?,
            StreamEvent::MessageDelta(delta) => self.accumulator.apply_message_delta(delta)?,
            StreamEvent::MessageStop => {
                self.finished = true;
                return Ok(Flow::Done);
            }
            StreamEvent::Ping => {}
            StreamEvent::Error(error) => {
                tracing::warn!(error_type = %error.error_type, error_message = %error.message, "provider error event");
                return Err(error.into());
            }
            StreamEvent::Unknown { event_type } => {
                tracing::warn!(%event_type, "ignoring unknown stream event");
                self.report(Diagnostic::UnknownEvent { event_type });
            }
        }
        Ok(Flow::Continue)
    }

    fn apply_delta(&mut self, delta: ContentBlockDelta) -> Result<(), StreamError> {
        let index = delta.index;
        match delta.delta {
            BlockDelta::TextDelta { text } => {
                if self.accumulator.append_text(index, &text)? == Applied::Yes {
                    if let Some(sink) = self.sink.as_mut() {
                        sink.on_text(&text).map_err(StreamError::Sink)?;
                    }
                }
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                self.accumulator.append_arguments(index, &partial_json)?;
            }
            BlockDelta::Unsupported { delta_type } => {
                self.accumulator.check_open(index)?;
                tracing::debug!(index, %delta_type, "skipping unsupported delta");
                self.report(Diagnostic::UnsupportedDelta { index, delta_type });
            }
        }
        Ok(())
    }

    fn report(&self, diagnostic: Diagnostic) {
        if let Some(hook) = &self.diagnostics {
            hook(&diagnostic);
        }
    }

    /// Hand over the final message; fails unless `message_stop` was seen.
    pub fn finish(self) -> Result<StreamedMessage, StreamError> {
        if !self.finished {
            return Err(StreamError::TruncatedStream);
        }
        Ok(self.accumulator.into_message())
    }
}
