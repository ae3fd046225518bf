//! Anthropic Messages streaming support.
//!
//! A response body flows through four stages: [`crate::sse`] frames and
//! decodes lines, [`event`] types each payload, [`dispatcher`] applies events
//! to an [`accumulator::Accumulator`], and [`driver`] runs the loop on a
//! background task and hands back the finished [`StreamedMessage`].

pub mod accumulator;
pub mod dispatcher;
pub mod driver;
pub mod event;

pub use accumulator::{Segment, StreamedMessage, TextSegment, ToolUseSegment, Usage};
pub use dispatcher::{Diagnostic, DiagnosticHook, Flow, MessageAssembler};
pub use driver::{PendingMessage, StreamDriver};
pub use event::StreamEvent;
