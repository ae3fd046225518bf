use thiserror::Error;

/// Boxed error returned by caller-supplied collaborators (sinks, transports).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for the Tsumugi library.
#[derive(Debug, Error)]
pub enum TsumugiError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures that terminate the assembly of a streamed response.
///
/// Every variant is fatal: the stream stops being consumed, the transport is
/// released, and the error is the only outcome handed back to the caller.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A `data:` line did not carry valid JSON (or valid UTF-8).
    #[error("Failed to decode event payload: {0}")]
    Decode(String),

    /// A field the assembler reads is missing or has the wrong shape.
    #[error("Malformed {event_type} event: {reason}")]
    MalformedEvent { event_type: String, reason: String },

    /// A content index was referenced out of sequence or before it was started.
    #[error("Content index {index} out of range ({started} blocks started)")]
    IndexOutOfRange { index: usize, started: usize },

    #[error("Cannot apply {delta} to {segment} block at index {index}")]
    VariantMismatch {
        index: usize,
        segment: &'static str,
        delta: &'static str,
    },

    #[error("Content block {index} is already closed")]
    BlockClosed { index: usize },

    #[error("Invalid tool arguments for block {index}: {reason}")]
    ToolArgumentParse { index: usize, reason: String },

    /// The caller's streaming sink returned an error.
    #[error("Streaming sink failed: {0}")]
    Sink(#[source] BoxError),

    /// The provider sent an explicit `error` event.
    #[error("Provider error ({error_type}): {message}")]
    ProtocolErrorEvent {
        error_type: String,
        message: String,
        payload: serde_json::Value,
    },

    #[error("Stream ended before message_stop")]
    TruncatedStream,

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("Line exceeds the {limit} byte limit")]
    LineTooLong { limit: usize },

    /// The assembly task went away without reporting a result.
    #[error("Stream task ended without a result")]
    Interrupted,
}

impl StreamError {
    pub fn malformed(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::MalformedEvent {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TsumugiError>;
