use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default cap on a single SSE line (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

/// Descriptive labels attached to the tracing span of a streamed call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(default)]
    pub span_name: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_type: String,
    #[serde(default)]
    pub provider: String,
}

impl TraceMetadata {
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            span_name: String::new(),
            model_name: model_name.into(),
            model_type: "chat".into(),
            provider: provider.into(),
        }
    }

    pub fn with_span_name(mut self, span_name: impl Into<String>) -> Self {
        self.span_name = span_name.into();
        self
    }
}

/// Configuration for a single streamed response assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique identifier for this run, recorded on every log line.
    pub run_id: Uuid,

    /// Tags for filtering and categorization.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Arbitrary metadata key-value pairs.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Labels for the tracing span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceMetadata>,

    /// Longest accepted line, in bytes, before the stream is aborted.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            trace: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_trace(mut self, trace: TraceMetadata) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }
}
