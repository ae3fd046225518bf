pub mod config;
pub mod error;
pub mod message;
pub mod model;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{StreamConfig, TraceMetadata};
    pub use crate::error::{BoxError, Result, StreamError, TsumugiError};
    pub use crate::message::{AIContent, ToolCall, UsageMetadata};
    pub use crate::model::ChatResult;
}
