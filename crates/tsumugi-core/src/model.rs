use serde::{Deserialize, Serialize};

use crate::message::{AIContent, UsageMetadata};

/// Result of a chat model generation, as seen by the orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    /// The generated message.
    pub message: AIContent,

    /// Token usage metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,

    /// Why generation stopped, when the provider reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}
