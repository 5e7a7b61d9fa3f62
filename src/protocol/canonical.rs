use serde::{Deserialize, Serialize};

/// Default `type` for tool calls whose deltas omit it.
pub const DEFAULT_TOOL_CALL_TYPE: &str = "function";

/// The function part of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

/// A tool call, either as an incremental fragment or fully assembled.
///
/// `id` is fixed per positional index for the lifetime of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub function: ToolCallFunction,
}

/// Token usage reported at the end of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Call and response metadata attached to the final response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Provider id of the outbound call.
    pub provider: String,
    /// Model id requested by the outbound call.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Model id as echoed by the upstream, when it differs or is reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ResponseMetadata {
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }
}

/// The assembled response, produced exactly once per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub thinking: String,
    pub warnings: Vec<String>,
    pub metadata: ResponseMetadata,
}

/// Typed incremental event produced by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallDelta(ToolCall),
    Completion(Box<FinalResponse>),
    /// A vendor error reported inside the stream. The sequencer itself raises
    /// these as [`crate::error::StreamError::Protocol`]; consumers that flatten
    /// results into events use this variant.
    ProtocolError(String),
}

impl StreamEvent {
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self, StreamEvent::Completion(_))
    }
}
