//! Per-call stream orchestration.
//!
//! Each raw chunk flows decode -> frame -> parse -> classify -> emit. The
//! sequencer owns every per-stream buffer and assembles the single
//! [`FinalResponse`] that ends a successful stream.

use std::time::Instant;

use crate::config::StreamSettings;
use crate::error::StreamError;
use crate::observability::{log_stream_complete, token_counter};
use crate::protocol::canonical::{FinalResponse, ResponseMetadata, StreamEvent, Usage};
use crate::protocol::openai_chat::{ChatCompletionChunk, ChunkChoice};

use super::decoder::Utf8Decoder;
use super::reasoning::{ReasoningExtractor, ReasoningFields, Segment, Segments};
use super::sse::{FrameBatch, FrameBuffer};
use super::tool_calls::ToolCallAggregator;

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// No input received yet.
    Idle,
    Streaming,
    /// The completion was emitted; further input is ignored.
    Completed,
    /// A protocol error or cancellation ended the stream without a completion.
    Aborted,
}

/// Why a stream ended without a finish reason.
#[derive(Debug, Clone, Copy)]
enum EndCause {
    DoneSentinel,
    EndOfInput,
}

impl EndCause {
    fn as_str(self) -> &'static str {
        match self {
            EndCause::DoneSentinel => "[DONE]",
            EndCause::EndOfInput => "end of input",
        }
    }
}

/// Turns the raw chunks of one chat-completion stream into [`StreamEvent`]s.
///
/// Create one per outbound call. Events are appended to a caller-supplied
/// buffer so the hot path reuses allocations.
#[derive(Debug)]
pub struct StreamSequencer {
    settings: StreamSettings,
    call_metadata: ResponseMetadata,
    metadata: ResponseMetadata,
    decoder: Utf8Decoder,
    frames: FrameBuffer,
    tool_calls: ToolCallAggregator,
    reasoning: ReasoningExtractor,
    text: String,
    terminal_text: Option<String>,
    usage: Option<Usage>,
    warnings: Vec<String>,
    state: SequencerState,
    /// A finish reason was seen and the completion waits for a usage frame.
    awaiting_usage: bool,
    started_at: Option<Instant>,
}

impl StreamSequencer {
    #[must_use]
    pub fn new(metadata: ResponseMetadata, settings: &StreamSettings) -> Self {
        let reasoning = ReasoningExtractor::new(
            ReasoningFields::from_names(&settings.reasoning_fields),
            &settings.reasoning_tags,
        );
        Self {
            settings: settings.clone(),
            metadata: metadata.clone(),
            call_metadata: metadata,
            decoder: Utf8Decoder::new(),
            frames: FrameBuffer::new(),
            tool_calls: ToolCallAggregator::new(),
            reasoning,
            text: String::new(),
            terminal_text: None,
            usage: None,
            warnings: Vec::new(),
            state: SequencerState::Idle,
            awaiting_usage: false,
            started_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// The tool-call aggregator for the stream in progress.
    #[must_use]
    pub fn tool_calls(&self) -> &ToolCallAggregator {
        &self.tool_calls
    }

    /// Whether the sequencer will ignore further input.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SequencerState::Completed | SequencerState::Aborted
        )
    }

    /// Feed one raw byte chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Protocol`] when the chunk completes an explicit
    /// vendor error frame. Events produced before the error frame are still
    /// appended to `out`.
    pub fn push_bytes_into(
        &mut self,
        bytes: &[u8],
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), StreamError> {
        if !self.begin_input() {
            return Ok(());
        }
        let mut text = String::with_capacity(bytes.len());
        self.decoder.decode_into(bytes, &mut text);
        let batch = self.frames.push(&text);
        self.apply_batch(batch, out)
    }

    /// Feed one chunk that is already text.
    ///
    /// # Errors
    ///
    /// See [`StreamSequencer::push_bytes_into`].
    pub fn push_text_into(
        &mut self,
        text: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), StreamError> {
        if !self.begin_input() {
            return Ok(());
        }
        let batch = if self.decoder.pending_len() == 0 {
            self.frames.push(text)
        } else {
            let mut decoded = self.decoder.flush();
            decoded.push_str(text);
            self.frames.push(&decoded)
        };
        self.apply_batch(batch, out)
    }

    /// Signal end of input. Emits the completion if none was emitted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Protocol`] when the unterminated last line is an
    /// explicit vendor error frame.
    pub fn finish_into(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), StreamError> {
        if self.is_terminal() {
            return Ok(());
        }
        let tail = self.decoder.flush();
        if !tail.is_empty() {
            let batch = self.frames.push(&tail);
            self.apply_batch(batch, out)?;
            if self.is_terminal() {
                return Ok(());
            }
        }
        let batch = self.frames.finish();
        self.apply_batch(batch, out)?;
        self.complete_at_end(EndCause::EndOfInput, out);
        Ok(())
    }

    /// Feed one raw byte chunk and return the events it produced.
    ///
    /// # Errors
    ///
    /// See [`StreamSequencer::push_bytes_into`].
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
        let mut out = Vec::new();
        self.push_bytes_into(bytes, &mut out)?;
        Ok(out)
    }

    /// Feed one text chunk and return the events it produced.
    ///
    /// # Errors
    ///
    /// See [`StreamSequencer::push_bytes_into`].
    pub fn push_text(&mut self, text: &str) -> Result<Vec<StreamEvent>, StreamError> {
        let mut out = Vec::new();
        self.push_text_into(text, &mut out)?;
        Ok(out)
    }

    /// Signal end of input and return the remaining events.
    ///
    /// # Errors
    ///
    /// See [`StreamSequencer::finish_into`].
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        let mut out = Vec::new();
        self.finish_into(&mut out)?;
        Ok(out)
    }

    /// Stop the stream without a completion. Used for cancellation.
    pub fn abort(&mut self) {
        self.clear_stream_state();
        self.state = SequencerState::Aborted;
    }

    /// Return to `Idle` so the sequencer can serve a new call.
    pub fn reset(&mut self) {
        self.clear_stream_state();
        self.state = SequencerState::Idle;
    }

    fn begin_input(&mut self) -> bool {
        match self.state {
            SequencerState::Idle => {
                self.state = SequencerState::Streaming;
                self.started_at = Some(Instant::now());
                true
            }
            SequencerState::Streaming => true,
            SequencerState::Completed | SequencerState::Aborted => false,
        }
    }

    fn apply_batch(
        &mut self,
        batch: FrameBatch,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), StreamError> {
        for frame in batch.frames {
            self.apply_frame(frame, out);
            if self.is_terminal() {
                return Ok(());
            }
        }
        if let Some(err) = batch.error {
            tracing::warn!(
                provider = self.call_metadata.provider.as_str(),
                model = self.call_metadata.model.as_str(),
                error = %err,
                "upstream reported an error mid-stream"
            );
            self.abort();
            return Err(err);
        }
        if batch.done {
            self.complete_at_end(EndCause::DoneSentinel, out);
        }
        Ok(())
    }

    fn apply_frame(&mut self, frame: ChatCompletionChunk, out: &mut Vec<StreamEvent>) {
        if self.metadata.response_id.is_none() {
            self.metadata.response_id = frame.id;
        }
        if self.metadata.response_model.is_none() {
            self.metadata.response_model = frame.model;
        }
        if self.metadata.created.is_none() {
            self.metadata.created = frame.created;
        }
        if let Some(usage) = frame.usage {
            self.usage = Some(usage.into());
        }

        if self.awaiting_usage {
            if self.usage.is_some() {
                self.complete(out);
            }
            return;
        }

        let mut finished = false;
        for choice in &frame.choices {
            if choice.index != 0 {
                tracing::debug!(index = choice.index, "ignoring non-primary choice");
                continue;
            }
            finished |= self.apply_choice(choice, out);
        }

        if finished {
            if self.usage.is_some() || !self.settings.defer_completion_for_usage {
                self.complete(out);
            } else {
                self.awaiting_usage = true;
            }
        }
    }

    /// Returns `true` when the choice carries a finish reason.
    fn apply_choice(&mut self, choice: &ChunkChoice, out: &mut Vec<StreamEvent>) -> bool {
        let mut segments = Segments::new();
        self.reasoning.process_delta(&choice.delta, &mut segments);
        self.emit_segments(segments, out);

        if let Some(partials) = choice.delta.tool_calls.as_deref() {
            for partial in partials {
                if let Some(call) = self.tool_calls.process_delta(partial) {
                    out.push(StreamEvent::ToolCallDelta(call));
                }
            }
        }

        if let Some(content) = choice.message.as_ref().and_then(|m| m.content.as_ref()) {
            self.terminal_text = Some(content.clone());
        }

        match choice.finish_reason.as_deref() {
            Some(reason) if !reason.is_empty() => {
                self.metadata.finish_reason = Some(reason.to_owned());
                true
            }
            _ => false,
        }
    }

    fn emit_segments(&mut self, segments: Segments, out: &mut Vec<StreamEvent>) {
        for segment in segments {
            match segment {
                Segment::Text(text) => {
                    self.text.push_str(&text);
                    out.push(StreamEvent::TextDelta(text));
                }
                Segment::Thinking(text) => out.push(StreamEvent::ThinkingDelta(text)),
            }
        }
    }

    fn complete_at_end(&mut self, cause: EndCause, out: &mut Vec<StreamEvent>) {
        if self.is_terminal() {
            return;
        }
        if !self.awaiting_usage {
            tracing::debug!(cause = cause.as_str(), "stream ended without a finish reason");
            self.warnings.push(format!(
                "stream ended at {} without a finish reason",
                cause.as_str()
            ));
        }
        self.complete(out);
    }

    fn complete(&mut self, out: &mut Vec<StreamEvent>) {
        let mut segments = Segments::new();
        if self.reasoning.finish(&mut segments) {
            self.warnings
                .push("reasoning block was not closed before the stream ended".to_string());
        }
        self.emit_segments(segments, out);

        let late = self.reasoning.late_field_chunks();
        if late > 0 {
            self.warnings.push(format!(
                "{late} reasoning chunk(s) arrived after visible content and were not streamed"
            ));
        }
        let dropped = self.tool_calls.dropped_fragments();
        if dropped > 0 {
            self.warnings.push(format!(
                "dropped {dropped} tool-call fragment(s) for indices without an id"
            ));
        }
        let conflicting = self.tool_calls.conflicting_ids();
        if conflicting > 0 {
            self.warnings.push(format!(
                "ignored {conflicting} conflicting tool-call id(s)"
            ));
        }

        let text = if self.settings.accumulate_text {
            std::mem::take(&mut self.text)
        } else {
            self.terminal_text.take().unwrap_or_default()
        };
        let mut response = FinalResponse {
            text,
            tool_calls: self.tool_calls.completed_calls(),
            usage: self.usage.unwrap_or_default(),
            thinking: self.reasoning.thinking().to_owned(),
            warnings: std::mem::take(&mut self.warnings),
            metadata: std::mem::take(&mut self.metadata),
        };

        if self.usage.is_none() && self.settings.estimate_missing_usage {
            let mut estimate_input = response.clone();
            if estimate_input.text.is_empty() {
                estimate_input.text = std::mem::take(&mut self.text);
            }
            let completion = token_counter::estimate_completion_tokens(&estimate_input);
            response.usage = token_counter::merge_usage(&Usage::default(), 0, completion);
            response
                .warnings
                .push("usage was not reported; completion tokens are estimated".to_string());
        }

        if let Some(started_at) = self.started_at {
            log_stream_complete(&response, started_at);
        }
        out.push(StreamEvent::Completion(Box::new(response)));

        self.clear_stream_state();
        self.state = SequencerState::Completed;
    }

    fn clear_stream_state(&mut self) {
        self.metadata = self.call_metadata.clone();
        self.decoder.reset();
        self.frames.reset();
        self.tool_calls.reset();
        self.reasoning.reset();
        self.text.clear();
        self.terminal_text = None;
        self.usage = None;
        self.warnings.clear();
        self.awaiting_usage = false;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer() -> StreamSequencer {
        StreamSequencer::new(
            ResponseMetadata::new("openai", "gpt-4o"),
            &StreamSettings::default(),
        )
    }

    fn completion(events: &[StreamEvent]) -> &FinalResponse {
        match events.last() {
            Some(StreamEvent::Completion(response)) => response,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_text_then_completion() {
        let mut seq = sequencer();
        let mut events = seq
            .push_text(
                "data: {\"id\":\"c1\",\"model\":\"gpt-4o-2024\",\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            )
            .unwrap();
        assert_eq!(seq.state(), SequencerState::Streaming);
        events.extend(
            seq.push_text(
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n",
            )
            .unwrap(),
        );
        assert_eq!(events[0], StreamEvent::TextDelta("Hi".to_string()));
        let response = completion(&events);
        assert_eq!(response.usage.total_tokens, 2);
        assert_eq!(response.metadata.response_id.as_deref(), Some("c1"));
        assert_eq!(response.metadata.response_model.as_deref(), Some("gpt-4o-2024"));
        assert_eq!(response.metadata.finish_reason.as_deref(), Some("stop"));
        assert!(response.warnings.is_empty());
        assert_eq!(seq.state(), SequencerState::Completed);
    }

    #[test]
    fn test_input_after_completion_is_ignored() {
        let mut seq = sequencer();
        seq.push_text("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":1}}\n")
            .unwrap();
        assert!(seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n")
            .unwrap()
            .is_empty());
        assert!(seq.finish().unwrap().is_empty());
    }

    #[test]
    fn test_usage_after_finish_is_awaited() {
        let mut seq = sequencer();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"a\"},\"finish_reason\":\"stop\"}]}\n")
            .unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("a".to_string())]);
        let events = seq
            .push_text("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1}}\n")
            .unwrap();
        let response = completion(&events);
        assert_eq!(response.usage.total_tokens, 6);
        assert!(response.warnings.is_empty());
    }

    #[test]
    fn test_deferred_completion_released_by_done() {
        let mut seq = sequencer();
        seq.push_text("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n")
            .unwrap();
        let events = seq.push_text("data: [DONE]\n").unwrap();
        let response = completion(&events);
        assert_eq!(response.usage, Usage::default());
        assert_eq!(response.metadata.finish_reason.as_deref(), Some("length"));
        assert!(response.warnings.is_empty());
    }

    #[test]
    fn test_no_defer_completes_on_finish_frame() {
        let settings = StreamSettings {
            defer_completion_for_usage: false,
            ..StreamSettings::default()
        };
        let mut seq = StreamSequencer::new(ResponseMetadata::new("p", "m"), &settings);
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n")
            .unwrap();
        assert!(events.last().is_some_and(StreamEvent::is_completion));
    }

    #[test]
    fn test_done_without_finish_reason_warns() {
        let mut seq = sequencer();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n")
            .unwrap();
        assert_eq!(events.len(), 2);
        let response = completion(&events);
        assert_eq!(response.warnings.len(), 1);
        assert!(response.warnings[0].contains("[DONE]"));
    }

    #[test]
    fn test_eof_without_finish_reason_warns() {
        let mut seq = sequencer();
        seq.push_text("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}")
            .unwrap();
        let events = seq.finish().unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("x".to_string()));
        let response = completion(&events);
        assert!(response.warnings[0].contains("end of input"));
    }

    #[test]
    fn test_terminal_message_content_is_final_text() {
        let mut seq = sequencer();
        seq.push_text("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n")
            .unwrap();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"message\":{\"content\":\"Hello\"},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":3}}\n")
            .unwrap();
        assert_eq!(completion(&events).text, "Hello");
    }

    #[test]
    fn test_final_text_empty_without_message_content() {
        let mut seq = sequencer();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":2}}\n")
            .unwrap();
        assert_eq!(completion(&events).text, "");
    }

    #[test]
    fn test_accumulate_text_setting() {
        let settings = StreamSettings {
            accumulate_text: true,
            ..StreamSettings::default()
        };
        let mut seq = StreamSequencer::new(ResponseMetadata::new("p", "m"), &settings);
        seq.push_text("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n")
            .unwrap();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":2}}\n")
            .unwrap();
        assert_eq!(completion(&events).text, "Hello");
    }

    #[test]
    fn test_error_frame_aborts_without_completion() {
        let mut seq = sequencer();
        let mut out = Vec::new();
        let err = seq
            .push_text_into(
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: {\"error\":{\"message\":\"rate limited\"}}\n",
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol { ref message, .. } if message == "rate limited"));
        assert_eq!(out, vec![StreamEvent::TextDelta("a".to_string())]);
        assert_eq!(seq.state(), SequencerState::Aborted);
        assert!(seq.finish().unwrap().is_empty());
    }

    #[test]
    fn test_tool_call_stream_assembles_final_calls() {
        let mut seq = sequencer();
        let mut events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n")
            .unwrap();
        events.extend(
            seq.push_text("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\\\"SF\\\"}\"}}]}}]}\n")
                .unwrap(),
        );
        assert!(seq.tool_calls().arguments_ready(0).is_some());
        events.extend(
            seq.push_text("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}],\"usage\":{\"total_tokens\":9}}\n")
                .unwrap(),
        );
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ToolCallDelta(call) => Some(call.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["call_1", "call_1"]);
        let response = completion(&events);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "get_weather");
        assert_eq!(response.tool_calls[0].function.arguments, "{\"city\":\"SF\"}");
    }

    #[test]
    fn test_dropped_fragment_is_reported() {
        let mut seq = sequencer();
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":2,\"function\":{\"arguments\":\"{}\"}}]},\"finish_reason\":\"tool_calls\"}],\"usage\":{\"total_tokens\":1}}\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        let response = completion(&events);
        assert!(response.tool_calls.is_empty());
        assert!(response.warnings[0].contains("dropped 1"));
    }

    #[test]
    fn test_unterminated_think_block_released_at_end() {
        let mut seq = sequencer();
        seq.push_text("data: {\"choices\":[{\"delta\":{\"content\":\"<think>plan</th\"}}]}\n")
            .unwrap();
        let events = seq.push_text("data: [DONE]\n").unwrap();
        assert_eq!(events[0], StreamEvent::ThinkingDelta("</th".to_string()));
        let response = completion(&events);
        assert_eq!(response.thinking, "plan</th");
        assert_eq!(response.warnings.len(), 2);
    }

    #[test]
    fn test_estimate_missing_usage() {
        let settings = StreamSettings {
            estimate_missing_usage: true,
            ..StreamSettings::default()
        };
        let mut seq = StreamSequencer::new(ResponseMetadata::new("p", "m"), &settings);
        seq.push_text("data: {\"choices\":[{\"delta\":{\"content\":\"abcdefgh\"},\"finish_reason\":\"stop\"}]}\n")
            .unwrap();
        let response_events = seq.finish().unwrap();
        let response = completion(&response_events);
        assert_eq!(response.usage.completion_tokens, 2);
        assert_eq!(response.usage.total_tokens, 2);
        assert!(response.warnings.iter().any(|w| w.contains("estimated")));
    }

    #[test]
    fn test_reset_returns_to_idle_with_fresh_state() {
        let mut seq = sequencer();
        seq.push_text("data: {\"id\":\"first\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"f\"}}]}}]}\n")
            .unwrap();
        seq.reset();
        assert_eq!(seq.state(), SequencerState::Idle);
        assert!(seq.tool_calls().is_empty());
        let events = seq
            .push_text("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]},\"finish_reason\":\"stop\"}],\"usage\":{\"total_tokens\":1}}\n")
            .unwrap();
        let response = completion(&events);
        assert!(response.tool_calls.is_empty());
        assert!(response.metadata.response_id.is_none());
    }

    #[test]
    fn test_split_utf8_bytes() {
        let mut seq = sequencer();
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n".as_bytes();
        let split = raw.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(seq.push_bytes(&raw[..split]).unwrap().is_empty());
        let events = seq.push_bytes(&raw[split..]).unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("héllo".to_string())]);
    }
}
