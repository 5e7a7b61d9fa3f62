//! Streaming response reconstruction.
//!
//! Leaf to root: [`decoder`] turns bytes into text, [`sse`] turns text into
//! frames, [`tool_calls`] and [`reasoning`] classify frame deltas, and
//! [`sequencer`] drives them per call. [`events`] adapts a sequencer to a
//! chunk source as an async stream.

pub mod decoder;
pub mod events;
pub mod reasoning;
pub mod sequencer;
pub mod sse;
pub mod tool_calls;

pub use decoder::Utf8Decoder;
pub use events::{stream_events, StreamChunk};
pub use reasoning::{ReasoningExtractor, ReasoningFields};
pub use sequencer::{SequencerState, StreamSequencer};
pub use sse::FrameBuffer;
pub use tool_calls::ToolCallAggregator;
