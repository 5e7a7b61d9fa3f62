use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::protocol::canonical::StreamEvent;

use super::sequencer::StreamSequencer;

/// One chunk of an upstream body, raw or already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Bytes(Bytes),
    Text(String),
}

impl From<Bytes> for StreamChunk {
    fn from(bytes: Bytes) -> Self {
        StreamChunk::Bytes(bytes)
    }
}

impl From<Vec<u8>> for StreamChunk {
    fn from(bytes: Vec<u8>) -> Self {
        StreamChunk::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for StreamChunk {
    fn from(text: String) -> Self {
        StreamChunk::Text(text)
    }
}

impl From<&'static str> for StreamChunk {
    fn from(text: &'static str) -> Self {
        StreamChunk::Text(text.to_owned())
    }
}

/// Events produced by the chunk being drained. Bounded by what one chunk yields.
struct PendingEvents {
    events: VecDeque<StreamEvent>,
    scratch: Vec<StreamEvent>,
}

impl PendingEvents {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            scratch: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    #[inline]
    fn extend_from_scratch(&mut self) {
        self.events.extend(self.scratch.drain(..));
    }
}

enum Phase {
    Reading,
    /// Input ended or the completion was emitted; drain what is queued.
    Draining,
    /// An error is queued behind the pending events.
    Failing(StreamError),
    Finished,
}

struct EventState<S> {
    chunks: S,
    sequencer: StreamSequencer,
    cancel: CancellationToken,
    pending: PendingEvents,
    phase: Phase,
}

/// Drive `sequencer` from a chunk source, yielding events as they become
/// available.
///
/// The stream ends after the `Completion` event or after the first error.
/// Cancellation is checked at every chunk boundary and raced against the
/// pending read; it yields `Err(StreamError::Cancelled)` and never a
/// completion.
pub fn stream_events<S, C, E>(
    chunks: S,
    sequencer: StreamSequencer,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent, StreamError>> + Send
where
    S: Stream<Item = Result<C, E>> + Send + Unpin,
    C: Into<StreamChunk> + Send,
    E: Into<StreamError> + Send,
{
    let state = EventState {
        chunks,
        sequencer,
        cancel,
        pending: PendingEvents::with_capacity(8),
        phase: Phase::Reading,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() && !matches!(state.phase, Phase::Finished) {
                state.sequencer.abort();
                state.pending.events.clear();
                state.phase = Phase::Finished;
                tracing::debug!("stream cancelled by caller");
                return Some((Err(StreamError::Cancelled), state));
            }
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            match std::mem::replace(&mut state.phase, Phase::Finished) {
                Phase::Finished | Phase::Draining => return None,
                Phase::Failing(err) => return Some((Err(err), state)),
                Phase::Reading => state.phase = Phase::Reading,
            }

            let next = tokio::select! {
                biased;
                () = state.cancel.cancelled() => continue,
                next = state.chunks.next() => next,
            };

            let result = match next {
                Some(Ok(chunk)) => match Into::<StreamChunk>::into(chunk) {
                    StreamChunk::Bytes(bytes) => state
                        .sequencer
                        .push_bytes_into(&bytes, &mut state.pending.scratch),
                    StreamChunk::Text(text) => state
                        .sequencer
                        .push_text_into(&text, &mut state.pending.scratch),
                },
                Some(Err(err)) => {
                    let err: StreamError = err.into();
                    tracing::warn!(error = %err, "upstream body failed mid-stream");
                    state.sequencer.abort();
                    Err(err)
                }
                None => {
                    let result = state.sequencer.finish_into(&mut state.pending.scratch);
                    if result.is_ok() {
                        state.phase = Phase::Draining;
                    }
                    result
                }
            };
            state.pending.extend_from_scratch();

            match result {
                Err(err) => state.phase = Phase::Failing(err),
                Ok(()) if state.sequencer.is_terminal() => {
                    if matches!(state.phase, Phase::Reading) {
                        state.phase = Phase::Draining;
                    }
                }
                Ok(()) => {}
            }
        }
    })
}
