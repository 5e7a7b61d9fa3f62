//! Line-oriented SSE framing for chat-completion streams.
//!
//! Decoded text is split into complete `data:` lines, carrying any partial
//! trailing line across calls. Each payload is parsed into a
//! [`ChatCompletionChunk`]; `[DONE]` terminates framing.
use memchr::memchr_iter;
use smallvec::SmallVec;

use crate::error::StreamError;
use crate::protocol::openai_chat::stream::parse_chunk_payload;
use crate::protocol::openai_chat::ChatCompletionChunk;

const DONE_SENTINEL: &str = "[DONE]";
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Classification of a single complete line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLine<'a> {
    /// Blank line, comment, or any non-`data:` field.
    Skip,
    /// The terminal `[DONE]` sentinel.
    Done,
    /// A trimmed `data:` payload.
    Data(&'a str),
}

/// Classify one line: trim, keep only `data:` lines, trim the payload.
#[must_use]
pub fn classify_line(line: &str) -> FrameLine<'_> {
    let trimmed = line.trim();
    let Some(payload) = trimmed.strip_prefix("data:") else {
        return FrameLine::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        FrameLine::Skip
    } else if payload == DONE_SENTINEL {
        FrameLine::Done
    } else {
        FrameLine::Data(payload)
    }
}

/// Frames parsed out of one chunk of text.
#[derive(Debug, Default)]
pub struct FrameBatch {
    pub frames: SmallVec<[ChatCompletionChunk; 4]>,
    /// `[DONE]` was seen; nothing after it was parsed.
    pub done: bool,
    /// Explicit vendor error; frames before it are kept, nothing after it is parsed.
    pub error: Option<StreamError>,
}

/// Incremental line buffer and frame parser.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
    read_offset: usize,
    done: bool,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed text and return the complete, newline-terminated lines it closes.
    ///
    /// Line terminators (`\n` or `\r\n`) are stripped from the returned lines.
    pub fn add_chunk(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        self.for_each_line(text, |line| {
            lines.push(line.to_owned());
            true
        });
        lines
    }

    /// Feed text and parse every complete line into frames.
    pub fn push(&mut self, text: &str) -> FrameBatch {
        let mut batch = FrameBatch::default();
        let mut done = false;
        self.for_each_line(text, |line| Self::accept_line(line, &mut batch, &mut done));
        if done {
            self.mark_done();
        }
        batch.done = self.done;
        batch
    }

    /// Treat whatever partial line remains as complete. Called at end of input
    /// for bodies whose last line has no terminator.
    pub fn finish(&mut self) -> FrameBatch {
        let mut batch = FrameBatch::default();
        if self.done {
            batch.done = true;
            return batch;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.read_offset = 0;
        let mut done = false;
        Self::accept_line(&rest, &mut batch, &mut done);
        if done {
            self.mark_done();
        }
        batch.done = self.done;
        batch
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.read_offset = 0;
        self.done = false;
    }

    fn mark_done(&mut self) {
        self.buffer.clear();
        self.read_offset = 0;
        self.done = true;
    }

    /// Returns `false` to stop consuming further lines.
    fn accept_line(line: &str, batch: &mut FrameBatch, done: &mut bool) -> bool {
        match classify_line(line) {
            FrameLine::Skip => true,
            FrameLine::Done => {
                *done = true;
                false
            }
            FrameLine::Data(payload) => match parse_chunk_payload(payload) {
                Ok(Some(frame)) => {
                    batch.frames.push(frame);
                    true
                }
                Ok(None) => true,
                Err(err) => {
                    batch.error = Some(err);
                    false
                }
            },
        }
    }

    fn for_each_line<F>(&mut self, text: &str, mut f: F)
    where
        F: FnMut(&str) -> bool,
    {
        if self.done || text.is_empty() {
            return;
        }

        let scan_start = self.buffer.len();
        self.buffer.push_str(text);
        let mut processed_up_to = self.read_offset;
        let mut stopped = false;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            processed_up_to = line_end + 1;
            if !f(line) {
                stopped = true;
                break;
            }
        }

        if stopped {
            // Lines after a terminal or error frame are never parsed.
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2
                || self.read_offset >= COMPACT_THRESHOLD);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}
