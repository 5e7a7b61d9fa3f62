// Reasoning content extraction.
//
// Two vendor conventions coexist:
// - a dedicated delta field (`reasoning_content`, `reasoning`, ...), tried in
//   a fixed priority order;
// - inline `<think>…</think>` style markers inside ordinary `content`.
//
// Key invariants:
// - Partial tag markup never reaches visible output; a trailing fragment that
//   may still become a marker is carried into the next chunk.
// - Dedicated-field reasoning is never also emitted as text.
// - Once ordinary content follows dedicated-field reasoning, the field is
//   considered finished and later field content emits no thinking events.

use memchr::{memchr, memmem};
use serde_json::Value;
use smallvec::SmallVec;

use crate::protocol::openai_chat::ChunkDelta;

/// Extracts reasoning text from the value of a dedicated delta field.
pub type FieldExtractor = fn(&Value) -> Option<String>;

/// Known dedicated reasoning fields, in default priority order.
pub const KNOWN_REASONING_FIELDS: &[(&str, FieldExtractor)] = &[
    ("reasoning_content", string_value),
    ("reasoning", text_value),
    ("thinking", text_value),
    ("reasoning_details", details_value),
];

/// Default inline tag names.
pub const DEFAULT_REASONING_TAGS: &[&str] = &["think", "thinking", "reasoning"];

fn string_value(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_owned)
}

/// A string, or an object carrying `text`/`content`/`thinking`.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(_) => string_value(value),
        Value::Object(obj) => ["text", "content", "thinking"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(string_value)),
        _ => None,
    }
}

/// An array of detail objects whose text entries are concatenated.
fn details_value(value: &Value) -> Option<String> {
    let Value::Array(items) = value else {
        return text_value(value);
    };
    let mut out = String::new();
    for item in items {
        if let Some(text) = text_value(item).or_else(|| item.get("summary").and_then(text_value)) {
            out.push_str(&text);
        }
    }
    (!out.is_empty()).then_some(out)
}

/// Ordered `(field_name, extractor)` pairs tried against each delta.
#[derive(Debug, Clone)]
pub struct ReasoningFields {
    fields: Vec<(String, FieldExtractor)>,
}

impl ReasoningFields {
    /// Build the lookup list from configured names. Names that are not in
    /// [`KNOWN_REASONING_FIELDS`] are read with the generic text extractor.
    #[must_use]
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let fields = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let extractor = KNOWN_REASONING_FIELDS
                    .iter()
                    .find(|(known, _)| *known == name)
                    .map_or(text_value as FieldExtractor, |(_, extractor)| *extractor);
                (name.to_owned(), extractor)
            })
            .collect();
        Self { fields }
    }

    /// First field, in priority order, that yields non-empty reasoning text.
    #[must_use]
    pub fn extract(&self, extra: &serde_json::Map<String, Value>) -> Option<String> {
        self.fields
            .iter()
            .find_map(|(name, extractor)| extra.get(name).and_then(extractor))
    }
}

impl Default for ReasoningFields {
    fn default() -> Self {
        Self {
            fields: KNOWN_REASONING_FIELDS
                .iter()
                .map(|(name, extractor)| ((*name).to_owned(), *extractor))
                .collect(),
        }
    }
}

/// Classified piece of delta content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

pub type Segments = SmallVec<[Segment; 4]>;

fn push_segment(out: &mut Segments, segment: Segment) {
    let (Segment::Text(text) | Segment::Thinking(text)) = &segment;
    if text.is_empty() {
        return;
    }
    match (out.last_mut(), &segment) {
        (Some(Segment::Text(last)), Segment::Text(text))
        | (Some(Segment::Thinking(last)), Segment::Thinking(text)) => {
            last.push_str(text);
            return;
        }
        _ => {}
    }
    out.push(segment);
}

#[derive(Debug, Clone)]
struct TagPair {
    open: String,
    close: String,
}

/// Inline tag scanner holding back ambiguous trailing markup.
#[derive(Debug, Clone)]
pub struct TagScanner {
    tags: Vec<TagPair>,
    carry: String,
    /// Index into `tags` of the block currently open.
    open_block: Option<usize>,
}

impl TagScanner {
    #[must_use]
    pub fn new<S: AsRef<str>>(tag_names: &[S]) -> Self {
        let tags = tag_names
            .iter()
            .map(|name| TagPair {
                open: format!("<{}>", name.as_ref()),
                close: format!("</{}>", name.as_ref()),
            })
            .collect();
        Self {
            tags,
            carry: String::new(),
            open_block: None,
        }
    }

    #[must_use]
    pub fn in_block(&self) -> bool {
        self.open_block.is_some()
    }

    /// Feed content and append the segments that are unambiguous so far.
    pub fn feed(&mut self, text: &str, out: &mut Segments) {
        if text.is_empty() {
            return;
        }
        if self.tags.is_empty() {
            push_segment(out, Segment::Text(text.to_owned()));
            return;
        }
        if self.carry.is_empty() && self.open_block.is_none() && memchr(b'<', text.as_bytes()).is_none()
        {
            push_segment(out, Segment::Text(text.to_owned()));
            return;
        }

        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(text);
        let mut pos = 0;
        while pos < buffer.len() {
            let rest = &buffer[pos..];
            match self.open_block {
                Some(tag_index) => {
                    let close = self.tags[tag_index].close.as_str();
                    if let Some(at) = memmem::find(rest.as_bytes(), close.as_bytes()) {
                        push_segment(out, Segment::Thinking(rest[..at].to_owned()));
                        self.open_block = None;
                        pos += at + close.len();
                    } else {
                        let keep = longest_suffix_prefix(rest, close);
                        let emit = rest.len() - keep;
                        push_segment(out, Segment::Thinking(rest[..emit].to_owned()));
                        self.carry = rest[emit..].to_owned();
                        return;
                    }
                }
                None => match self.scan_for_open(rest) {
                    OpenScan::Found { at, tag_index } => {
                        push_segment(out, Segment::Text(rest[..at].to_owned()));
                        self.open_block = Some(tag_index);
                        pos += at + self.tags[tag_index].open.len();
                    }
                    OpenScan::Partial { at } => {
                        push_segment(out, Segment::Text(rest[..at].to_owned()));
                        self.carry = rest[at..].to_owned();
                        return;
                    }
                    OpenScan::None => {
                        push_segment(out, Segment::Text(rest.to_owned()));
                        return;
                    }
                },
            }
        }
    }

    /// Release held-back content at end of stream. Returns `true` when a block
    /// was still open.
    pub fn finish(&mut self, out: &mut Segments) -> bool {
        let carry = std::mem::take(&mut self.carry);
        let unterminated = self.open_block.take().is_some();
        if unterminated {
            push_segment(out, Segment::Thinking(carry));
        } else {
            push_segment(out, Segment::Text(carry));
        }
        unterminated
    }

    pub fn reset(&mut self) {
        self.carry.clear();
        self.open_block = None;
    }

    fn scan_for_open(&self, text: &str) -> OpenScan {
        let bytes = text.as_bytes();
        let mut from = 0;
        while let Some(rel) = memchr(b'<', &bytes[from..]) {
            let at = from + rel;
            let candidate = &text[at..];
            if let Some(tag_index) = self
                .tags
                .iter()
                .position(|tag| candidate.starts_with(tag.open.as_str()))
            {
                return OpenScan::Found { at, tag_index };
            }
            if self
                .tags
                .iter()
                .any(|tag| candidate.len() < tag.open.len() && tag.open.starts_with(candidate))
            {
                return OpenScan::Partial { at };
            }
            from = at + 1;
        }
        OpenScan::None
    }
}

enum OpenScan {
    Found { at: usize, tag_index: usize },
    Partial { at: usize },
    None,
}

/// Length of the longest proper suffix of `haystack` that is a prefix of `needle`.
fn longest_suffix_prefix(haystack: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&len| haystack.as_bytes().ends_with(&needle.as_bytes()[..len]))
        .unwrap_or(0)
}

/// Whether dedicated-field reasoning is still in progress for this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FieldPhase {
    #[default]
    NotStarted,
    Active,
    Finished,
}

/// Separates hidden reasoning from visible text for one stream.
#[derive(Debug, Clone)]
pub struct ReasoningExtractor {
    fields: ReasoningFields,
    tags: TagScanner,
    thinking: String,
    phase: FieldPhase,
    late_field_chunks: usize,
}

impl ReasoningExtractor {
    #[must_use]
    pub fn new<S: AsRef<str>>(fields: ReasoningFields, tag_names: &[S]) -> Self {
        Self {
            fields,
            tags: TagScanner::new(tag_names),
            thinking: String::new(),
            phase: FieldPhase::NotStarted,
            late_field_chunks: 0,
        }
    }

    /// Classify one delta into thinking and text segments.
    ///
    /// The dedicated field is handled first; the delta's `content` then goes
    /// through the inline tag scanner.
    pub fn process_delta(&mut self, delta: &ChunkDelta, out: &mut Segments) {
        let field_reasoning = self.fields.extract(&delta.extra);
        let has_field = field_reasoning.is_some();

        if let Some(reasoning) = field_reasoning {
            self.thinking.push_str(&reasoning);
            if self.phase == FieldPhase::Finished {
                self.late_field_chunks += 1;
            } else {
                self.phase = FieldPhase::Active;
                push_segment(out, Segment::Thinking(reasoning));
            }
        }

        let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) else {
            return;
        };
        if !has_field && self.phase == FieldPhase::Active {
            self.phase = FieldPhase::Finished;
            tracing::debug!(
                thinking_len = self.thinking.len(),
                "dedicated reasoning field finished"
            );
        }
        self.feed_content(content, out);
    }

    /// Run plain content through the inline tag scanner.
    pub fn feed_content(&mut self, content: &str, out: &mut Segments) {
        let mut scanned = Segments::new();
        self.tags.feed(content, &mut scanned);
        self.forward(scanned, out);
    }

    /// Release held-back content. Returns `true` when an inline block was
    /// never closed.
    pub fn finish(&mut self, out: &mut Segments) -> bool {
        let mut scanned = Segments::new();
        let unterminated = self.tags.finish(&mut scanned);
        self.forward(scanned, out);
        unterminated
    }

    /// Everything classified as reasoning so far.
    #[must_use]
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    /// Dedicated-field chunks that arrived after reasoning had finished.
    #[must_use]
    pub fn late_field_chunks(&self) -> usize {
        self.late_field_chunks
    }

    pub fn reset(&mut self) {
        self.tags.reset();
        self.thinking.clear();
        self.phase = FieldPhase::NotStarted;
        self.late_field_chunks = 0;
    }

    fn forward(&mut self, scanned: Segments, out: &mut Segments) {
        for segment in scanned {
            if let Segment::Thinking(text) = &segment {
                self.thinking.push_str(text);
            }
            push_segment(out, segment);
        }
    }
}
