use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::json_scan::JsonProgress;
use crate::protocol::canonical::{ToolCall, ToolCallFunction, DEFAULT_TOOL_CALL_TYPE};
use crate::protocol::openai_chat::ToolCallDelta;

/// Accumulated state for one positional index.
#[derive(Debug, Clone, Default)]
struct ToolCallState {
    type_: Option<String>,
    name: String,
    arguments: String,
    progress: JsonProgress,
}

/// Merges index-addressed tool-call fragments into incremental [`ToolCall`]s.
///
/// Vendors send the id only on the first fragment of an index; later fragments
/// are matched by position. The id recorded for an index is never replaced, and
/// all state is scoped to one stream: call [`ToolCallAggregator::reset`] before
/// reusing an aggregator for another call.
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    ids: FxHashMap<u32, String>,
    calls: BTreeMap<u32, ToolCallState>,
    dropped_fragments: usize,
    conflicting_ids: usize,
}

impl ToolCallAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one fragment, returning the incremental tool call to emit.
    ///
    /// Returns `None` when the index has no recorded id, or when the fragment
    /// carries neither a name nor an arguments piece.
    pub fn process_delta(&mut self, partial: &ToolCallDelta) -> Option<ToolCall> {
        let index = partial.index;
        if let Some(id) = partial.id.as_deref().filter(|id| !id.is_empty()) {
            match self.ids.get(&index) {
                None => {
                    self.ids.insert(index, id.to_owned());
                }
                Some(existing) if existing != id => {
                    self.conflicting_ids += 1;
                    tracing::debug!(
                        index,
                        kept = existing.as_str(),
                        ignored = id,
                        "ignoring a second tool-call id for the same index"
                    );
                }
                Some(_) => {}
            }
        }

        let Some(id) = self.ids.get(&index) else {
            self.dropped_fragments += 1;
            tracing::debug!(index, "dropping tool-call fragment for an index without an id");
            return None;
        };

        let state = self.calls.entry(index).or_default();
        if state.type_.is_none() {
            state.type_ = partial.type_.clone().filter(|t| !t.is_empty());
        }

        let (name, arguments) = partial.function.as_ref().map_or(("", ""), |function| {
            (
                function.name.as_deref().unwrap_or_default(),
                function.arguments.as_deref().unwrap_or_default(),
            )
        });
        if name.is_empty() && arguments.is_empty() {
            return None;
        }
        state.name.push_str(name);
        state.arguments.push_str(arguments);
        state.progress.feed(arguments);

        Some(ToolCall {
            id: id.clone(),
            type_: state
                .type_
                .clone()
                .unwrap_or_else(|| DEFAULT_TOOL_CALL_TYPE.to_owned()),
            function: ToolCallFunction {
                name: name.to_owned(),
                arguments: arguments.to_owned(),
            },
        })
    }

    /// The stable id recorded for `index`, if any.
    #[must_use]
    pub fn id_for(&self, index: u32) -> Option<&str> {
        self.ids.get(&index).map(String::as_str)
    }

    /// Readiness check: the accumulated arguments for `index` parsed as JSON,
    /// or `None` while they are still syntactically incomplete.
    ///
    /// Structure is tracked as fragments arrive, so the full parse only runs
    /// once the arguments can be complete.
    ///
    /// A tool call that has a name but no arguments at all is reported ready
    /// with an empty object.
    #[must_use]
    pub fn arguments_ready(&self, index: u32) -> Option<serde_json::Value> {
        let state = self.calls.get(&index)?;
        let arguments = state.arguments.trim();
        if arguments.is_empty() {
            return (!state.name.is_empty())
                .then(|| serde_json::Value::Object(serde_json::Map::new()));
        }
        if !state.progress.may_be_complete() {
            return None;
        }
        serde_json::from_str(arguments).ok()
    }

    /// Fully assembled tool calls in index order.
    #[must_use]
    pub fn completed_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter_map(|(index, state)| {
                let id = self.ids.get(index)?;
                Some(ToolCall {
                    id: id.clone(),
                    type_: state
                        .type_
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TOOL_CALL_TYPE.to_owned()),
                    function: ToolCallFunction {
                        name: state.name.clone(),
                        arguments: state.arguments.clone(),
                    },
                })
            })
            .collect()
    }

    /// Fragments dropped because their index never received an id.
    #[must_use]
    pub fn dropped_fragments(&self) -> usize {
        self.dropped_fragments
    }

    /// Later ids that disagreed with the id already recorded for their index.
    #[must_use]
    pub fn conflicting_ids(&self) -> usize {
        self.conflicting_ids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn reset(&mut self) {
        self.ids.clear();
        self.calls.clear();
        self.dropped_fragments = 0;
        self.conflicting_ids = 0;
    }
}
