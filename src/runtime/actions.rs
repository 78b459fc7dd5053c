//! # Semantic Action Runtime
//!
//! The engine does not interpret action code. A rule's `=> action` clause
//! names a handler supplied by the embedder; matching only records which
//! handlers fired, over which input spans, with which tagged sub-matches.
//! Invocations are journaled during the match and replayed in completion
//! order once the whole match has succeeded, so a backtracked attempt never
//! reaches the runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grammar::RuleId;

/// A byte range of the matched input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
}

impl MatchSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The matched text. Requires the same input the match ran against.
    pub fn slice<'i>(&self, input: &'i str) -> &'i str {
        input.get(self.start..self.end).unwrap_or("")
    }
}

/// One recorded action firing: which handler, for which rule, over which
/// span, with which captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action: String,
    pub rule: RuleId,
    pub span: MatchSpan,
    /// Tagged sub-matches in the order their binds completed. A tag repeats
    /// when its bind sits inside a repetition.
    pub bindings: Vec<(String, MatchSpan)>,
}

impl ActionInvocation {
    /// The last sub-match recorded under `tag` (`e1`, `e2`, ..., `e:name`).
    pub fn binding(&self, tag: &str) -> Option<MatchSpan> {
        self.bindings
            .iter()
            .rev()
            .find(|(t, _)| t == tag)
            .map(|(_, span)| *span)
    }

    /// Every sub-match recorded under `tag`, in completion order.
    pub fn bindings_for<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = MatchSpan> + 'a {
        self.bindings
            .iter()
            .filter(move |(t, _)| t == tag)
            .map(|(_, span)| *span)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action '{action}' failed: {reason}")]
    Failed { action: String, reason: String },
    #[error("could not encode invocation record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An external consumer of action invocations. Handlers run in the order the
/// journal recorded them; returning an error aborts the replay.
pub trait ActionRuntime {
    fn invoke(&mut self, call: &ActionInvocation) -> Result<(), ActionError>;
}

/// Collects every invocation, preserving order. Useful as a test double and
/// for exporting a match's semantic trace.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    pub calls: Vec<ActionInvocation>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the collected journal as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ActionError> {
        Ok(serde_json::to_string_pretty(&self.calls)?)
    }
}

impl ActionRuntime for RecordingRuntime {
    fn invoke(&mut self, call: &ActionInvocation) -> Result<(), ActionError> {
        self.calls.push(call.clone());
        Ok(())
    }
}

/// Discards every invocation. For embedders that only want the match result.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRuntime;

impl ActionRuntime for NullRuntime {
    fn invoke(&mut self, _call: &ActionInvocation) -> Result<(), ActionError> {
        Ok(())
    }
}
