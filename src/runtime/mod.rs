//! # Match Runtime
//!
//! Everything that runs after compilation: the PEG matcher itself and the
//! action-invocation plumbing that connects successful matches to an
//! embedder-supplied semantic runtime.

pub mod actions;
pub mod matcher;

pub use actions::{
    ActionError, ActionInvocation, ActionRuntime, MatchSpan, NullRuntime, RecordingRuntime,
};
pub use matcher::{MatchOutcome, Matcher, DEFAULT_MAX_MATCH_DEPTH};
