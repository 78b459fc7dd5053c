//! # Braid
//!
//! A modular PEG grammar engine. Grammars arrive as structured blocks of
//! rules (produced by an external parser or the [`grammar::builder`]
//! helpers); the engine resolves imports between blocks, expands templates,
//! instantiates generic rules, and matches input with ordered choice,
//! guards, and committed choice via cut. Semantic actions are delegated to
//! an embedder-supplied [`runtime::ActionRuntime`].
//!
//! The usual entry point is [`engine::GrammarPipeline`]:
//!
//! ```
//! use braid::engine::GrammarPipeline;
//! use braid::grammar::builder::*;
//! use braid::grammar::{Block, GrammarUnit, Rule};
//!
//! let unit = GrammarUnit::new(vec![Block::new("Main").with_rules(vec![
//!     Rule::new("Greeting", seq([lit("hello"), star(lit("!"))])),
//! ])])
//! .with_start("Main", "Greeting");
//!
//! let grammar = GrammarPipeline::new().compile(&unit)?;
//! assert!(grammar.parse("hello!!")?.is_match());
//! # Ok::<(), braid::BraidError>(())
//! ```

pub use crate::errors::{BraidError, ErrorCategory, ErrorKind, ErrorReporting, SourceContext};

pub mod engine;
pub mod errors;
pub mod expand;
pub mod grammar;
pub mod resolve;
pub mod runtime;
pub mod validate;

pub use crate::engine::{CompileStats, CompiledGrammar, GrammarPipeline};
pub use crate::expand::{ResolvedRule, ResolvedRuleGraph, RuleOrigin};
pub use crate::grammar::{Block, Expr, GrammarUnit, Rule, RuleId, Span};
pub use crate::runtime::{ActionInvocation, ActionRuntime, MatchOutcome, MatchSpan};
