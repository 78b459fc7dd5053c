//! # Engine
//!
//! The fixed-phase compilation pipeline and the compiled-grammar handle.
//!
//! Compilation always runs resolve, template expansion, generic
//! instantiation, and validation in that order; phases never reorder and
//! never partially apply. Any phase error aborts the compile. Matching
//! happens afterwards, against the immutable [`CompiledGrammar`] the
//! pipeline produced, so a compiled grammar can be shared and reused across
//! any number of inputs.

use serde::Serialize;

use crate::errors::{
    to_source_span, unspanned, BraidError, ErrorKind, ErrorReporting, ReportContext, SourceContext,
};
use crate::expand::{close_unit, expand_unit, ExpansionStep, ResolvedRuleGraph};
use crate::grammar::{GrammarUnit, RuleId};
use crate::resolve::{resolve, SymbolTable};
use crate::runtime::{
    ActionError, ActionRuntime, MatchOutcome, Matcher, DEFAULT_MAX_MATCH_DEPTH,
};
use crate::validate::{validate, ClassCache};

// ============================================================================
// PIPELINE
// ============================================================================

/// Counters describing one compile. The cache-hit fields are what make
/// sharing observable: a generic requested from ten call sites instantiates
/// once and hits the cache nine times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompileStats {
    pub rules_resolved: usize,
    pub template_expansions: usize,
    pub template_cache_hits: usize,
    pub instantiations: usize,
    pub instantiation_cache_hits: usize,
}

/// The compilation pipeline: resolve, expand, instantiate, validate. This is
/// the single entry point for turning a grammar unit into something
/// matchable; the phases cannot be invoked out of order through it.
pub struct GrammarPipeline {
    /// Rule-invocation depth limit handed to every matcher this grammar
    /// creates.
    pub max_match_depth: usize,
}

impl Default for GrammarPipeline {
    fn default() -> Self {
        Self {
            max_match_depth: DEFAULT_MAX_MATCH_DEPTH,
        }
    }
}

impl GrammarPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_match_depth(mut self, max_match_depth: usize) -> Self {
        self.max_match_depth = max_match_depth;
        self
    }

    /// Compiles a grammar unit into a matchable grammar.
    pub fn compile(&self, unit: &GrammarUnit) -> Result<CompiledGrammar, BraidError> {
        // Step 1: one source context serves diagnostics across all phases.
        let source = unit.source.clone().unwrap_or_default();

        // Step 2: import graph, symbol tables, reference linking.
        let resolved = resolve(unit)?;
        let tables = resolved.tables.clone();
        let rules_resolved = resolved.rules.len();

        // Step 3: expand template calls against their callers' tables.
        let expanded = expand_unit(&resolved, &source)?;

        // Step 4: close generics down to a concrete rule graph.
        let closed = close_unit(&expanded, &source)?;

        // Step 5: prove the graph runnable and compile its classes.
        let classes = validate(&closed.graph, &source)?;

        // Step 6: a declared start rule must survive into the final graph.
        if let Some(start) = &closed.start {
            if !closed.graph.contains(start.as_str()) {
                let ctx = ReportContext::new(source.clone(), "resolve");
                return Err(ctx.report(
                    ErrorKind::MissingStartRule {
                        start: Some(start.as_str().into()),
                    },
                    unspanned(),
                ));
            }
        }

        Ok(CompiledGrammar {
            graph: closed.graph,
            tables,
            start: closed.start,
            source,
            classes,
            stats: CompileStats {
                rules_resolved,
                template_expansions: closed.stats.template_expansions,
                template_cache_hits: closed.stats.template_cache_hits,
                instantiations: closed.stats.instantiations,
                instantiation_cache_hits: closed.stats.instantiation_cache_hits,
            },
            trace: closed.trace,
            max_match_depth: self.max_match_depth,
        })
    }
}

// ============================================================================
// COMPILED GRAMMAR
// ============================================================================

/// A compiled grammar: the closed rule graph plus everything matching needs.
/// Immutable once built.
#[derive(Debug)]
pub struct CompiledGrammar {
    graph: ResolvedRuleGraph,
    tables: im::OrdMap<String, SymbolTable>,
    start: Option<RuleId>,
    source: SourceContext,
    classes: ClassCache,
    stats: CompileStats,
    trace: Vec<ExpansionStep>,
    max_match_depth: usize,
}

impl CompiledGrammar {
    pub fn graph(&self) -> &ResolvedRuleGraph {
        &self.graph
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    /// The expansion journal: every template expansion and generic
    /// instantiation this compile performed, cache hits included.
    pub fn trace(&self) -> &[ExpansionStep] {
        &self.trace
    }

    pub fn start(&self) -> Option<&RuleId> {
        self.start.as_ref()
    }

    /// The resolved symbol table of one block, as it stood after import
    /// resolution.
    pub fn symbol_table(&self, block: &str) -> Option<&SymbolTable> {
        self.tables.get(block)
    }

    /// Serializes the closed rule graph as pretty-printed JSON.
    pub fn graph_json(&self) -> Result<String, BraidError> {
        serde_json::to_string_pretty(&self.graph).map_err(|e| {
            ReportContext::new(self.source.clone(), "engine")
                .internal_error(&format!("could not encode rule graph: {e}"), unspanned())
        })
    }

    fn matcher(&self) -> Matcher<'_> {
        Matcher::new(&self.graph, &self.classes, &self.source)
            .with_max_depth(self.max_match_depth)
    }

    /// Matches `rule` (fully qualified, `Block.Rule`) at the start of
    /// `input`. A prefix match counts.
    pub fn matches(&self, rule: &str, input: &str) -> Result<MatchOutcome, BraidError> {
        self.matcher().match_rule(rule, input)
    }

    /// Matches `rule` at byte position `start` of `input`.
    pub fn matches_at(
        &self,
        rule: &str,
        input: &str,
        start: usize,
    ) -> Result<MatchOutcome, BraidError> {
        self.matcher().match_rule_at(rule, input, start)
    }

    /// Matches `rule` and, on success, replays the journaled action
    /// invocations into `runtime` in rule-completion order.
    pub fn run(
        &self,
        rule: &str,
        input: &str,
        runtime: &mut dyn ActionRuntime,
    ) -> Result<MatchOutcome, BraidError> {
        let outcome = self.matches(rule, input)?;
        self.replay(rule, &outcome, runtime)?;
        Ok(outcome)
    }

    /// Matches the declared start rule against the whole input. Consuming
    /// only a prefix counts as no match, reported at the position where
    /// consumption stopped.
    pub fn parse(&self, input: &str) -> Result<MatchOutcome, BraidError> {
        let Some(start) = self.start.clone() else {
            let ctx = ReportContext::new(self.source.clone(), "match");
            return Err(ctx.report(ErrorKind::MissingStartRule { start: None }, unspanned()));
        };
        let outcome = self.matches(start.as_str(), input)?;
        Ok(match outcome {
            MatchOutcome::Matched { span, .. } if span.end < input.len() => {
                MatchOutcome::NoMatch { furthest: span.end }
            }
            other => other,
        })
    }

    /// [`parse`](Self::parse), then replays action invocations on success.
    pub fn parse_with(
        &self,
        input: &str,
        runtime: &mut dyn ActionRuntime,
    ) -> Result<MatchOutcome, BraidError> {
        let outcome = self.parse(input)?;
        let rule = self.start.as_ref().map(|s| s.as_str()).unwrap_or_default();
        self.replay(rule, &outcome, runtime)?;
        Ok(outcome)
    }

    // Journal replay: handlers only ever see invocations that survived
    // backtracking, and only after the whole match succeeded.
    fn replay(
        &self,
        rule: &str,
        outcome: &MatchOutcome,
        runtime: &mut dyn ActionRuntime,
    ) -> Result<(), BraidError> {
        let MatchOutcome::Matched { invocations, .. } = outcome else {
            return Ok(());
        };
        for call in invocations {
            runtime
                .invoke(call)
                .map_err(|e| self.action_error(rule, e))?;
        }
        Ok(())
    }

    fn action_error(&self, rule: &str, err: ActionError) -> BraidError {
        let ctx = ReportContext::new(self.source.clone(), "match");
        let span = self
            .graph
            .rule(rule)
            .map(|r| to_source_span(r.span))
            .unwrap_or_else(unspanned);
        match err {
            ActionError::Failed { action, reason } => {
                ctx.report(ErrorKind::ActionFailed { action, reason }, span)
            }
            ActionError::Encode(e) => ctx.report(
                ErrorKind::ActionFailed {
                    action: "<encode>".into(),
                    reason: e.to_string(),
                },
                span,
            ),
        }
    }
}
