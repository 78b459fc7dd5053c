//! # PEG Matcher
//!
//! Evaluates a resolved rule graph over input text: ordered choice with
//! backtracking, zero-width guards, committed choice via cut, and greedy
//! repetition.
//!
//! Failing to match is ordinary control flow here, reported through
//! [`MatchOutcome::NoMatch`] together with the furthest position any attempt
//! reached. A `BraidError` from the matcher means the grammar itself
//! misbehaved at run time: a repetition that stopped consuming input, or
//! recursion past the configured depth limit.
//!
//! Action invocations are journaled as rules complete and handed back inside
//! a successful outcome; entries recorded along abandoned paths are
//! truncated by backtracking and never observed.

use crate::errors::{
    to_source_span, unspanned, BraidError, ErrorKind, ErrorReporting, ReportContext, SourceContext,
};
use crate::expand::{ResolvedRule, ResolvedRuleGraph};
use crate::grammar::{Expr, RuleId};
use crate::runtime::actions::{ActionInvocation, MatchSpan};
use crate::validate::ClassCache;

/// Default bound on rule-invocation nesting during a match.
pub const DEFAULT_MAX_MATCH_DEPTH: usize = 1000;

/// Outcome of a full match attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The rule matched `span` of the input. `invocations` lists the action
    /// firings that survived backtracking, in rule-completion order.
    Matched {
        span: MatchSpan,
        invocations: Vec<ActionInvocation>,
    },
    /// The rule did not match. `furthest` is the byte position of the
    /// deepest failure, the most useful place to point a "syntax error" at.
    NoMatch { furthest: usize },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Two-valued result of evaluating one expression. Fatal conditions travel
/// separately as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Matched,
    Failed,
}

struct CutScope {
    committed: bool,
}

struct RuleFrame {
    rule: RuleId,
    binds: Vec<(String, MatchSpan)>,
}

/// Everything needed to rewind an attempt: cursor, journal length, and the
/// current frame's bind count.
struct SavePoint {
    pos: usize,
    journal: usize,
    binds: usize,
}

struct MatchState<'i> {
    input: &'i str,
    pos: usize,
    furthest: usize,
    cuts: Vec<CutScope>,
    frames: Vec<RuleFrame>,
    journal: Vec<ActionInvocation>,
    depth: usize,
}

impl<'i> MatchState<'i> {
    fn new(input: &'i str, start: usize) -> Self {
        Self {
            input,
            pos: start,
            furthest: start,
            cuts: Vec::new(),
            frames: Vec::new(),
            journal: Vec::new(),
            depth: 0,
        }
    }

    fn rest(&self) -> &'i str {
        self.input.get(self.pos..).unwrap_or("")
    }

    fn save(&self) -> SavePoint {
        SavePoint {
            pos: self.pos,
            journal: self.journal.len(),
            binds: self.frames.last().map(|f| f.binds.len()).unwrap_or(0),
        }
    }

    // Frames pushed since the save point have been popped again by the time
    // anyone restores, so the bind count applies to the same frame.
    fn restore(&mut self, save: &SavePoint) {
        self.pos = save.pos;
        self.journal.truncate(save.journal);
        if let Some(frame) = self.frames.last_mut() {
            frame.binds.truncate(save.binds);
        }
    }

    fn fail(&mut self) -> Step {
        if self.pos > self.furthest {
            self.furthest = self.pos;
        }
        Step::Failed
    }
}

/// Matches input against a resolved rule graph.
pub struct Matcher<'g> {
    graph: &'g ResolvedRuleGraph,
    classes: &'g ClassCache,
    ctx: ReportContext,
    max_depth: usize,
}

impl<'g> Matcher<'g> {
    pub fn new(graph: &'g ResolvedRuleGraph, classes: &'g ClassCache, source: &SourceContext) -> Self {
        Self {
            graph,
            classes,
            ctx: ReportContext::new(source.clone(), "match"),
            max_depth: DEFAULT_MAX_MATCH_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Matches `rule` at the start of `input`.
    pub fn match_rule(&self, rule: &str, input: &str) -> Result<MatchOutcome, BraidError> {
        self.match_rule_at(rule, input, 0)
    }

    /// Matches `rule` at byte position `start`, which must lie on a char
    /// boundary. A prefix match counts: the outcome's span says how far the
    /// rule consumed.
    pub fn match_rule_at(
        &self,
        rule: &str,
        input: &str,
        start: usize,
    ) -> Result<MatchOutcome, BraidError> {
        let Some(entry) = self.graph.rule(rule) else {
            let mut err = self
                .ctx
                .unresolved_symbol(rule, "the resolved rule graph", unspanned());
            err.diagnostic_info.help =
                Some("rule names here are fully qualified, like 'Block.Rule'".into());
            return Err(err);
        };
        let mut state = MatchState::new(input, start);
        match self.eval_rule(entry, &mut state)? {
            Step::Matched => Ok(MatchOutcome::Matched {
                span: MatchSpan::new(start, state.pos),
                invocations: state.journal,
            }),
            Step::Failed => Ok(MatchOutcome::NoMatch {
                furthest: state.furthest,
            }),
        }
    }

    // Every rule invocation pushes its own cut scope, so a cut can never
    // commit anything in a calling rule.
    fn eval_rule(&self, rule: &ResolvedRule, state: &mut MatchState) -> Result<Step, BraidError> {
        if state.depth >= self.max_depth {
            return Err(self.ctx.report(
                ErrorKind::RecursionLimit {
                    limit: self.max_depth,
                },
                to_source_span(rule.span),
            ));
        }
        state.depth += 1;
        let start = state.pos;
        state.frames.push(RuleFrame {
            rule: rule.id.clone(),
            binds: Vec::new(),
        });
        state.cuts.push(CutScope { committed: false });

        let step = self.eval(&rule.body, state);

        state.cuts.pop();
        let frame = state.frames.pop();
        state.depth -= 1;
        let step = step?;

        if step == Step::Matched {
            if let (Some(action), Some(frame)) = (&rule.action, frame) {
                state.journal.push(ActionInvocation {
                    action: action.clone(),
                    rule: rule.id.clone(),
                    span: MatchSpan::new(start, state.pos),
                    bindings: frame.binds,
                });
            }
        }
        Ok(step)
    }

    fn eval(&self, expr: &Expr, state: &mut MatchState) -> Result<Step, BraidError> {
        match expr {
            Expr::Literal { text, .. } => {
                if state.rest().starts_with(text.as_str()) {
                    state.pos += text.len();
                    Ok(Step::Matched)
                } else {
                    Ok(state.fail())
                }
            }
            Expr::Class { pattern, span } => {
                let Some(regex) = self.classes.regex(pattern) else {
                    return Err(self.ctx.internal_error(
                        &format!("character class '{pattern}' was never compiled"),
                        to_source_span(*span),
                    ));
                };
                match regex.find(state.rest()) {
                    Some(m) => {
                        state.pos += m.end();
                        Ok(Step::Matched)
                    }
                    None => Ok(state.fail()),
                }
            }
            Expr::Wildcard { .. } => match state.rest().chars().next() {
                Some(c) => {
                    state.pos += c.len_utf8();
                    Ok(Step::Matched)
                }
                None => Ok(state.fail()),
            },
            Expr::Reference { name, target, span, .. } => {
                let Some(target) = target else {
                    return Err(self.ctx.internal_error(
                        &format!("reference '{name}' is unlinked at match time"),
                        to_source_span(*span),
                    ));
                };
                let Some(rule) = self.graph.rule(target.as_str()) else {
                    return Err(self.ctx.internal_error(
                        &format!("reference targets missing rule '{target}'"),
                        to_source_span(*span),
                    ));
                };
                self.eval_rule(rule, state)
            }
            Expr::Seq { items, .. } => {
                for item in items {
                    if self.eval(item, state)? == Step::Failed {
                        return Ok(Step::Failed);
                    }
                }
                Ok(Step::Matched)
            }
            Expr::Choice { alts, .. } => self.eval_choice(alts, state),
            Expr::Repeat {
                min,
                max,
                inner,
                span,
            } => self.eval_repeat(*min, *max, inner, *span, state),
            Expr::Guard {
                expect,
                condition,
                inner,
                ..
            } => self.eval_guard(*expect, condition, inner, state),
            Expr::Cut { .. } => {
                if let Some(scope) = state.cuts.last_mut() {
                    scope.committed = true;
                }
                Ok(Step::Matched)
            }
            Expr::Bind { tag, inner, .. } => {
                let before = state.pos;
                if self.eval(inner, state)? == Step::Failed {
                    return Ok(Step::Failed);
                }
                let span = MatchSpan::new(before, state.pos);
                if let Some(frame) = state.frames.last_mut() {
                    frame.binds.push((tag.render(), span));
                }
                Ok(Step::Matched)
            }
            Expr::Param { name, span } => Err(self.ctx.internal_error(
                &format!("parameter '${name}' reached the matcher"),
                to_source_span(*span),
            )),
        }
    }

    // Ordered choice: try alternatives left to right, rewinding after each
    // failure. A cut fired inside an alternative commits this choice; once
    // committed, a failing alternative fails the whole choice.
    fn eval_choice(&self, alts: &[Expr], state: &mut MatchState) -> Result<Step, BraidError> {
        state.cuts.push(CutScope { committed: false });
        let mut step = Step::Failed;
        for alt in alts {
            let save = state.save();
            match self.eval(alt, state) {
                Ok(Step::Matched) => {
                    step = Step::Matched;
                    break;
                }
                Ok(Step::Failed) => {
                    state.restore(&save);
                    let committed = state.cuts.last().map(|s| s.committed).unwrap_or(false);
                    if committed {
                        break;
                    }
                }
                Err(e) => {
                    state.cuts.pop();
                    return Err(e);
                }
            }
        }
        state.cuts.pop();
        Ok(step)
    }

    // Greedy repetition: consume as many iterations as possible, never
    // giving any back. Two successive iterations that both succeed without
    // consuming input would loop forever and are fatal.
    fn eval_repeat(
        &self,
        min: usize,
        max: Option<usize>,
        inner: &Expr,
        span: crate::grammar::Span,
        state: &mut MatchState,
    ) -> Result<Step, BraidError> {
        let mut count = 0usize;
        let mut zero_streak = 0usize;
        loop {
            if let Some(max) = max {
                if count >= max {
                    break;
                }
            }
            let save = state.save();
            let before = state.pos;
            match self.eval(inner, state)? {
                Step::Matched => {
                    if state.pos == before {
                        zero_streak += 1;
                        if zero_streak >= 2 {
                            let rule = state
                                .frames
                                .last()
                                .map(|f| f.rule.as_str().to_string())
                                .unwrap_or_else(|| "<root>".into());
                            return Err(self.ctx.report(
                                ErrorKind::ZeroWidthRepetition { rule },
                                to_source_span(span),
                            ));
                        }
                    } else {
                        zero_streak = 0;
                    }
                    count += 1;
                }
                Step::Failed => {
                    state.restore(&save);
                    break;
                }
            }
        }
        if count >= min {
            Ok(Step::Matched)
        } else {
            Ok(Step::Failed)
        }
    }

    // Guards are zero-width: the condition runs as an isolated probe (its
    // own cut scope, full state restore) and only its verdict survives.
    fn eval_guard(
        &self,
        expect: bool,
        condition: &Expr,
        inner: &Expr,
        state: &mut MatchState,
    ) -> Result<Step, BraidError> {
        let save = state.save();
        state.cuts.push(CutScope { committed: false });
        let probe = self.eval(condition, state);
        state.cuts.pop();
        state.restore(&save);
        let holds = (probe? == Step::Matched) == expect;
        if !holds {
            return Ok(state.fail());
        }
        self.eval(inner, state)
    }
}
