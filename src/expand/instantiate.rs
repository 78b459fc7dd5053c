//! # Generic Instantiation
//!
//! Closes generic rules into concrete ones. Every reference `Base<args>` is
//! rewired to a minted rule whose body is the definition body with each
//! parameter replaced by a deep copy of the corresponding argument; the
//! minted rule is cached under `(base, structural argument equality)`, so an
//! instance is created at most once however many call sites request it.
//!
//! Arguments are themselves closed depth-first before the key is formed,
//! which is what lets `Outer<Inner<X>>` collapse through shared `Inner<X>`
//! instances. Structural equality ignores spans: two argument spellings at
//! different source positions are the same instance.
//!
//! Mutual requirements between instances (`A<T>` needs `B<U>` needs `A<T>`)
//! are legal only where the recursive reference sits under a choice or a
//! repetition; anywhere else instantiation could never terminate and the
//! cycle is rejected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{
    to_source_span, BraidError, ErrorKind, ErrorReporting, ReportContext, SourceContext,
};
use crate::expand::{
    template::ExpandedUnit, ExpandStats, ExpansionPhase, ExpansionStep, MAX_EXPANSION_DEPTH,
};
use crate::grammar::{Expr, Rule, RuleId, Span};

// ============================================================================
// RESOLVED RULE GRAPH
// ============================================================================

/// How a rule in the resolved graph came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOrigin {
    /// Declared directly in a block.
    Plain,
    /// Minted by template expansion.
    Expansion { template: RuleId },
    /// Minted by generic instantiation.
    Instance { base: RuleId },
}

/// A fully closed rule: no parameters, no template indirection, every
/// reference linked to another graph entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub id: RuleId,
    pub body: Expr,
    pub action: Option<String>,
    pub span: Span,
    pub origin: RuleOrigin,
}

/// The final, generic-free rule graph the matcher runs against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRuleGraph {
    rules: im::OrdMap<RuleId, ResolvedRule>,
}

impl ResolvedRuleGraph {
    pub fn rule(&self, id: &str) -> Option<&ResolvedRule> {
        self.rules.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Rules in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&RuleId, &ResolvedRule)> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Output of the instantiation pass. Stats and trace continue the template
/// pass's journal, so they describe both passes together.
#[derive(Debug, Clone)]
pub struct ClosedUnit {
    pub graph: ResolvedRuleGraph,
    pub start: Option<RuleId>,
    pub stats: ExpandStats,
    pub trace: Vec<ExpansionStep>,
}

/// Closes every non-generic rule of an expanded unit, instantiating the
/// generics they reach on demand.
pub fn close_unit(expanded: &ExpandedUnit, source: &SourceContext) -> Result<ClosedUnit, BraidError> {
    let mut inst = Instantiator::new(expanded, source);
    for (id, rule) in expanded.rules.iter() {
        // Generic definitions close on demand, one instance per argument
        // list; only concrete rules enter the graph directly.
        if rule.is_generic() {
            continue;
        }
        inst.close_rule(id, rule)?;
    }
    Ok(inst.finish())
}

// ============================================================================
// INSTANTIATOR
// ============================================================================

struct Frame {
    base: RuleId,
    args: Vec<Expr>,
    minted: RuleId,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    base: RuleId,
    /// Span-stripped: structural equality decides instance identity.
    args: Vec<Expr>,
}

/// Instantiates generic rules into a growing resolved graph, memoizing by
/// structural argument equality.
pub struct Instantiator<'e> {
    unit: &'e ExpandedUnit,
    ctx: ReportContext,
    cache: HashMap<InstanceKey, RuleId>,
    in_progress: Vec<Frame>,
    graph: im::OrdMap<RuleId, ResolvedRule>,
    stats: ExpandStats,
    trace: Vec<ExpansionStep>,
}

impl<'e> Instantiator<'e> {
    pub fn new(unit: &'e ExpandedUnit, source: &SourceContext) -> Self {
        Self {
            unit,
            ctx: ReportContext::new(source.clone(), "instantiate"),
            cache: HashMap::new(),
            in_progress: Vec::new(),
            graph: im::OrdMap::new(),
            stats: unit.stats,
            trace: unit.trace.clone(),
        }
    }

    /// Closes one concrete rule into the graph.
    pub fn close_rule(&mut self, id: &RuleId, rule: &Rule) -> Result<(), BraidError> {
        let subst = HashMap::new();
        let body = self.close_expr(&rule.body, &subst, false)?;
        let origin = match self.unit.origins.get(id) {
            Some(template) => RuleOrigin::Expansion {
                template: template.clone(),
            },
            None => RuleOrigin::Plain,
        };
        self.graph.insert(
            id.clone(),
            ResolvedRule {
                id: id.clone(),
                body,
                action: rule.action.clone(),
                span: rule.span,
                origin,
            },
        );
        Ok(())
    }

    /// Instantiates `base` with already-closed arguments, returning the
    /// minted (or cached) instance id. With no parameters on `base` this is
    /// the identity.
    pub fn instantiate(
        &mut self,
        base: &RuleId,
        args: Vec<Expr>,
        span: Span,
    ) -> Result<RuleId, BraidError> {
        self.instantiate_at(base, args, span, false)
    }

    pub fn finish(self) -> ClosedUnit {
        ClosedUnit {
            graph: ResolvedRuleGraph { rules: self.graph },
            start: self.unit.start.clone(),
            stats: self.stats,
            trace: self.trace,
        }
    }

    // `guarded` is true once the path from the rule root passes through a
    // choice alternative or a repetition body; only guarded recursion between
    // instances is legal.
    fn close_expr(
        &mut self,
        expr: &Expr,
        subst: &HashMap<String, Expr>,
        guarded: bool,
    ) -> Result<Expr, BraidError> {
        match expr {
            // Each substitution site takes its own deep copy, so instance
            // bodies never share nodes with the call site or each other.
            Expr::Param { name, span } => match subst.get(name) {
                Some(replacement) => Ok(replacement.clone()),
                None => Err(self.ctx.internal_error(
                    &format!("parameter '${name}' escaped its defining rule"),
                    to_source_span(*span),
                )),
            },
            Expr::Reference {
                name,
                target,
                args,
                span,
            } => {
                let Some(target) = target else {
                    return Err(self.ctx.internal_error(
                        &format!("reference '{name}' survived expansion unlinked"),
                        to_source_span(*span),
                    ));
                };
                let closed_args = args
                    .iter()
                    .map(|a| self.close_expr(a, subst, guarded))
                    .collect::<Result<Vec<_>, _>>()?;
                let expected = self
                    .unit
                    .rules
                    .get(target)
                    .map(|d| d.params.len())
                    .unwrap_or(0);
                let target = if expected == 0 && closed_args.is_empty() {
                    target.clone()
                } else {
                    self.instantiate_at(target, closed_args, *span, guarded)?
                };
                // Graph references carry no arguments; the instance id says
                // it all.
                Ok(Expr::Reference {
                    name: name.clone(),
                    target: Some(target),
                    args: Vec::new(),
                    span: *span,
                })
            }
            Expr::Seq { items, span } => Ok(Expr::Seq {
                items: items
                    .iter()
                    .map(|i| self.close_expr(i, subst, guarded))
                    .collect::<Result<Vec<_>, _>>()?,
                span: *span,
            }),
            Expr::Choice { alts, span } => Ok(Expr::Choice {
                alts: alts
                    .iter()
                    .map(|a| self.close_expr(a, subst, true))
                    .collect::<Result<Vec<_>, _>>()?,
                span: *span,
            }),
            Expr::Repeat {
                min,
                max,
                inner,
                span,
            } => Ok(Expr::Repeat {
                min: *min,
                max: *max,
                inner: Box::new(self.close_expr(inner, subst, true)?),
                span: *span,
            }),
            Expr::Guard {
                expect,
                condition,
                inner,
                span,
            } => Ok(Expr::Guard {
                expect: *expect,
                condition: Box::new(self.close_expr(condition, subst, guarded)?),
                inner: Box::new(self.close_expr(inner, subst, guarded)?),
                span: *span,
            }),
            Expr::Bind { tag, inner, span } => Ok(Expr::Bind {
                tag: tag.clone(),
                inner: Box::new(self.close_expr(inner, subst, guarded)?),
                span: *span,
            }),
            Expr::Literal { .. } | Expr::Class { .. } | Expr::Wildcard { .. } | Expr::Cut { .. } => {
                Ok(expr.clone())
            }
        }
    }

    fn instantiate_at(
        &mut self,
        base: &RuleId,
        args: Vec<Expr>,
        span: Span,
        guarded: bool,
    ) -> Result<RuleId, BraidError> {
        let Some(def) = self.unit.rules.get(base).cloned() else {
            return Err(self.ctx.internal_error(
                &format!("no definition for generic '{base}'"),
                to_source_span(span),
            ));
        };
        if def.params.len() != args.len() {
            return Err(self.ctx.arity_mismatch(
                base.as_str(),
                def.params.len(),
                args.len(),
                to_source_span(span),
            ));
        }
        if args.is_empty() {
            return Ok(base.clone());
        }

        let stripped: Vec<Expr> = args.iter().map(Expr::strip_spans).collect();
        let key = InstanceKey {
            base: base.clone(),
            args: stripped,
        };
        if let Some(hit) = self.cache.get(&key).cloned() {
            self.stats.instantiation_cache_hits += 1;
            self.trace.push(ExpansionStep {
                phase: ExpansionPhase::Generic,
                source: base.clone(),
                minted: hit.clone(),
                cached: true,
            });
            return Ok(hit);
        }

        let rendered: Vec<String> = key.args.iter().map(Expr::to_string).collect();
        let minted_id = RuleId::raw(format!("{}<{}>", base, rendered.join(", ")));

        if let Some(pos) = self
            .in_progress
            .iter()
            .position(|f| f.base == *base && f.args == key.args)
        {
            if guarded {
                return Ok(self.in_progress[pos].minted.clone());
            }
            let mut chain: Vec<&str> = self.in_progress[pos..]
                .iter()
                .map(|f| f.minted.as_str())
                .collect();
            chain.push(minted_id.as_str());
            return Err(self.ctx.report(
                ErrorKind::InstantiationCycle {
                    chain: chain.join(" -> "),
                },
                to_source_span(span),
            ));
        }
        if self.in_progress.len() >= MAX_EXPANSION_DEPTH {
            return Err(self.ctx.report(
                ErrorKind::ExpansionOverflow {
                    rule: base.as_str().into(),
                    limit: MAX_EXPANSION_DEPTH,
                },
                to_source_span(span),
            ));
        }

        // Arguments keep their call-site spans inside the instance body;
        // only the cache key is span-stripped.
        let subst: HashMap<String, Expr> = def
            .params
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        self.in_progress.push(Frame {
            base: base.clone(),
            args: key.args.clone(),
            minted: minted_id.clone(),
        });
        let body = self.close_expr(&def.body, &subst, false);
        self.in_progress.pop();
        let body = body?;

        self.graph.insert(
            minted_id.clone(),
            ResolvedRule {
                id: minted_id.clone(),
                body,
                action: def.action.clone(),
                span: def.span,
                origin: RuleOrigin::Instance { base: base.clone() },
            },
        );
        self.cache.insert(key, minted_id.clone());
        self.stats.instantiations += 1;
        self.trace.push(ExpansionStep {
            phase: ExpansionPhase::Generic,
            source: base.clone(),
            minted: minted_id.clone(),
            cached: false,
        });
        Ok(minted_id)
    }
}
