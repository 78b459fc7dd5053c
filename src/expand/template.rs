//! # Template Expansion
//!
//! Rewrites every call to a template rule into a call to a concrete minted
//! rule whose body is the template's body with bare names bound against the
//! caller's symbol table. Template definitions themselves do not survive the
//! pass.
//!
//! Expansion is memoized per `(template, context fingerprint)`: the
//! fingerprint covers only the context-relevant subset of the caller's table.
//! That subset is transitive. A template's body may reach other templates,
//! by a bare name or by one that already resolved in the declaring block,
//! and those expand against this caller too, so their free names belong to
//! the fingerprint as much as the template's own. Callers from different
//! blocks share an expansion whenever all of those bindings agree.
//!
//! A template may mention itself. If the self-reference sits under a choice
//! alternative or a repetition it is ordinary recursion and is rewired to the
//! expansion in progress; anywhere else it would expand forever and is
//! rejected.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{
    to_source_span, BraidError, ErrorKind, ErrorReporting, ReportContext, SourceContext,
};
use crate::expand::{
    context_fingerprint, linked_targets, short_hex, unlinked_names, ExpandStats, ExpansionPhase,
    ExpansionStep, MAX_EXPANSION_DEPTH,
};
use crate::grammar::{Expr, Rule, RuleId, Span};
use crate::resolve::{ResolvedUnit, SymbolTable};

/// Output of the template pass: the unit's rules with template definitions
/// removed, minted expansions added, and every call site rewired.
#[derive(Debug, Clone)]
pub struct ExpandedUnit {
    pub rules: im::OrdMap<RuleId, Rule>,
    /// Where each minted rule came from. Rules absent from this map are
    /// ordinary declarations.
    pub origins: im::OrdMap<RuleId, RuleId>,
    pub start: Option<RuleId>,
    pub stats: ExpandStats,
    pub trace: Vec<ExpansionStep>,
}

/// Expands all template calls in a resolved unit.
pub fn expand_unit(
    resolved: &ResolvedUnit,
    source: &SourceContext,
) -> Result<ExpandedUnit, BraidError> {
    let mut expander = TemplateExpander::new(resolved, source);
    let mut rules = im::OrdMap::new();

    for (id, rule) in resolved.rules.iter() {
        // Template definitions are consumed by expansion, not carried over.
        if rule.is_template() {
            continue;
        }
        let expanded = expander.expand_rule(id, rule)?;
        rules.insert(id.clone(), expanded);
    }

    for (id, rule) in expander.minted.iter() {
        rules.insert(id.clone(), rule.clone());
    }
    Ok(ExpandedUnit {
        rules,
        origins: expander.origins,
        start: resolved.start.clone(),
        stats: expander.stats,
        trace: expander.trace,
    })
}

struct Frame {
    template: RuleId,
    minted: RuleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExpansionKey {
    template: RuleId,
    context: [u8; 32],
}

/// Expands template calls against caller symbol tables, memoizing by
/// context fingerprint.
pub struct TemplateExpander<'r> {
    unit: &'r ResolvedUnit,
    ctx: ReportContext,
    cache: HashMap<ExpansionKey, RuleId>,
    in_progress: Vec<Frame>,
    minted: im::OrdMap<RuleId, Rule>,
    origins: im::OrdMap<RuleId, RuleId>,
    stats: ExpandStats,
    trace: Vec<ExpansionStep>,
}

impl<'r> TemplateExpander<'r> {
    pub fn new(unit: &'r ResolvedUnit, source: &SourceContext) -> Self {
        Self {
            unit,
            ctx: ReportContext::new(source.clone(), "expand"),
            cache: HashMap::new(),
            in_progress: Vec::new(),
            minted: im::OrdMap::new(),
            origins: im::OrdMap::new(),
            stats: ExpandStats::default(),
            trace: Vec::new(),
        }
    }

    /// Rewrites one rule body, expanding every template call it contains.
    /// The rule's own block provides the caller context.
    pub fn expand_rule(&mut self, id: &RuleId, rule: &Rule) -> Result<Rule, BraidError> {
        let Some(table) = self.unit.table(id.block()) else {
            return Err(self.ctx.internal_error(
                &format!("no symbol table for block '{}'", id.block()),
                to_source_span(rule.span),
            ));
        };
        let mut expanded = rule.clone();
        expanded.body = self.rewrite(&rule.body, table, false)?;
        Ok(expanded)
    }

    // A reference is `guarded` when some enclosing node on the path from the
    // rule root is a choice alternative or a repetition body; only guarded
    // self-references are legal recursion.
    fn rewrite(
        &mut self,
        expr: &Expr,
        caller: &SymbolTable,
        guarded: bool,
    ) -> Result<Expr, BraidError> {
        match expr {
            Expr::Reference {
                name,
                target,
                args,
                span,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.rewrite(a, caller, guarded))
                    .collect::<Result<Vec<_>, _>>()?;
                let target = match target {
                    Some(t) => t.clone(),
                    // Late binding: a bare name in a template body takes its
                    // meaning from the caller expanding it.
                    None => match caller.lookup(name) {
                        Some(sym) => sym.target.clone(),
                        None => {
                            return Err(self.unresolved_in_context(name, caller, *span));
                        }
                    },
                };
                let target = match self.unit.rules.get(&target) {
                    Some(def) if def.is_template() => {
                        self.expand_call(&target, caller, *span, guarded)?
                    }
                    _ => target,
                };
                Ok(Expr::Reference {
                    name: name.clone(),
                    target: Some(target),
                    args,
                    span: *span,
                })
            }
            Expr::Seq { items, span } => Ok(Expr::Seq {
                items: items
                    .iter()
                    .map(|i| self.rewrite(i, caller, guarded))
                    .collect::<Result<Vec<_>, _>>()?,
                span: *span,
            }),
            Expr::Choice { alts, span } => Ok(Expr::Choice {
                alts: alts
                    .iter()
                    .map(|a| self.rewrite(a, caller, true))
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
                inner: Box::new(self.rewrite(inner, caller, true)?),
                span: *span,
            }),
            Expr::Guard {
                expect,
                condition,
                inner,
                span,
            } => Ok(Expr::Guard {
                expect: *expect,
                condition: Box::new(self.rewrite(condition, caller, guarded)?),
                inner: Box::new(self.rewrite(inner, caller, guarded)?),
                span: *span,
            }),
            Expr::Bind { tag, inner, span } => Ok(Expr::Bind {
                tag: tag.clone(),
                inner: Box::new(self.rewrite(inner, caller, guarded)?),
                span: *span,
            }),
            Expr::Literal { .. }
            | Expr::Class { .. }
            | Expr::Wildcard { .. }
            | Expr::Param { .. }
            | Expr::Cut { .. } => Ok(expr.clone()),
        }
    }

    /// Expands one template call site, returning the minted rule id the call
    /// should reference instead.
    fn expand_call(
        &mut self,
        template: &RuleId,
        caller: &SymbolTable,
        call_span: Span,
        guarded: bool,
    ) -> Result<RuleId, BraidError> {
        if let Some(pos) = self.in_progress.iter().position(|f| &f.template == template) {
            if guarded {
                // Recursion through a choice or repetition ties the knot on
                // the expansion already in progress.
                return Ok(self.in_progress[pos].minted.clone());
            }
            let mut chain: Vec<&str> = self.in_progress[pos..]
                .iter()
                .map(|f| f.template.as_str())
                .collect();
            chain.push(template.as_str());
            return Err(self.ctx.report(
                ErrorKind::TemplateExpansion {
                    template: template.as_str().into(),
                    chain: chain.join(" -> "),
                },
                to_source_span(call_span),
            ));
        }
        if self.in_progress.len() >= MAX_EXPANSION_DEPTH {
            return Err(self.ctx.report(
                ErrorKind::ExpansionOverflow {
                    rule: template.as_str().into(),
                    limit: MAX_EXPANSION_DEPTH,
                },
                to_source_span(call_span),
            ));
        }

        let Some(def) = self.unit.rules.get(template).cloned() else {
            return Err(self.ctx.internal_error(
                &format!("template '{template}' has no definition"),
                to_source_span(call_span),
            ));
        };

        let bindings = self.context_bindings(template, caller, call_span)?;
        let digest = context_fingerprint(template, &bindings);
        let key = ExpansionKey {
            template: template.clone(),
            context: digest,
        };
        if let Some(hit) = self.cache.get(&key).cloned() {
            self.stats.template_cache_hits += 1;
            self.trace.push(ExpansionStep {
                phase: ExpansionPhase::Template,
                source: template.clone(),
                minted: hit.clone(),
                cached: true,
            });
            return Ok(hit);
        }

        // The minted id exists before the body walk so self-references can
        // resolve to it.
        let minted_id = RuleId::raw(format!("{}@{}", template, short_hex(&digest)));
        self.in_progress.push(Frame {
            template: template.clone(),
            minted: minted_id.clone(),
        });
        let body = self.rewrite(&def.body, caller, false);
        self.in_progress.pop();

        let mut minted = def;
        minted.name = minted_id.rule().to_string();
        minted.kind = crate::grammar::RuleKind::Plain;
        minted.body = body?;
        self.minted.insert(minted_id.clone(), minted);
        self.origins.insert(minted_id.clone(), template.clone());
        self.cache.insert(key, minted_id.clone());
        self.stats.template_expansions += 1;
        self.trace.push(ExpansionStep {
            phase: ExpansionPhase::Template,
            source: template.clone(),
            minted: minted_id.clone(),
            cached: false,
        });
        Ok(minted_id)
    }

    /// Collects every caller binding an expansion of `template` depends on.
    /// The walk is transitive over referenced templates: each one reached
    /// from the body, bare or already linked, expands against the same
    /// caller, so its free names resolve here too. Self-references end up
    /// in the visited set and terminate the walk.
    fn context_bindings(
        &self,
        template: &RuleId,
        caller: &SymbolTable,
        call_span: Span,
    ) -> Result<Vec<(String, RuleId)>, BraidError> {
        let mut bindings: BTreeMap<String, RuleId> = BTreeMap::new();
        let mut visited: HashSet<RuleId> = HashSet::new();
        let mut pending = vec![template.clone()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(def) = self.unit.rules.get(&current) else {
                continue;
            };
            for name in unlinked_names(&def.body) {
                let Some(sym) = caller.lookup(&name) else {
                    return Err(self.unresolved_in_context(&name, caller, call_span));
                };
                if self.is_template(&sym.target) {
                    pending.push(sym.target.clone());
                }
                bindings.insert(name, sym.target.clone());
            }
            for target in linked_targets(&def.body) {
                if self.is_template(&target) {
                    pending.push(target);
                }
            }
        }
        Ok(bindings.into_iter().collect())
    }

    fn is_template(&self, id: &RuleId) -> bool {
        self.unit.rules.get(id).map_or(false, |def| def.is_template())
    }

    fn unresolved_in_context(
        &self,
        name: &str,
        caller: &SymbolTable,
        span: Span,
    ) -> BraidError {
        let mut err = self.ctx.unresolved_symbol(
            name,
            &format!("block '{}'", caller.block),
            to_source_span(span),
        );
        err.diagnostic_info.help = Some(format!(
            "the template mentions '{name}', which must be visible wherever the template is used"
        ));
        err
    }
}
