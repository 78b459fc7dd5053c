//! # Expansion Passes
//!
//! Two successive rewriting passes sit between resolution and the runnable
//! rule graph:
//!
//! 1. [`template`] - macro-style expansion of template rules at their call
//!    sites, with bare names bound to each caller's symbol table. Runs first
//!    so the following pass only ever sees ordinary (if still generic)
//!    rules.
//! 2. [`instantiate`] - closing of generic rules into concrete ones, one
//!    instance per structurally distinct argument list.
//!
//! Both passes are hygienic by construction: expression trees are owned, so
//! cloning a body or an argument always yields a deep copy and no two minted
//! rules can alias each other's nodes. Both passes memoize aggressively and
//! record every step in a trace journal; the engine itself performs no
//! logging I/O.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::grammar::{Expr, RuleId};

pub mod instantiate;
pub mod template;

pub use instantiate::{close_unit, ClosedUnit, Instantiator, ResolvedRule, ResolvedRuleGraph, RuleOrigin};
pub use template::{expand_unit, ExpandedUnit, TemplateExpander};

/// Maximum nesting depth for template expansion and generic instantiation.
/// Divergent definitions (such as a generic that instantiates itself with an
/// ever-growing argument) hit this limit instead of looping.
pub const MAX_EXPANSION_DEPTH: usize = 128;

/// Counters maintained across both expansion passes. The instantiation pass
/// starts from the template pass's counts, so the final value describes the
/// whole pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpandStats {
    pub template_expansions: usize,
    pub template_cache_hits: usize,
    pub instantiations: usize,
    pub instantiation_cache_hits: usize,
}

/// Which pass produced a trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExpansionPhase {
    Template,
    Generic,
}

/// A single expansion or instantiation step, for traceability. Cache hits are
/// recorded too, with `cached` set, so a trace shows every call site even
/// when no new rule was minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpansionStep {
    pub phase: ExpansionPhase,
    /// The template or generic definition being closed.
    pub source: RuleId,
    /// The concrete rule the call site now points at.
    pub minted: RuleId,
    pub cached: bool,
}

/// Collects bare reference names that resolution left unlinked, sorted and
/// deduplicated. For a template body these are the names whose meaning
/// depends on the caller expanding it.
pub(crate) fn unlinked_names(expr: &Expr) -> Vec<String> {
    let mut names = Vec::new();
    collect_unlinked(expr, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_unlinked(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Reference { name, target, args, .. } => {
            if target.is_none() {
                out.push(name.clone());
            }
            for arg in args {
                collect_unlinked(arg, out);
            }
        }
        Expr::Seq { items, .. } => {
            for item in items {
                collect_unlinked(item, out);
            }
        }
        Expr::Choice { alts, .. } => {
            for alt in alts {
                collect_unlinked(alt, out);
            }
        }
        Expr::Repeat { inner, .. } | Expr::Bind { inner, .. } => {
            collect_unlinked(inner, out);
        }
        Expr::Guard { condition, inner, .. } => {
            collect_unlinked(condition, out);
            collect_unlinked(inner, out);
        }
        Expr::Literal { .. }
        | Expr::Class { .. }
        | Expr::Wildcard { .. }
        | Expr::Param { .. }
        | Expr::Cut { .. } => {}
    }
}

/// Collects the targets of fully-linked references, deduplicated in first
/// appearance order. Template expansion follows these to reach templates a
/// body mentions by a name that resolved in the declaring block.
pub(crate) fn linked_targets(expr: &Expr) -> Vec<RuleId> {
    let mut targets = Vec::new();
    collect_linked(expr, &mut targets);
    targets
}

fn collect_linked(expr: &Expr, out: &mut Vec<RuleId>) {
    match expr {
        Expr::Reference { target, args, .. } => {
            if let Some(target) = target {
                if !out.contains(target) {
                    out.push(target.clone());
                }
            }
            for arg in args {
                collect_linked(arg, out);
            }
        }
        Expr::Seq { items, .. } => {
            for item in items {
                collect_linked(item, out);
            }
        }
        Expr::Choice { alts, .. } => {
            for alt in alts {
                collect_linked(alt, out);
            }
        }
        Expr::Repeat { inner, .. } | Expr::Bind { inner, .. } => {
            collect_linked(inner, out);
        }
        Expr::Guard { condition, inner, .. } => {
            collect_linked(condition, out);
            collect_linked(inner, out);
        }
        Expr::Literal { .. }
        | Expr::Class { .. }
        | Expr::Wildcard { .. }
        | Expr::Param { .. }
        | Expr::Cut { .. } => {}
    }
}

/// Fingerprints the context-relevant slice of a caller's symbol table for
/// template memoization. Two call sites whose bindings agree on every
/// context-relevant name share one expansion, whatever else their tables
/// contain.
pub(crate) fn context_fingerprint(template: &RuleId, bindings: &[(String, RuleId)]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(template.as_str().as_bytes());
    for (name, target) in bindings {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([1u8]);
        hasher.update(target.as_str().as_bytes());
    }
    hasher.finalize().into()
}

/// First eight bytes of a fingerprint as lowercase hex, used in minted
/// template identifiers.
pub(crate) fn short_hex(digest: &[u8; 32]) -> String {
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod fingerprint_tests {
    use super::*;
    use crate::grammar::builder::*;

    #[test]
    fn unlinked_names_are_sorted_and_deduplicated() {
        let body = seq([r("Zeta"), r("Alpha"), star(r("Zeta")), lit("x")]);
        assert_eq!(unlinked_names(&body), vec!["Alpha", "Zeta"]);
    }

    #[test]
    fn linked_references_are_not_context_relevant() {
        let mut linked = r("Elem");
        if let Expr::Reference { target, .. } = &mut linked {
            *target = Some(RuleId::new("Main", "Elem"));
        }
        let body = seq([linked, r("Free")]);
        assert_eq!(unlinked_names(&body), vec!["Free"]);
    }

    #[test]
    fn linked_targets_are_collected_once_each() {
        let mut wrap = r("Wrap");
        if let Expr::Reference { target, .. } = &mut wrap {
            *target = Some(RuleId::new("Lib", "Wrap"));
        }
        let body = seq([wrap.clone(), star(wrap), r("Free")]);
        assert_eq!(linked_targets(&body), vec![RuleId::new("Lib", "Wrap")]);
    }

    #[test]
    fn fingerprint_separates_name_and_target_boundaries() {
        let template = RuleId::new("Lib", "Wrap");
        let a = context_fingerprint(
            &template,
            &[("ab".into(), RuleId::raw("M.cd"))],
        );
        let b = context_fingerprint(
            &template,
            &[("a".into(), RuleId::raw("bM.cd"))],
        );
        assert_ne!(a, b);
        assert_eq!(short_hex(&a).len(), 16);
    }
}
