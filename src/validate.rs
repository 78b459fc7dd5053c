//! # Graph Validation
//!
//! The last stop before matching. Validation proves the resolved graph is
//! runnable: every reference names a graph entry and carries no leftover
//! arguments, no parameter survived instantiation, no rule references itself
//! outside a choice or repetition, and every character class compiles.
//!
//! Class patterns compile once here, into a cache the matcher reuses, so a
//! malformed class is a compile-time error rather than a surprise mid-match.

use std::collections::HashMap;

use regex::Regex;

use crate::errors::{
    to_source_span, BraidError, ErrorKind, ErrorReporting, ReportContext, SourceContext,
};
use crate::expand::ResolvedRuleGraph;
use crate::grammar::{Expr, RuleId};

/// Compiled character classes, keyed by their source pattern.
#[derive(Debug, Clone, Default)]
pub struct ClassCache {
    compiled: HashMap<String, Regex>,
}

impl ClassCache {
    pub fn regex(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// Validates a resolved rule graph and compiles its character classes.
pub fn validate(graph: &ResolvedRuleGraph, source: &SourceContext) -> Result<ClassCache, BraidError> {
    let ctx = ReportContext::new(source.clone(), "validate");
    let mut cache = ClassCache::default();
    for (id, rule) in graph.iter() {
        check_expr(&ctx, graph, id, &rule.body, false, &mut cache)?;
    }
    Ok(cache)
}

// `guarded` tracks whether the path from the rule root passes through a
// choice alternative or repetition body; a self-reference is only legal
// there.
fn check_expr(
    ctx: &ReportContext,
    graph: &ResolvedRuleGraph,
    id: &RuleId,
    expr: &Expr,
    guarded: bool,
    cache: &mut ClassCache,
) -> Result<(), BraidError> {
    match expr {
        Expr::Reference {
            name,
            target,
            args,
            span,
        } => {
            if !args.is_empty() {
                return Err(ctx.internal_error(
                    &format!("reference '{name}' in '{id}' still carries arguments"),
                    to_source_span(*span),
                ));
            }
            let Some(target) = target else {
                return Err(ctx.internal_error(
                    &format!("reference '{name}' in '{id}' is unlinked"),
                    to_source_span(*span),
                ));
            };
            if !graph.contains(target.as_str()) {
                return Err(ctx.internal_error(
                    &format!("reference '{name}' in '{id}' targets missing rule '{target}'"),
                    to_source_span(*span),
                ));
            }
            if target == id && !guarded {
                return Err(ctx.report(
                    ErrorKind::RecursiveRule {
                        rule: id.as_str().into(),
                    },
                    to_source_span(*span),
                ));
            }
            Ok(())
        }
        Expr::Param { name, span } => Err(ctx.internal_error(
            &format!("parameter '${name}' in '{id}' survived instantiation"),
            to_source_span(*span),
        )),
        Expr::Class { pattern, span } => {
            if cache.compiled.contains_key(pattern) {
                return Ok(());
            }
            let regex = compile_class(pattern).map_err(|reason| {
                ctx.report(
                    ErrorKind::InvalidCharClass {
                        class: pattern.clone(),
                        reason,
                    },
                    to_source_span(*span),
                )
            })?;
            cache.compiled.insert(pattern.clone(), regex);
            Ok(())
        }
        Expr::Seq { items, .. } => {
            for item in items {
                check_expr(ctx, graph, id, item, guarded, cache)?;
            }
            Ok(())
        }
        Expr::Choice { alts, .. } => {
            for alt in alts {
                check_expr(ctx, graph, id, alt, true, cache)?;
            }
            Ok(())
        }
        Expr::Repeat { inner, .. } => check_expr(ctx, graph, id, inner, true, cache),
        Expr::Guard {
            condition, inner, ..
        } => {
            check_expr(ctx, graph, id, condition, guarded, cache)?;
            check_expr(ctx, graph, id, inner, guarded, cache)
        }
        Expr::Bind { inner, .. } => check_expr(ctx, graph, id, inner, guarded, cache),
        Expr::Literal { .. } | Expr::Wildcard { .. } | Expr::Cut { .. } => Ok(()),
    }
}

/// Compiles a bracketed class pattern, anchored so matching only ever
/// consumes from the current position.
fn compile_class(pattern: &str) -> Result<Regex, String> {
    if !(pattern.starts_with('[') && pattern.ends_with(']') && pattern.len() >= 3) {
        return Err("expected a non-empty bracketed pattern like [a-z]".into());
    }
    // One bracket expression exactly: the first unescaped `]` must close
    // the pattern.
    let inner = &pattern[1..];
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ']' if i + 1 < inner.len() => {
                return Err("pattern continues after the closing ']'".into());
            }
            _ => {}
        }
    }
    Regex::new(&format!("^(?:{pattern})")).map_err(|e| e.to_string())
}

#[cfg(test)]
mod class_tests {
    use super::*;

    #[test]
    fn bracketed_classes_compile_anchored() {
        let re = compile_class("[a-z]").expect("compiles");
        assert!(re.is_match("abc"));
        assert!(!re.is_match("ABC"));
        // Anchored: a match later in the input does not count.
        assert!(!re.is_match("0a"));
    }

    #[test]
    fn negated_class() {
        let re = compile_class("[^,)]").expect("compiles");
        assert!(re.is_match("x"));
        assert!(!re.is_match(","));
        assert!(!re.is_match(")"));
    }

    #[test]
    fn malformed_classes_are_rejected() {
        assert!(compile_class("abc").is_err());
        assert!(compile_class("[]").is_err());
        assert!(compile_class("[z-a]").is_err());
    }

    #[test]
    fn a_class_is_one_bracket_expression() {
        assert!(compile_class("[a][b]").is_err());
        assert!(compile_class("[a]|[b]").is_err());
        // An escaped `]` does not close the expression.
        assert!(compile_class(r"[\]]").is_ok());
    }
}
