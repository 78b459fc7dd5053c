//! Programmatic construction helpers for the grammar model.
//!
//! External grammar parsers produce [`Expr`] trees directly; embedders and
//! the test suite build them through these helpers instead. Spans default to
//! empty - use [`at`] to attach real positions.

use super::{BindTag, Expr, ImportDeclaration, ImportKind, Span};

/// Exact-text literal.
pub fn lit(text: impl Into<String>) -> Expr {
    Expr::Literal {
        text: text.into(),
        span: Span::default(),
    }
}

/// Single-character class; `pattern` is the raw bracketed form, e.g. `[a-z]`.
pub fn class(pattern: impl Into<String>) -> Expr {
    Expr::Class {
        pattern: pattern.into(),
        span: Span::default(),
    }
}

/// Any single character.
pub fn any() -> Expr {
    Expr::Wildcard {
        span: Span::default(),
    }
}

/// A rule reference without arguments, bare (`"Elem"`) or qualified
/// (`"Std.Ident"`).
pub fn r(name: impl Into<String>) -> Expr {
    Expr::Reference {
        name: name.into(),
        target: None,
        args: Vec::new(),
        span: Span::default(),
    }
}

/// A rule reference applying generic arguments: `call("Wrap", [r("Elem")])`
/// models `Wrap<Elem>`.
pub fn call(name: impl Into<String>, args: impl IntoIterator<Item = Expr>) -> Expr {
    Expr::Reference {
        name: name.into(),
        target: None,
        args: args.into_iter().collect(),
        span: Span::default(),
    }
}

/// A generic parameter reference: `param("C")` models `$C`.
pub fn param(name: impl Into<String>) -> Expr {
    Expr::Param {
        name: name.into(),
        span: Span::default(),
    }
}

/// Sequence. A single item collapses to the item itself.
pub fn seq(items: impl IntoIterator<Item = Expr>) -> Expr {
    let mut items: Vec<Expr> = items.into_iter().collect();
    if items.len() == 1 {
        return items.remove(0);
    }
    Expr::Seq {
        items,
        span: Span::default(),
    }
}

/// Ordered choice. A single alternative collapses to the alternative itself.
pub fn choice(alts: impl IntoIterator<Item = Expr>) -> Expr {
    let mut alts: Vec<Expr> = alts.into_iter().collect();
    if alts.len() == 1 {
        return alts.remove(0);
    }
    Expr::Choice {
        alts,
        span: Span::default(),
    }
}

pub fn rep(inner: Expr, min: usize, max: Option<usize>) -> Expr {
    Expr::Repeat {
        min,
        max,
        inner: Box::new(inner),
        span: Span::default(),
    }
}

/// Zero or more.
pub fn star(inner: Expr) -> Expr {
    rep(inner, 0, None)
}

/// One or more.
pub fn plus(inner: Expr) -> Expr {
    rep(inner, 1, None)
}

/// Zero or one.
pub fn opt(inner: Expr) -> Expr {
    rep(inner, 0, Some(1))
}

/// Positive guard: `condition` must match (zero-width) before `inner` is
/// attempted.
pub fn guard_if(condition: Expr, inner: Expr) -> Expr {
    Expr::Guard {
        expect: true,
        condition: Box::new(condition),
        inner: Box::new(inner),
        span: Span::default(),
    }
}

/// Negative guard: `condition` must fail before `inner` is attempted.
pub fn guard_not(condition: Expr, inner: Expr) -> Expr {
    Expr::Guard {
        expect: false,
        condition: Box::new(condition),
        inner: Box::new(inner),
        span: Span::default(),
    }
}

pub fn cut() -> Expr {
    Expr::Cut {
        span: Span::default(),
    }
}

/// Numeric capture tag: `bind(1, r("Elem"))` binds the sub-match as `e1`.
pub fn bind(index: u32, inner: Expr) -> Expr {
    Expr::Bind {
        tag: BindTag::Index(index),
        inner: Box::new(inner),
        span: Span::default(),
    }
}

/// Named capture tag: `bind_named("tail", ...)` binds the sub-match as
/// `e:tail`.
pub fn bind_named(name: impl Into<String>, inner: Expr) -> Expr {
    Expr::Bind {
        tag: BindTag::Name(name.into()),
        inner: Box::new(inner),
        span: Span::default(),
    }
}

/// Attaches a real span to a built expression.
pub fn at(expr: Expr, span: Span) -> Expr {
    match expr {
        Expr::Literal { text, .. } => Expr::Literal { text, span },
        Expr::Class { pattern, .. } => Expr::Class { pattern, span },
        Expr::Wildcard { .. } => Expr::Wildcard { span },
        Expr::Reference {
            name, target, args, ..
        } => Expr::Reference {
            name,
            target,
            args,
            span,
        },
        Expr::Param { name, .. } => Expr::Param { name, span },
        Expr::Seq { items, .. } => Expr::Seq { items, span },
        Expr::Choice { alts, .. } => Expr::Choice { alts, span },
        Expr::Repeat {
            min, max, inner, ..
        } => Expr::Repeat {
            min,
            max,
            inner,
            span,
        },
        Expr::Guard {
            expect,
            condition,
            inner,
            ..
        } => Expr::Guard {
            expect,
            condition,
            inner,
            span,
        },
        Expr::Cut { .. } => Expr::Cut { span },
        Expr::Bind { tag, inner, .. } => Expr::Bind { tag, inner, span },
    }
}

// ============================================================================
// IMPORT DECLARATIONS
// ============================================================================

fn import(kind: ImportKind, block: impl Into<String>) -> ImportDeclaration {
    ImportDeclaration {
        kind,
        block: block.into(),
        from: None,
        alias: None,
        span: Span::default(),
    }
}

/// `use B`
pub fn use_block(block: impl Into<String>) -> ImportDeclaration {
    import(ImportKind::Use, block)
}

/// `use B from source`
pub fn use_from(block: impl Into<String>, from: impl Into<String>) -> ImportDeclaration {
    let mut decl = import(ImportKind::Use, block);
    decl.from = Some(from.into());
    decl
}

/// `use B as X`
pub fn use_as(block: impl Into<String>, alias: impl Into<String>) -> ImportDeclaration {
    let mut decl = import(ImportKind::Use, block);
    decl.alias = Some(alias.into());
    decl
}

/// `pub B` - re-export a block previously imported with `use`.
pub fn reexport(block: impl Into<String>) -> ImportDeclaration {
    import(ImportKind::Reexport, block)
}

/// `pub use B` - import and re-export in one declaration.
pub fn pub_use(block: impl Into<String>) -> ImportDeclaration {
    import(ImportKind::UseReexport, block)
}
