//! # Grammar Model
//!
//! The structured input and working representation of the engine: blocks,
//! import declarations, rules, and expression trees. Values of these types
//! are produced by an external grammar parser (or the [`builder`] helpers),
//! consumed by resolution, and never mutated in place - every engine phase
//! builds new trees.
//!
//! Expression trees are owned (`Box`/`Vec`), so a `clone` is always a deep
//! copy and instantiated rules can never alias one another's nodes.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::errors::SourceContext;

pub mod builder;

// ============================================================================
// SPANS AND IDENTIFIERS
// ============================================================================

/// A byte range into the grammar source text, carried by every model node for
/// diagnostics. The engine never interprets the underlying text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A fully-qualified rule identifier: `Block.Rule` for declared rules,
/// `Base<args>` for generic instances and `Template@fingerprint` for template
/// expansions (both minted by the engine, never by callers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(block: &str, rule: &str) -> Self {
        Self(format!("{block}.{rule}"))
    }

    /// Wraps an already-qualified identifier verbatim.
    pub fn raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The block component: everything before the first `.`.
    pub fn block(&self) -> &str {
        match self.0.split_once('.') {
            Some((block, _)) => block,
            None => &self.0,
        }
    }

    /// The rule component: everything after the first `.`. Minted identifiers
    /// keep their argument rendering here.
    pub fn rule(&self) -> &str {
        match self.0.split_once('.') {
            Some((_, rule)) => rule,
            None => &self.0,
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// EXPRESSION TREES
// ============================================================================

/// A capture tag attached to a sub-expression via [`Expr::Bind`]. Tags name
/// the sub-match in the bindings handed to the semantic-action runtime:
/// numeric tags render as `e1`, `e2`, ... and named tags as `e:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindTag {
    Index(u32),
    Name(String),
}

impl BindTag {
    /// The tag name used as the bindings-map key.
    pub fn render(&self) -> String {
        match self {
            Self::Index(n) => format!("e{n}"),
            Self::Name(name) => format!("e:{name}"),
        }
    }
}

/// A PEG expression tree node.
///
/// `Reference.target` starts out `None` as parsed; resolution links it to a
/// fully-qualified [`RuleId`]. The only references that stay unlinked after
/// resolution are bare names inside template bodies, which bind late to each
/// caller's symbol table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Exact text. The empty literal matches zero-width.
    Literal { text: String, span: Span },
    /// A single-character class, e.g. `[a-z0-9]`. The raw bracketed pattern
    /// is kept verbatim and compiled during graph validation.
    Class { pattern: String, span: Span },
    /// Any single character.
    Wildcard { span: Span },
    /// A reference to another rule, bare (`Elem`) or qualified
    /// (`Std.Ident`), optionally applying generic arguments.
    Reference {
        name: String,
        target: Option<RuleId>,
        args: Vec<Expr>,
        span: Span,
    },
    /// A generic parameter reference (`$Content`), valid only inside the body
    /// of the rule declaring the parameter.
    Param { name: String, span: Span },
    /// Items matched one after another.
    Seq { items: Vec<Expr>, span: Span },
    /// Ordered choice: alternatives tried first to last, first success wins.
    Choice { alts: Vec<Expr>, span: Span },
    /// Greedy repetition of `inner`, `min..=max` times (`max` of `None` is
    /// unbounded).
    Repeat {
        min: usize,
        max: Option<usize>,
        inner: Box<Expr>,
        span: Span,
    },
    /// A guarded expression: `condition` is probed zero-width at the current
    /// position first. With `expect` true the probe must match, with `expect`
    /// false it must fail; only then is `inner` attempted.
    Guard {
        expect: bool,
        condition: Box<Expr>,
        inner: Box<Expr>,
        span: Span,
    },
    /// Commits the innermost cut scope. Consumes nothing, never fails.
    Cut { span: Span },
    /// Records the span matched by `inner` under `tag` for the enclosing
    /// rule's action bindings.
    Bind {
        tag: BindTag,
        inner: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Self::Literal { span, .. }
            | Self::Class { span, .. }
            | Self::Wildcard { span }
            | Self::Reference { span, .. }
            | Self::Param { span, .. }
            | Self::Seq { span, .. }
            | Self::Choice { span, .. }
            | Self::Repeat { span, .. }
            | Self::Guard { span, .. }
            | Self::Cut { span }
            | Self::Bind { span, .. } => *span,
        }
    }

    /// Deep copy with every span reset to the default. Structural cache keys
    /// use this so that two call sites of the same application compare equal.
    pub fn strip_spans(&self) -> Expr {
        match self {
            Self::Literal { text, .. } => Self::Literal {
                text: text.clone(),
                span: Span::default(),
            },
            Self::Class { pattern, .. } => Self::Class {
                pattern: pattern.clone(),
                span: Span::default(),
            },
            Self::Wildcard { .. } => Self::Wildcard {
                span: Span::default(),
            },
            Self::Reference {
                name, target, args, ..
            } => Self::Reference {
                name: name.clone(),
                target: target.clone(),
                args: args.iter().map(Expr::strip_spans).collect(),
                span: Span::default(),
            },
            Self::Param { name, .. } => Self::Param {
                name: name.clone(),
                span: Span::default(),
            },
            Self::Seq { items, .. } => Self::Seq {
                items: items.iter().map(Expr::strip_spans).collect(),
                span: Span::default(),
            },
            Self::Choice { alts, .. } => Self::Choice {
                alts: alts.iter().map(Expr::strip_spans).collect(),
                span: Span::default(),
            },
            Self::Repeat {
                min, max, inner, ..
            } => Self::Repeat {
                min: *min,
                max: *max,
                inner: Box::new(inner.strip_spans()),
                span: Span::default(),
            },
            Self::Guard {
                expect,
                condition,
                inner,
                ..
            } => Self::Guard {
                expect: *expect,
                condition: Box::new(condition.strip_spans()),
                inner: Box::new(inner.strip_spans()),
                span: Span::default(),
            },
            Self::Cut { .. } => Self::Cut {
                span: Span::default(),
            },
            Self::Bind { tag, inner, .. } => Self::Bind {
                tag: tag.clone(),
                inner: Box::new(inner.strip_spans()),
                span: Span::default(),
            },
        }
    }
}

/// Canonical rendering. Deterministic and structure-faithful; minted instance
/// identifiers embed it, so structurally-equal argument lists render
/// identically.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal { text, .. } => {
                write!(f, "\"{}\"", escape_literal(text))
            }
            Self::Class { pattern, .. } => f.write_str(pattern),
            Self::Wildcard { .. } => f.write_str("."),
            Self::Reference {
                name, target, args, ..
            } => {
                match target {
                    Some(id) => write!(f, "{id}")?,
                    None => f.write_str(name)?,
                }
                if !args.is_empty() {
                    f.write_str("<")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_str(">")?;
                }
                Ok(())
            }
            Self::Param { name, .. } => write!(f, "${name}"),
            Self::Seq { items, .. } => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Choice { alts, .. } => {
                f.write_str("(")?;
                for (i, alt) in alts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" / ")?;
                    }
                    write!(f, "{alt}")?;
                }
                f.write_str(")")
            }
            Self::Repeat {
                min, max, inner, ..
            } => {
                write!(f, "{inner}")?;
                match (min, max) {
                    (0, None) => f.write_str("*"),
                    (1, None) => f.write_str("+"),
                    (0, Some(1)) => f.write_str("?"),
                    (n, None) => write!(f, "{{{n},}}"),
                    (n, Some(m)) if n == m => write!(f, "{{{n}}}"),
                    (n, Some(m)) => write!(f, "{{{n},{m}}}"),
                }
            }
            Self::Guard {
                expect,
                condition,
                inner,
                ..
            } => {
                let sym = if *expect { "&" } else { "!" };
                write!(f, "({sym}{condition} {inner})")
            }
            Self::Cut { .. } => f.write_str("^"),
            Self::Bind { tag, inner, .. } => {
                write!(f, "{inner}#{}", tag.render())
            }
        }
    }
}

fn escape_literal(text: &str) -> String {
    text.chars().flat_map(char::escape_default).collect()
}

// ============================================================================
// RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Substitution is purely syntactic; parameterized plain rules are the
    /// engine's generics.
    Plain,
    /// Expansion depends on the invocation environment: bare references in
    /// the body resolve against each caller's symbol table.
    Template,
}

/// A named expression tree, optionally parameterized, optionally a template,
/// optionally carrying an action reference for the external semantic-action
/// runtime.
///
/// Rule names starting with `_` are private to their declaring block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub params: Vec<String>,
    pub kind: RuleKind,
    pub body: Expr,
    pub action: Option<String>,
    pub span: Span,
}

impl Rule {
    pub fn new(name: impl Into<String>, body: Expr) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            kind: RuleKind::Plain,
            body,
            action: None,
            span: Span::default(),
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn templated(mut self) -> Self {
        self.kind = RuleKind::Template;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_template(&self) -> bool {
        self.kind == RuleKind::Template
    }

    pub fn is_generic(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn is_private(&self) -> bool {
        self.name.starts_with('_')
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.params.is_empty() {
            // Generics take angle brackets, templates parentheses.
            let (open, close) = if self.is_template() {
                ("(", ")")
            } else {
                ("<", ">")
            };
            f.write_str(open)?;
            for (i, p) in self.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                f.write_str(p)?;
            }
            f.write_str(close)?;
        }
        write!(f, " <- {}", strip_outer_group(&self.body.to_string()))?;
        if let Some(action) = &self.action {
            write!(f, " => {action}")?;
        }
        Ok(())
    }
}

/// Drops one redundant level of grouping parentheses for display purposes.
fn strip_outer_group(rendered: &str) -> &str {
    if !(rendered.starts_with('(') && rendered.ends_with(')')) {
        return rendered;
    }
    let mut depth = 0usize;
    for (i, c) in rendered.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i + 1 < rendered.len() {
                    return rendered;
                }
            }
            _ => {}
        }
    }
    &rendered[1..rendered.len() - 1]
}

// ============================================================================
// BLOCKS AND COMPILATION UNITS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportKind {
    /// `use B`: B's exported rules become visible here, privately.
    Use,
    /// `pub B`: re-export a block already imported via a prior `use`.
    Reexport,
    /// `pub use B`: both in one declaration.
    UseReexport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDeclaration {
    pub kind: ImportKind,
    /// The imported block's name.
    pub block: String,
    /// Expected origin of the imported block (`use B from source`); checked
    /// against [`Block::origin`] when present.
    pub from: Option<String>,
    /// Qualifier for qualified references (`use B as X` makes `X.Rule`
    /// address B's rules). Defaults to the block name.
    pub alias: Option<String>,
    pub span: Span,
}

impl ImportDeclaration {
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.block)
    }
}

/// A named, ordered collection of rule definitions plus import declarations.
/// Blocks are the unit of visibility; names are unique within a
/// [`GrammarUnit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    /// Provenance label supplied by the external parser (e.g. the file alias
    /// the block came from); validated against `from` clauses.
    pub origin: Option<String>,
    pub imports: Vec<ImportDeclaration>,
    pub rules: Vec<Rule>,
    pub span: Span,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: None,
            imports: Vec::new(),
            rules: Vec::new(),
            span: Span::default(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_imports(mut self, imports: Vec<ImportDeclaration>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// The compilation unit handed to resolution: every block of the grammar, an
/// optional start rule, and the optional grammar source for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrammarUnit {
    pub blocks: Vec<Block>,
    pub start: Option<RuleId>,
    pub source: Option<SourceContext>,
}

impl GrammarUnit {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            start: None,
            source: None,
        }
    }

    pub fn with_start(mut self, block: &str, rule: &str) -> Self {
        self.start = Some(RuleId::new(block, rule));
        self
    }

    pub fn with_source(mut self, source: SourceContext) -> Self {
        self.source = Some(source);
        self
    }

    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod display_tests {
    use super::builder::*;
    use super::*;

    #[test]
    fn canonical_rendering_is_stable() {
        let expr = seq([
            lit("("),
            call("Content", [r("Elem")]),
            lit(")"),
        ]);
        assert_eq!(expr.to_string(), "(\"(\" Content<Elem> \")\")");
        // Stripping spans never changes the rendering.
        assert_eq!(expr.strip_spans().to_string(), expr.to_string());
    }

    #[test]
    fn repeat_suffixes() {
        assert_eq!(star(r("A")).to_string(), "A*");
        assert_eq!(plus(r("A")).to_string(), "A+");
        assert_eq!(opt(r("A")).to_string(), "A?");
        assert_eq!(rep(r("A"), 2, None).to_string(), "A{2,}");
        assert_eq!(rep(r("A"), 2, Some(2)).to_string(), "A{2}");
        assert_eq!(rep(r("A"), 2, Some(4)).to_string(), "A{2,4}");
    }

    #[test]
    fn guards_binds_and_cuts() {
        let expr = seq([
            guard_not(lit(","), any()),
            cut(),
            bind(1, r("Elem")),
            bind_named("tail", r("Rest")),
        ]);
        assert_eq!(
            expr.to_string(),
            "((!\",\" .) ^ Elem#e1 Rest#e:tail)"
        );
    }

    #[test]
    fn literal_escaping() {
        assert_eq!(lit("a\"b\\c").to_string(), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn rule_display_marks_templates_and_generics() {
        let generic = Rule::new("Wrap", seq([lit("("), param("C"), lit(")")]))
            .with_params(["C"]);
        assert_eq!(generic.to_string(), "Wrap<C> <- \"(\" $C \")\"");

        let template = Rule::new("Listed", star(r("Elem")))
            .with_params(["Sep"])
            .templated()
            .with_action("collect");
        assert_eq!(template.to_string(), "Listed(Sep) <- Elem* => collect");
    }

    #[test]
    fn rule_id_components() {
        let id = RuleId::new("List", "Args");
        assert_eq!(id.block(), "List");
        assert_eq!(id.rule(), "Args");
        let minted = RuleId::raw("List.Wrap<Std.Ident>");
        assert_eq!(minted.block(), "List");
        assert_eq!(minted.rule(), "Wrap<Std.Ident>");
    }
}
