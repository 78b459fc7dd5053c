//! Braid error handling - unified encapsulated API
//!
//! Every fatal condition in the engine flows through [`BraidError`]. Ordinary
//! PEG match failure is *not* an error and never appears here; it is a normal
//! control-flow result of backtracking (see `runtime`).

use miette::{Diagnostic, SourceSpan};
use miette::{LabeledSpan, NamedSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// SOURCE CONTEXT - Error reporting infrastructure
// ============================================================================

/// Source context for error reporting, with explicit hierarchy between real
/// grammar sources (preferred) and fallbacks (tolerated when the embedder
/// supplies none).
///
/// The engine never re-parses this text; it exists solely so diagnostics can
/// label spans in the grammar the external parser consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub name: String,
    pub content: String,
}

impl SourceContext {
    /// Create a source context from real grammar text.
    /// This is the preferred constructor for error reporting.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Create a fallback when real source is unavailable.
    /// Use only when the grammar text cannot be obtained.
    pub fn fallback(context: &str) -> Self {
        Self {
            name: "fallback".to_string(),
            content: format!("// {}", context),
        }
    }

    /// Convert to NamedSource for use with miette error reporting.
    pub fn to_named_source(&self) -> Arc<NamedSource<String>> {
        Arc::new(NamedSource::new(self.name.clone(), self.content.clone()))
    }
}

impl Default for SourceContext {
    fn default() -> Self {
        Self::fallback("no grammar source supplied")
    }
}

/// The single error type - no wrapper, no variants, just essential data.
#[derive(Debug)]
pub struct BraidError {
    /// What went wrong (type-specific data)
    pub kind: ErrorKind,
    /// Where it happened (context-specific source information)
    pub source_info: SourceInfo,
    /// How to help (auto-populated based on context)
    pub diagnostic_info: DiagnosticInfo,
}

/// All error types as a clean enum - no duplicate fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // Resolution errors - import graph and symbol table construction
    CyclicImport {
        cycle: String,
    },
    UnresolvedSymbol {
        symbol: String,
        scope: String,
    },
    AmbiguousImport {
        symbol: String,
        first: String,
        second: String,
    },
    DuplicateBlock {
        name: String,
    },
    DuplicateRule {
        name: String,
        block: String,
    },
    DuplicateParameter {
        name: String,
        rule: String,
    },
    PrivateRuleAccess {
        rule: String,
        from: String,
    },
    MalformedName {
        name: String,
    },
    MissingStartRule {
        start: Option<String>,
    },

    // Expansion errors - template expansion and generic instantiation
    ArityMismatch {
        rule: String,
        expected: usize,
        actual: usize,
    },
    InstantiationCycle {
        chain: String,
    },
    TemplateExpansion {
        template: String,
        chain: String,
    },
    ExpansionOverflow {
        rule: String,
        limit: usize,
    },

    // Validation errors - resolved-graph invariants
    RecursiveRule {
        rule: String,
    },
    InvalidCharClass {
        class: String,
        reason: String,
    },
    MalformedGraph {
        detail: String,
    },

    // Match-time errors - fatal conditions during evaluation
    ZeroWidthRepetition {
        rule: String,
    },
    RecursionLimit {
        limit: usize,
    },
    ActionFailed {
        action: String,
        reason: String,
    },
}

/// Context-specific source information.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source: Arc<NamedSource<String>>,
    pub primary_span: SourceSpan,
    pub phase: String,
}

/// Diagnostic enhancement data.
#[derive(Debug, Clone)]
pub struct DiagnosticInfo {
    pub help: Option<String>,
    pub error_code: String,
}

/// Context-aware error creation - each phase knows how to create appropriate
/// errors. Errors are never assembled by hand outside this mechanism.
pub trait ErrorReporting {
    /// Create an error with context-appropriate enhancements.
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> BraidError;

    /// Convenience methods for common error types
    fn unresolved_symbol(&self, symbol: &str, scope: &str, span: SourceSpan) -> BraidError {
        self.report(
            ErrorKind::UnresolvedSymbol {
                symbol: symbol.into(),
                scope: scope.into(),
            },
            span,
        )
    }

    fn ambiguous_import(
        &self,
        symbol: &str,
        first: &str,
        second: &str,
        span: SourceSpan,
    ) -> BraidError {
        self.report(
            ErrorKind::AmbiguousImport {
                symbol: symbol.into(),
                first: first.into(),
                second: second.into(),
            },
            span,
        )
    }

    fn cyclic_import(&self, cycle: String, span: SourceSpan) -> BraidError {
        self.report(ErrorKind::CyclicImport { cycle }, span)
    }

    fn arity_mismatch(
        &self,
        rule: &str,
        expected: usize,
        actual: usize,
        span: SourceSpan,
    ) -> BraidError {
        self.report(
            ErrorKind::ArityMismatch {
                rule: rule.into(),
                expected,
                actual,
            },
            span,
        )
    }

    fn private_rule_access(&self, rule: &str, from: &str, span: SourceSpan) -> BraidError {
        self.report(
            ErrorKind::PrivateRuleAccess {
                rule: rule.into(),
                from: from.into(),
            },
            span,
        )
    }

    /// Creates an internal error - these indicate engine bugs, not grammar
    /// errors. Use this for situations that should never happen in correct
    /// engine operation.
    fn internal_error(&self, detail: &str, span: SourceSpan) -> BraidError {
        let mut error = self.report(
            ErrorKind::MalformedGraph {
                detail: detail.into(),
            },
            span,
        );
        error.diagnostic_info.help =
            Some("This is an internal engine error. Please report this as a bug.".into());
        error
    }
}

impl ErrorKind {
    /// Get the error category for test assertions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CyclicImport { .. }
            | Self::UnresolvedSymbol { .. }
            | Self::AmbiguousImport { .. }
            | Self::DuplicateBlock { .. }
            | Self::DuplicateRule { .. }
            | Self::DuplicateParameter { .. }
            | Self::PrivateRuleAccess { .. }
            | Self::MalformedName { .. }
            | Self::MissingStartRule { .. } => ErrorCategory::Resolve,

            Self::ArityMismatch { .. }
            | Self::InstantiationCycle { .. }
            | Self::TemplateExpansion { .. }
            | Self::ExpansionOverflow { .. } => ErrorCategory::Expand,

            Self::RecursiveRule { .. }
            | Self::InvalidCharClass { .. }
            | Self::MalformedGraph { .. } => ErrorCategory::Validate,

            Self::ZeroWidthRepetition { .. }
            | Self::RecursionLimit { .. }
            | Self::ActionFailed { .. } => ErrorCategory::Match,
        }
    }

    /// Get error code suffix for diagnostic codes.
    /// Uses const evaluation for zero-cost error code generation.
    pub const fn code_suffix(&self) -> &'static str {
        match self {
            Self::CyclicImport { .. } => "cyclic_import",
            Self::UnresolvedSymbol { .. } => "unresolved_symbol",
            Self::AmbiguousImport { .. } => "ambiguous_import",
            Self::DuplicateBlock { .. } => "duplicate_block",
            Self::DuplicateRule { .. } => "duplicate_rule",
            Self::DuplicateParameter { .. } => "duplicate_parameter",
            Self::PrivateRuleAccess { .. } => "private_rule_access",
            Self::MalformedName { .. } => "malformed_name",
            Self::MissingStartRule { .. } => "missing_start_rule",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::InstantiationCycle { .. } => "instantiation_cycle",
            Self::TemplateExpansion { .. } => "template_expansion",
            Self::ExpansionOverflow { .. } => "expansion_overflow",
            Self::RecursiveRule { .. } => "recursive_rule",
            Self::InvalidCharClass { .. } => "invalid_char_class",
            Self::MalformedGraph { .. } => "malformed_graph",
            Self::ZeroWidthRepetition { .. } => "zero_width_repetition",
            Self::RecursionLimit { .. } => "recursion_limit",
            Self::ActionFailed { .. } => "action_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Resolve,
    Expand,
    Validate,
    Match,
}

impl std::error::Error for BraidError {}

impl fmt::Display for BraidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::CyclicImport { cycle } => {
                write!(f, "Resolve error: cyclic import {}", cycle)
            }
            ErrorKind::UnresolvedSymbol { symbol, scope } => {
                write!(f, "Resolve error: unresolved symbol '{}' in {}", symbol, scope)
            }
            ErrorKind::AmbiguousImport {
                symbol,
                first,
                second,
            } => {
                write!(
                    f,
                    "Resolve error: ambiguous import of '{}' ({} vs {})",
                    symbol, first, second
                )
            }
            ErrorKind::DuplicateBlock { name } => {
                write!(f, "Resolve error: duplicate block '{}'", name)
            }
            ErrorKind::DuplicateRule { name, block } => {
                write!(
                    f,
                    "Resolve error: duplicate rule '{}' in block '{}'",
                    name, block
                )
            }
            ErrorKind::DuplicateParameter { name, rule } => {
                write!(
                    f,
                    "Resolve error: duplicate parameter '{}' on rule '{}'",
                    name, rule
                )
            }
            ErrorKind::PrivateRuleAccess { rule, from } => {
                write!(
                    f,
                    "Resolve error: private rule '{}' is not accessible from block '{}'",
                    rule, from
                )
            }
            ErrorKind::MalformedName { name } => {
                write!(f, "Resolve error: malformed name '{}'", name)
            }
            ErrorKind::MissingStartRule { start } => match start {
                Some(id) => write!(f, "Resolve error: start rule '{}' is not defined", id),
                None => write!(f, "Resolve error: no start rule declared"),
            },
            ErrorKind::ArityMismatch {
                rule,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Expand error: '{}' expects {} argument(s), got {}",
                    rule, expected, actual
                )
            }
            ErrorKind::InstantiationCycle { chain } => {
                write!(f, "Expand error: instantiation cycle {}", chain)
            }
            ErrorKind::TemplateExpansion { template, chain } => {
                write!(
                    f,
                    "Expand error: template '{}' expands into itself ({})",
                    template, chain
                )
            }
            ErrorKind::ExpansionOverflow { rule, limit } => {
                write!(
                    f,
                    "Expand error: expansion of '{}' exceeded depth limit {}",
                    rule, limit
                )
            }
            ErrorKind::RecursiveRule { rule } => {
                write!(
                    f,
                    "Validation error: rule '{}' references itself outside any choice or repetition",
                    rule
                )
            }
            ErrorKind::InvalidCharClass { class, reason } => {
                write!(
                    f,
                    "Validation error: invalid character class '{}': {}",
                    class, reason
                )
            }
            ErrorKind::MalformedGraph { detail } => {
                write!(f, "Validation error: malformed rule graph: {}", detail)
            }
            ErrorKind::ZeroWidthRepetition { rule } => {
                write!(
                    f,
                    "Match error: repetition in rule '{}' loops without consuming input",
                    rule
                )
            }
            ErrorKind::RecursionLimit { limit } => {
                write!(f, "Match error: recursion limit {} exceeded", limit)
            }
            ErrorKind::ActionFailed { action, reason } => {
                write!(f, "Match error: action '{}' failed: {}", action, reason)
            }
        }
    }
}

impl Diagnostic for BraidError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(&self.diagnostic_info.error_code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.diagnostic_info
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        let labels = vec![LabeledSpan::new_with_span(
            Some(self.primary_label()),
            self.source_info.primary_span,
        )];
        Some(Box::new(labels.into_iter()))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&*self.source_info.source)
    }
}

impl BraidError {
    fn primary_label(&self) -> String {
        match &self.kind {
            ErrorKind::CyclicImport { .. } => "cycle enters here".into(),
            ErrorKind::UnresolvedSymbol { .. } => "unresolved symbol".into(),
            ErrorKind::AmbiguousImport { .. } => "ambiguous import".into(),
            ErrorKind::DuplicateBlock { .. } => "duplicate block".into(),
            ErrorKind::DuplicateRule { .. } => "duplicate rule".into(),
            ErrorKind::DuplicateParameter { .. } => "duplicate parameter".into(),
            ErrorKind::PrivateRuleAccess { .. } => "private rule".into(),
            ErrorKind::MalformedName { .. } => "malformed name".into(),
            ErrorKind::MissingStartRule { .. } => "start rule missing".into(),
            ErrorKind::ArityMismatch { .. } => "arity mismatch".into(),
            ErrorKind::InstantiationCycle { .. } => "cycle closes here".into(),
            ErrorKind::TemplateExpansion { .. } => "self-expansion here".into(),
            ErrorKind::ExpansionOverflow { .. } => "expansion too deep".into(),
            ErrorKind::RecursiveRule { .. } => "unguarded self-reference".into(),
            ErrorKind::InvalidCharClass { .. } => "invalid character class".into(),
            ErrorKind::MalformedGraph { .. } => "graph invariant broken".into(),
            ErrorKind::ZeroWidthRepetition { .. } => "zero-width repetition".into(),
            ErrorKind::RecursionLimit { .. } => "recursion limit exceeded".into(),
            ErrorKind::ActionFailed { .. } => "action failed".into(),
        }
    }
}

/// Creates a placeholder span for errors not tied to a specific grammar
/// location, such as internal invariant failures. This makes the intent of
/// using an empty span explicit and searchable.
pub fn unspanned() -> miette::SourceSpan {
    miette::SourceSpan::from(0..0)
}

/// Converts a grammar model Span to a miette SourceSpan, bridging the model's
/// span representation and the error reporting span format.
pub fn to_source_span(span: crate::grammar::Span) -> miette::SourceSpan {
    miette::SourceSpan::from(span.start..span.end)
}

/// General-purpose error creation context used by every engine phase for
/// creating properly contextualized BraidError instances.
pub struct ReportContext {
    pub source: SourceContext,
    pub phase: String,
}

impl ReportContext {
    pub fn new(source: SourceContext, phase: impl Into<String>) -> Self {
        Self {
            source,
            phase: phase.into(),
        }
    }
}

impl ErrorReporting for ReportContext {
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> BraidError {
        let error_code = format!("braid::{}::{}", self.phase, kind.code_suffix());

        BraidError {
            kind,
            source_info: SourceInfo {
                source: self.source.to_named_source(),
                primary_span: span,
                phase: self.phase.clone(),
            },
            diagnostic_info: DiagnosticInfo {
                help: None,
                error_code,
            },
        }
    }
}

// ============================================================================
// ERROR FORMATTING UTILITIES
// ============================================================================

/// Renders a BraidError with full miette diagnostics into a string.
///
/// This provides rich error formatting with source spans, labels, and help
/// text. Embedders decide where the rendered report goes; the engine itself
/// performs no I/O.
pub fn render_report(error: BraidError) -> String {
    use miette::Report;
    let report = Report::new(error);
    format!("{report:?}")
}
