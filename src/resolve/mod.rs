//! # Import Resolver
//!
//! Turns a [`GrammarUnit`] into per-block symbol tables and a linked rule
//! map. Resolution is a pure transformation: the input unit is never
//! mutated, and identical input always yields identical tables regardless
//! of block declaration order (import order within a block matters only for
//! `pub` chains).
//!
//! The pass runs in four stages:
//! 1. declaration checks (duplicates, name validity),
//! 2. dependency graph construction with cycle detection,
//! 3. symbol table construction in reverse-topological order,
//! 4. reference linking (rewriting every reference to carry its target).
//!
//! Visibility is two-tier: each block's `visible` map answers bare-name
//! lookups inside the block, while its `exported` map is what importers
//! receive. A local rule shadows an imported name; two imports bringing the
//! same name with different targets is ambiguous. Bare names inside template
//! rules are deliberately left unlinked - they bind late, against each
//! caller's table, during template expansion.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{to_source_span, BraidError, ErrorKind, ErrorReporting, ReportContext};
use crate::grammar::{Block, Expr, GrammarUnit, ImportKind, Rule, RuleId, Span};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_?[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// True for names the engine accepts for blocks, rules, parameters, and
/// aliases. A single leading underscore marks a private rule.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

// ============================================================================
// SYMBOL TABLES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOrigin {
    Local,
    Imported { via: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub target: RuleId,
    pub origin: SymbolOrigin,
}

impl Symbol {
    fn describe(&self) -> String {
        match &self.origin {
            SymbolOrigin::Local => format!("local '{}'", self.target),
            SymbolOrigin::Imported { via } => format!("'{}' via '{}'", self.target, via),
        }
    }
}

/// The resolved view of one block: what is visible inside it, what it
/// exports to importers, and which qualifiers address which blocks.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pub block: String,
    visible: im::OrdMap<String, Symbol>,
    exported: im::OrdMap<String, Symbol>,
    qualifiers: im::OrdMap<String, String>,
}

impl SymbolTable {
    /// Bare-name lookup inside the block (locals shadow imports).
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.visible.get(name)
    }

    /// What importers of this block receive under `name`.
    pub fn exported(&self, name: &str) -> Option<&Symbol> {
        self.exported.get(name)
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.exported.contains_key(name)
    }

    /// The block a qualifier (import alias or block name) addresses.
    pub fn qualifier_target(&self, qualifier: &str) -> Option<&str> {
        self.qualifiers.get(qualifier).map(String::as_str)
    }

    /// Exported names in sorted order.
    pub fn exported_names(&self) -> impl Iterator<Item = &str> {
        self.exported.keys().map(String::as_str)
    }
}

/// Output of resolution: tables per block and the linked rules, keyed by
/// their fully-qualified identifiers.
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub tables: im::OrdMap<String, SymbolTable>,
    pub rules: im::OrdMap<RuleId, Rule>,
    pub start: Option<RuleId>,
}

impl ResolvedUnit {
    pub fn table(&self, block: &str) -> Option<&SymbolTable> {
        self.tables.get(block)
    }

    pub fn rule(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.get(id)
    }
}

/// Resolves a grammar unit into symbol tables and linked rules.
pub fn resolve(unit: &GrammarUnit) -> Result<ResolvedUnit, BraidError> {
    Resolver::new(unit).run()
}

// ============================================================================
// RESOLVER
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Gray,
    Black,
}

struct Resolver<'u> {
    unit: &'u GrammarUnit,
    index: HashMap<&'u str, &'u Block>,
    ctx: ReportContext,
    colors: HashMap<String, Color>,
    path: Vec<String>,
    order: Vec<String>,
    tables: im::OrdMap<String, SymbolTable>,
}

impl<'u> Resolver<'u> {
    fn new(unit: &'u GrammarUnit) -> Self {
        let source = unit.source.clone().unwrap_or_default();
        Self {
            unit,
            index: HashMap::new(),
            ctx: ReportContext::new(source, "resolve"),
            colors: HashMap::new(),
            path: Vec::new(),
            order: Vec::new(),
            tables: im::OrdMap::new(),
        }
    }

    fn run(mut self) -> Result<ResolvedUnit, BraidError> {
        self.check_declarations()?;
        for block in &self.unit.blocks {
            if !self.colors.contains_key(&block.name) {
                self.visit(&block.name)?;
            }
        }
        let order = std::mem::take(&mut self.order);
        for name in &order {
            self.build_table(name)?;
        }
        let rules = self.link_rules()?;
        Ok(ResolvedUnit {
            tables: self.tables,
            rules,
            start: self.unit.start.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Stage 1: declaration checks
    // ------------------------------------------------------------------

    fn check_declarations(&mut self) -> Result<(), BraidError> {
        for block in &self.unit.blocks {
            if !is_valid_name(&block.name) {
                return Err(self.malformed_name(&block.name, block.span));
            }
            if self.index.insert(&block.name, block).is_some() {
                return Err(self.ctx.report(
                    ErrorKind::DuplicateBlock {
                        name: block.name.clone(),
                    },
                    to_source_span(block.span),
                ));
            }
            let mut rule_names: HashSet<&str> = HashSet::new();
            for rule in &block.rules {
                if !is_valid_name(&rule.name) {
                    return Err(self.malformed_name(&rule.name, rule.span));
                }
                if !rule_names.insert(&rule.name) {
                    return Err(self.ctx.report(
                        ErrorKind::DuplicateRule {
                            name: rule.name.clone(),
                            block: block.name.clone(),
                        },
                        to_source_span(rule.span),
                    ));
                }
                let mut params: HashSet<&str> = HashSet::new();
                for param in &rule.params {
                    if !is_valid_name(param) {
                        return Err(self.malformed_name(param, rule.span));
                    }
                    if !params.insert(param) {
                        return Err(self.ctx.report(
                            ErrorKind::DuplicateParameter {
                                name: param.clone(),
                                rule: rule.name.clone(),
                            },
                            to_source_span(rule.span),
                        ));
                    }
                }
            }
            for decl in &block.imports {
                if let Some(alias) = &decl.alias {
                    if !is_valid_name(alias) {
                        return Err(self.malformed_name(alias, decl.span));
                    }
                }
            }
        }
        Ok(())
    }

    fn malformed_name(&self, name: &str, span: Span) -> BraidError {
        self.ctx.report(
            ErrorKind::MalformedName { name: name.into() },
            to_source_span(span),
        )
    }

    // ------------------------------------------------------------------
    // Stage 2: dependency graph and cycle detection
    // ------------------------------------------------------------------

    fn visit(&mut self, name: &str) -> Result<(), BraidError> {
        self.colors.insert(name.to_string(), Color::Gray);
        self.path.push(name.to_string());

        let Some(block) = self.index.get(name).copied() else {
            return Err(self
                .ctx
                .internal_error(&format!("block '{name}' vanished during traversal"), crate::errors::unspanned()));
        };
        for decl in &block.imports {
            if !matches!(decl.kind, ImportKind::Use | ImportKind::UseReexport) {
                continue;
            }
            self.check_import_target(&block.name, decl)?;
            match self.colors.get(decl.block.as_str()) {
                None => self.visit(&decl.block)?,
                Some(Color::Gray) => {
                    let start = self
                        .path
                        .iter()
                        .position(|p| p == &decl.block)
                        .unwrap_or(0);
                    let mut cycle = self.path[start..].join(" -> ");
                    cycle.push_str(" -> ");
                    cycle.push_str(&decl.block);
                    return Err(self.ctx.cyclic_import(cycle, to_source_span(decl.span)));
                }
                Some(Color::Black) => {}
            }
        }

        self.path.pop();
        self.colors.insert(name.to_string(), Color::Black);
        self.order.push(name.to_string());
        Ok(())
    }

    fn check_import_target(
        &self,
        importer: &str,
        decl: &crate::grammar::ImportDeclaration,
    ) -> Result<(), BraidError> {
        let Some(target) = self.index.get(decl.block.as_str()) else {
            let mut err = self.ctx.unresolved_symbol(
                &decl.block,
                &format!("block '{importer}'"),
                to_source_span(decl.span),
            );
            err.diagnostic_info.help =
                Some(format!("no block named '{}' in this unit", decl.block));
            return Err(err);
        };
        if let Some(from) = &decl.from {
            if target.origin.as_deref() != Some(from.as_str()) {
                let mut err = self.ctx.unresolved_symbol(
                    &decl.block,
                    &format!("block '{importer}'"),
                    to_source_span(decl.span),
                );
                err.diagnostic_info.help = Some(match &target.origin {
                    Some(origin) => format!(
                        "block '{}' comes from '{}', not '{}'",
                        decl.block, origin, from
                    ),
                    None => format!("block '{}' carries no origin label", decl.block),
                });
                return Err(err);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage 3: symbol table construction (dependencies first)
    // ------------------------------------------------------------------

    fn build_table(&mut self, name: &str) -> Result<(), BraidError> {
        let Some(block) = self.index.get(name).copied() else {
            return Err(self
                .ctx
                .internal_error(&format!("no block '{name}' at table construction"), crate::errors::unspanned()));
        };

        let mut visible = im::OrdMap::new();
        let mut exported = im::OrdMap::new();
        let mut qualifiers = im::OrdMap::new();
        qualifiers.insert(block.name.clone(), block.name.clone());

        for rule in &block.rules {
            let sym = Symbol {
                target: RuleId::new(&block.name, &rule.name),
                origin: SymbolOrigin::Local,
            };
            visible.insert(rule.name.clone(), sym.clone());
            if !rule.is_private() {
                exported.insert(rule.name.clone(), sym);
            }
        }

        let mut used: HashSet<&str> = HashSet::new();
        for decl in &block.imports {
            match decl.kind {
                ImportKind::Use => {
                    self.import_into(&mut visible, &mut qualifiers, decl)?;
                    used.insert(&decl.block);
                }
                ImportKind::UseReexport => {
                    self.import_into(&mut visible, &mut qualifiers, decl)?;
                    used.insert(&decl.block);
                    self.reexport_into(&mut exported, decl)?;
                }
                ImportKind::Reexport => {
                    if !used.contains(decl.block.as_str()) {
                        let mut err = self.ctx.unresolved_symbol(
                            &decl.block,
                            &format!("block '{}'", block.name),
                            to_source_span(decl.span),
                        );
                        err.diagnostic_info.help = Some(format!(
                            "`pub {0}` requires a prior `use {0}` in the same block",
                            decl.block
                        ));
                        return Err(err);
                    }
                    self.reexport_into(&mut exported, decl)?;
                }
            }
        }

        self.tables.insert(
            name.to_string(),
            SymbolTable {
                block: name.to_string(),
                visible,
                exported,
                qualifiers,
            },
        );
        Ok(())
    }

    fn dep_table(&self, decl: &crate::grammar::ImportDeclaration) -> Result<&SymbolTable, BraidError> {
        self.tables.get(decl.block.as_str()).ok_or_else(|| {
            self.ctx.internal_error(
                &format!("dependency '{}' resolved out of order", decl.block),
                to_source_span(decl.span),
            )
        })
    }

    fn import_into(
        &self,
        visible: &mut im::OrdMap<String, Symbol>,
        qualifiers: &mut im::OrdMap<String, String>,
        decl: &crate::grammar::ImportDeclaration,
    ) -> Result<(), BraidError> {
        let qualifier = decl.qualifier();
        match qualifiers.get(qualifier) {
            Some(existing) if existing != &decl.block => {
                return Err(self.ctx.ambiguous_import(
                    qualifier,
                    &format!("block '{existing}'"),
                    &format!("block '{}'", decl.block),
                    to_source_span(decl.span),
                ));
            }
            Some(_) => {}
            None => {
                qualifiers.insert(qualifier.to_string(), decl.block.clone());
            }
        }

        let dep = self.dep_table(decl)?;
        for (name, sym) in dep.exported.iter() {
            match visible.get(name) {
                // A local definition shadows any import of the same name.
                Some(existing) if existing.origin == SymbolOrigin::Local => {}
                // Diamond imports of the same rule merge silently.
                Some(existing) if existing.target == sym.target => {}
                Some(existing) => {
                    return Err(self.ctx.ambiguous_import(
                        name,
                        &existing.describe(),
                        &format!("'{}' via '{}'", sym.target, decl.block),
                        to_source_span(decl.span),
                    ));
                }
                None => {
                    visible.insert(
                        name.clone(),
                        Symbol {
                            target: sym.target.clone(),
                            origin: SymbolOrigin::Imported {
                                via: decl.block.clone(),
                            },
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn reexport_into(
        &self,
        exported: &mut im::OrdMap<String, Symbol>,
        decl: &crate::grammar::ImportDeclaration,
    ) -> Result<(), BraidError> {
        let dep = self.dep_table(decl)?;
        for (name, sym) in dep.exported.iter() {
            match exported.get(name) {
                Some(existing) if existing.origin == SymbolOrigin::Local => {}
                Some(existing) if existing.target == sym.target => {}
                Some(existing) => {
                    return Err(self.ctx.ambiguous_import(
                        name,
                        &existing.describe(),
                        &format!("'{}' via '{}'", sym.target, decl.block),
                        to_source_span(decl.span),
                    ));
                }
                None => {
                    exported.insert(
                        name.clone(),
                        Symbol {
                            target: sym.target.clone(),
                            origin: SymbolOrigin::Imported {
                                via: decl.block.clone(),
                            },
                        },
                    );
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage 4: reference linking
    // ------------------------------------------------------------------

    fn link_rules(&self) -> Result<im::OrdMap<RuleId, Rule>, BraidError> {
        let mut out = im::OrdMap::new();
        for block in &self.unit.blocks {
            let Some(table) = self.tables.get(block.name.as_str()) else {
                return Err(self
                    .ctx
                    .internal_error(&format!("no table for block '{}'", block.name), crate::errors::unspanned()));
            };
            for rule in &block.rules {
                let mut linked = rule.clone();
                linked.body = self.link_expr(&rule.body, rule, block, table)?;
                out.insert(RuleId::new(&block.name, &rule.name), linked);
            }
        }
        Ok(out)
    }

    fn link_expr(
        &self,
        expr: &Expr,
        rule: &Rule,
        block: &Block,
        table: &SymbolTable,
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
                    .map(|a| self.link_expr(a, rule, block, table))
                    .collect::<Result<Vec<_>, _>>()?;
                let target = match target {
                    Some(t) => Some(t.clone()),
                    None => self.resolve_name(name, rule, block, table, *span)?,
                };
                Ok(Expr::Reference {
                    name: name.clone(),
                    target,
                    args,
                    span: *span,
                })
            }
            Expr::Param { name, span } => {
                if !rule.params.iter().any(|p| p == name) {
                    let mut err = self.ctx.unresolved_symbol(
                        &format!("${name}"),
                        &format!("rule '{}.{}'", block.name, rule.name),
                        to_source_span(*span),
                    );
                    err.diagnostic_info.help = Some(format!(
                        "declare '{name}' as a generic parameter of '{}'",
                        rule.name
                    ));
                    return Err(err);
                }
                Ok(expr.clone())
            }
            Expr::Literal { .. } | Expr::Class { .. } | Expr::Wildcard { .. } | Expr::Cut { .. } => {
                Ok(expr.clone())
            }
            Expr::Seq { items, span } => Ok(Expr::Seq {
                items: items
                    .iter()
                    .map(|i| self.link_expr(i, rule, block, table))
                    .collect::<Result<Vec<_>, _>>()?,
                span: *span,
            }),
            Expr::Choice { alts, span } => Ok(Expr::Choice {
                alts: alts
                    .iter()
                    .map(|a| self.link_expr(a, rule, block, table))
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
                inner: Box::new(self.link_expr(inner, rule, block, table)?),
                span: *span,
            }),
            Expr::Guard {
                expect,
                condition,
                inner,
                span,
            } => Ok(Expr::Guard {
                expect: *expect,
                condition: Box::new(self.link_expr(condition, rule, block, table)?),
                inner: Box::new(self.link_expr(inner, rule, block, table)?),
                span: *span,
            }),
            Expr::Bind { tag, inner, span } => Ok(Expr::Bind {
                tag: tag.clone(),
                inner: Box::new(self.link_expr(inner, rule, block, table)?),
                span: *span,
            }),
        }
    }

    /// Resolves a reference name to its target, or to `None` for bare names
    /// in template bodies (late-bound during expansion).
    fn resolve_name(
        &self,
        name: &str,
        rule: &Rule,
        block: &Block,
        table: &SymbolTable,
        span: Span,
    ) -> Result<Option<RuleId>, BraidError> {
        if let Some((qualifier, rest)) = name.split_once('.') {
            let Some(target_block) = table.qualifier_target(qualifier) else {
                let mut err = self.ctx.unresolved_symbol(
                    qualifier,
                    &format!("block '{}'", block.name),
                    to_source_span(span),
                );
                err.diagnostic_info.help = Some(format!(
                    "no imported block or alias named '{qualifier}' in block '{}'",
                    block.name
                ));
                return Err(err);
            };

            // Own-block qualification reaches private rules.
            if target_block == block.name {
                return match block.rule(rest) {
                    Some(r) => Ok(Some(RuleId::new(&block.name, &r.name))),
                    None => Err(self.ctx.unresolved_symbol(
                        rest,
                        &format!("block '{}'", block.name),
                        to_source_span(span),
                    )),
                };
            }

            let target_block = target_block.to_string();
            let Some(dep) = self.tables.get(target_block.as_str()) else {
                return Err(self.ctx.internal_error(
                    &format!("no table for qualified target '{target_block}'"),
                    to_source_span(span),
                ));
            };
            if let Some(sym) = dep.exported(rest) {
                return Ok(Some(sym.target.clone()));
            }
            if let Some(dep_block) = self.index.get(target_block.as_str()) {
                if let Some(hidden) = dep_block.rule(rest) {
                    if hidden.is_private() {
                        return Err(self.ctx.private_rule_access(
                            RuleId::new(&target_block, rest).as_str(),
                            &block.name,
                            to_source_span(span),
                        ));
                    }
                }
            }
            let mut err = self.ctx.unresolved_symbol(
                rest,
                &format!("block '{target_block}'"),
                to_source_span(span),
            );
            if dep.lookup(rest).is_some() {
                err.diagnostic_info.help = Some(format!(
                    "'{rest}' is visible inside '{target_block}' but not exported; re-export it with `pub`"
                ));
            }
            return Err(err);
        }

        match table.lookup(name) {
            Some(sym) => Ok(Some(sym.target.clone())),
            // Bare names in templates bind to the caller's table later.
            None if rule.is_template() => Ok(None),
            None => {
                let mut err = self.ctx.unresolved_symbol(
                    name,
                    &format!("block '{}'", block.name),
                    to_source_span(span),
                );
                err.diagnostic_info.help = Some(format!(
                    "'{name}' is not declared in '{}' and no import provides it",
                    block.name
                ));
                Err(err)
            }
        }
    }
}
