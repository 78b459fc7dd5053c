//! Template expansion and generic instantiation: caller-context binding,
//! memoization, minted identifiers, and the cycle and depth rails.

use braid::expand::{ExpansionPhase, MAX_EXPANSION_DEPTH};
use braid::grammar::builder::*;
use braid::grammar::{Block, Expr, GrammarUnit, Rule, Span};
use braid::{CompiledGrammar, ErrorKind, GrammarPipeline, RuleOrigin};

// ---
// Test Setup
// ---

fn compile(blocks: Vec<Block>) -> CompiledGrammar {
    GrammarPipeline::new()
        .compile(&GrammarUnit::new(blocks))
        .expect("grammar should compile")
}

fn compile_err(blocks: Vec<Block>) -> braid::BraidError {
    GrammarPipeline::new()
        .compile(&GrammarUnit::new(blocks))
        .expect_err("grammar should be rejected")
}

/// Identifiers of graph rules minted from the given template or generic.
fn minted_from(grammar: &CompiledGrammar, source: &str) -> Vec<String> {
    grammar
        .graph()
        .iter()
        .filter(|(_, rule)| match &rule.origin {
            RuleOrigin::Expansion { template } => template.as_str() == source,
            RuleOrigin::Instance { base } => base.as_str() == source,
            RuleOrigin::Plain => false,
        })
        .map(|(id, _)| id.as_str().to_string())
        .collect()
}

fn wrap_template_lib() -> Block {
    Block::new("Lib").with_rules(vec![Rule::new(
        "Wrap",
        seq([lit("<"), r("Content"), lit(">")]),
    )
    .templated()])
}

fn pair_generic_lib() -> Block {
    Block::new("Lib").with_rules(vec![Rule::new(
        "Pair",
        seq([param("T"), lit(","), param("T")]),
    )
    .with_params(["T"])])
}

// ---
// Templates
// ---

#[test]
fn templates_bind_names_where_they_are_used() {
    let a = Block::new("A")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Content", lit("a")),
            Rule::new("Root", r("Wrap")),
        ]);
    let b = Block::new("B")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Content", lit("b")),
            Rule::new("Root", r("Wrap")),
        ]);
    let grammar = compile(vec![a, b, wrap_template_lib()]);

    assert!(grammar.matches("A.Root", "<a>").unwrap().is_match());
    assert!(grammar.matches("B.Root", "<b>").unwrap().is_match());
    assert!(!grammar.matches("A.Root", "<b>").unwrap().is_match());

    let stats = grammar.stats();
    assert_eq!(stats.template_expansions, 2);
    assert_eq!(stats.template_cache_hits, 0);

    let minted = minted_from(&grammar, "Lib.Wrap");
    assert_eq!(minted.len(), 2);
    assert_ne!(minted[0], minted[1]);
}

#[test]
fn nested_templates_rebind_per_caller() {
    // Outer reaches Inner by a name that resolves inside Lib, and Inner
    // late-binds Item. Item still belongs to Outer's context: two callers
    // that disagree on it must not share Outer's expansion.
    let lib = Block::new("Lib").with_rules(vec![
        Rule::new("Outer", seq([lit("{"), r("Inner"), lit("}")])).templated(),
        Rule::new("Inner", seq([lit("["), r("Item"), lit("]")])).templated(),
    ]);
    let a = Block::new("A")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Item", lit("a")),
            Rule::new("Root", r("Outer")),
        ]);
    let b = Block::new("B")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Item", lit("b")),
            Rule::new("Root", r("Outer")),
        ]);
    let grammar = compile(vec![a, b, lib]);

    assert!(grammar.matches("A.Root", "{[a]}").unwrap().is_match());
    assert!(grammar.matches("B.Root", "{[b]}").unwrap().is_match());
    assert!(!grammar.matches("B.Root", "{[a]}").unwrap().is_match());

    // One Outer and one Inner expansion per caller, nothing shared.
    let stats = grammar.stats();
    assert_eq!(stats.template_expansions, 4);
    assert_eq!(stats.template_cache_hits, 0);
    assert_eq!(minted_from(&grammar, "Lib.Outer").len(), 2);
    assert_eq!(minted_from(&grammar, "Lib.Inner").len(), 2);
}

#[test]
fn equal_contexts_share_one_expansion() {
    let a = Block::new("A")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Content", lit("a")),
            Rule::new("First", r("Wrap")),
            Rule::new("Second", r("Wrap")),
        ]);
    let grammar = compile(vec![a, wrap_template_lib()]);

    let stats = grammar.stats();
    assert_eq!(stats.template_expansions, 1);
    assert_eq!(stats.template_cache_hits, 1);
    assert_eq!(minted_from(&grammar, "Lib.Wrap").len(), 1);

    // The journal still records both call sites.
    let steps: Vec<_> = grammar
        .trace()
        .iter()
        .filter(|s| s.phase == ExpansionPhase::Template)
        .collect();
    assert_eq!(steps.len(), 2);
    assert!(!steps[0].cached);
    assert!(steps[1].cached);
    assert_eq!(steps[0].minted, steps[1].minted);
}

#[test]
fn minted_template_names_carry_a_context_fingerprint() {
    let a = Block::new("A")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Content", lit("a")),
            Rule::new("Root", r("Wrap")),
        ]);
    let grammar = compile(vec![a, wrap_template_lib()]);

    let minted = minted_from(&grammar, "Lib.Wrap");
    let name = &minted[0];
    let suffix = name
        .strip_prefix("Lib.Wrap@")
        .unwrap_or_else(|| panic!("unexpected minted name: {name}"));
    assert_eq!(suffix.len(), 16);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn unguarded_template_self_expansion_is_rejected() {
    let lib = Block::new("Lib")
        .with_rules(vec![Rule::new("Bad", r("Bad")).templated()]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![Rule::new("Root", r("Bad"))]);

    let err = compile_err(vec![main, lib]);
    let ErrorKind::TemplateExpansion { template, .. } = &err.kind else {
        panic!("expected TemplateExpansion, got {:?}", err.kind);
    };
    assert_eq!(template, "Lib.Bad");
    assert!(err.to_string().contains("expands into itself"), "got: {err}");
}

#[test]
fn guarded_template_recursion_reuses_its_own_expansion() {
    // List <- Item ("," List / "") : the recursive reference sits inside a
    // choice alternative, so it resolves to the expansion in progress.
    let lib = Block::new("Lib").with_rules(vec![Rule::new(
        "List",
        seq([
            r("Item"),
            choice([seq([lit(","), r("List")]), lit("")]),
        ]),
    )
    .templated()]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Item", class("[a-z]")),
            Rule::new("Root", r("List")),
        ]);
    let unit = GrammarUnit::new(vec![main, lib]).with_start("Main", "Root");
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    assert!(grammar.parse("a,b,c").unwrap().is_match());
    assert!(!grammar.parse("a,,b").unwrap().is_match());
    assert_eq!(grammar.stats().template_expansions, 1);
}

// ---
// Generics
// ---

#[test]
fn equal_argument_lists_share_one_instance() {
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("First", call("Pair", [r("Letter")])),
            Rule::new("Second", call("Pair", [r("Letter")])),
        ]);
    let grammar = compile(vec![main, pair_generic_lib()]);

    let stats = grammar.stats();
    assert_eq!(stats.instantiations, 1);
    assert_eq!(stats.instantiation_cache_hits, 1);
    assert_eq!(minted_from(&grammar, "Lib.Pair").len(), 1);

    // Both call sites point at the same minted rule.
    let target_of = |rule: &str| {
        let body = &grammar.graph().rule(rule).unwrap().body;
        let Expr::Reference { target, .. } = body else {
            panic!("expected a reference body in {rule}");
        };
        target.clone().unwrap()
    };
    assert_eq!(target_of("Main.First"), target_of("Main.Second"));

    assert!(grammar.matches("Main.First", "a,b").unwrap().is_match());
}

#[test]
fn distinct_argument_lists_mint_distinct_instances() {
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Digit", class("[0-9]")),
            Rule::new("Letters", call("Pair", [r("Letter")])),
            Rule::new("Digits", call("Pair", [r("Digit")])),
        ]);
    let grammar = compile(vec![main, pair_generic_lib()]);

    let stats = grammar.stats();
    assert_eq!(stats.instantiations, 2);
    assert_eq!(stats.instantiation_cache_hits, 0);
    assert!(grammar.matches("Main.Letters", "x,y").unwrap().is_match());
    assert!(grammar.matches("Main.Digits", "1,2").unwrap().is_match());
    assert!(!grammar.matches("Main.Digits", "x,y").unwrap().is_match());
}

#[test]
fn instance_caching_ignores_source_positions() {
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("First", call("Pair", [at(r("Letter"), Span::new(10, 16))])),
            Rule::new("Second", call("Pair", [at(r("Letter"), Span::new(40, 46))])),
        ]);
    let grammar = compile(vec![main, pair_generic_lib()]);

    assert_eq!(grammar.stats().instantiations, 1);
    assert_eq!(grammar.stats().instantiation_cache_hits, 1);
}

#[test]
fn argument_count_must_match_the_parameter_list() {
    let too_many = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Root", call("Pair", [r("Letter"), r("Letter")])),
        ]);
    let err = compile_err(vec![too_many, pair_generic_lib()]);
    let ErrorKind::ArityMismatch { rule, expected, actual } = &err.kind else {
        panic!("expected ArityMismatch, got {:?}", err.kind);
    };
    assert_eq!(rule, "Lib.Pair");
    assert_eq!((*expected, *actual), (1, 2));

    let too_few = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![Rule::new("Root", r("Pair"))]);
    let err = compile_err(vec![too_few, pair_generic_lib()]);
    assert!(matches!(
        err.kind,
        ErrorKind::ArityMismatch { expected: 1, actual: 0, .. }
    ));
}

#[test]
fn mutually_recursive_instantiation_is_rejected() {
    let lib = Block::new("Lib").with_rules(vec![
        Rule::new("GenA", call("GenB", [param("T")])).with_params(["T"]),
        Rule::new("GenB", call("GenA", [param("T")])).with_params(["T"]),
    ]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Root", call("GenA", [r("Letter")])),
        ]);

    let err = compile_err(vec![main, lib]);
    let ErrorKind::InstantiationCycle { chain } = &err.kind else {
        panic!("expected InstantiationCycle, got {:?}", err.kind);
    };
    assert!(chain.contains("Lib.GenA"), "chain: {chain}");
    assert!(chain.contains("Lib.GenB"), "chain: {chain}");
}

#[test]
fn guarded_generic_recursion_reuses_its_own_instance() {
    // Tree<T> <- T ("(" Tree<T> ")")? : self-instantiation under a
    // repetition is ordinary recursion, not a cycle.
    let lib = Block::new("Lib").with_rules(vec![Rule::new(
        "Tree",
        seq([
            param("T"),
            opt(seq([lit("("), call("Tree", [param("T")]), lit(")")])),
        ]),
    )
    .with_params(["T"])]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Root", call("Tree", [r("Letter")])),
        ]);
    let unit = GrammarUnit::new(vec![main, lib]).with_start("Main", "Root");
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    assert!(grammar.parse("a(b(c))").unwrap().is_match());
    assert!(!grammar.parse("a(b(c)").unwrap().is_match());
    assert_eq!(grammar.stats().instantiations, 1);
}

#[test]
fn nested_generic_arguments_close_depth_first() {
    let lib = Block::new("Lib").with_rules(vec![
        Rule::new("Outer", seq([lit("["), param("T"), lit("]")])).with_params(["T"]),
        Rule::new("Inner", seq([lit("{"), param("T"), lit("}")])).with_params(["T"]),
    ]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Root", call("Outer", [call("Inner", [r("Letter")])])),
        ]);
    let unit = GrammarUnit::new(vec![main, lib]).with_start("Main", "Root");
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    assert!(grammar.parse("[{a}]").unwrap().is_match());
    assert_eq!(grammar.stats().instantiations, 2);
    assert_eq!(minted_from(&grammar, "Lib.Inner").len(), 1);

    // The outer instance is named after the already-minted inner instance.
    let outer = minted_from(&grammar, "Lib.Outer");
    assert_eq!(outer.len(), 1);
    assert!(outer[0].contains("Lib.Inner<"), "outer instance: {}", outer[0]);
}

#[test]
fn divergent_instantiation_hits_the_depth_rail() {
    // Grow<T> <- "(" Grow<T "x"> ")" : every level instantiates with a new,
    // larger argument, so the cycle check never fires.
    let lib = Block::new("Lib").with_rules(vec![Rule::new(
        "Grow",
        seq([
            lit("("),
            call("Grow", [seq([param("T"), lit("x")])]),
            lit(")"),
        ]),
    )
    .with_params(["T"])]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Letter", class("[a-z]")),
            Rule::new("Root", call("Grow", [r("Letter")])),
        ]);

    let err = compile_err(vec![main, lib]);
    let ErrorKind::ExpansionOverflow { rule, limit } = &err.kind else {
        panic!("expected ExpansionOverflow, got {:?}", err.kind);
    };
    assert_eq!(rule, "Lib.Grow");
    assert_eq!(*limit, MAX_EXPANSION_DEPTH);
}
