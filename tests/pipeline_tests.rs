//! Whole-pipeline behavior: compile, parse, compose templates with
//! generics, and surface diagnostics from every phase.

use braid::grammar::builder::*;
use braid::grammar::{Block, GrammarUnit, Rule};
use braid::runtime::{ActionError, ActionInvocation, ActionRuntime};
use braid::{
    errors::render_report, ErrorCategory, ErrorKind, GrammarPipeline, MatchOutcome, RuleOrigin,
    SourceContext,
};

// ---
// Test Setup
// ---

fn args_grammar() -> GrammarUnit {
    // Lib.ContentInParens<Content> <- "(" Content ")"
    // Main.Args <- ContentInParens<ArgElem ("," ArgElem)*>
    let lib = Block::new("Lib").with_rules(vec![Rule::new(
        "ContentInParens",
        seq([lit("("), param("Content"), lit(")")]),
    )
    .with_params(["Content"])]);
    let main = Block::new("Main")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("ArgElem", class("[a-z]")),
            Rule::new(
                "Args",
                call(
                    "ContentInParens",
                    [seq([r("ArgElem"), star(seq([lit(","), r("ArgElem")]))])],
                ),
            ),
        ]);
    GrammarUnit::new(vec![main, lib]).with_start("Main", "Args")
}

struct FailingRuntime;

impl ActionRuntime for FailingRuntime {
    fn invoke(&mut self, call: &ActionInvocation) -> Result<(), ActionError> {
        Err(ActionError::Failed {
            action: call.action.clone(),
            reason: "runtime refused".into(),
        })
    }
}

// ---
// End to end
// ---

#[test]
fn an_argument_list_passed_through_a_generic_parses() {
    let grammar = GrammarPipeline::new().compile(&args_grammar()).unwrap();

    assert!(grammar.parse("(x,y,z)").unwrap().is_match());
    assert!(grammar.parse("(x)").unwrap().is_match());
    assert!(!grammar.parse("(x,y").unwrap().is_match());
    assert!(!grammar.parse("x,y,z").unwrap().is_match());

    // One call site, one instance; the whole argument expression travels
    // as a single generic argument.
    let stats = grammar.stats();
    assert_eq!(stats.instantiations, 1);
    assert_eq!(stats.instantiation_cache_hits, 0);
    assert_eq!(stats.template_expansions, 0);

    let instances: Vec<_> = grammar
        .graph()
        .iter()
        .filter(|(_, rule)| {
            matches!(&rule.origin, RuleOrigin::Instance { base } if base.as_str() == "Lib.ContentInParens")
        })
        .collect();
    assert_eq!(instances.len(), 1);
}

#[test]
fn template_bodies_can_call_generics() {
    // Csv late-binds Item per caller, then hands it to the Pair generic.
    let lib = Block::new("Lib").with_rules(vec![
        Rule::new("Pair", seq([param("T"), lit(","), param("T")])).with_params(["T"]),
        Rule::new("Csv", call("Pair", [r("Item")])).templated(),
    ]);
    let a = Block::new("A")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Item", class("[a-z]")),
            Rule::new("Root", r("Csv")),
        ]);
    let b = Block::new("B")
        .with_imports(vec![use_block("Lib")])
        .with_rules(vec![
            Rule::new("Item", class("[0-9]")),
            Rule::new("Root", r("Csv")),
        ]);
    let unit = GrammarUnit::new(vec![a, b, lib]);
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    assert!(grammar.matches("A.Root", "a,b").unwrap().is_match());
    assert!(grammar.matches("B.Root", "1,2").unwrap().is_match());
    assert!(!grammar.matches("B.Root", "a,b").unwrap().is_match());

    let stats = grammar.stats();
    assert_eq!(stats.template_expansions, 2);
    assert_eq!(stats.instantiations, 2);
}

// ---
// Parse entry points
// ---

#[test]
fn a_parse_must_consume_the_entire_input() {
    let unit = GrammarUnit::new(vec![
        Block::new("Main").with_rules(vec![Rule::new("Root", lit("ab"))])
    ])
    .with_start("Main", "Root");
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    // A prefix match is still a match for `matches`, but not a parse.
    let outcome = grammar.matches("Main.Root", "abc").unwrap();
    assert!(outcome.is_match());
    let outcome = grammar.parse("abc").unwrap();
    assert_eq!(outcome, MatchOutcome::NoMatch { furthest: 2 });
}

#[test]
fn parsing_without_a_start_rule_is_an_error() {
    let unit = GrammarUnit::new(vec![
        Block::new("Main").with_rules(vec![Rule::new("Root", lit("x"))])
    ]);
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    let err = grammar.parse("x").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::MissingStartRule { start: None }));
}

#[test]
fn a_declared_start_rule_must_survive_compilation() {
    let unit = GrammarUnit::new(vec![
        Block::new("Main").with_rules(vec![Rule::new("Root", lit("x"))])
    ])
    .with_start("Main", "Nope");

    let err = GrammarPipeline::new().compile(&unit).unwrap_err();
    let ErrorKind::MissingStartRule { start } = &err.kind else {
        panic!("expected MissingStartRule, got {:?}", err.kind);
    };
    assert_eq!(start.as_deref(), Some("Main.Nope"));
}

// ---
// Compile-time validation
// ---

#[test]
fn unguarded_self_reference_is_rejected_at_compile_time() {
    let unit = GrammarUnit::new(vec![Block::new("Main").with_rules(vec![Rule::new(
        "R",
        seq([r("R"), lit("x")]),
    )])]);

    let err = GrammarPipeline::new().compile(&unit).unwrap_err();
    let ErrorKind::RecursiveRule { rule } = &err.kind else {
        panic!("expected RecursiveRule, got {:?}", err.kind);
    };
    assert_eq!(rule, "Main.R");
}

#[test]
fn malformed_character_classes_are_rejected_at_compile_time() {
    let unit = GrammarUnit::new(vec![
        Block::new("Main").with_rules(vec![Rule::new("Root", class("[z-a]"))])
    ]);

    let err = GrammarPipeline::new().compile(&unit).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidCharClass { .. }));
    assert_eq!(err.kind.category(), ErrorCategory::Validate);
}

// ---
// Compiled artifacts
// ---

#[test]
fn the_rule_graph_serializes_to_json() {
    let grammar = GrammarPipeline::new().compile(&args_grammar()).unwrap();

    let json = grammar.graph_json().unwrap();
    assert!(json.contains("Main.Args"), "graph json misses rules");
    assert!(json.contains("Plain"), "graph json misses origins");
    assert!(json.contains("Instance"), "graph json misses instances");
}

#[test]
fn symbol_tables_survive_compilation() {
    let grammar = GrammarPipeline::new().compile(&args_grammar()).unwrap();

    let table = grammar.symbol_table("Main").unwrap();
    assert!(table.is_exported("Args"));
    let names: Vec<&str> = table.exported_names().collect();
    assert_eq!(names, vec!["ArgElem", "Args"]);
    assert!(grammar.symbol_table("Nope").is_none());
}

// ---
// Diagnostics
// ---

#[test]
fn action_failures_carry_the_action_name() {
    let unit = GrammarUnit::new(vec![Block::new("Main")
        .with_rules(vec![Rule::new("Root", lit("x")).with_action("emit_node")])])
    .with_start("Main", "Root");
    let grammar = GrammarPipeline::new().compile(&unit).unwrap();

    let err = grammar
        .parse_with("x", &mut FailingRuntime)
        .unwrap_err();
    let ErrorKind::ActionFailed { action, reason } = &err.kind else {
        panic!("expected ActionFailed, got {:?}", err.kind);
    };
    assert_eq!(action, "emit_node");
    assert_eq!(reason, "runtime refused");
    assert_eq!(err.kind.category(), ErrorCategory::Match);
}

#[test]
fn reports_render_with_the_failure_detail() {
    let unit = GrammarUnit::new(vec![
        Block::new("A")
            .with_imports(vec![use_block("B")])
            .with_rules(vec![Rule::new("R", lit("a"))]),
        Block::new("B")
            .with_imports(vec![use_block("A")])
            .with_rules(vec![Rule::new("S", lit("b"))]),
    ])
    .with_source(SourceContext::new("cycle.peg", "use B\nuse A\n"));

    let err = GrammarPipeline::new().compile(&unit).unwrap_err();
    let rendered = render_report(err);
    assert!(rendered.contains("cyclic import"), "rendered: {rendered}");
}
