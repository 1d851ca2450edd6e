//! Join network scenario tests: positive joins, negated CEs, logical
//! support, group CEs, and the retract/activation ordering guarantees.

use trawl_core::types::*;
use trawl_core::TrawlEngine;
use trawl_types::Value;

fn fact_pattern(template: &str, var: &str) -> PatternCondition {
    PatternCondition::fact(template).with_slot("v", SlotTest::Bind(var.into()))
}

fn rule(id: RuleId, name: &str, conditions: Vec<ConditionElement>) -> Rule {
    Rule { id, name: name.into(), salience: 0, conditions, actions: vec![] }
}

#[test]
fn test_s1_simple_positive_join() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            1,
            "R1",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Pattern(fact_pattern("B", "x")),
            ],
        ))
        .unwrap();

    let a7 = engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(8))]).unwrap();

    // one activation, bound to x = 7
    assert_eq!(engine.agenda_len(), 1);
    let bindings = engine.activation_entities(1);
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0][0], Some(a7));

    engine.retract(a7).unwrap();
    assert_eq!(engine.agenda_len(), 0);
}

#[test]
fn test_s2_negated_ce_tracks_blocker() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            2,
            "R2",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Not(fact_pattern("C", "x")),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(3))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "negation satisfied while no C exists");

    let c3 = engine.assert_fact("C", vec![("v", Value::Integer(3))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "blocker suppresses the activation");

    engine.retract(c3).unwrap();
    assert_eq!(engine.agenda_len(), 1, "unblocking re-propagates");
}

#[test]
fn test_negated_ce_ignores_non_matching_blockers() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            2,
            "R2",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Not(fact_pattern("C", "x")),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(3))]).unwrap();
    engine.assert_fact("C", vec![("v", Value::Integer(4))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "a C with a different binding does not block");
}

#[test]
fn test_negated_replacement_blocker_survives_retract() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            2,
            "R2",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Not(fact_pattern("C", "x")),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(3))]).unwrap();
    let c_first = engine.assert_fact("C", vec![("v", Value::Integer(3))]).unwrap();
    engine.assert_fact("C", vec![("v", Value::Integer(3))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    // the second C takes over as blocker
    engine.retract(c_first).unwrap();
    assert_eq!(engine.agenda_len(), 0, "another blocker remains");
}

#[test]
fn test_leading_negated_ce() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            3,
            "R3",
            vec![
                ConditionElement::Not(PatternCondition::fact("C")),
                ConditionElement::Pattern(fact_pattern("A", "x")),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let c = engine.assert_fact("C", vec![]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.retract(c).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn test_exists_fact_ce_collapses_to_one_activation() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            4,
            "R4",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Exists(PatternCondition::fact("B")),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    let b1 = engine.assert_fact("B", vec![]).unwrap();
    engine.assert_fact("B", vec![]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "exists admits at most one match per left side");

    engine.retract(b1).unwrap();
    assert_eq!(engine.agenda_len(), 1, "another B still satisfies exists");
}

#[test]
fn test_s5_logical_support_forces_retraction() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(Rule {
            id: 5,
            name: "R5".into(),
            salience: 0,
            conditions: vec![ConditionElement::Logical(vec![ConditionElement::Pattern(
                fact_pattern("A", "x"),
            )])],
            actions: vec![RuleAction::Assert {
                template: "D".into(),
                slots: vec![("v".into(), RuleExpr::var("x"))],
            }],
        })
        .unwrap();
    // observer rule so we can see D in the agenda
    engine
        .add_rule(rule(6, "obs", vec![ConditionElement::Pattern(fact_pattern("D", "y"))]))
        .unwrap();

    let a9 = engine.assert_fact("A", vec![("v", Value::Integer(9))]).unwrap();
    assert_eq!(engine.run(Some(1)), 1, "R5 fires and asserts D 9");
    assert_eq!(engine.agenda_len(), 1, "observer sees D 9");

    engine.retract(a9).unwrap();
    assert_eq!(
        engine.agenda_len(),
        0,
        "withdrawing support retracts D 9 before anything else fires"
    );
    assert_eq!(engine.stats().fact_count, 0);
}

#[test]
fn test_not_all_group_joins_from_the_right() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            7,
            "R7",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::NotAll(vec![
                    PatternCondition::fact("B").with_slot("v", SlotTest::Bind("b".into())),
                    PatternCondition::fact("C").with_slot("v", SlotTest::Bind("b".into())),
                ]),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "no B/C pair exists");

    engine.assert_fact("B", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "B alone is not a pair");

    let c5 = engine.assert_fact("C", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "a matching pair blocks the rule");

    engine.retract(c5).unwrap();
    assert_eq!(engine.agenda_len(), 1, "pair broken, rule satisfied again");
}

#[test]
fn test_exists_all_group() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            8,
            "R8",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::ExistsAll(vec![
                    PatternCondition::fact("B").with_slot("v", SlotTest::Bind("b".into())),
                    PatternCondition::fact("C").with_slot("v", SlotTest::Bind("b".into())),
                ]),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.assert_fact("C", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
    engine.assert_fact("B", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "a second pair adds no activation");
}

#[test]
fn test_test_ce_filters_bindings() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            9,
            "R9",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Test(RuleExpr::cmp(
                    CompareOp::Gt,
                    RuleExpr::var("x"),
                    RuleExpr::Const(Value::Integer(10)),
                )),
            ],
        ))
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);
    engine.assert_fact("A", vec![("v", Value::Integer(15))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn test_rhs_retract_action() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(Rule {
            id: 10,
            name: "consume".into(),
            salience: 0,
            conditions: vec![ConditionElement::Pattern(fact_pattern("A", "x"))],
            actions: vec![RuleAction::Retract { pattern: 0 }],
        })
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("A", vec![("v", Value::Integer(2))]).unwrap();
    assert_eq!(engine.run(None), 2);
    assert_eq!(engine.stats().fact_count, 0);
}

#[test]
fn test_salience_orders_firing() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(Rule {
            id: 11,
            name: "low".into(),
            salience: 0,
            conditions: vec![ConditionElement::Pattern(fact_pattern("A", "x"))],
            actions: vec![RuleAction::Assert {
                template: "Order".into(),
                slots: vec![("v".into(), RuleExpr::Const(Value::Integer(2)))],
            }],
        })
        .unwrap();
    engine
        .add_rule(Rule {
            id: 12,
            name: "high".into(),
            salience: 100,
            conditions: vec![ConditionElement::Pattern(fact_pattern("A", "x"))],
            actions: vec![RuleAction::Assert {
                template: "Order".into(),
                slots: vec![("v".into(), RuleExpr::Const(Value::Integer(1)))],
            }],
        })
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(0))]).unwrap();
    assert_eq!(engine.run(Some(1)), 1);
    // the high-salience rule fired first
    let order_id = engine.rule_id_by_name("high").unwrap();
    assert!(order_id > 0);
    assert_eq!(engine.stats().fires, 1);
    let facts = engine.stats().fact_count;
    assert_eq!(facts, 2, "A plus the Order fact from the high rule");
}

#[test]
fn test_shared_prefix_and_rule_removal() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(
            13,
            "pair",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Pattern(fact_pattern("B", "x")),
            ],
        ))
        .unwrap();
    let joins_before = engine.stats().join_count;
    engine
        .add_rule(rule(
            14,
            "triple",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Pattern(fact_pattern("B", "x")),
                ConditionElement::Pattern(fact_pattern("C", "x")),
            ],
        ))
        .unwrap();
    // the A and B joins are shared; only the C join and a terminal are new
    assert_eq!(engine.stats().join_count, joins_before + 2);

    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("C", vec![("v", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 2);

    engine.remove_rule(14).unwrap();
    assert_eq!(engine.agenda_len(), 1, "only the pair rule remains");
    assert_eq!(engine.stats().join_count, joins_before);

    // the shared prefix still works
    engine.assert_fact("B", vec![("v", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 2);
}

#[test]
fn test_rule_added_after_facts_sees_existing_matches() {
    let mut engine = TrawlEngine::new();
    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("B", vec![("v", Value::Integer(2))]).unwrap();

    engine
        .add_rule(rule(
            15,
            "late",
            vec![
                ConditionElement::Pattern(fact_pattern("A", "x")),
                ConditionElement::Pattern(fact_pattern("B", "x")),
            ],
        ))
        .unwrap();
    assert_eq!(engine.agenda_len(), 1, "incremental equals batch");

    // and a late negated rule sees the current blockers
    engine
        .add_rule(rule(
            16,
            "late-not",
            vec![
                ConditionElement::Pattern(fact_pattern("B", "x")),
                ConditionElement::Not(fact_pattern("A", "x")),
            ],
        ))
        .unwrap();
    // B 1 is blocked by A 1; B 2 is free
    assert_eq!(engine.agenda_len(), 2);
}

#[test]
fn test_timetags_are_monotonic_outside_delay() {
    let mut engine = TrawlEngine::new();
    engine
        .add_rule(rule(17, "single", vec![ConditionElement::Pattern(fact_pattern("A", "x"))]))
        .unwrap();
    engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    engine.assert_fact("A", vec![("v", Value::Integer(2))]).unwrap();
    let snapshot = engine.agenda_snapshot();
    assert_eq!(snapshot.len(), 2);
    // depth strategy: the newer activation fires first
    assert!(snapshot[0].1 > snapshot[1].1);
}
