//! Object pattern matching: slot-change filtering, the deferred
//! match-action queue, delay batching, and multifield markers.

use trawl_core::types::*;
use trawl_core::TrawlEngine;
use trawl_types::Value;

fn positive_k_rule(id: RuleId) -> Rule {
    Rule {
        id,
        name: format!("R{id}"),
        salience: 0,
        conditions: vec![ConditionElement::Exists(
            PatternCondition::object("Foo")
                .with_slot("k", SlotTest::Bind("v".into()))
                .with_slot(
                    "k",
                    SlotTest::Predicate(RuleExpr::cmp(
                        CompareOp::Gt,
                        RuleExpr::SelfValue,
                        RuleExpr::Const(Value::Integer(0)),
                    )),
                ),
        )],
        actions: vec![],
    }
}

#[test]
fn test_s3_exists_with_modify() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();

    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(-1))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "negative k does not satisfy the pattern");

    engine.modify_instance(foo, vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "modify to a positive k activates");

    engine.modify_instance(foo, vec![("k", Value::Integer(-1))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "modify back removes the activation");
}

#[test]
fn test_modify_untouched_slot_is_filtered() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k", "j"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();

    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
    let compares_before: u64 =
        engine.join_activity().iter().map(|a| a.compares + a.adds + a.deletes).sum();

    // j is not in the pattern's slot bitmap; the matcher must not touch
    // the pattern
    engine.modify_instance(foo, vec![("j", Value::Integer(9))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "activation undisturbed");
    let compares_after: u64 =
        engine.join_activity().iter().map(|a| a.compares + a.adds + a.deletes).sum();
    assert_eq!(compares_before, compares_after, "no network traffic for a filtered modify");
}

#[test]
fn test_s4_delay_batching_shares_one_timetag() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();
    engine
        .add_rule(Rule {
            id: 4,
            name: "RA".into(),
            salience: 0,
            conditions: vec![ConditionElement::Pattern(
                PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
            )],
            actions: vec![],
        })
        .unwrap();

    let a1 = engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(-1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    let was = engine.set_delay_object_pattern_matching(true);
    assert!(!was);
    engine.retract(a1).unwrap();
    engine.modify_instance(foo, vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "object modify still queued");
    engine.assert_fact("A", vec![("v", Value::Integer(2))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "fact edits are not delayed");

    engine.set_delay_object_pattern_matching(false);
    assert_eq!(engine.agenda_len(), 2, "queue drained on window close");

    let tags: Vec<u64> = engine.agenda_snapshot().iter().map(|(_, tag)| *tag).collect();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0], tags[1], "all edits in the window share the opening timetag");
}

#[test]
fn test_queue_annihilation_is_semantically_silent() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();

    engine.set_delay_object_pattern_matching(true);
    let foo = engine.make_instance("ghost", "Foo", vec![("k", Value::Integer(5))]).unwrap();
    engine.unmake_instance(foo).unwrap();
    engine.set_delay_object_pattern_matching(false);

    // the object came and went before the network saw it
    assert_eq!(engine.agenda_len(), 0);
    assert_eq!(engine.stats().instance_count, 0);
    assert_eq!(engine.stats().partial_match_count, 0);
}

#[test]
fn test_queue_modify_merge_equals_direct_processing() {
    let mut delayed = TrawlEngine::new();
    let mut direct = TrawlEngine::new();
    for engine in [&mut delayed, &mut direct] {
        engine.define_class("Foo", &["k", "j"]).unwrap();
        engine.add_rule(positive_k_rule(3)).unwrap();
    }

    let foo_delayed =
        delayed.make_instance("foo1", "Foo", vec![("k", Value::Integer(-1))]).unwrap();
    let foo_direct =
        direct.make_instance("foo1", "Foo", vec![("k", Value::Integer(-1))]).unwrap();

    delayed.set_delay_object_pattern_matching(true);
    delayed.modify_instance(foo_delayed, vec![("k", Value::Integer(5))]).unwrap();
    delayed.modify_instance(foo_delayed, vec![("j", Value::Integer(1))]).unwrap();
    delayed.set_delay_object_pattern_matching(false);

    direct.modify_instance(foo_direct, vec![("k", Value::Integer(5))]).unwrap();
    direct.modify_instance(foo_direct, vec![("j", Value::Integer(1))]).unwrap();

    assert_eq!(delayed.agenda_len(), direct.agenda_len());
    assert_eq!(delayed.agenda_len(), 1);
}

#[test]
fn test_queue_modify_then_retract_processes_retract_only() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();

    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine.set_delay_object_pattern_matching(true);
    engine.modify_instance(foo, vec![("k", Value::Integer(7))]).unwrap();
    engine.unmake_instance(foo).unwrap();
    engine.set_delay_object_pattern_matching(false);

    assert_eq!(engine.agenda_len(), 0);
    assert_eq!(engine.stats().instance_count, 0);
}

#[test]
fn test_instance_join_with_fact() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine
        .add_rule(Rule {
            id: 5,
            name: "mix".into(),
            salience: 0,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Pattern(
                    PatternCondition::object("Foo").with_slot("k", SlotTest::Bind("x".into())),
                ),
            ],
            actions: vec![],
        })
        .unwrap();

    engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
    assert_eq!(engine.agenda_len(), 0);
    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(7))]).unwrap();
    assert_eq!(engine.agenda_len(), 1, "fact and instance join on the shared binding");

    engine.modify_instance(foo, vec![("k", Value::Integer(8))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "modify away from the binding retracts the match");
}

#[test]
fn test_multifield_segment_markers() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Bag", &["items"]).unwrap();
    engine
        .add_rule(Rule {
            id: 6,
            name: "find-x".into(),
            salience: 0,
            conditions: vec![ConditionElement::Pattern(
                PatternCondition::object("Bag")
                    .with_slot("items", SlotTest::BindSegment("pre".into()))
                    .with_slot("items", SlotTest::Eq(Value::Symbol("x".into())))
                    .with_slot("items", SlotTest::BindSegment("post".into())),
            )],
            actions: vec![],
        })
        .unwrap();

    engine
        .make_instance(
            "bag1",
            "Bag",
            vec![(
                "items",
                Value::Multifield(vec![
                    Value::Symbol("a".into()),
                    Value::Symbol("x".into()),
                    Value::Symbol("b".into()),
                ]),
            )],
        )
        .unwrap();
    assert_eq!(engine.agenda_len(), 1, "exactly one admissible split");

    engine
        .make_instance(
            "bag2",
            "Bag",
            vec![("items", Value::Multifield(vec![Value::Symbol("a".into())]))],
        )
        .unwrap();
    assert_eq!(engine.agenda_len(), 1, "a bag without x adds nothing");
}

#[test]
fn test_multifield_segment_join_on_length() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Bag", &["items"]).unwrap();
    engine
        .add_rule(Rule {
            id: 7,
            name: "short-prefix".into(),
            salience: 0,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::object("Bag")
                        .with_slot("items", SlotTest::BindSegment("pre".into()))
                        .with_slot("items", SlotTest::Eq(Value::Symbol("x".into())))
                        .with_slot("items", SlotTest::BindSegment("post".into())),
                ),
                ConditionElement::Test(RuleExpr::cmp(
                    CompareOp::Eq,
                    RuleExpr::Call {
                        function: "length$".into(),
                        args: vec![RuleExpr::var("pre")],
                    },
                    RuleExpr::Const(Value::Integer(0)),
                )),
            ],
            actions: vec![],
        })
        .unwrap();

    engine
        .make_instance(
            "bag1",
            "Bag",
            vec![(
                "items",
                Value::Multifield(vec![Value::Symbol("x".into()), Value::Symbol("b".into())]),
            )],
        )
        .unwrap();
    assert_eq!(engine.agenda_len(), 1, "x leads, so the prefix is empty");

    engine
        .make_instance(
            "bag2",
            "Bag",
            vec![(
                "items",
                Value::Multifield(vec![Value::Symbol("a".into()), Value::Symbol("x".into())]),
            )],
        )
        .unwrap();
    assert_eq!(engine.agenda_len(), 1, "bag2's prefix has length 1 and fails the test");
}

#[test]
fn test_class_filtering() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine.define_class("Bar", &["k"]).unwrap();
    engine.add_rule(positive_k_rule(3)).unwrap();

    engine.make_instance("bar1", "Bar", vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 0, "a Bar never reaches a Foo pattern");
    engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(5))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
}

#[test]
fn test_instance_retract_cascades() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine
        .add_rule(Rule {
            id: 8,
            name: "plain".into(),
            salience: 0,
            conditions: vec![ConditionElement::Pattern(
                PatternCondition::object("Foo").with_slot("k", SlotTest::Bind("v".into())),
            )],
            actions: vec![],
        })
        .unwrap();

    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(1))]).unwrap();
    assert_eq!(engine.agenda_len(), 1);
    engine.unmake_instance(foo).unwrap();
    assert_eq!(engine.agenda_len(), 0);
    assert_eq!(engine.stats().partial_match_count, 0);
    assert_eq!(engine.stats().instance_count, 0);
}
