//! Binary image round-trip and rejection tests.

use std::fs;

use trawl_core::binary_image::{bload, bsave};
use trawl_core::types::*;
use trawl_core::TrawlEngine;
use trawl_types::Value;

fn sample_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: 1,
            name: "pair".into(),
            salience: 5,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Not(
                    PatternCondition::fact("C").with_slot("v", SlotTest::Bind("x".into())),
                ),
            ],
            actions: vec![RuleAction::Assert {
                template: "D".into(),
                slots: vec![("v".into(), RuleExpr::var("x"))],
            }],
        },
        Rule {
            id: 2,
            name: "positive-k".into(),
            salience: 0,
            conditions: vec![ConditionElement::Exists(
                PatternCondition::object("Foo").with_slot(
                    "k",
                    SlotTest::Predicate(RuleExpr::cmp(
                        CompareOp::Gt,
                        RuleExpr::SelfValue,
                        RuleExpr::Const(Value::Integer(0)),
                    )),
                ),
            )],
            actions: vec![],
        },
    ]
}

fn build_engine() -> TrawlEngine {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    for rule in sample_rules() {
        engine.add_rule(rule).unwrap();
    }
    engine
}

fn drive_edits(engine: &mut TrawlEngine) -> Vec<(String, u64)> {
    engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
    engine.assert_fact("A", vec![("v", Value::Integer(8))]).unwrap();
    engine.assert_fact("C", vec![("v", Value::Integer(8))]).unwrap();
    engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(3))]).unwrap();
    engine.agenda_snapshot()
}

#[test]
fn test_s6_round_trip_preserves_activation_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.img");

    let mut original = build_engine();
    bsave(&mut original, &path).unwrap();
    let baseline = drive_edits(&mut original);

    let mut restored = TrawlEngine::new();
    bload(&mut restored, &path).unwrap();
    assert_eq!(restored.stats().rule_count, 2);
    assert_eq!(restored.stats().fact_count, 0, "working memory is not part of the image");
    let replayed = drive_edits(&mut restored);

    assert_eq!(baseline, replayed, "same edits, same activations, same order");
}

#[test]
fn test_bload_rejects_bad_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.img");
    fs::write(&path, b"not an image at all").unwrap();

    let mut engine = TrawlEngine::new();
    let err = bload(&mut engine, &path).unwrap_err();
    assert!(err.to_string().contains("prefix"), "unexpected error: {err}");
    assert_eq!(engine.stats().rule_count, 0);
}

#[test]
fn test_bload_rejects_tampered_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.img");
    let mut engine = build_engine();
    bsave(&mut engine, &path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    // the version string sits just after the 9-byte prefix and 4-byte
    // length
    bytes[14] ^= 0x20;
    fs::write(&path, &bytes).unwrap();

    let mut fresh = TrawlEngine::new();
    let err = bload(&mut fresh, &path).unwrap_err();
    assert!(err.to_string().contains("version"), "unexpected error: {err}");
    assert_eq!(fresh.stats().rule_count, 0, "engine left in its pre-load state");
}

#[test]
fn test_bload_rejects_truncated_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.img");
    let mut engine = build_engine();
    bsave(&mut engine, &path).unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let mut fresh = TrawlEngine::new();
    assert!(bload(&mut fresh, &path).is_err());
    assert_eq!(fresh.stats().rule_count, 0);
}

#[test]
fn test_bload_refuses_when_constructs_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.img");
    let mut engine = build_engine();
    bsave(&mut engine, &path).unwrap();

    // the same engine still holds its rules
    let err = bload(&mut engine, &path).unwrap_err();
    assert!(err.to_string().contains("still in use"), "unexpected error: {err}");
}

#[test]
fn test_bsave_refused_while_image_active() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.img");
    let mut engine = build_engine();
    bsave(&mut engine, &path).unwrap();

    let mut restored = TrawlEngine::new();
    bload(&mut restored, &path).unwrap();
    let second = dir.path().join("again.img");
    let err = bsave(&mut restored, &second).unwrap_err();
    assert!(err.to_string().contains("image"), "unexpected error: {err}");
}

#[test]
fn test_image_bytes_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.img");
    let path_b = dir.path().join("b.img");
    let mut first = build_engine();
    let mut second = build_engine();
    bsave(&mut first, &path_a).unwrap();
    bsave(&mut second, &path_b).unwrap();
    assert_eq!(fs::read(&path_a).unwrap(), fs::read(&path_b).unwrap());
}
