//! Structural invariants of the match memories, checked directly and
//! under randomized edit scripts.

use proptest::prelude::*;
use trawl_core::beta_memory::{BetaMemory, INITIAL_BETA_HASH_SIZE};
use trawl_core::object_network::{ObjAction, ObjectNetwork};
use trawl_core::partial_match::MatchArena;
use trawl_core::types::*;
use trawl_core::TrawlEngine;
use trawl_types::Value;

fn alpha(arena: &mut MatchArena, entity: u32, hash: u64) -> PartialMatchId {
    let (pm, _) = arena.create_alpha(EntityId(entity), Vec::new(), 1);
    arena.partial_match_mut(pm).hash_value = hash;
    pm
}

proptest! {
    /// Resize preserves membership, bucket placement, and the relative
    /// order of matches that land in the same bucket.
    #[test]
    fn prop_resize_preserves_membership_and_order(
        hashes in prop::collection::vec(0u64..10_000, 1..400)
    ) {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(true);
        let mut inserted = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            let pm = alpha(&mut arena, i as u32, *hash);
            memory.insert_back(&mut arena, pm);
            inserted.push(pm);
        }
        let before = memory.iter_matches(&arena);
        memory.resize(&mut arena);

        let after = memory.iter_matches(&arena);
        prop_assert_eq!(before.len(), after.len());
        prop_assert_eq!(memory.size, INITIAL_BETA_HASH_SIZE * 11);
        for pm_id in &after {
            let pm = arena.partial_match(*pm_id);
            prop_assert_eq!(pm.hash_value % memory.size, pm.bucket);
        }
        // per-bucket order follows original insertion order
        for bucket in 0..memory.size {
            let in_bucket: Vec<PartialMatchId> = after
                .iter()
                .copied()
                .filter(|pm| arena.partial_match(*pm).bucket == bucket)
                .collect();
            let expected: Vec<PartialMatchId> = inserted
                .iter()
                .copied()
                .filter(|pm| arena.partial_match(*pm).hash_value % memory.size == bucket)
                .collect();
            prop_assert_eq!(in_bucket, expected);
        }
    }

    /// The queue agrees with a direct model of the merge table: one
    /// pending action per instance, assert/retract annihilation, modify
    /// absorption and bitmap merging, in-place retract conversion, and
    /// fresh retracts entering ahead of pending asserts and modifies.
    #[test]
    fn prop_queue_merge_laws(
        script in prop::collection::vec((0u32..4, 0u8..3, 0u32..8), 0..40)
    ) {
        let mut network = ObjectNetwork::new();
        let mut model: Vec<(u32, ObjAction, Option<roaring::RoaringBitmap>)> = Vec::new();
        for (instance, op, slot) in script {
            let action = match op {
                0 => ObjAction::Assert,
                1 => ObjAction::Retract,
                _ => ObjAction::Modify,
            };
            let bits = if action == ObjAction::Modify {
                let mut b = roaring::RoaringBitmap::new();
                b.insert(slot);
                Some(b)
            } else {
                None
            };
            network.queue_match_action(action, EntityId(instance), bits.clone());

            // reference model of the merge table
            if let Some(pos) = model.iter().position(|(i, _, _)| *i == instance) {
                match (model[pos].1, action) {
                    (ObjAction::Assert, ObjAction::Retract) => {
                        model.remove(pos);
                    }
                    (ObjAction::Assert, _) => {}
                    (ObjAction::Modify, ObjAction::Modify) => {
                        if let (Some(existing), Some(new_bits)) =
                            (model[pos].2.as_mut(), bits)
                        {
                            *existing |= new_bits;
                        }
                    }
                    (ObjAction::Modify, ObjAction::Retract) => {
                        model[pos].1 = ObjAction::Retract;
                        model[pos].2 = None;
                    }
                    _ => {}
                }
            } else if action == ObjAction::Retract {
                let at = model
                    .iter()
                    .rposition(|(_, a, _)| *a == ObjAction::Retract)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                model.insert(at, (instance, action, None));
            } else {
                model.push((instance, action, bits));
            }
        }

        let drained: Vec<(u32, ObjAction, Option<roaring::RoaringBitmap>)> = network
            .drain_queue()
            .into_iter()
            .map(|a| (a.instance.0, a.action, a.slot_ids))
            .collect();
        prop_assert_eq!(drained, model);
    }

    /// Random fact edit scripts keep the network structurally sound and
    /// agree with a batch rebuild on the surviving activations.
    #[test]
    fn prop_incremental_equals_batch(
        script in prop::collection::vec((0u8..2, 0i64..4, 0u8..2), 1..30)
    ) {
        let rules = |engine: &mut TrawlEngine| {
            engine
                .add_rule(Rule {
                    id: 1,
                    name: "pair".into(),
                    salience: 0,
                    conditions: vec![
                        ConditionElement::Pattern(
                            PatternCondition::fact("A")
                                .with_slot("v", SlotTest::Bind("x".into())),
                        ),
                        ConditionElement::Not(
                            PatternCondition::fact("C")
                                .with_slot("v", SlotTest::Bind("x".into())),
                        ),
                    ],
                    actions: vec![],
                })
                .unwrap();
        };

        let mut incremental = TrawlEngine::new();
        rules(&mut incremental);
        // replay the script: (template, value, assert/retract-last)
        let mut live: Vec<(u8, i64, EntityId)> = Vec::new();
        for (template, value, retract) in &script {
            let name = if *template == 0 { "A" } else { "C" };
            if *retract == 1 {
                if let Some(pos) =
                    live.iter().position(|(t, v, _)| t == template && v == value)
                {
                    let (_, _, entity) = live.remove(pos);
                    incremental.retract(entity).unwrap();
                    continue;
                }
            }
            let entity = incremental
                .assert_fact(name, vec![("v", Value::Integer(*value))])
                .unwrap();
            live.push((*template, *value, entity));
        }
        incremental.check_consistency().map_err(|e| {
            TestCaseError::fail(format!("inconsistent network: {e}"))
        })?;

        // batch rebuild from the surviving working memory
        let mut batch = TrawlEngine::new();
        rules(&mut batch);
        for (template, value, _) in &live {
            let name = if *template == 0 { "A" } else { "C" };
            batch.assert_fact(name, vec![("v", Value::Integer(*value))]).unwrap();
        }

        let mut left: Vec<String> =
            incremental.agenda_snapshot().iter().map(|(n, _)| n.clone()).collect();
        let mut right: Vec<String> =
            batch.agenda_snapshot().iter().map(|(n, _)| n.clone()).collect();
        left.sort();
        right.sort();
        prop_assert_eq!(left, right);
    }
}

#[test]
fn test_consistency_after_mixed_scenario() {
    let mut engine = TrawlEngine::new();
    engine.define_class("Foo", &["k"]).unwrap();
    engine
        .add_rule(Rule {
            id: 1,
            name: "mix".into(),
            salience: 0,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Pattern(
                    PatternCondition::object("Foo").with_slot("k", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Not(
                    PatternCondition::fact("C").with_slot("v", SlotTest::Bind("x".into())),
                ),
            ],
            actions: vec![],
        })
        .unwrap();

    let a = engine.assert_fact("A", vec![("v", Value::Integer(1))]).unwrap();
    let foo = engine.make_instance("foo1", "Foo", vec![("k", Value::Integer(1))]).unwrap();
    let c = engine.assert_fact("C", vec![("v", Value::Integer(1))]).unwrap();
    engine.check_consistency().unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.retract(c).unwrap();
    engine.check_consistency().unwrap();
    assert_eq!(engine.agenda_len(), 1);

    engine.modify_instance(foo, vec![("k", Value::Integer(2))]).unwrap();
    engine.check_consistency().unwrap();
    assert_eq!(engine.agenda_len(), 0);

    engine.retract(a).unwrap();
    engine.unmake_instance(foo).unwrap();
    engine.check_consistency().unwrap();
    assert_eq!(engine.stats().partial_match_count, 0);
}

#[test]
fn test_resizing_toggle_is_observable() {
    let mut engine = TrawlEngine::new();
    assert!(engine.get_beta_memory_resizing());
    let old = engine.set_beta_memory_resizing(false);
    assert!(old);
    assert!(!engine.get_beta_memory_resizing());

    // with resizing off, a large join still works, just unresized
    engine
        .add_rule(Rule {
            id: 1,
            name: "pair".into(),
            salience: 0,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Pattern(
                    PatternCondition::fact("B").with_slot("v", SlotTest::Bind("x".into())),
                ),
            ],
            actions: vec![],
        })
        .unwrap();
    for i in 0..(INITIAL_BETA_HASH_SIZE * 11 + 5) as i64 {
        engine.assert_fact("A", vec![("v", Value::Integer(i))]).unwrap();
    }
    engine.check_consistency().unwrap();
}
