//! The agenda boundary.
//!
//! Terminal joins call [`Agenda::add_activation`] when a left-hand side
//! completes and [`Agenda::remove_for_match`] when the completing partial
//! match is retracted. Ordering is salience first, then recency by
//! timetag, then insertion sequence: enough for deterministic firing
//! without growing a strategy surface.

use ahash::AHashMap;
use tracing::{debug, info};

use crate::types::{PartialMatchId, RuleId};

/// One pending rule firing.
#[derive(Debug, Clone)]
pub struct Activation {
    pub rule: RuleId,
    pub pm: PartialMatchId,
    pub salience: i32,
    pub timetag: u64,
    seq: u64,
}

/// Ordered set of pending activations.
///
/// The engine guarantees an activation's partial match stays live for the
/// duration of the firing; the `executing` flag is the garbage-flush gate
/// that makes that hold.
#[derive(Debug, Default)]
pub struct Agenda {
    activations: Vec<Activation>,
    salience: AHashMap<RuleId, i32>,
    /// True while a rule body is running.
    pub executing: bool,
    /// Emit a watch trace for every add and remove.
    pub trace: bool,
    seq: u64,
    fires: u64,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule's salience for later activations.
    pub fn register_rule(&mut self, rule: RuleId, salience: i32) {
        self.salience.insert(rule, salience);
    }

    pub fn unregister_rule(&mut self, rule: RuleId) {
        self.salience.remove(&rule);
        self.activations.retain(|a| a.rule != rule);
    }

    /// Add an activation for a completed left-hand side.
    pub fn add_activation(&mut self, rule: RuleId, pm: PartialMatchId, timetag: u64) {
        let salience = self.salience.get(&rule).copied().unwrap_or(0);
        self.seq += 1;
        debug!(rule, pm = pm.0, timetag, "activation added");
        if self.trace {
            info!(target: "trawl::watch", "==> Activation {timetag:>6} rule {rule}");
        }
        self.activations.push(Activation { rule, pm, salience, timetag, seq: self.seq });
    }

    /// Drop the activation anchored to `pm`, if present.
    pub fn remove_for_match(&mut self, pm: PartialMatchId) -> bool {
        let before = self.activations.len();
        self.activations.retain(|a| a.pm != pm);
        let removed = self.activations.len() != before;
        if removed {
            debug!(pm = pm.0, "activation removed");
            if self.trace {
                info!(target: "trawl::watch", "<== Activation for match {}", pm.0);
            }
        }
        removed
    }

    /// Pop the next activation under salience-then-recency ordering.
    pub fn next_activation(&mut self) -> Option<Activation> {
        if self.activations.is_empty() {
            return None;
        }
        let best = self
            .activations
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.salience
                    .cmp(&b.salience)
                    .then(a.timetag.cmp(&b.timetag))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)?;
        self.fires += 1;
        Some(self.activations.remove(best))
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    pub fn fires(&self) -> u64 {
        self.fires
    }

    /// Activations in firing order, for inspection.
    pub fn snapshot(&self) -> Vec<Activation> {
        let mut out = self.activations.clone();
        out.sort_by(|a, b| {
            b.salience.cmp(&a.salience).then(b.timetag.cmp(&a.timetag)).then(b.seq.cmp(&a.seq))
        });
        out
    }

    /// Activations pending for one rule, for the matches report.
    pub fn activations_for(&self, rule: RuleId) -> Vec<Activation> {
        self.snapshot().into_iter().filter(|a| a.rule == rule).collect()
    }

    pub fn clear(&mut self) {
        self.activations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salience_then_recency_ordering() {
        let mut agenda = Agenda::new();
        agenda.register_rule(1, 0);
        agenda.register_rule(2, 10);
        agenda.add_activation(1, PartialMatchId(1), 5);
        agenda.add_activation(2, PartialMatchId(2), 1);
        agenda.add_activation(1, PartialMatchId(3), 9);

        let first = agenda.next_activation().unwrap();
        assert_eq!(first.rule, 2); // highest salience
        let second = agenda.next_activation().unwrap();
        assert_eq!(second.pm, PartialMatchId(3)); // most recent timetag
        let third = agenda.next_activation().unwrap();
        assert_eq!(third.pm, PartialMatchId(1));
        assert!(agenda.next_activation().is_none());
        assert_eq!(agenda.fires(), 3);
    }

    #[test]
    fn test_remove_for_match() {
        let mut agenda = Agenda::new();
        agenda.add_activation(1, PartialMatchId(1), 1);
        agenda.add_activation(1, PartialMatchId(2), 1);
        assert!(agenda.remove_for_match(PartialMatchId(1)));
        assert!(!agenda.remove_for_match(PartialMatchId(1)));
        assert_eq!(agenda.len(), 1);
    }

    #[test]
    fn test_equal_keys_fall_back_to_insertion_order() {
        let mut agenda = Agenda::new();
        agenda.add_activation(1, PartialMatchId(1), 4);
        agenda.add_activation(1, PartialMatchId(2), 4);
        // later insertion wins under the depth discipline
        assert_eq!(agenda.next_activation().unwrap().pm, PartialMatchId(2));
    }
}
