//! Rule inspection commands.
//!
//! `matches` walks a rule's join chain and reports, per pattern, the
//! alpha-memory matches, per join the left-memory partial matches, and
//! the rule's pending activations. `join-activity` aggregates per-join
//! memory traffic so hot joins stand out; a reset zeroes every counter.

use std::fmt;

use crate::error::{TrawlError, TrawlResult};
use crate::join_network::RightEntry;
use crate::types::{RuleId, Side};
use crate::TrawlEngine;

/// Output detail for the matches report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Verbose,
    Succinct,
    Terse,
}

/// Alpha-level matches for one pattern of a rule.
#[derive(Debug, Clone)]
pub struct PatternMatches {
    pub pattern: usize,
    /// Short-print forms; empty under terse output.
    pub entities: Vec<String>,
    pub count: usize,
}

/// Partial matches of one join's left memory.
#[derive(Debug, Clone)]
pub struct JoinMatches {
    pub depth: usize,
    pub combinations: Vec<String>,
    pub count: usize,
}

/// The full matches report for a rule.
#[derive(Debug, Clone)]
pub struct MatchesReport {
    pub rule: String,
    pub verbosity: Verbosity,
    pub patterns: Vec<PatternMatches>,
    pub partial_matches: Vec<JoinMatches>,
    pub activations: Vec<String>,
}

impl fmt::Display for MatchesReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Matches for rule {}", self.rule)?;
        for pattern in &self.patterns {
            writeln!(f, "Matches for Pattern {}", pattern.pattern)?;
            if self.verbosity == Verbosity::Terse {
                writeln!(f, " {}", pattern.count)?;
            } else if pattern.entities.is_empty() {
                writeln!(f, " None")?;
            } else {
                for entity in &pattern.entities {
                    writeln!(f, " {entity}")?;
                }
            }
        }
        for join in &self.partial_matches {
            writeln!(f, "Partial matches for CEs 1 - {}", join.depth)?;
            if self.verbosity == Verbosity::Terse {
                writeln!(f, " {}", join.count)?;
            } else if join.combinations.is_empty() {
                writeln!(f, " None")?;
            } else {
                for combination in &join.combinations {
                    writeln!(f, " {combination}")?;
                }
            }
        }
        writeln!(f, "Activations")?;
        if self.verbosity == Verbosity::Terse {
            writeln!(f, " {}", self.activations.len())?;
        } else if self.activations.is_empty() {
            writeln!(f, " None")?;
        } else {
            for activation in &self.activations {
                writeln!(f, " {activation}")?;
            }
        }
        Ok(())
    }
}

/// Per-rule join activity totals.
#[derive(Debug, Clone)]
pub struct JoinActivity {
    pub rule: String,
    pub compares: u64,
    pub adds: u64,
    pub deletes: u64,
}

impl JoinActivity {
    pub fn activity(&self) -> u64 {
        self.compares + self.adds + self.deletes
    }
}

impl fmt::Display for JoinActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} compares, {} adds, {} deletes",
            self.rule, self.compares, self.adds, self.deletes
        )
    }
}

impl TrawlEngine {
    /// Build the matches report for a rule.
    pub fn matches(&self, rule_id: RuleId, verbosity: Verbosity) -> TrawlResult<MatchesReport> {
        let installed = self
            .rules
            .get(&rule_id)
            .ok_or_else(|| TrawlError::rule(format!("no rule with id {rule_id}")))?;

        let mut patterns = Vec::new();
        let mut partial_matches = Vec::new();
        let mut pattern_number = 0usize;

        for join_id in &installed.joins {
            let join = self.rete.join(*join_id);
            if join.rule_to_activate.is_some() {
                continue;
            }
            if let RightEntry::Alpha(header_id) = join.right_entry {
                pattern_number += 1;
                let header = self.rete.header(header_id);
                let alpha_matches = self.rete.alpha.all_matches(header, &self.rete.arena);
                let entities = if verbosity == Verbosity::Terse {
                    Vec::new()
                } else {
                    alpha_matches
                        .iter()
                        .filter_map(|pm| {
                            self.rete.arena.partial_match(*pm).binds.first().copied().flatten()
                        })
                        .map(|alpha| {
                            self.wm.short_print(self.rete.arena.alpha_match(alpha).entity)
                        })
                        .collect()
                };
                patterns.push(PatternMatches {
                    pattern: pattern_number,
                    count: alpha_matches.len(),
                    entities,
                });
            }
            // The first join has no left memory of combinations worth
            // reporting; deeper joins carry the rule's partial matches.
            if join.first_join {
                continue;
            }
            let left = join.left_memory.iter_matches(&self.rete.arena);
            let combinations = if verbosity == Verbosity::Verbose {
                left.iter().map(|pm| self.format_partial_match(*pm)).collect()
            } else {
                Vec::new()
            };
            partial_matches.push(JoinMatches {
                depth: join.depth as usize - 1,
                count: left.len(),
                combinations,
            });
        }

        let activations = if verbosity == Verbosity::Terse {
            self.agenda
                .activations_for(rule_id)
                .iter()
                .map(|a| a.timetag.to_string())
                .collect()
        } else {
            self.agenda
                .activations_for(rule_id)
                .iter()
                .map(|a| self.format_partial_match(a.pm))
                .collect()
        };

        Ok(MatchesReport {
            rule: installed.rule.name.clone(),
            verbosity,
            patterns,
            partial_matches,
            activations,
        })
    }

    /// Comma-separated short prints of a partial match's bound entities;
    /// `*` marks a satisfied negated or exists CE.
    pub(crate) fn format_partial_match(&self, pm: crate::types::PartialMatchId) -> String {
        let binds = &self.rete.arena.partial_match(pm).binds;
        let mut parts = Vec::with_capacity(binds.len());
        for bind in binds {
            match bind {
                Some(alpha) => {
                    let entity = self.rete.arena.alpha_match(*alpha).entity;
                    parts.push(self.wm.short_print(entity));
                }
                None => parts.push("*".to_string()),
            }
        }
        parts.join(",")
    }

    /// Join activity per rule, sorted most active first.
    pub fn join_activity(&self) -> Vec<JoinActivity> {
        let mut out: Vec<JoinActivity> = self
            .rules
            .values()
            .map(|installed| {
                let mut compares = 0;
                let mut adds = 0;
                let mut deletes = 0;
                for join_id in &installed.joins {
                    let join = self.rete.join(*join_id);
                    compares += join.memory_compares;
                    adds += join.memory_adds();
                    deletes += join.memory_deletes();
                }
                JoinActivity { rule: installed.rule.name.clone(), compares, adds, deletes }
            })
            .collect();
        out.sort_by(|a, b| b.activity().cmp(&a.activity()).then(a.rule.cmp(&b.rule)));
        out
    }

    /// Walk the network's internal structures and report the first
    /// inconsistency found, if any. Exercised by the test suites after
    /// edit sequences.
    pub fn check_consistency(&self) -> Result<(), String> {
        // Beta memories: stored bucket must equal hash modulo table size,
        // and the owner back-pointer must match.
        for join_id in self.rete.join_ids() {
            let join = self.rete.join(join_id);
            let sides: Vec<(&crate::beta_memory::BetaMemory, Side)> =
                std::iter::once((&join.left_memory, Side::Lhs))
                    .chain(join.right_memory.as_ref().map(|m| (m, Side::Rhs)))
                    .collect();
            for (memory, side) in sides {
                let mut counted = 0u64;
                for pm_id in memory.iter_matches(&self.rete.arena) {
                    counted += 1;
                    let pm = self.rete.arena.partial_match(pm_id);
                    if pm.hash_value % memory.size != pm.bucket {
                        return Err(format!(
                            "join {} {:?}: bucket {} but hash {} mod {}",
                            join_id.0, side, pm.bucket, pm.hash_value, memory.size
                        ));
                    }
                    if pm.owner != Some((join_id, side)) {
                        return Err(format!("join {} {:?}: owner mismatch", join_id.0, side));
                    }
                    // blocking is an inverse pair
                    if let Some(blocker) = pm.marker {
                        let listed = self
                            .rete
                            .arena
                            .blocked_by(blocker)
                            .iter()
                            .any(|blocked| *blocked == pm_id);
                        if !listed {
                            return Err(format!(
                                "join {}: match {} not on its blocker's list",
                                join_id.0, pm_id.0
                            ));
                        }
                    }
                }
                if counted != memory.count {
                    return Err(format!(
                        "join {} {:?}: count {} but walked {}",
                        join_id.0, side, memory.count, counted
                    ));
                }
            }
        }

        // Alpha memories: every bucket on a header's occupied chain is
        // non-empty and appears exactly once.
        for header_id in self.rete.header_ids() {
            let header = self.rete.header(header_id);
            let buckets = self.rete.alpha.occupied_buckets(header);
            let mut seen = std::collections::HashSet::new();
            for bucket_id in &buckets {
                if !seen.insert(*bucket_id) {
                    return Err(format!("header {}: bucket chained twice", header_id.0));
                }
                if self.rete.alpha.bucket(*bucket_id).first.is_none() {
                    return Err(format!("header {}: empty bucket on chain", header_id.0));
                }
            }
        }

        // Entity back-references: every alpha match listed for an entity
        // binds that entity.
        for (entity, matches) in &self.rete.entity_matches {
            for pm_id in matches {
                if !self.rete.arena.find_entity_in_partial_match(*entity, *pm_id) {
                    return Err(format!(
                        "entity {} back-reference to match {} without the entity",
                        entity.0, pm_id.0
                    ));
                }
            }
        }
        Ok(())
    }

    /// Zero every join's activity counters.
    pub fn join_activity_reset(&mut self) {
        for join_id in self.rete.join_ids() {
            let join = self.rete.join_mut(join_id);
            join.memory_compares = 0;
            join.left_memory.memory_adds = 0;
            join.left_memory.memory_deletes = 0;
            if let Some(right) = join.right_memory.as_mut() {
                right.memory_adds = 0;
                right.memory_deletes = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionElement, PatternCondition, Rule, SlotTest};
    use trawl_types::Value;

    fn engine_with_rule() -> TrawlEngine {
        let mut engine = TrawlEngine::new();
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
        engine
    }

    #[test]
    fn test_matches_report_counts() {
        let mut engine = engine_with_rule();
        engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(8))]).unwrap();

        let report = engine.matches(1, Verbosity::Verbose).unwrap();
        assert_eq!(report.patterns.len(), 2);
        assert_eq!(report.patterns[0].count, 1);
        assert_eq!(report.patterns[1].count, 2);
        assert_eq!(report.activations.len(), 1);
        let text = report.to_string();
        assert!(text.contains("Matches for Pattern 1"));
        assert!(text.contains("Activations"));

        let terse = engine.matches(1, Verbosity::Terse).unwrap();
        assert!(terse.patterns[0].entities.is_empty());
    }

    #[test]
    fn test_join_activity_reports_and_resets() {
        let mut engine = engine_with_rule();
        engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
        let activity = engine.join_activity();
        assert_eq!(activity.len(), 1);
        assert!(activity[0].activity() > 0);
        engine.join_activity_reset();
        let after = engine.join_activity();
        assert_eq!(after[0].activity(), 0);
    }

    #[test]
    fn test_matches_unknown_rule_errors() {
        let engine = engine_with_rule();
        assert!(engine.matches(99, Verbosity::Verbose).is_err());
    }
}
