//! Logical-dependency truth maintenance.
//!
//! A partial match may logically support entities asserted by the rule it
//! completed. When such a match dies, retracted or blocked, the
//! supported entities lose that support, and entities with no remaining
//! support are scheduled for retraction. The schedule drains at the
//! engine's drain points, never mid-drive.

use ahash::AHashMap;
use tracing::debug;

use crate::partial_match::MatchArena;
use crate::types::{EntityId, PartialMatchId};

/// Tracks which partial matches support which entities.
#[derive(Debug, Default)]
pub struct LogicalDependencyManager {
    /// Supporting matches per dependent entity.
    supports: AHashMap<EntityId, Vec<PartialMatchId>>,
    /// Entities whose last support was withdrawn, awaiting retraction.
    pending: Vec<EntityId>,
}

impl LogicalDependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire a support edge: `pm` keeps `entity` alive.
    pub fn add_support(&mut self, arena: &mut MatchArena, entity: EntityId, pm: PartialMatchId) {
        arena.partial_match_mut(pm).dependents.push(entity);
        self.supports.entry(entity).or_default().push(pm);
        debug!(entity = entity.0, pm = pm.0, "logical support added");
    }

    /// Whether `entity` is logically supported at all.
    pub fn is_supported(&self, entity: EntityId) -> bool {
        self.supports.get(&entity).is_some_and(|s| !s.is_empty())
    }

    /// Withdraw every support edge leaving `pm`. Entities left without
    /// support are queued for forced retraction.
    pub fn remove_logical_support(&mut self, arena: &mut MatchArena, pm: PartialMatchId) {
        let dependents = std::mem::take(&mut arena.partial_match_mut(pm).dependents);
        for entity in dependents {
            if let Some(list) = self.supports.get_mut(&entity) {
                list.retain(|supporter| *supporter != pm);
                if list.is_empty() {
                    self.supports.remove(&entity);
                    debug!(entity = entity.0, "last logical support withdrawn");
                    self.pending.push(entity);
                }
            }
        }
    }

    /// Forget all support bookkeeping for an entity being retracted
    /// through the normal path.
    pub fn remove_entity_dependencies(&mut self, arena: &mut MatchArena, entity: EntityId) {
        if let Some(supporters) = self.supports.remove(&entity) {
            for pm in supporters {
                arena.partial_match_mut(pm).dependents.retain(|e| *e != entity);
            }
        }
        self.pending.retain(|e| *e != entity);
    }

    /// Take the entities scheduled for forced retraction.
    pub fn take_forced_retractions(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_support_withdrawal_schedules_retraction() {
        let mut arena = MatchArena::new();
        let mut manager = LogicalDependencyManager::new();
        let pm = arena.create_empty(1);
        let entity = EntityId(4);

        manager.add_support(&mut arena, entity, pm);
        assert!(manager.is_supported(entity));
        assert!(!manager.has_pending());

        manager.remove_logical_support(&mut arena, pm);
        assert!(!manager.is_supported(entity));
        assert_eq!(manager.take_forced_retractions(), vec![entity]);
    }

    #[test]
    fn test_multiple_supports_keep_entity_alive() {
        let mut arena = MatchArena::new();
        let mut manager = LogicalDependencyManager::new();
        let pm_a = arena.create_empty(1);
        let pm_b = arena.create_empty(1);
        let entity = EntityId(4);

        manager.add_support(&mut arena, entity, pm_a);
        manager.add_support(&mut arena, entity, pm_b);
        manager.remove_logical_support(&mut arena, pm_a);
        assert!(manager.is_supported(entity));
        assert!(!manager.has_pending());
        manager.remove_logical_support(&mut arena, pm_b);
        assert_eq!(manager.take_forced_retractions(), vec![entity]);
    }

    #[test]
    fn test_normal_retraction_clears_bookkeeping() {
        let mut arena = MatchArena::new();
        let mut manager = LogicalDependencyManager::new();
        let pm = arena.create_empty(1);
        let entity = EntityId(4);

        manager.add_support(&mut arena, entity, pm);
        manager.remove_entity_dependencies(&mut arena, entity);
        assert!(arena.partial_match(pm).dependents.is_empty());
        // a later death of pm must not schedule the entity again
        manager.remove_logical_support(&mut arena, pm);
        assert!(!manager.has_pending());
    }
}
