//! The partial-match store.
//!
//! All [`PartialMatch`] and [`AlphaMatch`] records live in one owning
//! arena per environment; every cross-reference between them (lineage,
//! blocking, memory threading) is a typed index into that arena, so
//! unlink-then-drop retraction has no aliasing hazards. Retracted matches
//! go onto a garbage list and their arena slots are reclaimed only when
//! the engine flushes between rule firings.

use crate::types::{AlphaMatchId, EntityId, HeaderId, JoinId, PartialMatchId, Side, SlotId};

/// Records how a `$`-variable bound a slice of a multi-valued slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultifieldMarker {
    /// One-based field position of the `$`-variable within the pattern.
    pub which_field: u16,
    pub slot: SlotId,
    pub start_position: usize,
    pub range: usize,
}

/// One alpha-level match of a single entity.
#[derive(Debug, Clone)]
pub struct AlphaMatch {
    pub entity: EntityId,
    /// Markers copied at alpha-match creation; freed with the record.
    pub markers: Vec<MultifieldMarker>,
    /// Alpha-memory bucket index, kept so removal can splice without
    /// re-hashing.
    pub bucket: u64,
}

/// An ordered tuple of alpha matches across the patterns consumed so far.
///
/// `binds.len()` is the match's bcount. A `None` slot denotes a satisfied
/// negated or exists CE at that position. The lineage, memory, and block
/// fields thread the match through the structures described below:
///
/// * `next_in_memory`/`prev_in_memory`: intra-bucket list of the owning
///   alpha or beta memory (LHS prepend, RHS append).
/// * `left_parent` + `next/prev_left_child`: child list under the LHS
///   contributor; `right_parent` + `next/prev_right_child` symmetric.
/// * `children`: head of this match's own child list, traversed through
///   the left-child links when this match sits in a left memory and the
///   right-child links otherwise (`rhs_memory`).
/// * `marker`: the RHS match currently suppressing this LHS match;
///   `block_list` + `next/prev_blocked`: the LHS matches this RHS match
///   suppresses.
#[derive(Debug, Clone)]
pub struct PartialMatch {
    pub binds: Vec<Option<AlphaMatchId>>,
    pub hash_value: u64,
    pub timetag: u64,
    /// Join memory this match resides in, if any.
    pub owner: Option<(JoinId, Side)>,
    /// Pattern header whose alpha memory owns this match, if alpha-level.
    pub header: Option<HeaderId>,
    pub bucket: u64,
    pub rhs_memory: bool,
    pub deleting: bool,

    pub next_in_memory: Option<PartialMatchId>,
    pub prev_in_memory: Option<PartialMatchId>,

    pub left_parent: Option<PartialMatchId>,
    pub right_parent: Option<PartialMatchId>,
    pub children: Option<PartialMatchId>,
    pub next_left_child: Option<PartialMatchId>,
    pub prev_left_child: Option<PartialMatchId>,
    pub next_right_child: Option<PartialMatchId>,
    pub prev_right_child: Option<PartialMatchId>,

    pub marker: Option<PartialMatchId>,
    pub block_list: Option<PartialMatchId>,
    pub next_blocked: Option<PartialMatchId>,
    pub prev_blocked: Option<PartialMatchId>,

    /// Entities whose existence is logically supported by this match.
    pub dependents: Vec<EntityId>,
}

impl PartialMatch {
    fn fresh(binds: Vec<Option<AlphaMatchId>>, timetag: u64) -> Self {
        Self {
            binds,
            hash_value: 0,
            timetag,
            owner: None,
            header: None,
            bucket: 0,
            rhs_memory: false,
            deleting: false,
            next_in_memory: None,
            prev_in_memory: None,
            left_parent: None,
            right_parent: None,
            children: None,
            next_left_child: None,
            prev_left_child: None,
            next_right_child: None,
            prev_right_child: None,
            marker: None,
            block_list: None,
            next_blocked: None,
            prev_blocked: None,
            dependents: Vec::new(),
        }
    }

    /// Number of patterns consumed from the leftmost pattern through the
    /// owning join, inclusive.
    pub fn bcount(&self) -> usize {
        self.binds.len()
    }
}

/// Owning arena for partial matches and alpha matches.
#[derive(Debug, Default)]
pub struct MatchArena {
    matches: Vec<Option<PartialMatch>>,
    free_matches: Vec<u32>,
    alphas: Vec<Option<AlphaMatch>>,
    free_alphas: Vec<u32>,
    /// Matches retracted but not yet reclaimed. Slots are reused only
    /// after a flush, so indices held by in-flight drives stay valid.
    garbage: Vec<PartialMatchId>,
}

impl MatchArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_match_count(&self) -> usize {
        self.matches.iter().filter(|m| m.is_some()).count() - self.garbage.len()
    }

    pub fn partial_match(&self, id: PartialMatchId) -> &PartialMatch {
        self.matches[id.0 as usize].as_ref().expect("stale partial match index")
    }

    pub fn partial_match_mut(&mut self, id: PartialMatchId) -> &mut PartialMatch {
        self.matches[id.0 as usize].as_mut().expect("stale partial match index")
    }

    pub fn alpha_match(&self, id: AlphaMatchId) -> &AlphaMatch {
        self.alphas[id.0 as usize].as_ref().expect("stale alpha match index")
    }

    pub fn alpha_match_mut(&mut self, id: AlphaMatchId) -> &mut AlphaMatch {
        self.alphas[id.0 as usize].as_mut().expect("stale alpha match index")
    }

    fn insert_match(&mut self, pm: PartialMatch) -> PartialMatchId {
        if let Some(slot) = self.free_matches.pop() {
            self.matches[slot as usize] = Some(pm);
            PartialMatchId(slot)
        } else {
            self.matches.push(Some(pm));
            PartialMatchId((self.matches.len() - 1) as u32)
        }
    }

    /// Sentinel match with a single empty slot, used by exists and negated
    /// first-pattern joins and as the left prime of a rule.
    pub fn create_empty(&mut self, timetag: u64) -> PartialMatchId {
        self.insert_match(PartialMatch::fresh(vec![None], timetag))
    }

    /// Alpha-level match of one entity with copied multifield markers.
    /// Memory insertion is the alpha memory's job.
    pub fn create_alpha(
        &mut self,
        entity: EntityId,
        markers: Vec<MultifieldMarker>,
        timetag: u64,
    ) -> (PartialMatchId, AlphaMatchId) {
        let alpha = AlphaMatch { entity, markers, bucket: 0 };
        let alpha_id = if let Some(slot) = self.free_alphas.pop() {
            self.alphas[slot as usize] = Some(alpha);
            AlphaMatchId(slot)
        } else {
            self.alphas.push(Some(alpha));
            AlphaMatchId((self.alphas.len() - 1) as u32)
        };
        let mut pm = PartialMatch::fresh(vec![Some(alpha_id)], timetag);
        pm.rhs_memory = true;
        (self.insert_match(pm), alpha_id)
    }

    /// Merge a left match with a right match into a match one pattern
    /// wider. A missing right side appends an empty slot, denoting a
    /// satisfied negated or exists CE.
    pub fn merge(
        &mut self,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
        timetag: u64,
    ) -> PartialMatchId {
        let mut binds = match lhs {
            Some(id) => self.partial_match(id).binds.clone(),
            None => Vec::new(),
        };
        match rhs {
            Some(id) => binds.push(self.partial_match(id).binds[0]),
            None => binds.push(None),
        }
        self.insert_match(PartialMatch::fresh(binds, timetag))
    }

    /// Width-preserving copy of an alpha-memory match, used when the first
    /// join of a rule hands an alpha match to its children.
    pub fn copy_partial_match(&mut self, source: PartialMatchId, timetag: u64) -> PartialMatchId {
        let binds = self.partial_match(source).binds.clone();
        self.insert_match(PartialMatch::fresh(binds, timetag))
    }

    /// Whether `entity` appears in any bind of `pm`.
    pub fn find_entity_in_partial_match(&self, entity: EntityId, pm: PartialMatchId) -> bool {
        self.partial_match(pm).binds.iter().any(|bind| {
            bind.map(|alpha| self.alpha_match(alpha).entity == entity).unwrap_or(false)
        })
    }

    /// Link `blocked` (an LHS match) under `blocker` (the RHS match that
    /// suppresses it).
    pub fn add_blocked_link(&mut self, blocked: PartialMatchId, blocker: PartialMatchId) {
        let old_head = self.partial_match(blocker).block_list;
        {
            let pm = self.partial_match_mut(blocked);
            pm.marker = Some(blocker);
            pm.next_blocked = old_head;
            pm.prev_blocked = None;
        }
        if let Some(head) = old_head {
            self.partial_match_mut(head).prev_blocked = Some(blocked);
        }
        self.partial_match_mut(blocker).block_list = Some(blocked);
    }

    /// Detach `blocked` from its blocker's block list.
    pub fn remove_blocked_link(&mut self, blocked: PartialMatchId) {
        let (marker, next, prev) = {
            let pm = self.partial_match(blocked);
            (pm.marker, pm.next_blocked, pm.prev_blocked)
        };
        let Some(blocker) = marker else { return };
        match prev {
            Some(p) => self.partial_match_mut(p).next_blocked = next,
            None => self.partial_match_mut(blocker).block_list = next,
        }
        if let Some(n) = next {
            self.partial_match_mut(n).prev_blocked = prev;
        }
        let pm = self.partial_match_mut(blocked);
        pm.marker = None;
        pm.next_blocked = None;
        pm.prev_blocked = None;
    }

    /// Thread `child` under its parents' child lists.
    pub fn link_lineage(
        &mut self,
        child: PartialMatchId,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
    ) {
        if let Some(parent) = rhs {
            let old_head = self.partial_match(parent).children;
            {
                let pm = self.partial_match_mut(child);
                pm.right_parent = Some(parent);
                pm.next_right_child = old_head;
                pm.prev_right_child = None;
            }
            if let Some(head) = old_head {
                let head_pm = self.partial_match_mut(head);
                // The sibling ahead of us is a right-child of the same parent.
                head_pm.prev_right_child = Some(child);
            }
            self.partial_match_mut(parent).children = Some(child);
        }
        if let Some(parent) = lhs {
            let old_head = self.partial_match(parent).children;
            {
                let pm = self.partial_match_mut(child);
                pm.left_parent = Some(parent);
                pm.next_left_child = old_head;
                pm.prev_left_child = None;
            }
            if let Some(head) = old_head {
                self.partial_match_mut(head).prev_left_child = Some(child);
            }
            self.partial_match_mut(parent).children = Some(child);
        }
    }

    /// Detach `pm` from both parents' child lists.
    pub fn unlink_lineage(&mut self, pm_id: PartialMatchId) {
        let (left_parent, right_parent, nl, pl, nr, pr) = {
            let pm = self.partial_match(pm_id);
            (
                pm.left_parent,
                pm.right_parent,
                pm.next_left_child,
                pm.prev_left_child,
                pm.next_right_child,
                pm.prev_right_child,
            )
        };
        if let Some(parent) = left_parent {
            match pl {
                Some(p) => self.partial_match_mut(p).next_left_child = nl,
                None => self.partial_match_mut(parent).children = nl,
            }
            if let Some(n) = nl {
                self.partial_match_mut(n).prev_left_child = pl;
            }
        }
        if let Some(parent) = right_parent {
            match pr {
                Some(p) => self.partial_match_mut(p).next_right_child = nr,
                None => self.partial_match_mut(parent).children = nr,
            }
            if let Some(n) = nr {
                self.partial_match_mut(n).prev_right_child = pr;
            }
        }
        let pm = self.partial_match_mut(pm_id);
        pm.left_parent = None;
        pm.right_parent = None;
        pm.next_left_child = None;
        pm.prev_left_child = None;
        pm.next_right_child = None;
        pm.prev_right_child = None;
    }

    /// Children of `pm`, traversed through the link set selected by the
    /// parent's memory side.
    pub fn children_of(&self, pm_id: PartialMatchId) -> Vec<PartialMatchId> {
        let pm = self.partial_match(pm_id);
        let rhs_side = pm.rhs_memory;
        let mut out = Vec::new();
        let mut cursor = pm.children;
        while let Some(child) = cursor {
            out.push(child);
            cursor = if rhs_side {
                self.partial_match(child).next_right_child
            } else {
                self.partial_match(child).next_left_child
            };
        }
        out
    }

    /// Matches currently blocked by `pm`.
    pub fn blocked_by(&self, pm_id: PartialMatchId) -> Vec<PartialMatchId> {
        let mut out = Vec::new();
        let mut cursor = self.partial_match(pm_id).block_list;
        while let Some(blocked) = cursor {
            out.push(blocked);
            cursor = self.partial_match(blocked).next_blocked;
        }
        out
    }

    /// Queue a retracted match for post-propagation reclamation.
    pub fn return_partial_match(&mut self, pm_id: PartialMatchId) {
        debug_assert!(self.partial_match(pm_id).deleting);
        self.garbage.push(pm_id);
    }

    /// Free a match immediately. Only safe during shutdown or after the
    /// match has been fully unlinked.
    pub fn destroy_partial_match(&mut self, pm_id: PartialMatchId) {
        if let Some(pm) = self.matches[pm_id.0 as usize].take() {
            // Alpha records belong to the single alpha-level match that
            // carries them.
            if pm.header.is_some() {
                if let Some(Some(alpha)) = pm.binds.first() {
                    self.alphas[alpha.0 as usize] = None;
                    self.free_alphas.push(alpha.0);
                }
            }
            self.free_matches.push(pm_id.0);
        }
    }

    /// Reclaim every match on the garbage list. The engine calls this only
    /// while no rule is executing.
    pub fn flush_garbage(&mut self) -> usize {
        let garbage = std::mem::take(&mut self.garbage);
        let count = garbage.len();
        for pm_id in garbage {
            self.destroy_partial_match(pm_id);
        }
        count
    }

    pub fn garbage_len(&self) -> usize {
        self.garbage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_alphas(n: usize) -> (MatchArena, Vec<PartialMatchId>) {
        let mut arena = MatchArena::new();
        let pms = (0..n)
            .map(|i| arena.create_alpha(EntityId(i as u32), Vec::new(), 1).0)
            .collect();
        (arena, pms)
    }

    #[test]
    fn test_merge_extends_bcount() {
        let (mut arena, pms) = arena_with_alphas(2);
        let merged = arena.merge(Some(pms[0]), Some(pms[1]), 2);
        assert_eq!(arena.partial_match(merged).bcount(), 2);
        let negated = arena.merge(Some(merged), None, 2);
        assert_eq!(arena.partial_match(negated).bcount(), 3);
        assert!(arena.partial_match(negated).binds[2].is_none());
    }

    #[test]
    fn test_block_links_are_inverse() {
        let (mut arena, pms) = arena_with_alphas(3);
        let blocker = pms[0];
        arena.add_blocked_link(pms[1], blocker);
        arena.add_blocked_link(pms[2], blocker);
        assert_eq!(arena.blocked_by(blocker).len(), 2);
        arena.remove_blocked_link(pms[1]);
        assert_eq!(arena.blocked_by(blocker), vec![pms[2]]);
        assert!(arena.partial_match(pms[1]).marker.is_none());
        arena.remove_blocked_link(pms[2]);
        assert!(arena.blocked_by(blocker).is_empty());
    }

    #[test]
    fn test_lineage_threading() {
        let (mut arena, pms) = arena_with_alphas(2);
        let lhs = arena.create_empty(1);
        let child_a = arena.merge(Some(lhs), Some(pms[0]), 1);
        let child_b = arena.merge(Some(lhs), Some(pms[1]), 1);
        arena.link_lineage(child_a, Some(lhs), Some(pms[0]));
        arena.link_lineage(child_b, Some(lhs), Some(pms[1]));
        // lhs sits in a left memory, so children thread via left links
        assert_eq!(arena.children_of(lhs), vec![child_b, child_a]);
        // alpha parents are right-side
        assert_eq!(arena.children_of(pms[0]), vec![child_a]);
        arena.unlink_lineage(child_a);
        assert_eq!(arena.children_of(lhs), vec![child_b]);
        assert!(arena.children_of(pms[0]).is_empty());
    }

    #[test]
    fn test_garbage_flush_reclaims_slots() {
        let (mut arena, pms) = arena_with_alphas(1);
        let pm = pms[0];
        arena.partial_match_mut(pm).deleting = true;
        arena.return_partial_match(pm);
        assert_eq!(arena.garbage_len(), 1);
        assert_eq!(arena.flush_garbage(), 1);
        assert_eq!(arena.garbage_len(), 0);
        // slot is reusable now
        let (again, _) = arena.create_alpha(EntityId(9), Vec::new(), 2);
        assert_eq!(again, pm);
    }

    #[test]
    fn test_find_entity_in_partial_match() {
        let (mut arena, pms) = arena_with_alphas(2);
        let merged = arena.merge(Some(pms[0]), Some(pms[1]), 1);
        assert!(arena.find_entity_in_partial_match(EntityId(0), merged));
        assert!(arena.find_entity_in_partial_match(EntityId(1), merged));
        assert!(!arena.find_entity_in_partial_match(EntityId(2), merged));
    }
}
