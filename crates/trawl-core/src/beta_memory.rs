//! Hashed beta memories.
//!
//! Each join owns up to two beta memories, one per side. Partial matches
//! are bucketed by `hash_value % size`. The LHS side prepends within a
//! bucket; the RHS side appends and maintains a `last[]` array so arrivals
//! keep insertion order, which the agenda's conflict-resolution inputs
//! observe. A memory with size > 1 grows in place to `11 * size` once its
//! count exceeds that bound, and shrinks back to the initial size when it
//! empties.

use crate::partial_match::MatchArena;
use crate::types::PartialMatchId;

/// Initial table size for hashed beta memories.
pub const INITIAL_BETA_HASH_SIZE: u64 = 17;

/// One side of a join's partial-match storage.
#[derive(Debug)]
pub struct BetaMemory {
    pub size: u64,
    pub count: u64,
    pub beta: Vec<Option<PartialMatchId>>,
    /// Tail pointers, allocated only for the RHS side.
    pub last: Option<Vec<Option<PartialMatchId>>>,
    pub memory_adds: u64,
    pub memory_deletes: u64,
}

impl BetaMemory {
    /// An unhashed memory: a single bucket that never resizes.
    pub fn unhashed(rhs: bool) -> Self {
        Self::with_size(1, rhs)
    }

    /// A hashed memory at the initial table size.
    pub fn hashed(rhs: bool) -> Self {
        Self::with_size(INITIAL_BETA_HASH_SIZE, rhs)
    }

    fn with_size(size: u64, rhs: bool) -> Self {
        Self {
            size,
            count: 0,
            beta: vec![None; size as usize],
            last: if rhs { Some(vec![None; size as usize]) } else { None },
            memory_adds: 0,
            memory_deletes: 0,
        }
    }

    pub fn bucket_of(&self, hash_value: u64) -> usize {
        (hash_value % self.size) as usize
    }

    /// Head of the bucket for `hash_value`.
    pub fn bucket_head(&self, hash_value: u64) -> Option<PartialMatchId> {
        self.beta[self.bucket_of(hash_value)]
    }

    /// Prepend `pm` to its bucket (LHS discipline).
    pub fn insert_front(&mut self, arena: &mut MatchArena, pm_id: PartialMatchId) {
        let bucket = {
            let pm = arena.partial_match(pm_id);
            self.bucket_of(pm.hash_value)
        };
        let old_head = self.beta[bucket];
        {
            let pm = arena.partial_match_mut(pm_id);
            pm.bucket = bucket as u64;
            pm.next_in_memory = old_head;
            pm.prev_in_memory = None;
            pm.rhs_memory = false;
        }
        if let Some(head) = old_head {
            arena.partial_match_mut(head).prev_in_memory = Some(pm_id);
        }
        self.beta[bucket] = Some(pm_id);
        self.count += 1;
        self.memory_adds += 1;
    }

    /// Append `pm` to its bucket (RHS discipline, via `last[]`).
    pub fn insert_back(&mut self, arena: &mut MatchArena, pm_id: PartialMatchId) {
        let bucket = {
            let pm = arena.partial_match(pm_id);
            self.bucket_of(pm.hash_value)
        };
        let tails = self.last.as_mut().expect("append into a memory without tail pointers");
        let old_tail = tails[bucket];
        {
            let pm = arena.partial_match_mut(pm_id);
            pm.bucket = bucket as u64;
            pm.next_in_memory = None;
            pm.prev_in_memory = old_tail;
            pm.rhs_memory = true;
        }
        match old_tail {
            Some(tail) => arena.partial_match_mut(tail).next_in_memory = Some(pm_id),
            None => self.beta[bucket] = Some(pm_id),
        }
        tails[bucket] = Some(pm_id);
        self.count += 1;
        self.memory_adds += 1;
    }

    /// Splice `pm` out of its bucket.
    pub fn remove(&mut self, arena: &mut MatchArena, pm_id: PartialMatchId) {
        let (bucket, next, prev) = {
            let pm = arena.partial_match(pm_id);
            (pm.bucket as usize, pm.next_in_memory, pm.prev_in_memory)
        };
        match prev {
            Some(p) => arena.partial_match_mut(p).next_in_memory = next,
            None => self.beta[bucket] = next,
        }
        match next {
            Some(n) => arena.partial_match_mut(n).prev_in_memory = prev,
            None => {
                if let Some(tails) = self.last.as_mut() {
                    tails[bucket] = prev;
                }
            }
        }
        {
            let pm = arena.partial_match_mut(pm_id);
            pm.next_in_memory = None;
            pm.prev_in_memory = None;
        }
        self.count -= 1;
        self.memory_deletes += 1;
    }

    /// Whether an insert has pushed the memory past the growth bound.
    pub fn needs_resize(&self) -> bool {
        self.size > 1 && self.count > self.size * 11
    }

    /// Rehash in place into a table 11 times larger, re-threading each
    /// bucket in traversal order.
    pub fn resize(&mut self, arena: &mut MatchArena) {
        let old_size = self.size;
        let old_array = std::mem::take(&mut self.beta);
        self.size = old_size * 11;
        self.beta = vec![None; self.size as usize];
        let mut last_add: Vec<Option<PartialMatchId>> = vec![None; self.size as usize];

        for head in old_array.into_iter().flatten() {
            let mut cursor = Some(head);
            while let Some(pm_id) = cursor {
                let (next, hash_value) = {
                    let pm = arena.partial_match(pm_id);
                    (pm.next_in_memory, pm.hash_value)
                };
                let bucket = (hash_value % self.size) as usize;
                {
                    let pm = arena.partial_match_mut(pm_id);
                    pm.bucket = bucket as u64;
                    pm.next_in_memory = None;
                    pm.prev_in_memory = last_add[bucket];
                }
                match last_add[bucket] {
                    Some(tail) => arena.partial_match_mut(tail).next_in_memory = Some(pm_id),
                    None => self.beta[bucket] = Some(pm_id),
                }
                last_add[bucket] = Some(pm_id);
                cursor = next;
            }
        }

        if self.last.is_some() {
            self.last = Some(last_add);
        }
    }

    /// Shrink an emptied hashed memory back to the initial size.
    pub fn reset_if_empty(&mut self) {
        if self.count != 0 || self.size == 1 || self.size == INITIAL_BETA_HASH_SIZE {
            return;
        }
        self.size = INITIAL_BETA_HASH_SIZE;
        self.beta = vec![None; self.size as usize];
        if self.last.is_some() {
            self.last = Some(vec![None; self.size as usize]);
        }
    }

    /// All matches currently stored, bucket by bucket.
    pub fn iter_matches(&self, arena: &MatchArena) -> Vec<PartialMatchId> {
        let mut out = Vec::with_capacity(self.count as usize);
        for head in self.beta.iter().flatten() {
            let mut cursor = Some(*head);
            while let Some(pm_id) = cursor {
                out.push(pm_id);
                cursor = arena.partial_match(pm_id).next_in_memory;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    fn alpha(arena: &mut MatchArena, entity: u32, hash: u64) -> PartialMatchId {
        let (pm, _) = arena.create_alpha(EntityId(entity), Vec::new(), 1);
        arena.partial_match_mut(pm).hash_value = hash;
        pm
    }

    #[test]
    fn test_rhs_bucket_preserves_insertion_order() {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(true);
        let a = alpha(&mut arena, 1, 3);
        let b = alpha(&mut arena, 2, 3 + INITIAL_BETA_HASH_SIZE);
        let c = alpha(&mut arena, 3, 3);
        memory.insert_back(&mut arena, a);
        memory.insert_back(&mut arena, b);
        memory.insert_back(&mut arena, c);
        // all three collide into bucket 3; order is a, b, c
        let mut seen = Vec::new();
        let mut cursor = memory.bucket_head(3);
        while let Some(pm) = cursor {
            seen.push(pm);
            cursor = arena.partial_match(pm).next_in_memory;
        }
        assert_eq!(seen, vec![a, b, c]);
    }

    #[test]
    fn test_lhs_bucket_prepends() {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(false);
        let a = alpha(&mut arena, 1, 5);
        let b = alpha(&mut arena, 2, 5);
        memory.insert_front(&mut arena, a);
        memory.insert_front(&mut arena, b);
        assert_eq!(memory.bucket_head(5), Some(b));
    }

    #[test]
    fn test_remove_updates_tail() {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(true);
        let a = alpha(&mut arena, 1, 0);
        let b = alpha(&mut arena, 2, 0);
        memory.insert_back(&mut arena, a);
        memory.insert_back(&mut arena, b);
        memory.remove(&mut arena, b);
        assert_eq!(memory.last.as_ref().unwrap()[0], Some(a));
        memory.remove(&mut arena, a);
        assert_eq!(memory.last.as_ref().unwrap()[0], None);
        assert_eq!(memory.count, 0);
    }

    #[test]
    fn test_resize_threshold_and_membership() {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(false);
        let total = (INITIAL_BETA_HASH_SIZE * 11 + 1) as u32;
        let mut ids = Vec::new();
        for i in 0..total {
            let pm = alpha(&mut arena, i, i as u64 * 31);
            memory.insert_front(&mut arena, pm);
            ids.push(pm);
        }
        assert!(memory.needs_resize());
        memory.resize(&mut arena);
        assert_eq!(memory.size, INITIAL_BETA_HASH_SIZE * 11);
        let after = memory.iter_matches(&arena);
        assert_eq!(after.len(), ids.len());
        for pm_id in after {
            let pm = arena.partial_match(pm_id);
            assert_eq!(pm.hash_value % memory.size, pm.bucket);
        }
    }

    #[test]
    fn test_reset_if_empty_restores_initial_size() {
        let mut arena = MatchArena::new();
        let mut memory = BetaMemory::hashed(false);
        memory.size = INITIAL_BETA_HASH_SIZE * 11;
        memory.beta = vec![None; memory.size as usize];
        memory.reset_if_empty();
        assert_eq!(memory.size, INITIAL_BETA_HASH_SIZE);
        // unhashed memories never reset
        let mut single = BetaMemory::unhashed(false);
        single.reset_if_empty();
        assert_eq!(single.size, 1);
    }
}
