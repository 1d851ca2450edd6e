//! Hashed alpha memories.
//!
//! Entity-level matches live in a single process-wide bucket table of
//! [`ALPHA_MEMORY_HASH_SIZE`] entries. A bucket is identified by the pair
//! (pattern-node header, right-hash value); buckets sharing a table slot
//! chain together. Each non-empty bucket is additionally threaded onto its
//! header's `first_hash`/`last_hash` list so join drives and priming walk
//! only occupied buckets. Bucket lists are FIFO and removal is O(1) via
//! the bucket index stored on the alpha match.

use tracing::trace;

use crate::eval::TestExpr;
use crate::partial_match::MatchArena;
use crate::types::{AlphaBucketId, HeaderId, JoinId, PartialMatchId, TemplateId};

/// Size of the global alpha-memory bucket table.
pub const ALPHA_MEMORY_HASH_SIZE: u64 = 63559;

/// Per-pattern entry point into the join network.
///
/// Fact headers carry a compiled constant test; object headers are fed by
/// the object pattern network and carry none.
#[derive(Debug)]
pub struct PatternNodeHeader {
    pub id: HeaderId,
    /// Occupied-bucket chain for this header.
    pub first_hash: Option<AlphaBucketId>,
    pub last_hash: Option<AlphaBucketId>,
    /// Joins entered from this header's alpha memory.
    pub entry_joins: Vec<JoinId>,
    /// Hash expression list evaluated against a candidate entity to pick
    /// the alpha bucket (and, symmetrically, the beta bucket on drive).
    pub right_hash: Vec<TestExpr>,
    /// Fact-side constant and intra-pattern test, if any.
    pub constant_test: Option<TestExpr>,
    /// Template this header discriminates on, for fact headers.
    pub template: Option<TemplateId>,
    /// Rules sharing this header.
    pub use_count: u32,
}

impl PatternNodeHeader {
    pub fn new(id: HeaderId) -> Self {
        Self {
            id,
            first_hash: None,
            last_hash: None,
            entry_joins: Vec::new(),
            right_hash: Vec::new(),
            constant_test: None,
            template: None,
            use_count: 0,
        }
    }
}

/// One hash bucket of an alpha memory.
#[derive(Debug)]
pub struct AlphaMemoryHash {
    pub owner: HeaderId,
    /// Index into the global bucket table.
    pub bucket: u64,
    /// FIFO of alpha-level partial matches, one per matched entity.
    pub first: Option<PartialMatchId>,
    pub last: Option<PartialMatchId>,
    /// Chain of buckets sharing the same table slot.
    pub next: Option<AlphaBucketId>,
    pub prev: Option<AlphaBucketId>,
    /// Occupied-bucket chain of the owning header.
    pub next_hash: Option<AlphaBucketId>,
    pub prev_hash: Option<AlphaBucketId>,
}

/// The global alpha-memory table plus its bucket arena.
#[derive(Debug)]
pub struct AlphaMemoryTable {
    table: Vec<Option<AlphaBucketId>>,
    buckets: Vec<Option<AlphaMemoryHash>>,
    free: Vec<u32>,
}

impl Default for AlphaMemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AlphaMemoryTable {
    pub fn new() -> Self {
        Self {
            table: vec![None; ALPHA_MEMORY_HASH_SIZE as usize],
            buckets: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Table slot for (header, right-hash value). The header id folds in
    /// at full 64-bit width.
    pub fn alpha_hash(header: HeaderId, hash_offset: u64) -> u64 {
        (header.0 as u64).wrapping_add(hash_offset) % ALPHA_MEMORY_HASH_SIZE
    }

    pub fn bucket(&self, id: AlphaBucketId) -> &AlphaMemoryHash {
        self.buckets[id.0 as usize].as_ref().expect("stale alpha bucket index")
    }

    fn bucket_mut(&mut self, id: AlphaBucketId) -> &mut AlphaMemoryHash {
        self.buckets[id.0 as usize].as_mut().expect("stale alpha bucket index")
    }

    /// Find the bucket for (header, hash offset), if occupied.
    pub fn find(&self, header: &PatternNodeHeader, hash_offset: u64) -> Option<AlphaBucketId> {
        let slot = Self::alpha_hash(header.id, hash_offset);
        let mut cursor = self.table[slot as usize];
        while let Some(id) = cursor {
            let bucket = self.bucket(id);
            if bucket.owner == header.id && bucket.bucket == slot {
                return Some(id);
            }
            cursor = bucket.next;
        }
        None
    }

    /// Head of the FIFO for (header, hash offset), if any.
    pub fn matches_for(
        &self,
        header: &PatternNodeHeader,
        hash_offset: u64,
    ) -> Option<PartialMatchId> {
        self.find(header, hash_offset).and_then(|id| self.bucket(id).first)
    }

    /// Append an alpha-level match to its header's memory at the bucket
    /// keyed by `hash_offset`. The alpha match stores the table slot so
    /// removal needs no re-hash.
    pub fn insert(
        &mut self,
        arena: &mut MatchArena,
        header: &mut PatternNodeHeader,
        pm_id: PartialMatchId,
        hash_offset: u64,
    ) {
        let slot = Self::alpha_hash(header.id, hash_offset);
        let bucket_id = match self.find(header, hash_offset) {
            Some(id) => id,
            None => self.create_bucket(header, slot),
        };

        let old_tail = self.bucket(bucket_id).last;
        {
            let pm = arena.partial_match_mut(pm_id);
            pm.header = Some(header.id);
            pm.hash_value = hash_offset;
            pm.bucket = slot;
            pm.next_in_memory = None;
            pm.prev_in_memory = old_tail;
            pm.rhs_memory = true;
        }
        if let Some(alpha) = arena.partial_match(pm_id).binds.first().copied().flatten() {
            arena.alpha_match_mut(alpha).bucket = slot;
        }
        match old_tail {
            Some(tail) => arena.partial_match_mut(tail).next_in_memory = Some(pm_id),
            None => self.bucket_mut(bucket_id).first = Some(pm_id),
        }
        self.bucket_mut(bucket_id).last = Some(pm_id);
        trace!(header = header.id.0, slot, "alpha memory insert");
    }

    fn create_bucket(&mut self, header: &mut PatternNodeHeader, slot: u64) -> AlphaBucketId {
        let bucket = AlphaMemoryHash {
            owner: header.id,
            bucket: slot,
            first: None,
            last: None,
            next: self.table[slot as usize],
            prev: None,
            next_hash: None,
            prev_hash: header.last_hash,
        };
        let id = if let Some(free) = self.free.pop() {
            self.buckets[free as usize] = Some(bucket);
            AlphaBucketId(free)
        } else {
            self.buckets.push(Some(bucket));
            AlphaBucketId((self.buckets.len() - 1) as u32)
        };
        if let Some(old_head) = self.table[slot as usize] {
            self.bucket_mut(old_head).prev = Some(id);
        }
        self.table[slot as usize] = Some(id);
        match header.last_hash {
            Some(tail) => self.bucket_mut(tail).next_hash = Some(id),
            None => header.first_hash = Some(id),
        }
        header.last_hash = Some(id);
        id
    }

    /// Splice an alpha-level match out of its bucket; the bucket itself is
    /// unlinked when its last match leaves.
    pub fn remove(
        &mut self,
        arena: &mut MatchArena,
        header: &mut PatternNodeHeader,
        pm_id: PartialMatchId,
    ) {
        let (slot, next, prev) = {
            let pm = arena.partial_match(pm_id);
            (pm.bucket, pm.next_in_memory, pm.prev_in_memory)
        };
        let Some(bucket_id) = self.find_by_slot(header.id, slot) else {
            return;
        };
        match prev {
            Some(p) => arena.partial_match_mut(p).next_in_memory = next,
            None => self.bucket_mut(bucket_id).first = next,
        }
        match next {
            Some(n) => arena.partial_match_mut(n).prev_in_memory = prev,
            None => self.bucket_mut(bucket_id).last = prev,
        }
        {
            let pm = arena.partial_match_mut(pm_id);
            pm.next_in_memory = None;
            pm.prev_in_memory = None;
        }
        if self.bucket(bucket_id).first.is_none() {
            self.unlink_bucket(header, bucket_id);
        }
        trace!(header = header.id.0, slot, "alpha memory remove");
    }

    fn find_by_slot(&self, header: HeaderId, slot: u64) -> Option<AlphaBucketId> {
        let mut cursor = self.table[slot as usize];
        while let Some(id) = cursor {
            let bucket = self.bucket(id);
            if bucket.owner == header && bucket.bucket == slot {
                return Some(id);
            }
            cursor = bucket.next;
        }
        None
    }

    fn unlink_bucket(&mut self, header: &mut PatternNodeHeader, id: AlphaBucketId) {
        let (slot, next, prev, next_hash, prev_hash) = {
            let b = self.bucket(id);
            (b.bucket, b.next, b.prev, b.next_hash, b.prev_hash)
        };
        // table-slot siblings
        match prev {
            Some(p) => self.bucket_mut(p).next = next,
            None => self.table[slot as usize] = next,
        }
        if let Some(n) = next {
            self.bucket_mut(n).prev = prev;
        }
        // header's occupied chain
        match prev_hash {
            Some(p) => self.bucket_mut(p).next_hash = next_hash,
            None => header.first_hash = next_hash,
        }
        match next_hash {
            Some(n) => self.bucket_mut(n).prev_hash = prev_hash,
            None => header.last_hash = prev_hash,
        }
        self.buckets[id.0 as usize] = None;
        self.free.push(id.0);
    }

    /// Every alpha-level match of a header, walking only occupied buckets.
    pub fn all_matches(&self, header: &PatternNodeHeader, arena: &MatchArena) -> Vec<PartialMatchId> {
        let mut out = Vec::new();
        let mut bucket_cursor = header.first_hash;
        while let Some(bucket_id) = bucket_cursor {
            let bucket = self.bucket(bucket_id);
            let mut cursor = bucket.first;
            while let Some(pm_id) = cursor {
                out.push(pm_id);
                cursor = arena.partial_match(pm_id).next_in_memory;
            }
            bucket_cursor = bucket.next_hash;
        }
        out
    }

    /// Occupied buckets of a header, in threading order.
    pub fn occupied_buckets(&self, header: &PatternNodeHeader) -> Vec<AlphaBucketId> {
        let mut out = Vec::new();
        let mut cursor = header.first_hash;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.bucket(id).next_hash;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    fn setup() -> (MatchArena, AlphaMemoryTable, PatternNodeHeader) {
        (MatchArena::new(), AlphaMemoryTable::new(), PatternNodeHeader::new(HeaderId(3)))
    }

    fn alpha(arena: &mut MatchArena, entity: u32) -> PartialMatchId {
        arena.create_alpha(EntityId(entity), Vec::new(), 1).0
    }

    #[test]
    fn test_insert_and_lookup_by_offset() {
        let (mut arena, mut table, mut header) = setup();
        let a = alpha(&mut arena, 1);
        let b = alpha(&mut arena, 2);
        table.insert(&mut arena, &mut header, a, 40);
        table.insert(&mut arena, &mut header, b, 40);
        assert_eq!(table.matches_for(&header, 40), Some(a));
        assert_eq!(arena.partial_match(a).next_in_memory, Some(b));
        assert_eq!(table.matches_for(&header, 41), None);
    }

    #[test]
    fn test_occupied_chain_tracks_buckets() {
        let (mut arena, mut table, mut header) = setup();
        let a = alpha(&mut arena, 1);
        let b = alpha(&mut arena, 2);
        table.insert(&mut arena, &mut header, a, 10);
        table.insert(&mut arena, &mut header, b, 20);
        assert_eq!(table.occupied_buckets(&header).len(), 2);
        assert_eq!(table.all_matches(&header, &arena).len(), 2);

        table.remove(&mut arena, &mut header, a);
        assert_eq!(table.occupied_buckets(&header).len(), 1);
        table.remove(&mut arena, &mut header, b);
        assert!(header.first_hash.is_none());
        assert!(header.last_hash.is_none());
    }

    #[test]
    fn test_colliding_headers_share_table_slot() {
        let mut arena = MatchArena::new();
        let mut table = AlphaMemoryTable::new();
        // two headers whose id + offset land on the same table slot
        let mut header_a = PatternNodeHeader::new(HeaderId(0));
        let mut header_b = PatternNodeHeader::new(HeaderId(1));
        let a = alpha(&mut arena, 1);
        let b = alpha(&mut arena, 2);
        table.insert(&mut arena, &mut header_a, a, 7);
        table.insert(&mut arena, &mut header_b, b, 6); // 1 + 6 == 0 + 7
        assert_eq!(table.matches_for(&header_a, 7), Some(a));
        assert_eq!(table.matches_for(&header_b, 6), Some(b));
        table.remove(&mut arena, &mut header_a, a);
        assert_eq!(table.matches_for(&header_b, 6), Some(b));
    }

    #[test]
    fn test_fifo_order_within_bucket() {
        let (mut arena, mut table, mut header) = setup();
        let ids: Vec<_> = (0..4).map(|i| alpha(&mut arena, i)).collect();
        for id in &ids {
            table.insert(&mut arena, &mut header, *id, 5);
        }
        let mut seen = Vec::new();
        let mut cursor = table.matches_for(&header, 5);
        while let Some(pm) = cursor {
            seen.push(pm);
            cursor = arena.partial_match(pm).next_in_memory;
        }
        assert_eq!(seen, ids);
    }
}
