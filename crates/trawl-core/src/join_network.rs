//! The join network and its drives.
//!
//! Joins combine a left stream of partial matches with a right stream
//! (an alpha memory or, for join-from-the-right, another join's beta
//! memory) under a network test. Matches propagate through `next_links`
//! to child joins; a terminal join activates its rule instead. Negated and
//! exists joins suppress or admit left matches through block links, and
//! retraction cascades down the lineage recorded at merge time.
//!
//! The drive entry points mirror the classic split: asserts enter a join
//! from the left (a parent join produced a wider match) or from the right
//! (an entity reached the join's alpha memory). Both take an operation
//! tag, because re-propagation during a retract must skip matches already
//! marked for deletion.

use ahash::AHashMap;
use tracing::{debug, error, trace};
use trawl_types::AtomTable;

use crate::agenda::Agenda;
use crate::alpha_memory::{AlphaMemoryTable, PatternNodeHeader};
use crate::beta_memory::BetaMemory;
use crate::eval::{self, EvalScope, FunctionRegistry, TestExpr};
use crate::logical_dependency::LogicalDependencyManager;
use crate::partial_match::MatchArena;
use crate::types::{
    DriveOp, EntityId, HeaderId, JoinId, PartialMatchId, RuleId, Side, TemplateId,
};
use crate::working_memory::WorkingMemory;

/// Directed edge from a join to a child join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinLink {
    pub enter_direction: Side,
    pub target: JoinId,
}

/// What feeds the right side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightEntry {
    /// An alpha memory.
    Alpha(HeaderId),
    /// Another join's beta memory (join from the right).
    Join(JoinId),
    /// Nothing: a test CE or a terminal join.
    None,
}

/// A matching operator node.
#[derive(Debug)]
pub struct JoinNode {
    pub id: JoinId,
    /// Patterns consumed from the leftmost pattern through this join.
    pub depth: u16,
    pub first_join: bool,
    pub logical_join: bool,
    pub join_from_the_right: bool,
    pub pattern_is_negated: bool,
    pub pattern_is_exists: bool,
    pub network_test: Option<TestExpr>,
    pub secondary_network_test: Option<TestExpr>,
    pub left_hash: Vec<TestExpr>,
    pub right_hash: Vec<TestExpr>,
    pub right_entry: RightEntry,
    pub last_level: Option<JoinId>,
    pub left_memory: BetaMemory,
    /// Allocated only for join-from-the-right nodes.
    pub right_memory: Option<BetaMemory>,
    pub next_links: Vec<JoinLink>,
    pub rule_to_activate: Option<RuleId>,
    /// Rules sharing this join.
    pub use_count: u32,
    pub rules: Vec<RuleId>,
    /// Pattern position within the rule, for located diagnostics.
    pub pattern_index: usize,
    pub memory_compares: u64,
}

impl JoinNode {
    pub fn memory_adds(&self) -> u64 {
        self.left_memory.memory_adds
            + self.right_memory.as_ref().map_or(0, |m| m.memory_adds)
    }

    pub fn memory_deletes(&self) -> u64 {
        self.left_memory.memory_deletes
            + self.right_memory.as_ref().map_or(0, |m| m.memory_deletes)
    }
}

/// Everything outside the network a drive can touch.
pub struct DriveCtx<'a> {
    pub wm: &'a WorkingMemory,
    pub functions: &'a FunctionRegistry,
    pub atoms: &'a mut AtomTable,
    pub agenda: &'a mut Agenda,
    pub logical: &'a mut LogicalDependencyManager,
    pub rule_names: &'a AHashMap<RuleId, String>,
    /// Timetag stamped onto matches created by this drive.
    pub timetag: u64,
}

enum TestOutcome {
    Value(bool),
    /// A positive-context evaluation error: the enclosing drive aborts.
    Abort,
}

/// The RETE discrimination network: pattern headers, alpha memories,
/// joins, and the partial-match arena they share.
#[derive(Debug)]
pub struct ReteNetwork {
    pub arena: MatchArena,
    pub alpha: AlphaMemoryTable,
    headers: Vec<Option<PatternNodeHeader>>,
    joins: Vec<Option<JoinNode>>,
    free_headers: Vec<u32>,
    free_joins: Vec<u32>,
    /// Fact pattern headers per template.
    pub fact_headers: AHashMap<TemplateId, Vec<HeaderId>>,
    /// Alpha-level matches per live entity (the entity back-reference).
    pub entity_matches: AHashMap<EntityId, Vec<PartialMatchId>>,
    pub beta_resizing: bool,
    /// Count of positive-context evaluation errors reported by drives.
    pub drive_errors: u64,
}

impl Default for ReteNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ReteNetwork {
    pub fn new() -> Self {
        Self {
            arena: MatchArena::new(),
            alpha: AlphaMemoryTable::new(),
            headers: Vec::new(),
            joins: Vec::new(),
            free_headers: Vec::new(),
            free_joins: Vec::new(),
            fact_headers: AHashMap::new(),
            entity_matches: AHashMap::new(),
            beta_resizing: true,
            drive_errors: 0,
        }
    }

    // ------------------------------------------------------------------
    // Node storage
    // ------------------------------------------------------------------

    pub fn new_header(&mut self) -> HeaderId {
        if let Some(slot) = self.free_headers.pop() {
            let id = HeaderId(slot);
            self.headers[slot as usize] = Some(PatternNodeHeader::new(id));
            id
        } else {
            let id = HeaderId(self.headers.len() as u32);
            self.headers.push(Some(PatternNodeHeader::new(id)));
            id
        }
    }

    pub fn header(&self, id: HeaderId) -> &PatternNodeHeader {
        self.headers[id.0 as usize].as_ref().expect("stale header index")
    }

    pub fn header_mut(&mut self, id: HeaderId) -> &mut PatternNodeHeader {
        self.headers[id.0 as usize].as_mut().expect("stale header index")
    }

    pub fn header_ids(&self) -> Vec<HeaderId> {
        self.headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|_| HeaderId(i as u32)))
            .collect()
    }

    pub fn header_count(&self) -> usize {
        self.headers.iter().filter(|h| h.is_some()).count()
    }

    pub fn add_join(&mut self, mut join: JoinNode) -> JoinId {
        if let Some(slot) = self.free_joins.pop() {
            join.id = JoinId(slot);
            let id = join.id;
            self.joins[slot as usize] = Some(join);
            id
        } else {
            join.id = JoinId(self.joins.len() as u32);
            let id = join.id;
            self.joins.push(Some(join));
            id
        }
    }

    pub fn join(&self, id: JoinId) -> &JoinNode {
        self.joins[id.0 as usize].as_ref().expect("stale join index")
    }

    pub fn join_mut(&mut self, id: JoinId) -> &mut JoinNode {
        self.joins[id.0 as usize].as_mut().expect("stale join index")
    }

    pub fn join_exists(&self, id: JoinId) -> bool {
        self.joins.get(id.0 as usize).map(|j| j.is_some()).unwrap_or(false)
    }

    pub fn join_ids(&self) -> Vec<JoinId> {
        self.joins
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.as_ref().map(|_| JoinId(i as u32)))
            .collect()
    }

    pub fn join_count(&self) -> usize {
        self.joins.iter().filter(|j| j.is_some()).count()
    }

    /// Install the left-prime sentinel for a first join whose pattern is
    /// negated or existential.
    pub fn create_left_prime(&mut self, join_id: JoinId, timetag: u64) -> PartialMatchId {
        let sentinel = self.arena.create_empty(timetag);
        let Self { joins, arena, .. } = self;
        let join = joins[join_id.0 as usize].as_mut().expect("stale join index");
        join.left_memory.insert_front(arena, sentinel);
        arena.partial_match_mut(sentinel).owner = Some((join_id, Side::Lhs));
        sentinel
    }

    // ------------------------------------------------------------------
    // Hash computation
    // ------------------------------------------------------------------

    fn scope<'a>(
        &'a self,
        ctx: &'a DriveCtx<'_>,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
    ) -> EvalScope<'a> {
        EvalScope {
            arena: &self.arena,
            wm: ctx.wm,
            functions: ctx.functions,
            lhs,
            rhs,
            rhs_entity: None,
            current_field: None,
        }
    }

    /// Fold a join's hash expression list over a freshly merged match.
    fn beta_memory_hash_value(
        &self,
        ctx: &mut DriveCtx<'_>,
        exprs: &[TestExpr],
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
    ) -> u64 {
        if exprs.is_empty() {
            return 0;
        }
        let scope = EvalScope {
            arena: &self.arena,
            wm: ctx.wm,
            functions: ctx.functions,
            lhs,
            rhs,
            rhs_entity: None,
            current_field: None,
        };
        eval::fold_hash_list(exprs, &scope, ctx.atoms)
    }

    /// Fold a header's right-hash expression against a candidate entity.
    pub fn compute_right_hash_value(
        &self,
        ctx: &mut DriveCtx<'_>,
        header: HeaderId,
        entity: EntityId,
    ) -> u64 {
        let exprs = &self.header(header).right_hash;
        if exprs.is_empty() {
            return 0;
        }
        let scope = EvalScope {
            arena: &self.arena,
            wm: ctx.wm,
            functions: ctx.functions,
            lhs: None,
            rhs: None,
            rhs_entity: Some(entity),
            current_field: None,
        };
        eval::fold_hash_list(exprs, &scope, ctx.atoms)
    }

    // ------------------------------------------------------------------
    // Test evaluation
    // ------------------------------------------------------------------

    /// Evaluate a join's network test. An evaluation error under a negated
    /// join is conservative truth; elsewhere it aborts the drive after a
    /// located report.
    fn eval_network_test(
        &mut self,
        ctx: &DriveCtx<'_>,
        join_id: JoinId,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
    ) -> TestOutcome {
        let outcome = {
            let join = self.join(join_id);
            let Some(test) = &join.network_test else {
                return TestOutcome::Value(true);
            };
            let negated = join.pattern_is_negated;
            let scope = self.scope(ctx, lhs, rhs);
            eval::evaluate_bool(test, &scope).map_err(|err| (negated, err))
        };
        match outcome {
            Ok(result) => TestOutcome::Value(result),
            Err((true, err)) => {
                trace!(join = join_id.0, %err, "negated test error coerced to true");
                TestOutcome::Value(true)
            }
            Err((false, err)) => {
                self.report_join_error(ctx, join_id, &err.message);
                TestOutcome::Abort
            }
        }
    }

    /// Evaluate a secondary network test. Errors clear to false and never
    /// abort.
    fn eval_secondary_test(
        &self,
        ctx: &DriveCtx<'_>,
        join_id: JoinId,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
    ) -> bool {
        let join = self.join(join_id);
        let Some(test) = &join.secondary_network_test else {
            return true;
        };
        let scope = self.scope(ctx, lhs, rhs);
        eval::evaluate_bool(test, &scope).unwrap_or(false)
    }

    fn report_join_error(&mut self, ctx: &DriveCtx<'_>, join_id: JoinId, message: &str) {
        self.drive_errors += 1;
        let join = self.join(join_id);
        let rule = join
            .rules
            .first()
            .and_then(|id| ctx.rule_names.get(id))
            .map(String::as_str)
            .unwrap_or("<unknown rule>");
        error!(
            rule,
            pattern = join.pattern_index,
            "join network evaluation error: {message}"
        );
    }

    // ------------------------------------------------------------------
    // Memory maintenance
    // ------------------------------------------------------------------

    /// Insert a merged match into the target join's memory for `side` and
    /// thread its lineage, resizing afterwards if the insert crossed the
    /// growth bound.
    fn update_beta_links(
        &mut self,
        pm: PartialMatchId,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
        join_id: JoinId,
        hash_value: u64,
        side: Side,
    ) {
        let resizing = self.beta_resizing;
        let Self { joins, arena, .. } = self;
        let join = joins[join_id.0 as usize].as_mut().expect("stale join index");
        {
            let record = arena.partial_match_mut(pm);
            record.hash_value = hash_value;
            record.owner = Some((join_id, side));
        }
        let memory = match side {
            Side::Lhs => &mut join.left_memory,
            Side::Rhs => join.right_memory.as_mut().expect("right insert without right memory"),
        };
        match side {
            Side::Lhs => memory.insert_front(arena, pm),
            Side::Rhs => memory.insert_back(arena, pm),
        }
        arena.link_lineage(pm, lhs, rhs);
        if resizing && memory.needs_resize() {
            memory.resize(arena);
        }
    }

    /// Collect a bucket's matches up front so the drive loop can mutate
    /// the arena while walking.
    fn left_bucket(&self, join_id: JoinId, hash_value: u64) -> Vec<PartialMatchId> {
        let join = self.join(join_id);
        let mut out = Vec::new();
        let mut cursor = join.left_memory.bucket_head(hash_value);
        while let Some(pm) = cursor {
            out.push(pm);
            cursor = self.arena.partial_match(pm).next_in_memory;
        }
        out
    }

    fn right_bucket(&self, join_id: JoinId, hash_value: u64) -> Vec<PartialMatchId> {
        let join = self.join(join_id);
        let mut out = Vec::new();
        let mut cursor = match join.right_entry {
            RightEntry::Alpha(header) => self.alpha.matches_for(self.header(header), hash_value),
            RightEntry::Join(_) => join
                .right_memory
                .as_ref()
                .and_then(|m| m.bucket_head(hash_value)),
            RightEntry::None => None,
        };
        while let Some(pm) = cursor {
            out.push(pm);
            cursor = self.arena.partial_match(pm).next_in_memory;
        }
        out
    }

    // ------------------------------------------------------------------
    // Drives
    // ------------------------------------------------------------------

    /// Entry point for an alpha-memory match reaching a join.
    pub fn network_assert(&mut self, ctx: &mut DriveCtx<'_>, pm: PartialMatchId, join: JoinId) {
        if self.join(join).first_join {
            self.empty_drive(ctx, join, pm, DriveOp::Assert);
        } else {
            self.network_assert_right(ctx, pm, join, DriveOp::Assert);
        }
    }

    /// Filter a partial match through a join from the right.
    pub fn network_assert_right(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        rhs: PartialMatchId,
        join_id: JoinId,
        op: DriveOp,
    ) {
        if self.join(join_id).first_join {
            self.empty_drive(ctx, join_id, rhs, op);
            return;
        }
        let rhs_hash = self.arena.partial_match(rhs).hash_value;
        let candidates = self.left_bucket(join_id, rhs_hash);
        for lhs in candidates {
            {
                let pm = self.arena.partial_match(lhs);
                if pm.deleting {
                    continue;
                }
                if pm.hash_value != rhs_hash {
                    continue;
                }
                // An attached blocker means the negated or exists CE is
                // already resolved for this left match.
                if pm.marker.is_some() {
                    continue;
                }
            }
            self.join_mut(join_id).memory_compares += 1;
            let mut result = match self.eval_network_test(ctx, join_id, Some(lhs), Some(rhs)) {
                TestOutcome::Value(v) => v,
                TestOutcome::Abort => return,
            };
            if result {
                result = self.eval_secondary_test(ctx, join_id, Some(lhs), Some(rhs));
            }
            if !result {
                continue;
            }
            let join = self.join(join_id);
            if join.pattern_is_exists {
                self.arena.add_blocked_link(lhs, rhs);
                self.pp_drive(ctx, Some(lhs), None, join_id, op);
            } else if join.pattern_is_negated || join.join_from_the_right {
                self.arena.add_blocked_link(lhs, rhs);
                let children = self.arena.children_of(lhs);
                for child in children {
                    self.delete_partial_match(ctx, child, op);
                }
            } else {
                self.pp_drive(ctx, Some(lhs), Some(rhs), join_id, op);
            }
        }
    }

    /// Filter a partial match through a join from the left.
    pub fn network_assert_left(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        lhs: PartialMatchId,
        join_id: JoinId,
        op: DriveOp,
    ) {
        if op == DriveOp::Retract && self.arena.partial_match(lhs).deleting {
            return;
        }

        // The only action for the last join of a rule is to activate it.
        if let Some(rule) = self.join(join_id).rule_to_activate {
            let timetag = self.arena.partial_match(lhs).timetag;
            debug!(rule, pm = lhs.0, "terminal join completed");
            ctx.agenda.add_activation(rule, lhs, timetag);
            return;
        }

        // A test CE join has no right stream; the test runs against the
        // left match alone.
        if self.join(join_id).right_entry == RightEntry::None {
            let result = match self.eval_network_test(ctx, join_id, Some(lhs), None) {
                TestOutcome::Value(v) => v,
                TestOutcome::Abort => return,
            };
            if result {
                self.pp_drive(ctx, Some(lhs), None, join_id, op);
            }
            return;
        }

        let entry_hash = self.arena.partial_match(lhs).hash_value;
        let candidates = self.right_bucket(join_id, entry_hash);
        let (negated, exists, jftr) = {
            let join = self.join(join_id);
            (join.pattern_is_negated, join.pattern_is_exists, join.join_from_the_right)
        };

        for rhs in candidates {
            if self.arena.partial_match(rhs).deleting {
                continue;
            }
            self.join_mut(join_id).memory_compares += 1;
            let mut result = match self.eval_network_test(ctx, join_id, Some(lhs), Some(rhs)) {
                TestOutcome::Value(v) => v,
                TestOutcome::Abort => return,
            };
            if result && exists {
                result = self.eval_secondary_test(ctx, join_id, Some(lhs), Some(rhs));
            }
            if !result {
                continue;
            }
            if !negated && !exists && !jftr {
                self.pp_drive(ctx, Some(lhs), Some(rhs), join_id, op);
            } else if exists {
                // At most one partial match per left match for an exists
                // CE; the block link records the satisfying right match.
                self.arena.add_blocked_link(lhs, rhs);
                self.pp_drive(ctx, Some(lhs), None, join_id, op);
                return;
            } else {
                // One blocker suffices to suppress the left match.
                self.arena.add_blocked_link(lhs, rhs);
                break;
            }
        }

        if (negated || jftr)
            && !exists
            && self.arena.partial_match(lhs).marker.is_none()
        {
            if self.eval_secondary_test(ctx, join_id, Some(lhs), None) {
                self.pp_drive(ctx, Some(lhs), None, join_id, op);
            }
        }
    }

    /// Merge validated left and right matches and send the result to every
    /// child join.
    fn pp_drive(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
        join_id: JoinId,
        op: DriveOp,
    ) {
        let links = self.join(join_id).next_links.clone();
        for link in links {
            let linker = self.arena.merge(lhs, rhs, ctx.timetag);
            let hash_exprs = match link.enter_direction {
                Side::Lhs => self.join(link.target).left_hash.clone(),
                Side::Rhs => self.join(link.target).right_hash.clone(),
            };
            let hash_value = self.beta_memory_hash_value(ctx, &hash_exprs, Some(linker), None);
            self.update_beta_links(linker, lhs, rhs, link.target, hash_value, link.enter_direction);
            match link.enter_direction {
                Side::Lhs => self.network_assert_left(ctx, linker, link.target, op),
                Side::Rhs => self.network_assert_right(ctx, linker, link.target, op),
            }
        }
    }

    /// Drive an empty partial match to the next level of joins, used when
    /// an unblocked sentinel of a leading negated CE must propagate.
    fn epm_drive(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        parent: PartialMatchId,
        join_id: JoinId,
        op: DriveOp,
    ) {
        let links = self.join(join_id).next_links.clone();
        for link in links {
            let linker = self.arena.create_empty(ctx.timetag);
            self.update_beta_links(linker, Some(parent), None, link.target, 0, link.enter_direction);
            match link.enter_direction {
                Side::Lhs => self.network_assert_left(ctx, linker, link.target, op),
                Side::Rhs => self.network_assert_right(ctx, linker, link.target, op),
            }
        }
    }

    /// Handle an alpha match entering the first join of a rule, which has
    /// no left stream to scan.
    fn empty_drive(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        join_id: JoinId,
        rhs: PartialMatchId,
        op: DriveOp,
    ) {
        match self.eval_network_test(ctx, join_id, None, Some(rhs)) {
            TestOutcome::Value(true) => {}
            _ => return,
        }
        if !self.eval_secondary_test(ctx, join_id, None, Some(rhs)) {
            return;
        }

        let (negated, exists, jftr) = {
            let join = self.join(join_id);
            (join.pattern_is_negated, join.pattern_is_exists, join.join_from_the_right)
        };

        if negated || (jftr && !exists) {
            let Some(sentinel) = self.join(join_id).left_memory.beta[0] else {
                return;
            };
            if self.arena.partial_match(sentinel).marker.is_some() {
                return;
            }
            self.arena.add_blocked_link(sentinel, rhs);
            let children = self.arena.children_of(sentinel);
            for child in children {
                self.delete_partial_match(ctx, child, op);
            }
            return;
        }

        let exists_parent = if exists {
            let Some(sentinel) = self.join(join_id).left_memory.beta[0] else {
                return;
            };
            if self.arena.partial_match(sentinel).marker.is_some() {
                return;
            }
            self.arena.add_blocked_link(sentinel, rhs);
            Some(sentinel)
        } else {
            None
        };

        let links = self.join(join_id).next_links.clone();
        for link in links {
            // An exists first pattern generates at most one child match
            // with empty bindings; everything else hands down a copy of
            // the alpha match.
            let linker = if exists {
                self.arena.create_empty(ctx.timetag)
            } else {
                self.arena.copy_partial_match(rhs, ctx.timetag)
            };
            let hash_exprs = match link.enter_direction {
                Side::Lhs => self.join(link.target).left_hash.clone(),
                Side::Rhs => self.join(link.target).right_hash.clone(),
            };
            let hash_value = self.beta_memory_hash_value(ctx, &hash_exprs, Some(linker), None);
            let (lhs_parent, rhs_parent) =
                if exists { (exists_parent, None) } else { (None, Some(rhs)) };
            self.update_beta_links(
                linker,
                lhs_parent,
                rhs_parent,
                link.target,
                hash_value,
                link.enter_direction,
            );
            match link.enter_direction {
                Side::Lhs => self.network_assert_left(ctx, linker, link.target, op),
                Side::Rhs => self.network_assert_right(ctx, linker, link.target, op),
            }
        }
    }

    // ------------------------------------------------------------------
    // Retraction
    // ------------------------------------------------------------------

    /// Remove every alpha-level match of a vanishing entity and cascade.
    pub fn network_retract(&mut self, ctx: &mut DriveCtx<'_>, entity: EntityId) {
        let alpha_matches = self.entity_matches.remove(&entity).unwrap_or_default();
        for pm in alpha_matches {
            if self.arena.partial_match(pm).deleting {
                continue;
            }
            self.delete_partial_match(ctx, pm, DriveOp::Retract);
        }
    }

    /// Unlink a partial match everywhere it is threaded, cascade to its
    /// descendants, re-drive anything it was blocking, and queue it on the
    /// garbage list.
    pub fn delete_partial_match(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        pm_id: PartialMatchId,
        op: DriveOp,
    ) {
        if self.arena.partial_match(pm_id).deleting {
            return;
        }
        self.arena.partial_match_mut(pm_id).deleting = true;

        // Drop the activation anchored to this match, if any.
        ctx.agenda.remove_for_match(pm_id);

        // Withdraw logical support before storage goes away.
        if !self.arena.partial_match(pm_id).dependents.is_empty() {
            ctx.logical.remove_logical_support(&mut self.arena, pm_id);
        }

        // If this match was itself blocked, leave its blocker's list.
        if self.arena.partial_match(pm_id).marker.is_some() {
            self.arena.remove_blocked_link(pm_id);
        }

        // Matches this one was suppressing re-drive after the unlink.
        let unblocked = self.arena.blocked_by(pm_id);
        for blocked in &unblocked {
            self.arena.remove_blocked_link(*blocked);
        }

        // Cascade to descendants first so lineage stays coherent.
        let children = self.arena.children_of(pm_id);
        for child in children {
            self.delete_partial_match(ctx, child, op);
        }

        // Splice out of the owning memory.
        let owner = self.arena.partial_match(pm_id).owner;
        let header = self.arena.partial_match(pm_id).header;
        if let Some(header_id) = header {
            let Self { alpha, arena, headers, .. } = self;
            let header = headers[header_id.0 as usize].as_mut().expect("stale header index");
            alpha.remove(arena, header, pm_id);
        } else if let Some((join_id, side)) = owner {
            let Self { joins, arena, .. } = self;
            let join = joins[join_id.0 as usize].as_mut().expect("stale join index");
            let memory = match side {
                Side::Lhs => &mut join.left_memory,
                Side::Rhs => join.right_memory.as_mut().expect("stale right memory"),
            };
            memory.remove(arena, pm_id);
            if memory.count == 0 {
                memory.reset_if_empty();
            }
        }
        self.arena.unlink_lineage(pm_id);
        self.arena.return_partial_match(pm_id);

        // Now that the dead match is out of its memory, unblocked left
        // matches search for a replacement blocker and re-propagate when
        // none remains.
        for blocked in unblocked {
            if self.arena.partial_match(blocked).deleting {
                continue;
            }
            self.redrive_unblocked(ctx, blocked, op);
        }
    }

    /// A left match of a negated, exists, or join-from-the-right join has
    /// lost its blocker: find a replacement, or flip the match's state.
    fn redrive_unblocked(&mut self, ctx: &mut DriveCtx<'_>, lhs: PartialMatchId, op: DriveOp) {
        let Some((join_id, side)) = self.arena.partial_match(lhs).owner else {
            return;
        };
        if side != Side::Lhs {
            return;
        }
        let exists = self.join(join_id).pattern_is_exists;
        let hash = self.arena.partial_match(lhs).hash_value;
        let candidates = self.right_bucket(join_id, hash);

        let mut replacement = None;
        for rhs in candidates {
            if self.arena.partial_match(rhs).deleting {
                continue;
            }
            self.join_mut(join_id).memory_compares += 1;
            let mut result = match self.eval_network_test(ctx, join_id, Some(lhs), Some(rhs)) {
                TestOutcome::Value(v) => v,
                TestOutcome::Abort => return,
            };
            if result && exists {
                result = self.eval_secondary_test(ctx, join_id, Some(lhs), Some(rhs));
            }
            if result {
                replacement = Some(rhs);
                break;
            }
        }

        match (replacement, exists) {
            (Some(rhs), _) => {
                // Still suppressed (negated) or still satisfied (exists).
                self.arena.add_blocked_link(lhs, rhs);
            }
            (None, false) => {
                // The negation is now satisfied; propagate downstream.
                if self.eval_secondary_test(ctx, join_id, Some(lhs), None) {
                    if self.join(join_id).first_join {
                        self.epm_drive(ctx, lhs, join_id, op);
                    } else {
                        self.pp_drive(ctx, Some(lhs), None, join_id, op);
                    }
                }
            }
            (None, true) => {
                // The exists CE is no longer satisfied; its single child
                // match goes away.
                let children = self.arena.children_of(lhs);
                for child in children {
                    self.delete_partial_match(ctx, child, op);
                }
            }
        }
    }

    /// Walk back up the join chain to the designated logical join and
    /// return the partial match that carries the support.
    pub fn find_logical_bind(
        &self,
        terminal: JoinId,
        pm: PartialMatchId,
    ) -> Option<PartialMatchId> {
        let mut join = self.join(terminal).last_level?;
        let mut current = pm;
        loop {
            if self.join(join).logical_join {
                return Some(current);
            }
            current = self.arena.partial_match(current).left_parent?;
            join = self.join(join).last_level?;
        }
    }

    // ------------------------------------------------------------------
    // Alpha entry
    // ------------------------------------------------------------------

    /// Create an alpha match for `entity` under `header`, insert it at the
    /// bucket keyed by the header's right hash, and drive the entry joins.
    pub fn assert_to_header(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        header_id: HeaderId,
        entity: EntityId,
        markers: Vec<crate::partial_match::MultifieldMarker>,
    ) -> PartialMatchId {
        let hash_offset = self.compute_right_hash_value(ctx, header_id, entity);
        let (pm, _alpha) = self.arena.create_alpha(entity, markers, ctx.timetag);
        {
            let Self { alpha, arena, headers, .. } = self;
            let header = headers[header_id.0 as usize].as_mut().expect("stale header index");
            alpha.insert(arena, header, pm, hash_offset);
        }
        self.entity_matches.entry(entity).or_default().push(pm);
        let entry_joins = self.header(header_id).entry_joins.clone();
        for join in entry_joins {
            self.network_assert(ctx, pm, join);
        }
        pm
    }

    /// Flush every match from a join's beta memories, deleting cascades.
    pub fn flush_join_memories(&mut self, ctx: &mut DriveCtx<'_>, join_id: JoinId) {
        let mut matches = self.join(join_id).left_memory.iter_matches(&self.arena);
        if let Some(right) = self.join(join_id).right_memory.as_ref() {
            matches.extend(right.iter_matches(&self.arena));
        }
        for pm in matches {
            if !self.arena.partial_match(pm).deleting {
                self.delete_partial_match(ctx, pm, DriveOp::Retract);
            }
        }
    }

    /// Flush a header's alpha memory, deleting cascades.
    pub fn flush_alpha_memory(&mut self, ctx: &mut DriveCtx<'_>, header_id: HeaderId) {
        let matches = self.alpha.all_matches(self.header(header_id), &self.arena);
        for pm in matches {
            if !self.arena.partial_match(pm).deleting {
                let entity = self
                    .arena
                    .partial_match(pm)
                    .binds
                    .first()
                    .copied()
                    .flatten()
                    .map(|a| self.arena.alpha_match(a).entity);
                self.delete_partial_match(ctx, pm, DriveOp::Retract);
                if let Some(entity) = entity {
                    if let Some(list) = self.entity_matches.get_mut(&entity) {
                        list.retain(|candidate| *candidate != pm);
                    }
                }
            }
        }
    }

    /// Drop a retired header slot.
    pub fn release_header(&mut self, header_id: HeaderId) {
        if self.headers[header_id.0 as usize].take().is_some() {
            self.free_headers.push(header_id.0);
            for headers in self.fact_headers.values_mut() {
                headers.retain(|h| *h != header_id);
            }
        }
    }

    /// Insert a match into a join's memory and thread lineage; the
    /// install-time priming path uses this outside a drive.
    pub fn update_beta_links_public(
        &mut self,
        pm: PartialMatchId,
        lhs: Option<PartialMatchId>,
        rhs: Option<PartialMatchId>,
        join_id: JoinId,
        hash_value: u64,
        side: Side,
    ) {
        self.update_beta_links(pm, lhs, rhs, join_id, hash_value, side);
    }

    /// Drive an empty match downward; the install-time priming path uses
    /// this for a leading negated CE left unblocked by population.
    pub fn epm_drive_public(
        &mut self,
        ctx: &mut DriveCtx<'_>,
        parent: PartialMatchId,
        join_id: JoinId,
        op: DriveOp,
    ) {
        self.epm_drive(ctx, parent, join_id, op);
    }

    /// Drop a retired join slot.
    pub fn release_join(&mut self, join_id: JoinId) {
        if self.joins[join_id.0 as usize].take().is_some() {
            self.free_joins.push(join_id.0);
        }
    }
}
