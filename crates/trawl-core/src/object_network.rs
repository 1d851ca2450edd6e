//! The object pattern sub-network.
//!
//! Instances match through a discrimination tree specialized for slot
//! patterns: nodes test one field of one slot, slots are visited in
//! slot-id order, and multifield (`$`) variables enumerate admissible
//! splits, recording markers as they go. Terminals carry class and slot
//! bitmaps; a class keeps links to the terminals that can match it, so an
//! edit touches only the relevant corner of the tree. A monotonic match
//! time tag marks the nodes reachable for the current operation, and a
//! deferred match-action queue absorbs edits arriving while a join
//! operation is in progress or a delay window is open.

use std::collections::VecDeque;

use ahash::AHashMap;
use roaring::RoaringBitmap;
use tracing::{debug, trace};
use trawl_types::Value;

use crate::eval::{self, EvalScope, TestExpr};
use crate::join_network::{DriveCtx, ReteNetwork};
use crate::partial_match::MultifieldMarker;
use crate::types::{ClassId, EntityId, HeaderId, ObjAlphaId, ObjNodeId, SlotId};

/// One field-level test within a slot pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    /// Test of a single field (or of the whole slot when it is the only
    /// spec and `whole` is set on the slot).
    Single { test: Option<TestExpr> },
    /// A `$`-variable segment, optionally constrained.
    Segment { test: Option<TestExpr> },
}

/// Compiled tests for one slot of an object pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPatternSpec {
    pub slot: SlotId,
    /// Treat the slot value as one opaque field instead of enumerating.
    pub whole: bool,
    pub fields: Vec<FieldSpec>,
}

/// A compiled object pattern ready for tree insertion.
#[derive(Debug, Clone)]
pub struct ObjectPatternSpec {
    pub classes: Vec<ClassId>,
    /// Slot specs in ascending slot-id order.
    pub slots: Vec<SlotPatternSpec>,
}

/// Node in the object discrimination tree.
#[derive(Debug)]
pub struct ObjectPatternNode {
    pub id: ObjNodeId,
    pub slot: SlotId,
    /// Zero for whole-slot nodes, otherwise the 1-based field position.
    pub which_field: u16,
    pub whole: bool,
    pub multifield_node: bool,
    /// Single-field tests remaining after this node within the slot.
    pub leave_fields: u16,
    pub end_slot: bool,
    pub network_test: Option<TestExpr>,
    pub alpha_nodes: Vec<ObjAlphaId>,
    pub last_level: Option<ObjNodeId>,
    pub next_level: Vec<ObjNodeId>,
    /// Hashed dispatch for constant-equality children.
    pub selector_children: AHashMap<Value, ObjNodeId>,
    pub match_time_tag: u64,
    /// Constant-node short-circuit: set while one enumeration pass has
    /// already traversed this node at the current field position.
    pub blocked: bool,
}

/// Terminal of the object pattern network, mapped to a pattern header.
#[derive(Debug)]
pub struct ObjectAlphaNode {
    pub id: ObjAlphaId,
    pub class_bmp: RoaringBitmap,
    pub slot_bmp: RoaringBitmap,
    pub header: HeaderId,
    pub pattern_node: ObjNodeId,
    pub match_time_tag: u64,
    pub use_count: u32,
}

/// Deferred match operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjAction {
    Assert,
    Retract,
    Modify,
}

/// Queued deferred match operation.
#[derive(Debug)]
pub struct ObjectMatchAction {
    pub action: ObjAction,
    pub instance: EntityId,
    /// Modified slot ids; `None` outside modify actions.
    pub slot_ids: Option<RoaringBitmap>,
}

/// The object pattern network and its deferred-action machinery.
#[derive(Debug, Default)]
pub struct ObjectNetwork {
    nodes: Vec<Option<ObjectPatternNode>>,
    free_nodes: Vec<u32>,
    roots: Vec<ObjNodeId>,
    alphas: Vec<Option<ObjectAlphaNode>>,
    free_alphas: Vec<u32>,
    header_to_alpha: AHashMap<HeaderId, ObjAlphaId>,
    /// Monotonic tag stamped onto nodes reachable by the current
    /// operation.
    pub current_tag: u64,
    /// Open batch window: edits queue instead of matching.
    pub delay: bool,
    /// Set while a drive is running; edits arriving then are queued.
    pub join_op_in_progress: bool,
    queue: VecDeque<ObjectMatchAction>,
}

impl ObjectNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: ObjNodeId) -> &ObjectPatternNode {
        self.nodes[id.0 as usize].as_ref().expect("stale object node index")
    }

    pub fn node_mut(&mut self, id: ObjNodeId) -> &mut ObjectPatternNode {
        self.nodes[id.0 as usize].as_mut().expect("stale object node index")
    }

    pub fn alpha(&self, id: ObjAlphaId) -> &ObjectAlphaNode {
        self.alphas[id.0 as usize].as_ref().expect("stale object alpha index")
    }

    pub fn alpha_mut(&mut self, id: ObjAlphaId) -> &mut ObjectAlphaNode {
        self.alphas[id.0 as usize].as_mut().expect("stale object alpha index")
    }

    pub fn alpha_for_header(&self, header: HeaderId) -> Option<ObjAlphaId> {
        self.header_to_alpha.get(&header).copied()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    fn insert_node(&mut self, node: ObjectPatternNode) -> ObjNodeId {
        if let Some(slot) = self.free_nodes.pop() {
            let id = ObjNodeId(slot);
            self.nodes[slot as usize] = Some(ObjectPatternNode { id, ..node });
            id
        } else {
            let id = ObjNodeId(self.nodes.len() as u32);
            self.nodes.push(Some(ObjectPatternNode { id, ..node }));
            id
        }
    }

    /// Install a compiled pattern, sharing tree prefixes, and terminate it
    /// with an alpha node mapped to `header`.
    pub fn install_pattern(&mut self, spec: &ObjectPatternSpec, header: HeaderId) -> ObjAlphaId {
        let mut parent: Option<ObjNodeId> = None;
        let mut slot_bmp = RoaringBitmap::new();

        for slot_spec in &spec.slots {
            slot_bmp.insert(slot_spec.slot);
            let field_total = slot_spec.fields.len();
            for (field_index, field) in slot_spec.fields.iter().enumerate() {
                let end_slot = field_index + 1 == field_total;
                let leave_fields = slot_spec.fields[field_index + 1..]
                    .iter()
                    .filter(|f| matches!(f, FieldSpec::Single { .. }))
                    .count() as u16;
                let (multifield_node, test) = match field {
                    FieldSpec::Single { test } => (false, test.clone()),
                    FieldSpec::Segment { test } => (true, test.clone()),
                };
                let candidate = ObjectPatternNode {
                    id: ObjNodeId(0),
                    slot: slot_spec.slot,
                    which_field: if slot_spec.whole { 0 } else { (field_index + 1) as u16 },
                    whole: slot_spec.whole,
                    multifield_node,
                    leave_fields,
                    end_slot,
                    network_test: test,
                    alpha_nodes: Vec::new(),
                    last_level: parent,
                    next_level: Vec::new(),
                    selector_children: AHashMap::new(),
                    match_time_tag: 0,
                    blocked: false,
                };
                let node_id = self.find_or_insert_child(parent, candidate);
                // Constant equality children become selector entries on
                // their parent for hashed dispatch.
                if let Some(parent_id) = parent {
                    if let Some(constant) = selector_key(self.node(node_id)) {
                        self.node_mut(parent_id).selector_children.insert(constant, node_id);
                    }
                }
                parent = Some(node_id);
            }
        }

        let pattern_node = parent.expect("object pattern with no slot tests");
        let mut class_bmp = RoaringBitmap::new();
        for class in &spec.classes {
            class_bmp.insert(*class);
        }
        let alpha = ObjectAlphaNode {
            id: ObjAlphaId(0),
            class_bmp,
            slot_bmp,
            header,
            pattern_node,
            match_time_tag: 0,
            use_count: 1,
        };
        let alpha_id = if let Some(slot) = self.free_alphas.pop() {
            let id = ObjAlphaId(slot);
            self.alphas[slot as usize] = Some(ObjectAlphaNode { id, ..alpha });
            id
        } else {
            let id = ObjAlphaId(self.alphas.len() as u32);
            self.alphas.push(Some(ObjectAlphaNode { id, ..alpha }));
            id
        };
        self.node_mut(pattern_node).alpha_nodes.push(alpha_id);
        self.header_to_alpha.insert(header, alpha_id);
        debug!(alpha = alpha_id.0, header = header.0, "object pattern installed");
        alpha_id
    }

    fn find_or_insert_child(
        &mut self,
        parent: Option<ObjNodeId>,
        candidate: ObjectPatternNode,
    ) -> ObjNodeId {
        let siblings: Vec<ObjNodeId> = match parent {
            Some(p) => self.node(p).next_level.clone(),
            None => self.roots.clone(),
        };
        for sibling in siblings {
            let node = self.node(sibling);
            if node.slot == candidate.slot
                && node.which_field == candidate.which_field
                && node.whole == candidate.whole
                && node.multifield_node == candidate.multifield_node
                && node.end_slot == candidate.end_slot
                && node.network_test == candidate.network_test
            {
                return sibling;
            }
        }
        let id = self.insert_node(candidate);
        match parent {
            Some(p) => self.node_mut(p).next_level.push(id),
            None => self.roots.push(id),
        }
        id
    }

    /// Remove an alpha node and prune its now-unused pattern chain.
    pub fn remove_alpha(&mut self, alpha_id: ObjAlphaId) {
        let Some(alpha) = self.alphas[alpha_id.0 as usize].take() else {
            return;
        };
        self.free_alphas.push(alpha_id.0);
        self.header_to_alpha.remove(&alpha.header);
        let mut cursor = Some(alpha.pattern_node);
        self.node_mut(alpha.pattern_node).alpha_nodes.retain(|a| *a != alpha_id);
        while let Some(node_id) = cursor {
            let (prune, parent) = {
                let node = self.node(node_id);
                (node.alpha_nodes.is_empty() && node.next_level.is_empty(), node.last_level)
            };
            if !prune {
                break;
            }
            match parent {
                Some(p) => {
                    let parent_node = self.node_mut(p);
                    parent_node.next_level.retain(|child| *child != node_id);
                    parent_node.selector_children.retain(|_, child| *child != node_id);
                }
                None => self.roots.retain(|root| *root != node_id),
            }
            self.nodes[node_id.0 as usize] = None;
            self.free_nodes.push(node_id.0);
            cursor = parent;
        }
    }

    // ------------------------------------------------------------------
    // Match time tagging
    // ------------------------------------------------------------------

    /// Advance the operation tag, resetting every tag and restarting the
    /// numbering if it would overflow.
    fn next_tag(&mut self) -> u64 {
        if self.current_tag == u64::MAX {
            self.reset_match_time_tags();
        }
        self.current_tag += 1;
        self.current_tag
    }

    /// Zero all tags. The walk stops at parents already bearing the reset
    /// value, so shared prefixes are visited once.
    fn reset_match_time_tags(&mut self) {
        self.current_tag = 0;
        for alpha in self.alphas.iter_mut().flatten() {
            alpha.match_time_tag = 0;
        }
        let ids: Vec<ObjNodeId> = self
            .alphas
            .iter()
            .flatten()
            .map(|a| a.pattern_node)
            .collect();
        for start in ids {
            let mut cursor = Some(start);
            while let Some(node_id) = cursor {
                let node = self.node_mut(node_id);
                if node.match_time_tag == 0 {
                    break;
                }
                node.match_time_tag = 0;
                cursor = node.last_level;
            }
        }
    }

    /// Tag the terminals relevant to this operation and their ancestors.
    /// Returns the tag, or `None` when nothing can match.
    fn mark_network(
        &mut self,
        class_alphas: &[ObjAlphaId],
        changed_slots: Option<&RoaringBitmap>,
    ) -> Option<u64> {
        let tag = self.next_tag();
        let mut any = false;
        for alpha_id in class_alphas {
            let alpha = self.alpha(*alpha_id);
            if let Some(changed) = changed_slots {
                if alpha.slot_bmp.intersection_len(changed) == 0 {
                    continue;
                }
            }
            any = true;
            let start = alpha.pattern_node;
            self.alpha_mut(*alpha_id).match_time_tag = tag;
            let mut cursor = Some(start);
            while let Some(node_id) = cursor {
                let node = self.node_mut(node_id);
                if node.match_time_tag == tag {
                    break;
                }
                node.match_time_tag = tag;
                cursor = node.last_level;
            }
        }
        if any { Some(tag) } else { None }
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Run the discrimination tree for one instance, producing alpha
    /// matches and driving the join network. Only nodes bearing `tag` are
    /// visited.
    pub fn object_pattern_match(
        &mut self,
        rete: &mut ReteNetwork,
        ctx: &mut DriveCtx<'_>,
        entity: EntityId,
        class: ClassId,
        tag: u64,
    ) {
        let roots = self.roots.clone();
        let mut markers = Vec::new();
        let mut skip_from: Option<(crate::types::SlotId, u16)> = None;
        for root in roots {
            self.visit_sibling(
                rete, ctx, entity, class, tag, root, 0, &mut markers, &mut skip_from,
            );
        }
    }

    /// Visit one sibling, honoring the constant-test short-circuit: once
    /// a constant test on a field succeeds, the remaining sibling
    /// constants on the same (slot, field) cannot match and are skipped.
    #[allow(clippy::too_many_arguments)]
    fn visit_sibling(
        &mut self,
        rete: &mut ReteNetwork,
        ctx: &mut DriveCtx<'_>,
        entity: EntityId,
        class: ClassId,
        tag: u64,
        node_id: ObjNodeId,
        position: usize,
        markers: &mut Vec<MultifieldMarker>,
        skip_from: &mut Option<(crate::types::SlotId, u16)>,
    ) {
        let (slot, which_field, is_constant) = {
            let node = self.node(node_id);
            (node.slot, node.which_field, selector_key(node).is_some())
        };
        if is_constant && *skip_from == Some((slot, which_field)) {
            return;
        }
        self.walk(rete, ctx, entity, class, tag, node_id, position, markers);
        if self.node(node_id).blocked {
            self.node_mut(node_id).blocked = false;
            *skip_from = Some((slot, which_field));
        } else if *skip_from == Some((slot, which_field)) {
            // A non-constant sibling ends the skip run.
        } else {
            *skip_from = None;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        rete: &mut ReteNetwork,
        ctx: &mut DriveCtx<'_>,
        entity: EntityId,
        class: ClassId,
        tag: u64,
        node_id: ObjNodeId,
        position: usize,
        markers: &mut Vec<MultifieldMarker>,
    ) {
        if self.node(node_id).match_time_tag != tag {
            return;
        }
        let (slot, whole, multifield) = {
            let node = self.node(node_id);
            (node.slot, node.whole, node.multifield_node)
        };
        let Some(slot_value) = ctx.wm.slot_value(entity, slot).cloned() else {
            return;
        };

        if whole {
            if !self.eval_field_test(rete, ctx, node_id, &slot_value) {
                return;
            }
            self.descend(rete, ctx, entity, class, tag, node_id, markers);
            return;
        }

        let fields: Vec<Value> = match &slot_value {
            Value::Multifield(items) => items.clone(),
            single => vec![single.clone()],
        };

        if multifield {
            let node = self.node(node_id);
            let remaining = fields.len().saturating_sub(position);
            let leave = node.leave_fields as usize;
            let end_slot = node.end_slot;
            if remaining < leave {
                return;
            }
            let which_field = node.which_field;
            // An end segment must consume the rest of the slot; interior
            // segments enumerate every admissible split.
            let ranges: Vec<usize> =
                if end_slot { vec![remaining] } else { (0..=remaining - leave).collect() };
            for range in ranges {
                let segment = Value::Multifield(fields[position..position + range].to_vec());
                if !self.eval_field_test(rete, ctx, node_id, &segment) {
                    continue;
                }
                markers.push(MultifieldMarker {
                    which_field,
                    slot,
                    start_position: position,
                    range,
                });
                if end_slot {
                    self.descend(rete, ctx, entity, class, tag, node_id, markers);
                } else {
                    self.walk_children(
                        rete,
                        ctx,
                        entity,
                        class,
                        tag,
                        node_id,
                        position + range,
                        markers,
                        Some(&fields),
                    );
                }
                markers.pop();
            }
            return;
        }

        // Single-field node.
        if position >= fields.len() {
            return;
        }
        let value = fields[position].clone();
        if !self.eval_field_test(rete, ctx, node_id, &value) {
            return;
        }
        // A successful constant test marks the node so the sibling loop
        // can skip the other constants on this field.
        if selector_key(self.node(node_id)).is_some() {
            self.node_mut(node_id).blocked = true;
        }
        let end_slot = self.node(node_id).end_slot;
        if end_slot {
            // The pattern must account for every field of the slot.
            if position + 1 != fields.len() {
                return;
            }
            self.descend(rete, ctx, entity, class, tag, node_id, markers);
        } else {
            self.walk_children(
                rete,
                ctx,
                entity,
                class,
                tag,
                node_id,
                position + 1,
                markers,
                Some(&fields),
            );
        }
    }

    /// Visit an end-slot node's terminals, then its next-slot children.
    fn descend(
        &mut self,
        rete: &mut ReteNetwork,
        ctx: &mut DriveCtx<'_>,
        entity: EntityId,
        class: ClassId,
        tag: u64,
        node_id: ObjNodeId,
        markers: &mut Vec<MultifieldMarker>,
    ) {
        let alpha_ids = self.node(node_id).alpha_nodes.clone();
        for alpha_id in alpha_ids {
            let alpha = self.alpha(alpha_id);
            if alpha.match_time_tag != tag || !alpha.class_bmp.contains(class) {
                continue;
            }
            let header = alpha.header;
            trace!(entity = entity.0, header = header.0, "object alpha match");
            rete.assert_to_header(ctx, header, entity, markers.clone());
        }
        self.walk_children(rete, ctx, entity, class, tag, node_id, 0, markers, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_children(
        &mut self,
        rete: &mut ReteNetwork,
        ctx: &mut DriveCtx<'_>,
        entity: EntityId,
        class: ClassId,
        tag: u64,
        node_id: ObjNodeId,
        position: usize,
        markers: &mut Vec<MultifieldMarker>,
        fields: Option<&[Value]>,
    ) {
        // Hashed selector dispatch first: same-slot children testing a
        // constant are reached by value lookup instead of a sibling scan.
        let mut dispatched = None;
        if let Some(fields) = fields {
            if let Some(value) = fields.get(position) {
                if let Some(child) = self.node(node_id).selector_children.get(value).copied() {
                    dispatched = Some(child);
                    self.walk(rete, ctx, entity, class, tag, child, position, markers);
                    self.node_mut(child).blocked = false;
                }
            }
        }
        let children = self.node(node_id).next_level.clone();
        let mut skip_from: Option<(crate::types::SlotId, u16)> = None;
        for child in children {
            if dispatched == Some(child) {
                continue;
            }
            // Same-slot constant children were either dispatched above or
            // cannot match the current field.
            if fields.is_some()
                && self.node(node_id).selector_children.values().any(|c| *c == child)
            {
                continue;
            }
            let child_position =
                if self.node(child).slot == self.node(node_id).slot { position } else { 0 };
            self.visit_sibling(
                rete,
                ctx,
                entity,
                class,
                tag,
                child,
                child_position,
                markers,
                &mut skip_from,
            );
        }
    }

    fn eval_field_test(
        &self,
        rete: &ReteNetwork,
        ctx: &DriveCtx<'_>,
        node_id: ObjNodeId,
        value: &Value,
    ) -> bool {
        let Some(test) = &self.node(node_id).network_test else {
            return true;
        };
        let scope = EvalScope {
            arena: &rete.arena,
            wm: ctx.wm,
            functions: ctx.functions,
            lhs: None,
            rhs: None,
            rhs_entity: None,
            current_field: Some(value),
        };
        eval::evaluate_bool(test, &scope).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Network actions and the deferred queue
    // ------------------------------------------------------------------

    /// Entry point for object edits. Matches immediately unless a delay
    /// window is open or a join operation is already running, in which
    /// case the edit is queued. Returns true when the action was queued;
    /// the caller increments the instance's busy counter.
    pub fn should_queue(&self) -> bool {
        self.delay || self.join_op_in_progress
    }

    /// Append an action to the queue, merging against pending actions for
    /// the same instance:
    ///
    /// assert + retract annihilate; assert absorbs modify; modify merges
    /// modify bitmaps; retract replaces modify in place; a fresh retract
    /// inserts ahead of pending asserts and modifies so retractions
    /// process first. Returns the net change to the instance's busy count.
    pub fn queue_match_action(
        &mut self,
        action: ObjAction,
        instance: EntityId,
        slot_ids: Option<RoaringBitmap>,
    ) -> i32 {
        let mut last_retract: Option<usize> = None;
        for index in 0..self.queue.len() {
            let pending = &mut self.queue[index];
            if pending.instance == instance {
                match (pending.action, action) {
                    (ObjAction::Assert, ObjAction::Retract) => {
                        // The object came and went before the network saw
                        // it.
                        self.queue.remove(index);
                        return -1;
                    }
                    (ObjAction::Assert, ObjAction::Modify) => return 0,
                    (ObjAction::Modify, ObjAction::Modify) => {
                        if let (Some(existing), Some(new_bits)) =
                            (pending.slot_ids.as_mut(), slot_ids)
                        {
                            *existing |= new_bits;
                        }
                        return 0;
                    }
                    (ObjAction::Modify, ObjAction::Retract) => {
                        pending.action = ObjAction::Retract;
                        pending.slot_ids = None;
                        return 0;
                    }
                    _ => return 0,
                }
            }
            if pending.action == ObjAction::Retract {
                last_retract = Some(index);
            }
        }

        let record = ObjectMatchAction { action, instance, slot_ids };
        if action == ObjAction::Retract {
            let at = last_retract.map(|i| i + 1).unwrap_or(0);
            self.queue.insert(at, record);
        } else {
            self.queue.push_back(record);
        }
        1
    }

    /// Take the queued actions for a drain pass.
    pub fn drain_queue(&mut self) -> Vec<ObjectMatchAction> {
        self.queue.drain(..).collect()
    }
}

/// The constant a node's test compares the current field against, when the
/// node is a pure equality test, the shape eligible for selector
/// dispatch.
fn selector_key(node: &ObjectPatternNode) -> Option<Value> {
    if node.multifield_node || node.whole {
        return None;
    }
    match &node.network_test {
        Some(TestExpr::Cmp { op: crate::types::CompareOp::Eq, left, right }) => {
            match (left.as_ref(), right.as_ref()) {
                (TestExpr::CurrentField, TestExpr::Constant(v)) => Some(v.clone()),
                (TestExpr::Constant(v), TestExpr::CurrentField) => Some(v.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Mark phase result handed back to the engine.
pub struct MarkOutcome {
    pub tag: u64,
}

impl ObjectNetwork {
    /// Tag the network for an assert or modify of `entity`. `changed` is
    /// the modified-slot bitmap for modifies.
    pub fn mark_for(
        &mut self,
        class_alphas: &[ObjAlphaId],
        changed: Option<&RoaringBitmap>,
    ) -> Option<MarkOutcome> {
        self.mark_network(class_alphas, changed).map(|tag| MarkOutcome { tag })
    }

    /// Headers whose terminals intersect the changed-slot bitmap, used to
    /// retract the stale half of a modify.
    pub fn headers_touching(
        &self,
        class_alphas: &[ObjAlphaId],
        changed: Option<&RoaringBitmap>,
    ) -> Vec<HeaderId> {
        let mut out = Vec::new();
        for alpha_id in class_alphas {
            let alpha = self.alpha(*alpha_id);
            if let Some(changed) = changed {
                if alpha.slot_bmp.intersection_len(changed) == 0 {
                    continue;
                }
            }
            out.push(alpha.header);
        }
        out
    }
}
