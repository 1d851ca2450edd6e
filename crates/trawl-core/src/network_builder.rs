//! Rule installation: compiling condition elements into the network.
//!
//! Each pattern CE resolves to a pattern-node header (fact side) or an
//! object-tree terminal (object side), and to one join in the rule's
//! chain. Variable equalities across patterns become join network tests
//! plus left/right hash expression pairs, so equality joins index their
//! memories instead of scanning. Identical headers and join prefixes are
//! shared between rules; a dedicated terminal join carries the rule to
//! activate. Installing a rule into a non-empty working memory primes the
//! new joins from existing matches so incremental equals batch.

use ahash::AHashMap;
use tracing::{debug, info};

use crate::beta_memory::BetaMemory;
use crate::error::{TrawlError, TrawlResult};
use crate::eval::TestExpr;
use crate::join_network::{DriveCtx, JoinLink, JoinNode, ReteNetwork, RightEntry};
use crate::object_network::{FieldSpec, ObjectNetwork, ObjectPatternSpec, SlotPatternSpec};
use crate::types::{
    CompareOp, ConditionElement, DriveOp, HeaderId, JoinId, ObjAlphaId, PartialMatchId,
    PatternCondition, PatternTarget, Rule, RuleAction, RuleExpr, Side, SlotConstraint, SlotId,
    SlotTest,
};
use crate::working_memory::WorkingMemory;

/// A rule's compiled action.
#[derive(Debug, Clone)]
pub enum CompiledAction {
    Assert { template: String, slots: Vec<(String, TestExpr)> },
    Retract { pattern: usize },
}

/// Everything the engine keeps per installed rule.
#[derive(Debug)]
pub struct InstalledRule {
    pub rule: Rule,
    /// Joins of this rule in creation order, terminal last.
    pub joins: Vec<JoinId>,
    pub headers: Vec<HeaderId>,
    pub obj_alphas: Vec<ObjAlphaId>,
    pub terminal: JoinId,
    /// Whether a leading logical group wires support for RHS asserts.
    pub logical: bool,
    pub actions: Vec<CompiledAction>,
}

/// Work the engine must do after construction to bring the new joins up
/// to date with existing working memory.
#[derive(Debug, Default)]
pub struct PrimePlan {
    /// Headers created by this install, in creation order.
    pub new_headers: Vec<HeaderId>,
    /// First joins whose pattern is negated or existential and which need
    /// a left-prime sentinel before their header populates.
    pub sentinel_joins: Vec<JoinId>,
    /// Replay source for a chain grafted under a shared prefix: (existing
    /// sibling join, first new join).
    pub shared_replay: Option<(JoinId, JoinId)>,
}

#[derive(Debug, Clone, Copy)]
struct VarBinding {
    pattern: u16,
    slot: SlotId,
    /// Marker ordinal for `$`-segment bindings.
    marker: Option<u16>,
}

/// Where an expression is being resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ResolveContext {
    /// Alpha-level test of a fact pattern: slot reads go to the candidate
    /// entity.
    FactAlpha,
    /// Field test inside the object tree: `SelfValue` is the cursor.
    ObjectField,
    /// Join test: the current pattern is the right side.
    Join { current_pattern: u16, current_slot: Option<SlotId> },
    /// Test CE: only prior bindings are visible.
    TestCe,
}

pub struct RuleCompiler<'a> {
    rete: &'a mut ReteNetwork,
    objects: &'a mut ObjectNetwork,
    wm: &'a mut WorkingMemory,
    rule: &'a Rule,
    vars: AHashMap<String, VarBinding>,
    plan: PrimePlan,
    joins: Vec<JoinId>,
    headers: Vec<HeaderId>,
    obj_alphas: Vec<ObjAlphaId>,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(
        rete: &'a mut ReteNetwork,
        objects: &'a mut ObjectNetwork,
        wm: &'a mut WorkingMemory,
        rule: &'a Rule,
    ) -> Self {
        Self {
            rete,
            objects,
            wm,
            rule,
            vars: AHashMap::new(),
            plan: PrimePlan::default(),
            joins: Vec::new(),
            headers: Vec::new(),
            obj_alphas: Vec::new(),
        }
    }

    /// Compile and install the rule's left-hand side and actions.
    pub fn install(mut self) -> TrawlResult<(InstalledRule, PrimePlan)> {
        if self.rule.conditions.is_empty() {
            return Err(TrawlError::rule_named("rule has no conditions", &self.rule.name));
        }

        // A leading logical group flattens into the chain; the join
        // consuming its last element is the rule's logical join.
        let mut elements: Vec<&ConditionElement> = Vec::new();
        let mut logical_len = 0usize;
        for (index, element) in self.rule.conditions.iter().enumerate() {
            if let ConditionElement::Logical(inner) = element {
                if index != 0 {
                    return Err(TrawlError::rule_named(
                        "logical group must be the first condition",
                        &self.rule.name,
                    ));
                }
                logical_len = inner.len();
                elements.extend(inner.iter());
            } else {
                elements.push(element);
            }
        }

        let mut prev_join: Option<JoinId> = None;
        for (index, element) in elements.iter().enumerate() {
            let depth = (index + 1) as u16;
            let join = match element {
                ConditionElement::Pattern(p) => {
                    self.compile_pattern_join(p, depth, prev_join, false, false)?
                }
                ConditionElement::Not(p) => {
                    self.compile_pattern_join(p, depth, prev_join, true, false)?
                }
                ConditionElement::Exists(p) => {
                    self.compile_pattern_join(p, depth, prev_join, false, true)?
                }
                ConditionElement::NotAll(group) => {
                    self.compile_group_join(group, depth, prev_join, true)?
                }
                ConditionElement::ExistsAll(group) => {
                    self.compile_group_join(group, depth, prev_join, false)?
                }
                ConditionElement::Test(expr) => self.compile_test_join(expr, depth, prev_join)?,
                ConditionElement::Logical(_) => {
                    return Err(TrawlError::rule_named(
                        "nested logical groups are not supported",
                        &self.rule.name,
                    ));
                }
            };
            if logical_len > 0 && index + 1 == logical_len {
                self.rete.join_mut(join).logical_join = true;
            }
            prev_join = Some(join);
        }

        // Dedicated terminal join: completion is activation.
        let last = prev_join.expect("non-empty chain");
        let terminal = self.rete.add_join(JoinNode {
            id: JoinId(0),
            depth: (elements.len() + 1) as u16,
            first_join: false,
            logical_join: false,
            join_from_the_right: false,
            pattern_is_negated: false,
            pattern_is_exists: false,
            network_test: None,
            secondary_network_test: None,
            left_hash: Vec::new(),
            right_hash: Vec::new(),
            right_entry: RightEntry::None,
            last_level: Some(last),
            left_memory: BetaMemory::unhashed(false),
            right_memory: None,
            next_links: Vec::new(),
            rule_to_activate: Some(self.rule.id),
            use_count: 1,
            rules: vec![self.rule.id],
            pattern_index: elements.len() + 1,
            memory_compares: 0,
        });
        self.joins.push(terminal);
        self.rete
            .join_mut(last)
            .next_links
            .push(JoinLink { enter_direction: Side::Lhs, target: terminal });

        let actions = self.compile_actions()?;

        info!(
            rule = %self.rule.name,
            joins = self.joins.len(),
            headers = self.headers.len(),
            "rule installed"
        );
        let installed = InstalledRule {
            rule: self.rule.clone(),
            joins: self.joins,
            headers: self.headers,
            obj_alphas: self.obj_alphas,
            terminal,
            logical: logical_len > 0,
            actions,
        };
        Ok((installed, self.plan))
    }

    // ------------------------------------------------------------------
    // Pattern compilation
    // ------------------------------------------------------------------

    fn compile_pattern_join(
        &mut self,
        pattern: &PatternCondition,
        depth: u16,
        prev_join: Option<JoinId>,
        negated: bool,
        exists: bool,
    ) -> TrawlResult<JoinId> {
        let local_only = negated || exists;
        let compiled = self.compile_pattern(pattern, depth - 1, local_only)?;
        self.attach_pattern_join(compiled, depth, prev_join, negated, exists, false)
    }

    /// Compile a `not`/`exists` conjunction as a subordinate chain feeding
    /// a join from the right.
    fn compile_group_join(
        &mut self,
        group: &[PatternCondition],
        depth: u16,
        prev_join: Option<JoinId>,
        negated: bool,
    ) -> TrawlResult<JoinId> {
        if group.is_empty() {
            return Err(TrawlError::rule_named("empty condition group", &self.rule.name));
        }
        // The subordinate chain binds variables local to the group; outer
        // bindings are not visible inside it.
        let saved_vars = std::mem::take(&mut self.vars);
        let mut sub_prev: Option<JoinId> = None;
        for (index, pattern) in group.iter().enumerate() {
            let sub_depth = (index + 1) as u16;
            let compiled = self.compile_pattern(pattern, sub_depth - 1, false)?;
            let join =
                self.attach_pattern_join(compiled, sub_depth, sub_prev, false, false, true)?;
            sub_prev = Some(join);
        }
        self.vars = saved_vars;
        let subordinate = sub_prev.expect("non-empty group");

        // Outer join: right input is the subordinate chain's beta output.
        let outer = self.rete.add_join(JoinNode {
            id: JoinId(0),
            depth,
            first_join: prev_join.is_none(),
            logical_join: false,
            join_from_the_right: true,
            pattern_is_negated: negated,
            pattern_is_exists: !negated,
            network_test: None,
            secondary_network_test: None,
            left_hash: Vec::new(),
            right_hash: Vec::new(),
            right_entry: RightEntry::Join(subordinate),
            last_level: prev_join,
            left_memory: if prev_join.is_none() {
                BetaMemory::unhashed(false)
            } else {
                BetaMemory::hashed(false)
            },
            right_memory: Some(BetaMemory::hashed(true)),
            next_links: Vec::new(),
            rule_to_activate: None,
            use_count: 1,
            rules: vec![self.rule.id],
            pattern_index: depth as usize,
            memory_compares: 0,
        });
        self.joins.push(outer);
        self.rete
            .join_mut(subordinate)
            .next_links
            .push(JoinLink { enter_direction: Side::Rhs, target: outer });
        if let Some(prev) = prev_join {
            self.rete
                .join_mut(prev)
                .next_links
                .push(JoinLink { enter_direction: Side::Lhs, target: outer });
        } else {
            self.plan.sentinel_joins.push(outer);
        }
        Ok(outer)
    }

    fn compile_test_join(
        &mut self,
        expr: &RuleExpr,
        depth: u16,
        prev_join: Option<JoinId>,
    ) -> TrawlResult<JoinId> {
        if prev_join.is_none() {
            return Err(TrawlError::rule_named(
                "a test CE cannot open a rule",
                &self.rule.name,
            ));
        }
        let test = self.resolve_expr(expr, ResolveContext::TestCe)?;
        let join = self.rete.add_join(JoinNode {
            id: JoinId(0),
            depth,
            first_join: false,
            logical_join: false,
            join_from_the_right: false,
            pattern_is_negated: false,
            pattern_is_exists: false,
            network_test: Some(test),
            secondary_network_test: None,
            left_hash: Vec::new(),
            right_hash: Vec::new(),
            right_entry: RightEntry::None,
            last_level: prev_join,
            left_memory: BetaMemory::hashed(false),
            right_memory: None,
            next_links: Vec::new(),
            rule_to_activate: None,
            use_count: 1,
            rules: vec![self.rule.id],
            pattern_index: depth as usize,
            memory_compares: 0,
        });
        self.joins.push(join);
        self.rete
            .join_mut(prev_join.expect("checked above"))
            .next_links
            .push(JoinLink { enter_direction: Side::Lhs, target: join });
        Ok(join)
    }

    // ------------------------------------------------------------------
    // Slot analysis
    // ------------------------------------------------------------------

    fn compile_pattern(
        &mut self,
        pattern: &PatternCondition,
        pattern_index: u16,
        local_only: bool,
    ) -> TrawlResult<CompiledPattern> {
        match &pattern.target {
            PatternTarget::Fact { template } => {
                self.compile_fact_pattern(template, &pattern.constraints, pattern_index, local_only)
            }
            PatternTarget::Object { classes } => {
                self.compile_object_pattern(classes, &pattern.constraints, pattern_index, local_only)
            }
        }
    }

    fn compile_fact_pattern(
        &mut self,
        template: &str,
        constraints: &[SlotConstraint],
        pattern_index: u16,
        local_only: bool,
    ) -> TrawlResult<CompiledPattern> {
        let template_id = self.wm.ensure_template(template);
        let mut alpha_tests = Vec::new();
        let mut join_tests = Vec::new();
        let mut hash_pairs = Vec::new();
        let mut local_vars: AHashMap<String, VarBinding> = AHashMap::new();

        for constraint in constraints {
            let slot = self.wm.intern_slot(&constraint.slot);
            match &constraint.test {
                SlotTest::Eq(value) => alpha_tests.push(TestExpr::Cmp {
                    op: CompareOp::Eq,
                    left: Box::new(TestExpr::RhsSlot { slot }),
                    right: Box::new(TestExpr::Constant(value.clone())),
                }),
                SlotTest::Bind(name) => self.bind_variable(
                    name,
                    pattern_index,
                    slot,
                    None,
                    local_only,
                    &mut local_vars,
                    &mut join_tests,
                    &mut hash_pairs,
                ),
                SlotTest::BindSegment(_) => {
                    return Err(TrawlError::rule_named(
                        "multifield segments are supported on object patterns only",
                        &self.rule.name,
                    ));
                }
                SlotTest::Predicate(expr) => {
                    if expr_is_alpha_safe(expr) {
                        let resolved = self.resolve_predicate(
                            expr,
                            ResolveContext::FactAlpha,
                            slot,
                            pattern_index,
                            &local_vars,
                        )?;
                        alpha_tests.push(resolved);
                    } else {
                        let resolved = self.resolve_predicate(
                            expr,
                            ResolveContext::Join {
                                current_pattern: pattern_index,
                                current_slot: Some(slot),
                            },
                            slot,
                            pattern_index,
                            &local_vars,
                        )?;
                        join_tests.push(resolved);
                    }
                }
            }
        }

        let constant_test = combine_tests(alpha_tests);
        let right_hash: Vec<TestExpr> = hash_pairs.iter().map(|(_, r)| r.clone()).collect();
        let header =
            self.find_or_create_fact_header(template_id, &constant_test, &right_hash)?;
        Ok(CompiledPattern {
            header,
            join_tests,
            left_hash: hash_pairs.into_iter().map(|(l, _)| l).collect(),
            right_hash,
        })
    }

    fn compile_object_pattern(
        &mut self,
        classes: &[String],
        constraints: &[SlotConstraint],
        pattern_index: u16,
        local_only: bool,
    ) -> TrawlResult<CompiledPattern> {
        let mut class_ids = Vec::new();
        for class in classes {
            class_ids.push(self.wm.class_id(class).ok_or_else(|| {
                TrawlError::rule_named(format!("unknown class '{class}'"), &self.rule.name)
            })?);
        }
        let mut join_tests = Vec::new();
        let mut hash_pairs = Vec::new();
        let mut local_vars: AHashMap<String, VarBinding> = AHashMap::new();
        let mut marker_count: u16 = 0;
        // Slot specs accumulate in slot-id order for tree insertion.
        let mut slot_specs: Vec<SlotPatternSpec> = Vec::new();

        let mut sorted: Vec<&SlotConstraint> = constraints.iter().collect();
        sorted.sort_by_key(|c| self.wm.slot_id(&c.slot).unwrap_or(u32::MAX));

        for constraint in sorted {
            let slot = self.wm.intern_slot(&constraint.slot);
            let mut field_test: Option<TestExpr> = None;
            let mut is_segment = false;
            match &constraint.test {
                SlotTest::Eq(value) => {
                    field_test = Some(TestExpr::Cmp {
                        op: CompareOp::Eq,
                        left: Box::new(TestExpr::CurrentField),
                        right: Box::new(TestExpr::Constant(value.clone())),
                    });
                }
                SlotTest::Bind(name) => self.bind_variable(
                    name,
                    pattern_index,
                    slot,
                    None,
                    local_only,
                    &mut local_vars,
                    &mut join_tests,
                    &mut hash_pairs,
                ),
                SlotTest::BindSegment(name) => {
                    is_segment = true;
                    let marker = marker_count;
                    marker_count += 1;
                    self.bind_variable(
                        name,
                        pattern_index,
                        slot,
                        Some(marker),
                        local_only,
                        &mut local_vars,
                        &mut join_tests,
                        &mut hash_pairs,
                    );
                }
                SlotTest::Predicate(expr) => {
                    if expr_is_alpha_safe(expr) {
                        field_test =
                            Some(self.resolve_predicate(
                                expr,
                                ResolveContext::ObjectField,
                                slot,
                                pattern_index,
                                &local_vars,
                            )?);
                    } else {
                        let resolved = self.resolve_predicate(
                            expr,
                            ResolveContext::Join {
                                current_pattern: pattern_index,
                                current_slot: Some(slot),
                            },
                            slot,
                            pattern_index,
                            &local_vars,
                        )?;
                        join_tests.push(resolved);
                    }
                }
            }
            let field = if is_segment {
                FieldSpec::Segment { test: None }
            } else {
                FieldSpec::Single { test: field_test }
            };
            match slot_specs.iter_mut().find(|s| s.slot == slot) {
                Some(existing) => {
                    // Repeated single-field constraints on a slot refine
                    // the same field; a segment starts positional
                    // matching.
                    match (existing.fields.last_mut(), &field) {
                        (
                            Some(FieldSpec::Single { test: existing_test }),
                            FieldSpec::Single { test: Some(new_test) },
                        ) => match existing_test {
                            Some(t) => {
                                *existing_test =
                                    Some(TestExpr::And(vec![t.clone(), new_test.clone()]));
                            }
                            None => *existing_test = Some(new_test.clone()),
                        },
                        (Some(FieldSpec::Single { .. }), FieldSpec::Single { test: None }) => {}
                        _ => {
                            existing.whole = false;
                            existing.fields.push(field);
                        }
                    }
                }
                None => slot_specs.push(SlotPatternSpec {
                    slot,
                    whole: !is_segment,
                    fields: vec![field],
                }),
            }
        }
        // A lone segment spec still enumerates rather than matching whole.
        for spec in &mut slot_specs {
            if spec.fields.iter().any(|f| matches!(f, FieldSpec::Segment { .. })) {
                spec.whole = false;
            }
        }

        let spec = ObjectPatternSpec { classes: class_ids.clone(), slots: slot_specs };
        let right_hash: Vec<TestExpr> = hash_pairs.iter().map(|(_, r)| r.clone()).collect();
        let (header, _obj_alpha) = self.find_or_create_object_header(&spec, &right_hash)?;
        Ok(CompiledPattern {
            header,
            join_tests,
            left_hash: hash_pairs.into_iter().map(|(l, _)| l).collect(),
            right_hash,
        })
    }

    /// Record a variable binding or, for a repeat occurrence, emit the
    /// equality join test and its hash pair.
    #[allow(clippy::too_many_arguments)]
    fn bind_variable(
        &mut self,
        name: &str,
        pattern_index: u16,
        slot: SlotId,
        marker: Option<u16>,
        local_only: bool,
        local_vars: &mut AHashMap<String, VarBinding>,
        join_tests: &mut Vec<TestExpr>,
        hash_pairs: &mut Vec<(TestExpr, TestExpr)>,
    ) {
        let rhs_ref = match marker {
            Some(m) => TestExpr::RhsSegment { marker: m },
            None => TestExpr::RhsSlot { slot },
        };
        if let Some(binding) = local_vars.get(name).copied() {
            // Intra-pattern equality.
            let other = match binding.marker {
                Some(m) => TestExpr::RhsSegment { marker: m },
                None => TestExpr::RhsSlot { slot: binding.slot },
            };
            join_tests.push(TestExpr::Cmp {
                op: CompareOp::Eq,
                left: Box::new(rhs_ref),
                right: Box::new(other),
            });
            return;
        }
        if let Some(binding) = self.vars.get(name).copied() {
            // Cross-pattern equality: test plus hash pair.
            let lhs_ref = match binding.marker {
                Some(m) => TestExpr::LhsSegment { pattern: binding.pattern, marker: m },
                None => TestExpr::LhsSlot { pattern: binding.pattern, slot: binding.slot },
            };
            join_tests.push(TestExpr::Cmp {
                op: CompareOp::Eq,
                left: Box::new(rhs_ref.clone()),
                right: Box::new(lhs_ref.clone()),
            });
            if binding.marker.is_none() && marker.is_none() {
                hash_pairs.push((lhs_ref, rhs_ref));
            }
            return;
        }
        let binding = VarBinding { pattern: pattern_index, slot, marker };
        local_vars.insert(name.to_string(), binding);
        if !local_only {
            self.vars.insert(name.to_string(), binding);
        }
    }

    // ------------------------------------------------------------------
    // Header and join sharing
    // ------------------------------------------------------------------

    fn find_or_create_fact_header(
        &mut self,
        template: crate::types::TemplateId,
        constant_test: &Option<TestExpr>,
        right_hash: &[TestExpr],
    ) -> TrawlResult<HeaderId> {
        if let Some(existing) = self.rete.fact_headers.get(&template).cloned() {
            for header_id in existing {
                let header = self.rete.header(header_id);
                if header.constant_test == *constant_test && header.right_hash == right_hash {
                    self.rete.header_mut(header_id).use_count += 1;
                    self.headers.push(header_id);
                    return Ok(header_id);
                }
            }
        }
        let header_id = self.rete.new_header();
        {
            let header = self.rete.header_mut(header_id);
            header.constant_test = constant_test.clone();
            header.right_hash = right_hash.to_vec();
            header.template = Some(template);
            header.use_count = 1;
        }
        self.rete.fact_headers.entry(template).or_default().push(header_id);
        self.plan.new_headers.push(header_id);
        self.headers.push(header_id);
        Ok(header_id)
    }

    fn find_or_create_object_header(
        &mut self,
        spec: &ObjectPatternSpec,
        right_hash: &[TestExpr],
    ) -> TrawlResult<(HeaderId, ObjAlphaId)> {
        // Sharing for object patterns keys on the compiled tree terminal:
        // identical specs reach the same pattern node chain.
        for header_id in self.rete.header_ids() {
            let Some(alpha_id) = self.objects.alpha_for_header(header_id) else {
                continue;
            };
            let header = self.rete.header(header_id);
            if header.right_hash != right_hash {
                continue;
            }
            let alpha = self.objects.alpha(alpha_id);
            let classes_match = spec.classes.iter().all(|c| alpha.class_bmp.contains(*c))
                && alpha.class_bmp.len() == spec.classes.len() as u64;
            if classes_match && self.spec_matches_terminal(spec, alpha.pattern_node) {
                self.objects.alpha_mut(alpha_id).use_count += 1;
                self.rete.header_mut(header_id).use_count += 1;
                self.headers.push(header_id);
                self.obj_alphas.push(alpha_id);
                return Ok((header_id, alpha_id));
            }
        }
        let header_id = self.rete.new_header();
        {
            let header = self.rete.header_mut(header_id);
            header.right_hash = right_hash.to_vec();
            header.use_count = 1;
        }
        let alpha_id = self.objects.install_pattern(spec, header_id);
        for class in &spec.classes {
            self.wm.class_mut(*class).alpha_nodes.push(alpha_id);
        }
        self.plan.new_headers.push(header_id);
        self.headers.push(header_id);
        self.obj_alphas.push(alpha_id);
        Ok((header_id, alpha_id))
    }

    fn spec_matches_terminal(&self, spec: &ObjectPatternSpec, terminal: crate::types::ObjNodeId) -> bool {
        // Walk the chain upwards comparing fields in reverse.
        let mut cursor = Some(terminal);
        let mut expected: Vec<(SlotId, bool, bool, Option<TestExpr>)> = Vec::new();
        for slot_spec in &spec.slots {
            for field in &slot_spec.fields {
                let (multifield, test) = match field {
                    FieldSpec::Single { test } => (false, test.clone()),
                    FieldSpec::Segment { test } => (true, test.clone()),
                };
                expected.push((slot_spec.slot, slot_spec.whole, multifield, test));
            }
        }
        for (slot, whole, multifield, test) in expected.iter().rev() {
            let Some(node_id) = cursor else { return false };
            let node = self.objects.node(node_id);
            if node.slot != *slot
                || node.whole != *whole
                || node.multifield_node != *multifield
                || node.network_test != *test
            {
                return false;
            }
            cursor = node.last_level;
        }
        cursor.is_none()
    }

    /// Create (or share) the join for a compiled pattern and wire it in.
    #[allow(clippy::too_many_arguments)]
    fn attach_pattern_join(
        &mut self,
        compiled: CompiledPattern,
        depth: u16,
        prev_join: Option<JoinId>,
        negated: bool,
        exists: bool,
        subordinate: bool,
    ) -> TrawlResult<JoinId> {
        let right_entry = RightEntry::Alpha(compiled.header);
        // An exists CE keeps tests over its own pattern in the secondary
        // slot, evaluated after the join-variable tests.
        let (network_test, secondary_test) = if exists {
            let (own, joined): (Vec<TestExpr>, Vec<TestExpr>) = compiled
                .join_tests
                .into_iter()
                .partition(|test| !expr_references_lhs(test));
            (combine_tests(joined), combine_tests(own))
        } else {
            (combine_tests(compiled.join_tests), None)
        };
        // Prefix sharing: an identical join below the same parent with an
        // LHS-entering child can take this rule too.
        if !subordinate {
            let candidates: Vec<JoinId> = self.rete.header(compiled.header).entry_joins.clone();
            for candidate in candidates {
                let join = self.rete.join(candidate);
                if join.last_level == prev_join
                    && join.right_entry == right_entry
                    && join.pattern_is_negated == negated
                    && join.pattern_is_exists == exists
                    && !join.join_from_the_right
                    && join.network_test == network_test
                    && join.secondary_network_test == secondary_test
                    && join.left_hash == compiled.left_hash
                    && join.right_hash == compiled.right_hash
                    && join.next_links.iter().any(|l| l.enter_direction == Side::Lhs)
                {
                    self.rete.join_mut(candidate).use_count += 1;
                    let rule_id = self.rule.id;
                    self.rete.join_mut(candidate).rules.push(rule_id);
                    self.joins.push(candidate);
                    debug!(join = candidate.0, "sharing join prefix");
                    return Ok(candidate);
                }
            }
        }

        let first_join = prev_join.is_none();
        let join_id = self.rete.add_join(JoinNode {
            id: JoinId(0),
            depth,
            first_join,
            logical_join: false,
            join_from_the_right: false,
            pattern_is_negated: negated,
            pattern_is_exists: exists,
            network_test,
            secondary_network_test: secondary_test,
            left_hash: compiled.left_hash,
            right_hash: compiled.right_hash,
            right_entry,
            last_level: prev_join,
            left_memory: if first_join {
                BetaMemory::unhashed(false)
            } else {
                BetaMemory::hashed(false)
            },
            right_memory: None,
            next_links: Vec::new(),
            rule_to_activate: None,
            use_count: 1,
            rules: vec![self.rule.id],
            pattern_index: depth as usize,
            memory_compares: 0,
        });
        self.joins.push(join_id);
        self.rete.header_mut(compiled.header).entry_joins.push(join_id);
        if let Some(prev) = prev_join {
            // Grafting a new continuation under a shared prefix needs a
            // replay from an established sibling.
            let shared_parent = self.rete.join(prev).use_count > 1
                || self.rete.join(prev).next_links.iter().any(|l| l.enter_direction == Side::Lhs);
            if shared_parent && self.plan.shared_replay.is_none() {
                if let Some(sibling) = self
                    .rete
                    .join(prev)
                    .next_links
                    .iter()
                    .find(|l| l.enter_direction == Side::Lhs)
                    .map(|l| l.target)
                {
                    self.plan.shared_replay = Some((sibling, join_id));
                }
            }
            self.rete
                .join_mut(prev)
                .next_links
                .push(JoinLink { enter_direction: Side::Lhs, target: join_id });
        } else if negated || exists {
            self.plan.sentinel_joins.push(join_id);
        }
        Ok(join_id)
    }

    // ------------------------------------------------------------------
    // Expression resolution
    // ------------------------------------------------------------------

    fn resolve_predicate(
        &self,
        expr: &RuleExpr,
        context: ResolveContext,
        current_slot: SlotId,
        pattern_index: u16,
        local_vars: &AHashMap<String, VarBinding>,
    ) -> TrawlResult<TestExpr> {
        self.resolve_with(expr, context, Some(current_slot), pattern_index, Some(local_vars))
    }

    fn resolve_expr(&self, expr: &RuleExpr, context: ResolveContext) -> TrawlResult<TestExpr> {
        self.resolve_with(expr, context, None, 0, None)
    }

    fn resolve_with(
        &self,
        expr: &RuleExpr,
        context: ResolveContext,
        current_slot: Option<SlotId>,
        pattern_index: u16,
        local_vars: Option<&AHashMap<String, VarBinding>>,
    ) -> TrawlResult<TestExpr> {
        let resolve = |e: &RuleExpr| -> TrawlResult<TestExpr> {
            self.resolve_with(e, context, current_slot, pattern_index, local_vars)
        };
        Ok(match expr {
            RuleExpr::Const(value) => TestExpr::Constant(value.clone()),
            RuleExpr::SelfValue => match context {
                ResolveContext::ObjectField => TestExpr::CurrentField,
                ResolveContext::FactAlpha | ResolveContext::Join { .. } => {
                    let slot = current_slot.ok_or_else(|| {
                        TrawlError::rule_named("no slot under test here", &self.rule.name)
                    })?;
                    TestExpr::RhsSlot { slot }
                }
                ResolveContext::TestCe => {
                    return Err(TrawlError::rule_named(
                        "a test CE has no slot under test",
                        &self.rule.name,
                    ));
                }
            },
            RuleExpr::Var(name) => self.resolve_var(name, context, pattern_index, local_vars)?,
            RuleExpr::Cmp { op, left, right } => TestExpr::Cmp {
                op: *op,
                left: Box::new(resolve(left)?),
                right: Box::new(resolve(right)?),
            },
            RuleExpr::And(parts) => {
                TestExpr::And(parts.iter().map(&resolve).collect::<TrawlResult<_>>()?)
            }
            RuleExpr::Or(parts) => {
                TestExpr::Or(parts.iter().map(&resolve).collect::<TrawlResult<_>>()?)
            }
            RuleExpr::Not(inner) => TestExpr::Not(Box::new(resolve(inner)?)),
            RuleExpr::Call { function, args } => TestExpr::Call {
                function: function.clone(),
                args: args.iter().map(&resolve).collect::<TrawlResult<_>>()?,
            },
        })
    }

    fn resolve_var(
        &self,
        name: &str,
        context: ResolveContext,
        pattern_index: u16,
        local_vars: Option<&AHashMap<String, VarBinding>>,
    ) -> TrawlResult<TestExpr> {
        let binding = local_vars
            .and_then(|locals| locals.get(name))
            .or_else(|| self.vars.get(name))
            .copied()
            .ok_or_else(|| {
                TrawlError::rule_named(format!("unbound variable '?{name}'"), &self.rule.name)
            })?;
        let current = binding.pattern == pattern_index
            && matches!(context, ResolveContext::Join { .. } | ResolveContext::FactAlpha);
        Ok(match (current, binding.marker) {
            (true, Some(m)) => TestExpr::RhsSegment { marker: m },
            (true, None) => TestExpr::RhsSlot { slot: binding.slot },
            (false, Some(m)) => TestExpr::LhsSegment { pattern: binding.pattern, marker: m },
            (false, None) => TestExpr::LhsSlot { pattern: binding.pattern, slot: binding.slot },
        })
    }

    /// Resolve RHS actions against the full left-hand side.
    fn compile_actions(&self) -> TrawlResult<Vec<CompiledAction>> {
        let mut out = Vec::new();
        for action in &self.rule.actions {
            match action {
                RuleAction::Assert { template, slots } => {
                    let mut resolved = Vec::new();
                    for (slot, expr) in slots {
                        resolved.push((
                            slot.clone(),
                            self.resolve_expr(expr, ResolveContext::TestCe)?,
                        ));
                    }
                    out.push(CompiledAction::Assert { template: template.clone(), slots: resolved });
                }
                RuleAction::Retract { pattern } => {
                    if *pattern >= self.rule.conditions.len() {
                        return Err(TrawlError::rule_named(
                            "retract action references a pattern out of range",
                            &self.rule.name,
                        ));
                    }
                    out.push(CompiledAction::Retract { pattern: *pattern });
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct CompiledPattern {
    header: HeaderId,
    join_tests: Vec<TestExpr>,
    left_hash: Vec<TestExpr>,
    right_hash: Vec<TestExpr>,
}

fn combine_tests(mut tests: Vec<TestExpr>) -> Option<TestExpr> {
    match tests.len() {
        0 => None,
        1 => Some(tests.remove(0)),
        _ => Some(TestExpr::And(tests)),
    }
}

/// Whether a resolved test reads the left partial match.
fn expr_references_lhs(expr: &TestExpr) -> bool {
    match expr {
        TestExpr::LhsSlot { .. } | TestExpr::LhsSegment { .. } => true,
        TestExpr::Constant(_)
        | TestExpr::RhsSlot { .. }
        | TestExpr::RhsSegment { .. }
        | TestExpr::CurrentField => false,
        TestExpr::Cmp { left, right, .. } => {
            expr_references_lhs(left) || expr_references_lhs(right)
        }
        TestExpr::And(parts) | TestExpr::Or(parts) => parts.iter().any(expr_references_lhs),
        TestExpr::Not(inner) => expr_references_lhs(inner),
        TestExpr::Call { args, .. } => args.iter().any(expr_references_lhs),
    }
}

/// Whether a predicate can run at the alpha level: it touches only the
/// slot under test and constants.
fn expr_is_alpha_safe(expr: &RuleExpr) -> bool {
    match expr {
        RuleExpr::Const(_) | RuleExpr::SelfValue => true,
        RuleExpr::Var(_) => false,
        RuleExpr::Cmp { left, right, .. } => expr_is_alpha_safe(left) && expr_is_alpha_safe(right),
        RuleExpr::And(parts) | RuleExpr::Or(parts) => parts.iter().all(expr_is_alpha_safe),
        RuleExpr::Not(inner) => expr_is_alpha_safe(inner),
        RuleExpr::Call { args, .. } => args.iter().all(expr_is_alpha_safe),
    }
}

// ----------------------------------------------------------------------
// Priming
// ----------------------------------------------------------------------

/// Bring freshly installed joins up to date with existing working memory.
pub fn prime_rule(
    rete: &mut ReteNetwork,
    objects: &mut ObjectNetwork,
    ctx: &mut DriveCtx<'_>,
    plan: &PrimePlan,
) {
    // Sentinels first: population may need to block them.
    let mut sentinels: Vec<(JoinId, PartialMatchId)> = Vec::new();
    for join_id in &plan.sentinel_joins {
        let sentinel = rete.create_left_prime(*join_id, ctx.timetag);
        sentinels.push((*join_id, sentinel));
    }

    // Populate new headers deepest-first so drives from shallower joins
    // find the downstream alpha memories already filled.
    for header_id in plan.new_headers.iter().rev() {
        let header = rete.header(*header_id);
        if let Some(template) = header.template {
            let facts: Vec<_> = ctx
                .wm
                .live_entities()
                .filter(|e| {
                    matches!(&e.kind, crate::working_memory::EntityKind::Fact { template: t } if *t == template)
                })
                .map(|e| e.id)
                .collect();
            for entity in facts {
                if fact_matches_header(rete, ctx, *header_id, entity) {
                    rete.assert_to_header(ctx, *header_id, entity, Vec::new());
                }
            }
        } else if let Some(alpha_id) = objects.alpha_for_header(*header_id) {
            let classes: Vec<u32> = objects.alpha(alpha_id).class_bmp.iter().collect();
            let instances: Vec<(crate::types::EntityId, u32)> = ctx
                .wm
                .live_entities()
                .filter_map(|e| match &e.kind {
                    crate::working_memory::EntityKind::Instance { class, .. }
                        if classes.contains(class) =>
                    {
                        Some((e.id, *class))
                    }
                    _ => None,
                })
                .collect();
            for (entity, class) in instances {
                if let Some(outcome) = objects.mark_for(&[alpha_id], None) {
                    objects.object_pattern_match(rete, ctx, entity, class, outcome.tag);
                }
            }
        }
    }

    // Graft point under a shared prefix: replay the sibling's left memory
    // into the new continuation.
    if let Some((sibling, new_join)) = plan.shared_replay {
        let source: Vec<PartialMatchId> =
            rete.join(sibling).left_memory.iter_matches(&rete.arena);
        for pm in source {
            if rete.arena.partial_match(pm).deleting {
                continue;
            }
            let clone = rete.arena.copy_partial_match(pm, ctx.timetag);
            let parents = {
                let original = rete.arena.partial_match(pm);
                (original.left_parent, original.right_parent)
            };
            let hash_exprs = rete.join(new_join).left_hash.clone();
            let hash = hash_with_lhs(rete, ctx, &hash_exprs, clone);
            rete.arena.partial_match_mut(clone).hash_value = hash;
            rete_update_and_assert_left(rete, ctx, clone, parents, new_join, hash);
        }
    }

    // A leading negated or exists sentinel left unblocked by population
    // propagates now.
    for (join_id, sentinel) in sentinels {
        let join = rete.join(join_id);
        if join.pattern_is_exists {
            continue;
        }
        if rete.arena.partial_match(sentinel).marker.is_none() {
            rete.epm_drive_public(ctx, sentinel, join_id, DriveOp::Assert);
        }
    }
}

/// Evaluate a fact header's constant test against a candidate entity.
pub fn fact_matches_header(
    rete: &ReteNetwork,
    ctx: &DriveCtx<'_>,
    header_id: HeaderId,
    entity: crate::types::EntityId,
) -> bool {
    let header = rete.header(header_id);
    let Some(test) = &header.constant_test else {
        return true;
    };
    let scope = crate::eval::EvalScope {
        arena: &rete.arena,
        wm: ctx.wm,
        functions: ctx.functions,
        lhs: None,
        rhs: None,
        rhs_entity: Some(entity),
        current_field: None,
    };
    crate::eval::evaluate_bool(test, &scope).unwrap_or(false)
}

fn hash_with_lhs(
    rete: &ReteNetwork,
    ctx: &mut DriveCtx<'_>,
    exprs: &[TestExpr],
    pm: PartialMatchId,
) -> u64 {
    if exprs.is_empty() {
        return 0;
    }
    let scope = crate::eval::EvalScope {
        arena: &rete.arena,
        wm: ctx.wm,
        functions: ctx.functions,
        lhs: Some(pm),
        rhs: None,
        rhs_entity: None,
        current_field: None,
    };
    crate::eval::fold_hash_list(exprs, &scope, ctx.atoms)
}

fn rete_update_and_assert_left(
    rete: &mut ReteNetwork,
    ctx: &mut DriveCtx<'_>,
    pm: PartialMatchId,
    parents: (Option<PartialMatchId>, Option<PartialMatchId>),
    join: JoinId,
    hash: u64,
) {
    rete.update_beta_links_public(pm, parents.0, parents.1, join, hash, Side::Lhs);
    rete.network_assert_left(ctx, pm, join, DriveOp::Assert);
}
