//! The engine environment.
//!
//! One [`TrawlEngine`] aggregates every module data block the core needs:
//! atom tables, working memory, the join and object networks, the agenda,
//! the logical-dependency manager, and the watch registry. All public
//! edits funnel through here, and the deferred work those edits create
//! (the object match queue, forced logical retractions, the partial-match
//! garbage list) drains synchronously at the end of each public call and
//! after each rule firing.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use tracing::{debug, info};
use trawl_types::{AtomTable, Value};

use crate::agenda::Agenda;
use crate::error::{TrawlError, TrawlResult};
use crate::eval::{EvalScope, FunctionRegistry};
use crate::join_network::{DriveCtx, ReteNetwork};
use crate::logical_dependency::LogicalDependencyManager;
use crate::network_builder::{
    fact_matches_header, prime_rule, CompiledAction, InstalledRule, RuleCompiler,
};
use crate::object_network::{ObjAction, ObjectNetwork};
use crate::types::{ClassId, EngineStats, EntityId, PartialMatchId, Rule, RuleId};
use crate::watch::{WatchItem, WatchRegistry};
use crate::working_memory::{EntityKind, WorkingMemory};

/// Tunables consulted at engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Allow beta memories to grow and shrink.
    pub beta_memory_resizing: bool,
    /// Start with an open object-pattern-match delay window.
    pub delay_object_pattern_matching: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { beta_memory_resizing: true, delay_object_pattern_matching: false }
    }
}

/// The forward-chaining rule engine.
pub struct TrawlEngine {
    pub(crate) atoms: AtomTable,
    pub(crate) wm: WorkingMemory,
    pub(crate) rete: ReteNetwork,
    pub(crate) objects: ObjectNetwork,
    pub(crate) agenda: Agenda,
    pub(crate) logical: LogicalDependencyManager,
    pub(crate) functions: FunctionRegistry,
    pub(crate) rules: AHashMap<RuleId, InstalledRule>,
    pub(crate) rule_names: AHashMap<RuleId, String>,
    pub(crate) watch: WatchRegistry,
    pub(crate) current_timetag: u64,
    /// Tag shared by every edit inside an open delay window.
    pub(crate) delay_timetag: Option<u64>,
    /// Timetag handed to drives started by the current public call.
    active_timetag: u64,
    pending_removals: Vec<EntityId>,
    pub(crate) bload_active: bool,
    executing_rule: Option<String>,
}

impl std::fmt::Debug for TrawlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrawlEngine")
            .field("rules", &self.rules.len())
            .field("facts", &self.wm.fact_count())
            .field("instances", &self.wm.instance_count())
            .field("joins", &self.rete.join_count())
            .finish()
    }
}

impl Default for TrawlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TrawlEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut rete = ReteNetwork::new();
        rete.beta_resizing = config.beta_memory_resizing;
        let mut objects = ObjectNetwork::new();
        objects.delay = config.delay_object_pattern_matching;
        Self {
            atoms: AtomTable::new(),
            wm: WorkingMemory::new(),
            rete,
            objects,
            agenda: Agenda::new(),
            logical: LogicalDependencyManager::new(),
            functions: FunctionRegistry::with_builtins(),
            rules: AHashMap::new(),
            rule_names: AHashMap::new(),
            watch: WatchRegistry::new(),
            current_timetag: 0,
            delay_timetag: None,
            active_timetag: 0,
            pending_removals: Vec::new(),
            bload_active: false,
            executing_rule: None,
        }
    }

    fn split(&mut self) -> (DriveCtx<'_>, &mut ReteNetwork, &mut ObjectNetwork) {
        let Self {
            atoms,
            wm,
            rete,
            objects,
            agenda,
            logical,
            functions,
            rule_names,
            active_timetag,
            ..
        } = self;
        (
            DriveCtx {
                wm,
                functions,
                atoms,
                agenda,
                logical,
                rule_names,
                timetag: *active_timetag,
            },
            rete,
            objects,
        )
    }

    /// Next edit timetag. Edits inside a delay window share the window's
    /// opening tag.
    fn next_timetag(&mut self) -> u64 {
        if let Some(tag) = self.delay_timetag {
            return tag;
        }
        self.current_timetag += 1;
        self.current_timetag
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// Compile, install, and prime a rule.
    pub fn add_rule(&mut self, rule: Rule) -> TrawlResult<()> {
        if self.rules.contains_key(&rule.id) {
            return Err(TrawlError::rule_named("duplicate rule id", &rule.name));
        }
        if self.watch.enabled(WatchItem::Compilations) {
            info!(target: "trawl::watch", "Compiling rule: {}", rule.name);
        }
        let (installed, plan) = {
            let Self { rete, objects, wm, .. } = self;
            RuleCompiler::new(rete, objects, wm, &rule).install()?
        };
        self.agenda.register_rule(rule.id, rule.salience);
        self.rule_names.insert(rule.id, rule.name.clone());
        self.active_timetag = self.current_timetag;
        {
            let (mut ctx, rete, objects) = self.split();
            prime_rule(rete, objects, &mut ctx, &plan);
        }
        self.rules.insert(rule.id, installed);
        self.end_of_call_drain();
        Ok(())
    }

    /// Remove a rule, detaching its unshared joins bottom-up.
    pub fn remove_rule(&mut self, rule_id: RuleId) -> TrawlResult<()> {
        let installed = self
            .rules
            .remove(&rule_id)
            .ok_or_else(|| TrawlError::rule(format!("no rule with id {rule_id}")))?;
        self.agenda.unregister_rule(rule_id);
        self.rule_names.remove(&rule_id);

        // Terminal-first teardown: flush every dying join's memories
        // first (cascades may touch joins further down the chain), then
        // unlink and release.
        let mut to_release = Vec::new();
        for join_id in installed.joins.iter().rev() {
            let keep = {
                let join = self.rete.join_mut(*join_id);
                join.use_count -= 1;
                join.rules.retain(|r| *r != rule_id);
                join.use_count > 0
            };
            if keep {
                continue;
            }
            {
                let (mut ctx, rete, _objects) = self.split();
                rete.flush_join_memories(&mut ctx, *join_id);
            }
            to_release.push(*join_id);
        }
        for join_id in to_release {
            let (last_level, right_entry) = {
                let join = self.rete.join(join_id);
                (join.last_level, join.right_entry)
            };
            if let Some(parent) = last_level {
                if self.rete.join_exists(parent) {
                    self.rete.join_mut(parent).next_links.retain(|l| l.target != join_id);
                }
            }
            if let crate::join_network::RightEntry::Alpha(header) = right_entry {
                self.rete.header_mut(header).entry_joins.retain(|j| *j != join_id);
            }
            if let crate::join_network::RightEntry::Join(sub) = right_entry {
                if self.rete.join_exists(sub) {
                    self.rete.join_mut(sub).next_links.retain(|l| l.target != join_id);
                }
            }
            self.rete.release_join(join_id);
        }

        for header_id in &installed.headers {
            let orphaned = {
                let header = self.rete.header_mut(*header_id);
                header.use_count -= 1;
                header.use_count == 0
            };
            if !orphaned {
                continue;
            }
            {
                let (mut ctx, rete, _objects) = self.split();
                rete.flush_alpha_memory(&mut ctx, *header_id);
            }
            if let Some(alpha_id) = self.objects.alpha_for_header(*header_id) {
                let classes: Vec<ClassId> =
                    self.objects.alpha(alpha_id).class_bmp.iter().collect();
                for class in classes {
                    self.wm.class_mut(class).alpha_nodes.retain(|a| *a != alpha_id);
                }
                self.objects.remove_alpha(alpha_id);
            }
            self.rete.release_header(*header_id);
        }

        debug!(rule = rule_id, "rule removed");
        self.end_of_call_drain();
        Ok(())
    }

    pub fn rule_id_by_name(&self, name: &str) -> Option<RuleId> {
        self.rule_names.iter().find(|(_, n)| n.as_str() == name).map(|(id, _)| *id)
    }

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------

    /// Assert a fact and match it immediately.
    pub fn assert_fact(
        &mut self,
        template: &str,
        slots: Vec<(&str, Value)>,
    ) -> TrawlResult<EntityId> {
        let timetag = self.next_timetag();
        let slots: Vec<(String, Value)> =
            slots.into_iter().map(|(name, value)| (name.to_string(), value)).collect();
        let entity = self.wm.assert_fact(template, slots, timetag);
        if self.watch.enabled(WatchItem::Facts) {
            info!(target: "trawl::watch", "==> {}", self.wm.short_print(entity));
        }
        let template_id = self.wm.template_id(template).expect("template just ensured");
        self.active_timetag = timetag;
        {
            let (mut ctx, rete, objects) = self.split();
            objects.join_op_in_progress = true;
            let headers = rete.fact_headers.get(&template_id).cloned().unwrap_or_default();
            for header in headers {
                if fact_matches_header(rete, &ctx, header, entity) {
                    rete.assert_to_header(&mut ctx, header, entity, Vec::new());
                }
            }
            objects.join_op_in_progress = false;
        }
        self.end_of_call_drain();
        Ok(entity)
    }

    /// Retract a fact or instance.
    pub fn retract(&mut self, entity: EntityId) -> TrawlResult<()> {
        let kind = self.wm.entity(entity)?.kind.clone();
        match kind {
            EntityKind::Fact { .. } => {
                let timetag = self.next_timetag();
                self.retract_fact_now(entity, timetag)?;
                self.end_of_call_drain();
                Ok(())
            }
            EntityKind::Instance { .. } => self.unmake_instance(entity),
        }
    }

    fn retract_fact_now(&mut self, entity: EntityId, timetag: u64) -> TrawlResult<()> {
        {
            let record = self.wm.entity_mut(entity)?;
            if record.retracted {
                return Ok(());
            }
            // The timetag moves before the network hears about it.
            record.timetag = timetag;
            record.retracted = true;
        }
        if self.watch.enabled(WatchItem::Facts) {
            info!(target: "trawl::watch", "<== {}", self.wm.short_print(entity));
        }
        {
            let Self { logical, rete, .. } = self;
            logical.remove_entity_dependencies(&mut rete.arena, entity);
        }
        self.active_timetag = timetag;
        {
            let (mut ctx, rete, objects) = self.split();
            objects.join_op_in_progress = true;
            rete.network_retract(&mut ctx, entity);
            objects.join_op_in_progress = false;
        }
        self.pending_removals.push(entity);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    pub fn define_class(&mut self, name: &str, slots: &[&str]) -> TrawlResult<ClassId> {
        self.wm.define_class(name, slots)
    }

    /// Create an instance and run (or queue) its assert match.
    pub fn make_instance(
        &mut self,
        name: &str,
        class: &str,
        slots: Vec<(&str, Value)>,
    ) -> TrawlResult<EntityId> {
        let timetag = self.next_timetag();
        let slots: Vec<(String, Value)> =
            slots.into_iter().map(|(n, v)| (n.to_string(), v)).collect();
        let entity = self.wm.make_instance(name, class, slots, timetag)?;
        if self.watch.enabled(WatchItem::Instances) {
            info!(target: "trawl::watch", "==> {}", self.wm.short_print(entity));
        }
        self.object_network_action(ObjAction::Assert, entity, None)?;
        self.end_of_call_drain();
        Ok(entity)
    }

    /// Apply slot changes to an instance and run (or queue) the modify
    /// match. An empty change set means any slot may have changed.
    pub fn modify_instance(
        &mut self,
        entity: EntityId,
        changes: Vec<(&str, Value)>,
    ) -> TrawlResult<()> {
        let changes: Vec<(String, Value)> =
            changes.into_iter().map(|(n, v)| (n.to_string(), v)).collect();
        let _ = self.next_timetag();
        let changed = if changes.is_empty() {
            None
        } else {
            Some(self.wm.modify_instance(entity, changes)?)
        };
        if self.watch.enabled(WatchItem::Instances) {
            info!(target: "trawl::watch", "mod {}", self.wm.short_print(entity));
        }
        self.object_network_action(ObjAction::Modify, entity, changed)?;
        self.end_of_call_drain();
        Ok(())
    }

    /// Retract an instance and run (or queue) its retract match.
    pub fn unmake_instance(&mut self, entity: EntityId) -> TrawlResult<()> {
        let _ = self.next_timetag();
        if self.watch.enabled(WatchItem::Instances) {
            info!(target: "trawl::watch", "<== {}", self.wm.short_print(entity));
        }
        self.object_network_action(ObjAction::Retract, entity, None)?;
        self.end_of_call_drain();
        Ok(())
    }

    /// Object-store entry point into the matcher. Queues when a delay
    /// window is open or a join operation is in progress.
    pub fn object_network_action(
        &mut self,
        action: ObjAction,
        entity: EntityId,
        changed: Option<RoaringBitmap>,
    ) -> TrawlResult<()> {
        let timetag = self.delay_timetag.unwrap_or(self.current_timetag);
        if action == ObjAction::Retract {
            // The store forgets the instance now; only the match work can
            // be deferred. The timetag moves before the network hears
            // about it.
            let record = self.wm.entity_mut(entity)?;
            if record.retracted {
                return Ok(());
            }
            record.timetag = timetag;
            record.retracted = true;
            {
                let Self { logical, rete, .. } = self;
                logical.remove_entity_dependencies(&mut rete.arena, entity);
            }
            self.pending_removals.push(entity);
        }
        if self.objects.should_queue() {
            let delta = self.objects.queue_match_action(action, entity, changed);
            let record = self.wm.entity_mut(entity)?;
            record.busy = record.busy.saturating_add_signed(delta);
            return Ok(());
        }
        self.process_object_action(action, entity, changed, timetag)
    }

    fn process_object_action(
        &mut self,
        action: ObjAction,
        entity: EntityId,
        changed: Option<RoaringBitmap>,
        timetag: u64,
    ) -> TrawlResult<()> {
        match action {
            ObjAction::Assert => {
                let class = self.instance_class(entity)?;
                let class_alphas = self.wm.class(class).alpha_nodes.clone();
                self.active_timetag = timetag;
                let (mut ctx, rete, objects) = self.split();
                if let Some(outcome) = objects.mark_for(&class_alphas, None) {
                    objects.join_op_in_progress = true;
                    objects.object_pattern_match(rete, &mut ctx, entity, class, outcome.tag);
                    objects.join_op_in_progress = false;
                }
                Ok(())
            }
            ObjAction::Retract => {
                // Store-side bookkeeping already happened at the entry
                // point; here only the matches go away.
                self.active_timetag = timetag;
                let (mut ctx, rete, objects) = self.split();
                objects.join_op_in_progress = true;
                rete.network_retract(&mut ctx, entity);
                objects.join_op_in_progress = false;
                Ok(())
            }
            ObjAction::Modify => {
                let class = self.instance_class(entity)?;
                let class_alphas = self.wm.class(class).alpha_nodes.clone();
                self.active_timetag = timetag;
                let (mut ctx, rete, objects) = self.split();
                objects.join_op_in_progress = true;
                // Retract the stale alpha matches for headers whose slot
                // bitmap intersects the change, then re-match that subset
                // under the same timetag.
                let touched = objects.headers_touching(&class_alphas, changed.as_ref());
                let stale: Vec<PartialMatchId> = rete
                    .entity_matches
                    .get(&entity)
                    .map(|matches| {
                        matches
                            .iter()
                            .copied()
                            .filter(|pm| {
                                rete.arena
                                    .partial_match(*pm)
                                    .header
                                    .map(|h| touched.contains(&h))
                                    .unwrap_or(false)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                for pm in stale {
                    if !rete.arena.partial_match(pm).deleting {
                        rete.delete_partial_match(&mut ctx, pm, crate::types::DriveOp::Retract);
                        if let Some(list) = rete.entity_matches.get_mut(&entity) {
                            list.retain(|candidate| *candidate != pm);
                        }
                    }
                }
                if let Some(outcome) = objects.mark_for(&class_alphas, changed.as_ref()) {
                    objects.object_pattern_match(rete, &mut ctx, entity, class, outcome.tag);
                }
                objects.join_op_in_progress = false;
                Ok(())
            }
        }
    }

    fn instance_class(&self, entity: EntityId) -> TrawlResult<ClassId> {
        match &self.wm.entity(entity)?.kind {
            EntityKind::Instance { class, .. } => Ok(*class),
            EntityKind::Fact { .. } => Err(TrawlError::working_memory(
                "object network action on a fact entity",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Delay window
    // ------------------------------------------------------------------

    /// Open or close the object-pattern-match delay window. Closing the
    /// window drains the queue under the window's timetag. Returns the
    /// previous setting.
    pub fn set_delay_object_pattern_matching(&mut self, delay: bool) -> bool {
        let old = self.objects.delay;
        if delay && !old {
            self.objects.delay = true;
            self.current_timetag += 1;
            self.delay_timetag = Some(self.current_timetag);
        } else if !delay && old {
            self.objects.delay = false;
            let window_tag = self.delay_timetag.take().unwrap_or(self.current_timetag);
            self.drain_object_queue(window_tag);
            self.end_of_call_drain();
        }
        old
    }

    pub fn get_delay_object_pattern_matching(&self) -> bool {
        self.objects.delay
    }

    fn drain_object_queue(&mut self, timetag: u64) {
        loop {
            let actions = self.objects.drain_queue();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                if let Ok(record) = self.wm.entity_mut(action.instance) {
                    record.busy = record.busy.saturating_sub(1);
                }
                let _ = self.process_object_action(
                    action.action,
                    action.instance,
                    action.slot_ids,
                    timetag,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    /// Fire activations until the agenda empties or `limit` is reached.
    pub fn run(&mut self, limit: Option<usize>) -> usize {
        let mut fired = 0usize;
        while limit.map_or(true, |l| fired < l) {
            let Some(activation) = self.agenda.next_activation() else {
                break;
            };
            let Some(installed) = self.rules.get(&activation.rule) else {
                continue;
            };
            let rule_name = installed.rule.name.clone();
            if self.watch.enabled(WatchItem::Rules) {
                info!(target: "trawl::watch", "FIRE {:>4} {}", fired + 1, rule_name);
            }
            self.agenda.executing = true;
            self.executing_rule = Some(rule_name);
            self.fire_activation(activation.rule, activation.pm);
            self.agenda.executing = false;
            self.executing_rule = None;
            fired += 1;
            // Drain point: the firing may have scheduled logical
            // retractions or queued object edits.
            self.end_of_call_drain();
        }
        fired
    }

    fn fire_activation(&mut self, rule_id: RuleId, pm: PartialMatchId) {
        let Some(installed) = self.rules.get(&rule_id) else { return };
        let actions = installed.actions.clone();
        let logical = installed.logical;
        let terminal = installed.terminal;
        let support = if logical { self.rete.find_logical_bind(terminal, pm) } else { None };

        for action in actions {
            match action {
                CompiledAction::Assert { template, slots } => {
                    let mut values = Vec::with_capacity(slots.len());
                    let mut failed = false;
                    for (slot_name, expr) in &slots {
                        let scope = EvalScope {
                            arena: &self.rete.arena,
                            wm: &self.wm,
                            functions: &self.functions,
                            lhs: Some(pm),
                            rhs: None,
                            rhs_entity: None,
                            current_field: None,
                        };
                        match crate::eval::evaluate(expr, &scope) {
                            Ok(value) => values.push((slot_name.as_str().to_string(), value)),
                            Err(err) => {
                                tracing::error!(rule = rule_id, %err, "action evaluation failed");
                                failed = true;
                                break;
                            }
                        }
                    }
                    if failed {
                        continue;
                    }
                    let values_ref: Vec<(&str, Value)> =
                        values.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
                    if let Ok(entity) = self.assert_fact(&template, values_ref) {
                        if let Some(support_pm) = support {
                            let Self { logical, rete, .. } = self;
                            logical.add_support(&mut rete.arena, entity, support_pm);
                        }
                    }
                }
                CompiledAction::Retract { pattern } => {
                    let entity = self
                        .rete
                        .arena
                        .partial_match(pm)
                        .binds
                        .get(pattern)
                        .copied()
                        .flatten()
                        .map(|alpha| self.rete.arena.alpha_match(alpha).entity);
                    if let Some(entity) = entity {
                        let _ = self.retract(entity);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Drain points
    // ------------------------------------------------------------------

    /// Synchronous completion of deferred work: forced logical
    /// retractions, entity storage reclamation, and the garbage flush
    /// (gated on no rule executing).
    fn end_of_call_drain(&mut self) {
        // Logical retractions run to a fixed point; each retraction may
        // withdraw further support.
        while self.logical.has_pending() {
            for entity in self.logical.take_forced_retractions() {
                let timetag = self.next_timetag();
                let kind = self.wm.entity(entity).map(|e| e.kind.clone());
                match kind {
                    Ok(EntityKind::Fact { .. }) => {
                        let _ = self.retract_fact_now(entity, timetag);
                    }
                    Ok(EntityKind::Instance { .. }) => {
                        let _ = self.object_network_action(ObjAction::Retract, entity, None);
                    }
                    Err(_) => {}
                }
            }
        }

        if !self.agenda.executing {
            self.rete.arena.flush_garbage();
            let removals = std::mem::take(&mut self.pending_removals);
            for entity in removals {
                let busy = self.wm.entity(entity).map(|e| e.busy).unwrap_or(0);
                if busy == 0 {
                    self.wm.remove_entity(entity);
                } else {
                    self.pending_removals.push(entity);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection and control
    // ------------------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rule_count: self.rules.len(),
            fact_count: self.wm.fact_count(),
            instance_count: self.wm.instance_count(),
            join_count: self.rete.join_count(),
            header_count: self.rete.header_count(),
            partial_match_count: self.rete.arena.live_match_count(),
            activation_count: self.agenda.len(),
            fires: self.agenda.fires(),
        }
    }

    pub fn agenda_len(&self) -> usize {
        self.agenda.len()
    }

    /// Pending activations as (rule name, timetag), in firing order.
    pub fn agenda_snapshot(&self) -> Vec<(String, u64)> {
        self.agenda
            .snapshot()
            .into_iter()
            .map(|a| {
                let name =
                    self.rule_names.get(&a.rule).cloned().unwrap_or_else(|| a.rule.to_string());
                (name, a.timetag)
            })
            .collect()
    }

    /// Entities bound by pending activations of a rule, leftmost first.
    pub fn activation_entities(&self, rule: RuleId) -> Vec<Vec<Option<EntityId>>> {
        self.agenda
            .activations_for(rule)
            .into_iter()
            .map(|a| {
                self.rete
                    .arena
                    .partial_match(a.pm)
                    .binds
                    .iter()
                    .map(|bind| bind.map(|alpha| self.rete.arena.alpha_match(alpha).entity))
                    .collect()
            })
            .collect()
    }

    pub fn set_beta_memory_resizing(&mut self, enabled: bool) -> bool {
        let old = self.rete.beta_resizing;
        self.rete.beta_resizing = enabled;
        old
    }

    pub fn get_beta_memory_resizing(&self) -> bool {
        self.rete.beta_resizing
    }

    pub fn watch(&mut self, item: &str) -> bool {
        let known = self.watch.set_by_name(item, true);
        self.agenda.trace = self.watch.enabled(WatchItem::Activations);
        known
    }

    pub fn unwatch(&mut self, item: &str) -> bool {
        let known = self.watch.set_by_name(item, false);
        self.agenda.trace = self.watch.enabled(WatchItem::Activations);
        known
    }

    pub fn list_watch_items(&self) -> Vec<(&'static str, bool)> {
        self.watch.list()
    }

    /// Remove every construct and working-memory entity. Rejected while a
    /// rule is executing.
    pub fn clear(&mut self) -> TrawlResult<()> {
        if self.agenda.executing {
            let holder = self.executing_rule.clone().unwrap_or_else(|| "<rule>".into());
            return Err(TrawlError::illegal_state(format!(
                "some constructs are still in use: {holder}"
            )));
        }
        let config = EngineConfig {
            beta_memory_resizing: self.rete.beta_resizing,
            delay_object_pattern_matching: false,
        };
        let watch = self.watch.clone();
        *self = TrawlEngine::with_config(config);
        self.watch = watch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionElement, PatternCondition, SlotTest};

    fn rule_a_b(id: RuleId) -> Rule {
        Rule {
            id,
            name: format!("r{id}"),
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
        }
    }

    #[test]
    fn test_simple_positive_join_activates_once() {
        let mut engine = TrawlEngine::new();
        engine.add_rule(rule_a_b(1)).unwrap();
        engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(8))]).unwrap();
        assert_eq!(engine.agenda_len(), 1);
    }

    #[test]
    fn test_retract_removes_activation() {
        let mut engine = TrawlEngine::new();
        engine.add_rule(rule_a_b(1)).unwrap();
        let a = engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
        assert_eq!(engine.agenda_len(), 1);
        engine.retract(a).unwrap();
        assert_eq!(engine.agenda_len(), 0);
    }

    #[test]
    fn test_priming_matches_existing_facts() {
        let mut engine = TrawlEngine::new();
        engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.assert_fact("B", vec![("v", Value::Integer(7))]).unwrap();
        engine.add_rule(rule_a_b(1)).unwrap();
        assert_eq!(engine.agenda_len(), 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut engine = TrawlEngine::new();
        engine.add_rule(rule_a_b(1)).unwrap();
        engine.assert_fact("A", vec![("v", Value::Integer(7))]).unwrap();
        engine.clear().unwrap();
        let stats = engine.stats();
        assert_eq!(stats.rule_count, 0);
        assert_eq!(stats.fact_count, 0);
        assert_eq!(stats.join_count, 0);
    }
}
