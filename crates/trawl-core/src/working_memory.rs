//! Working-memory stores.
//!
//! The engine core consumes pattern-entity handles: anything with an
//! identity, a timetag, a busy counter, and a list of alpha-level matches.
//! This module provides the two concrete stores behind those handles (a
//! fact store keyed by template and an instance store keyed by class)
//! plus the process-wide slot-name registry that gives fact templates and
//! object classes a stable slot-id mapping.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use trawl_types::Value;

use crate::error::{TrawlError, TrawlResult};
use crate::types::{ClassId, EntityId, ObjAlphaId, SlotId, TemplateId};

/// What kind of working-memory entity a record is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Fact { template: TemplateId },
    Instance { class: ClassId, name: String },
}

/// A working-memory entity: one fact or one instance.
#[derive(Debug)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub timetag: u64,
    /// Pending deferred match actions referencing this entity.
    pub busy: u32,
    pub slots: AHashMap<SlotId, Value>,
    /// Set once retraction has begun; matching must not see the entity as
    /// live afterwards.
    pub retracted: bool,
}

#[derive(Debug)]
pub struct TemplateInfo {
    pub name: String,
    pub slots: Vec<SlotId>,
}

#[derive(Debug)]
pub struct ClassInfo {
    pub name: String,
    pub slots: Vec<SlotId>,
    /// Object alpha terminals whose class bitmap includes this class.
    pub alpha_nodes: Vec<ObjAlphaId>,
}

/// Fact and instance storage plus the slot/template/class registries.
#[derive(Debug, Default)]
pub struct WorkingMemory {
    slot_names: AHashMap<String, SlotId>,
    slot_list: Vec<String>,
    templates: Vec<TemplateInfo>,
    template_names: AHashMap<String, TemplateId>,
    classes: Vec<ClassInfo>,
    class_names: AHashMap<String, ClassId>,
    instance_names: AHashMap<String, EntityId>,
    entities: Vec<Option<EntityRecord>>,
    free: Vec<u32>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a slot name, returning its stable id.
    pub fn intern_slot(&mut self, name: &str) -> SlotId {
        if let Some(&id) = self.slot_names.get(name) {
            return id;
        }
        let id = self.slot_list.len() as SlotId;
        self.slot_list.push(name.to_string());
        self.slot_names.insert(name.to_string(), id);
        id
    }

    pub fn slot_id(&self, name: &str) -> Option<SlotId> {
        self.slot_names.get(name).copied()
    }

    pub fn slot_name(&self, id: SlotId) -> &str {
        &self.slot_list[id as usize]
    }

    pub fn slot_count(&self) -> usize {
        self.slot_list.len()
    }

    /// Look up or implicitly define a template.
    pub fn ensure_template(&mut self, name: &str) -> TemplateId {
        if let Some(&id) = self.template_names.get(name) {
            return id;
        }
        let id = self.templates.len() as TemplateId;
        self.templates.push(TemplateInfo { name: name.to_string(), slots: Vec::new() });
        self.template_names.insert(name.to_string(), id);
        id
    }

    /// Define a template together with its slot names, as an image load
    /// does.
    pub fn register_template(&mut self, name: &str, slots: &[&str]) -> TemplateId {
        let id = self.ensure_template(name);
        for slot in slots {
            let slot_id = self.intern_slot(slot);
            if !self.templates[id as usize].slots.contains(&slot_id) {
                self.templates[id as usize].slots.push(slot_id);
            }
        }
        id
    }

    pub fn template_id(&self, name: &str) -> Option<TemplateId> {
        self.template_names.get(name).copied()
    }

    pub fn template(&self, id: TemplateId) -> &TemplateInfo {
        &self.templates[id as usize]
    }

    pub fn templates(&self) -> impl Iterator<Item = (TemplateId, &TemplateInfo)> {
        self.templates.iter().enumerate().map(|(i, t)| (i as TemplateId, t))
    }

    /// Define an object class with the given slot names.
    pub fn define_class(&mut self, name: &str, slots: &[&str]) -> TrawlResult<ClassId> {
        if self.class_names.contains_key(name) {
            return Err(TrawlError::working_memory(format!("class '{name}' already defined")));
        }
        let slot_ids: Vec<SlotId> = slots.iter().map(|s| self.intern_slot(s)).collect();
        let id = self.classes.len() as ClassId;
        self.classes.push(ClassInfo { name: name.to_string(), slots: slot_ids, alpha_nodes: Vec::new() });
        self.class_names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.class_names.get(name).copied()
    }

    pub fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassInfo {
        &mut self.classes[id as usize]
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn insert_entity(&mut self, mut record: EntityRecord) -> EntityId {
        if let Some(slot) = self.free.pop() {
            record.id = EntityId(slot);
            let id = record.id;
            self.entities[slot as usize] = Some(record);
            id
        } else {
            record.id = EntityId(self.entities.len() as u32);
            let id = record.id;
            self.entities.push(Some(record));
            id
        }
    }

    /// Store a new fact. The caller drives it into the network afterwards.
    pub fn assert_fact(
        &mut self,
        template_name: &str,
        slots: Vec<(String, Value)>,
        timetag: u64,
    ) -> EntityId {
        let template = self.ensure_template(template_name);
        let mut slot_map = AHashMap::new();
        for (slot_name, value) in slots {
            let slot_id = self.intern_slot(&slot_name);
            if !self.templates[template as usize].slots.contains(&slot_id) {
                self.templates[template as usize].slots.push(slot_id);
            }
            slot_map.insert(slot_id, value);
        }
        self.insert_entity(EntityRecord {
            id: EntityId(0),
            kind: EntityKind::Fact { template },
            timetag,
            busy: 0,
            slots: slot_map,
            retracted: false,
        })
    }

    /// Store a new instance of a defined class.
    pub fn make_instance(
        &mut self,
        name: &str,
        class_name: &str,
        slots: Vec<(String, Value)>,
        timetag: u64,
    ) -> TrawlResult<EntityId> {
        let class = self
            .class_id(class_name)
            .ok_or_else(|| TrawlError::working_memory(format!("unknown class '{class_name}'")))?;
        if self.instance_names.contains_key(name) {
            return Err(TrawlError::working_memory(format!("instance [{name}] already exists")));
        }
        let mut slot_map = AHashMap::new();
        for (slot_name, value) in slots {
            let slot_id = self.slot_id(&slot_name).ok_or_else(|| {
                TrawlError::working_memory(format!("unknown slot '{slot_name}'"))
            })?;
            if !self.classes[class as usize].slots.contains(&slot_id) {
                return Err(TrawlError::working_memory(format!(
                    "class '{class_name}' has no slot '{slot_name}'"
                )));
            }
            slot_map.insert(slot_id, value);
        }
        let id = self.insert_entity(EntityRecord {
            id: EntityId(0),
            kind: EntityKind::Instance { class, name: name.to_string() },
            timetag,
            busy: 0,
            slots: slot_map,
            retracted: false,
        });
        self.instance_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Apply slot changes to an instance and report which slot ids moved.
    pub fn modify_instance(
        &mut self,
        id: EntityId,
        changes: Vec<(String, Value)>,
    ) -> TrawlResult<RoaringBitmap> {
        let mut resolved = Vec::with_capacity(changes.len());
        for (slot_name, value) in changes {
            let slot_id = self.slot_id(&slot_name).ok_or_else(|| {
                TrawlError::working_memory(format!("unknown slot '{slot_name}'"))
            })?;
            resolved.push((slot_id, value));
        }
        let record = self.entity_mut(id)?;
        let mut changed = RoaringBitmap::new();
        for (slot_id, value) in resolved {
            record.slots.insert(slot_id, value);
            changed.insert(slot_id);
        }
        Ok(changed)
    }

    pub fn instance_by_name(&self, name: &str) -> Option<EntityId> {
        self.instance_names.get(name).copied()
    }

    pub fn entity(&self, id: EntityId) -> TrawlResult<&EntityRecord> {
        self.entities
            .get(id.0 as usize)
            .and_then(|e| e.as_ref())
            .ok_or_else(|| TrawlError::WorkingMemory {
                message: "no such entity".into(),
                entity: Some(id.0 as u64),
            })
    }

    pub fn entity_mut(&mut self, id: EntityId) -> TrawlResult<&mut EntityRecord> {
        self.entities
            .get_mut(id.0 as usize)
            .and_then(|e| e.as_mut())
            .ok_or_else(|| TrawlError::WorkingMemory {
                message: "no such entity".into(),
                entity: Some(id.0 as u64),
            })
    }

    pub fn slot_value(&self, id: EntityId, slot: SlotId) -> Option<&Value> {
        self.entities.get(id.0 as usize).and_then(|e| e.as_ref()).and_then(|e| e.slots.get(&slot))
    }

    /// Reclaim an entity's storage. All matches involving it must already
    /// be flushed.
    pub fn remove_entity(&mut self, id: EntityId) {
        if let Some(record) = self.entities.get_mut(id.0 as usize).and_then(|e| e.take()) {
            if let EntityKind::Instance { name, .. } = &record.kind {
                self.instance_names.remove(name);
            }
            self.free.push(id.0);
        }
    }

    pub fn live_entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.iter().flatten().filter(|e| !e.retracted)
    }

    pub fn fact_count(&self) -> usize {
        self.live_entities().filter(|e| matches!(e.kind, EntityKind::Fact { .. })).count()
    }

    pub fn instance_count(&self) -> usize {
        self.live_entities().filter(|e| matches!(e.kind, EntityKind::Instance { .. })).count()
    }

    /// Short-print form used by watch traces and the matches report.
    pub fn short_print(&self, id: EntityId) -> String {
        match self.entity(id) {
            Ok(record) => match &record.kind {
                EntityKind::Fact { template } => {
                    let mut text = format!("f-{} ({}", id.0, self.template(*template).name);
                    let mut slots: Vec<_> = record.slots.iter().collect();
                    slots.sort_by_key(|(slot, _)| **slot);
                    for (slot, value) in slots {
                        text.push_str(&format!(" ({} {})", self.slot_name(*slot), value));
                    }
                    text.push(')');
                    text
                }
                EntityKind::Instance { name, class } => {
                    format!("[{}] of {}", name, self.class(*class).name)
                }
            },
            Err(_) => format!("<retracted entity {}>", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ids_are_shared_across_templates_and_classes() {
        let mut wm = WorkingMemory::new();
        let fact = wm.assert_fact("A", vec![("v".into(), Value::Integer(1))], 1);
        wm.define_class("Foo", &["v", "k"]).unwrap();
        let inst = wm
            .make_instance("foo1", "Foo", vec![("v".into(), Value::Integer(2))], 2)
            .unwrap();
        let v = wm.slot_id("v").unwrap();
        assert_eq!(wm.slot_value(fact, v), Some(&Value::Integer(1)));
        assert_eq!(wm.slot_value(inst, v), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_modify_reports_changed_slot_bitmap() {
        let mut wm = WorkingMemory::new();
        wm.define_class("Foo", &["k", "j"]).unwrap();
        let inst = wm.make_instance("foo1", "Foo", vec![("k".into(), Value::Integer(-1))], 1).unwrap();
        let changed = wm.modify_instance(inst, vec![("k".into(), Value::Integer(5))]).unwrap();
        let k = wm.slot_id("k").unwrap();
        assert!(changed.contains(k));
        assert_eq!(changed.len(), 1);
        assert_eq!(wm.slot_value(inst, k), Some(&Value::Integer(5)));
    }

    #[test]
    fn test_duplicate_instance_names_rejected() {
        let mut wm = WorkingMemory::new();
        wm.define_class("Foo", &["k"]).unwrap();
        wm.make_instance("foo1", "Foo", vec![], 1).unwrap();
        assert!(wm.make_instance("foo1", "Foo", vec![], 2).is_err());
    }

    #[test]
    fn test_remove_entity_frees_name_and_slot() {
        let mut wm = WorkingMemory::new();
        wm.define_class("Foo", &["k"]).unwrap();
        let inst = wm.make_instance("foo1", "Foo", vec![], 1).unwrap();
        wm.remove_entity(inst);
        assert!(wm.instance_by_name("foo1").is_none());
        assert!(wm.entity(inst).is_err());
        // slot reused
        let again = wm.make_instance("foo2", "Foo", vec![], 2).unwrap();
        assert_eq!(again, inst);
    }

    #[test]
    fn test_short_print_forms() {
        let mut wm = WorkingMemory::new();
        let fact = wm.assert_fact("A", vec![("v".into(), Value::Integer(7))], 1);
        assert_eq!(wm.short_print(fact), "f-0 (A (v 7))");
        wm.define_class("Foo", &["k"]).unwrap();
        let inst = wm.make_instance("foo1", "Foo", vec![], 1).unwrap();
        assert_eq!(wm.short_print(inst), "[foo1] of Foo");
    }
}
