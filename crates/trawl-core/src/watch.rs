//! Watch items.
//!
//! A watch item is a named boolean trace channel. The engine consults the
//! registry before emitting per-event traces; the CLI maps `watch`,
//! `unwatch`, and `list-watch-items` onto it.

use serde::{Deserialize, Serialize};

/// The engine's trace channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchItem {
    Facts,
    Instances,
    Rules,
    Activations,
    Compilations,
}

const ALL_ITEMS: [(WatchItem, &str); 5] = [
    (WatchItem::Facts, "facts"),
    (WatchItem::Instances, "instances"),
    (WatchItem::Rules, "rules"),
    (WatchItem::Activations, "activations"),
    (WatchItem::Compilations, "compilations"),
];

/// Registry of watch flags.
#[derive(Debug, Default, Clone)]
pub struct WatchRegistry {
    facts: bool,
    instances: bool,
    rules: bool,
    activations: bool,
    compilations: bool,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag_mut(&mut self, item: WatchItem) -> &mut bool {
        match item {
            WatchItem::Facts => &mut self.facts,
            WatchItem::Instances => &mut self.instances,
            WatchItem::Rules => &mut self.rules,
            WatchItem::Activations => &mut self.activations,
            WatchItem::Compilations => &mut self.compilations,
        }
    }

    pub fn enabled(&self, item: WatchItem) -> bool {
        match item {
            WatchItem::Facts => self.facts,
            WatchItem::Instances => self.instances,
            WatchItem::Rules => self.rules,
            WatchItem::Activations => self.activations,
            WatchItem::Compilations => self.compilations,
        }
    }

    pub fn set(&mut self, item: WatchItem, value: bool) {
        *self.flag_mut(item) = value;
    }

    /// Set a watch item by name; `all` addresses every item. Returns
    /// false for an unknown name.
    pub fn set_by_name(&mut self, name: &str, value: bool) -> bool {
        if name == "all" {
            for (item, _) in ALL_ITEMS {
                self.set(item, value);
            }
            return true;
        }
        match Self::item_by_name(name) {
            Some(item) => {
                self.set(item, value);
                true
            }
            None => false,
        }
    }

    pub fn item_by_name(name: &str) -> Option<WatchItem> {
        ALL_ITEMS.iter().find(|(_, n)| *n == name).map(|(item, _)| *item)
    }

    /// (name, enabled) for every item, in canonical order.
    pub fn list(&self) -> Vec<(&'static str, bool)> {
        ALL_ITEMS.iter().map(|(item, name)| (*name, self.enabled(*item))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_by_name_and_list() {
        let mut registry = WatchRegistry::new();
        assert!(registry.set_by_name("facts", true));
        assert!(!registry.set_by_name("nonsense", true));
        assert!(registry.enabled(WatchItem::Facts));
        assert!(!registry.enabled(WatchItem::Rules));
        let listed = registry.list();
        assert_eq!(listed.len(), 5);
        assert!(listed.contains(&("facts", true)));
    }

    #[test]
    fn test_watch_all() {
        let mut registry = WatchRegistry::new();
        registry.set_by_name("all", true);
        for (_, enabled) in registry.list() {
            assert!(enabled);
        }
        registry.set_by_name("all", false);
        for (_, enabled) in registry.list() {
            assert!(!enabled);
        }
    }
}
