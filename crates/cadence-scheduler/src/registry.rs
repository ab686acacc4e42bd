//! Concurrent trigger -> handler-set registry.
//!
//! The outer map is a `DashMap`; each entry owns its own mutex around the
//! handler set, so mutating one trigger's handlers never blocks scans or
//! mutations of unrelated triggers. All reads hand out short-held-lock
//! snapshots rather than iterating under a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use cadence_core::trigger::Trigger;

use crate::handler::Handler;

/// One registry entry: a trigger and the handlers bound to it.
pub(crate) struct ScheduleSlot {
    trigger: Trigger,
    /// Keyed by handler name (set semantics). Per-slot lock, never global.
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
}

impl ScheduleSlot {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Add a handler; false if one with the same name is already bound.
    fn insert(&self, handler: Arc<dyn Handler>) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let name = handler.name().to_string();
        if handlers.contains_key(&name) {
            return false;
        }
        handlers.insert(name, handler);
        true
    }

    fn remove(&self, name: &str) -> bool {
        self.handlers.lock().unwrap().remove(name).is_some()
    }

    fn contains(&self, name: &str) -> bool {
        self.handlers.lock().unwrap().contains_key(name)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.lock().unwrap().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Snapshot of the current handler set.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.lock().unwrap().values().cloned().collect()
    }

    fn names(&self) -> Vec<String> {
        self.handlers.lock().unwrap().keys().cloned().collect()
    }
}

/// Trigger/handler bindings plus the derived global handler set.
///
/// Invariant: a handler appears in `handlers` iff it is bound to at least
/// one trigger in `schedules`. Every mutating operation maintains this.
pub(crate) struct ScheduleRegistry {
    schedules: DashMap<Trigger, Arc<ScheduleSlot>>,
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl ScheduleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            handlers: DashMap::new(),
        }
    }

    /// Bind `handler` to `trigger`. Returns the slot and whether a new
    /// binding was created (false = exact pair already bound, no-op).
    pub(crate) fn bind(
        &self,
        handler: Arc<dyn Handler>,
        trigger: &Trigger,
    ) -> (bool, Arc<ScheduleSlot>) {
        let slot = self
            .schedules
            .entry(trigger.clone())
            .or_insert_with(|| Arc::new(ScheduleSlot::new(trigger.clone())))
            .clone();
        let added = slot.insert(Arc::clone(&handler));
        if added {
            self.handlers
                .insert(handler.name().to_string(), handler);
        }
        (added, slot)
    }

    /// Move a handler's binding to `trigger`, removing it from every other
    /// slot. Acts as a plain bind for a handler that was never registered.
    pub(crate) fn rebind(
        &self,
        handler: Arc<dyn Handler>,
        trigger: &Trigger,
    ) -> Arc<ScheduleSlot> {
        let name = handler.name().to_string();
        for slot in self.slots() {
            if slot.trigger() != trigger {
                slot.remove(&name);
            }
        }
        let (_, slot) = self.bind(handler, trigger);
        slot
    }

    /// Remove a handler from every trigger it is bound to.
    pub(crate) fn unbind_handler(&self, name: &str) -> bool {
        if self.handlers.remove(name).is_none() {
            return false;
        }
        for slot in self.slots() {
            slot.remove(name);
        }
        true
    }

    /// Remove a trigger and all of its bindings. Handlers left with no
    /// remaining binding are dropped from the global set.
    pub(crate) fn unbind_trigger(&self, trigger: &Trigger) -> bool {
        let Some((_, slot)) = self.schedules.remove(trigger) else {
            return false;
        };
        for name in slot.names() {
            self.prune_handler(&name);
        }
        true
    }

    /// Drop every binding.
    pub(crate) fn clear(&self) {
        self.schedules.clear();
        self.handlers.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub(crate) fn slots(&self) -> Vec<Arc<ScheduleSlot>> {
        self.schedules.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn triggers(&self) -> Vec<Trigger> {
        self.schedules.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|e| e.value().clone())
    }

    pub(crate) fn get_handlers(&self, trigger: &Trigger) -> Vec<Arc<dyn Handler>> {
        self.schedules
            .get(trigger)
            .map(|e| e.value().snapshot())
            .unwrap_or_default()
    }

    /// Drop the handler from the global set when no slot still binds it.
    fn prune_handler(&self, name: &str) {
        let still_bound = self
            .schedules
            .iter()
            .any(|e| e.value().contains(name));
        if !still_bound {
            self.handlers.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct NoopHandler(String);

    #[async_trait]
    impl Handler for NoopHandler {
        fn name(&self) -> &str {
            &self.0
        }
        async fn handle(&self, _: &HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct NowRule;

    impl cadence_core::trigger::OccurrenceRule for NowRule {
        fn next_occurrence(&self, origin: DateTime<Utc>, _: bool) -> Option<DateTime<Utc>> {
            Some(origin)
        }
    }

    fn handler(name: &str) -> Arc<dyn Handler> {
        Arc::new(NoopHandler(name.to_string()))
    }

    fn trigger(expr: &str) -> Trigger {
        Trigger::new("test", expr, std::sync::Arc::new(NowRule))
    }

    #[test]
    fn duplicate_bind_is_a_no_op() {
        let registry = ScheduleRegistry::new();
        let t = trigger("a");
        let (added, _) = registry.bind(handler("h"), &t);
        assert!(added);
        let (added, slot) = registry.bind(handler("h"), &t);
        assert!(!added);
        assert_eq!(slot.len(), 1);
        assert_eq!(registry.handlers().len(), 1);
    }

    #[test]
    fn rebind_moves_all_bindings() {
        let registry = ScheduleRegistry::new();
        let (t1, t2, t3) = (trigger("a"), trigger("b"), trigger("c"));
        registry.bind(handler("h"), &t1);
        registry.bind(handler("h"), &t2);
        registry.rebind(handler("h"), &t3);
        assert!(registry.get_handlers(&t1).is_empty());
        assert!(registry.get_handlers(&t2).is_empty());
        assert_eq!(registry.get_handlers(&t3).len(), 1);
        assert_eq!(registry.handlers().len(), 1);
    }

    #[test]
    fn rebind_of_unknown_handler_is_a_bind() {
        let registry = ScheduleRegistry::new();
        let t = trigger("a");
        registry.rebind(handler("h"), &t);
        assert_eq!(registry.get_handlers(&t).len(), 1);
    }

    #[test]
    fn unbind_handler_removes_every_binding() {
        let registry = ScheduleRegistry::new();
        let (t1, t2) = (trigger("a"), trigger("b"));
        registry.bind(handler("h"), &t1);
        registry.bind(handler("h"), &t2);
        assert!(registry.unbind_handler("h"));
        assert!(!registry.unbind_handler("h"));
        assert!(registry.get_handlers(&t1).is_empty());
        assert!(registry.handlers().is_empty());
    }

    #[test]
    fn unbind_trigger_prunes_orphaned_handlers() {
        let registry = ScheduleRegistry::new();
        let (t1, t2) = (trigger("a"), trigger("b"));
        registry.bind(handler("only-a"), &t1);
        registry.bind(handler("both"), &t1);
        registry.bind(handler("both"), &t2);
        assert!(registry.unbind_trigger(&t1));
        // "both" survives through t2; "only-a" had no other binding.
        assert!(registry.get_handler("only-a").is_none());
        assert!(registry.get_handler("both").is_some());
    }

    #[test]
    fn clear_empties_both_maps() {
        let registry = ScheduleRegistry::new();
        registry.bind(handler("h"), &trigger("a"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.handlers().is_empty());
    }

    #[test]
    fn get_handlers_of_unknown_trigger_is_empty() {
        let registry = ScheduleRegistry::new();
        assert!(registry.get_handlers(&trigger("missing")).is_empty());
    }
}
