//! Root of the object graph (spec §5 "Global state": "the tree is rooted
//! in a Manager that owns Adapters; no other module-level mutable state").
//!
//! Grounded on `examples/original_source/core/include/nfc_manager.h`'s
//! adapter registry and added/removed signals, and on the teacher's own
//! top-level `AppState` in
//! `examples/FlammeGamer-spoolbuddy/server/src/main.rs`.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::adapter::Adapter;
use crate::event::Signal;

pub struct AdapterEvent {
    pub name: String,
    pub added: bool,
}

struct ManagerState {
    adapters: Vec<Adapter>,
    enabled: bool,
    on_adapter: Signal<AdapterEvent>,
}

/// Owns every [`Adapter`] known to the daemon. There is exactly one of
/// these per process.
#[derive(Clone)]
pub struct Manager {
    state: Rc<RefCell<ManagerState>>,
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            state: Rc::new(RefCell::new(ManagerState { adapters: Vec::new(), enabled: true, on_adapter: Signal::new() })),
        }
    }

    pub fn on_adapter(&self, handler: impl FnMut(&AdapterEvent) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_adapter.connect(handler)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    /// Enabling/disabling the manager cascades to every adapter (spec
    /// §4.6: an adapter can't be powered while its manager is disabled).
    pub fn set_enabled(&self, enabled: bool) {
        self.state.borrow_mut().enabled = enabled;
        for adapter in self.state.borrow().adapters.iter() {
            adapter.set_enabled(enabled);
        }
    }

    pub fn add_adapter(&self, adapter: Adapter) {
        let name = adapter.name();
        info!(name, "manager: adapter added");
        adapter.set_enabled(self.state.borrow().enabled);
        self.state.borrow_mut().adapters.push(adapter);
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_adapter);
        signal.emit(&AdapterEvent { name, added: true });
        self.state.borrow_mut().on_adapter = signal;
    }

    pub fn remove_adapter(&self, name: &str) {
        let removed = {
            let mut st = self.state.borrow_mut();
            let before = st.adapters.len();
            st.adapters.retain(|a| a.name() != name);
            st.adapters.len() != before
        };
        if removed {
            info!(name, "manager: adapter removed");
            let mut signal = std::mem::take(&mut self.state.borrow_mut().on_adapter);
            signal.emit(&AdapterEvent { name: name.to_string(), added: false });
            self.state.borrow_mut().on_adapter = signal;
        }
    }

    pub fn adapter(&self, name: &str) -> Option<Adapter> {
        self.state.borrow().adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn adapters(&self) -> Vec<Adapter> {
        self.state.borrow().adapters.clone()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterDriver;

    struct MockDriver;

    impl AdapterDriver for MockDriver {
        fn request_power(&mut self, _on: bool) -> bool {
            true
        }
        fn request_mode(&mut self, _mode: u32) -> bool {
            true
        }
    }

    #[test]
    fn adding_and_removing_adapters_updates_the_registry() {
        let manager = Manager::new();
        manager.add_adapter(Adapter::new("nfc0", MockDriver, 0));
        assert_eq!(manager.adapters().len(), 1);
        assert!(manager.adapter("nfc0").is_some());
        manager.remove_adapter("nfc0");
        assert!(manager.adapter("nfc0").is_none());
    }

    #[test]
    fn disabling_manager_cascades_to_adapters() {
        let manager = Manager::new();
        let adapter = Adapter::new("nfc0", MockDriver, 0);
        manager.add_adapter(adapter.clone());
        manager.set_enabled(false);
        assert!(!adapter.is_enabled());
        assert!(!adapter.request_power(true));
    }
}
