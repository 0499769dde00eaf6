//! Adapter supervisor (spec §4.6): power/mode state machines, entity
//! registries for tags/peers/hosts, and a stacked parameter table, all
//! feeding a common event stream.
//!
//! Grounded on the adapter-level orchestration implied by
//! `examples/original_source/core/include/nfc_adapter.h` and, for the
//! registry/event-fan-out shape in Rust terms, on the teacher's own
//! broadcast-channel-style fan-out in
//! `examples/FlammeGamer-spoolbuddy/server/src/websocket/mod.rs`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info};

use crate::event::Signal;
use crate::host::Host;
use crate::peer_io::PeerIo;
use crate::tag::type2::Type2Tag;
use crate::tag::type4::Type4Tag;

/// Hardware-facing boundary for adapter power/mode changes (spec §6,
/// inferred for the supervisor layer from the Target/Initiator driver
/// pattern).
pub trait AdapterDriver {
    /// Starts a power transition. Returns `false` on immediate rejection.
    fn request_power(&mut self, on: bool) -> bool;
    /// Starts a mode transition. Returns `false` on immediate rejection.
    fn request_mode(&mut self, mode: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Tag,
    Peer,
    Host,
}

#[derive(Clone)]
pub enum Tag {
    Type2(Type2Tag),
    Type4(Type4Tag),
}

impl Tag {
    fn target(&self) -> crate::target::Target {
        match self {
            Tag::Type2(t) => t.target(),
            Tag::Type4(t) => t.target(),
        }
    }
}

/// A peer-to-peer target registered with an adapter. Wraps a [`PeerIo`] —
/// connection/SAP management lives in the (unmodeled) LLCP layer above it,
/// per spec §1 non-goal.
#[derive(Clone)]
pub struct Peer {
    pub name: String,
    pub io: PeerIo,
}

pub struct PowerChangedEvent {
    pub powered: bool,
}

pub struct ModeChangedEvent {
    pub mode: u32,
}

pub struct EntityEvent {
    pub kind: Entity,
    pub name: String,
    pub added: bool,
}

struct Registry<T> {
    next_index: u32,
    entries: HashMap<String, T>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry { next_index: 0, entries: HashMap::new() }
    }

    fn generate_name(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}{}", self.next_index);
        self.next_index += 1;
        name
    }
}

struct AdapterState {
    name: String,
    driver: Box<dyn AdapterDriver>,
    enabled: bool,
    powered: bool,
    power_pending: bool,
    supported_modes: u32,
    current_mode: u32,
    requested_mode: Option<u32>,
    tags: Registry<Tag>,
    peers: Registry<Peer>,
    hosts: Registry<Host>,
    params: HashMap<String, Vec<ParamValue>>,
    on_power_changed: Signal<PowerChangedEvent>,
    on_mode_changed: Signal<ModeChangedEvent>,
    on_entity: Signal<EntityEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    U32(u32),
    Bytes(Vec<u8>),
}

/// A named, long-lived RF adapter (spec §3 Adapter, §4.6).
#[derive(Clone)]
pub struct Adapter {
    state: Rc<RefCell<AdapterState>>,
}

impl Adapter {
    pub fn new(name: impl Into<String>, driver: impl AdapterDriver + 'static, supported_modes: u32) -> Self {
        Adapter {
            state: Rc::new(RefCell::new(AdapterState {
                name: name.into(),
                driver: Box::new(driver),
                enabled: true,
                powered: false,
                power_pending: false,
                supported_modes,
                current_mode: 0,
                requested_mode: None,
                tags: Registry::new(),
                peers: Registry::new(),
                hosts: Registry::new(),
                params: HashMap::new(),
                on_power_changed: Signal::new(),
                on_mode_changed: Signal::new(),
                on_entity: Signal::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.state.borrow().powered
    }

    pub fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    pub fn current_mode(&self) -> u32 {
        self.state.borrow().current_mode
    }

    pub fn on_power_changed(&self, handler: impl FnMut(&PowerChangedEvent) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_power_changed.connect(handler)
    }

    pub fn on_mode_changed(&self, handler: impl FnMut(&ModeChangedEvent) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_mode_changed.connect(handler)
    }

    pub fn on_entity(&self, handler: impl FnMut(&EntityEvent) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_entity.connect(handler)
    }

    /// True iff at least one Tag, Peer, or Host is currently registered
    /// (spec §3 Adapter invariant: target-present aggregate).
    pub fn target_present(&self) -> bool {
        let st = self.state.borrow();
        !st.tags.entries.is_empty() || !st.peers.entries.is_empty() || !st.hosts.entries.is_empty()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was_power_pending = {
            let mut st = self.state.borrow_mut();
            let changed = st.enabled != enabled;
            st.enabled = enabled;
            changed && !enabled && st.power_pending
        };
        if was_power_pending {
            debug!("adapter: disabling cancels in-flight power request");
            self.state.borrow_mut().power_pending = false;
        }
    }

    /// Submits a power request to the driver. Only takes effect while
    /// enabled and no other request is already pending (spec §4.6 Power
    /// state machine rules).
    pub fn request_power(&self, on: bool) -> bool {
        let mut st = self.state.borrow_mut();
        if !st.enabled || st.power_pending {
            return false;
        }
        st.power_pending = true;
        let started = st.driver.request_power(on);
        if !started {
            st.power_pending = false;
        }
        started
    }

    /// Driver boundary: power transition completed (or failed).
    pub fn power_notify(&self, on: bool, completed: bool) {
        let (changed, reapply) = {
            let mut st = self.state.borrow_mut();
            st.power_pending = false;
            if !completed {
                // Failed power-on leaves both flags false; a failed
                // power-off is treated the same way — state reverts to
                // "not powered" either way, matching the original's
                // conservative failure handling.
                let changed = st.powered;
                st.powered = false;
                (changed, false)
            } else {
                let changed = st.powered != on;
                st.powered = on;
                if !on {
                    st.current_mode = 0;
                }
                (changed, on && st.requested_mode.is_some())
            }
        };
        if changed {
            let powered = self.state.borrow().powered;
            let mut signal = std::mem::take(&mut self.state.borrow_mut().on_power_changed);
            signal.emit(&PowerChangedEvent { powered });
            self.state.borrow_mut().on_power_changed = signal;
        }
        if reapply {
            let mode = self.state.borrow().requested_mode.unwrap();
            self.request_mode(mode);
        }
    }

    /// Submits a mode request. Rejected outright if it's not a subset of
    /// the adapter's supported modes, or while unpowered.
    pub fn request_mode(&self, mode: u32) -> bool {
        let mut st = self.state.borrow_mut();
        if mode & !st.supported_modes != 0 {
            return false;
        }
        st.requested_mode = Some(mode);
        if !st.powered {
            return false;
        }
        st.driver.request_mode(mode)
    }

    pub fn mode_notify(&self, mode: u32) {
        let changed = {
            let mut st = self.state.borrow_mut();
            let changed = st.current_mode != mode;
            st.current_mode = mode;
            changed
        };
        if changed {
            let mut signal = std::mem::take(&mut self.state.borrow_mut().on_mode_changed);
            signal.emit(&ModeChangedEvent { mode });
            self.state.borrow_mut().on_mode_changed = signal;
        }
    }

    fn emit_entity(&self, kind: Entity, name: String, added: bool) {
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_entity);
        signal.emit(&EntityEvent { kind, name: name.clone(), added });
        self.state.borrow_mut().on_entity = signal;
        info!(name, added, "adapter: entity registry changed");
    }

    /// Registers a newly discovered tag, auto-removing it when its
    /// underlying [`crate::target::Target`] reports `gone`.
    pub fn add_tag(&self, tag: Tag) -> String {
        let name = self.state.borrow_mut().tags.generate_name("tag");
        self.state.borrow_mut().tags.entries.insert(name.clone(), tag.clone());
        let adapter = self.clone();
        let remove_name = name.clone();
        tag.target().on_gone(move |_| adapter.remove_tag(&remove_name));
        self.emit_entity(Entity::Tag, name.clone(), true);
        name
    }

    pub fn remove_tag(&self, name: &str) {
        let removed = self.state.borrow_mut().tags.entries.remove(name).is_some();
        if removed {
            self.emit_entity(Entity::Tag, name.to_string(), false);
        }
    }

    pub fn tag(&self, name: &str) -> Option<Tag> {
        self.state.borrow().tags.entries.get(name).cloned()
    }

    pub fn add_peer(&self, io: PeerIo, name_hint: Option<&str>) -> Peer {
        let name = match name_hint {
            Some(n) => n.to_string(),
            None => self.state.borrow_mut().peers.generate_name("peer"),
        };
        let peer = Peer { name: name.clone(), io };
        self.state.borrow_mut().peers.entries.insert(name.clone(), peer.clone());
        let adapter = self.clone();
        let remove_name = name.clone();
        peer.io.on_gone(move |_| adapter.remove_peer(&remove_name));
        self.emit_entity(Entity::Peer, name, true);
        peer
    }

    pub fn remove_peer(&self, name: &str) {
        let removed = self.state.borrow_mut().peers.entries.remove(name).is_some();
        if removed {
            self.emit_entity(Entity::Peer, name.to_string(), false);
        }
    }

    /// Registers a host, auto-removing it when it reports its own `gone`.
    pub fn add_host(&self, host: Host) -> String {
        let name = self.state.borrow_mut().hosts.generate_name("host");
        self.state.borrow_mut().hosts.entries.insert(name.clone(), host.clone());
        let adapter = self.clone();
        let remove_name = name.clone();
        host.on_gone(move |_| adapter.remove_host(&remove_name));
        self.emit_entity(Entity::Host, name.clone(), true);
        name
    }

    pub fn remove_host(&self, name: &str) {
        let removed = self.state.borrow_mut().hosts.entries.remove(name).is_some();
        if removed {
            self.emit_entity(Entity::Host, name.to_string(), false);
        }
    }

    /// Pushes a parameter override, returning a handle that restores the
    /// previous value (or removes the parameter entirely, if it had no
    /// previous value) when dropped (spec §4.6 Parameters: stacked
    /// request handles).
    pub fn push_param(&self, name: impl Into<String>, value: ParamValue) -> ParamHandle {
        let name = name.into();
        self.state.borrow_mut().params.entry(name.clone()).or_default().push(value);
        ParamHandle { adapter: self.state.clone(), name }
    }

    pub fn param(&self, name: &str) -> Option<ParamValue> {
        self.state.borrow().params.get(name).and_then(|stack| stack.last().cloned())
    }
}

/// Restores the prior value of a pushed parameter when dropped (spec
/// §4.6 "popping restores").
pub struct ParamHandle {
    adapter: Rc<RefCell<AdapterState>>,
    name: String,
}

impl Drop for ParamHandle {
    fn drop(&mut self) {
        let mut st = self.adapter.borrow_mut();
        if let Some(stack) = st.params.get_mut(&self.name) {
            stack.pop();
            if stack.is_empty() {
                st.params.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDriver {
        power_ok: bool,
        mode_ok: bool,
    }

    impl AdapterDriver for MockDriver {
        fn request_power(&mut self, _on: bool) -> bool {
            self.power_ok
        }
        fn request_mode(&mut self, _mode: u32) -> bool {
            self.mode_ok
        }
    }

    fn new_adapter() -> Adapter {
        Adapter::new("nfc0", MockDriver { power_ok: true, mode_ok: true }, 0b111)
    }

    #[test]
    fn power_request_blocks_until_notified() {
        let adapter = new_adapter();
        assert!(adapter.request_power(true));
        assert!(!adapter.request_power(true), "a pending request blocks a new one");
        adapter.power_notify(true, true);
        assert!(adapter.is_powered());
    }

    #[test]
    fn disabling_adapter_blocks_new_power_requests() {
        let adapter = new_adapter();
        adapter.set_enabled(false);
        assert!(!adapter.request_power(true));
    }

    #[test]
    fn mode_request_rejected_when_not_a_subset_of_supported() {
        let adapter = new_adapter();
        adapter.power_notify(true, true);
        assert!(!adapter.request_mode(0b1000));
    }

    #[test]
    fn losing_power_clears_current_mode() {
        let adapter = new_adapter();
        adapter.power_notify(true, true);
        adapter.request_mode(0b011);
        adapter.mode_notify(0b011);
        assert_eq!(adapter.current_mode(), 0b011);
        adapter.power_notify(false, true);
        assert_eq!(adapter.current_mode(), 0);
    }

    #[test]
    fn param_handle_restores_previous_value_on_drop() {
        let adapter = new_adapter();
        assert_eq!(adapter.param("t4_ndef"), None);
        let h1 = adapter.push_param("t4_ndef", ParamValue::Bool(true));
        assert_eq!(adapter.param("t4_ndef"), Some(ParamValue::Bool(true)));
        {
            let _h2 = adapter.push_param("t4_ndef", ParamValue::Bool(false));
            assert_eq!(adapter.param("t4_ndef"), Some(ParamValue::Bool(false)));
        }
        assert_eq!(adapter.param("t4_ndef"), Some(ParamValue::Bool(true)));
        drop(h1);
        assert_eq!(adapter.param("t4_ndef"), None);
    }

    struct MockPeerDriver;

    impl crate::peer_io::PeerIoDriver for MockPeerDriver {
        fn send(&mut self, _data: &[u8]) -> bool {
            true
        }
        fn deactivate(&mut self) {}
    }

    #[test]
    fn target_present_reflects_registry_membership() {
        let adapter = new_adapter();
        assert!(!adapter.target_present());
        let peer = adapter.add_peer(crate::peer_io::PeerIo::new(MockPeerDriver), None);
        assert!(adapter.target_present());
        adapter.remove_peer(&peer.name);
        assert!(!adapter.target_present());
    }

    #[test]
    fn peer_gone_auto_removes_from_registry() {
        let adapter = new_adapter();
        let io = crate::peer_io::PeerIo::new(MockPeerDriver);
        let peer = adapter.add_peer(io.clone(), None);
        assert!(adapter.target_present());
        io.gone();
        assert!(!adapter.target_present());
        assert!(adapter.state.borrow().peers.entries.get(&peer.name).is_none());
    }

    struct MockInitiatorDriver;

    impl crate::initiator::InitiatorDriver for MockInitiatorDriver {
        fn respond(&mut self, _data: &[u8]) -> bool {
            true
        }
        fn respond_none(&mut self) -> bool {
            true
        }
        fn deactivate(&mut self) {}
    }

    #[test]
    fn host_gone_auto_removes_from_registry() {
        let adapter = new_adapter();
        let initiator = crate::initiator::Initiator::new(MockInitiatorDriver);
        let host = Host::new("host0", initiator, Vec::new(), Vec::new());
        let name = adapter.add_host(host.clone());
        assert!(adapter.state.borrow().hosts.entries.get(&name).is_some());
        host.initiator_gone();
        assert!(adapter.state.borrow().hosts.entries.get(&name).is_none());
    }
}
