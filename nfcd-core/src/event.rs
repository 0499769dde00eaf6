//! Typed, single-threaded event channels.
//!
//! Every entity in this crate (`Target`, `Initiator`, tags, `Host`, `Adapter`)
//! publishes a handful of typed events to subscribers registered in order.
//! This is the Rust stand-in for the GObject signal framework the original
//! daemon uses: no variadic arguments, no reflection, one `Signal<Event>`
//! per event kind, dispatched synchronously on whatever thread calls
//! `emit` (the event loop thread, by construction — nothing in this crate
//! is `Send`).

pub type HandlerId = u64;

/// An ordered list of subscribers for one event kind.
pub struct Signal<Event> {
    next_id: HandlerId,
    handlers: Vec<(HandlerId, Box<dyn FnMut(&Event)>)>,
}

impl<Event> Default for Signal<Event> {
    fn default() -> Self {
        Signal { next_id: 1, handlers: Vec::new() }
    }
}

impl<Event> Signal<Event> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, invoked after every previously registered one.
    pub fn connect(&mut self, handler: impl FnMut(&Event) + 'static) -> HandlerId {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Removes a handler. Returns false if `id` is unknown (safe no-op).
    pub fn disconnect(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _)| *hid != id);
        self.handlers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Calls every subscriber with `event`, in registration order.
    ///
    /// Takes `self` by value via [`std::mem::take`] at the call site so a
    /// handler may re-enter the owning object (e.g. drop the last reference
    /// to it) without tripping a `RefCell` double-borrow: see callers in
    /// `target.rs` / `initiator.rs` / `adapter.rs`.
    pub fn emit(&mut self, event: &Event) {
        for (_, handler) in &mut self.handlers {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_fire_in_registration_order() {
        let mut sig: Signal<u32> = Signal::new();
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        sig.connect(move |v| o1.borrow_mut().push((1, *v)));
        let o2 = order.clone();
        sig.connect(move |v| o2.borrow_mut().push((2, *v)));
        sig.emit(&7);
        assert_eq!(*order.borrow(), vec![(1, 7), (2, 7)]);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut sig: Signal<()> = Signal::new();
        let id = sig.connect(|_| {});
        assert!(sig.disconnect(id));
        assert!(!sig.disconnect(id));
    }
}
