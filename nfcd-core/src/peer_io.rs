//! Peer-to-peer IO boundary (spec §1 non-goal: LLCP/SNEP transport
//! internals, SAP allocation, and connection-oriented service dispatch are
//! out of scope for this core — see `SPEC_FULL.md` Open Question 2). This
//! module only exposes the raw-frame IO abstraction an LLCP implementation
//! would sit behind, in the same shape as [`crate::initiator::Initiator`]'s
//! driver boundary.
//!
//! Grounded on `examples/original_source/core/include/nfc_peer.h`: a
//! `PeerIo` tracks the handful of properties `NfcPeer` exposes
//! (`wks`, `ndef`, `initialized`/`present`) without attempting to model
//! `nfc_peer_connect`/`NfcPeerConnection`.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::event::Signal;
use crate::ndef;

/// Hardware-facing boundary for sending/deactivating a peer link.
pub trait PeerIoDriver {
    /// Sends a raw LLCP PDU. Returns `false` if the link can't accept it
    /// right now (e.g. already deactivated).
    fn send(&mut self, data: &[u8]) -> bool;
    fn deactivate(&mut self);
}

struct PeerIoState {
    driver: Box<dyn PeerIoDriver>,
    initialized: bool,
    wks: u32,
    ndef: Option<Vec<u8>>,
    on_initialized: Signal<()>,
    on_wks_changed: Signal<()>,
    on_ndef_changed: Signal<()>,
    on_data: Signal<Vec<u8>>,
    on_gone: Signal<()>,
}

/// A handle to one active peer-to-peer link (spec §3 Peer, reduced to its
/// IO surface).
#[derive(Clone)]
pub struct PeerIo {
    state: Rc<RefCell<PeerIoState>>,
}

impl PeerIo {
    pub fn new(driver: impl PeerIoDriver + 'static) -> Self {
        PeerIo {
            state: Rc::new(RefCell::new(PeerIoState {
                driver: Box::new(driver),
                initialized: false,
                wks: 0,
                ndef: None,
                on_initialized: Signal::new(),
                on_wks_changed: Signal::new(),
                on_ndef_changed: Signal::new(),
                on_data: Signal::new(),
                on_gone: Signal::new(),
            })),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    pub fn wks(&self) -> u32 {
        self.state.borrow().wks
    }

    pub fn ndef(&self) -> Option<crate::ndef::Record> {
        let bytes = self.state.borrow().ndef.clone()?;
        ndef::decode(&bytes).map(|(record, _)| record)
    }

    pub fn on_initialized(&self, handler: impl FnMut(&()) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_initialized.connect(handler)
    }

    pub fn on_wks_changed(&self, handler: impl FnMut(&()) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_wks_changed.connect(handler)
    }

    pub fn on_ndef_changed(&self, handler: impl FnMut(&()) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_ndef_changed.connect(handler)
    }

    /// Fires for every inbound raw PDU. An LLCP layer built on top of this
    /// module would subscribe here to decode and dispatch frames.
    pub fn on_data(&self, handler: impl FnMut(&Vec<u8>) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_data.connect(handler)
    }

    pub fn on_gone(&self, handler: impl FnMut(&()) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_gone.connect(handler)
    }

    /// Marks link activation complete (ATR exchange done). Mirrors
    /// `nfc_peer_add_initialized_handler`'s one-shot semantics: fires at
    /// most once.
    pub fn mark_initialized(&self) {
        let already = self.state.borrow().initialized;
        if already {
            return;
        }
        self.state.borrow_mut().initialized = true;
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_initialized);
        signal.emit(&());
        self.state.borrow_mut().on_initialized = signal;
    }

    /// Updates the remote Well-Known Services mask, as carried by LLCP's
    /// SNL PDU.
    pub fn set_wks(&self, wks: u32) {
        let changed = {
            let mut st = self.state.borrow_mut();
            let changed = st.wks != wks;
            st.wks = wks;
            changed
        };
        if changed {
            let mut signal = std::mem::take(&mut self.state.borrow_mut().on_wks_changed);
            signal.emit(&());
            self.state.borrow_mut().on_wks_changed = signal;
        }
    }

    /// Records an NDEF message received over SNEP.
    pub fn set_ndef(&self, data: Vec<u8>) {
        self.state.borrow_mut().ndef = Some(data);
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_ndef_changed);
        signal.emit(&());
        self.state.borrow_mut().on_ndef_changed = signal;
    }

    /// Sends a raw LLCP PDU over the link.
    pub fn send(&self, data: &[u8]) -> bool {
        self.state.borrow_mut().driver.send(data)
    }

    /// Driver boundary: an inbound raw LLCP PDU arrived.
    pub fn receive(&self, data: Vec<u8>) {
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_data);
        signal.emit(&data);
        self.state.borrow_mut().on_data = signal;
    }

    pub fn deactivate(&self) {
        self.state.borrow_mut().driver.deactivate();
    }

    /// Driver boundary: the link has gone away (spec §3 `gone` pattern,
    /// shared with `Target`/`Initiator`).
    pub fn gone(&self) {
        debug!("peer_io: link gone");
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_gone);
        signal.emit(&());
        self.state.borrow_mut().on_gone = signal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[derive(Default)]
    struct MockDriver {
        sent: Rc<StdRefCell<Vec<Vec<u8>>>>,
    }

    impl PeerIoDriver for MockDriver {
        fn send(&mut self, data: &[u8]) -> bool {
            self.sent.borrow_mut().push(data.to_vec());
            true
        }
        fn deactivate(&mut self) {}
    }

    #[test]
    fn mark_initialized_fires_only_once() {
        let peer = PeerIo::new(MockDriver::default());
        let count = Rc::new(StdRefCell::new(0));
        let c = count.clone();
        peer.on_initialized(move |_| *c.borrow_mut() += 1);
        peer.mark_initialized();
        peer.mark_initialized();
        assert_eq!(*count.borrow(), 1);
        assert!(peer.is_initialized());
    }

    #[test]
    fn wks_change_notifies_only_on_actual_change() {
        let peer = PeerIo::new(MockDriver::default());
        let count = Rc::new(StdRefCell::new(0));
        let c = count.clone();
        peer.on_wks_changed(move |_| *c.borrow_mut() += 1);
        peer.set_wks(0x06);
        peer.set_wks(0x06);
        peer.set_wks(0x07);
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn received_pdu_is_forwarded_to_subscribers() {
        let peer = PeerIo::new(MockDriver::default());
        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let s = seen.clone();
        peer.on_data(move |data| s.borrow_mut().push(data.clone()));
        peer.receive(vec![0x01, 0x02]);
        assert_eq!(*seen.borrow(), vec![vec![0x01, 0x02]]);
    }

    #[test]
    fn ndef_over_snep_round_trips_through_decode() {
        let peer = PeerIo::new(MockDriver::default());
        let record = ndef::Record::uri("http://example.com");
        peer.set_ndef(record.encode());
        assert_eq!(peer.ndef(), Some(record));
    }
}
