//! Initiator engine (spec §4.2): the "we are tag, remote is reader"
//! direction — responding to transmissions a remote reader sends us.
//!
//! Grounded on `examples/original_source/core/src/nfc_initiator.c`. Unlike
//! the Target engine there is no outbound queue to manage: the remote side
//! drives the pace, and our job is to route each inbound transmission to a
//! handler and carry its response (or lack of one) back out.
//!
//! Four states per the original: Idle, AwaitingResponse, ResponseInFlight,
//! Queued. A frame arriving while `AwaitingResponse` (no `respond()` yet)
//! is a stray and deactivates the link; a frame arriving while
//! `ResponseInFlight` (response handed to the driver, confirmation not
//! back yet) is queued behind it, one slot; a frame arriving while
//! `Queued` also deactivates.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::event::Signal;

pub type TransmissionId = u32;

/// Hardware-facing boundary for the tag-emulation direction (spec §6).
///
/// `respond`/`respond_none` only start the response; like
/// [`crate::target::TargetDriver::transmit`], completion arrives later
/// through [`Initiator::response_sent`], called by whoever owns the driver
/// once the hardware confirms the frame actually went out over RF.
pub trait InitiatorDriver {
    /// Starts sending `data` back to the remote reader as the response to
    /// the transmission currently being handled. Returns `false` on
    /// immediate submit failure.
    fn respond(&mut self, data: &[u8]) -> bool;

    /// Declines to respond (equivalent to an empty/NAK response, or simply
    /// letting the remote reader's own timeout fire). Returns `false` on
    /// immediate submit failure.
    fn respond_none(&mut self) -> bool;

    fn deactivate(&mut self);
}

/// One inbound command from the remote reader and the machinery for
/// routing exactly one response back to it.
///
/// Refcounted like [`crate::target::Sequence`] (spec Design Notes §9):
/// handlers receive a clone and may hold on to it past the emission of the
/// `transmission` event, to respond asynchronously.
#[derive(Clone)]
pub struct Transmission {
    inner: Rc<RefCell<TransmissionInner>>,
}

struct TransmissionInner {
    id: TransmissionId,
    data: Vec<u8>,
    owner: Weak<RefCell<InitiatorState>>,
    responded: bool,
}

impl Transmission {
    pub fn id(&self) -> TransmissionId {
        self.inner.borrow().id
    }

    pub fn data(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    /// Sends `data` as the response. A second call, or a call after this
    /// transmission has been superseded (stray frame deactivated the
    /// link, or a fresh dispatch replaced it), is a silent no-op.
    pub fn respond(&self, data: &[u8]) {
        Initiator::begin_response(&self.inner, Some(data.to_vec()));
    }

    /// Explicitly declines to respond.
    pub fn decline(&self) {
        Initiator::begin_response(&self.inner, None);
    }
}

/// Event payload for [`Initiator::on_transmission`] (spec §4.2 signals).
pub struct TransmissionEvent {
    pub transmission: Transmission,
}

/// Per-initiator state machine position (spec §4.2).
enum Phase {
    Idle,
    AwaitingResponse,
    ResponseInFlight,
    /// Exactly one queue slot: a frame that arrived during
    /// `ResponseInFlight`, held until the in-flight response is confirmed.
    Queued(Vec<u8>, TransmissionId),
}

struct InitiatorState {
    driver: Box<dyn InitiatorDriver>,
    last_id: TransmissionId,
    phase: Phase,
    /// The transmission that owns the current phase, if any (`None` only
    /// while `Idle`).
    current: Option<Transmission>,
    on_transmission: Signal<TransmissionEvent>,
}

/// A handle mediating one RF session in the tag-emulation direction (spec
/// §3 Initiator, §4.2 Initiator engine).
#[derive(Clone)]
pub struct Initiator {
    state: Rc<RefCell<InitiatorState>>,
}

impl Initiator {
    pub fn new(driver: impl InitiatorDriver + 'static) -> Self {
        Initiator {
            state: Rc::new(RefCell::new(InitiatorState {
                driver: Box::new(driver),
                last_id: 0,
                phase: Phase::Idle,
                current: None,
                on_transmission: Signal::new(),
            })),
        }
    }

    pub fn on_transmission(&self, handler: impl FnMut(&TransmissionEvent) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_transmission.connect(handler)
    }

    /// Driver boundary: the remote reader sent `data` (spec §6 `transmit`,
    /// initiator direction).
    ///
    /// - Idle: dispatch immediately.
    /// - AwaitingResponse (no `respond()` yet): stray frame, deactivate.
    /// - ResponseInFlight: queue this frame, one slot.
    /// - Queued (slot already occupied): stray frame, deactivate.
    pub fn transmit(&self, data: Vec<u8>) -> TransmissionId {
        let mut st = self.state.borrow_mut();
        st.last_id = st.last_id.wrapping_add(1);
        if st.last_id == 0 {
            st.last_id = 1;
        }
        let id = st.last_id;
        match st.phase {
            Phase::Idle => {
                drop(st);
                self.dispatch(data, id);
            }
            Phase::AwaitingResponse => {
                warn!(id, "initiator: frame arrived before the previous one was answered, deactivating");
                st.phase = Phase::Idle;
                st.current = None;
                drop(st);
                self.state.borrow_mut().driver.deactivate();
            }
            Phase::ResponseInFlight => {
                trace!(id, "initiator: frame arrived while a response is in flight, queueing");
                st.phase = Phase::Queued(data, id);
            }
            Phase::Queued(..) => {
                warn!(id, "initiator: frame arrived with the queue slot already occupied, deactivating");
                st.phase = Phase::Idle;
                st.current = None;
                drop(st);
                self.state.borrow_mut().driver.deactivate();
            }
        }
        id
    }

    fn dispatch(&self, data: Vec<u8>, id: TransmissionId) {
        let transmission = Transmission {
            inner: Rc::new(RefCell::new(TransmissionInner {
                id,
                data,
                owner: Rc::downgrade(&self.state),
                responded: false,
            })),
        };
        {
            let mut st = self.state.borrow_mut();
            st.current = Some(transmission.clone());
            st.phase = Phase::AwaitingResponse;
        }
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_transmission);
        signal.emit(&TransmissionEvent { transmission });
        self.state.borrow_mut().on_transmission = signal;
    }

    /// `Transmission::respond`/`decline` boundary: hands the response to
    /// the driver and moves `AwaitingResponse` → `ResponseInFlight`. A
    /// stale handle (superseded by a stray-deactivate or a fresh dispatch)
    /// is a silent no-op.
    fn begin_response(inner: &Rc<RefCell<TransmissionInner>>, data: Option<Vec<u8>>) {
        let (id, owner) = {
            let mut t = inner.borrow_mut();
            if t.responded {
                return;
            }
            t.responded = true;
            (t.id, t.owner.clone())
        };
        let Some(state) = owner.upgrade() else { return };
        let is_current = {
            let st = state.borrow();
            matches!(st.phase, Phase::AwaitingResponse) && st.current.as_ref().map(|t| t.id()) == Some(id)
        };
        if !is_current {
            return;
        }
        let sent = match &data {
            Some(bytes) => state.borrow_mut().driver.respond(bytes),
            None => state.borrow_mut().driver.respond_none(),
        };
        if sent {
            state.borrow_mut().phase = Phase::ResponseInFlight;
        } else {
            warn!("initiator: driver rejected the response, deactivating");
            state.borrow_mut().phase = Phase::Idle;
            state.borrow_mut().current = None;
            state.borrow_mut().driver.deactivate();
        }
    }

    /// Driver boundary: the response handed to `respond`/`respond_none`
    /// has been confirmed sent over RF. `ResponseInFlight` → `Idle`;
    /// `Queued` → `AwaitingResponse`, dispatching the queued frame. A
    /// confirmation with nothing in flight is ignored.
    pub fn response_sent(&self) {
        let queued = {
            let mut st = self.state.borrow_mut();
            match st.phase {
                Phase::ResponseInFlight => {
                    st.phase = Phase::Idle;
                    st.current = None;
                    None
                }
                Phase::Queued(..) => {
                    let Phase::Queued(data, id) = std::mem::replace(&mut st.phase, Phase::Idle) else {
                        unreachable!()
                    };
                    st.current = None;
                    Some((data, id))
                }
                _ => {
                    warn!("initiator: response confirmation with nothing in flight, ignoring");
                    None
                }
            }
        };
        if let Some((data, id)) = queued {
            self.dispatch(data, id);
        }
    }

    /// Handler never responded and never will (e.g. no processor claimed
    /// it): drop it without sending anything, matching the original's
    /// "unhandled transmission" fallback of deactivating the link.
    pub fn drop_unhandled(&self) {
        let mut st = self.state.borrow_mut();
        if !matches!(st.phase, Phase::AwaitingResponse) {
            return;
        }
        warn!("initiator: transmission went unhandled, deactivating");
        st.phase = Phase::Idle;
        st.current = None;
        drop(st);
        self.state.borrow_mut().driver.deactivate();
    }

    /// Drops any in-flight or queued transmission without responding,
    /// e.g. because the link is about to be reactivated or torn down
    /// (`nfc_initiator_drop_transactions`).
    pub fn drop_transactions(&self) {
        let mut st = self.state.borrow_mut();
        st.phase = Phase::Idle;
        st.current = None;
    }
}
