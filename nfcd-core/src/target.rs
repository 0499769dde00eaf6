//! Target engine (spec §4.1): request queueing, sequencing, timeouts,
//! cancellation and reactivation for the "we are reader, remote is tag"
//! direction.
//!
//! Grounded on `examples/original_source/core/src/nfc_target.c`. The C
//! original threads everything through a `GObject` with manual refcounting;
//! here a `Target` is a single-owner handle (`Rc<RefCell<TargetState>>`)
//! held by whichever tag driver wraps it (spec §3 "Target... Ownership:
//! owned by the tag driver"). `Sequence` is the one piece that legitimately
//! outlives and is shared independently of its `Target` (spec Design Notes
//! §9), so it alone carries its own `Rc` and a `Weak` back-pointer.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ReactivateStatus, TransmitStatus};
use crate::event::Signal;

/// Default per-request transmit timeout (spec §4.1).
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Default reactivation timeout (spec §4.1).
pub const DEFAULT_REACTIVATION_TIMEOUT: Duration = Duration::from_secs(1);

pub type RequestId = u32;
type SequenceToken = u64;

/// RF technology a target was discovered on (spec §3 Target fields; spec §6
/// "numeric classification of SEL_RES/NFCID1").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technology {
    A,
    B,
    F,
}

/// Logical protocol running on top of the RF technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Mifare,
    IsoDep,
    Felica,
    NfcDep,
    T1,
    T2,
    T3,
}

/// Hardware-facing boundary a concrete radio driver implements (spec §6).
///
/// Every method here either starts an operation or reports whether it could
/// be started; completion always arrives later through
/// [`Target::transmit_done`], [`Target::reactivated`] or [`Target::gone`],
/// called by whatever owns the driver once the hardware responds.
pub trait TargetDriver {
    /// Starts sending `data`. Returns `false` on immediate submit failure.
    fn transmit(&mut self, data: &[u8]) -> bool;

    /// Aborts whatever transmission is currently in flight, if any.
    fn cancel_transmit(&mut self);

    /// Requests RF deactivation; the driver is expected to eventually call
    /// [`Target::gone`].
    fn deactivate(&mut self);

    /// Begins logical re-selection. Returns `false` if this driver cannot
    /// start one right now (or never can — see [`TargetDriver::can_reactivate`]).
    fn reactivate(&mut self) -> bool {
        false
    }

    /// Whether this driver implements reactivation at all.
    fn can_reactivate(&self) -> bool {
        false
    }
}

type CompleteFn = Box<dyn FnOnce(TransmitStatus, &[u8])>;
type ReactivateFn = Box<dyn FnOnce(ReactivateStatus)>;

struct PendingRequest {
    id: RequestId,
    seq: Option<SequenceToken>,
    seq_ref: Option<Sequence>,
    data: Vec<u8>,
    complete: Option<CompleteFn>,
}

struct ActiveRequest {
    id: RequestId,
    #[allow(dead_code)]
    seq_ref: Option<Sequence>,
    complete: Option<CompleteFn>,
    timeout: Option<JoinHandle<()>>,
}

struct ReactivationState {
    callback: Option<ReactivateFn>,
    #[allow(dead_code)]
    seq_ref: Option<Sequence>,
    timer: JoinHandle<()>,
}

struct TargetState {
    driver: Box<dyn TargetDriver>,
    present: bool,
    last_req_id: RequestId,
    queue: VecDeque<PendingRequest>,
    active: Option<ActiveRequest>,
    seq_queue: VecDeque<SequenceToken>,
    next_seq_token: SequenceToken,
    active_seq: Option<SequenceToken>,
    reactivation: Option<ReactivationState>,
    transmit_timeout: Option<Duration>,
    on_sequence_changed: Signal<Option<SequenceToken>>,
    on_gone: Signal<()>,
}

/// A handle to a remote tag (spec §3 Target, §4.1 Target engine).
#[derive(Clone)]
pub struct Target {
    state: Rc<RefCell<TargetState>>,
    pub technology: Technology,
    pub protocol: Protocol,
}

impl Target {
    pub fn new(driver: impl TargetDriver + 'static, technology: Technology, protocol: Protocol) -> Self {
        Target {
            state: Rc::new(RefCell::new(TargetState {
                driver: Box::new(driver),
                present: true,
                last_req_id: 0,
                queue: VecDeque::new(),
                active: None,
                seq_queue: VecDeque::new(),
                next_seq_token: 1,
                active_seq: None,
                reactivation: None,
                transmit_timeout: Some(DEFAULT_TRANSMIT_TIMEOUT),
                on_sequence_changed: Signal::new(),
                on_gone: Signal::new(),
            })),
            technology,
            protocol,
        }
    }

    /// Overrides the per-request transmit timeout (`None` disables it).
    pub fn set_transmit_timeout(&self, timeout: Option<Duration>) {
        self.state.borrow_mut().transmit_timeout = timeout;
    }

    pub fn present(&self) -> bool {
        self.state.borrow().present
    }

    pub fn sequence(&self) -> Option<Sequence> {
        let st = self.state.borrow();
        st.active_seq.map(|token| Sequence::existing(token, &self.state))
    }

    pub fn on_sequence_changed(&self, handler: impl FnMut(&Option<SequenceToken>) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_sequence_changed.connect(handler)
    }

    pub fn on_gone(&self, handler: impl FnMut(&()) + 'static) -> crate::event::HandlerId {
        self.state.borrow_mut().on_gone.connect(handler)
    }

    /// Creates a [`Sequence`] reserved against this target.
    ///
    /// If no sequence is currently active, the new one immediately becomes
    /// active, even before any request is queued against it (spec §4.1).
    pub fn new_sequence(&self) -> Sequence {
        let token = {
            let mut st = self.state.borrow_mut();
            let token = st.next_seq_token;
            st.next_seq_token += 1;
            st.seq_queue.push_back(token);
            token
        };
        if self.state.borrow().active_seq.is_none() {
            Self::set_active_sequence(&self.state, Some(token));
        }
        Sequence::existing(token, &self.state)
    }

    /// Submits one outbound command (spec §4.1 Queueing discipline).
    pub fn submit(
        &self,
        data: Vec<u8>,
        seq: Option<&Sequence>,
        complete: impl FnOnce(TransmitStatus, &[u8]) + 'static,
    ) -> RequestId {
        self.submit_boxed(data, seq, Box::new(complete))
    }

    fn submit_boxed(&self, data: Vec<u8>, seq: Option<&Sequence>, complete: CompleteFn) -> RequestId {
        let seq_token = seq.map(|s| s.token);
        let seq_ref = seq.cloned();
        let (id, dispatch_now) = {
            let mut st = self.state.borrow_mut();
            let id = Self::next_request_id(&mut st);
            let dispatch_now = st.active.is_none()
                && ((seq_token.is_none() && st.active_seq.is_none())
                    || (seq_token.is_some()
                        && seq_token == st.active_seq
                        && !st.queue.iter().any(|r| r.seq == seq_token)));
            (id, dispatch_now)
        };
        if dispatch_now {
            Self::dispatch(&self.state, id, seq_token, seq_ref, &data, complete);
        } else {
            self.state.borrow_mut().queue.push_back(PendingRequest { id, seq: seq_token, seq_ref, data, complete: Some(complete) });
        }
        id
    }

    fn next_request_id(st: &mut TargetState) -> RequestId {
        st.last_req_id = st.last_req_id.wrapping_add(1);
        if st.last_req_id == 0 {
            st.last_req_id = 1;
        }
        st.last_req_id
    }

    /// Starts sending `data` for an already-approved request, arming its
    /// timeout timer on success and failing it synchronously on an
    /// immediate driver rejection.
    fn dispatch(
        state: &Rc<RefCell<TargetState>>,
        id: RequestId,
        seq_token: Option<SequenceToken>,
        seq_ref: Option<Sequence>,
        data: &[u8],
        complete: CompleteFn,
    ) {
        if seq_token.is_some() && state.borrow().active_seq.is_none() {
            Self::set_active_sequence(state, seq_token);
        }
        let submitted = state.borrow_mut().driver.transmit(data);
        if !submitted {
            trace!(id, "target submit rejected by driver");
            complete(TransmitStatus::Error, &[]);
            Self::schedule_next(state);
            return;
        }
        let timeout_dur = state.borrow().transmit_timeout;
        let timeout = timeout_dur.map(|dur| {
            let weak: Weak<RefCell<TargetState>> = Rc::downgrade(state);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(dur).await;
                if let Some(state) = weak.upgrade() {
                    Target::fire_timeout(&state, id);
                }
            })
        });
        state.borrow_mut().active = Some(ActiveRequest { id, seq_ref, complete: Some(complete), timeout });
    }

    fn fire_timeout(state: &Rc<RefCell<TargetState>>, id: RequestId) {
        let complete = {
            let mut st = state.borrow_mut();
            match &st.active {
                Some(active) if active.id == id => {
                    let mut active = st.active.take().unwrap();
                    active.timeout = None; // this timer firing *is* the completion
                    st.driver.cancel_transmit();
                    active.complete.take()
                }
                _ => return,
            }
        };
        debug!(id, "target transmit timed out");
        if let Some(cb) = complete {
            cb(TransmitStatus::Timeout, &[]);
        }
        Self::schedule_next(state);
    }

    /// Driver boundary: completes the active request (spec §6 `transmit_done`).
    pub fn transmit_done(&self, status: TransmitStatus, data: &[u8]) {
        let complete = {
            let mut st = self.state.borrow_mut();
            match st.active.take() {
                Some(mut active) => {
                    if let Some(h) = active.timeout.take() {
                        h.abort();
                    }
                    active.complete.take()
                }
                None => return,
            }
        };
        if let Some(cb) = complete {
            cb(status, data);
        }
        Self::schedule_next(&self.state);
    }

    /// Cancels a request by id. Idempotent and safe on unknown ids.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut st = self.state.borrow_mut();
        if let Some(active) = &st.active {
            if active.id == id {
                let mut active = st.active.take().unwrap();
                active.complete = None;
                if let Some(h) = active.timeout.take() {
                    h.abort();
                }
                st.driver.cancel_transmit();
                drop(st);
                Self::schedule_next(&self.state);
                return true;
            }
        }
        if let Some(pos) = st.queue.iter().position(|r| r.id == id) {
            st.queue.remove(pos);
            return true;
        }
        false
    }

    fn schedule_next(state: &Rc<RefCell<TargetState>>) {
        loop {
            if state.borrow().active.is_some() {
                return;
            }
            let next = {
                let mut st = state.borrow_mut();
                let active_seq = st.active_seq;
                let pos = st.queue.iter().position(|r| r.seq == active_seq);
                pos.map(|p| st.queue.remove(p).unwrap())
            };
            let Some(req) = next else { return };
            let PendingRequest { id, seq, seq_ref, data, complete } = req;
            let complete = complete.expect("queued request always carries a callback");
            Self::dispatch(state, id, seq, seq_ref, &data, complete);
            // dispatch() either armed `active` (loop exits above) or failed
            // synchronously and recursed into schedule_next already; either
            // way this loop iteration is done.
            if state.borrow().active.is_some() {
                return;
            }
        }
    }

    /// Logically re-selects the target, restoring its initial state.
    ///
    /// A reactivation already in progress blocks a new one from starting.
    pub fn reactivate(&self, seq: Option<&Sequence>, callback: Option<impl FnOnce(ReactivateStatus) + 'static>) -> bool {
        if self.state.borrow().reactivation.is_some() {
            return false;
        }
        if !self.state.borrow().driver.can_reactivate() {
            if let Some(cb) = callback {
                cb(ReactivateStatus::Failure);
            }
            return false;
        }
        let started = self.state.borrow_mut().driver.reactivate();
        if !started {
            if let Some(cb) = callback {
                cb(ReactivateStatus::Failure);
            }
            return false;
        }
        let weak: Weak<RefCell<TargetState>> = Rc::downgrade(&self.state);
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(DEFAULT_REACTIVATION_TIMEOUT).await;
            if let Some(state) = weak.upgrade() {
                Target::fire_reactivation_timeout(&state);
            }
        });
        self.state.borrow_mut().reactivation = Some(ReactivationState {
            callback: callback.map(|cb| Box::new(cb) as ReactivateFn),
            seq_ref: seq.cloned(),
            timer,
        });
        true
    }

    fn fire_reactivation_timeout(state: &Rc<RefCell<TargetState>>) {
        let cb = state.borrow_mut().reactivation.take().and_then(|mut r| r.callback.take());
        warn!("target reactivation timed out");
        state.borrow_mut().driver.deactivate();
        if let Some(cb) = cb {
            cb(ReactivateStatus::Failure);
        }
    }

    /// Driver boundary: reactivation succeeded (spec §6 `reactivated`).
    pub fn reactivated(&self) {
        let cb = {
            let mut st = self.state.borrow_mut();
            match st.reactivation.take() {
                Some(mut r) => {
                    r.timer.abort();
                    r.callback.take()
                }
                None => return,
            }
        };
        debug!("target reactivated");
        if let Some(cb) = cb {
            cb(ReactivateStatus::Success);
        }
    }

    /// Driver boundary: the target has been lost (spec §6 `gone`, one-way).
    pub fn gone(&self) {
        let (mut queue, active, reactivation) = {
            let mut st = self.state.borrow_mut();
            if !st.present {
                return;
            }
            st.present = false;
            if let Some(r) = &st.reactivation {
                r.timer.abort();
            }
            (std::mem::take(&mut st.queue), st.active.take(), st.reactivation.take())
        };
        if let Some(mut active) = active {
            if let Some(h) = active.timeout.take() {
                h.abort();
            }
            if let Some(cb) = active.complete.take() {
                cb(TransmitStatus::Error, &[]);
            }
        }
        for req in queue.drain(..) {
            if let Some(cb) = req.complete {
                cb(TransmitStatus::Error, &[]);
            }
        }
        if let Some(r) = reactivation {
            if let Some(cb) = r.callback {
                cb(ReactivateStatus::Failure);
            }
        }
        let mut signal = std::mem::take(&mut self.state.borrow_mut().on_gone);
        signal.emit(&());
        self.state.borrow_mut().on_gone = signal;
    }

    fn set_active_sequence(state: &Rc<RefCell<TargetState>>, token: Option<SequenceToken>) {
        let changed = {
            let mut st = state.borrow_mut();
            if st.active_seq == token {
                false
            } else {
                st.active_seq = token;
                true
            }
        };
        if changed {
            let mut signal = std::mem::take(&mut state.borrow_mut().on_sequence_changed);
            signal.emit(&token);
            state.borrow_mut().on_sequence_changed = signal;
        }
    }

    /// Called from [`Sequence`]'s `Drop` when its last reference goes away.
    fn retire_sequence(state: &Rc<RefCell<TargetState>>, token: SequenceToken) {
        let (was_active, next) = {
            let mut st = state.borrow_mut();
            if let Some(pos) = st.seq_queue.iter().position(|t| *t == token) {
                st.seq_queue.remove(pos);
            }
            if st.active_seq == Some(token) {
                // Unsequenced head of the pending queue takes priority, as
                // in the original: it clears the active sequence so
                // unsequenced work can proceed even if other sequences are
                // still queued behind it.
                let head_seq = st.queue.front().map(|r| r.seq);
                let next = match head_seq {
                    Some(s) => s,
                    None => st.seq_queue.front().copied(),
                };
                st.active_seq = next;
                (true, next)
            } else {
                (false, st.active_seq)
            }
        };
        if was_active {
            let mut signal = std::mem::take(&mut state.borrow_mut().on_sequence_changed);
            signal.emit(&next);
            state.borrow_mut().on_sequence_changed = signal;
            Self::schedule_next(state);
        }
    }
}

/// A reservation token serializing a run of requests against one [`Target`]
/// (spec §3 Sequence, §4.1 Sequences).
///
/// Refcounted by design (spec Design Notes §9): cloning shares the same
/// underlying reservation, and the reservation is retired only when the
/// last clone drops.
pub struct Sequence {
    token: SequenceToken,
    target: Weak<RefCell<TargetState>>,
    inner: Rc<()>,
}

impl Sequence {
    fn existing(token: SequenceToken, target: &Rc<RefCell<TargetState>>) -> Self {
        Sequence { token, target: Rc::downgrade(target), inner: Rc::new(()) }
    }
}

impl Clone for Sequence {
    fn clone(&self) -> Self {
        Sequence { token: self.token, target: self.target.clone(), inner: self.inner.clone() }
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            if let Some(state) = self.target.upgrade() {
                Target::retire_sequence(&state, self.token);
            }
        }
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token && self.target.ptr_eq(&other.target)
    }
}
