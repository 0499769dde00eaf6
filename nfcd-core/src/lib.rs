//! Core engines of an NFC daemon: the Target/Initiator command pumps that
//! every RF role builds on, the Type 2 and Type 4 tag drivers, the Host
//! card-emulation engine, and the Adapter supervisor that ties them
//! together under a single [`manager::Manager`].
//!
//! Everything here runs on one `tokio::task::LocalSet` — nothing crosses
//! a thread boundary, so state is `Rc<RefCell<_>>` rather than
//! `Arc<Mutex<_>>` throughout (see `event.rs`).

pub mod adapter;
pub mod apdu;
pub mod error;
pub mod event;
pub mod host;
pub mod initiator;
pub mod manager;
pub mod ndef;
pub mod peer_io;
pub mod tag;
pub mod target;

pub use adapter::{Adapter, AdapterDriver};
pub use error::{ApduCodecError, ReactivateStatus, StatusWord, TransmitStatus, Type2Status};
pub use host::{Host, HostApp, HostService};
pub use initiator::{Initiator, InitiatorDriver, Transmission};
pub use manager::Manager;
pub use ndef::Record as NdefRecord;
pub use peer_io::{PeerIo, PeerIoDriver};
pub use target::{Protocol, Sequence, Target, TargetDriver, Technology};
