//! Type 4 tag driver (spec §4.4): ISO-DEP tags exchanging ISO 7816-4 APDUs,
//! with an NDEF Tag Application select/read sequence run once at init.
//!
//! Grounded on `examples/original_source/core/src/nfc_tag_t4.c`: the
//! select-app -> select-CC -> read-CC -> select-NDEF-file -> read-length ->
//! read-data chain, and its one asymmetry that a careless reimplementation
//! would flatten away — reactivation is attempted after every step from
//! "select CC" onward regardless of whether that step succeeded, but NOT
//! after the NDEF Tag Application itself fails to select (there's nothing
//! to restore in that case, so the tag is just left as initially
//! activated).

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::apdu::{Command, Response};
use crate::error::{ReactivateStatus, StatusWord, TransmitStatus};
use crate::ndef;
use crate::target::{Sequence, Target};

/// RF technology underlying the ISO-DEP link (spec §6 "IsoDepTech A/B
/// split" — Type 4 tags can sit on either).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoDepTech {
    A,
    B,
}

const ISO_CLA: u8 = 0x00;
const ISO_INS_SELECT: u8 = 0xa4;
const ISO_INS_READ_BINARY: u8 = 0xb0;
const ISO_P1_SELECT_BY_NAME: u8 = 0x04;
const ISO_P1_SELECT_BY_ID: u8 = 0x00;
const ISO_P2_FIRST_OR_ONLY: u8 = 0x0c;

const NDEF_APP_AID: [u8; 7] = [0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
const NDEF_CC_EF: [u8; 2] = [0xe1, 0x03];
const NDEF_CC_LEN: u32 = 15;
/// Offset of the 2-byte NLEN length prefix within the selected NDEF file.
const NDEF_DATA_OFFSET: u32 = 2;

/// Validates the 15-byte Capability Container and returns the NDEF file id
/// (Table 4 / §5.1.2.1 NDEF File Control TLV, per `nfc_iso_dep_ndef_read_new`):
/// mapping version 2, a File Control TLV (T=4, L=6) at offset 7, read access
/// granted, FID in one of the ranges reserved values carve out of it, and an
/// MLe of at least 0x000f.
fn parse_cc(cc: &[u8]) -> Option<[u8; 2]> {
    if (cc.len() as u32) < NDEF_CC_LEN {
        return None;
    }
    if (cc[2] >> 4) != 2 || cc[7] != 4 || cc[8] != 6 {
        return None;
    }
    let v = &cc[9..];
    if v[4] != 0 {
        return None;
    }
    let fid = ((v[0] as u32) << 8) | v[1] as u32;
    let fid_ok = (0x0001..=0xe101).contains(&fid)
        || (0xe104..=0x3eff).contains(&fid)
        || (0x3f01..=0x3ffe).contains(&fid)
        || (0x4000..=0xfffe).contains(&fid);
    if !fid_ok {
        return None;
    }
    let mle = ((cc[3] as u32) << 8) | cc[4] as u32;
    if mle < 0x000f {
        return None;
    }
    Some([v[0], v[1]])
}

struct Type4State {
    target: Target,
    tech: IsoDepTech,
    ndef: Option<Vec<u8>>,
    initialized: bool,
}

/// A handle to a Type 4 tag (spec §3 Type4Tag).
#[derive(Clone)]
pub struct Type4Tag {
    state: Rc<RefCell<Type4State>>,
}

impl Type4Tag {
    pub fn new(target: Target, tech: IsoDepTech) -> Self {
        Type4Tag { state: Rc::new(RefCell::new(Type4State { target, tech, ndef: None, initialized: false })) }
    }

    pub fn target(&self) -> Target {
        self.state.borrow().target.clone()
    }

    pub fn tech(&self) -> IsoDepTech {
        self.state.borrow().tech
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    pub fn ndef(&self) -> Option<crate::ndef::Record> {
        let bytes = self.state.borrow().ndef.clone()?;
        ndef::decode(&bytes).map(|(record, _)| record)
    }

    /// Runs the NDEF discovery sequence, then attempts reactivation (per
    /// the asymmetry documented on the module) before calling `complete`.
    pub fn init(&self, seq: &Sequence, complete: impl FnOnce() + 'static) {
        let cmd = Command::new(ISO_CLA, ISO_INS_SELECT, ISO_P1_SELECT_BY_NAME, ISO_P2_FIRST_OR_ONLY)
            .with_data(NDEF_APP_AID.to_vec());
        self.transmit(seq, cmd, {
            let this = self.clone();
            let seq = seq.clone();
            move |resp| this.select_app_resp(resp, seq, complete)
        });
    }

    fn transmit(&self, seq: &Sequence, cmd: Command, complete: impl FnOnce(Response) + 'static) {
        let target = self.state.borrow().target.clone();
        let Ok(bytes) = cmd.encode() else {
            complete(Response::status(StatusWord::NO_PRECISE_DIAGNOSIS));
            return;
        };
        target.submit(bytes, Some(seq), move |status, data| {
            let resp = match status {
                TransmitStatus::Ok => Response::decode(data).unwrap_or(Response::status(StatusWord::IO_ERROR)),
                _ => Response::status(StatusWord::IO_ERROR),
            };
            complete(resp);
        });
    }

    fn select_app_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() {
            debug!("type4: found NDEF tag application");
            let cmd = Command::new(ISO_CLA, ISO_INS_SELECT, ISO_P1_SELECT_BY_ID, ISO_P2_FIRST_OR_ONLY)
                .with_data(NDEF_CC_EF.to_vec());
            let this = self.clone();
            let next_seq = seq.clone();
            self.transmit(&seq, cmd, move |resp| this.select_cc_resp(resp, next_seq, complete));
        } else {
            // No app, nothing to restore: skip reactivation entirely.
            self.state.borrow_mut().initialized = true;
            complete();
        }
    }

    fn select_cc_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() {
            let cmd = Command::new(ISO_CLA, ISO_INS_READ_BINARY, 0x00, 0x00).with_le(NDEF_CC_LEN);
            let this = self.clone();
            let next_seq = seq.clone();
            self.transmit(&seq, cmd, move |resp| this.read_cc_resp(resp, next_seq, complete));
        } else {
            self.finish_init(seq, complete);
        }
    }

    fn read_cc_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() {
            if let Some(fid) = parse_cc(&resp.data) {
                let cmd = Command::new(ISO_CLA, ISO_INS_SELECT, ISO_P1_SELECT_BY_ID, ISO_P2_FIRST_OR_ONLY)
                    .with_data(fid.to_vec());
                let this = self.clone();
                let next_seq = seq.clone();
                self.transmit(&seq, cmd, move |resp| this.select_ndef_resp(resp, next_seq, complete));
                return;
            }
        }
        self.finish_init(seq, complete);
    }

    fn select_ndef_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() {
            let cmd = Command::new(ISO_CLA, ISO_INS_READ_BINARY, 0x00, 0x00).with_le(NDEF_DATA_OFFSET);
            let this = self.clone();
            let next_seq = seq.clone();
            self.transmit(&seq, cmd, move |resp| this.read_len_resp(resp, next_seq, complete));
        } else {
            self.finish_init(seq, complete);
        }
    }

    fn read_len_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() && resp.data.len() as u32 == NDEF_DATA_OFFSET {
            let data_len = ((resp.data[0] as u32) << 8) | resp.data[1] as u32;
            if data_len > 0 {
                let cmd = Command::new(ISO_CLA, ISO_INS_READ_BINARY, 0x00, 0x02).with_le(data_len);
                let this = self.clone();
                let next_seq = seq.clone();
                self.transmit(&seq, cmd, move |resp| this.read_data_resp(resp, next_seq, complete));
                return;
            }
            debug!("type4: NDEF file is empty");
        }
        self.finish_init(seq, complete);
    }

    fn read_data_resp(&self, resp: Response, seq: Sequence, complete: impl FnOnce() + 'static) {
        if resp.sw.is_ok() && !resp.data.is_empty() {
            self.state.borrow_mut().ndef = Some(resp.data);
        }
        self.finish_init(seq, complete);
    }

    fn finish_init(&self, seq: Sequence, complete: impl FnOnce() + 'static) {
        debug!("type4: reactivating after init sequence");
        let target = self.state.borrow().target.clone();
        let this = self.clone();
        let reactivated = target.reactivate(
            Some(&seq),
            Some(move |status: ReactivateStatus| {
                if status != ReactivateStatus::Success {
                    debug!("type4: reactivation failed, leaving tag as-is");
                }
                this.state.borrow_mut().initialized = true;
                complete();
            }),
        );
        if !reactivated {
            debug!("type4: could not start reactivation, leaving tag as-is");
            self.state.borrow_mut().initialized = true;
            complete();
        }
    }

    /// Sends an arbitrary APDU once initialized (spec §4.4 general
    /// transmit, used by applications after discovery).
    pub fn transmit_apdu(&self, seq: &Sequence, cmd: Command, complete: impl FnOnce(Response) + 'static) {
        self.transmit(seq, cmd, complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Protocol, Target, TargetDriver, Technology};

    #[derive(Default)]
    struct MockDriver {
        reactivate_ok: bool,
    }

    impl TargetDriver for MockDriver {
        fn transmit(&mut self, _data: &[u8]) -> bool {
            true
        }
        fn cancel_transmit(&mut self) {}
        fn deactivate(&mut self) {}
        fn reactivate(&mut self) -> bool {
            self.reactivate_ok
        }
        fn can_reactivate(&self) -> bool {
            true
        }
    }

    fn make_tag() -> (Type4Tag, Target) {
        let driver = MockDriver { reactivate_ok: true };
        let target = Target::new(driver, Technology::A, Protocol::IsoDep);
        target.set_transmit_timeout(None);
        (Type4Tag::new(target.clone(), IsoDepTech::A), target)
    }

    fn ok_resp(data: &[u8]) -> Vec<u8> {
        Response::ok(data.to_vec()).encode()
    }

    fn valid_cc(fid_hi: u8, fid_lo: u8) -> Vec<u8> {
        let mut cc = vec![0u8; 15];
        cc[0] = 0x00;
        cc[1] = 0x0f;
        cc[2] = 0x20; // mapping version 2.0
        cc[3] = 0x00;
        cc[4] = 0x3b; // MLe
        cc[5] = 0x00;
        cc[6] = 0x34; // MLc
        cc[7] = 0x04; // File Control TLV T
        cc[8] = 0x06; // File Control TLV L
        cc[9] = fid_hi;
        cc[10] = fid_lo;
        cc[11] = 0x00;
        cc[12] = 0x80; // max NDEF file size
        cc[13] = 0x00; // read access granted
        cc[14] = 0xff; // write access (not checked)
        cc
    }

    // `Target::reactivate` arms a `spawn_local` timeout timer, so any test
    // that reaches it needs a `LocalSet` even though everything else here
    // is synchronous.

    #[tokio::test(flavor = "current_thread")]
    async fn app_not_found_skips_reactivation_and_still_initializes() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (tag, target) = make_tag();
                let done = Rc::new(RefCell::new(false));
                let d = done.clone();
                let seq = target.new_sequence();
                tag.init(&seq, move || *d.borrow_mut() = true);
                target.transmit_done(TransmitStatus::Ok, &Response::status(StatusWord::FILE_NOT_FOUND).encode());
                assert!(*done.borrow());
                assert!(tag.is_initialized());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_ndef_discovery_chain_reads_uri_record_and_reactivates() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (tag, target) = make_tag();
                let done = Rc::new(RefCell::new(false));
                let d = done.clone();
                let seq = target.new_sequence();
                tag.init(&seq, move || *d.borrow_mut() = true);

                // 1. select NDEF app -> ok
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&[]));
                // 2. select CC -> ok
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&[]));
                // 3. read CC (15 bytes): version 2.0, File Control TLV
                // (T=4, L=6) at offset 7, FID E1 04, read access granted,
                // MLe 0x003B.
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&valid_cc(0xe1, 0x04)));
                // 4. select NDEF file -> ok
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&[]));
                // 5. read length prefix
                let record = ndef::Record::uri("http://google.com");
                let encoded = record.encode();
                let len = (encoded.len() as u16).to_be_bytes();
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&len));
                // 6. read NDEF data
                target.transmit_done(TransmitStatus::Ok, &ok_resp(&encoded));
                // target.reactivate() was told reactivate_ok=true, but its
                // completion only fires via `target.reactivated()`.
                target.reactivated();

                assert!(*done.borrow());
                assert!(tag.is_initialized());
                assert_eq!(tag.ndef(), Some(record));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_cc_aborts_ndef_discovery() {
        async fn check(cc: Vec<u8>) {
            tokio::task::LocalSet::new()
                .run_until(async {
                    let (tag, target) = make_tag();
                    let done = Rc::new(RefCell::new(false));
                    let d = done.clone();
                    let seq = target.new_sequence();
                    tag.init(&seq, move || *d.borrow_mut() = true);
                    target.transmit_done(TransmitStatus::Ok, &ok_resp(&[])); // select app
                    target.transmit_done(TransmitStatus::Ok, &ok_resp(&[])); // select CC
                    target.transmit_done(TransmitStatus::Ok, &ok_resp(&cc)); // read CC
                    target.reactivated();

                    assert!(*done.borrow());
                    assert!(tag.is_initialized());
                    assert_eq!(tag.ndef(), None, "a malformed CC must not reach NDEF file selection");
                })
                .await;
        }

        let mut wrong_version = valid_cc(0xe1, 0x04);
        wrong_version[2] = 0x10;
        check(wrong_version).await;

        let mut wrong_tlv = valid_cc(0xe1, 0x04);
        wrong_tlv[7] = 0x05;
        check(wrong_tlv).await;

        let mut no_read_access = valid_cc(0xe1, 0x04);
        no_read_access[13] = 0x01;
        check(no_read_access).await;

        check(valid_cc(0xe1, 0x02)).await; // FID E102 is reserved
        check(valid_cc(0xff, 0xff)).await; // FID FFFF is RFU

        let mut mle_too_small = valid_cc(0xe1, 0x04);
        mle_too_small[3] = 0x00;
        mle_too_small[4] = 0x0e;
        check(mle_too_small).await;
    }
}
