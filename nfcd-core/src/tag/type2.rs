//! Type 2 tag driver (spec §4.3): MIFARE Ultralight / NTAG-style tags
//! addressed by 4-byte block, with an in-memory block cache and
//! read-modify-write handling for unaligned writes.
//!
//! Grounded on `examples/original_source/core/src/nfc_tag_t2.c` and
//! `nfc_tag_t2.h`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::error::{TransmitStatus, Type2Status};
use crate::ndef;
use crate::target::{Sequence, Target};

pub const BLOCK_SIZE: usize = 4;
/// Index of the first data block; blocks 0-3 hold UID/lock/CC data.
pub const DATA_BLOCK0: u16 = 4;

const CMD_READ: u8 = 0x30;
const CMD_WRITE: u8 = 0xa2;
const CC_NFC_FORUM_MAGIC: u8 = 0xe1;
const CC_MIN_VERSION: u8 = 0x10;

struct Type2State {
    target: Target,
    block_size: usize,
    data_size: Option<usize>,
    nfc_forum_compatible: bool,
    cache: HashMap<u16, [u8; BLOCK_SIZE]>,
}

/// A handle to a Type 2 tag (spec §3 Type2Tag).
#[derive(Clone)]
pub struct Type2Tag {
    state: Rc<RefCell<Type2State>>,
}

fn read_command(block: u16) -> Vec<u8> {
    vec![CMD_READ, block as u8]
}

fn write_command(block: u16, data: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(2 + BLOCK_SIZE);
    cmd.push(CMD_WRITE);
    cmd.push(block as u8);
    cmd.extend_from_slice(data);
    cmd
}

impl Type2Tag {
    pub fn new(target: Target) -> Self {
        Type2Tag {
            state: Rc::new(RefCell::new(Type2State {
                target,
                block_size: BLOCK_SIZE,
                data_size: None,
                nfc_forum_compatible: false,
                cache: HashMap::new(),
            })),
        }
    }

    pub fn target(&self) -> Target {
        self.state.borrow().target.clone()
    }

    pub fn data_size(&self) -> Option<usize> {
        self.state.borrow().data_size
    }

    pub fn is_nfc_forum_compatible(&self) -> bool {
        self.state.borrow().nfc_forum_compatible
    }

    /// Reads the Capability Container from block 3 and, if it identifies
    /// an NFC Forum tag, derives the usable data size from its MLEN byte.
    /// `complete` receives whether initialization found a readable CC.
    pub fn init(&self, complete: impl FnOnce(bool) + 'static) {
        let target = self.state.borrow().target.clone();
        let this = self.clone();
        target.submit(read_command(3), None, move |status, data| {
            this.init_cc_resp(status, data, complete);
        });
    }

    fn init_cc_resp(&self, status: TransmitStatus, data: &[u8], complete: impl FnOnce(bool) + 'static) {
        // A READ returns four blocks (16 bytes) starting at the requested
        // one; block 3 (the CC) is the first four bytes of the response.
        if status != TransmitStatus::Ok || data.len() < BLOCK_SIZE {
            complete(false);
            return;
        }
        let cc = &data[0..BLOCK_SIZE];
        if cc[0] == CC_NFC_FORUM_MAGIC && cc[1] >= CC_MIN_VERSION {
            let size = cc[2] as usize * 8;
            let mut st = self.state.borrow_mut();
            st.data_size = Some(size);
            st.nfc_forum_compatible = true;
            trace!(size, "type2: NFC Forum tag detected");
            complete(true);
        } else {
            complete(false);
        }
    }

    /// Bounds check shared by every read/write entry point (spec §4.3,
    /// §8): `offset == data_size` is out of range entirely, `offset + len`
    /// past `data_size` overruns it. Unknown size (not yet initialized)
    /// passes through uncheck — callers have nothing to compare against.
    fn check_bounds(&self, offset: usize, len: usize) -> Option<Type2Status> {
        let data_size = self.state.borrow().data_size?;
        if offset == data_size {
            Some(Type2Status::BadBlock)
        } else if offset + len > data_size {
            Some(Type2Status::BadSize)
        } else {
            Some(Type2Status::Ok)
        }
    }

    /// Reads `len` bytes starting at byte `offset` within the data area,
    /// fetching and caching whole blocks as needed.
    pub fn read_data(&self, offset: usize, len: usize, complete: impl FnOnce(Type2Status, &[u8]) + 'static) {
        self.read_data_seq(offset, len, None, complete);
    }

    /// Cache-only variant (`nfc_tag_t2_read_data_sync`): returns `Ok` with
    /// the bytes only if every covered block is already cached, `NotCached`
    /// if the first uncached block would need a fetch, without ever
    /// touching the wire.
    pub fn read_data_sync(&self, offset: usize, len: usize) -> (Type2Status, Vec<u8>) {
        if let Some(status) = self.check_bounds(offset, len) {
            if status != Type2Status::Ok {
                return (status, Vec::new());
            }
        }
        let block_size = self.state.borrow().block_size;
        let first_block = DATA_BLOCK0 + (offset / block_size) as u16;
        let last_block = DATA_BLOCK0 + ((offset + len.saturating_sub(1)) / block_size) as u16;
        let all_cached = (first_block..=last_block).all(|b| self.state.borrow().cache.contains_key(&b));
        if !all_cached {
            return (Type2Status::NotCached, Vec::new());
        }
        (Type2Status::Ok, self.assemble(offset, len))
    }

    /// Internal engine behind both `read_data` and the write path's
    /// read-before-merge step (grounded on `nfc_tag_t2_read_data`). `seq`,
    /// when given, keeps every fetch this read issues on the caller's
    /// sequence so nothing else interleaves.
    fn read_data_seq(&self, offset: usize, len: usize, seq: Option<Sequence>, complete: impl FnOnce(Type2Status, &[u8]) + 'static) {
        if let Some(status) = self.check_bounds(offset, len) {
            if status != Type2Status::Ok {
                complete(status, &[]);
                return;
            }
        }
        let block_size = self.state.borrow().block_size;
        let first_block = DATA_BLOCK0 + (offset / block_size) as u16;
        let last_block = DATA_BLOCK0 + ((offset + len.saturating_sub(1)) / block_size) as u16;
        let missing: Vec<u16> = (first_block..=last_block).filter(|b| !self.state.borrow().cache.contains_key(b)).collect();
        if missing.is_empty() {
            let bytes = self.assemble(offset, len);
            complete(Type2Status::Ok, &bytes);
            return;
        }
        // The original fetches blocks one READ (4-block burst) at a time;
        // here we just fetch the first missing block's burst, then retry —
        // simplest correct approach given the single in-flight transmit.
        let block = missing[0];
        let target = self.state.borrow().target.clone();
        let this = self.clone();
        let submit_seq = seq.clone();
        target.submit(read_command(block), submit_seq.as_ref(), move |status, data| {
            this.read_block_resp(status, block, data, offset, len, seq, complete);
        });
    }

    fn read_block_resp(
        &self,
        status: TransmitStatus,
        block: u16,
        data: &[u8],
        offset: usize,
        len: usize,
        seq: Option<Sequence>,
        complete: impl FnOnce(Type2Status, &[u8]) + 'static,
    ) {
        if status != TransmitStatus::Ok {
            complete(Type2Status::IoError, &[]);
            return;
        }
        let block_size = self.state.borrow().block_size;
        let blocks_in_resp = data.len() / block_size;
        if blocks_in_resp == 0 {
            complete(Type2Status::IoError, &[]);
            return;
        }
        {
            let mut st = self.state.borrow_mut();
            for i in 0..blocks_in_resp {
                let mut b = [0u8; BLOCK_SIZE];
                b.copy_from_slice(&data[i * block_size..i * block_size + block_size]);
                st.cache.insert(block + i as u16, b);
            }
        }
        self.read_data_seq(offset, len, seq, complete);
    }

    fn assemble(&self, offset: usize, len: usize) -> Vec<u8> {
        let st = self.state.borrow();
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let block = DATA_BLOCK0 + (pos / st.block_size) as u16;
            let in_block = pos % st.block_size;
            let data = st.cache.get(&block).expect("assemble called only after all blocks cached");
            let take = (st.block_size - in_block).min(len - out.len());
            out.extend_from_slice(&data[in_block..in_block + take]);
            pos += take;
        }
        out
    }

    /// Writes `data` starting at byte `offset`, read-modify-writing any
    /// partially-overlapped edge blocks.
    ///
    /// The whole operation — the read-before-merge fetch, if any, and every
    /// block write it touches — runs under one `Sequence` (grounded on
    /// `NfcTagType2WriteData::seq` / `nfc_tag_t2_write_data_new`), so
    /// nothing else interleaves and observes a half-written tag.
    pub fn write_data(&self, offset: usize, data: Vec<u8>, complete: impl FnOnce(Type2Status, usize) + 'static) {
        if data.is_empty() {
            complete(Type2Status::Ok, 0);
            return;
        }
        let target = self.state.borrow().target.clone();
        let seq = target.new_sequence();
        self.write_data_seq(offset, data, seq, complete);
    }

    fn write_data_seq(&self, offset: usize, data: Vec<u8>, seq: Sequence, complete: impl FnOnce(Type2Status, usize) + 'static) {
        let block_size = self.state.borrow().block_size;
        let block = DATA_BLOCK0 + (offset / block_size) as u16;
        let in_block = offset % block_size;
        if in_block != 0 || data.len() < block_size {
            // Partial block: invalidate it — a stale cache entry must not
            // answer a read while this merge/write is in flight — then
            // fetch it so we don't clobber the rest, under the same seq.
            self.state.borrow_mut().cache.remove(&block);
            let this = self.clone();
            let read_seq = seq.clone();
            self.read_data_seq(offset - in_block, block_size, Some(read_seq), move |status, existing| {
                if status != Type2Status::Ok {
                    complete(Type2Status::IoError, 0);
                    return;
                }
                let mut merged = existing.to_vec();
                let take = (block_size - in_block).min(data.len());
                merged[in_block..in_block + take].copy_from_slice(&data[..take]);
                this.write_merged_block(block, merged, take, data, seq, complete);
            });
        } else {
            self.write_aligned(offset, data, seq, complete);
        }
    }

    fn write_merged_block(
        &self,
        block: u16,
        merged: Vec<u8>,
        consumed: usize,
        original_data: Vec<u8>,
        seq: Sequence,
        complete: impl FnOnce(Type2Status, usize) + 'static,
    ) {
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(&merged[..BLOCK_SIZE]);
        // Invalidate immediately before the write issues, not just
        // re-cache after success: a read landing while this is in flight
        // must not see the pre-write contents.
        self.state.borrow_mut().cache.remove(&block);
        let target = self.state.borrow().target.clone();
        let this = self.clone();
        let submit_seq = seq.clone();
        target.submit(write_command(block, &buf), Some(&submit_seq), move |status, _resp| {
            if status != TransmitStatus::Ok {
                complete(Type2Status::IoError, 0);
                return;
            }
            this.state.borrow_mut().cache.insert(block, buf);
            if consumed >= original_data.len() {
                complete(Type2Status::Ok, consumed);
            } else {
                let remaining = original_data[consumed..].to_vec();
                let block_size = this.state.borrow().block_size;
                let next_offset = ((block + 1 - DATA_BLOCK0) as usize) * block_size;
                this.write_data_seq(next_offset, remaining, seq, move |status, written| {
                    complete(status, consumed + written);
                });
            }
        });
    }

    fn write_aligned(&self, offset: usize, data: Vec<u8>, seq: Sequence, complete: impl FnOnce(Type2Status, usize) + 'static) {
        let block_size = self.state.borrow().block_size;
        let block = DATA_BLOCK0 + (offset / block_size) as u16;
        let mut buf = [0u8; BLOCK_SIZE];
        let take = data.len().min(block_size);
        buf[..take].copy_from_slice(&data[..take]);
        self.state.borrow_mut().cache.remove(&block);
        let this = self.clone();
        let target = self.state.borrow().target.clone();
        let submit_seq = seq.clone();
        target.submit(write_command(block, &buf), Some(&submit_seq), move |status, _resp| {
            if status != TransmitStatus::Ok {
                complete(Type2Status::IoError, 0);
                return;
            }
            this.state.borrow_mut().cache.insert(block, buf);
            if take >= data.len() {
                complete(Type2Status::Ok, take);
            } else {
                let remaining = data[take..].to_vec();
                let next_offset = ((block + 1 - DATA_BLOCK0) as usize) * block_size;
                this.write_data_seq(next_offset, remaining, seq, move |status, written| {
                    complete(status, take + written);
                });
            }
        });
    }

    /// Block-level write (`nfc_tag_t2_write`): writes exactly one whole
    /// block at an absolute block number, bypassing the data-area offset
    /// math entirely. Used for special areas — lock bytes, the CC itself —
    /// that `write_data` has no business touching. Rejects anything smaller
    /// than a full block instead of read-modify-writing it.
    pub fn write(&self, block: u16, data: &[u8], complete: impl FnOnce(Type2Status) + 'static) {
        let block_size = self.state.borrow().block_size;
        if data.len() < block_size {
            complete(Type2Status::BadSize);
            return;
        }
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(&data[..block_size]);
        self.state.borrow_mut().cache.remove(&block);
        let target = self.state.borrow().target.clone();
        let seq = target.new_sequence();
        let this = self.clone();
        target.submit(write_command(block, &buf), Some(&seq), move |status, _resp| {
            if status != TransmitStatus::Ok {
                complete(Type2Status::IoError);
                return;
            }
            this.state.borrow_mut().cache.insert(block, buf);
            complete(Type2Status::Ok);
        });
    }

    /// Scans the data area for an NDEF TLV (type 0x03) and decodes its
    /// contained message. Assumes the whole data area is already cached
    /// (callers typically `read_data(0, data_size, ...)` first).
    pub fn find_ndef(&self) -> Option<crate::ndef::Record> {
        let size = self.state.borrow().data_size?;
        let bytes = self.assemble(0, size);
        let mut pos = 0;
        while pos < bytes.len() {
            match bytes[pos] {
                0x00 => pos += 1, // NULL TLV
                0xfe => break,    // terminator
                0x03 => {
                    let len = *bytes.get(pos + 1)? as usize;
                    let body = bytes.get(pos + 2..pos + 2 + len)?;
                    return ndef::decode(body).map(|(record, _)| record);
                }
                _ => {
                    let len = *bytes.get(pos + 1)? as usize;
                    pos += 2 + len;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Protocol, Target, TargetDriver, Technology};
    use std::cell::RefCell as StdRefCell;

    #[derive(Default)]
    struct MockDriver;

    impl TargetDriver for MockDriver {
        fn transmit(&mut self, _data: &[u8]) -> bool {
            true
        }
        fn cancel_transmit(&mut self) {}
        fn deactivate(&mut self) {}
    }

    fn cc_tag() -> Target {
        let target = Target::new(MockDriver, Technology::A, Protocol::T2);
        target.set_transmit_timeout(None);
        target
    }

    #[test]
    fn cc_with_nfc_forum_magic_is_detected() {
        let target = cc_tag();
        let tag = Type2Tag::new(target.clone());
        let initialized = Rc::new(StdRefCell::new(None));
        let i = initialized.clone();
        tag.init(move |ok| *i.borrow_mut() = Some(ok));
        let mut resp = vec![CC_NFC_FORUM_MAGIC, 0x10, 0x06, 0x00];
        resp.extend_from_slice(&[0u8; 12]);
        target.transmit_done(TransmitStatus::Ok, &resp);
        assert_eq!(*initialized.borrow(), Some(true));
        assert_eq!(tag.data_size(), Some(0x06 * 8));
    }

    #[test]
    fn non_nfc_forum_cc_fails_init() {
        let target = cc_tag();
        let tag = Type2Tag::new(target.clone());
        let initialized = Rc::new(StdRefCell::new(None));
        let i = initialized.clone();
        tag.init(move |ok| *i.borrow_mut() = Some(ok));
        target.transmit_done(TransmitStatus::Ok, &[0xaa, 0x00, 0x00, 0x00]);
        assert_eq!(*initialized.borrow(), Some(false));
    }

    /// Brings up a tag with a known `data_size` of 48 bytes (CC MLEN 0x06)
    /// so the bounds checks below have something to compare against.
    fn initialized_tag() -> (Type2Tag, Target) {
        let target = cc_tag();
        let tag = Type2Tag::new(target.clone());
        tag.init(|_| {});
        let mut resp = vec![CC_NFC_FORUM_MAGIC, 0x10, 0x06, 0x00];
        resp.extend_from_slice(&[0u8; 12]);
        target.transmit_done(TransmitStatus::Ok, &resp);
        (tag, target)
    }

    #[test]
    fn read_at_data_size_is_bad_block() {
        let (tag, _target) = initialized_tag();
        let result = Rc::new(StdRefCell::new(None));
        let r = result.clone();
        tag.read_data(48, 4, move |status, data| *r.borrow_mut() = Some((status, data.to_vec())));
        assert_eq!(result.borrow().as_ref().map(|(s, _)| *s), Some(Type2Status::BadBlock));
    }

    #[test]
    fn read_past_data_size_is_bad_size() {
        let (tag, _target) = initialized_tag();
        let result = Rc::new(StdRefCell::new(None));
        let r = result.clone();
        tag.read_data(44, 8, move |status, data| *r.borrow_mut() = Some((status, data.to_vec())));
        assert_eq!(result.borrow().as_ref().map(|(s, _)| *s), Some(Type2Status::BadSize));
    }

    #[test]
    fn sync_read_reports_not_cached_until_the_block_is_fetched() {
        let (tag, target) = initialized_tag();
        let (status, data) = tag.read_data_sync(0, 4);
        assert_eq!(status, Type2Status::NotCached);
        assert!(data.is_empty());

        let done = Rc::new(StdRefCell::new(None));
        let d = done.clone();
        tag.read_data(0, 4, move |status, data| *d.borrow_mut() = Some((status, data.to_vec())));
        target.transmit_done(TransmitStatus::Ok, &[1, 2, 3, 4]);
        assert_eq!(done.borrow().as_ref().unwrap().0, Type2Status::Ok);

        let (status, data) = tag.read_data_sync(0, 4);
        assert_eq!(status, Type2Status::Ok);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn sync_read_honors_bounds_too() {
        let (tag, _target) = initialized_tag();
        assert_eq!(tag.read_data_sync(48, 1).0, Type2Status::BadBlock);
        assert_eq!(tag.read_data_sync(44, 8).0, Type2Status::BadSize);
    }

    #[test]
    fn unaligned_write_invalidates_the_cache_before_fetching_for_merge() {
        let (tag, target) = initialized_tag();

        // Prime the cache for block DATA_BLOCK0 with stale content.
        let primed = Rc::new(StdRefCell::new(None));
        let p = primed.clone();
        tag.read_data(0, 4, move |status, data| *p.borrow_mut() = Some((status, data.to_vec())));
        target.transmit_done(TransmitStatus::Ok, &[0xaa, 0xaa, 0xaa, 0xaa]);
        assert_eq!(tag.read_data_sync(0, 4), (Type2Status::Ok, vec![0xaa, 0xaa, 0xaa, 0xaa]));

        // An unaligned write into that block must invalidate it before
        // issuing the read-for-merge, so the sync read sees it as not
        // cached while the write is in flight.
        let done = Rc::new(StdRefCell::new(None));
        let d = done.clone();
        tag.write_data(1, vec![0xff], move |status, n| *d.borrow_mut() = Some((status, n)));
        assert_eq!(tag.read_data_sync(0, 4).0, Type2Status::NotCached, "the block must be invalidated before the merge fetch goes out");

        // Complete the read-for-merge, then the write it triggers.
        target.transmit_done(TransmitStatus::Ok, &[0xaa, 0xaa, 0xaa, 0xaa]);
        target.transmit_done(TransmitStatus::Ok, &[]);

        assert_eq!(*done.borrow(), Some((Type2Status::Ok, 1)));
        assert_eq!(tag.read_data_sync(0, 4), (Type2Status::Ok, vec![0xaa, 0xff, 0xaa, 0xaa]));
    }

    #[test]
    fn block_level_write_rejects_sub_block_payloads() {
        let (tag, _target) = initialized_tag();
        let result = Rc::new(StdRefCell::new(None));
        let r = result.clone();
        tag.write(DATA_BLOCK0, &[1, 2, 3], move |status| *r.borrow_mut() = Some(status));
        assert_eq!(*result.borrow(), Some(Type2Status::BadSize));
    }

    #[test]
    fn block_level_write_writes_a_whole_block_and_caches_it() {
        let (tag, target) = initialized_tag();
        let result = Rc::new(StdRefCell::new(None));
        let r = result.clone();
        tag.write(DATA_BLOCK0, &[9, 8, 7, 6], move |status| *r.borrow_mut() = Some(status));
        target.transmit_done(TransmitStatus::Ok, &[]);
        assert_eq!(*result.borrow(), Some(Type2Status::Ok));
        assert_eq!(tag.read_data_sync(0, 4), (Type2Status::Ok, vec![9, 8, 7, 6]));
    }
}
