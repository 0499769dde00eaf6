//! ISO 7816-4 APDU command/response framing used by the Type 4 tag driver
//! and the host card-emulation engine (spec §4.4, §4.5).
//!
//! Grounded on the encode/decode helpers in
//! `examples/original_source/core/src/nfc_tag_t4.c` and `nfc_host.c`
//! (`nfc_isodep_transmit`, `nfc_host_process_apdu`), adapted into a
//! standalone codec rather than functions called inline against a byte
//! buffer.

use crate::error::{ApduCodecError, StatusWord};

/// A command APDU, case 1-4 per ISO 7816-4 (extended length only; this
/// daemon never emits short-length frames, matching the original's
/// "always build extended" policy for Type 4 commands).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// `None` means no Le field (case 1/3); `Some(0)` means Le=65536.
    pub le: Option<u32>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Command { cla, ins, p1, p2, data: Vec::new(), le: None }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// Encodes this command using extended-length framing (spec §8
    /// "Le == 65536 encodes as two zero bytes").
    pub fn encode(&self) -> Result<Vec<u8>, ApduCodecError> {
        if self.data.len() > 0xffff {
            return Err(ApduCodecError::LcOutOfRange);
        }
        if matches!(self.le, Some(le) if le > 0x10000) {
            return Err(ApduCodecError::LeOutOfRange);
        }
        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 2);
        out.push(self.cla);
        out.push(self.ins);
        out.push(self.p1);
        out.push(self.p2);
        let has_data = !self.data.is_empty();
        if has_data || self.le.is_some() {
            out.push(0x00);
        }
        if has_data {
            let len = self.data.len() as u16;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if le == 0x10000 {
                out.extend_from_slice(&[0x00, 0x00]);
            } else {
                out.extend_from_slice(&(le as u16).to_be_bytes());
            }
        }
        Ok(out)
    }

    /// Decodes a command APDU received over the air (spec §4.5, host side
    /// of `nfc_host_process_apdu`). Handles ISO 7816-4 cases 1-4, both
    /// short and extended length forms.
    pub fn decode(raw: &[u8]) -> Result<Self, ApduCodecError> {
        if raw.len() < 4 {
            return Err(ApduCodecError::ResponseTooShort);
        }
        let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];
        if body.is_empty() {
            return Ok(Command { cla, ins, p1, p2, data: Vec::new(), le: None });
        }
        let extended = body[0] == 0x00 && body.len() != 1;
        if extended {
            if body.len() == 3 {
                let le = u16::from_be_bytes([body[1], body[2]]);
                let le = if le == 0 { 0x10000 } else { le as u32 };
                return Ok(Command { cla, ins, p1, p2, data: Vec::new(), le: Some(le) });
            }
            let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
            let data = body.get(3..3 + lc).ok_or(ApduCodecError::LcOutOfRange)?.to_vec();
            let rest = &body[3 + lc..];
            let le = match rest.len() {
                0 => None,
                2 => {
                    let le = u16::from_be_bytes([rest[0], rest[1]]);
                    Some(if le == 0 { 0x10000 } else { le as u32 })
                }
                _ => return Err(ApduCodecError::LcOutOfRange),
            };
            Ok(Command { cla, ins, p1, p2, data, le })
        } else if body.len() == 1 {
            let le = body[0];
            let le = if le == 0 { 256 } else { le as u32 };
            Ok(Command { cla, ins, p1, p2, data: Vec::new(), le: Some(le) })
        } else {
            let lc = body[0] as usize;
            let data = body.get(1..1 + lc).ok_or(ApduCodecError::LcOutOfRange)?.to_vec();
            let rest = &body[1 + lc..];
            let le = match rest.len() {
                0 => None,
                1 => Some(if rest[0] == 0 { 256 } else { rest[0] as u32 }),
                _ => return Err(ApduCodecError::LcOutOfRange),
            };
            Ok(Command { cla, ins, p1, p2, data, le })
        }
    }
}

/// A response APDU: a data body followed by a two-byte status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl Response {
    pub fn ok(data: impl Into<Vec<u8>>) -> Self {
        Response { data: data.into(), sw: StatusWord::OK }
    }

    pub fn status(sw: StatusWord) -> Self {
        Response { data: Vec::new(), sw }
    }

    /// Decodes raw bytes received over the air. An empty or sub-2-byte
    /// buffer is not malformed — it's how a transport failure surfaces —
    /// and decodes to [`StatusWord::IO_ERROR`] with no data, matching
    /// `nfc_isodep_transmit`'s treatment of a zero-length response.
    pub fn decode(raw: &[u8]) -> Result<Self, ApduCodecError> {
        if raw.is_empty() {
            return Ok(Response { data: Vec::new(), sw: StatusWord::IO_ERROR });
        }
        if raw.len() < 2 {
            return Err(ApduCodecError::ResponseTooShort);
        }
        if raw.len() - 2 > 0x10000 {
            return Err(ApduCodecError::ResponseTooLong);
        }
        let (body, sw) = raw.split_at(raw.len() - 2);
        Ok(Response { data: body.to_vec(), sw: StatusWord::new(sw[0], sw[1]) })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push(self.sw.sw1());
        out.push(self.sw.sw2());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_by_aid_encodes_with_extended_lc_and_no_le() {
        let cmd = Command::new(0x00, 0xa4, 0x04, 0x00).with_data(vec![0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01]);
        let encoded = cmd.encode().unwrap();
        assert_eq!(&encoded[0..4], &[0x00, 0xa4, 0x04, 0x00]);
        assert_eq!(&encoded[4..7], &[0x00, 0x00, 0x07]);
        assert_eq!(&encoded[7..], &[0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01]);
    }

    #[test]
    fn le_of_65536_encodes_as_two_zero_bytes() {
        let cmd = Command::new(0x00, 0xb0, 0x00, 0x00).with_le(0x10000);
        let encoded = cmd.encode().unwrap();
        assert_eq!(&encoded[4..], &[0x00, 0x00]);
    }

    #[test]
    fn le_over_65536_is_rejected() {
        let cmd = Command::new(0x00, 0xb0, 0x00, 0x00).with_le(0x10001);
        assert_eq!(cmd.encode(), Err(ApduCodecError::LeOutOfRange));
    }

    #[test]
    fn select_by_aid_decodes_cla_ins_and_data() {
        let aid = vec![0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];
        let encoded = Command::new(0x00, 0xa4, 0x04, 0x00).with_data(aid.clone()).encode().unwrap();
        let decoded = Command::decode(&encoded).unwrap();
        assert_eq!(decoded, Command { cla: 0x00, ins: 0xa4, p1: 0x04, p2: 0x00, data: aid, le: None });
    }

    #[test]
    fn command_round_trips_with_le() {
        let cmd = Command::new(0x00, 0xb0, 0x00, 0x00).with_data(vec![1, 2, 3]).with_le(4);
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn response_round_trips_through_encode_decode() {
        let resp = Response::ok(vec![1, 2, 3]);
        let decoded = Response::decode(&resp.encode()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn empty_response_decodes_to_io_error_sentinel() {
        let decoded = Response::decode(&[]).unwrap();
        assert_eq!(decoded.sw, StatusWord::IO_ERROR);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn single_byte_response_is_malformed() {
        assert_eq!(Response::decode(&[0x90]), Err(ApduCodecError::ResponseTooShort));
    }
}
