//! NDEF record encode/decode (spec §4.3, §4.4 "NDEF payload").
//!
//! Grounded on `examples/FlammeGamer-spoolbuddy/spoolease_sources/shared/src/ndef.rs`,
//! which builds the same TNF/flags header with `deku` over a `no_std`
//! target. This daemon runs on a full host, so the header is hand-decoded
//! against plain `Vec<u8>` instead of pulled in through a bit-field codec
//! crate — there's no embedded constraint here pushing toward `deku`.
//!
//! Only short records (no chunking, no ID field) are produced or expected,
//! which matches every record this daemon's tag drivers actually exchange.

/// A Text or URI well-known record — the two kinds this daemon reads and
/// writes (spec §8 scenarios 1 and 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Text { lang: String, text: String },
    Uri { uri: String },
    /// Any other TNF/type this daemon doesn't interpret, kept as raw bytes
    /// so callers can still see that *something* was there.
    Other { tnf: u8, record_type: Vec<u8>, payload: Vec<u8> },
}

const TNF_WELL_KNOWN: u8 = 0x01;
const RTD_TEXT: u8 = b'T';
const RTD_URI: u8 = b'U';

const URI_PREFIXES: &[&str] = &[
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Decodes one short NDEF record from `data`, returning the record and the
/// number of bytes consumed.
pub fn decode(data: &[u8]) -> Option<(Record, usize)> {
    if data.len() < 2 {
        return None;
    }
    let header = data[0];
    let message_end = header & 0x40 != 0;
    let _ = message_end;
    let short_record = header & 0x10 != 0;
    let id_present = header & 0x08 != 0;
    let tnf = header & 0x07;

    let mut pos = 1usize;
    let type_len = *data.get(pos)? as usize;
    pos += 1;

    let payload_len = if short_record {
        let len = *data.get(pos)? as usize;
        pos += 1;
        len
    } else {
        let bytes = data.get(pos..pos + 4)?;
        pos += 4;
        u32::from_be_bytes(bytes.try_into().ok()?) as usize
    };

    let id_len = if id_present {
        let len = *data.get(pos)? as usize;
        pos += 1;
        len
    } else {
        0
    };

    let record_type = data.get(pos..pos + type_len)?.to_vec();
    pos += type_len;
    pos += id_len; // ID content is ignored; this daemon never addresses records by ID.
    let payload = data.get(pos..pos + payload_len)?.to_vec();
    pos += payload_len;

    let record = match (tnf, record_type.as_slice()) {
        (TNF_WELL_KNOWN, [RTD_TEXT]) => parse_text(&payload)?,
        (TNF_WELL_KNOWN, [RTD_URI]) => parse_uri(&payload)?,
        _ => Record::Other { tnf, record_type, payload },
    };
    Some((record, pos))
}

fn parse_text(payload: &[u8]) -> Option<Record> {
    let status = *payload.first()?;
    let lang_len = (status & 0x3f) as usize;
    let lang = String::from_utf8(payload.get(1..1 + lang_len)?.to_vec()).ok()?;
    let text = String::from_utf8(payload.get(1 + lang_len..)?.to_vec()).ok()?;
    Some(Record::Text { lang, text })
}

fn parse_uri(payload: &[u8]) -> Option<Record> {
    let code = *payload.first()? as usize;
    let prefix = URI_PREFIXES.get(code).copied().unwrap_or("");
    let rest = std::str::from_utf8(payload.get(1..)?).ok()?;
    Some(Record::Uri { uri: format!("{prefix}{rest}") })
}

impl Record {
    pub fn text(lang: impl Into<String>, text: impl Into<String>) -> Self {
        Record::Text { lang: lang.into(), text: text.into() }
    }

    pub fn uri(uri: impl Into<String>) -> Self {
        Record::Uri { uri: uri.into() }
    }

    /// Encodes as a single short record (message-begin and message-end both
    /// set — every record this daemon emits is its own complete message).
    pub fn encode(&self) -> Vec<u8> {
        let (record_type, payload): (Vec<u8>, Vec<u8>) = match self {
            Record::Text { lang, text } => {
                let mut payload = Vec::with_capacity(1 + lang.len() + text.len());
                payload.push(lang.len() as u8);
                payload.extend_from_slice(lang.as_bytes());
                payload.extend_from_slice(text.as_bytes());
                (vec![RTD_TEXT], payload)
            }
            Record::Uri { uri } => {
                let (code, rest) = best_uri_prefix(uri);
                let mut payload = Vec::with_capacity(1 + rest.len());
                payload.push(code as u8);
                payload.extend_from_slice(rest.as_bytes());
                (vec![RTD_URI], payload)
            }
            Record::Other { tnf: _, record_type, payload } => (record_type.clone(), payload.clone()),
        };
        let tnf = match self {
            Record::Other { tnf, .. } => *tnf,
            _ => TNF_WELL_KNOWN,
        };

        let short = payload.len() <= 0xff;
        let header = 0xc0 | (if short { 0x10 } else { 0x00 }) | tnf;
        let mut out = Vec::with_capacity(4 + record_type.len() + payload.len());
        out.push(header);
        out.push(record_type.len() as u8);
        if short {
            out.push(payload.len() as u8);
        } else {
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        }
        out.extend_from_slice(&record_type);
        out.extend_from_slice(&payload);
        out
    }
}

fn best_uri_prefix(uri: &str) -> (usize, &str) {
    URI_PREFIXES
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(i, prefix)| uri.strip_prefix(prefix).map(|rest| (i, rest)))
        .max_by_key(|(_, rest)| uri.len() - rest.len())
        .unwrap_or((0, uri))
}
