//! Redo record wire format.
//!
//! A shipped window is a contiguous run of records:
//!
//! ```text
//! [kind u8][fid u32][oid u32][key_len u32][key][payload_len u32][payload][crc32c u32]
//! ```
//!
//! all integers big-endian, the checksum covering every preceding byte of
//! the record. Inserts carry the user key so a backup can feed its own
//! index; updates ship the OID only. A `Skip` record blankets the reserved
//! range of a discarded transaction (header plus zero padding) so the byte
//! stream stays contiguous and parseable.

use crate::store::Oid;
use crc32c::crc32c;
use thiserror::Error;

/// Smallest encodable record: the skip header.
pub const SKIP_MIN_BYTES: usize = 9;

const NORMAL_HEADER: usize = 1 + 4 + 4 + 4; // kind, fid, oid, key_len
const NORMAL_FIXED: usize = NORMAL_HEADER + 4 + 4; // + payload_len + crc

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Skip = 0,
    Insert = 1,
    Update = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("truncated record")]
    Truncated,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub fid: u32,
    pub oid: Oid,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn insert(fid: u32, oid: Oid, key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Insert,
            fid,
            oid,
            key,
            payload,
        }
    }

    pub fn update(fid: u32, oid: Oid, payload: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Update,
            fid,
            oid,
            key: Vec::new(),
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        NORMAL_FIXED + self.key.len() + self.payload.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        debug_assert_ne!(self.kind, RecordKind::Skip, "skip records use encode_skip");
        let start = out.len();
        out.push(self.kind as u8);
        out.extend_from_slice(&self.fid.to_be_bytes());
        out.extend_from_slice(&self.oid.to_be_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc32c(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());
    }
}

/// A skip record spanning exactly `span` bytes (`span >= SKIP_MIN_BYTES`).
pub fn encode_skip(span: usize) -> Vec<u8> {
    assert!(span >= SKIP_MIN_BYTES);
    let mut out = vec![0u8; span];
    out[0] = RecordKind::Skip as u8;
    out[1..5].copy_from_slice(&(span as u32).to_be_bytes());
    let crc = crc32c(&out[..5]);
    out[5..9].copy_from_slice(&crc.to_be_bytes());
    out
}

/// Outcome of decoding one record at the head of `buf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A data record and the bytes it consumed.
    Record(LogRecord, usize),
    /// A skip span to step over.
    Skip(usize),
}

pub fn decode_one(buf: &[u8]) -> Result<Decoded, RecordError> {
    if buf.is_empty() {
        return Err(RecordError::Truncated);
    }
    match buf[0] {
        0 => {
            if buf.len() < SKIP_MIN_BYTES {
                return Err(RecordError::Truncated);
            }
            let span = u32::from_be_bytes(buf[1..5].try_into().expect("slice len")) as usize;
            if span < SKIP_MIN_BYTES {
                return Err(RecordError::Corrupt(format!("skip span {span} too small")));
            }
            let stored = u32::from_be_bytes(buf[5..9].try_into().expect("slice len"));
            if stored != crc32c(&buf[..5]) {
                return Err(RecordError::Corrupt("skip checksum mismatch".into()));
            }
            if buf.len() < span {
                return Err(RecordError::Truncated);
            }
            Ok(Decoded::Skip(span))
        }
        kind @ (1 | 2) => {
            if buf.len() < NORMAL_HEADER {
                return Err(RecordError::Truncated);
            }
            let fid = u32::from_be_bytes(buf[1..5].try_into().expect("slice len"));
            let oid = u32::from_be_bytes(buf[5..9].try_into().expect("slice len"));
            let key_len = u32::from_be_bytes(buf[9..13].try_into().expect("slice len")) as usize;
            if buf.len() < NORMAL_HEADER + key_len + 4 {
                return Err(RecordError::Truncated);
            }
            let key_end = NORMAL_HEADER + key_len;
            let payload_len =
                u32::from_be_bytes(buf[key_end..key_end + 4].try_into().expect("slice len"))
                    as usize;
            let total = NORMAL_FIXED + key_len + payload_len;
            if buf.len() < total {
                return Err(RecordError::Truncated);
            }
            let crc_at = total - 4;
            let stored = u32::from_be_bytes(buf[crc_at..total].try_into().expect("slice len"));
            if stored != crc32c(&buf[..crc_at]) {
                return Err(RecordError::Corrupt("record checksum mismatch".into()));
            }
            let record = LogRecord {
                kind: if kind == 1 {
                    RecordKind::Insert
                } else {
                    RecordKind::Update
                },
                fid,
                oid,
                key: buf[NORMAL_HEADER..key_end].to_vec(),
                payload: buf[key_end + 4..crc_at].to_vec(),
            };
            Ok(Decoded::Record(record, total))
        }
        other => Err(RecordError::Corrupt(format!("unknown record kind {other}"))),
    }
}

/// Walk a window of records, invoking `apply` with each data record and the
/// window-relative offset where it starts. Returns the relative offset of
/// the first byte not consumed — on a clean window that is `buf.len()`, on
/// a trailing partial record it is where the partial record begins, which
/// callers use to resume the next round.
pub fn scan_window(
    buf: &[u8],
    mut apply: impl FnMut(usize, &LogRecord),
) -> Result<usize, RecordError> {
    let mut pos = 0usize;
    while pos < buf.len() {
        match decode_one(&buf[pos..]) {
            Ok(Decoded::Record(record, consumed)) => {
                apply(pos, &record);
                pos += consumed;
            }
            Ok(Decoded::Skip(span)) => pos += span,
            Err(RecordError::Truncated) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::{
        Decoded, LogRecord, RecordError, RecordKind, SKIP_MIN_BYTES, decode_one, encode_skip,
        scan_window,
    };

    #[test]
    fn record_roundtrip() {
        let rec = LogRecord::insert(1, 42, b"user-7".to_vec(), b"row bytes".to_vec());
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        assert_eq!(buf.len(), rec.encoded_len());

        match decode_one(&buf).expect("decode") {
            Decoded::Record(decoded, consumed) => {
                assert_eq!(decoded, rec);
                assert_eq!(consumed, buf.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn update_records_have_no_key() {
        let rec = LogRecord::update(1, 7, b"v2".to_vec());
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        match decode_one(&buf).expect("decode") {
            Decoded::Record(decoded, _) => {
                assert_eq!(decoded.kind, RecordKind::Update);
                assert!(decoded.key.is_empty());
                assert_eq!(decoded.payload, b"v2");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn corruption_is_detected() {
        let rec = LogRecord::update(1, 7, b"value".to_vec());
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        // First payload byte: lengths still parse, the checksum does not.
        buf[17] ^= 0xFF;
        assert!(matches!(
            decode_one(&buf),
            Err(RecordError::Corrupt(_))
        ));
    }

    #[test]
    fn truncation_is_distinguished_from_corruption() {
        let rec = LogRecord::update(1, 7, b"value".to_vec());
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        for cut in 1..buf.len() {
            assert_eq!(
                decode_one(&buf[..cut]),
                Err(RecordError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn skip_records_span_their_reservation() {
        for span in [SKIP_MIN_BYTES, 16, 100] {
            let buf = encode_skip(span);
            assert_eq!(buf.len(), span);
            assert_eq!(decode_one(&buf).expect("decode"), Decoded::Skip(span));
        }
    }

    #[test]
    fn scan_stops_at_partial_trailing_record() {
        let mut buf = Vec::new();
        LogRecord::update(1, 1, b"a".to_vec()).encode_into(&mut buf);
        let boundary = buf.len();
        LogRecord::update(1, 2, b"b".to_vec()).encode_into(&mut buf);
        buf.extend_from_slice(&encode_skip(SKIP_MIN_BYTES));
        let clean_len = buf.len();
        // Chop the window mid-way through a third record.
        LogRecord::update(1, 3, b"c".to_vec()).encode_into(&mut buf);
        let window = &buf[..clean_len + 5];

        let mut seen = Vec::new();
        let next = scan_window(window, |at, rec| seen.push((at, rec.oid))).expect("scan");
        assert_eq!(next, clean_len, "resume point is the partial record start");
        assert_eq!(seen, vec![(0, 1), (boundary, 2)]);
    }

    #[test]
    fn scan_surfaces_corruption() {
        let mut buf = Vec::new();
        LogRecord::update(1, 1, b"a".to_vec()).encode_into(&mut buf);
        buf[3] ^= 0x55;
        assert!(scan_window(&buf, |_, _| {}).is_err());
    }
}
