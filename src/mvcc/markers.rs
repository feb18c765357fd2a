#![forbid(unsafe_code)]

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{Result, TesseraError, TransactionId};

const MARKER_HEADER_LEN: usize = 28;

/// Checksum covering a marker's header fields and payload.
fn marker_crc32(seq: u64, tx_id: u64, kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_be_bytes());
    hasher.update(&tx_id.to_be_bytes());
    hasher.update(&[kind]);
    hasher.update(&(payload.len() as u64).to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Kind of record written to the marker log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerKind {
    /// Opens a transaction's section of the log.
    Begin,
    /// Carries one document write.
    Data,
    /// Ends a transaction that committed.
    Commit,
    /// Ends a transaction that rolled back after writing a begin marker.
    Abort,
}

impl MarkerKind {
    fn to_byte(self) -> u8 {
        match self {
            MarkerKind::Begin => 1,
            MarkerKind::Data => 2,
            MarkerKind::Commit => 3,
            MarkerKind::Abort => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MarkerKind::Begin),
            2 => Some(MarkerKind::Data),
            3 => Some(MarkerKind::Commit),
            4 => Some(MarkerKind::Abort),
            _ => None,
        }
    }

    /// Whether the marker closes a transaction.
    pub fn is_end(self) -> bool {
        matches!(self, MarkerKind::Commit | MarkerKind::Abort)
    }
}

/// A decoded marker record.
#[derive(Clone, PartialEq, Eq)]
pub struct Marker {
    /// Position in the log, starting at 1.
    pub seq: u64,
    /// Transaction that wrote the marker.
    pub tx: TransactionId,
    /// Record kind.
    pub kind: MarkerKind,
    /// Opaque payload; JSON for data markers, empty otherwise.
    pub payload: Vec<u8>,
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("seq", &self.seq)
            .field("tx", &self.tx)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Counters tracking marker log activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkerLogStats {
    /// Markers appended since creation.
    pub markers_appended: u64,
    /// Encoded bytes appended since creation.
    pub bytes_appended: u64,
}

struct LogState {
    bytes: Vec<u8>,
    next_seq: u64,
    stats: MarkerLogStats,
}

/// Append-only in-memory log of transaction markers.
///
/// Each record is a fixed header followed by its payload:
/// `seq:u64 | tx:u64 | kind:u8 | reserved:[u8;3] | len:u32 | crc32:u32`.
/// The checksum covers the header fields and the payload.
pub struct MarkerLog {
    state: Mutex<LogState>,
}

impl Default for MarkerLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                bytes: Vec::new(),
                next_seq: 1,
                stats: MarkerLogStats::default(),
            }),
        }
    }

    /// Appends a marker and returns its sequence number.
    pub fn append(&self, tx: TransactionId, kind: MarkerKind, payload: &[u8]) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let kind_byte = kind.to_byte();
        let crc = marker_crc32(seq, tx.0, kind_byte, payload);
        let start = state.bytes.len();
        state.bytes.extend_from_slice(&seq.to_be_bytes());
        state.bytes.extend_from_slice(&tx.0.to_be_bytes());
        state.bytes.push(kind_byte);
        state.bytes.extend_from_slice(&[0u8; 3]);
        state
            .bytes
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        state.bytes.extend_from_slice(&crc.to_be_bytes());
        state.bytes.extend_from_slice(payload);
        let written = (state.bytes.len() - start) as u64;
        state.stats.markers_appended += 1;
        state.stats.bytes_appended += written;
        trace!(seq, tx = tx.0, kind = ?kind, bytes = written, "marker appended");
        seq
    }

    /// Copy of the encoded log contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Activity counters.
    pub fn stats(&self) -> MarkerLogStats {
        self.state.lock().stats.clone()
    }

    /// Number of markers appended so far.
    pub fn len(&self) -> u64 {
        self.state.lock().stats.markers_appended
    }

    /// Returns true if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes and validates every marker in the log.
    pub fn markers(&self) -> Result<Vec<Marker>> {
        decode_markers(&self.to_bytes())
    }

    /// Decodes the markers written by one transaction, in log order.
    pub fn markers_for(&self, tx: TransactionId) -> Result<Vec<Marker>> {
        Ok(self
            .markers()?
            .into_iter()
            .filter(|marker| marker.tx == tx)
            .collect())
    }
}

/// Decodes an encoded marker log, failing on the first damaged record.
pub fn decode_markers(bytes: &[u8]) -> Result<Vec<Marker>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + MARKER_HEADER_LEN)
            .ok_or(TesseraError::Corruption("truncated marker header"))?;
        let seq = u64::from_be_bytes(be_array(&header[0..8]));
        let tx = u64::from_be_bytes(be_array(&header[8..16]));
        let kind_byte = header[16];
        let len = u32::from_be_bytes(be_array(&header[20..24])) as usize;
        let stored_crc = u32::from_be_bytes(be_array(&header[24..28]));
        let payload_start = offset + MARKER_HEADER_LEN;
        let payload = bytes
            .get(payload_start..payload_start + len)
            .ok_or(TesseraError::Corruption("truncated marker payload"))?;
        if marker_crc32(seq, tx, kind_byte, payload) != stored_crc {
            return Err(TesseraError::Corruption("marker checksum mismatch"));
        }
        let kind =
            MarkerKind::from_byte(kind_byte).ok_or(TesseraError::Corruption("unknown marker kind"))?;
        out.push(Marker {
            seq,
            tx: TransactionId(tx),
            kind,
            payload: payload.to_vec(),
        });
        offset = payload_start + len;
    }
    Ok(out)
}

fn be_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&src[..N]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_crc32_changes_with_components() {
        let payload = br#"{"_key":"1"}"#;
        let base = marker_crc32(1, 7, 2, payload);
        assert_eq!(base, marker_crc32(1, 7, 2, payload));
        assert_ne!(base, marker_crc32(2, 7, 2, payload));
        assert_ne!(base, marker_crc32(1, 8, 2, payload));
        assert_ne!(base, marker_crc32(1, 7, 3, payload));
        assert_ne!(base, marker_crc32(1, 7, 2, b"{}"));
    }

    #[test]
    fn append_and_decode_roundtrip() -> Result<()> {
        let log = MarkerLog::new();
        assert!(log.is_empty());
        let a = log.append(TransactionId(3), MarkerKind::Begin, &[]);
        let b = log.append(TransactionId(3), MarkerKind::Data, br#"{"_key":"k"}"#);
        let c = log.append(TransactionId(4), MarkerKind::Begin, &[]);
        let d = log.append(TransactionId(3), MarkerKind::Commit, &[]);
        assert_eq!((a, b, c, d), (1, 2, 3, 4));
        assert_eq!(log.len(), 4);

        let mine = log.markers_for(TransactionId(3))?;
        let kinds: Vec<_> = mine.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MarkerKind::Begin, MarkerKind::Data, MarkerKind::Commit]
        );
        assert_eq!(mine[1].payload, br#"{"_key":"k"}"#.to_vec());
        assert!(mine[2].kind.is_end());
        assert_eq!(log.stats().bytes_appended, log.to_bytes().len() as u64);
        Ok(())
    }

    #[test]
    fn detects_flipped_payload_byte() {
        let log = MarkerLog::new();
        log.append(TransactionId(1), MarkerKind::Data, b"payload");
        let mut bytes = log.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(
            decode_markers(&bytes),
            Err(TesseraError::Corruption("marker checksum mismatch"))
        );
    }

    #[test]
    fn detects_truncation() {
        let log = MarkerLog::new();
        log.append(TransactionId(1), MarkerKind::Data, b"payload");
        let bytes = log.to_bytes();
        assert!(decode_markers(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode_markers(&bytes[..10]).is_err());
        assert_eq!(decode_markers(&[]), Ok(Vec::new()));
    }
}
