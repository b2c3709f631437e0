//! On-disk journal encoding.
//!
//! Each journal fragment starts with a fixed header: 8-byte magic, 4-byte
//! version, 4-byte header length and an 8-byte creation timestamp. Records
//! follow, block-aligned: a record never crosses a 4 KiB block boundary; when
//! the remaining block space is too small a pad record fills it.
//!
//! Record layout (big-endian):
//! magic (1) ‖ status (1) ‖ timestamp (8) ‖ sequence (4) ‖ crc32 (4) ‖
//! gtridLen (4) ‖ gtrid ‖ namesLen (4) ‖ names, where names are UTF-8
//! strings separated by NUL. The CRC covers every record byte except the
//! crc32 field itself.

use std::collections::BTreeSet;

use bytes::{BufMut, BytesMut};

use tandem_core::uid::MAX_UID_LENGTH;
use tandem_core::{Result, TransactionError, Uid};

use crate::status::TxStatus;

/// File magic identifying a journal fragment.
pub(crate) const FILE_MAGIC: [u8; 8] = *b"TANDEMLG";

/// On-disk format version.
pub(crate) const FILE_VERSION: u32 = 1;

/// Length of the file header in bytes.
pub(crate) const FILE_HEADER_LENGTH: u32 = 24;

/// Records never cross a boundary of this many bytes.
pub(crate) const BLOCK_SIZE: u64 = 4096;

/// First byte of every data record.
pub(crate) const RECORD_MAGIC: u8 = 0xA5;

/// First byte of a pad record; the rest of the block is dead space.
pub(crate) const PAD_MAGIC: u8 = 0x5A;

const FIXED_RECORD_LENGTH: usize = 1 + 1 + 8 + 4 + 4 + 4;

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JournalRecord {
    pub status: TxStatus,
    pub gtrid: Uid,
    pub unique_names: BTreeSet<String>,
    pub timestamp_ms: i64,
    pub sequence: u32,
}

impl JournalRecord {
    /// Encodes the record, computing its CRC.
    ///
    /// Fails when the encoded record would not fit inside one block.
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let names = join_names(&self.unique_names);
        let total =
            FIXED_RECORD_LENGTH + self.gtrid.as_bytes().len() + 4 + names.len();
        if total as u64 > BLOCK_SIZE {
            return Err(TransactionError::System(format!(
                "journal record for gtrid {} does not fit in one block ({total} bytes)",
                self.gtrid
            )));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[RECORD_MAGIC, self.status.value()]);
        hasher.update(&self.timestamp_ms.to_be_bytes());
        hasher.update(&self.sequence.to_be_bytes());
        hasher.update(&(self.gtrid.as_bytes().len() as u32).to_be_bytes());
        hasher.update(self.gtrid.as_bytes());
        hasher.update(&(names.len() as u32).to_be_bytes());
        hasher.update(&names);
        let crc = hasher.finalize();

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(RECORD_MAGIC);
        buf.put_u8(self.status.value());
        buf.put_i64(self.timestamp_ms);
        buf.put_u32(self.sequence);
        buf.put_u32(crc);
        buf.put_u32(self.gtrid.as_bytes().len() as u32);
        buf.put_slice(self.gtrid.as_bytes());
        buf.put_u32(names.len() as u32);
        buf.put_slice(&names);
        Ok(buf)
    }
}

/// What the reader found at a given offset.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// A valid record and its encoded length.
    Record(JournalRecord, usize),
    /// A pad record; skip to the next block boundary.
    Pad,
    /// Never-written space; the log ends here.
    EndOfLog,
    /// Bytes that are neither a record, a pad nor untouched space.
    Corrupted(String),
}

/// Decodes whatever starts at `buf[0]`; `buf` must not extend past the
/// current block boundary.
pub(crate) fn read_record(buf: &[u8]) -> ReadOutcome {
    let Some(&magic) = buf.first() else {
        return ReadOutcome::EndOfLog;
    };
    match magic {
        0 => return ReadOutcome::EndOfLog,
        PAD_MAGIC => return ReadOutcome::Pad,
        RECORD_MAGIC => {}
        other => {
            return ReadOutcome::Corrupted(format!("unexpected record magic 0x{other:02X}"))
        }
    }

    if buf.len() < FIXED_RECORD_LENGTH {
        return ReadOutcome::Corrupted("truncated record header".to_string());
    }

    let Some(status) = TxStatus::from_value(buf[1]) else {
        return ReadOutcome::Corrupted(format!("invalid status byte 0x{:02X}", buf[1]));
    };
    let timestamp_ms = i64::from_be_bytes(buf[2..10].try_into().expect("slice length"));
    let sequence = u32::from_be_bytes(buf[10..14].try_into().expect("slice length"));
    let crc = u32::from_be_bytes(buf[14..18].try_into().expect("slice length"));
    let gtrid_len = u32::from_be_bytes(buf[18..22].try_into().expect("slice length")) as usize;

    if gtrid_len == 0 {
        return ReadOutcome::Corrupted("zero-length gtrid".to_string());
    }
    if gtrid_len > MAX_UID_LENGTH {
        return ReadOutcome::Corrupted(format!("gtrid length {gtrid_len} out of range"));
    }
    if buf.len() < FIXED_RECORD_LENGTH + gtrid_len + 4 {
        return ReadOutcome::Corrupted("truncated gtrid".to_string());
    }

    let gtrid_end = FIXED_RECORD_LENGTH + gtrid_len;
    let gtrid_bytes = &buf[FIXED_RECORD_LENGTH..gtrid_end];
    let names_len =
        u32::from_be_bytes(buf[gtrid_end..gtrid_end + 4].try_into().expect("slice length"))
            as usize;
    let names_end = gtrid_end + 4 + names_len;
    if buf.len() < names_end {
        return ReadOutcome::Corrupted("truncated names block".to_string());
    }
    let names_bytes = &buf[gtrid_end + 4..names_end];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[RECORD_MAGIC, buf[1]]);
    hasher.update(&buf[2..14]);
    hasher.update(&buf[18..gtrid_end + 4]);
    hasher.update(names_bytes);
    if hasher.finalize() != crc {
        return ReadOutcome::Corrupted(format!(
            "crc mismatch on record for gtrid {}",
            Uid::new(gtrid_bytes.to_vec())
        ));
    }

    let unique_names = match split_names(names_bytes) {
        Ok(names) => names,
        Err(message) => return ReadOutcome::Corrupted(message),
    };

    ReadOutcome::Record(
        JournalRecord {
            status,
            gtrid: Uid::new(gtrid_bytes.to_vec()),
            unique_names,
            timestamp_ms,
            sequence,
        },
        names_end,
    )
}

/// Encodes the fragment header.
pub(crate) fn encode_file_header(timestamp_ms: i64) -> [u8; FILE_HEADER_LENGTH as usize] {
    let mut header = [0u8; FILE_HEADER_LENGTH as usize];
    header[..8].copy_from_slice(&FILE_MAGIC);
    header[8..12].copy_from_slice(&FILE_VERSION.to_be_bytes());
    header[12..16].copy_from_slice(&FILE_HEADER_LENGTH.to_be_bytes());
    header[16..24].copy_from_slice(&timestamp_ms.to_be_bytes());
    header
}

/// Decodes and validates a fragment header, returning its timestamp.
pub(crate) fn decode_file_header(buf: &[u8]) -> Result<i64> {
    if buf.len() < FILE_HEADER_LENGTH as usize {
        return Err(TransactionError::System(
            "journal file too short for a header".to_string(),
        ));
    }
    if buf[..8] != FILE_MAGIC {
        return Err(TransactionError::System(
            "journal file carries a foreign magic".to_string(),
        ));
    }
    let version = u32::from_be_bytes(buf[8..12].try_into().expect("slice length"));
    if version != FILE_VERSION {
        return Err(TransactionError::System(format!(
            "unsupported journal version {version}"
        )));
    }
    let header_length = u32::from_be_bytes(buf[12..16].try_into().expect("slice length"));
    if header_length != FILE_HEADER_LENGTH {
        return Err(TransactionError::System(format!(
            "unsupported journal header length {header_length}"
        )));
    }
    Ok(i64::from_be_bytes(buf[16..24].try_into().expect("slice length")))
}

fn join_names(names: &BTreeSet<String>) -> Vec<u8> {
    let mut joined = Vec::new();
    for (index, name) in names.iter().enumerate() {
        if index > 0 {
            joined.push(0);
        }
        joined.extend_from_slice(name.as_bytes());
    }
    joined
}

fn split_names(bytes: &[u8]) -> std::result::Result<BTreeSet<String>, String> {
    if bytes.is_empty() {
        return Ok(BTreeSet::new());
    }
    let mut names = BTreeSet::new();
    for chunk in bytes.split(|byte| *byte == 0) {
        let name = std::str::from_utf8(chunk)
            .map_err(|_| "record names block is not valid UTF-8".to_string())?;
        names.insert(name.to_string());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::UidGenerator;

    fn sample_record() -> JournalRecord {
        let generator = UidGenerator::new("journal-test");
        JournalRecord {
            status: TxStatus::Committing,
            gtrid: generator.generate_uid(),
            unique_names: BTreeSet::from(["orders-db".to_string(), "audit-queue".to_string()]),
            timestamp_ms: 1_700_000_000_000,
            sequence: 42,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let record = sample_record();
        let encoded = record.encode().unwrap();

        match read_record(&encoded) {
            ReadOutcome::Record(decoded, consumed) => {
                assert_eq!(decoded, record);
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_names_round_trip() {
        let mut record = sample_record();
        record.unique_names.clear();
        let encoded = record.encode().unwrap();
        match read_record(&encoded) {
            ReadOutcome::Record(decoded, _) => assert!(decoded.unique_names.is_empty()),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_flipped_bit_fails_crc() {
        let record = sample_record();
        let mut encoded = record.encode().unwrap().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert!(matches!(read_record(&encoded), ReadOutcome::Corrupted(_)));
    }

    #[test]
    fn test_zero_magic_is_end_of_log() {
        assert!(matches!(read_record(&[0u8; 64]), ReadOutcome::EndOfLog));
        assert!(matches!(read_record(&[]), ReadOutcome::EndOfLog));
    }

    #[test]
    fn test_pad_magic_is_pad() {
        let mut block = vec![0u8; 32];
        block[0] = PAD_MAGIC;
        assert!(matches!(read_record(&block), ReadOutcome::Pad));
    }

    #[test]
    fn test_unknown_magic_is_corruption() {
        let block = vec![0x13u8; 32];
        assert!(matches!(read_record(&block), ReadOutcome::Corrupted(_)));
    }

    #[test]
    fn test_zero_length_gtrid_rejected() {
        let record = sample_record();
        let mut encoded = record.encode().unwrap().to_vec();
        // overwrite gtridLen with 0
        encoded[18..22].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(read_record(&encoded), ReadOutcome::Corrupted(_)));
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let record = sample_record();
        let encoded = record.encode().unwrap();
        let truncated = &encoded[..encoded.len() - 5];
        assert!(matches!(read_record(truncated), ReadOutcome::Corrupted(_)));
    }

    #[test]
    fn test_file_header_round_trip() {
        let header = encode_file_header(1_700_000_123_456);
        assert_eq!(decode_file_header(&header).unwrap(), 1_700_000_123_456);
    }

    #[test]
    fn test_foreign_file_header_rejected() {
        let mut header = encode_file_header(0);
        header[0] = b'X';
        assert!(decode_file_header(&header).is_err());
    }
}
