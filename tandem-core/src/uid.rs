//! Fixed-layout transaction identifiers.
//!
//! A [`Uid`] is an immutable byte sequence of at most 64 bytes laid out as
//! `serverId ‖ timestamp_ms (8 B, big-endian) ‖ sequence (4 B, big-endian)`.
//! Global transaction ids (gtrids) and branch qualifiers (bquals) are both
//! UIDs; an [`Xid`] pairs one of each under the coordinator's format id.
//!
//! Uniqueness across the network relies on the configured server id and on
//! reasonably synchronized clocks; uniqueness within a process relies on the
//! atomic sequence counter.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of a UID in bytes.
pub const MAX_UID_LENGTH: usize = 64;

/// Maximum server id length embedded in a UID; longer ids are truncated.
pub const MAX_SERVER_ID_LENGTH: usize = 51;

const TIMESTAMP_LENGTH: usize = 8;
const SEQUENCE_LENGTH: usize = 4;

/// A constant UID byte container optimized for use as a map key.
///
/// The hash is computed once at construction; equality compares hashes first
/// and falls back to byte-wise comparison.
#[derive(Debug, Clone)]
pub struct Uid {
    array: Box<[u8]>,
    hash: u64,
}

impl Uid {
    /// Wraps the given bytes as a UID.
    ///
    /// # Panics
    ///
    /// Panics if `array` exceeds [`MAX_UID_LENGTH`] bytes.
    pub fn new(array: Vec<u8>) -> Self {
        assert!(
            array.len() <= MAX_UID_LENGTH,
            "UID exceeds maximum size of {} bytes",
            MAX_UID_LENGTH
        );
        let hash = fnv1a(&array);
        Self {
            array: array.into_boxed_slice(),
            hash,
        }
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.array
    }

    /// Returns the length in bytes.
    pub fn len(&self) -> usize {
        self.array.len()
    }

    /// Returns `true` when the UID carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    /// Extracts the embedded server id, or `None` when the UID is too short
    /// to carry one (which indicates journal corruption).
    pub fn extract_server_id(&self) -> Option<&[u8]> {
        let server_id_length = self
            .array
            .len()
            .checked_sub(TIMESTAMP_LENGTH + SEQUENCE_LENGTH)?;
        if server_id_length == 0 {
            return None;
        }
        Some(&self.array[..server_id_length])
    }

    /// Extracts the embedded creation timestamp in milliseconds since epoch.
    pub fn extract_timestamp(&self) -> Option<i64> {
        let offset = self
            .array
            .len()
            .checked_sub(TIMESTAMP_LENGTH + SEQUENCE_LENGTH)?;
        let bytes: [u8; 8] = self.array[offset..offset + TIMESTAMP_LENGTH]
            .try_into()
            .ok()?;
        Some(i64::from_be_bytes(bytes))
    }

    /// Extracts the embedded process-local sequence number.
    pub fn extract_sequence(&self) -> Option<u32> {
        let offset = self.array.len().checked_sub(SEQUENCE_LENGTH)?;
        let bytes: [u8; 4] = self.array[offset..].try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

impl PartialEq for Uid {
    fn eq(&self, other: &Self) -> bool {
        // hash mismatch rules out equality without touching the arrays
        self.hash == other.hash && self.array == other.array
    }
}

impl Eq for Uid {}

impl Hash for Uid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.array.iter() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ============================================================================
// Xid
// ============================================================================

/// A transaction branch identifier: format id, gtrid and bqual.
///
/// Only Xids carrying [`Xid::FORMAT_ID`] are considered during recovery;
/// anything else belongs to a foreign coordinator and is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    gtrid: Uid,
    bqual: Uid,
}

impl Xid {
    /// The format id identifying this coordinator's Xids.
    pub const FORMAT_ID: i32 = 0x544e_444d;

    /// Creates an Xid under this coordinator's format id.
    pub fn new(gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id: Self::FORMAT_ID,
            gtrid,
            bqual,
        }
    }

    /// Creates an Xid with an explicit format id, as reported by a resource
    /// during a recovery scan.
    pub fn with_format_id(format_id: i32, gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    /// Returns the format id.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Returns the global transaction id.
    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    /// Returns the branch qualifier.
    pub fn bqual(&self) -> &Uid {
        &self.bqual
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gtrid, self.bqual)
    }
}

// ============================================================================
// UID generation
// ============================================================================

/// Generates gtrids, bquals and Xids for one coordinator instance.
///
/// The sequence counter is process-local and wraps; a wrap within one
/// millisecond epoch is statistically negligible and not defended against.
#[derive(Debug)]
pub struct UidGenerator {
    server_id: Vec<u8>,
    sequence: AtomicU32,
}

impl UidGenerator {
    /// Creates a generator embedding the given server id, truncated to
    /// [`MAX_SERVER_ID_LENGTH`] bytes.
    pub fn new(server_id: &str) -> Self {
        let mut server_id = server_id.as_bytes().to_vec();
        server_id.truncate(MAX_SERVER_ID_LENGTH);
        Self {
            server_id,
            sequence: AtomicU32::new(0),
        }
    }

    /// Returns the (possibly truncated) server id this generator embeds.
    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    /// Generates a fresh, globally unique UID.
    pub fn generate_uid(&self) -> Uid {
        let timestamp = now_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut array =
            Vec::with_capacity(self.server_id.len() + TIMESTAMP_LENGTH + SEQUENCE_LENGTH);
        array.extend_from_slice(&self.server_id);
        array.extend_from_slice(&timestamp.to_be_bytes());
        array.extend_from_slice(&sequence.to_be_bytes());
        Uid::new(array)
    }

    /// Generates an Xid for a new branch of the transaction identified by
    /// `gtrid`: the gtrid is shared, the bqual is fresh.
    pub fn generate_xid(&self, gtrid: &Uid) -> Xid {
        Xid::new(gtrid.clone(), self.generate_uid())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
