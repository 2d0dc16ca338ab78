//! Checkpoint serialization with integrity verification.
//!
//! Wraps a bincode-serialized [`crate::types::Checkpoint`] with a small
//! header (magic bytes, format version, CRC32 checksum, payload length) so
//! a corrupted or truncated checkpoint is detected on restore rather than
//! silently deserialized into garbage. Format and header layout follow the
//! teacher's `CheckpointWithIntegrity` scheme.

use crate::types::Checkpoint;

/// Magic bytes identifying a veritas-core checkpoint file.
const CHECKPOINT_MAGIC: &[u8; 4] = b"VTCP";

/// Current checkpoint format version. Bump when the header layout changes.
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8) = 20 bytes.
const CHECKPOINT_HEADER_SIZE: usize = 20;

/// Failure modes detected while verifying a checkpoint's integrity header.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CheckpointIntegrityError {
    /// The buffer is too small to contain a valid header.
    #[error("checkpoint buffer too small: {size} bytes (minimum {minimum})")]
    TooSmall {
        /// Actual buffer size.
        size: usize,
        /// Minimum required size.
        minimum: usize,
    },
    /// Magic bytes did not match.
    #[error("invalid checkpoint magic: expected {expected:?}, found {found:?}")]
    InvalidMagic {
        /// Expected magic bytes.
        expected: [u8; 4],
        /// Magic bytes actually found.
        found: [u8; 4],
    },
    /// Format version is newer than this build supports.
    #[error("unsupported checkpoint format version {found}, supported up to {supported}")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u32,
        /// Highest version this build supports.
        supported: u32,
    },
    /// Declared payload length did not match the actual remaining bytes.
    #[error("checkpoint length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length declared in the header.
        declared: u64,
        /// Actual remaining byte count.
        actual: u64,
    },
    /// CRC32 checksum did not match the payload.
    #[error("checkpoint checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Checksum recorded in the header.
        expected: u32,
        /// Checksum computed from the payload.
        computed: u32,
    },
    /// The payload bytes did not deserialize into a [`Checkpoint`].
    #[error("checkpoint payload could not be decoded: {0}")]
    Decode(String),
}

/// Serialize a checkpoint into an integrity-wrapped byte buffer.
pub fn wrap(checkpoint: &Checkpoint) -> Vec<u8> {
    let payload = bincode::serialize(checkpoint).expect("Checkpoint always serializes");
    let checksum = crc32fast::hash(&payload);
    let length = payload.len() as u64;

    let mut buf = Vec::with_capacity(CHECKPOINT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Verify and decode an integrity-wrapped checkpoint buffer.
pub fn unwrap(data: &[u8]) -> Result<Checkpoint, CheckpointIntegrityError> {
    if data.len() < CHECKPOINT_HEADER_SIZE {
        return Err(CheckpointIntegrityError::TooSmall {
            size: data.len(),
            minimum: CHECKPOINT_HEADER_SIZE,
        });
    }

    let magic: [u8; 4] = data[0..4].try_into().expect("slice is exactly 4 bytes");
    if &magic != CHECKPOINT_MAGIC {
        return Err(CheckpointIntegrityError::InvalidMagic {
            expected: *CHECKPOINT_MAGIC,
            found: magic,
        });
    }

    let version = u32::from_le_bytes(data[4..8].try_into().expect("slice is exactly 4 bytes"));
    if version > CHECKPOINT_FORMAT_VERSION {
        return Err(CheckpointIntegrityError::UnsupportedVersion {
            found: version,
            supported: CHECKPOINT_FORMAT_VERSION,
        });
    }

    let stored_checksum = u32::from_le_bytes(data[8..12].try_into().expect("slice is exactly 4 bytes"));
    let declared_length = u64::from_le_bytes(data[12..20].try_into().expect("slice is exactly 8 bytes"));

    let payload = &data[CHECKPOINT_HEADER_SIZE..];
    let actual_length = payload.len() as u64;
    if declared_length != actual_length {
        return Err(CheckpointIntegrityError::LengthMismatch {
            declared: declared_length,
            actual: actual_length,
        });
    }

    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(CheckpointIntegrityError::ChecksumMismatch {
            expected: stored_checksum,
            computed: computed_checksum,
        });
    }

    bincode::deserialize(payload).map_err(|e| CheckpointIntegrityError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanId, ProcessTree};
    use std::collections::BTreeMap;

    fn sample() -> Checkpoint {
        Checkpoint {
            plan_id: PlanId::new(),
            tree_structure: ProcessTree {
                plan_id: PlanId::new(),
                steps: BTreeMap::new(),
                roots: vec![],
            },
            step_statuses: BTreeMap::new(),
            step_results: BTreeMap::new(),
            level_cursor: 0,
            intervention_log: vec![],
        }
    }

    #[test]
    fn round_trips() {
        let checkpoint = sample();
        let wrapped = wrap(&checkpoint);
        let restored = unwrap(&wrapped).unwrap();
        assert_eq!(restored.plan_id, checkpoint.plan_id);
        assert_eq!(restored.level_cursor, checkpoint.level_cursor);
    }

    #[test]
    fn detects_bit_flip_corruption() {
        let mut wrapped = wrap(&sample());
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;
        let err = unwrap(&wrapped).unwrap_err();
        assert!(matches!(err, CheckpointIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn detects_truncation() {
        let wrapped = wrap(&sample());
        let truncated = &wrapped[..wrapped.len() - 5];
        let err = unwrap(truncated).unwrap_err();
        assert!(matches!(err, CheckpointIntegrityError::LengthMismatch { .. }));
    }

    #[test]
    fn detects_bad_magic() {
        let mut wrapped = wrap(&sample());
        wrapped[0] = b'X';
        let err = unwrap(&wrapped).unwrap_err();
        assert!(matches!(err, CheckpointIntegrityError::InvalidMagic { .. }));
    }

    #[test]
    fn rejects_too_small_buffer() {
        let err = unwrap(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, CheckpointIntegrityError::TooSmall { .. }));
    }
}
