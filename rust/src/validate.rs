//! Flake v1 validation and parsing.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crc8;
use crate::flake::{
    CHECKSUM_OFFSET, COUNTER_BITS, FlakeError, ID_LEN, TIMESTAMP_MASK, VERSION, VERSION_SHIFT,
    WORKER_OFFSET,
};

/// Parsed Flake components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFlake {
    pub version: u8,
    pub timestamp_micros: u64,
    pub timestamp: DateTime<Utc>,
    pub counter: u8,
    pub worker_id: u32,
    pub checksum: u8,
}

fn time_word(id: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&id[..WORKER_OFFSET]);
    u64::from_be_bytes(word)
}

/// Check that `id` is structurally a Flake v1 identifier.
///
/// Length is checked before any field is read, then the version nibble,
/// then the CRC-8 of the first 11 bytes. The first failure is returned.
pub fn validate(id: &[u8]) -> Result<(), FlakeError> {
    if id.len() != ID_LEN {
        return Err(FlakeError::InvalidLength { found: id.len() });
    }

    let version = (time_word(id) >> VERSION_SHIFT) as u8;
    if version != VERSION {
        return Err(FlakeError::VersionMismatch { found: version });
    }

    let expected = crc8::checksum(&id[..CHECKSUM_OFFSET]);
    let found = id[CHECKSUM_OFFSET];
    if expected != found {
        return Err(FlakeError::ChecksumMismatch { expected, found });
    }

    Ok(())
}

/// Validate `id` and split it into its fields.
pub fn parse_flake(id: &[u8]) -> Result<ParsedFlake, FlakeError> {
    validate(id)?;

    let word = time_word(id);
    let timestamp_micros = (word & TIMESTAMP_MASK) >> COUNTER_BITS;
    let timestamp = DateTime::from_timestamp_micros(timestamp_micros as i64)
        .ok_or(FlakeError::InvalidTimestamp)?;

    let worker_id = id[WORKER_OFFSET..CHECKSUM_OFFSET]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

    Ok(ParsedFlake {
        version: VERSION,
        timestamp_micros,
        timestamp,
        counter: word as u8,
        worker_id,
        checksum: id[CHECKSUM_OFFSET],
    })
}
