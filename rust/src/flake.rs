//! Flake v1 generation.
//!
//! Layout, most significant byte first:
//!
//! ```text
//! bytes 0..8   version(4) | unix time in usec(52) | overflow(8)
//! bytes 8..11  worker id(24)
//! byte  11     CRC-8 of bytes 0..11
//! ```
//!
//! A [`FlakeGen`] is shared by reference (or `Arc`) between threads; every
//! call takes the generator's lock for the whole generate-and-encode step.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use parking_lot::Mutex;
use rand::{TryRngCore, rngs::OsRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crc8;

/// Length of a raw identifier in bytes.
pub const ID_LEN: usize = 12;
/// Length of the hexadecimal text form.
pub const HEX_LEN: usize = 24;
/// Length of the URL-safe base64 text form.
pub const B64_LEN: usize = 16;
/// Version carried in the top nibble of every identifier.
pub const VERSION: u8 = 1;
/// Largest worker identity that fits the 24-bit field.
pub const MAX_WORKER_ID: u32 = 0x00ff_ffff;

pub(crate) const VERSION_SHIFT: u32 = 60;
pub(crate) const COUNTER_BITS: u32 = 8;
pub(crate) const TIMESTAMP_MASK: u64 = 0x0fff_ffff_ffff_ff00;
pub(crate) const COUNTER_MASK: u64 = 0xff;
pub(crate) const WORKER_OFFSET: usize = 8;
pub(crate) const CHECKSUM_OFFSET: usize = 11;

const VERSION_BITS: u64 = (VERSION as u64) << VERSION_SHIFT;
const COUNTER_VALUES: u16 = 1 << COUNTER_BITS;

/// A raw Flake v1 identifier.
pub type FlakeId = [u8; ID_LEN];

/// Errors that can occur during Flake operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlakeError {
    #[error("Secure random source unavailable: {0}")]
    Entropy(String),
    #[error("Expected length {expected}, got {found}", expected = ID_LEN)]
    InvalidLength { found: usize },
    #[error("Expected Flake v{expected}, got v{found}", expected = VERSION)]
    VersionMismatch { found: u8 },
    #[error("CRC8 mismatch: expected {expected:02x}, got {found:02x}")]
    ChecksumMismatch { expected: u8, found: u8 },
    #[error("Invalid timestamp in Flake")]
    InvalidTimestamp,
}

struct State {
    counter: u8,
    last: u64,
    /// Ids emitted so far on the timestamp of `last`.
    run: u16,
    buf: FlakeId,
}

impl State {
    /// Compute the next time-word for `now_micros` and record it.
    fn advance(&mut self, now_micros: u64) -> u64 {
        let ts = (now_micros << COUNTER_BITS) & TIMESTAMP_MASK;
        let mut word = VERSION_BITS | ts | u64::from(self.counter);

        if word <= self.last {
            self.counter = self.counter.wrapping_add(1);
            // Clock stalled or went backwards: stay on the last emitted microsecond.
            let ts = ts.max(self.last & TIMESTAMP_MASK);
            trace!(counter = self.counter, "clock has not advanced, bumping counter");
            word = VERSION_BITS | ts | u64::from(self.counter);

            // Counter rolled over before this microsecond used all 256 values:
            // carry into the timestamp. A full 256 in one microsecond wraps.
            if word <= self.last && self.run < COUNTER_VALUES {
                word = VERSION_BITS
                    | (self.last.wrapping_add(1) & (TIMESTAMP_MASK | COUNTER_MASK));
            }
        }

        if word & TIMESTAMP_MASK == self.last & TIMESTAMP_MASK {
            self.run = self.run.saturating_add(1);
        } else {
            self.run = 1;
        }
        self.last = word;
        word
    }

    fn tick(&mut self, now_micros: u64) {
        let word = self.advance(now_micros);
        self.buf[..WORKER_OFFSET].copy_from_slice(&word.to_be_bytes());
        self.buf[CHECKSUM_OFFSET] = crc8::checksum(&self.buf[..CHECKSUM_OFFSET]);
    }
}

fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

fn seed_counter() -> Result<u8, FlakeError> {
    let mut seed = [0u8; 1];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| FlakeError::Entropy(e.to_string()))?;
    Ok(seed[0])
}

/// Flake v1 generator bound to one worker identity.
pub struct FlakeGen {
    worker_id: u32,
    state: Mutex<State>,
}

impl FlakeGen {
    /// Create a generator for `worker_id`.
    ///
    /// The overflow counter starts from a byte read from the OS secure random
    /// source, so generators started together with the same worker identity
    /// are unlikely to step on each other. Failing to read it is fatal to
    /// construction.
    ///
    /// Only the low 24 bits of `worker_id` are used; keeping worker
    /// identities in range and unique is the caller's responsibility.
    pub fn new(worker_id: u32) -> Result<Self, FlakeError> {
        let counter = seed_counter()?;
        debug!(worker_id, counter, "flake generator seeded");
        Ok(Self::with_counter(worker_id, counter))
    }

    pub(crate) fn with_counter(worker_id: u32, counter: u8) -> Self {
        if worker_id > MAX_WORKER_ID {
            warn!(worker_id, "worker id exceeds 24 bits, truncating");
        }
        let worker_id = worker_id & MAX_WORKER_ID;

        let mut buf = [0u8; ID_LEN];
        buf[WORKER_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&worker_id.to_be_bytes()[1..]);

        Self {
            worker_id,
            state: Mutex::new(State {
                counter,
                last: 0,
                run: 0,
                buf,
            }),
        }
    }

    /// Worker identity stamped into every identifier.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Generate the next raw identifier.
    pub fn next_raw(&self) -> FlakeId {
        let mut state = self.state.lock();
        state.tick(now_micros());
        state.buf
    }

    /// Generate the next identifier as 24 lowercase hex characters.
    pub fn next_hex(&self) -> String {
        let mut state = self.state.lock();
        state.tick(now_micros());
        hex::encode(state.buf)
    }

    /// Generate the next identifier as 16 URL-safe base64 characters.
    pub fn next_b64(&self) -> String {
        let mut state = self.state.lock();
        state.tick(now_micros());
        URL_SAFE_NO_PAD.encode(state.buf)
    }

    /// Generate n raw identifiers.
    pub fn next_n(&self, n: usize) -> Vec<FlakeId> {
        (0..n).map(|_| self.next_raw()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use regex::Regex;
    use std::collections::HashSet;
    use std::thread;

    const AAX24: u32 = 0x00aa_aaaa;

    fn as_u128(id: &FlakeId) -> u128 {
        let mut wide = [0u8; 16];
        wide[4..].copy_from_slice(id);
        u128::from_be_bytes(wide)
    }

    fn word(id: &FlakeId) -> u64 {
        u64::from_be_bytes(id[..8].try_into().unwrap())
    }

    #[test]
    fn test_new_generates_valid_ids() {
        let g = FlakeGen::new(AAX24).unwrap();
        let a = g.next_raw();
        let b = g.next_raw();
        assert_eq!(&a[8..11], &[0xaa, 0xaa, 0xaa]);
        assert_eq!(&b[8..11], &[0xaa, 0xaa, 0xaa]);
        assert!(as_u128(&b) > as_u128(&a));
        validate(&a).unwrap();
        validate(&b).unwrap();
    }

    #[test]
    fn test_generator_monotonic() {
        let g = FlakeGen::new(1).unwrap();
        let ids = g.next_n(5_000);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| id[0] >> 4 == VERSION));
    }

    #[test]
    fn test_returned_id_is_a_copy() {
        let g = FlakeGen::new(7).unwrap();
        let mut a = g.next_raw();
        a[0] = 0xff;
        let b = g.next_raw();
        assert_ne!(a[0], b[0]);
        validate(&b).unwrap();
    }

    #[test]
    fn test_worker_id_truncated_to_24_bits() {
        let g = FlakeGen::new(0xff12_3456).unwrap();
        assert_eq!(g.worker_id(), 0x0012_3456);
        let id = g.next_raw();
        assert_eq!(&id[8..11], &[0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_next_hex_shape_and_decode() {
        let g = FlakeGen::new(AAX24).unwrap();
        let text = g.next_hex();
        let pattern = Regex::new(r"^[0-9a-f]{24}$").unwrap();
        assert!(pattern.is_match(&text), "{text}");
        assert_eq!(text.len(), HEX_LEN);

        let id = hex::decode(&text).unwrap();
        validate(&id).unwrap();
        assert_eq!(&id[8..11], &[0xaa, 0xaa, 0xaa]);

        let next = g.next_raw();
        assert!(next.as_slice() > id.as_slice());
    }

    #[test]
    fn test_next_b64_shape_and_decode() {
        let g = FlakeGen::new(AAX24).unwrap();
        let text = g.next_b64();
        let pattern = Regex::new(r"^[A-Za-z0-9_-]{16}$").unwrap();
        assert!(pattern.is_match(&text), "{text}");
        assert_eq!(text.len(), B64_LEN);

        let id = URL_SAFE_NO_PAD.decode(&text).unwrap();
        assert_eq!(id.len(), ID_LEN);
        validate(&id).unwrap();
    }

    #[test]
    fn test_advance_same_microsecond_bumps_counter() {
        let g = FlakeGen::with_counter(1, 10);
        let mut state = g.state.lock();
        let a = state.advance(1_000);
        let b = state.advance(1_000);
        assert!(b > a);
        assert_eq!(a & 0xff, 10);
        assert_eq!(b & 0xff, 11);
        assert_eq!(a & TIMESTAMP_MASK, b & TIMESTAMP_MASK);
    }

    #[test]
    fn test_advance_keeps_counter_when_clock_moves() {
        let g = FlakeGen::with_counter(1, 42);
        let mut state = g.state.lock();
        let a = state.advance(1_000);
        let b = state.advance(1_001);
        assert!(b > a);
        assert_eq!(b & 0xff, 42);
        assert_eq!((b & TIMESTAMP_MASK) >> COUNTER_BITS, 1_001);
    }

    #[test]
    fn test_advance_clock_regression_stays_monotonic() {
        let g = FlakeGen::with_counter(1, 0);
        let mut state = g.state.lock();
        let a = state.advance(5_000);
        let b = state.advance(4_000);
        let c = state.advance(3_000);
        assert!(b > a);
        assert!(c > b);
        assert_eq!((c & TIMESTAMP_MASK) >> COUNTER_BITS, 5_000);
        let d = state.advance(5_001);
        assert!(d > c);
    }

    #[test]
    fn test_advance_counter_rollover_carries_into_timestamp() {
        let g = FlakeGen::with_counter(1, 255);
        let mut state = g.state.lock();
        let a = state.advance(1_000);
        let b = state.advance(1_001);
        let c = state.advance(1_001);
        assert!(b > a);
        assert!(c > b, "{b:016x} then {c:016x}");
        assert_eq!(c, b + 1);
        assert_eq!(c >> VERSION_SHIFT, u64::from(VERSION));
        assert_eq!((c & TIMESTAMP_MASK) >> COUNTER_BITS, 1_002);
        assert_eq!(c & COUNTER_MASK, 0);

        // The clock catches up with the borrowed microsecond.
        let d = state.advance(1_001);
        let e = state.advance(1_002);
        assert!(d > c);
        assert!(e > d);
    }

    #[test]
    fn test_advance_rollover_on_clock_regression() {
        let g = FlakeGen::with_counter(1, 254);
        let mut state = g.state.lock();
        let a = state.advance(7_000);
        let b = state.advance(6_000);
        let c = state.advance(6_000);
        assert_eq!(b & COUNTER_MASK, 255);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn test_advance_counter_wraps_after_256_in_one_microsecond() {
        let g = FlakeGen::with_counter(1, 0);
        let mut state = g.state.lock();
        let words: Vec<u64> = (0..256).map(|_| state.advance(9)).collect();
        assert!(words.windows(2).all(|w| w[0] < w[1]));
        assert!(words.iter().all(|w| (w & TIMESTAMP_MASK) >> COUNTER_BITS == 9));
        assert_eq!(words[255] & COUNTER_MASK, 255);

        // Documented limitation: the 257th id within one microsecond sorts lower.
        let wrapped = state.advance(9);
        assert_eq!(wrapped & COUNTER_MASK, 0);
        assert!(wrapped < words[255]);
    }

    #[test]
    fn test_timestamp_masked_to_52_bits() {
        let g = FlakeGen::with_counter(1, 0);
        let mut state = g.state.lock();
        let w = state.advance(u64::MAX);
        assert_eq!(w >> VERSION_SHIFT, u64::from(VERSION));
        assert_eq!((w & TIMESTAMP_MASK) >> COUNTER_BITS, (1u64 << 52) - 1);
    }

    #[test]
    fn test_tick_writes_checksum() {
        let g = FlakeGen::with_counter(0x0102_03, 3);
        let mut state = g.state.lock();
        state.tick(77);
        let id = state.buf;
        assert_eq!(word(&id), VERSION_BITS | (77 << COUNTER_BITS) | 3);
        assert_eq!(&id[8..11], &[0x01, 0x02, 0x03]);
        assert_eq!(id[11], crc8::checksum(&id[..11]));
    }

    #[test]
    fn test_concurrent_single_instance_monotonic_per_thread() {
        let g = FlakeGen::new(AAX24).unwrap();
        let per_thread: Vec<Vec<FlakeId>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| g.next_n(2_000)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut seen = HashSet::new();
        for ids in &per_thread {
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                validate(id).unwrap();
                assert!(seen.insert(*id), "duplicate id {}", hex::encode(id));
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn test_concurrent_instances_same_worker_do_not_collide() {
        let a = FlakeGen::with_counter(AAX24, 0x00);
        let b = FlakeGen::with_counter(AAX24, 0x80);
        let batches: Vec<Vec<FlakeId>> = thread::scope(|s| {
            let handles: Vec<_> = [&a, &a, &b, &b]
                .into_iter()
                .map(|g| s.spawn(move || g.next_n(500)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut seen = HashSet::new();
        for id in batches.iter().flatten() {
            assert!(seen.insert(*id), "duplicate id {}", hex::encode(id));
        }
        assert_eq!(seen.len(), 2_000);
    }
}
