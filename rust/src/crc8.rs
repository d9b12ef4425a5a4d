//! CRC-8 checksum used for the trailing integrity byte.
//!
//! Polynomial `0x07`, initial value `0x00`, no reflection and no final xor.

use once_cell::sync::Lazy;

/// Generator polynomial (x^8 + x^2 + x + 1).
pub const POLYNOMIAL: u8 = 0x07;

/// Lookup table, built on first use and never rebuilt.
pub static TABLE: Lazy<[u8; 256]> = Lazy::new(|| build_table(POLYNOMIAL));

fn build_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u8;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
        *slot = crc;
    }
    table
}

/// Compute the CRC-8 of `data`.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    let table = &*TABLE;
    data.iter()
        .fold(0u8, |crc, &b| table[(crc ^ b) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(checksum(b"123456789"), 0xF4);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_table_entries() {
        assert_eq!(TABLE[0], 0x00);
        assert_eq!(TABLE[1], POLYNOMIAL);
        assert_eq!(TABLE[0x80], 0x89);
    }

    #[test]
    fn test_detects_single_bit_flips() {
        let data = *b"flake-check";
        let base = checksum(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(checksum(&flipped), base, "byte {byte} bit {bit}");
            }
        }
    }
}
