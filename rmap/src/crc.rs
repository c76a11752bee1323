//! The RMAP CRC-8, as defined by ECSS-E-ST-50-52C.
//!
//! The generator polynomial is x^8 + x^2 + x + 1 with the bits processed least significant first
//! and a zero initial value, so the lookup table is built from the reflected polynomial `0xE0`.
//! Because there is no final XOR, running the CRC over a field *and* its appended CRC byte yields
//! zero, which is how received fields are checked.

const REFLECTED_POLY: u8 = 0xE0;

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ REFLECTED_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u8; 256] = build_table();

/// Calculate the RMAP CRC over `bytes`
#[must_use]
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |crc, &byte| TABLE[usize::from(crc ^ byte)])
}

/// Checks a field that is immediately followed by its CRC byte
#[must_use]
pub fn check(field_with_crc: &[u8]) -> bool {
    crc8(field_with_crc) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_head() {
        // First entries of the table printed in the RMAP standard
        assert_eq!(
            &TABLE[..12],
            &[0x00, 0x91, 0xE3, 0x72, 0x07, 0x96, 0xE4, 0x75, 0x0E, 0x9F, 0xED, 0x7C]
        );
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_single_byte() {
        assert_eq!(crc8(&[0x01]), 0x91);
        assert_eq!(crc8(&[0x04]), 0x07);
    }

    #[test]
    fn test_appended_crc_checks_to_zero() {
        let mut field = vec![0xFE, 0x01, 0x4D, 0x00, 0x34, 0x12, 0x34, 0x00, 0x44, 0xA2, 0x00, 0x6C];
        field.push(crc8(&field));
        assert!(check(&field));
        let last = field.len() - 1;
        field[last] ^= 0x01;
        assert!(!check(&field));
    }

    #[test]
    fn test_single_bit_flips_detected() {
        let field: Vec<u8> = (0u8..32).map(|x| x.wrapping_mul(37)).collect();
        let good = crc8(&field);
        for byte in 0..field.len() {
            for bit in 0..8 {
                let mut flipped = field.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc8(&flipped), good, "missed flip at byte {byte} bit {bit}");
            }
        }
    }
}
