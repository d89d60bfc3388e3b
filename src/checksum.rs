//! Frame checksums used by the acquisition modules.

use crc::{Algorithm, CRC_16_MODBUS, Crc};

/// CRC-8 used by Sensirion SHT3x frames.
/// Polynomial: 0x31
/// Initial Value: 0xFF
/// Input/Output Reflected: false (MSB first)
/// Final XOR: 0x00
/// Check Value: 0xF7 (for "123456789")
pub const SHT3X_CRC: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0xFF,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xF7,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&SHT3X_CRC);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum over one sub-field of a sensor frame.
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Modbus RTU frame check, transmitted low byte first.
#[inline]
pub fn crc16_modbus(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Checks a `[msb, lsb, crc]` word as the SHT3x transmits it.
pub fn word_is_valid(word: &[u8; 3]) -> bool {
    crc8(&word[..2]) == word[2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn crc8_matches_datasheet_vector() {
        // Sensirion SHT3x datasheet, section 4.12
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn crc8_reference_vectors() {
        assert_eq!(crc8(&[0x64, 0x6C]), 0x91);
        assert_eq!(crc8(&[0x64, 0x35]), 0x67);
        assert_eq!(crc8(&[0x6A, 0x0B]), 0xD0);
        assert_eq!(crc8(b"123456789"), 0xF7);
    }

    #[test]
    fn crc8_of_empty_span_is_initial_value() {
        assert_eq!(crc8(&[]), 0xFF);
    }

    #[test]
    fn word_validation_rejects_flipped_bit() {
        assert!(word_is_valid(&[0x64, 0x35, 0x67]));
        assert!(!word_is_valid(&[0x64, 0x35, 0x66]));
        assert!(!word_is_valid(&[0x65, 0x35, 0x67]));
    }

    #[test]
    fn crc16_modbus_request_frame() {
        // read one holding register at 0x0000 from slave 1
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    proptest! {
        #[test]
        fn crc8_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(crc8(&bytes), crc8(&bytes));
        }

        #[test]
        fn appended_crc8_validates(msb: u8, lsb: u8) {
            let word = [msb, lsb, crc8(&[msb, lsb])];
            prop_assert!(word_is_valid(&word));
        }
    }
}
