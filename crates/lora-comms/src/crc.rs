//! CRC-16 over frame bodies
//!
//! Frames carry a CRC-16/IBM-3740 (polynomial 0x1021, initial value 0xFFFF,
//! no reflection) of the de-stuffed body, appended little-endian.

use crc::{Crc, CRC_16_IBM_3740};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Compute the checksum of `bytes`
pub fn compute(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Check `bytes` against a received checksum
pub fn verify(bytes: &[u8], expected: u16) -> bool {
    compute(bytes) == expected
}
