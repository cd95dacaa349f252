//! Summation checksums used by every U3 command and response frame.
//!
//! The 8-bit flavors fold the carry back into the low byte (twice, so a carry
//! produced by the first fold is absorbed too). For sums below 256 this is the
//! same as plain truncation.

/// Offset of the 16-bit checksum (low byte first) in extended frames.
pub const CHECKSUM16_OFFSET: usize = 4;

/// First byte covered by the 16-bit checksum.
pub const EXTENDED_PAYLOAD_OFFSET: usize = 6;

fn fold8(sum: u16) -> u8 {
    let folded = (sum & 0xFF) + (sum >> 8);
    ((folded & 0xFF) + (folded >> 8)) as u8
}

/// Checksum of a normal (non-extended) frame: every byte except index 0.
pub fn checksum8(buffer: &[u8]) -> u8 {
    let sum = buffer
        .iter()
        .skip(1)
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    fold8(sum)
}

/// Header checksum of an extended frame, covering bytes 1 through 5.
pub fn extended_checksum8(buffer: &[u8]) -> u8 {
    let sum = buffer[1..EXTENDED_PAYLOAD_OFFSET]
        .iter()
        .fold(0u16, |acc, &b| acc + b as u16);
    fold8(sum)
}

/// Payload checksum of an extended frame, covering bytes `6..length`.
pub fn extended_checksum16(buffer: &[u8], length: usize) -> u16 {
    buffer[EXTENDED_PAYLOAD_OFFSET..length]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Writes both checksums of an extended frame in place.
///
/// The 16-bit checksum goes in first because the 8-bit header checksum covers it.
pub fn apply_extended_checksum(buffer: &mut [u8]) {
    let sum = extended_checksum16(buffer, buffer.len());
    buffer[CHECKSUM16_OFFSET..EXTENDED_PAYLOAD_OFFSET].copy_from_slice(&sum.to_le_bytes());
    buffer[0] = extended_checksum8(buffer);
}

/// Writes the checksum of a normal frame in place.
pub fn apply_checksum8(buffer: &mut [u8]) {
    buffer[0] = checksum8(buffer);
}

/// Reads the 16-bit checksum a frame carries.
pub fn embedded_checksum16(buffer: &[u8]) -> u16 {
    u16::from_le_bytes([buffer[CHECKSUM16_OFFSET], buffer[CHECKSUM16_OFFSET + 1]])
}
