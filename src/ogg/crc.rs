//! Ogg page checksum.
//!
//! CRC-32 with polynomial 0x04C11DB7, zero initial value, no reflection and
//! no final XOR. The checksum field itself is zeroed while computing.

const POLYNOMIAL: u32 = 0x04c1_1db7;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ POLYNOMIAL
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// Continue a running checksum over `data`.
pub fn update(crc: u32, data: &[u8]) -> u32 {
    data.iter().fold(crc, |crc, &byte| {
        (crc << 8) ^ TABLE[(((crc >> 24) as u8) ^ byte) as usize]
    })
}

/// Checksum of a single contiguous buffer.
pub fn checksum(data: &[u8]) -> u32 {
    update(0, data)
}
