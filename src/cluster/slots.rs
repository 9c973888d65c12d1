//! Hash slot calculation.
//!
//! A cluster splits the keyspace into 16384 slots. A key's slot is the
//! CRC16 (XMODEM) of the key, or of its hash tag when it has one, modulo
//! the slot count.

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16_POLY: u16 = 0x1021;

static CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize]
    })
}

/// The part of the key that is hashed.
///
/// `{...}` selects a hash tag: the bytes between the first `{` and the
/// next `}`. An empty tag or a missing `}` hashes the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// Slot for `key`, in `0..SLOT_COUNT`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}
