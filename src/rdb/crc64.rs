//! CRC-64/Jones, the checksum Redis puts at the end of RDB files and
//! DUMP payloads.
//!
//! Reflected polynomial `0x95ac9329ac4bc9b5`, zero initial value, no final
//! xor.

const POLY: u64 = 0x95ac_9329_ac4b_c9b5;

static TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC64 state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc64 {
    crc: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &byte in data {
            crc = TABLE[((crc ^ byte as u64) & 0xff) as usize] ^ (crc >> 8);
        }
        self.crc = crc;
    }

    pub fn digest(&self) -> u64 {
        self.crc
    }
}

/// One-shot checksum.
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.update(data);
    crc.digest()
}
