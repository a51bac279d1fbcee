//! Adler-32 running checksum
//!
//! Used to verify every compressed block stored in a TAS file. A new stream
//! starts from seed `1`; feeding the returned value back in continues it.

use ::adler32::RollingAdler32;

/// Continue an Adler-32 checksum over `data`.
pub fn adler32(seed: u32, data: &[u8]) -> u32 {
    let mut rolling = RollingAdler32::from_value(seed);
    rolling.update_buffer(data);
    rolling.hash()
}

/// Incremental Adler-32 hasher
#[derive(Debug, Clone, Copy)]
pub struct Adler32 {
    state: u32,
}

impl Adler32 {
    pub fn new() -> Self {
        Adler32 { state: 1 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = adler32(self.state, data);
    }

    pub fn finish(&self) -> u32 {
        self.state
    }
}

impl Default for Adler32 {
    fn default() -> Self {
        Self::new()
    }
}
