//! CRC-64 integrity checksum for archived file contents.
//!
//! Every file's footer carries a CRC-64 over its *uncompressed* bytes, computed in
//! read order. The polynomial is the ISO 3309 one (`0x1B`, reflected, all-ones
//! init and xorout), which is what Go's `crc64.ISO` table produces.

use crc::{Crc, Digest, CRC_64_GO_ISO};

static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Running CRC-64/ISO accumulator.
#[derive(Clone)]
pub struct Crc64 {
    digest: Digest<'static, u64>,
    len: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc64")
            .field("current", &self.sum64())
            .field("len", &self.len)
            .finish()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self { digest: CRC64_ISO.digest(), len: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Current checksum; the accumulator stays usable.
    pub fn sum64(&self) -> u64 {
        self.digest.clone().finalize()
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One-shot checksum of a buffer.
    pub fn compute(data: &[u8]) -> u64 {
        CRC64_ISO.checksum(data)
    }
}
