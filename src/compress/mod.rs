//! # Block Codecs
//!
//! Every body fragment is compressed independently, so a reader can decode the
//! fragments of one file without any state shared with other files. The codec is
//! chosen once per archive run and recorded in every file header.
//!
//! - **None**: bytes are stored verbatim.
//! - **Zstd**: general-purpose entropy codec (`zstd::bulk`), level configurable.
//! - **Lz4**: fast LZ codec in the snappy class (`lz4_flex` size-prepended blocks).

use std::borrow::Cow;

use crate::error::{PfaError, Result};

/// Default zstd level used when none is configured.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Defines the available compression algorithms and their on-disk tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// Plain storage without any compression.
    #[default]
    None,
    /// Use the Zstandard algorithm with the given level.
    Zstd { level: i32 },
    /// Use LZ4 block compression.
    Lz4,
}

pub const TAG_NONE: u16 = 0;
pub const TAG_ZSTD: u16 = 1;
pub const TAG_LZ4: u16 = 2;

impl Codec {
    /// Numeric tag stored in each file header.
    pub fn tag(self) -> u16 {
        match self {
            Codec::None => TAG_NONE,
            Codec::Zstd { .. } => TAG_ZSTD,
            Codec::Lz4 => TAG_LZ4,
        }
    }

    /// Decoder for a stored tag. The level only matters when compressing.
    pub fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            TAG_NONE => Ok(Codec::None),
            TAG_ZSTD => Ok(Codec::Zstd { level: DEFAULT_ZSTD_LEVEL }),
            TAG_LZ4 => Ok(Codec::Lz4),
            other => Err(PfaError::UnknownCompression(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd { .. } => "zstd",
            Codec::Lz4 => "lz4",
        }
    }

    pub fn is_compressing(self) -> bool {
        !matches!(self, Codec::None)
    }

    /// Compresses one block. `None` borrows the input untouched.
    pub fn compress_block(self, raw: &[u8]) -> Result<Cow<'_, [u8]>> {
        match self {
            Codec::None => Ok(Cow::Borrowed(raw)),
            Codec::Zstd { level } => zstd::bulk::compress(raw, level)
                .map(Cow::Owned)
                .map_err(|e| PfaError::Other(format!("zstd compress error: {e}"))),
            Codec::Lz4 => Ok(Cow::Owned(lz4_flex::compress_prepend_size(raw))),
        }
    }

    /// Decompresses one block produced by [`Codec::compress_block`].
    ///
    /// `size_hint` bounds the zstd output buffer; pass the chunk size the stream
    /// was written with, or `0` to let the frame header decide.
    pub fn decompress_block(self, compressed: &[u8], size_hint: usize) -> Result<Cow<'_, [u8]>> {
        match self {
            Codec::None => Ok(Cow::Borrowed(compressed)),
            Codec::Zstd { .. } => {
                let decoded = if size_hint > 0 {
                    zstd::bulk::decompress(compressed, size_hint)
                } else {
                    zstd::decode_all(compressed)
                };
                decoded.map(Cow::Owned).map_err(|e| PfaError::Decompress(format!("zstd: {e}")))
            }
            Codec::Lz4 => lz4_flex::decompress_size_prepended(compressed)
                .map(Cow::Owned)
                .map_err(|e| PfaError::Decompress(format!("lz4: {e}"))),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"file A file A file A file A file A file A file A".repeat(16)
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(Codec::None.tag(), 0);
        assert_eq!(Codec::Zstd { level: 9 }.tag(), 1);
        assert_eq!(Codec::Lz4.tag(), 2);
        assert!(matches!(Codec::from_tag(7), Err(PfaError::UnknownCompression(7))));
    }

    #[test]
    fn none_is_passthrough() {
        let data = sample();
        let out = Codec::None.compress_block(&data).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &data[..]);
    }

    #[test]
    fn compressing_codecs_shrink_repetitive_data() {
        let data = sample();
        for codec in [Codec::Zstd { level: DEFAULT_ZSTD_LEVEL }, Codec::Lz4] {
            let packed = codec.compress_block(&data).unwrap().into_owned();
            assert!(packed.len() < data.len(), "{codec} did not shrink input");
            let tag_codec = Codec::from_tag(codec.tag()).unwrap();
            assert_eq!(&*tag_codec.decompress_block(&packed, 0).unwrap(), &data[..]);
            assert_eq!(&*tag_codec.decompress_block(&packed, data.len()).unwrap(), &data[..]);
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        let garbage = [0xffu8; 32];
        assert!(Codec::Zstd { level: 3 }.decompress_block(&garbage, 0).is_err());
        // small declared size, then a literal run that overflows it
        let mut lz4_garbage = vec![8u8, 0, 0, 0];
        lz4_garbage.extend_from_slice(&[0xf0; 16]);
        assert!(Codec::Lz4.decompress_block(&lz4_garbage, 0).is_err());
    }
}
