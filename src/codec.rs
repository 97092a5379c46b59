//! Uniform interface over LZ4 and ZSTD block compression.
//!
//! The stack compresses fixed-size blocks independently so reads stay
//! random-access. A block that does not shrink is stored verbatim; the
//! caller records that choice in its per-file index and skips decompression
//! on the way back out.

use std::io;

use serde::Deserialize;
use strum::{Display, EnumString};

use crate::error::Result;

/// Compression algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CodecKind {
    Lz4,
    Zstd,
}

/// A block codec with a fixed algorithm and effort level.
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    kind: CodecKind,
    level: i32,
}

/// Result of compressing one block under the skip-if-not-shrinking policy.
pub enum Packed {
    /// Compression shrank the block; store this payload.
    Shrunk(Vec<u8>),

    /// Compression did not help; store the block verbatim.
    Verbatim,
}

impl BlockCodec {
    #[must_use]
    pub const fn new(kind: CodecKind, level: i32) -> Self {
        Self { kind, level }
    }

    #[must_use]
    pub const fn kind(self) -> CodecKind {
        self.kind
    }

    /// Compresses `block`, or reports [`Packed::Verbatim`] when the result
    /// would be at least as large as the input.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying codec fails.
    pub fn pack(self, block: &[u8]) -> Result<Packed> {
        let compressed = match self.kind {
            CodecKind::Lz4 => lz4::block::compress(block, Some(self.lz4_mode()), false)?,
            CodecKind::Zstd => zstd::bulk::compress(block, self.level)?,
        };

        if compressed.len() >= block.len() {
            Ok(Packed::Verbatim)
        } else {
            Ok(Packed::Shrunk(compressed))
        }
    }

    /// Decompresses a payload produced by [`BlockCodec::pack`] into exactly
    /// `uncompressed_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is corrupt or decodes to the wrong
    /// length.
    pub fn unpack(self, payload: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self.kind {
            CodecKind::Lz4 => {
                let len = i32::try_from(uncompressed_len)
                    .map_err(|_| io::Error::other("block too large for lz4"))?;
                lz4::block::decompress(payload, Some(len))?
            }
            CodecKind::Zstd => zstd::bulk::decompress(payload, uncompressed_len)?,
        };

        if out.len() != uncompressed_len {
            return Err(io::Error::other(format!(
                "decompressed {} bytes, expected {uncompressed_len}",
                out.len()
            ))
            .into());
        }
        Ok(out)
    }

    fn lz4_mode(self) -> lz4::block::CompressionMode {
        use lz4::block::CompressionMode;
        match self.level {
            0 => CompressionMode::DEFAULT,
            n if n < 0 => CompressionMode::FAST(-n),
            n => CompressionMode::HIGHCOMPRESSION(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codecs() -> [BlockCodec; 2] {
        [BlockCodec::new(CodecKind::Lz4, 0), BlockCodec::new(CodecKind::Zstd, 3)]
    }

    #[test]
    fn test_compressible_block_round_trips() {
        let block = vec![b'a'; 4096];
        for codec in codecs() {
            match codec.pack(&block).unwrap() {
                Packed::Shrunk(payload) => {
                    assert!(payload.len() < block.len());
                    assert_eq!(codec.unpack(&payload, block.len()).unwrap(), block);
                }
                Packed::Verbatim => panic!("uniform block should shrink"),
            }
        }
    }

    #[test]
    fn test_incompressible_block_stored_verbatim() {
        // A pseudo-random block defeats both codecs.
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let block: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect();

        for codec in codecs() {
            assert!(matches!(codec.pack(&block).unwrap(), Packed::Verbatim));
        }
    }

    #[test]
    fn test_unpack_length_mismatch_fails() {
        let codec = BlockCodec::new(CodecKind::Zstd, 3);
        let Packed::Shrunk(payload) = codec.pack(&[b'z'; 1024]).unwrap() else {
            panic!("expected compressible block");
        };
        assert!(codec.unpack(&payload, 999).is_err());
    }
}
