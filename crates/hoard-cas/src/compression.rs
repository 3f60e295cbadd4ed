//! Block-framed compressed blob format.
//!
//! ```text
//! [magic "HCZ1"][compressor: u8][level: u8][reserved: u16][uncompressed size: u64]
//! [compressed len: u32][uncompressed len: u32][block bytes] ...
//! ```
//!
//! Blocks hold at most one buffer slot of uncompressed data, so writing and
//! reading never needs more than a couple of slots no matter the blob size.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::buffer_slots::BufferSlots;

const MAGIC: &[u8; 4] = b"HCZ1";
pub const HEADER_SIZE: usize = 16;
const BLOCK_HEADER_SIZE: usize = 8;

/// Compression primitive identified by its wire/config id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None = 0,
    Deflate = 1,
}

impl Compressor {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compressor::None),
            1 => Some(Compressor::Deflate),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Header of a compressed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedHeader {
    pub compressor: Compressor,
    pub level: u8,
    pub uncompressed_size: u64,
}

impl CompressedHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(MAGIC);
        bytes[4] = self.compressor.id();
        bytes[5] = self.level;
        bytes[8..].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[..4] != MAGIC {
            return Err(invalid_data("bad compressed blob header"));
        }
        let compressor =
            Compressor::from_id(bytes[4]).ok_or_else(|| invalid_data("unknown compressor id"))?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            compressor,
            level: bytes[5],
            uncompressed_size: u64::from_le_bytes(size),
        })
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Compress `size` bytes from `source` into `dest`.
///
/// Returns the number of bytes written to `dest`.
pub fn write_compressed(
    slots: &BufferSlots,
    source: &mut dyn Read,
    size: u64,
    dest: &mut dyn Write,
    compressor: Compressor,
    level: u8,
) -> io::Result<u64> {
    if compressor == Compressor::None {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "write_compressed needs a real compressor",
        ));
    }

    let header = CompressedHeader {
        compressor,
        level,
        uncompressed_size: size,
    };
    dest.write_all(&header.to_bytes())?;
    let mut written = HEADER_SIZE as u64;

    let (mut input, mut output) = slots.acquire_pair();
    let mut remaining = size;

    while remaining > 0 {
        let block_len = remaining.min(input.len() as u64) as usize;
        source.read_exact(&mut input[..block_len])?;

        output.clear();
        let mut encoder = DeflateEncoder::new(&mut *output, Compression::new(u32::from(level)));
        encoder.write_all(&input[..block_len])?;
        encoder.finish()?;

        dest.write_all(&(output.len() as u32).to_le_bytes())?;
        dest.write_all(&(block_len as u32).to_le_bytes())?;
        dest.write_all(&output)?;

        written += (BLOCK_HEADER_SIZE + output.len()) as u64;
        remaining -= block_len as u64;
    }

    Ok(written)
}

fn decode_block(compressor: Compressor, block: &[u8], dst: &mut [u8]) -> io::Result<()> {
    match compressor {
        Compressor::Deflate => DeflateDecoder::new(block).read_exact(dst),
        Compressor::None => Err(invalid_data("compressed blob without compressor")),
    }
}

fn read_block_header(bytes: &[u8]) -> (usize, usize) {
    let mut compressed = [0u8; 4];
    let mut uncompressed = [0u8; 4];
    compressed.copy_from_slice(&bytes[..4]);
    uncompressed.copy_from_slice(&bytes[4..8]);
    (
        u32::from_le_bytes(compressed) as usize,
        u32::from_le_bytes(uncompressed) as usize,
    )
}

/// Decompress a whole compressed blob held in memory into `dst`.
///
/// `dst` must be exactly the uncompressed size recorded in the header.
pub fn decompress_memory_to_memory(src: &[u8], dst: &mut [u8]) -> io::Result<()> {
    let header = CompressedHeader::parse(src)?;
    if header.uncompressed_size != dst.len() as u64 {
        return Err(invalid_data("destination size does not match blob"));
    }

    let mut pos = HEADER_SIZE;
    let mut out = 0usize;
    while out < dst.len() {
        if src.len() < pos + BLOCK_HEADER_SIZE {
            return Err(invalid_data("truncated block header"));
        }
        let (compressed_len, block_len) = read_block_header(&src[pos..]);
        pos += BLOCK_HEADER_SIZE;
        if src.len() < pos + compressed_len || out + block_len > dst.len() {
            return Err(invalid_data("truncated block"));
        }
        decode_block(
            header.compressor,
            &src[pos..pos + compressed_len],
            &mut dst[out..out + block_len],
        )?;
        pos += compressed_len;
        out += block_len;
    }
    Ok(())
}

/// Decompress the blob at `path` into `dst`, streaming blocks through a slot.
pub fn decompress_file_to_memory(slots: &BufferSlots, path: &Path, dst: &mut [u8]) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = CompressedHeader::parse(&header_bytes)?;
    if header.uncompressed_size != dst.len() as u64 {
        return Err(invalid_data("destination size does not match blob"));
    }

    let mut block = slots.acquire();
    let mut out = 0usize;
    while out < dst.len() {
        let mut block_header = [0u8; BLOCK_HEADER_SIZE];
        file.read_exact(&mut block_header)?;
        let (compressed_len, block_len) = read_block_header(&block_header);
        if out + block_len > dst.len() {
            return Err(invalid_data("block overruns destination"));
        }
        // Incompressible blocks can be slightly larger than a slot.
        if block.len() < compressed_len {
            block.resize(compressed_len, 0);
        }
        file.read_exact(&mut block[..compressed_len])?;
        decode_block(
            header.compressor,
            &block[..compressed_len],
            &mut dst[out..out + block_len],
        )?;
        out += block_len;
    }
    Ok(())
}

/// Read just the header of a compressed blob file.
pub fn read_compressed_header(path: &Path) -> io::Result<CompressedHeader> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    File::open(path)?.read_exact(&mut header_bytes)?;
    CompressedHeader::parse(&header_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 1000) as u8).collect()
    }

    fn compress(slots: &BufferSlots, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut source = data;
        write_compressed(slots, &mut source, data.len() as u64, &mut out, Compressor::Deflate, 6)
            .unwrap();
        out
    }

    #[test]
    fn test_multi_block_memory_roundtrip() {
        let slots = BufferSlots::new(1024, 2);
        let data = sample(10_000);
        let compressed = compress(&slots, &data);

        let header = CompressedHeader::parse(&compressed).unwrap();
        assert_eq!(header.uncompressed_size, 10_000);
        assert_eq!(header.compressor, Compressor::Deflate);

        let mut out = vec![0u8; data.len()];
        decompress_memory_to_memory(&compressed, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(slots.outstanding(), 0);
    }

    #[test]
    fn test_file_decompression_with_small_slots() {
        let temp = TempDir::new().unwrap();
        let slots = BufferSlots::new(256, 2);
        // Random-looking bytes compress poorly, exercising oversized blocks.
        let data: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let path = temp.path().join("blob");
        std::fs::write(&path, compress(&slots, &data)).unwrap();

        let mut out = vec![0u8; data.len()];
        decompress_file_to_memory(&slots, &path, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(read_compressed_header(&path).unwrap().uncompressed_size, 5000);
    }

    #[test]
    fn test_empty_payload() {
        let slots = BufferSlots::new(64, 2);
        let compressed = compress(&slots, b"");
        assert_eq!(compressed.len(), HEADER_SIZE);
        let mut out = Vec::new();
        decompress_memory_to_memory(&compressed, &mut out).unwrap();
    }

    #[test]
    fn test_wrong_destination_size_rejected() {
        let slots = BufferSlots::new(64, 2);
        let compressed = compress(&slots, b"twelve bytes");
        let mut out = vec![0u8; 3];
        let err = decompress_memory_to_memory(&compressed, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let mut out = vec![0u8; 4];
        assert!(decompress_memory_to_memory(b"nope-not-a-blob!", &mut out).is_err());
    }

    #[test]
    fn test_none_compressor_refused() {
        let slots = BufferSlots::new(64, 2);
        let mut source: &[u8] = b"x";
        let mut out = Vec::new();
        assert!(write_compressed(&slots, &mut source, 1, &mut out, Compressor::None, 0).is_err());
    }
}
