//! Binary primitives (little-endian ints, varints, crc32) and the series entry codec.
//!
//! Entry layout: `fingerprint u64`, `varint chunk_count`, per chunk `varint from`,
//! `varint (through - from)`, `u32 checksum`, then the bloom (see [`crate::bloom`]).

use crate::bloom::Bloom;
use crate::error::{BloomError, Result};
use crate::types::{ChunkRef, Series, SeriesWithBloom};

use crc32fast::Hasher as Crc32;
use std::io::Read;

/// Encodes one entry, appending to `buf`.
pub(crate) fn encode_series_entry(entry: &SeriesWithBloom, buf: &mut Vec<u8>) -> Result<()> {
    let series = &entry.series;
    write_u64(buf, series.fingerprint);
    write_var_u64(buf, series.chunks.len() as u64);
    for chunk in &series.chunks {
        let span = chunk.through.checked_sub(chunk.from).ok_or_else(|| {
            BloomError::Internal(format!(
                "Chunk through {} precedes from {} in series {:016x}",
                chunk.through, chunk.from, series.fingerprint
            ))
        })?;
        write_var_u64(buf, chunk.from);
        write_var_u64(buf, span);
        write_u32(buf, chunk.checksum);
    }
    entry.bloom.encode_into(buf);
    Ok(())
}

/// Decodes exactly one entry; trailing bytes are treated as corruption.
pub(crate) fn decode_series_entry(bytes: &[u8]) -> Result<SeriesWithBloom> {
    let mut r = bytes;
    let fingerprint = read_u64(&mut r)?;
    let chunk_count = read_var_u64(&mut r)? as usize;
    // Each chunk takes at least 6 bytes; guards the allocation below.
    if chunk_count > r.len() / 6 {
        return Err(BloomError::corruption(format!(
            "Series {:016x} claims {} chunks in {} bytes",
            fingerprint,
            chunk_count,
            r.len()
        )));
    }
    let mut chunks = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        let from = read_var_u64(&mut r)?;
        let span = read_var_u64(&mut r)?;
        let checksum = read_u32(&mut r)?;
        let through = from
            .checked_add(span)
            .ok_or_else(|| BloomError::corruption("Chunk time range overflows u64"))?;
        chunks.push(ChunkRef::new(from, through, checksum));
    }
    let bloom = Bloom::decode_from(&mut r)?;
    if !r.is_empty() {
        return Err(BloomError::corruption(format!(
            "{} trailing bytes after series {:016x}",
            r.len(),
            fingerprint
        )));
    }
    Ok(SeriesWithBloom::new(Series::new(fingerprint, chunks), bloom))
}

// --- Helpers (binary, varint, crc) ---

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b).map_err(truncated)?;
    Ok(b[0])
}
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(truncated)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b).map_err(truncated)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn read_var_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let byte = read_u8(r)?;
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err(BloomError::corruption("Varint too long"))
}

pub(crate) fn read_var_u32<R: Read>(r: &mut R) -> Result<u32> {
    let v = read_var_u64(r)?;
    u32::try_from(v).map_err(|_| BloomError::corruption("Varint does not fit in u32"))
}

fn truncated(e: std::io::Error) -> BloomError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BloomError::corruption("Truncated input")
    } else {
        BloomError::Io(e)
    }
}
