//! Block format, reader/writer storage backends and read-side access.
//!
//! Layout:
//! - header: magic `BLMBLK01`, `u32` format version, bincode [`BlockOptions`] (20 bytes)
//! - entries, back to back (see [`crate::encoding`])
//! - index: `u32 count`, per entry `fingerprint u64`, `offset u64`, `len u32`, `crc32 u32`
//! - footer: magic `BLMBLKF1`, `index_offset u64`, `index_len u64`, `crc32(index) u32`
//!
//! The payload (header + entries, i.e. everything before the index) is what
//! `max_block_size_bytes` bounds.

use crate::encoding::{crc32, decode_series_entry, read_u32, read_u64, write_u32, write_u64};
use crate::error::{BloomError, Result};
use crate::schema::BlockOptions;
use crate::types::{Fingerprint, FingerprintBounds, SeriesWithBloom};

use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tempfile::NamedTempFile;

const BLOCK_MAGIC: &[u8; 8] = b"BLMBLK01";
const BLOCK_FOOTER_MAGIC: &[u8; 8] = b"BLMBLKF1";
const BLOCK_FORMAT_VERSION: u32 = 1;

/// magic + version + bincode(BlockOptions)
pub const BLOCK_HEADER_LEN: u64 = 8 + 4 + 20;
const FOOTER_LEN: u64 = 8 + 8 + 8 + 4; // magic + index_off + index_len + crc32
const INDEX_ENTRY_LEN: u64 = 8 + 8 + 4 + 4;

const BLOCK_FILE_EXT: &str = "blm";

// --- Storage traits ---

/// Append-only sink for one physical block. Consumed by `finish`, so never reused.
pub trait BlockWriter: Send + fmt::Debug {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes everything durably. Only after this succeeds is the block visible to readers.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Read side of a block written through the paired [`BlockWriter`].
pub trait BlockReader: Send + Sync + fmt::Debug {
    fn read_all(&self) -> Result<Vec<u8>>;
}

/// Factory handing out a fresh `(writer, reader)` pair for every new physical block.
pub trait BlockStorage: Send {
    fn create(&mut self) -> Result<(Box<dyn BlockWriter>, Arc<dyn BlockReader>)>;
}

impl<F> BlockStorage for F
where
    F: FnMut() -> Result<(Box<dyn BlockWriter>, Arc<dyn BlockReader>)> + Send,
{
    fn create(&mut self) -> Result<(Box<dyn BlockWriter>, Arc<dyn BlockReader>)> {
        self()
    }
}

// --- In-memory storage ---

#[derive(Debug)]
pub struct MemoryBlockWriter {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl BlockWriter for MemoryBlockWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf
            .write()
            .map_err(|e| BloomError::Write(format!("memory block buffer poisoned: {}", e)))?
            .extend_from_slice(buf);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ByteReader {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl BlockReader for ByteReader {
    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self.buf.read()?.clone())
    }
}

/// A writer and a reader linked over the same in-memory buffer.
pub fn memory_block_pair() -> (MemoryBlockWriter, ByteReader) {
    let buf = Arc::new(RwLock::new(Vec::new()));
    (
        MemoryBlockWriter {
            buf: Arc::clone(&buf),
        },
        ByteReader { buf },
    )
}

/// Keeps every block in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBlockStorage;

impl BlockStorage for MemoryBlockStorage {
    fn create(&mut self) -> Result<(Box<dyn BlockWriter>, Arc<dyn BlockReader>)> {
        let (w, r) = memory_block_pair();
        Ok((Box::new(w), Arc::new(r)))
    }
}

// --- Directory storage ---

/// Writes each block to `<dir>/<prefix>_<id>.blm`.
///
/// Blocks are staged in a temp file inside `dir` and atomically renamed on finish,
/// so a crashed or failed run never leaves a partially written block under its final name.
#[derive(Debug)]
pub struct DirectoryBlockStorage {
    dir: PathBuf,
    prefix: String,
    next_id: u64,
}

impl DirectoryBlockStorage {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with_prefix(dir, "block")
    }

    pub fn open_with_prefix<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let next_id = list_block_files(&dir, prefix)?
            .last()
            .map(|(id, _)| id.saturating_add(1))
            .unwrap_or(1);
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            next_id,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All finished blocks in the directory, oldest id first.
    pub fn existing_blocks(&self) -> Result<Vec<Block>> {
        Ok(list_block_files(&self.dir, &self.prefix)?
            .into_iter()
            .map(|(_, path)| Block::new(Arc::new(DirectoryBlockReader::new(path))))
            .collect())
    }
}

impl BlockStorage for DirectoryBlockStorage {
    fn create(&mut self) -> Result<(Box<dyn BlockWriter>, Arc<dyn BlockReader>)> {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        let final_path = self
            .dir
            .join(format!("{}_{:020}.{}", self.prefix, id, BLOCK_FILE_EXT));
        let tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| BloomError::Write(format!("create temp block in {:?}: {}", self.dir, e)))?;
        let writer = DirectoryBlockWriter {
            w: BufWriter::new(tmp),
            final_path: final_path.clone(),
        };
        Ok((Box::new(writer), Arc::new(DirectoryBlockReader::new(final_path))))
    }
}

#[derive(Debug)]
pub struct DirectoryBlockWriter {
    w: BufWriter<NamedTempFile>,
    final_path: PathBuf,
}

impl BlockWriter for DirectoryBlockWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.w, buf)
            .map_err(|e| BloomError::Write(format!("{:?}: {}", self.final_path, e)))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let DirectoryBlockWriter { w, final_path } = *self;
        let write_err = |e: &dyn fmt::Display| BloomError::Write(format!("{:?}: {}", final_path, e));

        let tmp = w.into_inner().map_err(|e| write_err(e.error()))?;
        tmp.as_file().sync_data().map_err(|e| write_err(&e))?;
        // Atomic install: rename tmp -> final.
        tmp.persist(&final_path).map_err(|e| write_err(&e.error))?;
        sync_parent_dir(&final_path).map_err(|e| write_err(&e))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryBlockReader {
    path: PathBuf,
}

impl DirectoryBlockReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockReader for DirectoryBlockReader {
    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

fn list_block_files(dir: &Path, prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for e in fs::read_dir(dir)?.flatten() {
        let path = e.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let id = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(BLOCK_FILE_EXT))
            .and_then(|rest| rest.strip_suffix('.'))
            .and_then(|id| id.parse::<u64>().ok());
        if let Some(id) = id {
            out.push((id, path));
        }
    }
    out.sort_unstable_by_key(|(id, _)| *id);
    Ok(out)
}

fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "Missing parent dir")
    })?;
    File::open(parent)?.sync_data()
}

// --- Metadata ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    pub len: u32,
    pub crc32: u32,
}

/// Decoded header and index of a finished block.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub options: BlockOptions,
    pub entries: Vec<IndexEntry>,
    /// Header plus entries; excludes the index trailer.
    pub payload_size: u64,
}

impl BlockMeta {
    pub fn bounds(&self) -> Option<FingerprintBounds> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some(FingerprintBounds::new(first.fingerprint, last.fingerprint))
    }
}

pub(crate) fn encode_block_header(options: &BlockOptions) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_LEN as usize);
    buf.extend_from_slice(BLOCK_MAGIC);
    write_u32(&mut buf, BLOCK_FORMAT_VERSION);
    buf.extend_from_slice(&bincode::serialize(options)?);
    if buf.len() as u64 != BLOCK_HEADER_LEN {
        return Err(BloomError::Internal(format!(
            "Unexpected block header length {}",
            buf.len()
        )));
    }
    Ok(buf)
}

fn encode_block_trailer(index: &[IndexEntry], index_offset: u64) -> Vec<u8> {
    let mut index_buf = Vec::with_capacity(4 + index.len() * INDEX_ENTRY_LEN as usize);
    write_u32(&mut index_buf, index.len() as u32);
    for e in index {
        write_u64(&mut index_buf, e.fingerprint);
        write_u64(&mut index_buf, e.offset);
        write_u32(&mut index_buf, e.len);
        write_u32(&mut index_buf, e.crc32);
    }
    let index_crc = crc32(&index_buf);
    let index_len = index_buf.len() as u64;

    let mut out = index_buf;
    out.extend_from_slice(BLOCK_FOOTER_MAGIC);
    write_u64(&mut out, index_offset);
    write_u64(&mut out, index_len);
    write_u32(&mut out, index_crc);
    out
}

fn load_block_meta(bytes: &[u8]) -> Result<BlockMeta> {
    let total = bytes.len() as u64;
    if total < BLOCK_HEADER_LEN + FOOTER_LEN {
        return Err(BloomError::corruption(format!(
            "Truncated block ({} bytes)",
            total
        )));
    }
    if &bytes[..8] != BLOCK_MAGIC {
        return Err(BloomError::corruption("Bad block magic"));
    }
    let version = read_u32(&mut &bytes[8..12])?;
    if version != BLOCK_FORMAT_VERSION {
        return Err(BloomError::corruption(format!(
            "Unsupported block format version {}",
            version
        )));
    }
    let options: BlockOptions = bincode::deserialize(&bytes[12..BLOCK_HEADER_LEN as usize])?;

    // Footer
    let mut footer = &bytes[(total - FOOTER_LEN) as usize..];
    if &footer[..8] != BLOCK_FOOTER_MAGIC {
        return Err(BloomError::corruption("Bad block footer magic"));
    }
    footer = &footer[8..];
    let index_offset = read_u64(&mut footer)?;
    let index_len = read_u64(&mut footer)?;
    let index_crc = read_u32(&mut footer)?;
    if index_offset < BLOCK_HEADER_LEN
        || index_offset.checked_add(index_len) != Some(total - FOOTER_LEN)
    {
        return Err(BloomError::corruption(format!(
            "Block index out of range (offset={}, len={}, size={})",
            index_offset, index_len, total
        )));
    }

    // Index
    let index_bytes = &bytes[index_offset as usize..(index_offset + index_len) as usize];
    if crc32(index_bytes) != index_crc {
        return Err(BloomError::corruption("Block index CRC mismatch"));
    }
    let mut cur = index_bytes;
    let count = read_u32(&mut cur)? as u64;
    if count * INDEX_ENTRY_LEN != index_len - 4 {
        return Err(BloomError::corruption(format!(
            "Block index holds {} bytes for {} entries",
            index_len - 4,
            count
        )));
    }
    let mut entries: Vec<IndexEntry> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let entry = IndexEntry {
            fingerprint: read_u64(&mut cur)?,
            offset: read_u64(&mut cur)?,
            len: read_u32(&mut cur)?,
            crc32: read_u32(&mut cur)?,
        };
        let past_payload = entry
            .offset
            .checked_add(entry.len as u64)
            .map_or(true, |end| end > index_offset);
        if entry.offset < BLOCK_HEADER_LEN || past_payload {
            return Err(BloomError::corruption(format!(
                "Entry {:016x} lies outside the block payload",
                entry.fingerprint
            )));
        }
        if let Some(prev) = entries.last() {
            if entry.fingerprint <= prev.fingerprint {
                return Err(BloomError::OrderingViolation {
                    stream: "block index",
                    previous: prev.fingerprint,
                    current: entry.fingerprint,
                });
            }
        }
        entries.push(entry);
    }

    Ok(BlockMeta {
        options,
        entries,
        payload_size: index_offset,
    })
}

// --- Block ---

/// An immutable, fingerprint-ordered package of series blooms.
///
/// Cheap to clone; metadata is decoded once and shared between clones.
#[derive(Clone)]
pub struct Block {
    reader: Arc<dyn BlockReader>,
    meta: Arc<OnceLock<Arc<BlockMeta>>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("reader", &self.reader)
            .field("meta", &self.meta.get())
            .finish()
    }
}

impl Block {
    pub fn new(reader: Arc<dyn BlockReader>) -> Self {
        Self {
            reader,
            meta: Arc::new(OnceLock::new()),
        }
    }

    fn with_meta(reader: Arc<dyn BlockReader>, meta: BlockMeta) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::new(meta));
        Self {
            reader,
            meta: Arc::new(cell),
        }
    }

    pub fn reader(&self) -> &Arc<dyn BlockReader> {
        &self.reader
    }

    /// True when both handles refer to the same underlying block.
    pub fn ptr_eq(&self, other: &Block) -> bool {
        Arc::as_ptr(&self.reader) as *const () == Arc::as_ptr(&other.reader) as *const ()
    }

    pub fn metadata(&self) -> Result<Arc<BlockMeta>> {
        if let Some(meta) = self.meta.get() {
            return Ok(Arc::clone(meta));
        }
        let bytes = self.reader.read_all()?;
        self.cache_meta(&bytes)
    }

    fn cache_meta(&self, bytes: &[u8]) -> Result<Arc<BlockMeta>> {
        let meta = Arc::new(load_block_meta(bytes)?);
        // A concurrent loader may have won; both decoded the same immutable bytes.
        let _ = self.meta.set(Arc::clone(&meta));
        Ok(meta)
    }

    pub fn options(&self) -> Result<BlockOptions> {
        Ok(self.metadata()?.options)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.metadata()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn bounds(&self) -> Result<Option<FingerprintBounds>> {
        Ok(self.metadata()?.bounds())
    }

    pub fn payload_size(&self) -> Result<u64> {
        Ok(self.metadata()?.payload_size)
    }

    /// Opens a forward-only cursor over the block's entries.
    pub fn querier(&self) -> Result<BlockQuerier> {
        let data = self.reader.read_all()?;
        let meta = match self.meta.get() {
            Some(meta) => Arc::clone(meta),
            None => self.cache_meta(&data)?,
        };
        if (data.len() as u64) < meta.payload_size {
            return Err(BloomError::corruption(format!(
                "Block shrank to {} bytes below its {} byte payload",
                data.len(),
                meta.payload_size
            )));
        }
        Ok(BlockQuerier {
            data,
            meta,
            pos: 0,
            current: None,
        })
    }
}

// --- Querier ---

/// Forward-only cursor over a block's entries.
///
/// Iterating yields every entry in order. [`BlockQuerier::seek`] positions at the first
/// entry at or after a fingerprint, skipping through the index without decoding.
#[derive(Debug)]
pub struct BlockQuerier {
    data: Vec<u8>,
    meta: Arc<BlockMeta>,
    pos: usize,
    /// Entry positioned by `seek` and not yet handed out by `next`.
    current: Option<SeriesWithBloom>,
}

impl BlockQuerier {
    pub fn options(&self) -> &BlockOptions {
        &self.meta.options
    }

    /// Advances to the first entry whose fingerprint is `>= fp` and returns it without consuming it.
    ///
    /// Never moves backwards: seeking to a fingerprint below the current entry returns the current entry.
    pub fn seek(&mut self, fp: Fingerprint) -> Result<Option<&SeriesWithBloom>> {
        if self
            .current
            .as_ref()
            .is_some_and(|cur| cur.series.fingerprint >= fp)
        {
            return Ok(self.current.as_ref());
        }
        self.current = None;

        let skip = self.meta.entries[self.pos..].partition_point(|e| e.fingerprint < fp);
        self.pos += skip;
        if self.pos >= self.meta.entries.len() {
            return Ok(None);
        }
        let entry = self.load(self.pos)?;
        self.pos += 1;
        self.current = Some(entry);
        Ok(self.current.as_ref())
    }

    /// Decodes entry `idx`. Any failure poisons the cursor; nothing after a bad entry is trusted.
    fn load(&mut self, idx: usize) -> Result<SeriesWithBloom> {
        let res = self.decode_at(idx);
        if res.is_err() {
            self.pos = self.meta.entries.len();
        }
        res
    }

    fn decode_at(&self, idx: usize) -> Result<SeriesWithBloom> {
        let e = self.meta.entries[idx];
        let start = e.offset as usize;
        let bytes = &self.data[start..start + e.len as usize];
        if crc32(bytes) != e.crc32 {
            return Err(BloomError::corruption(format!(
                "Entry CRC mismatch for series {:016x}",
                e.fingerprint
            )));
        }
        let entry = decode_series_entry(bytes)?;
        if entry.series.fingerprint != e.fingerprint {
            return Err(BloomError::corruption(format!(
                "Index fingerprint {:016x} does not match entry {:016x}",
                e.fingerprint, entry.series.fingerprint
            )));
        }
        Ok(entry)
    }
}

impl Iterator for BlockQuerier {
    type Item = Result<SeriesWithBloom>;

    fn next(&mut self) -> Option<Result<SeriesWithBloom>> {
        if let Some(cur) = self.current.take() {
            return Some(Ok(cur));
        }
        if self.pos >= self.meta.entries.len() {
            return None;
        }
        let res = self.load(self.pos);
        if res.is_ok() {
            self.pos += 1;
        }
        Some(res)
    }
}

// --- Encoder (one physical block) ---

/// Serializes entries into exactly one block over one writer.
#[derive(Debug)]
pub(crate) struct BlockEncoder {
    options: BlockOptions,
    writer: Box<dyn BlockWriter>,
    reader: Arc<dyn BlockReader>,
    index: Vec<IndexEntry>,
    offset: u64,
}

impl BlockEncoder {
    pub(crate) fn new(
        options: BlockOptions,
        mut writer: Box<dyn BlockWriter>,
        reader: Arc<dyn BlockReader>,
    ) -> Result<Self> {
        let header = encode_block_header(&options)?;
        writer.write_all(&header)?;
        Ok(Self {
            options,
            writer,
            reader,
            index: Vec::new(),
            offset: header.len() as u64,
        })
    }

    #[inline]
    pub(crate) fn payload_size(&self) -> u64 {
        self.offset
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Appends one already-encoded entry.
    pub(crate) fn append(&mut self, fingerprint: Fingerprint, entry: &[u8]) -> Result<()> {
        if let Some(last) = self.index.last() {
            if fingerprint <= last.fingerprint {
                return Err(BloomError::OrderingViolation {
                    stream: "block encoder",
                    previous: last.fingerprint,
                    current: fingerprint,
                });
            }
        }
        let len = u32::try_from(entry.len()).map_err(|_| {
            BloomError::Internal(format!(
                "Series {:016x} entry of {} bytes is too large",
                fingerprint,
                entry.len()
            ))
        })?;
        self.writer.write_all(entry)?;
        self.index.push(IndexEntry {
            fingerprint,
            offset: self.offset,
            len,
            crc32: crc32(entry),
        });
        self.offset += len as u64;
        Ok(())
    }

    /// Writes the index trailer, finishes the writer and hands out the immutable block.
    pub(crate) fn finish(mut self) -> Result<Block> {
        let trailer = encode_block_trailer(&self.index, self.offset);
        self.writer.write_all(&trailer)?;
        self.writer.finish()?;
        let meta = BlockMeta {
            options: self.options,
            entries: self.index,
            payload_size: self.offset,
        };
        Ok(Block::with_meta(self.reader, meta))
    }
}
