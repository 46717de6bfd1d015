//! The chunk loader interface consumed when no reusable bloom exists for a series.

use crate::error::Result;
use crate::types::{ChunkRef, Fingerprint, Series};

use std::fmt;

/// Lazily produced log lines of one chunk.
pub type ChunkLines = Box<dyn Iterator<Item = Result<String>> + Send>;

/// One chunk together with a lazy iterator over its lines.
pub struct ChunkRefWithIter {
    pub chunk: ChunkRef,
    pub lines: ChunkLines,
}

impl ChunkRefWithIter {
    pub fn new(chunk: ChunkRef, lines: ChunkLines) -> Self {
        Self { chunk, lines }
    }
}

impl fmt::Debug for ChunkRefWithIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRefWithIter")
            .field("chunk", &self.chunk)
            .finish_non_exhaustive()
    }
}

/// Chunk data bound to the series fingerprint it was loaded for.
#[derive(Debug)]
pub struct ChunkItersByFingerprint {
    pub fingerprint: Fingerprint,
    pub chunks: Vec<ChunkRefWithIter>,
}

/// Resolves chunk references into line data.
///
/// `series` lists exactly the chunks to load; implementations must return them bound to
/// `series.fingerprint`. Any error is fatal to the running generation; no retries happen
/// inside this crate.
pub trait ChunkLoader: Send + Sync {
    fn load(&self, tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint>;
}

impl<F> ChunkLoader for F
where
    F: Fn(&str, &Series) -> Result<ChunkItersByFingerprint> + Send + Sync,
{
    fn load(&self, tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint> {
        self(tenant, series)
    }
}
