//! Per-series reuse-or-recompute policy.
//!
//! For each series of the authoritative stream the merger consults every compatible
//! source block. Blooms found there are reused (unioned when several blocks hold the
//! series); chunks none of them indexed are loaded and tokenized on top. A series no
//! block holds is rebuilt entirely from chunk data.

use crate::block::BlockQuerier;
use crate::bloom::Bloom;
use crate::chunks::ChunkLoader;
use crate::error::{BloomError, Result};
use crate::schema::Schema;
use crate::tokenizer::BloomTokenizer;
use crate::types::{ChunkRef, Series, SeriesWithBloom};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Anything that can produce the bloom entry for a series at or after a fingerprint.
pub trait BloomSource {
    /// Moves forward to the first entry whose fingerprint is `>= series.fingerprint` and
    /// returns it without consuming it. `None` once the source is exhausted.
    fn seek(&mut self, series: &Series) -> Result<Option<&SeriesWithBloom>>;
}

impl BloomSource for BlockQuerier {
    fn seek(&mut self, series: &Series) -> Result<Option<&SeriesWithBloom>> {
        BlockQuerier::seek(self, series.fingerprint)
    }
}

/// Builds blooms from raw chunk data via a [`ChunkLoader`].
///
/// Shared read-only by every [`MergePlan::complete`] of a batch.
#[derive(Clone)]
pub struct ChunkBloomSource {
    tenant: String,
    loader: Arc<dyn ChunkLoader>,
    tokenizer: BloomTokenizer,
}

impl fmt::Debug for ChunkBloomSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBloomSource")
            .field("tenant", &self.tenant)
            .field("tokenizer", &self.tokenizer)
            .finish_non_exhaustive()
    }
}

impl ChunkBloomSource {
    pub fn new(tenant: impl Into<String>, loader: Arc<dyn ChunkLoader>, schema: &Schema) -> Self {
        Self {
            tenant: tenant.into(),
            loader,
            tokenizer: BloomTokenizer::new(schema),
        }
    }

    /// Loads the chunks listed in `series` and tokenizes them into `bloom`.
    ///
    /// Returns the number of chunks the loader handed back. An empty chunk list never
    /// reaches the loader.
    pub fn populate(&self, bloom: &mut Bloom, series: &Series) -> Result<usize> {
        if series.chunks.is_empty() {
            return Ok(0);
        }
        let fp = series.fingerprint;
        let loaded = self
            .loader
            .load(&self.tenant, series)
            .map_err(|e| chunk_load_error(fp, e))?;
        if loaded.fingerprint != fp {
            return Err(BloomError::ChunkLoad {
                fingerprint: fp,
                reason: format!("loader returned chunks for {:016x}", loaded.fingerprint),
            });
        }
        let n = loaded.chunks.len();
        for chunk in loaded.chunks {
            self.tokenizer
                .populate(bloom, &chunk.chunk, chunk.lines)
                .map_err(|e| chunk_load_error(fp, e))?;
        }
        Ok(n)
    }
}

fn chunk_load_error(fingerprint: u64, e: BloomError) -> BloomError {
    match e {
        e @ BloomError::ChunkLoad { .. } => e,
        other => BloomError::ChunkLoad {
            fingerprint,
            reason: other.to_string(),
        },
    }
}

/// How a series' bloom was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Taken from source blocks; no chunk was loaded.
    Reused { donors: usize },
    /// Taken from source blocks, plus chunks they did not cover.
    ToppedUp { donors: usize, loaded_chunks: usize },
    /// No source block held the series.
    Recomputed { loaded_chunks: usize },
}

/// Result of consulting the source blocks for one series, before any chunk is loaded.
#[derive(Debug)]
pub struct MergePlan {
    series: Series,
    base: Option<Bloom>,
    donors: usize,
    missing: Vec<ChunkRef>,
}

impl MergePlan {
    pub fn series(&self) -> &Series {
        &self.series
    }

    pub fn donors(&self) -> usize {
        self.donors
    }

    /// Chunks that still have to be loaded.
    pub fn missing_chunks(&self) -> &[ChunkRef] {
        &self.missing
    }

    /// Chunks of the series already covered by reused blooms.
    pub fn reused_chunks(&self) -> usize {
        self.series.chunks.len() - self.missing.len()
    }

    pub fn needs_load(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Loads whatever the plan is missing. Safe to run concurrently for different plans.
    pub fn complete(self, chunks: &ChunkBloomSource) -> Result<(SeriesWithBloom, MergeOutcome)> {
        let MergePlan {
            series,
            base,
            donors,
            missing,
        } = self;
        let (bloom, outcome) = match base {
            Some(mut bloom) if !missing.is_empty() => {
                let loaded_chunks =
                    chunks.populate(&mut bloom, &Series::new(series.fingerprint, missing))?;
                (
                    bloom,
                    MergeOutcome::ToppedUp {
                        donors,
                        loaded_chunks,
                    },
                )
            }
            Some(bloom) => (bloom, MergeOutcome::Reused { donors }),
            None => {
                let mut bloom = Bloom::new();
                let loaded_chunks = chunks.populate(&mut bloom, &series)?;
                (bloom, MergeOutcome::Recomputed { loaded_chunks })
            }
        };
        Ok((SeriesWithBloom::new(series, bloom), outcome))
    }
}

/// Merges blooms for an ascending series stream from compatible sources, falling back to chunks.
pub struct SeriesBloomMerger {
    sources: Vec<Box<dyn BloomSource + Send>>,
    chunks: ChunkBloomSource,
}

impl fmt::Debug for SeriesBloomMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesBloomMerger")
            .field("sources", &self.sources.len())
            .field("chunks", &self.chunks)
            .finish()
    }
}

impl SeriesBloomMerger {
    pub fn new(sources: Vec<Box<dyn BloomSource + Send>>, chunks: ChunkBloomSource) -> Self {
        Self { sources, chunks }
    }

    pub fn chunk_source(&self) -> &ChunkBloomSource {
        &self.chunks
    }

    /// Advances every source to `series` and collects the blooms they hold for it.
    ///
    /// Must be called with strictly ascending fingerprints; sources never move backwards.
    pub fn plan(&mut self, series: Series) -> Result<MergePlan> {
        let mut base: Option<Bloom> = None;
        let mut covered: HashSet<ChunkRef> = HashSet::new();
        let mut donors = 0usize;

        for source in self.sources.iter_mut() {
            let Some(entry) = source.seek(&series)? else {
                continue;
            };
            if entry.fingerprint() != series.fingerprint {
                continue;
            }
            donors += 1;
            match base.as_mut() {
                Some(bloom) => bloom.union(&entry.bloom),
                None => base = Some(entry.bloom.clone()),
            }
            covered.extend(entry.series.chunks.iter().copied());
        }

        let missing = match base {
            Some(_) => series
                .chunks
                .iter()
                .filter(|c| !covered.contains(c))
                .copied()
                .collect(),
            None => series.chunks.clone(),
        };
        Ok(MergePlan {
            series,
            base,
            donors,
            missing,
        })
    }
}
