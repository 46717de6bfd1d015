use crate::bloom::Bloom;

use serde::{Deserialize, Serialize};

/// Series fingerprint. All streams and blocks are ordered by it.
pub type Fingerprint = u64;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = u64;

/// Opaque handle to one chunk of a series, resolved by a [`crate::chunks::ChunkLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub from: Timestamp,
    pub through: Timestamp,
    pub checksum: u32,
}

impl ChunkRef {
    pub fn new(from: Timestamp, through: Timestamp, checksum: u32) -> Self {
        Self {
            from,
            through,
            checksum,
        }
    }
}

/// A series as known by the authoritative store: its fingerprint and chunk references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub fingerprint: Fingerprint,
    pub chunks: Vec<ChunkRef>,
}

impl Series {
    pub fn new(fingerprint: Fingerprint, chunks: Vec<ChunkRef>) -> Self {
        Self {
            fingerprint,
            chunks,
        }
    }
}

/// The unit flowing through the pipeline: a series together with the bloom built over its chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesWithBloom {
    pub series: Series,
    pub bloom: Bloom,
}

impl SeriesWithBloom {
    pub fn new(series: Series, bloom: Bloom) -> Self {
        Self { series, bloom }
    }

    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        self.series.fingerprint
    }
}

/// Inclusive fingerprint range covered by a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FingerprintBounds {
    pub min: Fingerprint,
    pub max: Fingerprint,
}

impl FingerprintBounds {
    pub fn new(min: Fingerprint, max: Fingerprint) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.min <= fp && fp <= self.max
    }

    pub fn overlaps(&self, other: &FingerprintBounds) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}
