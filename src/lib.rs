#![doc = include_str!("../README.md")]
// Declare modules
pub mod block;
pub mod bloom;
pub mod builder;
pub mod cancel;
pub mod chunks;
pub mod encoding;
pub mod error;
pub mod generator;
pub mod iter;
pub mod merger;
pub mod schema;
pub mod stats;
pub mod telemetry;
pub mod tokenizer;
pub mod types;

/// Immutable, fingerprint-ordered package of series blooms, and its read cursor.
pub use crate::block::{Block, BlockQuerier};
/// Reader/writer pair factory and the bundled storage backends.
pub use crate::block::{BlockReader, BlockStorage, BlockWriter, DirectoryBlockStorage, MemoryBlockStorage};
/// Layered bloom filter.
pub use crate::bloom::Bloom;
/// Size-bounded block packer.
pub use crate::builder::BlockBuilder;
pub use crate::cancel::CancellationToken;
/// Chunk loader interface consumed on cache misses.
pub use crate::chunks::{ChunkItersByFingerprint, ChunkLoader, ChunkRefWithIter};
/// Error type for generation, building and reading.
pub use crate::error::{BloomError, Result};
/// Main entry point: one compaction pass per call.
pub use crate::generator::{GeneratedBlocks, GeneratorConfig, GeneratorState, SimpleBloomGenerator};
pub use crate::merger::{BloomSource, MergeOutcome, SeriesBloomMerger};
/// Block schema and packaging options.
pub use crate::schema::{BlockOptions, Schema};
pub use crate::stats::{Stats, StatsHandle};
/// Structured event hook for observability.
pub use crate::telemetry::{GeneratorEvent, GeneratorEventListener};
pub use crate::types::{ChunkRef, Fingerprint, FingerprintBounds, Series, SeriesWithBloom};
