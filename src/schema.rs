//! Block schema descriptors and the compatibility filter applied to source blocks.

use crate::error::{BloomError, Result};

use serde::{Deserialize, Serialize};

/// Schema version written by this crate when callers don't pick one.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_NGRAM_LENGTH: u32 = 4;
pub const DEFAULT_NGRAM_SKIP: u32 = 0;
/// 50MiB.
pub const DEFAULT_MAX_BLOCK_SIZE_BYTES: u64 = 50 << 20;

/// Bloom-construction parameters. Two blooms may only be combined when their schemas are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub ngram_length: u32,
    pub ngram_skip: u32,
}

impl Schema {
    pub fn new(version: u32, ngram_length: u32, ngram_skip: u32) -> Self {
        Self {
            version,
            ngram_length,
            ngram_skip,
        }
    }

    /// True iff blooms built under `other` can be reused verbatim under `self`.
    #[inline]
    pub fn compatible(&self, other: &Schema) -> bool {
        self.version == other.version
            && self.ngram_length == other.ngram_length
            && self.ngram_skip == other.ngram_skip
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            version: DEFAULT_SCHEMA_VERSION,
            ngram_length: DEFAULT_NGRAM_LENGTH,
            ngram_skip: DEFAULT_NGRAM_SKIP,
        }
    }
}

/// How a block's entries were (or are to be) built, plus the packaging size bound.
///
/// Persisted into every block header so readers need no out-of-band configuration.
/// `max_block_size_bytes` only affects packaging and is ignored by [`BlockOptions::compatible`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockOptions {
    pub schema: Schema,
    pub max_block_size_bytes: u64,
}

impl BlockOptions {
    pub fn new(
        version: u32,
        ngram_length: u32,
        ngram_skip: u32,
        max_block_size_bytes: u64,
    ) -> Self {
        Self {
            schema: Schema::new(version, ngram_length, ngram_skip),
            max_block_size_bytes,
        }
    }

    #[inline]
    pub fn compatible(&self, other: &BlockOptions) -> bool {
        self.schema.compatible(&other.schema)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.ngram_length == 0 {
            return Err(BloomError::Config(
                "ngram_length must be greater than zero".to_string(),
            ));
        }
        if self.max_block_size_bytes == 0 {
            return Err(BloomError::Config(
                "max_block_size_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            schema: Schema::default(),
            max_block_size_bytes: DEFAULT_MAX_BLOCK_SIZE_BYTES,
        }
    }
}
