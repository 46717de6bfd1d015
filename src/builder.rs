//! Packs an ordered stream of series blooms into size-bounded blocks.

use crate::block::{Block, BlockEncoder, BlockStorage};
use crate::encoding::encode_series_entry;
use crate::error::Result;
use crate::iter::CheckedOrder;
use crate::schema::BlockOptions;
use crate::telemetry::{bloom_metrics, noop_event_listener, GeneratorEvent, GeneratorEventListener};
use crate::types::{Fingerprint, SeriesWithBloom};

use std::fmt;
use std::sync::Arc;

/// Serializes entries into blocks of at most `max_block_size_bytes` payload each.
///
/// A block is closed once its payload reaches the bound, or earlier when the next entry
/// would push it past the bound. An entry larger than the bound on its own still gets
/// written, alone, to its own block.
pub struct BlockBuilder {
    options: BlockOptions,
    storage: Box<dyn BlockStorage>,
    listener: Arc<dyn GeneratorEventListener>,
}

impl fmt::Debug for BlockBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuilder")
            .field("options", &self.options)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl BlockBuilder {
    pub fn new(options: BlockOptions, storage: impl BlockStorage + 'static) -> Result<Self> {
        Self::with_boxed_storage(options, Box::new(storage))
    }

    pub fn with_boxed_storage(options: BlockOptions, storage: Box<dyn BlockStorage>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            storage,
            listener: noop_event_listener(),
        })
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn GeneratorEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn options(&self) -> &BlockOptions {
        &self.options
    }

    /// Lazily builds blocks from `entries`, which must be strictly ascending by fingerprint.
    ///
    /// Each block is only handed out after its writer finished successfully.
    pub fn build_from<I>(self, entries: I) -> BuiltBlocks<I::IntoIter>
    where
        I: IntoIterator<Item = Result<SeriesWithBloom>>,
    {
        BuiltBlocks {
            entries: CheckedOrder::new(entries.into_iter(), "block builder input"),
            options: self.options,
            storage: self.storage,
            listener: self.listener,
            carry: None,
            finalized: 0,
            done: false,
        }
    }
}

/// Forward-only, single-pass sequence of finalized blocks.
///
/// After the first error nothing more is yielded; the block being filled at that point is
/// dropped without being finished.
pub struct BuiltBlocks<I> {
    entries: CheckedOrder<I>,
    options: BlockOptions,
    storage: Box<dyn BlockStorage>,
    listener: Arc<dyn GeneratorEventListener>,
    /// Encoded entry that did not fit the previous block.
    carry: Option<(Fingerprint, Vec<u8>)>,
    finalized: u64,
    done: bool,
}

impl<I> BuiltBlocks<I>
where
    I: Iterator<Item = Result<SeriesWithBloom>>,
{
    pub fn blocks_finalized(&self) -> u64 {
        self.finalized
    }

    pub(crate) fn input(&self) -> &I {
        self.entries.inner()
    }

    fn next_encoded(&mut self) -> Result<Option<(Fingerprint, Vec<u8>)>> {
        let Some(entry) = self.entries.next() else {
            return Ok(None);
        };
        let entry = entry?;
        let mut buf = Vec::new();
        encode_series_entry(&entry, &mut buf)?;
        Ok(Some((entry.fingerprint(), buf)))
    }

    fn build_next(&mut self) -> Result<Option<Block>> {
        let (fp, bytes) = match self.carry.take() {
            Some(carried) => carried,
            None => match self.next_encoded()? {
                Some(first) => first,
                None => return Ok(None),
            },
        };

        let max = self.options.max_block_size_bytes;
        let (writer, reader) = self.storage.create()?;
        let mut encoder = BlockEncoder::new(self.options, writer, reader)?;
        encoder.append(fp, &bytes)?;

        while encoder.payload_size() < max {
            let Some((fp, bytes)) = self.next_encoded()? else {
                break;
            };
            if encoder.payload_size() + bytes.len() as u64 > max {
                self.carry = Some((fp, bytes));
                break;
            }
            encoder.append(fp, &bytes)?;
        }

        let entries = encoder.len();
        let payload_bytes = encoder.payload_size();
        let block = encoder.finish()?;
        self.finalized += 1;

        bloom_metrics::record_block_written(payload_bytes);
        self.listener.on_event(GeneratorEvent::BlockFinalized {
            entries,
            payload_bytes,
            bounds: block.bounds()?,
        });
        Ok(Some(block))
    }
}

impl<I> Iterator for BuiltBlocks<I>
where
    I: Iterator<Item = Result<SeriesWithBloom>>,
{
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Result<Block>> {
        if self.done {
            return None;
        }
        match self.build_next() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.carry = None;
                Some(Err(e))
            }
        }
    }
}
