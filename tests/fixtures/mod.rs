#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bloomgen::{
    Block, BlockBuilder, BlockOptions, Bloom, BloomError, CancellationToken, ChunkItersByFingerprint,
    ChunkLoader, ChunkRef, ChunkRefWithIter, Fingerprint, GeneratedBlocks, GeneratorConfig,
    GeneratorEvent, GeneratorEventListener, MemoryBlockStorage, Result, Series, SeriesWithBloom,
    SimpleBloomGenerator,
};

pub const NUM_SERIES: usize = 100;
pub const KEYS_PER_SERIES: usize = 4;

/// Max block size that never splits the fixture data.
pub const LARGE_BLOCK: u64 = 100 << 20;

pub fn opts(version: u32, max_block_size_bytes: u64) -> BlockOptions {
    BlockOptions::new(version, 4, 0, max_block_size_bytes)
}

/// `n` series spread evenly over `[from_fp, through_fp)`, each with one chunk over
/// `[0, 10000]` and a small bloom holding `KEYS_PER_SERIES` keys.
///
/// Every entry encodes to 29 bytes: fp(8) + count(1) + from(1) + span(2) + checksum(4) + bloom(13).
pub fn mk_basic_series_with_blooms(
    n: usize,
    from_fp: Fingerprint,
    through_fp: Fingerprint,
) -> Vec<SeriesWithBloom> {
    let step = (through_fp - from_fp) / n as u64;
    (0..n as u64)
        .map(|i| {
            let fp = from_fp + i * step;
            let mut bloom = Bloom::with_capacity(KEYS_PER_SERIES as u32, 0.01);
            for k in 0..KEYS_PER_SERIES {
                bloom.insert(format!("series-{}-key-{}", fp, k).as_bytes());
            }
            SeriesWithBloom::new(
                Series::new(fp, vec![ChunkRef::new(0, 10_000, fp as u32)]),
                bloom,
            )
        })
        .collect()
}

/// Builds one block out of `entries`, asserting the builder did not split it.
pub fn build_block(options: BlockOptions, entries: &[SeriesWithBloom]) -> Block {
    let mut blocks: Vec<Block> = BlockBuilder::new(options, MemoryBlockStorage)
        .unwrap()
        .build_from(entries.iter().cloned().map(Ok))
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(blocks.len(), 1, "fixture block was split");
    blocks.remove(0)
}

/// Splits 100 series across `n` non-overlapping blocks built with `options`.
pub fn blocks_from_schema(n: usize, options: BlockOptions) -> (Vec<Block>, Vec<SeriesWithBloom>) {
    blocks_from_schema_with_range(n, options, 0, 0xffff)
}

pub fn blocks_from_schema_with_range(
    n: usize,
    options: BlockOptions,
    from_fp: Fingerprint,
    through_fp: Fingerprint,
) -> (Vec<Block>, Vec<SeriesWithBloom>) {
    assert_eq!(NUM_SERIES % n, 0, "100 series must be evenly divisible by n");
    let data = mk_basic_series_with_blooms(NUM_SERIES, from_fp, through_fp);
    let per_block = NUM_SERIES / n;
    let blocks = data
        .chunks(per_block)
        .map(|slice| build_block(options, slice))
        .collect();
    (blocks, data)
}

pub fn series_stream(data: &[SeriesWithBloom]) -> std::vec::IntoIter<Result<Series>> {
    data.iter()
        .map(|e| Ok(e.series.clone()))
        .collect::<Vec<_>>()
        .into_iter()
}

/// Doesn't actually load any chunks.
#[derive(Debug, Default)]
pub struct DummyChunkLoader;

impl ChunkLoader for DummyChunkLoader {
    fn load(&self, _tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint> {
        Ok(ChunkItersByFingerprint {
            fingerprint: series.fingerprint,
            chunks: Vec::new(),
        })
    }
}

/// Serves two lines per requested chunk and counts what was asked for.
#[derive(Debug, Default)]
pub struct CountingChunkLoader {
    pub calls: AtomicUsize,
    pub chunks: AtomicUsize,
    pub requested: Mutex<Vec<(Fingerprint, Vec<ChunkRef>)>>,
}

impl CountingChunkLoader {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

pub fn chunk_lines(chunk: &ChunkRef) -> Vec<String> {
    vec![
        format!("level=info chunk={} starting", chunk.checksum),
        format!("level=error chunk={} timeout after {}ms", chunk.checksum, chunk.through),
    ]
}

impl ChunkLoader for CountingChunkLoader {
    fn load(&self, _tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.chunks.fetch_add(series.chunks.len(), Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((series.fingerprint, series.chunks.clone()));
        Ok(ChunkItersByFingerprint {
            fingerprint: series.fingerprint,
            chunks: series
                .chunks
                .iter()
                .map(|c| {
                    let lines: Vec<Result<String>> = chunk_lines(c).into_iter().map(Ok).collect();
                    ChunkRefWithIter::new(*c, Box::new(lines.into_iter()))
                })
                .collect(),
        })
    }
}

/// Fails when asked for one specific series.
#[derive(Debug)]
pub struct FailingChunkLoader {
    pub fail_on: Fingerprint,
}

impl ChunkLoader for FailingChunkLoader {
    fn load(&self, tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint> {
        if series.fingerprint == self.fail_on {
            return Err(BloomError::Internal("chunk store unavailable".to_string()));
        }
        DummyChunkLoader.load(tenant, series)
    }
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<GeneratorEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<GeneratorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl GeneratorEventListener for RecordingListener {
    fn on_event(&self, event: GeneratorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn dummy_bloom_gen<S>(
    options: BlockOptions,
    series: S,
    blocks: Vec<Block>,
    loader: Arc<dyn ChunkLoader>,
    config: GeneratorConfig,
) -> SimpleBloomGenerator<S>
where
    S: Iterator<Item = Result<Series>>,
{
    SimpleBloomGenerator::new(
        "fake",
        options,
        series,
        loader,
        blocks,
        MemoryBlockStorage,
        config,
    )
}

/// Runs a generation to completion and returns (skipped, output blocks).
pub fn run_to_completion<S>(gen: SimpleBloomGenerator<S>) -> (Vec<Block>, Vec<Block>)
where
    S: Iterator<Item = Result<Series>>,
{
    let (skipped, results): (Vec<Block>, GeneratedBlocks<S>) =
        gen.generate(CancellationToken::new()).unwrap();
    let blocks = results.collect::<Result<Vec<_>>>().unwrap();
    (skipped, blocks)
}

pub fn collect_entries(blocks: &[Block]) -> Vec<SeriesWithBloom> {
    blocks
        .iter()
        .flat_map(|b| b.querier().unwrap())
        .map(|e| e.unwrap())
        .collect()
}
