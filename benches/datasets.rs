use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use bloomgen::{ChunkItersByFingerprint, ChunkLoader, ChunkRef, ChunkRefWithIter, Result, Series};

pub const DEFAULT_SEED: u64 = 0x_424C_4F4F_4D47_454E; // fixed seed for stable benchmarks

const PATHS: &[&str] = &["users", "orders", "invoices", "search", "health", "metrics"];
const LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// `series_count` ascending series, each with `chunks_per_series` consecutive chunks.
pub fn generate_series(seed: u64, series_count: usize, chunks_per_series: usize) -> Vec<Series> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut fp = 0u64;
    (0..series_count)
        .map(|_| {
            fp += rng.gen_range(1..1_000_000u64);
            let chunks = (0..chunks_per_series as u64)
                .map(|c| ChunkRef::new(c * 3_600_000, (c + 1) * 3_600_000 - 1, rng.gen()))
                .collect();
            Series::new(fp, chunks)
        })
        .collect()
}

/// Produces pseudo-random access-log lines; the same chunk always yields the same lines.
#[derive(Debug, Clone)]
pub struct SyntheticChunkLoader {
    pub seed: u64,
    pub lines_per_chunk: usize,
}

pub fn chunk_lines(seed: u64, chunk: &ChunkRef, lines: usize) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ ((chunk.checksum as u64) << 32) ^ chunk.from);
    (0..lines)
        .map(|_| {
            format!(
                "level={} method=GET path=/api/v1/{}/{} status={} duration={}ms",
                LEVELS.choose(&mut rng).copied().unwrap_or("info"),
                PATHS.choose(&mut rng).copied().unwrap_or("health"),
                rng.gen_range(0..10_000u32),
                [200, 201, 404, 500][rng.gen_range(0..4)],
                rng.gen_range(1..2_000u32),
            )
        })
        .collect()
}

impl ChunkLoader for SyntheticChunkLoader {
    fn load(&self, _tenant: &str, series: &Series) -> Result<ChunkItersByFingerprint> {
        Ok(ChunkItersByFingerprint {
            fingerprint: series.fingerprint,
            chunks: series
                .chunks
                .iter()
                .map(|c| {
                    let lines: Vec<Result<String>> = chunk_lines(self.seed, c, self.lines_per_chunk)
                        .into_iter()
                        .map(Ok)
                        .collect();
                    ChunkRefWithIter::new(*c, Box::new(lines.into_iter()))
                })
                .collect(),
        })
    }
}
