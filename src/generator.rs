//! End-to-end generation: partition source blocks, merge every series, pack the output.
//!
//! One [`SimpleBloomGenerator::generate`] call is one pass. Series are pulled from the
//! authoritative stream strictly in order and planned against the compatible source
//! blocks one by one. Chunk loading for the series of a batch then runs on the rayon pool
//! and the results are put back in fingerprint order before they reach the builder.

use crate::block::{Block, BlockStorage};
use crate::builder::{BlockBuilder, BuiltBlocks};
use crate::cancel::CancellationToken;
use crate::chunks::ChunkLoader;
use crate::error::{BloomError, Result};
use crate::iter::CheckedOrder;
use crate::merger::{BloomSource, ChunkBloomSource, MergeOutcome, MergePlan, SeriesBloomMerger};
use crate::schema::BlockOptions;
use crate::stats::StatsHandle;
use crate::telemetry::{bloom_metrics, noop_event_listener, GeneratorEvent, GeneratorEventListener};
use crate::types::{Series, SeriesWithBloom};

use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Default number of series whose chunks may be loaded concurrently.
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 16;

/// Configuration options for a generation run.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Series planned per batch; chunk loads within a batch run in parallel. 0 is treated as 1.
    pub load_batch_size: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn GeneratorEventListener>,
    /// Run-scoped statistics (none by default).
    pub stats: StatsHandle,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
            event_listener: noop_event_listener(),
            stats: StatsHandle::none(),
        }
    }
}

/// Lifecycle of one generation run.
///
/// A generator is `Idle` until [`SimpleBloomGenerator::generate`] runs; `Partitioning`
/// lasts for the duration of that call, so the returned [`GeneratedBlocks`] starts out
/// `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Idle,
    Partitioning,
    Streaming,
    /// The series stream is exhausted; remaining output is being flushed.
    Draining,
    Failed,
    Done,
}

/// Drives one compaction pass for a tenant under a target schema.
pub struct SimpleBloomGenerator<S> {
    tenant: String,
    options: BlockOptions,
    series: S,
    loader: Arc<dyn ChunkLoader>,
    blocks: Vec<Block>,
    storage: Box<dyn BlockStorage>,
    config: GeneratorConfig,
}

impl<S> fmt::Debug for SimpleBloomGenerator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleBloomGenerator")
            .field("tenant", &self.tenant)
            .field("options", &self.options)
            .field("blocks", &self.blocks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> SimpleBloomGenerator<S>
where
    S: Iterator<Item = Result<Series>>,
{
    pub fn new(
        tenant: impl Into<String>,
        options: BlockOptions,
        series: S,
        loader: Arc<dyn ChunkLoader>,
        blocks: Vec<Block>,
        storage: impl BlockStorage + 'static,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            options,
            series,
            loader,
            blocks,
            storage: Box::new(storage),
            config,
        }
    }

    /// Partitions the source blocks, opens queriers over the compatible ones and returns
    /// the skipped blocks (input order preserved) plus the lazy output sequence.
    ///
    /// Errors while partitioning or opening queriers are returned here. Errors while
    /// streaming are yielded by the sequence, which then ends; blocks already handed out
    /// before such an error belong to a failed run and must be discarded.
    pub fn generate(
        mut self,
        cancel: CancellationToken,
    ) -> Result<(Vec<Block>, GeneratedBlocks<S>)> {
        let started = Instant::now();
        self.options.validate()?;

        let listener = Arc::clone(&self.config.event_listener);
        let stats = self.config.stats.clone();
        stats.record(|s| {
            s.add_tasks(1);
            s.set_status("running");
        });

        let mut skipped = Vec::new();
        let mut sources: Vec<Box<dyn BloomSource + Send>> = Vec::new();
        for (position, block) in self.blocks.into_iter().enumerate() {
            let block_options = block.options()?;
            if self.options.compatible(&block_options) {
                sources.push(Box::new(block.querier()?));
            } else {
                listener.on_event(GeneratorEvent::BlockSkipped {
                    position,
                    schema: block_options.schema,
                });
                skipped.push(block);
            }
        }
        let elapsed = started.elapsed();
        stats.record(|s| s.add_blocks_fetch_time(elapsed));
        bloom_metrics::record_blocks_skipped(skipped.len());
        listener.on_event(GeneratorEvent::QueriersOpened {
            compatible: sources.len(),
            skipped: skipped.len(),
            elapsed,
        });

        let merger = SeriesBloomMerger::new(
            sources,
            ChunkBloomSource::new(self.tenant, self.loader, &self.options.schema),
        );
        let merged = MergedSeries {
            series: CheckedOrder::new(self.series, "series stream"),
            merger,
            cancel,
            batch_size: self.config.load_batch_size.max(1),
            pending: VecDeque::new(),
            status: StreamStatus::Open,
            processed: 0,
            stats: stats.clone(),
            listener: Arc::clone(&listener),
        };
        let blocks = BlockBuilder::with_boxed_storage(self.options, self.storage)?
            .with_event_listener(Arc::clone(&listener))
            .build_from(merged);

        Ok((
            skipped,
            GeneratedBlocks {
                blocks,
                state: GeneratorState::Streaming,
                listener,
                stats,
                started,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    Open,
    Exhausted,
    Failed,
    Cancelled,
}

/// The merged, fingerprint-ordered entry stream feeding the builder.
struct MergedSeries<S> {
    series: CheckedOrder<S>,
    merger: SeriesBloomMerger,
    cancel: CancellationToken,
    batch_size: usize,
    pending: VecDeque<SeriesWithBloom>,
    status: StreamStatus,
    processed: u64,
    stats: StatsHandle,
    listener: Arc<dyn GeneratorEventListener>,
}

impl<S> MergedSeries<S>
where
    S: Iterator<Item = Result<Series>>,
{
    /// Pulls up to one batch of series and merges them into `pending`.
    fn fill(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut plans: Vec<MergePlan> = Vec::with_capacity(self.batch_size);
        while plans.len() < self.batch_size {
            if self.cancel.is_cancelled() {
                return Err(BloomError::Cancelled);
            }
            let Some(series) = self.series.next() else {
                self.status = StreamStatus::Exhausted;
                break;
            };
            let series = series?;
            let requested = series.chunks.len() as u64;
            let plan = self.merger.plan(series)?;
            let reused = plan.reused_chunks() as u64;
            self.stats.record(|s| {
                s.add_series_requested(1);
                s.add_chunks_requested(requested);
                s.add_chunks_filtered(reused);
            });
            plans.push(plan);
        }

        let chunks = self.merger.chunk_source();
        let merged: Vec<Result<(SeriesWithBloom, MergeOutcome)>> =
            if plans.iter().filter(|p| p.needs_load()).count() > 1 {
                plans.into_par_iter().map(|p| p.complete(chunks)).collect()
            } else {
                plans.into_iter().map(|p| p.complete(chunks)).collect()
            };

        for res in merged {
            let (entry, outcome) = res?;
            self.observe(&entry, outcome);
            self.pending.push_back(entry);
        }
        let elapsed = started.elapsed();
        self.stats.record(|s| s.add_processing_time(elapsed));
        Ok(())
    }

    fn observe(&mut self, entry: &SeriesWithBloom, outcome: MergeOutcome) {
        self.processed += 1;
        let fingerprint = entry.fingerprint();
        let event = match outcome {
            MergeOutcome::Reused { donors } => {
                bloom_metrics::record_series_reused();
                self.stats.record(|s| s.add_series_filtered(1));
                GeneratorEvent::SeriesReused { fingerprint, donors }
            }
            MergeOutcome::ToppedUp {
                donors,
                loaded_chunks,
            } => {
                bloom_metrics::record_series_topped_up(loaded_chunks);
                GeneratorEvent::SeriesToppedUp {
                    fingerprint,
                    donors,
                    loaded_chunks,
                }
            }
            MergeOutcome::Recomputed { loaded_chunks } => {
                bloom_metrics::record_series_recomputed(loaded_chunks);
                GeneratorEvent::SeriesRecomputed {
                    fingerprint,
                    loaded_chunks,
                }
            }
        };
        self.listener.on_event(event);
    }
}

impl<S> Iterator for MergedSeries<S>
where
    S: Iterator<Item = Result<Series>>,
{
    type Item = Result<SeriesWithBloom>;

    fn next(&mut self) -> Option<Result<SeriesWithBloom>> {
        if let Some(entry) = self.pending.pop_front() {
            return Some(Ok(entry));
        }
        if self.status != StreamStatus::Open {
            return None;
        }
        if let Err(e) = self.fill() {
            self.status = match e {
                BloomError::Cancelled => StreamStatus::Cancelled,
                _ => StreamStatus::Failed,
            };
            self.pending.clear();
            return Some(Err(e));
        }
        self.pending.pop_front().map(Ok)
    }
}

/// Lazy, forward-only, single-pass sequence of newly built blocks.
pub struct GeneratedBlocks<S> {
    blocks: BuiltBlocks<MergedSeries<S>>,
    state: GeneratorState,
    listener: Arc<dyn GeneratorEventListener>,
    stats: StatsHandle,
    started: Instant,
}

impl<S> fmt::Debug for GeneratedBlocks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedBlocks")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S> GeneratedBlocks<S>
where
    S: Iterator<Item = Result<Series>>,
{
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// Series merged so far.
    pub fn series_processed(&self) -> u64 {
        self.blocks.input().processed
    }

    pub fn blocks_finalized(&self) -> u64 {
        self.blocks.blocks_finalized()
    }

    fn fail(&mut self, e: &BloomError) {
        self.state = GeneratorState::Failed;
        let series = self.series_processed();
        bloom_metrics::record_generation_failure();
        match e {
            BloomError::Cancelled => {
                self.stats.record(|s| s.set_status("cancelled"));
                self.listener
                    .on_event(GeneratorEvent::GenerationCancelled { series });
            }
            other => {
                self.stats.record(|s| s.set_status("failure"));
                self.listener.on_event(GeneratorEvent::GenerationFailed {
                    series,
                    error: other.to_string(),
                });
            }
        }
    }

    fn complete(&mut self) {
        self.state = GeneratorState::Done;
        let elapsed = self.started.elapsed();
        bloom_metrics::record_generation(elapsed);
        self.stats.record(|s| s.set_status("success"));
        self.listener.on_event(GeneratorEvent::GenerationCompleted {
            series: self.series_processed(),
            blocks: self.blocks_finalized(),
            elapsed,
        });
    }
}

impl<S> Iterator for GeneratedBlocks<S>
where
    S: Iterator<Item = Result<Series>>,
{
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Result<Block>> {
        if matches!(self.state, GeneratorState::Failed | GeneratorState::Done) {
            return None;
        }
        match self.blocks.next() {
            Some(Ok(block)) => {
                if self.blocks.input().status == StreamStatus::Exhausted {
                    self.state = GeneratorState::Draining;
                }
                Some(Ok(block))
            }
            Some(Err(e)) => {
                self.fail(&e);
                Some(Err(e))
            }
            None => {
                self.complete();
                None
            }
        }
    }
}
