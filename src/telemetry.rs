use crate::schema::Schema;
use crate::types::{Fingerprint, FingerprintBounds};

use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library and never prints. Callers forward these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait GeneratorEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: GeneratorEvent);
}

/// Structured events emitted by the builder and the generator.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorEvent {
    /// A source block's schema differs from the target; it contributes nothing.
    BlockSkipped { position: usize, schema: Schema },
    QueriersOpened { compatible: usize, skipped: usize, elapsed: Duration },

    SeriesReused { fingerprint: Fingerprint, donors: usize },
    SeriesToppedUp { fingerprint: Fingerprint, donors: usize, loaded_chunks: usize },
    SeriesRecomputed { fingerprint: Fingerprint, loaded_chunks: usize },

    BlockFinalized {
        entries: usize,
        payload_bytes: u64,
        bounds: Option<FingerprintBounds>,
    },

    GenerationCompleted { series: u64, blocks: u64, elapsed: Duration },
    GenerationFailed { series: u64, error: String },
    GenerationCancelled { series: u64 },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl GeneratorEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: GeneratorEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn GeneratorEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics emitted through the `metrics` facade.
///
/// Emitting is a no-op until the host installs a recorder; no exporter is bundled.
pub mod bloom_metrics {
    use std::time::Duration;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const SERIES_REUSED: &str = "bloomgen_series_reused";
    pub const SERIES_TOPPED_UP: &str = "bloomgen_series_topped_up";
    pub const SERIES_RECOMPUTED: &str = "bloomgen_series_recomputed";
    pub const CHUNKS_LOADED: &str = "bloomgen_chunks_loaded";

    pub const BLOCKS_SKIPPED: &str = "bloomgen_blocks_skipped";
    pub const BLOCKS_WRITTEN: &str = "bloomgen_blocks_written";
    pub const BLOCK_PAYLOAD_BYTES: &str = "bloomgen_block_payload_bytes";

    pub const GENERATION_DURATION_SECONDS: &str = "bloomgen_generation_duration_seconds";
    pub const GENERATION_FAILURES: &str = "bloomgen_generation_failures";

    #[inline]
    pub fn record_series_reused() {
        ::metrics::counter!(SERIES_REUSED).increment(1);
    }

    #[inline]
    pub fn record_series_topped_up(loaded_chunks: usize) {
        ::metrics::counter!(SERIES_TOPPED_UP).increment(1);
        record_chunks_loaded(loaded_chunks);
    }

    #[inline]
    pub fn record_series_recomputed(loaded_chunks: usize) {
        ::metrics::counter!(SERIES_RECOMPUTED).increment(1);
        record_chunks_loaded(loaded_chunks);
    }

    #[inline]
    fn record_chunks_loaded(n: usize) {
        if n > 0 {
            ::metrics::counter!(CHUNKS_LOADED).increment(n as u64);
        }
    }

    #[inline]
    pub fn record_blocks_skipped(n: usize) {
        if n > 0 {
            ::metrics::counter!(BLOCKS_SKIPPED).increment(n as u64);
        }
    }

    #[inline]
    pub fn record_block_written(payload_bytes: u64) {
        ::metrics::counter!(BLOCKS_WRITTEN).increment(1);
        ::metrics::histogram!(BLOCK_PAYLOAD_BYTES).record(payload_bytes as f64);
    }

    #[inline]
    pub fn record_generation(duration: Duration) {
        ::metrics::histogram!(GENERATION_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_generation_failure() {
        ::metrics::counter!(GENERATION_FAILURES).increment(1);
    }

    /// Registers descriptions for every metric above. Call once after installing a recorder.
    pub fn describe_metrics() {
        // Counters
        describe_counter!(
            SERIES_REUSED,
            Unit::Count,
            "Series whose bloom was taken verbatim from compatible source blocks."
        );
        describe_counter!(
            SERIES_TOPPED_UP,
            Unit::Count,
            "Series whose reused bloom was extended with chunks the source blocks did not cover."
        );
        describe_counter!(
            SERIES_RECOMPUTED,
            Unit::Count,
            "Series whose bloom was rebuilt from chunk data."
        );
        describe_counter!(
            CHUNKS_LOADED,
            Unit::Count,
            "Chunks requested from the chunk loader and tokenized."
        );
        describe_counter!(
            BLOCKS_SKIPPED,
            Unit::Count,
            "Source blocks skipped because their schema does not match the target."
        );
        describe_counter!(
            BLOCKS_WRITTEN,
            Unit::Count,
            "Blocks finalized by the block builder."
        );
        describe_counter!(
            GENERATION_FAILURES,
            Unit::Count,
            "Generation runs aborted by an error or cancellation."
        );

        // Histograms
        describe_histogram!(
            BLOCK_PAYLOAD_BYTES,
            Unit::Bytes,
            "Payload size (header plus entries) of finalized blocks."
        );
        describe_histogram!(
            GENERATION_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of completed generation runs, from partitioning to the last block."
        );
    }
}
