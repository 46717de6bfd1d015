//! Run-scoped statistics accumulator.
//!
//! Phases report durations additively and concurrently (e.g. from parallel chunk loads),
//! so every counter is an atomic. A [`StatsHandle`] is passed explicitly through the call
//! chain; an empty handle turns every update into a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct Stats {
    status: Mutex<String>,

    num_tasks: AtomicU64,
    num_filters: AtomicU64,
    chunks_requested: AtomicU64,
    chunks_filtered: AtomicU64,
    series_requested: AtomicU64,
    series_filtered: AtomicU64,

    // Nanoseconds.
    queue_time: AtomicU64,
    metas_fetch_time: AtomicU64,
    blocks_fetch_time: AtomicU64,
    processing_time: AtomicU64,
    post_processing_time: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            status: Mutex::new("unknown".to_string()),
            num_tasks: AtomicU64::new(0),
            num_filters: AtomicU64::new(0),
            chunks_requested: AtomicU64::new(0),
            chunks_filtered: AtomicU64::new(0),
            series_requested: AtomicU64::new(0),
            series_filtered: AtomicU64::new(0),
            queue_time: AtomicU64::new(0),
            metas_fetch_time: AtomicU64::new(0),
            blocks_fetch_time: AtomicU64::new(0),
            processing_time: AtomicU64::new(0),
            post_processing_time: AtomicU64::new(0),
        }
    }
}

/// One value of the flat key/value summary produced by [`Stats::kv_args`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Text(String),
    Count(u64),
    Ratio(f64),
    Duration(Duration),
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Text(s) => f.write_str(s),
            StatValue::Count(n) => write!(f, "{}", n),
            StatValue::Ratio(r) => write!(f, "{:.4}", r),
            StatValue::Duration(d) => write!(f, "{:?}", d),
        }
    }
}

#[inline]
fn add_nanos(slot: &AtomicU64, d: Duration) {
    let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
    slot.fetch_add(nanos, Ordering::Relaxed);
}

#[inline]
fn load_duration(slot: &AtomicU64) -> Duration {
    Duration::from_nanos(slot.load(Ordering::Relaxed))
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: &str) {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
        guard.push_str(status);
    }

    pub fn status(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_tasks(&self, n: u64) {
        self.num_tasks.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_filters(&self, n: u64) {
        self.num_filters.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_chunks_requested(&self, n: u64) {
        self.chunks_requested.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_chunks_filtered(&self, n: u64) {
        self.chunks_filtered.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_series_requested(&self, n: u64) {
        self.series_requested.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_series_filtered(&self, n: u64) {
        self.series_filtered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queue_time(&self, d: Duration) {
        add_nanos(&self.queue_time, d);
    }
    pub fn add_metas_fetch_time(&self, d: Duration) {
        add_nanos(&self.metas_fetch_time, d);
    }
    pub fn add_blocks_fetch_time(&self, d: Duration) {
        add_nanos(&self.blocks_fetch_time, d);
    }
    pub fn add_processing_time(&self, d: Duration) {
        add_nanos(&self.processing_time, d);
    }
    pub fn add_post_processing_time(&self, d: Duration) {
        add_nanos(&self.post_processing_time, d);
    }

    pub fn num_tasks(&self) -> u64 {
        self.num_tasks.load(Ordering::Relaxed)
    }
    pub fn chunks_requested(&self) -> u64 {
        self.chunks_requested.load(Ordering::Relaxed)
    }
    pub fn chunks_filtered(&self) -> u64 {
        self.chunks_filtered.load(Ordering::Relaxed)
    }
    pub fn series_requested(&self) -> u64 {
        self.series_requested.load(Ordering::Relaxed)
    }
    pub fn series_filtered(&self) -> u64 {
        self.series_filtered.load(Ordering::Relaxed)
    }

    pub fn processing_time(&self) -> Duration {
        load_duration(&self.processing_time)
    }
    pub fn blocks_fetch_time(&self) -> Duration {
        load_duration(&self.blocks_fetch_time)
    }

    /// Sum of all phase durations.
    pub fn duration(&self) -> Duration {
        load_duration(&self.queue_time)
            + load_duration(&self.metas_fetch_time)
            + load_duration(&self.blocks_fetch_time)
            + load_duration(&self.processing_time)
            + load_duration(&self.post_processing_time)
    }

    /// Share of requested chunks that were filtered, guarded against division by zero.
    pub fn filter_ratio(&self) -> f64 {
        self.chunks_filtered() as f64 / self.chunks_requested().max(1) as f64
    }

    /// Flat key/value summary suitable for structured log lines.
    pub fn kv_args(&self) -> Vec<(&'static str, StatValue)> {
        let requested = self.chunks_requested();
        let filtered = self.chunks_filtered();
        vec![
            ("status", StatValue::Text(self.status())),
            ("tasks", StatValue::Count(self.num_tasks())),
            ("filters", StatValue::Count(self.num_filters.load(Ordering::Relaxed))),
            ("series_requested", StatValue::Count(self.series_requested())),
            ("series_filtered", StatValue::Count(self.series_filtered())),
            ("chunks_requested", StatValue::Count(requested)),
            ("chunks_filtered", StatValue::Count(filtered)),
            (
                "chunks_remaining",
                StatValue::Count(requested.saturating_sub(filtered)),
            ),
            ("filter_ratio", StatValue::Ratio(self.filter_ratio())),
            ("queue_time", StatValue::Duration(load_duration(&self.queue_time))),
            (
                "metas_fetch_time",
                StatValue::Duration(load_duration(&self.metas_fetch_time)),
            ),
            (
                "blocks_fetch_time",
                StatValue::Duration(self.blocks_fetch_time()),
            ),
            ("processing_time", StatValue::Duration(self.processing_time())),
            (
                "post_processing_time",
                StatValue::Duration(load_duration(&self.post_processing_time)),
            ),
            ("duration", StatValue::Duration(self.duration())),
        ]
    }
}

/// Optional, explicitly passed [`Stats`]. The empty handle is a null object.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Option<Arc<Stats>>);

impl StatsHandle {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new() -> Self {
        Self(Some(Arc::new(Stats::new())))
    }

    pub fn from_stats(stats: Arc<Stats>) -> Self {
        Self(Some(stats))
    }

    /// `None` when no stats were attached.
    pub fn get(&self) -> Option<&Arc<Stats>> {
        self.0.as_ref()
    }

    #[inline]
    pub fn record(&self, f: impl FnOnce(&Stats)) {
        if let Some(stats) = &self.0 {
            f(stats);
        }
    }

    pub fn kv_args(&self) -> Vec<(&'static str, StatValue)> {
        self.0.as_ref().map(|s| s.kv_args()).unwrap_or_default()
    }
}
