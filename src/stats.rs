use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Process-lifetime counters for the ingest and delivery path.
///
/// Counters are cumulative; the emitter reports snapshots without
/// resetting so the read = batched + dropped ledger stays checkable at
/// any point.
#[derive(Debug, Default)]
pub struct Stats {
    pub lines_read: AtomicU64,
    pub lines_batched: AtomicU64,
    pub lines_dropped: AtomicU64,
    /// Batches (not lines) lost to a full batch channel.
    pub drops: AtomicU64,
    /// Lines lost after delivery retries were exhausted.
    pub retries_lost: AtomicU64,
    pub retries_dropped: AtomicU64,
    batch_fill_count: AtomicU64,
    batch_fill_nanos: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_batch_fill(&self, elapsed: Duration) {
        self.batch_fill_count.fetch_add(1, Ordering::Relaxed);
        self.batch_fill_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    pub fn lines_batched(&self) -> u64 {
        self.lines_batched.load(Ordering::Relaxed)
    }

    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped.load(Ordering::Relaxed)
    }

    pub fn retries_lost(&self) -> u64 {
        self.retries_lost.load(Ordering::Relaxed)
    }

    pub fn retries_dropped(&self) -> u64 {
        self.retries_dropped.load(Ordering::Relaxed)
    }

    fn batch_fill_mean_ms(&self) -> f64 {
        let count = self.batch_fill_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let nanos = self.batch_fill_nanos.load(Ordering::Relaxed);
        nanos as f64 / count as f64 / 1_000_000.0
    }

    fn emit(&self, source: &str) {
        info!(
            source = source,
            lines.read = self.lines_read(),
            lines.batched = self.lines_batched(),
            lines.dropped = self.lines_dropped(),
            batch.fill.count = self.batch_fill_count.load(Ordering::Relaxed),
            batch.fill.mean_ms = self.batch_fill_mean_ms(),
            retries.lost = self.retries_lost(),
            retries.dropped = self.retries_dropped(),
            "stats"
        );
    }
}

/// Periodic logfmt-style snapshot of the counter registry. Disabled when
/// the interval is zero.
pub fn spawn_emitter(
    stats: Arc<Stats>,
    source: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => stats.emit(&source),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }))
}
