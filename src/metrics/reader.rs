use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics::bucket::Bucket;
use crate::metrics::metchan::Metchan;
use crate::metrics::store::MemStore;

/// Periodic pump from the store into the metric outlet: a scan task
/// finds closed windows, getter workers drain them destructively and
/// forward downstream. Dropping the scan task's channel ends the
/// getters once they have drained, which in turn closes the outlet
/// stages.
pub struct MetricReader {
    store: Arc<MemStore>,
    mchan: Arc<Metchan>,
    interval: std::time::Duration,
    concurrency: usize,
    buffer_size: usize,
}

impl MetricReader {
    pub fn new(config: &Config, store: Arc<MemStore>, mchan: Arc<Metchan>) -> Self {
        Self {
            store,
            mchan,
            interval: config.outlet_interval.max(std::time::Duration::from_millis(1)),
            concurrency: config.concurrency,
            buffer_size: config.buffer_size,
        }
    }

    pub fn start(
        &self,
        out: flume::Sender<Bucket>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (inbox, inbox_rx) = flume::bounded::<Bucket>(self.buffer_size);
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        let store = self.store.clone();
        let mchan = self.mchan.clone();
        let interval = self.interval;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let started = Instant::now();
                        for bucket in store.scan(store.now()) {
                            if inbox.send_async(bucket).await.is_err() {
                                return;
                            }
                        }
                        mchan.time("reader.scan", started);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        for _ in 0..self.concurrency.max(1) {
            let inbox_rx = inbox_rx.clone();
            let out = out.clone();
            let store = self.store.clone();
            let mchan = self.mchan.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(mut bucket) = inbox_rx.recv_async().await {
                    let started = Instant::now();
                    // A window scanned twice before its first get loses
                    // the race; skip the empty second read.
                    if store.get(&mut bucket).is_ok() {
                        if out.send_async(bucket).await.is_err() {
                            return;
                        }
                    }
                    mchan.time("reader.get", started);
                }
            }));
        }
        handles
    }
}
