use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::metrics::metchan::Metchan;
use crate::metrics::parser::{self, Options};
use crate::metrics::store::MemStore;

/// Accepts raw lines from the reader's parser branch and merges their
/// buckets into the store from a worker pool. The reader-facing side is
/// one of the two drop-or-block sites: with `drop = true` the enqueue
/// never blocks; otherwise it blocks at most the receiver deadline.
pub struct Receiver {
    inbox: flume::Sender<Vec<u8>>,
    inbox_rx: flume::Receiver<Vec<u8>>,
    opts: Arc<Options>,
    deadline: Duration,
    drop: bool,
    concurrency: usize,
    store: Arc<MemStore>,
    mchan: Arc<Metchan>,
}

impl Receiver {
    pub fn new(config: &Config, store: Arc<MemStore>, mchan: Arc<Metchan>) -> Self {
        let (inbox, inbox_rx) = flume::bounded(config.buffer_size);
        let opts = Arc::new(Options {
            source: Some(config.hostname.clone()),
            tags: config.tags.clone(),
            ..Options::default()
        });
        Self {
            inbox,
            inbox_rx,
            opts,
            deadline: config.receiver_deadline(),
            drop: config.drop,
            concurrency: config.concurrency,
            store,
            mchan,
        }
    }

    /// Offer one raw line for metric extraction.
    pub async fn receive(&self, line: Vec<u8>) {
        if self.drop {
            if self.inbox.try_send(line).is_err() {
                self.mchan.count("receiver.drop", 1.0);
            }
            return;
        }
        let send = self.inbox.send_async(line);
        if tokio::time::timeout(self.deadline, send).await.is_err() {
            self.mchan.count("receiver.drop", 1.0);
        }
    }

    /// Spawn the merge workers. They terminate by channel closure: once
    /// every holder of this `Receiver` is gone the inbox sender drops,
    /// and the workers drain the backlog before exiting, so enqueued
    /// lines are merged (or drop-accounted), never stranded.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency.max(1));
        for _ in 0..self.concurrency.max(1) {
            let inbox = self.inbox_rx.clone();
            let opts = self.opts.clone();
            let deadline = self.deadline;
            let store = self.store.clone();
            let mchan = self.mchan.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(line) = inbox.recv_async().await {
                    merge_line(&line, &opts, deadline, &store, &mchan);
                }
            }));
        }
        handles
    }
}

/// Parse one line and merge its buckets under the deadline budget.
/// Running out of budget drops the rest of the line's tuples with
/// accounting rather than stalling the pool.
fn merge_line(
    line: &[u8],
    opts: &Options,
    deadline: Duration,
    store: &MemStore,
    mchan: &Metchan,
) {
    let started = Instant::now();
    let user = opts.auth.as_deref().unwrap_or_else(|| mchan.token());
    mchan.count_req(user);

    let buckets = parser::build_buckets(line, opts, mchan.token(), store.now());
    let total = buckets.len();
    for (done, bucket) in buckets.into_iter().enumerate() {
        if started.elapsed() > deadline {
            let dropped = (total - done) as f64;
            mchan.count("receiver.drop", dropped);
            warn!(dropped = total - done, "error=receiver-deadline");
            return;
        }
        store.put(bucket);
    }
}
