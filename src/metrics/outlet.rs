use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics::bucket::Bucket;
use crate::metrics::datadog::{self, Series, SeriesRequest};
use crate::metrics::metchan::Metchan;

/// A tenant's slice flushes at this many entries or on the group tick,
/// whichever comes first.
const GROUP_CAPACITY: usize = 300;
const GROUP_TICK: Duration = Duration::from_millis(200);
const REPORT_TICK: Duration = Duration::from_secs(1);

/// Three-stage delivery of drained buckets: convert (CPU-bound fan
/// out), group by tenant token, post with retries. Stages are connected
/// by bounded channels and wind down by closure cascade from the inbox.
pub struct DataDogOutlet {
    buffer_size: usize,
    concurrency: usize,
    retries: usize,
    client: reqwest::Client,
    mchan: Arc<Metchan>,
}

impl DataDogOutlet {
    pub fn new(config: &Config, mchan: Arc<Metchan>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            buffer_size: config.buffer_size,
            concurrency: config.concurrency,
            retries: config.outlet_retries,
            client: reqwest::Client::builder()
                .timeout(config.outlet_ttl)
                .build()?,
            mchan,
        })
    }

    pub fn start(
        &self,
        inbox_rx: flume::Receiver<Bucket>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (conversions, conversions_rx) = flume::bounded::<Series>(self.buffer_size);
        let (outbox, outbox_rx) = flume::bounded::<Vec<Series>>(self.buffer_size);
        let mut handles = Vec::new();

        // Converting is CPU bound; scale with the host rather than the
        // configured posting concurrency.
        let converters = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        for _ in 0..converters {
            let inbox_rx = inbox_rx.clone();
            let conversions = conversions.clone();
            let mchan = self.mchan.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(bucket) = inbox_rx.recv_async().await {
                    if convert_bucket(&bucket, &conversions, &mchan).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(conversions);

        handles.push(tokio::spawn(group_by_tenant(conversions_rx.clone(), outbox)));

        for _ in 0..self.concurrency.max(1) {
            let outbox_rx = outbox_rx.clone();
            let client = self.client.clone();
            let retries = self.retries;
            let mchan = self.mchan.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(series) = outbox_rx.recv_async().await {
                    post_group(&client, series, retries, &mchan).await;
                }
            }));
        }

        handles.push(self.spawn_reporter(inbox_rx, conversions_rx, outbox_rx, shutdown));
        handles
    }

    /// Watch the stage queue depths; a maxed-out buffer is the first
    /// sign the backend is falling behind.
    fn spawn_reporter(
        &self,
        inbox: flume::Receiver<Bucket>,
        conversions: flume::Receiver<Series>,
        outbox: flume::Receiver<Vec<Series>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mchan = self.mchan.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REPORT_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        mchan.measure("datadog-outlet.inbox", inbox.len() as f64);
                        mchan.measure("datadog-outlet.conversion", conversions.len() as f64);
                        mchan.measure("datadog-outlet.outbox", outbox.len() as f64);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

async fn convert_bucket(
    bucket: &Bucket,
    conversions: &flume::Sender<Series>,
    mchan: &Metchan,
) -> Result<(), flume::SendError<Series>> {
    let tags: Vec<String> = if bucket.id.tags.is_empty() {
        Vec::new()
    } else {
        bucket.id.tags.split(',').map(str::to_string).collect()
    };
    for metric in bucket.metrics() {
        for series in datadog::convert(&metric, &tags) {
            conversions.send_async(series).await?;
        }
    }
    mchan.measure("outlet.delay", bucket.id.delay(chrono::Utc::now()));
    Ok(())
}

/// Single accumulator keyed by tenant token. Runs until the conversion
/// channel closes, then flushes whatever is left.
async fn group_by_tenant(conversions: flume::Receiver<Series>, outbox: flume::Sender<Vec<Series>>) {
    let mut groups: HashMap<String, Vec<Series>> = HashMap::new();
    let mut tick = tokio::time::interval(GROUP_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (_, series) in groups.drain() {
                    if !series.is_empty() && outbox.send_async(series).await.is_err() {
                        return;
                    }
                }
            }
            series = conversions.recv_async() => {
                let series = match series {
                    Ok(series) => series,
                    Err(_) => break,
                };
                let slot = groups.entry(series.auth.clone()).or_insert_with(|| {
                    Vec::with_capacity(GROUP_CAPACITY)
                });
                slot.push(series);
                if slot.len() >= GROUP_CAPACITY {
                    let auth = slot[0].auth.clone();
                    if let Some(full) = groups.remove(&auth) {
                        if outbox.send_async(full).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    for (_, series) in groups.drain() {
        if !series.is_empty() && outbox.send_async(series).await.is_err() {
            return;
        }
    }
}

async fn post_group(client: &reqwest::Client, series: Vec<Series>, retries: usize, mchan: &Metchan) {
    if series.is_empty() {
        return;
    }
    // All entries of a group share one tenant token.
    let api_key = series[0].auth.clone();
    let request = SeriesRequest { series };

    let started = std::time::Instant::now();
    for attempt in 0..=retries {
        match datadog::post(client, &api_key, &request).await {
            Ok(()) => {
                debug!(entries = request.series.len(), "posted metric series");
                mchan.time("outlet.post", started);
                return;
            }
            Err(err) => {
                warn!(attempt, error = %err, "measure.datadog.error");
            }
        }
    }
    mchan.measure("outlet.drop", 1.0);
}
