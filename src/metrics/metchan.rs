use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::metrics::bucket::{truncate, Bucket, Id, Metric, MetricKind};
use crate::metrics::datadog::{self, SeriesRequest};

/// Internal self-telemetry channel. Components on the hot path publish
/// their own latencies and counts here; the channel aggregates them and
/// outlets them upstream on its own cadence. Producers never block on
/// outlet latency: appends happen under a short lock and the flusher
/// drops rather than applying back-pressure.
pub struct Metchan {
    token: String,
    flush_interval: Duration,
    source: String,
    app_name: String,
    tags: Vec<String>,
    concurrency: usize,
    buffer: Mutex<HashMap<String, Bucket>>,
    outbox: flume::Sender<Metric>,
    outbox_rx: flume::Receiver<Metric>,
    client: reqwest::Client,
}

impl Metchan {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let (outbox, outbox_rx) = flume::bounded(config.buffer_size);
        Ok(Self {
            token: config.outlet_token.clone(),
            // interval() rejects a zero period.
            flush_interval: config.flush_interval.max(Duration::from_millis(1)),
            source: config.hostname.clone(),
            app_name: config.appname.clone(),
            tags: config.tags.clone(),
            concurrency: config.concurrency,
            buffer: Mutex::new(HashMap::new()),
            outbox,
            outbox_rx,
            client: reqwest::Client::builder()
                .timeout(config.outlet_ttl)
                .build()?,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Spawn the flush timer and the outlet workers.
    pub fn start(self: std::sync::Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        let chan = self.clone();
        let mut flush_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(chan.flush_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => chan.flush(),
                    _ = flush_shutdown.changed() => {
                        if *flush_shutdown.borrow() {
                            chan.flush();
                            return;
                        }
                    }
                }
            }
        }));

        for _ in 0..self.concurrency.max(1) {
            let chan = self.clone();
            let outbox = self.outbox_rx.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        metric = outbox.recv_async() => match metric {
                            Ok(metric) => chan.post(metric).await,
                            Err(_) => return,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }
        handles
    }

    /// Record a measurement into this flush window's bucket.
    pub fn measure(&self, name: &str, v: f64) {
        if v > 0.0 {
            debug!(source = %self.source, "measure#{}={}", name, v);
        }
        let source = self.source.clone();
        self.with_bucket(name, &source, "ms", MetricKind::Measurement, |b| b.append(v));
    }

    /// Measure elapsed milliseconds since `started`.
    pub fn time(&self, name: &str, started: Instant) {
        self.measure(name, started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Counter analogue of `measure`.
    pub fn count(&self, name: &str, n: f64) {
        let source = self.source.clone();
        self.with_bucket(name, &source, "", MetricKind::Counter, |b| b.incr(n));
    }

    /// Per-tenant receive accounting; the tenant id doubles as the
    /// source with `@` flattened for the backend.
    pub fn count_req(&self, user: &str) {
        let source = user.replace('@', "_at_");
        self.with_bucket(
            "receiver.requests",
            &source,
            "requests",
            MetricKind::Counter,
            |b| b.incr(1.0),
        );
    }

    fn with_bucket(
        &self,
        name: &str,
        source: &str,
        units: &str,
        kind: MetricKind,
        update: impl FnOnce(&mut Bucket),
    ) {
        let name = format!("{}.{}", self.app_name, name);
        let key = format!("{}:{}", name, source);
        let latest = truncate(Utc::now(), self.flush_interval);

        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buffer.entry(key).or_insert_with(|| {
            Bucket::new(Id {
                name,
                source: source.to_string(),
                auth: self.token.clone(),
                time: latest,
                resolution: self.flush_interval,
                units: units.to_string(),
                kind,
                tags: self.tags.join(","),
            })
        });
        // Reuse the resident bucket across windows; a stale window rolls
        // forward and the vals slot is recycled.
        if bucket.id.time != latest {
            bucket.id.time = latest;
            bucket.reset();
        }
        update(bucket);
    }

    /// Derive and enqueue every buffered metric. Never blocks: a full
    /// outbox drops the metric and moves on.
    fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        for bucket in buffer.values_mut() {
            for metric in bucket.metrics() {
                if self.outbox.try_send(metric).is_err() {
                    error!("error=metchan-drop");
                }
            }
            bucket.reset();
        }
    }

    async fn post(&self, metric: Metric) {
        if self.token.is_empty() {
            debug!(metric = %metric.name, "no outlet token, skipping self-metric post");
            return;
        }
        let request = SeriesRequest {
            series: datadog::convert(&metric, &self.tags),
        };
        if let Err(err) = datadog::post(&self.client, &self.token, &request).await {
            warn!(error = %err, "at=metchan-post");
        }
    }

    #[cfg(test)]
    fn buffered(&self, key: &str) -> Option<Bucket> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}
