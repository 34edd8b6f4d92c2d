use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::{Config, Sink};
use crate::format::Formatter;
use crate::stats::Stats;

/// Worker pool draining sealed batches to the log sink. Workers exit
/// when the batch channel closes and its backlog is drained, which is
/// how `land` waits them out.
pub struct LogOutlet {
    sink: Sink,
    formatter: Arc<Formatter>,
    client: reqwest::Client,
    use_gzip: bool,
    max_attempts: usize,
    num_outlets: usize,
    stats: Arc<Stats>,
}

impl LogOutlet {
    pub fn new(
        config: &Config,
        sink: Sink,
        formatter: Arc<Formatter>,
        stats: Arc<Stats>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.skip_verify)
            .build()?;
        Ok(Self {
            sink,
            formatter,
            client,
            use_gzip: config.use_gzip,
            max_attempts: config.max_attempts,
            num_outlets: config.num_outlets,
            stats,
        })
    }

    pub fn start(self: Arc<Self>, batches: flume::Receiver<Batch>) -> Vec<JoinHandle<()>> {
        (0..self.num_outlets.max(1))
            .map(|_| {
                let outlet = self.clone();
                let batches = batches.clone();
                tokio::spawn(async move {
                    while let Ok(batch) = batches.recv_async().await {
                        outlet.deliver(batch).await;
                    }
                })
            })
            .collect()
    }

    /// POST one batch, retrying transport failures, 5xx, and 429 up to
    /// the attempt budget. Other 4xx are terminal: the sink saw the
    /// request and refused it.
    async fn deliver(&self, batch: Batch) {
        let count = batch.msg_count() as u64;
        let formatted = match self.formatter.format(&batch) {
            Ok(formatted) => formatted,
            Err(err) => {
                warn!(error = %err, "failed to encode batch");
                Stats::incr(&self.stats.retries_lost, count);
                return;
            }
        };
        let body = if self.use_gzip {
            match compress(&formatted.body) {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "failed to gzip batch");
                    Stats::incr(&self.stats.retries_lost, count);
                    return;
                }
            }
        } else {
            formatted.body
        };

        for attempt in 1..=self.max_attempts {
            let mut request = self
                .client
                .post(self.sink.url.clone())
                .header(reqwest::header::CONTENT_TYPE, formatted.content_type)
                .basic_auth(&self.sink.username, Some(&self.sink.password))
                .body(body.clone());
            if self.use_gzip {
                request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    // Always drain so the connection is reusable.
                    let _ = response.bytes().await;
                    if status.is_success() {
                        debug!(lines = count, batch = %batch.id, "delivered batch");
                        return;
                    }
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        warn!(status = status.as_u16(), lines = count, "sink rejected batch");
                        Stats::incr(&self.stats.retries_dropped, count);
                        return;
                    }
                    warn!(attempt, status = status.as_u16(), "retryable sink status");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "sink request failed");
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        warn!(lines = count, attempts = self.max_attempts, "batch lost");
        Stats::incr(&self.stats.retries_lost, count);
    }
}

fn backoff(attempt: usize) -> Duration {
    let exp = (attempt - 1).min(5) as u32;
    Duration::from_millis(50 << exp).min(Duration::from_secs(2))
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}
