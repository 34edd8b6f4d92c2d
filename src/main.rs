use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sluice::config::{Config, InputFormat, ListenProto};
use sluice::metrics::metchan::Metchan;
use sluice::metrics::store::MemStore;
use sluice::shuttle::Shuttle;
use sluice::source::listener;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version)]
#[command(about = "Ship log lines to an HTTP(S) sink and extract inline metrics", long_about = None)]
struct Cli {
    /// The receiver of the log data.
    #[arg(long = "logs-url", env = "LOGS_URL", default_value = "")]
    logs_url: String,

    /// Number of messages to pack into a single http request.
    #[arg(long = "batch-size", default_value_t = 500)]
    batch_size: usize,

    /// Number of batches to buffer before dropping.
    #[arg(long = "back-buff", default_value_t = 50)]
    back_buff: usize,

    /// Duration to wait before flushing a partial batch (e.g. 250ms, 1s).
    #[arg(long = "wait", value_parser = parse_duration, default_value = "250ms")]
    wait: Duration,

    /// Number of bytes the sink allows per line.
    #[arg(long = "max-line-length", default_value_t = 10_000)]
    max_line_length: usize,

    /// Drop logs when the delivery buffer is full instead of blocking
    /// the input.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    drop: bool,

    /// raw (default), rfc3164, or rfc5424.
    #[arg(long = "input-format", default_value = "raw")]
    input_format: InputFormat,

    /// The number of delivery workers to run.
    #[arg(long = "num-outlets", default_value_t = 4)]
    num_outlets: usize,

    /// Max number of delivery attempts per batch.
    #[arg(long = "max-attempts", default_value_t = 3)]
    max_attempts: usize,

    /// Duration to wait for a response from the sink.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    timeout: Duration,

    /// POST using gzip compression.
    #[arg(long = "gzip")]
    use_gzip: bool,

    /// Skip verification of the HTTPS sink certificate.
    #[arg(long = "skip-verify")]
    skip_verify: bool,

    /// Number of partition keys to use per app on a Kinesis sink.
    #[arg(long = "kinesis-shards", default_value_t = 1)]
    kinesis_shards: usize,

    /// The primary value of the rfc5424 header.
    #[arg(long, default_value = "190")]
    prival: String,

    /// The version of syslog.
    #[arg(long = "syslog-version", default_value = "1")]
    syslog_version: String,

    /// The procid field for the syslog header.
    #[arg(long, default_value = "shuttle")]
    procid: String,

    /// The app-name field for the syslog header; doubles as the sink
    /// credential when the url carries no userinfo.
    #[arg(long, default_value = "token")]
    appname: String,

    /// The hostname field for the syslog header.
    #[arg(long, default_value = "shuttle")]
    hostname: String,

    /// The msgid field for the syslog header.
    #[arg(long, default_value = "- -")]
    msgid: String,

    /// Max number of items for the metric engine's internal buffers.
    #[arg(long = "buffer", default_value_t = 1024)]
    buffer_size: usize,

    /// Worker count for the metric receiver and outlet pools.
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// Time to wait before flushing self-telemetry buckets.
    #[arg(long = "flush-interval", value_parser = parse_duration, default_value = "5s")]
    flush_interval: Duration,

    /// Time between outlet scans of the bucket store.
    #[arg(long = "outlet-interval", value_parser = parse_duration, default_value = "1s")]
    outlet_interval: Duration,

    /// Timeout set on metric outlet HTTP requests.
    #[arg(long = "outlet-ttl", value_parser = parse_duration, default_value = "2s")]
    outlet_ttl: Duration,

    /// Number of retries per metric payload.
    #[arg(long = "outlet-retry", default_value_t = 2)]
    outlet_retries: usize,

    /// Metrics backend API token.
    #[arg(long = "outlet-token", default_value = "")]
    outlet_token: String,

    /// Seconds before an incoming line's tuples are dropped.
    #[arg(long = "recv-deadline", default_value_t = 2)]
    receiver_deadline: u64,

    /// Number of partitions to use for outlets.
    #[arg(long = "partitions", default_value_t = 1)]
    max_partitions: u64,

    /// Tags attached to every metric series (comma separated).
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// When emitting stats, add source=<stats-source> to them.
    #[arg(long = "stats-source", default_value = "")]
    stats_source: String,

    /// How often to emit the counter registry; 0 disables.
    #[arg(long = "stats-interval", value_parser = parse_duration, default_value = "0ms")]
    stats_interval: Duration,

    /// Listen on a socket instead of reading stdin.
    #[arg(long)]
    server: bool,

    /// Port for listener mode.
    #[arg(long, default_value_t = 514)]
    port: u16,

    /// Listen on UDP instead of TCP.
    #[arg(long)]
    udp: bool,

    /// Enable verbose debug info.
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            batch_size: self.batch_size,
            back_buff: self.back_buff,
            wait_duration: self.wait,
            max_line_length: self.max_line_length,
            drop: self.drop,
            input_format: self.input_format,
            logs_url: self.logs_url,
            num_outlets: self.num_outlets,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            use_gzip: self.use_gzip,
            skip_verify: self.skip_verify,
            kinesis_shards: self.kinesis_shards,
            prival: self.prival,
            syslog_version: self.syslog_version,
            procid: self.procid,
            appname: self.appname,
            hostname: self.hostname,
            msgid: self.msgid,
            buffer_size: self.buffer_size,
            concurrency: self.concurrency,
            flush_interval: self.flush_interval,
            outlet_interval: self.outlet_interval,
            outlet_ttl: self.outlet_ttl,
            outlet_retries: self.outlet_retries,
            outlet_token: self.outlet_token,
            receiver_deadline: self.receiver_deadline,
            max_partitions: self.max_partitions,
            tags: self.tags,
            stats_source: self.stats_source,
            stats_interval: self.stats_interval,
            server: self.server,
            port: self.port,
            listen_proto: if self.udp {
                ListenProto::Udp
            } else {
                ListenProto::Tcp
            },
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (value_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        return Err(format!("invalid duration format: {}", s));
    };

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value: {}", value_str))?;

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        _ => Duration::from_secs(value * 60),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "sluice=debug" } else { "sluice=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.into_config();

    let store = Arc::new(MemStore::new());
    let mchan = Arc::new(Metchan::new(&config)?);
    let mut shuttle = Shuttle::new(config.clone(), store, mchan.clone())?;
    let metchan_handles = mchan.clone().start(shuttle.shutdown_signal());

    if config.server {
        match config.listen_proto {
            ListenProto::Tcp => {
                let listener = listener::bind_tcp(config.port).await?;
                info!(port = config.port, "listening on tcp");
                shuttle.launch();
                loop {
                    tokio::select! {
                        conn = listener.accept() => {
                            let (socket, peer) = conn?;
                            info!(peer = %peer, "accepted connection");
                            shuttle.load_reader(socket);
                        }
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
            ListenProto::Udp => {
                let stream = listener::bind_udp(config.port).await?;
                info!(port = config.port, "listening on udp");
                shuttle.load_reader(stream);
                shuttle.launch();
                tokio::signal::ctrl_c().await?;
            }
        }
    } else {
        shuttle.load_reader(tokio::io::stdin());
        shuttle.launch();
        shuttle.wait_for_readers().await;
    }

    shuttle.land().await;
    for handle in metchan_handles {
        let _ = handle.await;
    }
    Ok(())
}
