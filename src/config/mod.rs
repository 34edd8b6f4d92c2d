use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid logs url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no host in logs url: {0}")]
    MissingHost(String),

    #[error("max-attempts must be >= 1 (got: {0})")]
    MaxAttempts(usize),

    #[error("unknown input format: {0}")]
    UnknownInputFormat(String),
}

/// Framing of the incoming lines. Raw lines get a syslog header
/// prepended by the Logplex formatter; rfc3164/rfc5424 lines already
/// carry one and are framed as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    #[default]
    Raw,
    Rfc3164,
    Rfc5424,
}

impl FromStr for InputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(InputFormat::Raw),
            "rfc3164" => Ok(InputFormat::Rfc3164),
            "rfc5424" => Ok(InputFormat::Rfc5424),
            other => Err(ConfigError::UnknownInputFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Logplex,
    Kinesis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenProto {
    Tcp,
    Udp,
}

/// Static fields of the RFC5424 frame header. The timestamp slot is
/// filled per line by the Logplex formatter.
#[derive(Debug, Clone)]
pub struct SyslogHeader {
    pub prival: String,
    pub version: String,
    pub hostname: String,
    pub appname: String,
    pub procid: String,
    pub msgid: String,
}

/// Resolved delivery target for the log sink.
#[derive(Debug, Clone)]
pub struct Sink {
    pub url: Url,
    pub username: String,
    pub password: String,
    pub format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Ingestion.
    pub batch_size: usize,
    pub back_buff: usize,
    pub wait_duration: Duration,
    pub max_line_length: usize,
    pub drop: bool,
    pub input_format: InputFormat,

    // Delivery.
    pub logs_url: String,
    pub num_outlets: usize,
    pub max_attempts: usize,
    pub timeout: Duration,
    pub use_gzip: bool,
    pub skip_verify: bool,
    pub kinesis_shards: usize,

    // Syslog header fields.
    pub prival: String,
    pub syslog_version: String,
    pub procid: String,
    pub appname: String,
    pub hostname: String,
    pub msgid: String,

    // Metric engine.
    pub buffer_size: usize,
    pub concurrency: usize,
    pub flush_interval: Duration,
    pub outlet_interval: Duration,
    pub outlet_ttl: Duration,
    pub outlet_retries: usize,
    pub outlet_token: String,
    pub receiver_deadline: u64,
    pub max_partitions: u64,
    pub tags: Vec<String>,

    // Self-stats.
    pub stats_source: String,
    pub stats_interval: Duration,

    // Listener mode.
    pub server: bool,
    pub port: u16,
    pub listen_proto: ListenProto,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 500,
            back_buff: 50,
            wait_duration: Duration::from_millis(250),
            max_line_length: 10_000,
            drop: true,
            input_format: InputFormat::Raw,

            logs_url: String::new(),
            num_outlets: 4,
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            use_gzip: false,
            skip_verify: false,
            kinesis_shards: 1,

            prival: "190".to_string(),
            syslog_version: "1".to_string(),
            procid: "shuttle".to_string(),
            appname: "token".to_string(),
            hostname: "shuttle".to_string(),
            msgid: "- -".to_string(),

            buffer_size: 1024,
            concurrency: 10,
            flush_interval: Duration::from_secs(5),
            outlet_interval: Duration::from_secs(1),
            outlet_ttl: Duration::from_secs(2),
            outlet_retries: 2,
            outlet_token: String::new(),
            receiver_deadline: 2,
            max_partitions: 1,
            tags: Vec::new(),

            stats_source: String::new(),
            stats_interval: Duration::ZERO,

            server: false,
            port: 514,
            listen_proto: ListenProto::Tcp,
        }
    }
}

impl Config {
    /// Validate the startup invariants and resolve the sink target.
    /// Any error here is fatal (non-zero exit).
    pub fn validate(&self) -> Result<Sink, ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::MaxAttempts(self.max_attempts));
        }
        let url = Url::parse(&self.logs_url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::MissingHost(self.logs_url.clone()))?
            .to_string();

        let (username, password) = match url.username() {
            "" => ("token".to_string(), self.appname.clone()),
            user => (
                user.to_string(),
                url.password().unwrap_or_default().to_string(),
            ),
        };

        // Strip userinfo; credentials ride in the Authorization header.
        let mut url = url;
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Sink {
            url,
            username,
            password,
            format: output_format(&host),
        })
    }

    pub fn syslog_header(&self) -> SyslogHeader {
        SyslogHeader {
            prival: self.prival.clone(),
            version: self.syslog_version.clone(),
            hostname: self.hostname.clone(),
            appname: self.appname.clone(),
            procid: self.procid.clone(),
            msgid: self.msgid.clone(),
        }
    }

    pub fn receiver_deadline(&self) -> Duration {
        Duration::from_secs(self.receiver_deadline)
    }
}

static KINESIS_HOST: OnceLock<Regex> = OnceLock::new();

/// A sink host shaped like a Kinesis endpoint selects the Kinesis
/// formatter; everything else gets Logplex framing.
pub fn output_format(host: &str) -> OutputFormat {
    let kinesis = KINESIS_HOST.get_or_init(|| {
        Regex::new(r"\Akinesis\.[a-z]{2}-[a-z]+-\d\.amazonaws\.com\z").expect("static host pattern")
    });
    if kinesis.is_match(host) {
        OutputFormat::Kinesis
    } else {
        OutputFormat::Logplex
    }
}
