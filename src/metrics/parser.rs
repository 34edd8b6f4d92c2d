use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::bytes::Regex;
use tracing::warn;

use crate::metrics::bucket::{truncate, Bucket, Id, MetricKind};

/// `kind#name=value[unit]`, long or short kind prefixes. Lines are raw
/// bytes; names and units are ASCII by construction of the pattern.
const DIRECTIVE_PATTERN: &str =
    r"(count|sample|measure|c|s|m)#(\w[^=\s]*)=(\d+(?:\.\d+)?)([a-zA-Z]*)";

static DIRECTIVE_RE: OnceLock<Regex> = OnceLock::new();

fn directive_re() -> &'static Regex {
    DIRECTIVE_RE.get_or_init(|| Regex::new(DIRECTIVE_PATTERN).expect("static directive pattern"))
}

/// Cheap pre-check used by the line reader to skip the receiver
/// hand-off for lines without telemetry directives.
pub fn has_directives(line: &[u8]) -> bool {
    directive_re().is_match(line)
}

/// Per-parse options resolved from configuration (and, in listener
/// deployments, per-tenant settings).
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub prefix: Option<String>,
    pub source_prefix: Option<String>,
    pub source: Option<String>,
    pub auth: Option<String>,
    pub tags: Vec<String>,
    /// Bucket resolution in seconds; 60 when unset.
    pub resolution: Option<u64>,
}

/// Extract every directive tuple from `line` and wrap each in a
/// one-value bucket. All buckets of one parse share the same truncated
/// time. A tuple that fails to parse is logged and skipped; the rest of
/// the line still yields buckets.
pub fn build_buckets(
    line: &[u8],
    opts: &Options,
    default_auth: &str,
    now: DateTime<Utc>,
) -> Vec<Bucket> {
    let resolution = Duration::from_secs(opts.resolution.unwrap_or(60));
    let time = truncate(now, resolution);
    let auth = opts
        .auth
        .clone()
        .unwrap_or_else(|| default_auth.to_string());
    let source = resolve_source(opts);
    let tags = opts.tags.join(",");

    let mut buckets = Vec::new();
    for caps in directive_re().captures_iter(line) {
        let kind = match &caps[1] {
            b"count" | b"c" => MetricKind::Counter,
            b"sample" | b"s" => MetricKind::Sample,
            b"measure" | b"m" => MetricKind::Measurement,
            _ => continue,
        };
        let name = String::from_utf8_lossy(&caps[2]).into_owned();
        let units = String::from_utf8_lossy(&caps[4]).into_owned();
        let val: f64 = match String::from_utf8_lossy(&caps[3]).parse() {
            Ok(v) => v,
            Err(err) => {
                warn!(name = %name, error = %err, "skipping unparsable metric value");
                continue;
            }
        };

        let id = Id {
            name: prefixed(&name, opts),
            source: source.clone(),
            auth: auth.clone(),
            time,
            resolution,
            units,
            kind,
            tags: tags.clone(),
        };
        buckets.push(Bucket {
            id,
            vals: vec![val],
        });
    }
    buckets
}

fn prefixed(name: &str, opts: &Options) -> String {
    match &opts.prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}

fn resolve_source(opts: &Options) -> String {
    let source = opts.source.clone().unwrap_or_default();
    match &opts.source_prefix {
        None => source,
        Some(prefix) if source.is_empty() => prefix.clone(),
        Some(prefix) => format!("{prefix}.{source}"),
    }
}
