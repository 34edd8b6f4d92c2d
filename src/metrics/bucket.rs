use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Truncate `t` down to a whole multiple of `resolution`.
pub fn truncate(t: DateTime<Utc>, resolution: Duration) -> DateTime<Utc> {
    let res_ms = resolution.as_millis() as i64;
    if res_ms == 0 {
        return t;
    }
    let ms = t.timestamp_millis();
    let truncated = ms - ms.rem_euclid(res_ms);
    Utc.timestamp_millis_opt(truncated).single().unwrap_or(t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Sample,
    Measurement,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Sample => "sample",
            MetricKind::Measurement => "measurement",
        }
    }
}

/// Identity and metadata of one aggregation cell. Two ids address the
/// same cell iff `(name, source, time, resolution)` match; the
/// remaining fields ride along for delivery.
#[derive(Debug, Clone)]
pub struct Id {
    pub name: String,
    pub source: String,
    pub auth: String,
    pub time: DateTime<Utc>,
    pub resolution: Duration,
    pub units: String,
    pub kind: MetricKind,
    pub tags: String,
}

/// Store key derived from the identity fields of an [`Id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub name: String,
    pub source: String,
    pub time_ms: i64,
    pub resolution_ms: u64,
}

impl Id {
    pub fn key(&self) -> Key {
        Key {
            name: self.name.clone(),
            source: self.source.clone(),
            time_ms: self.time.timestamp_millis(),
            resolution_ms: self.resolution.as_millis() as u64,
        }
    }

    /// The instant the cell becomes eligible for an outlet scan: one
    /// full resolution window after its truncated time.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.time + chrono::Duration::from_std(self.resolution).unwrap_or_default()
    }

    /// Seconds between the cell's window and `now`; fed to the outlet
    /// latency gauge.
    pub fn delay(&self, now: DateTime<Utc>) -> f64 {
        (now - self.time).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: Id,
    pub vals: Vec<f64>,
}

impl Bucket {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            vals: Vec::new(),
        }
    }

    pub fn append(&mut self, v: f64) {
        self.vals.push(v);
    }

    /// Counters reuse the single vals slot instead of growing.
    pub fn incr(&mut self, n: f64) {
        if self.vals.is_empty() {
            self.vals.push(0.0);
        }
        self.vals[0] += n;
    }

    /// Clear without giving back the allocation.
    pub fn reset(&mut self) {
        self.vals.clear();
    }

    /// Derive the delivered view: complex stats for samples and
    /// measurements, the summed value for counters. Empty cells yield
    /// nothing.
    pub fn metrics(&self) -> Option<Metric> {
        if self.vals.is_empty() {
            return None;
        }
        let value = match self.id.kind {
            MetricKind::Counter => MetricValue::Simple(self.vals.iter().sum()),
            MetricKind::Sample | MetricKind::Measurement => {
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                let mut sum = 0.0;
                for &v in &self.vals {
                    min = min.min(v);
                    max = max.max(v);
                    sum += v;
                }
                MetricValue::Complex {
                    min,
                    max,
                    sum,
                    count: self.vals.len() as u64,
                }
            }
        };
        Some(Metric {
            name: self.id.name.clone(),
            source: self.id.source.clone(),
            auth: self.id.auth.clone(),
            time: self.id.time,
            units: self.id.units.clone(),
            value,
        })
    }
}

/// Derived, never-stored view of a bucket.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub source: String,
    pub auth: String,
    pub time: DateTime<Utc>,
    pub units: String,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Simple(f64),
    Complex {
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
    },
}
