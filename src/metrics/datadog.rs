use serde::Serialize;
use thiserror::Error;

use crate::metrics::bucket::{Metric, MetricValue};

pub const SERIES_URL: &str = "https://app.datadoghq.com/api/v1/series";
const USER_AGENT: &str = "l2met/1.0";

#[derive(Debug, Error)]
pub enum PostError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics backend rejected request: code={status} body={body}")]
    Rejected { status: u16, body: String },
}

/// `[epoch seconds, value]` pair.
#[derive(Debug, Clone, Serialize)]
pub struct Point(pub f64, pub f64);

/// One entry of the `{"series": [...]}` payload. `auth` routes the
/// entry to its tenant and never hits the wire.
#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub metric: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub series_type: &'static str,
    #[serde(skip)]
    pub auth: String,
    pub points: Vec<Point>,
}

#[derive(Debug, Serialize)]
pub struct SeriesRequest {
    pub series: Vec<Series>,
}

fn entry(metric: &Metric, name: String, value: f64, tags: &[String]) -> Series {
    Series {
        metric: name,
        host: metric.source.clone(),
        tags: tags.to_vec(),
        series_type: "gauge",
        auth: metric.auth.clone(),
        points: vec![Point(metric.time.timestamp() as f64, value)],
    }
}

/// Expand a derived metric into its backend entries. The backend has no
/// complex type, so a complex metric maps to four gauges; the bare name
/// carries the sum.
pub fn convert(metric: &Metric, tags: &[String]) -> Vec<Series> {
    match metric.value {
        MetricValue::Simple(val) => vec![entry(metric, metric.name.clone(), val, tags)],
        MetricValue::Complex {
            min,
            max,
            sum,
            count,
        } => vec![
            entry(metric, format!("{}.min", metric.name), min, tags),
            entry(metric, format!("{}.max", metric.name), max, tags),
            entry(metric, metric.name.clone(), sum, tags),
            entry(metric, format!("{}.count", metric.name), count as f64, tags),
        ],
    }
}

/// POST one tenant's series slice. The caller owns retry policy.
pub async fn post(
    client: &reqwest::Client,
    api_key: &str,
    request: &SeriesRequest,
) -> Result<(), PostError> {
    let response = client
        .post(SERIES_URL)
        .query(&[("api_key", api_key)])
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .header(reqwest::header::CONNECTION, "Keep-Alive")
        .json(request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PostError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    // Drain so the connection returns to the pool.
    let _ = response.bytes().await;
    Ok(())
}
