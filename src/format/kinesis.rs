use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use crate::batch::Batch;
use crate::config::{InputFormat, SyslogHeader};
use crate::format::logplex;

pub const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecords<'a> {
    records: Vec<Record>,
    stream_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Record {
    data: String,
    partition_key: String,
}

/// Kinesis-shaped `PutRecords` body. Each record carries one RFC5424
/// frame, base64 encoded; partition keys rotate over the configured
/// shard count so a busy app spreads across shards.
pub fn format_batch(
    header: &SyslogHeader,
    input_format: InputFormat,
    batch: &Batch,
    shards: usize,
    stream: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let records = batch
        .lines()
        .iter()
        .enumerate()
        .map(|(i, line)| Record {
            data: BASE64.encode(logplex::frame(header, input_format, line)),
            partition_key: format!("{}.{}", stream, i % shards),
        })
        .collect();
    serde_json::to_vec(&PutRecords {
        records,
        stream_name: stream,
    })
}
