mod kinesis;
mod logplex;

use crate::batch::Batch;
use crate::config::{Config, InputFormat, OutputFormat, Sink, SyslogHeader};

pub use logplex::frame;

/// A batch rendered to its wire encoding plus content metadata.
pub struct FormattedBatch {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// Pluggable encoder turning a sealed batch into an HTTP body. The
/// variant is fixed at startup from the sink host; the syslog header is
/// precomputed once and reused for every frame.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
    header: SyslogHeader,
    input_format: InputFormat,
    shards: usize,
    stream: String,
}

impl Formatter {
    pub fn new(config: &Config, sink: &Sink) -> Self {
        Self {
            format: sink.format,
            header: config.syslog_header(),
            input_format: config.input_format,
            shards: config.kinesis_shards.max(1),
            stream: config.appname.clone(),
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.format
    }

    pub fn format(&self, batch: &Batch) -> Result<FormattedBatch, serde_json::Error> {
        match self.format {
            OutputFormat::Logplex => Ok(FormattedBatch {
                body: logplex::format_batch(&self.header, self.input_format, batch),
                content_type: logplex::CONTENT_TYPE,
            }),
            OutputFormat::Kinesis => Ok(FormattedBatch {
                body: kinesis::format_batch(
                    &self.header,
                    self.input_format,
                    batch,
                    self.shards,
                    &self.stream,
                )?,
                content_type: kinesis::CONTENT_TYPE,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::LogLine;
    use chrono::Utc;

    fn config_with(appname: &str) -> Config {
        Config {
            appname: appname.to_string(),
            logs_url: "https://logs.example.com/in".to_string(),
            ..Config::default()
        }
    }

    fn sealed_batch(lines: &[&str]) -> Batch {
        let mut batch = Batch::new(lines.len());
        for text in lines {
            batch.add(LogLine::new(text.as_bytes().to_vec(), Utc::now()));
        }
        batch
    }

    #[test]
    fn logplex_body_concatenates_octet_counted_frames() {
        let config = config_with("app");
        let sink = config.validate().unwrap();
        let formatter = Formatter::new(&config, &sink);
        let batch = sealed_batch(&["hello\n", "world\n"]);

        let formatted = formatter.format(&batch).unwrap();
        assert_eq!(formatted.content_type, "application/logplex-1");
        let body = String::from_utf8(formatted.body).unwrap();
        assert!(body.contains("hello\n"));
        assert!(body.contains("world\n"));
        // Each frame leads with its octet count.
        let first_len: usize = body.split(' ').next().unwrap().parse().unwrap();
        assert!(first_len > "hello\n".len());
    }

    #[test]
    fn kinesis_sink_produces_putrecords_json() {
        let mut config = config_with("stream-app");
        config.logs_url = "https://kinesis.us-east-1.amazonaws.com/".to_string();
        let sink = config.validate().unwrap();
        assert_eq!(sink.format, OutputFormat::Kinesis);

        let formatter = Formatter::new(&config, &sink);
        let batch = sealed_batch(&["a\n", "b\n"]);
        let formatted = formatter.format(&batch).unwrap();
        assert_eq!(formatted.content_type, "application/x-amz-json-1.1");

        let value: serde_json::Value = serde_json::from_slice(&formatted.body).unwrap();
        assert_eq!(value["StreamName"], "stream-app");
        assert_eq!(value["Records"].as_array().unwrap().len(), 2);
    }
}
