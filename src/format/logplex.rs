use crate::batch::{Batch, LogLine};
use crate::config::{InputFormat, SyslogHeader};

pub const CONTENT_TYPE: &str = "application/logplex-1";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

/// One octet-counted RFC5424 frame: `<len> <prival>version time host
/// appname procid msgid msg`. Raw input gets the configured header
/// prepended; rfc3164/rfc5424 lines already carry their own and are
/// only length-prefixed.
pub fn frame(header: &SyslogHeader, input_format: InputFormat, line: &LogLine) -> Vec<u8> {
    let mut content: Vec<u8> = Vec::with_capacity(line.line.len() + 64);
    if input_format == InputFormat::Raw {
        let rendered = format!(
            "<{}>{} {} {} {} {} {} ",
            header.prival,
            header.version,
            line.when.format(TIME_FORMAT),
            header.hostname,
            header.appname,
            header.procid,
            header.msgid,
        );
        content.extend_from_slice(rendered.as_bytes());
    }
    content.extend_from_slice(&line.line);

    let mut framed = format!("{} ", content.len()).into_bytes();
    framed.extend_from_slice(&content);
    framed
}

pub fn format_batch(header: &SyslogHeader, input_format: InputFormat, batch: &Batch) -> Vec<u8> {
    let mut body = Vec::with_capacity(batch.byte_size() + batch.msg_count() * 80);
    for line in batch.lines() {
        body.extend_from_slice(&frame(header, input_format, line));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn header() -> SyslogHeader {
        SyslogHeader {
            prival: "190".to_string(),
            version: "1".to_string(),
            hostname: "shuttle".to_string(),
            appname: "token".to_string(),
            procid: "shuttle".to_string(),
            msgid: "- -".to_string(),
        }
    }

    #[test]
    fn raw_line_gets_header_and_octet_count() {
        let when = Utc.with_ymd_and_hms(2013, 7, 22, 0, 6, 26).unwrap();
        let line = LogLine::new(b"hello\n".to_vec(), when);
        let framed = String::from_utf8(frame(&header(), InputFormat::Raw, &line)).unwrap();

        let (len, rest) = framed.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), rest.len());
        assert!(rest.starts_with("<190>1 2013-07-22T00:06:26.000000+00:00 shuttle token"));
        assert!(rest.ends_with("hello\n"));
    }

    #[test]
    fn rfc5424_line_is_only_length_prefixed() {
        let raw = b"<174>1 2013-07-22T00:06:26-00:00 host app proc - hi\n".to_vec();
        let line = LogLine::new(raw.clone(), Utc::now());
        let framed = frame(&header(), InputFormat::Rfc5424, &line);

        let text = String::from_utf8(framed).unwrap();
        let (len, rest) = text.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), raw.len());
        assert_eq!(rest.as_bytes(), &raw[..]);
    }
}
