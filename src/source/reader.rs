use std::io;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::batch::{Batch, LogLine};
use crate::config::Config;
use crate::metrics::parser;
use crate::metrics::receiver::Receiver;
use crate::stats::Stats;

/// Reads `\n`-delimited lines from one input stream, fills size- and
/// time-bounded batches, and hands sealed batches to the outlet
/// channel. Every line is also offered to the metric receiver before it
/// is batched. The batch deadline is armed exactly while the current
/// batch is non-empty.
pub struct LogLineReader {
    batch_size: usize,
    wait: Duration,
    max_line_length: usize,
    drop: bool,
    out: flume::Sender<Batch>,
    receiver: Arc<Receiver>,
    stats: Arc<Stats>,
    shutdown: watch::Receiver<bool>,
}

impl LogLineReader {
    pub fn new(
        config: &Config,
        out: flume::Sender<Batch>,
        receiver: Arc<Receiver>,
        stats: Arc<Stats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            batch_size: config.batch_size,
            wait: config.wait_duration,
            max_line_length: config.max_line_length,
            drop: config.drop,
            out,
            receiver,
            stats,
            shutdown,
        }
    }

    /// Run until the input reaches EOF or the shuttle signals shutdown.
    /// The partial batch in hand is flushed on either exit.
    pub async fn read_lines<R>(self, input: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut input = BufReader::new(input);
        // Survives cancelled reads; a complete line is taken out whole.
        let mut buf: Vec<u8> = Vec::new();
        let mut batch = Batch::new(self.batch_size);
        let mut fill_started = Instant::now();
        let mut shutdown = self.shutdown.clone();

        let mut deadline = pin!(tokio::time::sleep(self.wait));
        let mut armed = false;

        loop {
            tokio::select! {
                read = input.read_until(b'\n', &mut buf) => {
                    let n = read?;
                    if n == 0 {
                        if !buf.is_empty() {
                            let line = std::mem::take(&mut buf);
                            self.handle_line(line, &mut batch, &mut fill_started, &mut armed, deadline.as_mut())
                                .await;
                        }
                        self.deliver_or_drop(&mut batch, fill_started.elapsed()).await;
                        return Ok(());
                    }
                    let line = std::mem::take(&mut buf);
                    self.handle_line(line, &mut batch, &mut fill_started, &mut armed, deadline.as_mut())
                        .await;
                }
                _ = deadline.as_mut(), if armed => {
                    self.deliver_or_drop(&mut batch, self.wait).await;
                    armed = false;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.deliver_or_drop(&mut batch, fill_started.elapsed()).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_line(
        &self,
        line: Vec<u8>,
        batch: &mut Batch,
        fill_started: &mut Instant,
        armed: &mut bool,
        deadline: std::pin::Pin<&mut tokio::time::Sleep>,
    ) {
        Stats::incr(&self.stats.lines_read, 1);
        let line = self.truncate(line);

        // Parser branch: bounded by the receiver's own policy, never by
        // outlet latency.
        if parser::has_directives(&line) {
            self.receiver.receive(line.clone()).await;
        }

        if batch.is_empty() {
            *fill_started = Instant::now();
            deadline.reset(tokio::time::Instant::now() + self.wait);
            *armed = true;
        }
        if batch.add(LogLine::new(line, Utc::now())) {
            self.deliver_or_drop(batch, fill_started.elapsed()).await;
            *armed = false;
        }
    }

    /// Overlong lines are cut at the boundary; the discarded remainder
    /// is accounted as one read-and-dropped line so the counter ledger
    /// still balances at EOF.
    fn truncate(&self, line: Vec<u8>) -> Vec<u8> {
        if line.len() <= self.max_line_length {
            return line;
        }
        Stats::incr(&self.stats.lines_read, 1);
        Stats::incr(&self.stats.lines_dropped, 1);
        let mut truncated = line[..self.max_line_length].to_vec();
        truncated.push(b'\n');
        truncated
    }

    /// Seal and hand off the current batch, honoring the drop-or-block
    /// switch. A no-op on an empty batch (a timer can race a full-add
    /// delivery).
    async fn deliver_or_drop(&self, batch: &mut Batch, fill: Duration) {
        if batch.is_empty() {
            return;
        }
        let sealed = std::mem::replace(batch, Batch::new(self.batch_size));
        let count = sealed.msg_count() as u64;

        if self.drop {
            match self.out.try_send(sealed) {
                Ok(()) => Stats::incr(&self.stats.lines_batched, count),
                Err(_) => {
                    Stats::incr(&self.stats.lines_dropped, count);
                    Stats::incr(&self.stats.drops, 1);
                    debug!(lines = count, "batch channel full, dropped batch");
                }
            }
        } else if self.out.send_async(sealed).await.is_ok() {
            Stats::incr(&self.stats.lines_batched, count);
        } else {
            Stats::incr(&self.stats.lines_dropped, count);
        }
        self.stats.record_batch_fill(fill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::metchan::Metchan;
    use crate::metrics::store::MemStore;

    fn fixtures(config: &Config) -> (Arc<Receiver>, Arc<Stats>, watch::Sender<bool>, watch::Receiver<bool>) {
        let store = Arc::new(MemStore::new());
        let mchan = Arc::new(Metchan::new(config).unwrap());
        let receiver = Arc::new(Receiver::new(config, store, mchan));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (receiver, Stats::new(), shutdown_tx, shutdown_rx)
    }

    fn reader_with(
        config: &Config,
        out: flume::Sender<Batch>,
    ) -> (LogLineReader, Arc<Stats>, watch::Sender<bool>) {
        let (receiver, stats, shutdown_tx, shutdown_rx) = fixtures(config);
        let reader = LogLineReader::new(config, out, receiver, stats.clone(), shutdown_rx);
        (reader, stats, shutdown_tx)
    }

    #[tokio::test]
    async fn batches_by_size_then_flushes_remainder_on_timeout() {
        let config = Config {
            batch_size: 2,
            wait_duration: Duration::from_millis(20),
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let (mut writer, input) = tokio::io::duplex(256);
        let task = tokio::spawn(reader.read_lines(input));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"a\nb\nc\n")
            .await
            .unwrap();

        let first = rx.recv_async().await.unwrap();
        assert_eq!(first.msg_count(), 2);
        assert_eq!(first.lines()[0].line, b"a\n");
        assert_eq!(first.lines()[1].line, b"b\n");

        // Third line rides the timer, not a fourth input line.
        let second = rx.recv_async().await.unwrap();
        assert_eq!(second.msg_count(), 1);
        assert_eq!(second.lines()[0].line, b"c\n");

        drop(writer);
        task.await.unwrap().unwrap();

        assert_eq!(stats.lines_read(), 3);
        assert_eq!(stats.lines_batched(), 3);
        assert_eq!(stats.lines_dropped(), 0);
    }

    #[tokio::test]
    async fn idle_timer_delivers_nothing() {
        let config = Config {
            batch_size: 2,
            wait_duration: Duration::from_millis(10),
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let (writer, input) = tokio::io::duplex(64);
        let task = tokio::spawn(reader.read_lines(input));

        // Several timer periods pass with no input.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.is_empty());
        assert_eq!(stats.lines_read(), 0);

        drop(writer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eof_flushes_the_partial_batch() {
        let config = Config {
            batch_size: 10,
            wait_duration: Duration::from_secs(60),
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let input = std::io::Cursor::new(b"only\n".to_vec());
        reader.read_lines(input).await.unwrap();

        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.msg_count(), 1);
        assert_eq!(stats.lines_read(), stats.lines_batched() + stats.lines_dropped());
    }

    #[tokio::test]
    async fn file_backed_stream_reads_to_eof() {
        use std::io::Write;
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(temp_file, "first from file").unwrap();
        writeln!(temp_file, "second from file").unwrap();
        temp_file.flush().unwrap();

        let config = Config {
            batch_size: 10,
            wait_duration: Duration::from_secs(60),
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let file = tokio::fs::File::open(temp_file.path()).await.unwrap();
        reader.read_lines(file).await.unwrap();

        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.msg_count(), 2);
        assert_eq!(batch.lines()[0].line, b"first from file\n");
        assert_eq!(stats.lines_read(), 2);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_read() {
        let config = Config::default();
        let (tx, rx) = flume::bounded(8);
        let (reader, _stats, _shutdown) = reader_with(&config, tx);

        let input = std::io::Cursor::new(b"a\nno-terminator".to_vec());
        reader.read_lines(input).await.unwrap();

        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.msg_count(), 2);
        assert_eq!(batch.lines()[1].line, b"no-terminator");
    }

    #[tokio::test]
    async fn drop_policy_drops_when_channel_full() {
        let config = Config {
            batch_size: 1,
            back_buff: 0,
            drop: true,
            ..Config::default()
        };
        // Rendezvous channel: a hand-off succeeds only while a consumer
        // is parked in recv.
        let (tx, rx) = flume::bounded(0);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let consumer = tokio::spawn(async move {
            let batch = rx.recv_async().await.unwrap();
            // Park without consuming further batches.
            tokio::time::sleep(Duration::from_secs(60)).await;
            batch
        });
        // Let the consumer park first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let input = std::io::Cursor::new(b"x\ny\n".to_vec());
        reader.read_lines(input).await.unwrap();

        assert_eq!(stats.lines_read(), 2);
        assert_eq!(stats.lines_batched(), 1);
        assert_eq!(stats.lines_dropped(), 1);
        consumer.abort();
    }

    #[tokio::test]
    async fn block_policy_applies_back_pressure() {
        let config = Config {
            batch_size: 1,
            drop: false,
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(0);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let input = std::io::Cursor::new(b"x\ny\n".to_vec());
        let task = tokio::spawn(reader.read_lines(input));

        // Nothing consumed yet: the reader must be parked on hand-off,
        // not dropping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(stats.lines_dropped(), 0);

        // Resuming the consumer unblocks it.
        assert_eq!(rx.recv_async().await.unwrap().lines()[0].line, b"x\n");
        assert_eq!(rx.recv_async().await.unwrap().lines()[0].line, b"y\n");
        task.await.unwrap().unwrap();
        assert_eq!(stats.lines_batched(), 2);
    }

    #[tokio::test]
    async fn overlong_line_truncates_and_keeps_ledger_balanced() {
        let config = Config {
            batch_size: 10,
            max_line_length: 8,
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, stats, _shutdown) = reader_with(&config, tx);

        let input = std::io::Cursor::new(b"0123456789abcdef\n".to_vec());
        reader.read_lines(input).await.unwrap();

        let batch = rx.recv_async().await.unwrap();
        assert_eq!(batch.lines()[0].line, b"01234567\n");
        assert_eq!(stats.lines_read(), 2);
        assert_eq!(stats.lines_read(), stats.lines_batched() + stats.lines_dropped());
    }

    #[tokio::test]
    async fn shutdown_flushes_and_exits() {
        let config = Config {
            batch_size: 10,
            wait_duration: Duration::from_secs(60),
            ..Config::default()
        };
        let (tx, rx) = flume::bounded(8);
        let (reader, _stats, shutdown_tx) = reader_with(&config, tx);

        let (mut writer, input) = tokio::io::duplex(64);
        let task = tokio::spawn(reader.read_lines(input));
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"pending\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(rx.recv_async().await.unwrap().msg_count(), 1);
    }
}
