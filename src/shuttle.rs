use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::batch::Batch;
use crate::config::{Config, ConfigError};
use crate::format::Formatter;
use crate::metrics::metchan::Metchan;
use crate::metrics::outlet::DataDogOutlet;
use crate::metrics::reader::MetricReader;
use crate::metrics::receiver::Receiver;
use crate::metrics::store::MemStore;
use crate::outlet::LogOutlet;
use crate::source::reader::LogLineReader;
use crate::stats::{self, Stats};

#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Owns the whole pipeline: readers feed the batch channel, the log
/// outlet pool drains it, and the metric engine runs alongside. All
/// wiring happens at construction so there is no module-level state;
/// tests stand up fresh instances.
pub struct Shuttle {
    config: Config,
    pub stats: Arc<Stats>,
    store: Arc<MemStore>,
    mchan: Arc<Metchan>,
    receiver: Arc<Receiver>,
    log_outlet: Arc<LogOutlet>,
    dd_outlet: DataDogOutlet,
    batches: flume::Sender<Batch>,
    batches_rx: Option<flume::Receiver<Batch>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reader_handles: Vec<JoinHandle<io::Result<()>>>,
    task_handles: Vec<JoinHandle<()>>,
}

impl Shuttle {
    pub fn new(
        config: Config,
        store: Arc<MemStore>,
        mchan: Arc<Metchan>,
    ) -> Result<Self, ShuttleError> {
        let sink = config.validate()?;
        let stats = Stats::new();
        let formatter = Arc::new(Formatter::new(&config, &sink));
        let (batches, batches_rx) = flume::bounded(config.back_buff);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = Arc::new(Receiver::new(&config, store.clone(), mchan.clone()));
        let log_outlet = Arc::new(LogOutlet::new(&config, sink, formatter, stats.clone())?);
        let dd_outlet = DataDogOutlet::new(&config, mchan.clone())?;

        Ok(Self {
            config,
            stats,
            store,
            mchan,
            receiver,
            log_outlet,
            dd_outlet,
            batches,
            batches_rx: Some(batches_rx),
            shutdown_tx,
            shutdown_rx,
            reader_handles: Vec::new(),
            task_handles: Vec::new(),
        })
    }

    /// Shared shutdown signal; collaborators started outside the
    /// shuttle (the metchan loops) land on the same switch.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Attach one input stream; its reader runs until EOF or shutdown.
    pub fn load_reader<R>(&mut self, input: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader = LogLineReader::new(
            &self.config,
            self.batches.clone(),
            self.receiver.clone(),
            self.stats.clone(),
            self.shutdown_rx.clone(),
        );
        self.reader_handles.push(tokio::spawn(reader.read_lines(input)));
    }

    /// Start the outlet pool and the metric pipeline. Idempotent: a
    /// second call finds the batch channel already claimed.
    pub fn launch(&mut self) {
        let Some(batches_rx) = self.batches_rx.take() else {
            return;
        };
        self.task_handles
            .extend(self.log_outlet.clone().start(batches_rx));
        self.task_handles.extend(self.receiver.start());

        let metric_reader =
            MetricReader::new(&self.config, self.store.clone(), self.mchan.clone());
        let (convert_tx, convert_rx) = flume::bounded(self.config.buffer_size);
        self.task_handles
            .extend(metric_reader.start(convert_tx, self.shutdown_rx.clone()));
        self.task_handles
            .extend(self.dd_outlet.start(convert_rx, self.shutdown_rx.clone()));

        if let Some(handle) = stats::spawn_emitter(
            self.stats.clone(),
            self.config.stats_source.clone(),
            self.config.stats_interval,
            self.shutdown_rx.clone(),
        ) {
            self.task_handles.push(handle);
        }
        info!(
            outlets = self.config.num_outlets,
            batch_size = self.config.batch_size,
            "shuttle launched"
        );
    }

    /// Block until every attached reader's `read_lines` returns.
    pub async fn wait_for_readers(&mut self) {
        for handle in self.reader_handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "reader failed"),
                Err(err) => error!(error = %err, "reader panicked"),
            }
        }
    }

    /// Shut the pipeline down: stop readers, close the batch channel,
    /// let the outlets drain, then stop the periodic tasks. Afterwards
    /// no task spawned by the shuttle is live.
    pub async fn land(self) {
        let Shuttle {
            batches,
            shutdown_tx,
            reader_handles,
            task_handles,
            ..
        } = self;

        let _ = shutdown_tx.send(true);
        for handle in reader_handles {
            let _ = handle.await;
        }
        // Last sender gone: outlet workers drain the backlog and exit.
        drop(batches);
        for handle in task_handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker ended abnormally");
            }
        }
        info!("shuttle landed");
    }
}
