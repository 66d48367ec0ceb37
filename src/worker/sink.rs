use super::signal::WorkerSignal;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::mpsc;

/// Destination of a worker's signals.
pub trait SignalSink: Send {
    fn emit(&mut self, signal: WorkerSignal) -> BoxFuture<'_, Result<()>>;
}

/// Writes one JSON line per signal to the process stdout.
pub struct StdoutSink {
    stdout: Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            stdout: tokio::io::stdout(),
        }
    }

    async fn write_line(&mut self, signal: WorkerSignal) -> Result<()> {
        let mut line = signal.encode()?;
        line.push('\n');
        self.stdout
            .write_all(line.as_bytes())
            .await
            .context("failed to write worker signal")?;
        self.stdout
            .flush()
            .await
            .context("failed to flush worker signal")
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSink for StdoutSink {
    fn emit(&mut self, signal: WorkerSignal) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_line(signal))
    }
}

/// Forwards signals over a channel; used for workers running as tasks.
pub struct ChannelSink {
    tx: mpsc::Sender<WorkerSignal>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<WorkerSignal>) -> Self {
        Self { tx }
    }
}

impl SignalSink for ChannelSink {
    fn emit(&mut self, signal: WorkerSignal) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tx
                .send(signal)
                .await
                .map_err(|_| anyhow!("signal receiver dropped"))
        })
    }
}
