//! How the supervisor starts workers. [`ProcessSpawner`] re-executes the
//! current binary with the `worker` subcommand; [`TaskSpawner`] runs the unit
//! on the local runtime and is what the integration tests drive.

use crate::chain::ChainReader;
use crate::runtime::config::SyncConfig;
use crate::store::SyncStore;
use crate::worker::{ChannelSink, WorkerId, WorkerLaunch, WorkerSignal, WorkerUnit};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the supervisor hears about its workers, on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Signal(WorkerSignal),
    /// The worker is gone. Not sent after [`WorkerProcess::kill`].
    Exited { id: WorkerId, success: bool },
}

/// Handle to a running worker.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Terminates the worker. No further events are delivered for it.
    fn kill(&mut self);
}

pub trait WorkerSpawner: Send {
    fn spawn(
        &mut self,
        launch: WorkerLaunch,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Box<dyn WorkerProcess>>;

    /// Resolves once every worker spawned so far is gone. Only meaningful
    /// after all handles were killed or dropped.
    fn wait_stopped(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

struct KillHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl WorkerProcess for KillHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self) {
        self.kill.cancel();
    }
}

impl Drop for KillHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

pub struct ProcessSpawner {
    program: PathBuf,
    env: Vec<(&'static str, String)>,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessSpawner {
    /// Workers inherit `config` through `BLOCKSYNC_*` variables so CLI
    /// overrides reach them too.
    pub fn new(program: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        Self {
            program: program.into(),
            env: config.to_env_vars(),
            pumps: Vec::new(),
        }
    }

    pub fn current_exe(config: &SyncConfig) -> Result<Self> {
        let program = std::env::current_exe().context("failed to locate the current executable")?;
        Ok(Self::new(program, config))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        launch: WorkerLaunch,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let id = launch.id;
        let mut line = launch.encode()?;
        line.push('\n');

        let mut child = Command::new(&self.program)
            .arg("worker")
            .envs(self.env.iter().map(|(key, value)| (*key, value.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!("failed to spawn worker {id} from {}", self.program.display())
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .context("worker stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("worker stdout was not captured")?;

        tokio::spawn(async move {
            if let Err(err) = write_launch(stdin, line).await {
                tracing::warn!(worker = id, error = %err, "failed to hand launch parameters to worker");
            }
        });

        let kill = CancellationToken::new();
        self.pumps.retain(|pump| !pump.is_finished());
        self.pumps
            .push(tokio::spawn(pump_child(id, child, stdout, events, kill.clone())));

        tracing::debug!(worker = id, pid, "worker process spawned");
        Ok(Box::new(KillHandle { pid, kill }))
    }

    /// Each reader task ends only after its child was reaped.
    fn wait_stopped(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for pump in self.pumps.drain(..) {
                if let Err(err) = pump.await {
                    tracing::warn!(error = %err, "worker reader task failed");
                }
            }
        })
    }
}

async fn write_launch(mut stdin: ChildStdin, line: String) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

/// Single reader per child: preserves signal order, then reports the exit.
async fn pump_child(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::Sender<SupervisorEvent>,
    kill: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        select! {
            biased;
            _ = kill.cancelled() => {
                terminate(id, &mut child).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerSignal::decode(&line) {
                        Ok(signal) if signal.worker_id() == id => {
                            if events.send(SupervisorEvent::Signal(signal)).await.is_err() {
                                terminate(id, &mut child).await;
                                return;
                            }
                        }
                        Ok(signal) => {
                            tracing::warn!(
                                worker = id,
                                claimed = signal.worker_id(),
                                "dropping signal carrying another worker's id"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(worker = id, error = %err, "dropping malformed worker signal");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(worker = id, error = %err, "worker stdout read failed");
                    break;
                }
            }
        }
    }

    let status = select! {
        biased;
        _ = kill.cancelled() => {
            terminate(id, &mut child).await;
            return;
        }
        status = child.wait() => status,
    };

    let success = match status {
        Ok(status) => {
            tracing::debug!(worker = id, %status, "worker process exited");
            status.success()
        }
        Err(err) => {
            tracing::warn!(worker = id, error = %err, "failed to reap worker process");
            false
        }
    };
    let _ = events.send(SupervisorEvent::Exited { id, success }).await;
}

async fn terminate(id: WorkerId, child: &mut Child) {
    if let Err(err) = child.kill().await {
        tracing::debug!(worker = id, error = %err, "worker kill failed; process likely exited");
    }
}

/// Runs each worker as a task on the current runtime, sharing one chain
/// reader and store.
pub struct TaskSpawner {
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn SyncStore>,
    config: SyncConfig,
}

impl TaskSpawner {
    pub fn new(chain: Arc<dyn ChainReader>, store: Arc<dyn SyncStore>, config: SyncConfig) -> Self {
        Self {
            chain,
            store,
            config,
        }
    }
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(
        &mut self,
        launch: WorkerLaunch,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let id = launch.id;
        let kill = CancellationToken::new();
        let unit = WorkerUnit::new(Arc::clone(&self.chain), Arc::clone(&self.store), &self.config)
            .with_cancellation(kill.clone());
        let (signal_tx, signal_rx) = mpsc::channel(64);

        let unit_task = tokio::spawn(async move {
            let mut sink = ChannelSink::new(signal_tx);
            match AssertUnwindSafe(unit.run(&launch, &mut sink))
                .catch_unwind()
                .await
            {
                Ok(Ok(_)) => true,
                Ok(Err(err)) => {
                    tracing::error!(worker = id, error = %format!("{err:#}"), "worker task exited with error");
                    false
                }
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(worker = id, panic = %panic_msg, "worker task panicked");
                    false
                }
            }
        });

        tokio::spawn(forward_task(id, unit_task, signal_rx, events, kill.clone()));
        Ok(Box::new(KillHandle { pid: None, kill }))
    }
}

async fn forward_task(
    id: WorkerId,
    mut unit_task: JoinHandle<bool>,
    mut signals: mpsc::Receiver<WorkerSignal>,
    events: mpsc::Sender<SupervisorEvent>,
    kill: CancellationToken,
) {
    loop {
        select! {
            biased;
            _ = kill.cancelled() => {
                unit_task.abort();
                return;
            }
            signal = signals.recv() => match signal {
                Some(signal) => {
                    if events.send(SupervisorEvent::Signal(signal)).await.is_err() {
                        unit_task.abort();
                        return;
                    }
                }
                None => break,
            }
        }
    }

    let success = select! {
        biased;
        _ = kill.cancelled() => {
            unit_task.abort();
            return;
        }
        joined = &mut unit_task => matches!(joined, Ok(true)),
    };
    let _ = events.send(SupervisorEvent::Exited { id, success }).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
