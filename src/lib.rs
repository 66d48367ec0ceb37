pub mod chain;
pub mod coordinator;
pub mod job;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod worker;

pub use chain::{ChainError, ChainReader, LedgerBlock, MemoryChain};
pub use coordinator::finalize::{FinalizeReport, Finalizer};
pub use coordinator::lock::{LockGuard, LockManager};
pub use coordinator::plan::{PartitionPlan, Span, WorkSet};
pub use coordinator::spawner::{
    ProcessSpawner, SupervisorEvent, TaskSpawner, WorkerProcess, WorkerSpawner,
};
pub use coordinator::supervisor::{SupervisionOutcome, Supervisor};
pub use coordinator::RunPhase;
pub use job::{Assignment, SyncJob, SyncMode};
pub use rpc::RpcChainReader;
pub use runtime::config::{SyncConfig, SyncConfigBuilder, SyncConfigParams};
pub use runtime::error::SyncError;
pub use runtime::runner::{RunOutcome, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{MemoryStore, SqliteStore, SyncStore};
pub use worker::{SignalSink, WorkerLaunch, WorkerSignal, WorkerUnit};
