use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_LOCK_DIR: &str = "./tmp";
const DEFAULT_MAX_PER_WORKER: u64 = 1_000;
const DEFAULT_STALL_THRESHOLD_MS: u64 = 60_000;
const DEFAULT_SUPERVISOR_TICK_MS: u64 = 10_000;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;
const DEFAULT_FETCH_ATTEMPTS: usize = 5;
const DEFAULT_FETCH_INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_FETCH_MAX_BACKOFF_MS: u64 = 5_000;
const DEFAULT_MAX_RECOVERIES: u32 = 3;
const DEFAULT_RICHLIST_SIZE: usize = 100;

const ENV_RPC_URL: &str = "BLOCKSYNC_RPC_URL";
const ENV_RPC_USER: &str = "BLOCKSYNC_RPC_USER";
const ENV_RPC_PASSWORD: &str = "BLOCKSYNC_RPC_PASSWORD";
const ENV_RPC_TIMEOUT_MS: &str = "BLOCKSYNC_RPC_TIMEOUT_MS";
const ENV_DATABASE_URL: &str = "BLOCKSYNC_DATABASE_URL";
const ENV_LOCK_DIR: &str = "BLOCKSYNC_LOCK_DIR";
const ENV_MAX_PER_WORKER: &str = "BLOCKSYNC_MAX_PER_WORKER";
const ENV_POOL_SIZE: &str = "BLOCKSYNC_POOL_SIZE";
const ENV_POOLING: &str = "BLOCKSYNC_POOLING";
const ENV_STALL_THRESHOLD_MS: &str = "BLOCKSYNC_STALL_THRESHOLD_MS";
const ENV_SUPERVISOR_TICK_MS: &str = "BLOCKSYNC_SUPERVISOR_TICK_MS";
const ENV_PROGRESS_INTERVAL_MS: &str = "BLOCKSYNC_PROGRESS_INTERVAL_MS";
const ENV_METRICS_INTERVAL_MS: &str = "BLOCKSYNC_METRICS_INTERVAL_MS";
const ENV_FETCH_ATTEMPTS: &str = "BLOCKSYNC_FETCH_ATTEMPTS";
const ENV_FETCH_INITIAL_BACKOFF_MS: &str = "BLOCKSYNC_FETCH_INITIAL_BACKOFF_MS";
const ENV_FETCH_MAX_BACKOFF_MS: &str = "BLOCKSYNC_FETCH_MAX_BACKOFF_MS";
const ENV_MAX_RECOVERIES: &str = "BLOCKSYNC_MAX_RECOVERIES";
const ENV_RICHLIST_SIZE: &str = "BLOCKSYNC_RICHLIST_SIZE";

/// Runtime configuration shared by the coordinator and its worker processes.
///
/// All instances must be constructed via [`SyncConfig::builder`], [`SyncConfig::new`] or
/// [`SyncConfig::from_env`] so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    rpc_timeout: Duration,
    database_url: String,
    lock_dir: PathBuf,
    max_per_worker: u64,
    pool_size: usize,
    pooling: bool,
    stall_threshold: Duration,
    supervisor_tick: Duration,
    progress_interval: Duration,
    metrics_interval: Duration,
    fetch_attempts: usize,
    fetch_initial_backoff: Duration,
    fetch_max_backoff: Duration,
    max_recoveries: u32,
    richlist_size: usize,
}

#[derive(Debug, Clone)]
pub struct SyncConfigParams {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub rpc_timeout: Duration,
    pub database_url: String,
    pub lock_dir: PathBuf,
    pub max_per_worker: u64,
    pub pool_size: usize,
    pub pooling: bool,
    pub stall_threshold: Duration,
    pub supervisor_tick: Duration,
    pub progress_interval: Duration,
    pub metrics_interval: Duration,
    pub fetch_attempts: usize,
    pub fetch_initial_backoff: Duration,
    pub fetch_max_backoff: Duration,
    pub max_recoveries: u32,
    pub richlist_size: usize,
}

impl SyncConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: SyncConfigParams) -> Result<Self> {
        let SyncConfigParams {
            rpc_url,
            rpc_user,
            rpc_password,
            rpc_timeout,
            database_url,
            lock_dir,
            max_per_worker,
            pool_size,
            pooling,
            stall_threshold,
            supervisor_tick,
            progress_interval,
            metrics_interval,
            fetch_attempts,
            fetch_initial_backoff,
            fetch_max_backoff,
            max_recoveries,
            richlist_size,
        } = params;

        let config = Self {
            rpc_url: trimmed_string(rpc_url),
            rpc_user: trimmed_string(rpc_user),
            rpc_password: trimmed_string(rpc_password),
            rpc_timeout,
            database_url: trimmed_string(database_url),
            lock_dir,
            max_per_worker,
            pool_size,
            pooling,
            stall_threshold,
            supervisor_tick,
            progress_interval,
            metrics_interval,
            fetch_attempts,
            fetch_initial_backoff,
            fetch_max_backoff,
            max_recoveries,
            richlist_size,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads `BLOCKSYNC_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::new(SyncConfigParams::from_env()?)
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::new(SyncConfigParams::from_lookup(lookup)?)
    }
}

impl SyncConfigParams {
    /// Environment values with defaults applied, not yet validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let params = SyncConfigParams {
            rpc_url: read_env_or_default(&lookup, ENV_RPC_URL, "http://127.0.0.1:8332"),
            rpc_user: read_env_or_default(&lookup, ENV_RPC_USER, ""),
            rpc_password: read_env_or_default(&lookup, ENV_RPC_PASSWORD, ""),
            rpc_timeout: parse_millis(&lookup, ENV_RPC_TIMEOUT_MS, DEFAULT_RPC_TIMEOUT_MS)?,
            database_url: read_env_or_default(&lookup, ENV_DATABASE_URL, "sqlite://blocksync.db"),
            lock_dir: PathBuf::from(read_env_or_default(&lookup, ENV_LOCK_DIR, DEFAULT_LOCK_DIR)),
            max_per_worker: parse_env_with_default(
                &lookup,
                ENV_MAX_PER_WORKER,
                DEFAULT_MAX_PER_WORKER,
            )?,
            pool_size: parse_env_with_default(&lookup, ENV_POOL_SIZE, default_pool_size())?,
            pooling: parse_env_with_default(&lookup, ENV_POOLING, true)?,
            stall_threshold: parse_millis(
                &lookup,
                ENV_STALL_THRESHOLD_MS,
                DEFAULT_STALL_THRESHOLD_MS,
            )?,
            supervisor_tick: parse_millis(
                &lookup,
                ENV_SUPERVISOR_TICK_MS,
                DEFAULT_SUPERVISOR_TICK_MS,
            )?,
            progress_interval: parse_millis(
                &lookup,
                ENV_PROGRESS_INTERVAL_MS,
                DEFAULT_PROGRESS_INTERVAL_MS,
            )?,
            metrics_interval: parse_millis(
                &lookup,
                ENV_METRICS_INTERVAL_MS,
                telemetry::DEFAULT_METRICS_INTERVAL.as_millis() as u64,
            )?,
            fetch_attempts: parse_env_with_default(
                &lookup,
                ENV_FETCH_ATTEMPTS,
                DEFAULT_FETCH_ATTEMPTS,
            )?,
            fetch_initial_backoff: parse_millis(
                &lookup,
                ENV_FETCH_INITIAL_BACKOFF_MS,
                DEFAULT_FETCH_INITIAL_BACKOFF_MS,
            )?,
            fetch_max_backoff: parse_millis(
                &lookup,
                ENV_FETCH_MAX_BACKOFF_MS,
                DEFAULT_FETCH_MAX_BACKOFF_MS,
            )?,
            max_recoveries: parse_env_with_default(
                &lookup,
                ENV_MAX_RECOVERIES,
                DEFAULT_MAX_RECOVERIES,
            )?,
            richlist_size: parse_env_with_default(
                &lookup,
                ENV_RICHLIST_SIZE,
                DEFAULT_RICHLIST_SIZE,
            )?,
        };

        Ok(params)
    }
}

impl SyncConfig {
    /// Environment that reproduces this configuration in a worker process.
    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_RPC_URL, self.rpc_url.clone()),
            (ENV_RPC_USER, self.rpc_user.clone()),
            (ENV_RPC_PASSWORD, self.rpc_password.clone()),
            (ENV_RPC_TIMEOUT_MS, millis(self.rpc_timeout)),
            (ENV_DATABASE_URL, self.database_url.clone()),
            (ENV_LOCK_DIR, self.lock_dir.display().to_string()),
            (ENV_MAX_PER_WORKER, self.max_per_worker.to_string()),
            (ENV_POOL_SIZE, self.pool_size.to_string()),
            (ENV_POOLING, self.pooling.to_string()),
            (ENV_STALL_THRESHOLD_MS, millis(self.stall_threshold)),
            (ENV_SUPERVISOR_TICK_MS, millis(self.supervisor_tick)),
            (ENV_PROGRESS_INTERVAL_MS, millis(self.progress_interval)),
            (ENV_METRICS_INTERVAL_MS, millis(self.metrics_interval)),
            (ENV_FETCH_ATTEMPTS, self.fetch_attempts.to_string()),
            (ENV_FETCH_INITIAL_BACKOFF_MS, millis(self.fetch_initial_backoff)),
            (ENV_FETCH_MAX_BACKOFF_MS, millis(self.fetch_max_backoff)),
            (ENV_MAX_RECOVERIES, self.max_recoveries.to_string()),
            (ENV_RICHLIST_SIZE, self.richlist_size.to_string()),
        ]
    }

    /// Decomposes the configuration so callers can override fields and
    /// revalidate through [`SyncConfig::new`].
    pub fn into_params(self) -> SyncConfigParams {
        SyncConfigParams {
            rpc_url: self.rpc_url,
            rpc_user: self.rpc_user,
            rpc_password: self.rpc_password,
            rpc_timeout: self.rpc_timeout,
            database_url: self.database_url,
            lock_dir: self.lock_dir,
            max_per_worker: self.max_per_worker,
            pool_size: self.pool_size,
            pooling: self.pooling,
            stall_threshold: self.stall_threshold,
            supervisor_tick: self.supervisor_tick,
            progress_interval: self.progress_interval,
            metrics_interval: self.metrics_interval,
            fetch_attempts: self.fetch_attempts,
            fetch_initial_backoff: self.fetch_initial_backoff,
            fetch_max_backoff: self.fetch_max_backoff,
            max_recoveries: self.max_recoveries,
            richlist_size: self.richlist_size,
        }
    }

    /// Full RPC URL (including scheme) of the ledger node.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn rpc_user(&self) -> &str {
        &self.rpc_user
    }

    pub fn rpc_password(&self) -> &str {
        &self.rpc_password
    }

    /// Per-RPC timeout applied to the JSON-RPC client.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Directory holding the `<job_kind>.pid` lock markers.
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Upper bound on heights handed to one worker when pooling is enabled.
    pub fn max_per_worker(&self) -> u64 {
        self.max_per_worker
    }

    /// Maximum number of concurrently running worker processes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn pooling(&self) -> bool {
        self.pooling
    }

    /// Heartbeat silence after which a worker is considered stalled.
    pub fn stall_threshold(&self) -> Duration {
        self.stall_threshold
    }

    pub fn supervisor_tick(&self) -> Duration {
        self.supervisor_tick
    }

    /// Minimum spacing between progress signals emitted by a worker.
    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Attempts per height before a worker aborts.
    pub fn fetch_attempts(&self) -> usize {
        self.fetch_attempts
    }

    pub fn fetch_initial_backoff(&self) -> Duration {
        self.fetch_initial_backoff
    }

    pub fn fetch_max_backoff(&self) -> Duration {
        self.fetch_max_backoff
    }

    /// Respawns allowed per partition before it is abandoned.
    pub fn max_recoveries(&self) -> u32 {
        self.max_recoveries
    }

    /// Entries kept in each ranking view.
    pub fn richlist_size(&self) -> usize {
        self.richlist_size
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;
        ensure_not_empty(&self.rpc_user, "rpc_user")?;
        ensure_not_empty(&self.rpc_password, "rpc_password")?;
        ensure_not_empty(&self.database_url, "database_url")?;

        if self.lock_dir.as_os_str().is_empty() {
            bail!("lock_dir cannot be empty");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.max_per_worker == 0 {
            bail!("max_per_worker must be greater than 0");
        }

        if self.pool_size == 0 {
            bail!("pool_size must be greater than 0");
        }

        if self.stall_threshold.is_zero() {
            bail!("stall_threshold must be greater than 0");
        }

        if self.supervisor_tick.is_zero() {
            bail!("supervisor_tick must be greater than 0");
        }

        if self.progress_interval.is_zero() {
            bail!("progress_interval must be greater than 0");
        }

        if self.progress_interval >= self.stall_threshold {
            bail!(
                "progress_interval ({:?}) must be shorter than stall_threshold ({:?})",
                self.progress_interval,
                self.stall_threshold
            );
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.fetch_attempts == 0 {
            bail!("fetch_attempts must be greater than 0");
        }

        if self.fetch_max_backoff < self.fetch_initial_backoff {
            bail!("fetch_max_backoff must be at least fetch_initial_backoff");
        }

        if self.richlist_size == 0 {
            bail!("richlist_size must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SyncConfigBuilder {
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    rpc_timeout: Option<Duration>,
    database_url: Option<String>,
    lock_dir: Option<PathBuf>,
    max_per_worker: Option<u64>,
    pool_size: Option<usize>,
    pooling: Option<bool>,
    stall_threshold: Option<Duration>,
    supervisor_tick: Option<Duration>,
    progress_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    fetch_attempts: Option<usize>,
    fetch_initial_backoff: Option<Duration>,
    fetch_max_backoff: Option<Duration>,
    max_recoveries: Option<u32>,
    richlist_size: Option<usize>,
}

impl SyncConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_user(mut self, user: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self
    }

    pub fn rpc_password(mut self, password: impl Into<String>) -> Self {
        self.rpc_password = Some(password.into());
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn max_per_worker(mut self, cap: u64) -> Self {
        self.max_per_worker = Some(cap);
        self
    }

    pub fn pool_size(mut self, workers: usize) -> Self {
        self.pool_size = Some(workers);
        self
    }

    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = Some(enabled);
        self
    }

    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = Some(threshold);
        self
    }

    pub fn supervisor_tick(mut self, tick: Duration) -> Self {
        self.supervisor_tick = Some(tick);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn fetch_attempts(mut self, attempts: usize) -> Self {
        self.fetch_attempts = Some(attempts);
        self
    }

    pub fn fetch_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.fetch_initial_backoff = Some(initial);
        self.fetch_max_backoff = Some(max);
        self
    }

    pub fn max_recoveries(mut self, recoveries: u32) -> Self {
        self.max_recoveries = Some(recoveries);
        self
    }

    pub fn richlist_size(mut self, size: usize) -> Self {
        self.richlist_size = Some(size);
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        let params = SyncConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_user: self.rpc_user.context("rpc_user is required")?,
            rpc_password: self.rpc_password.context("rpc_password is required")?,
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS)),
            database_url: self.database_url.context("database_url is required")?,
            lock_dir: self
                .lock_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_DIR)),
            max_per_worker: self.max_per_worker.unwrap_or(DEFAULT_MAX_PER_WORKER),
            pool_size: self.pool_size.unwrap_or_else(default_pool_size),
            pooling: self.pooling.unwrap_or(true),
            stall_threshold: self
                .stall_threshold
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_STALL_THRESHOLD_MS)),
            supervisor_tick: self
                .supervisor_tick
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_SUPERVISOR_TICK_MS)),
            progress_interval: self
                .progress_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            fetch_attempts: self.fetch_attempts.unwrap_or(DEFAULT_FETCH_ATTEMPTS),
            fetch_initial_backoff: self
                .fetch_initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FETCH_INITIAL_BACKOFF_MS)),
            fetch_max_backoff: self
                .fetch_max_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_FETCH_MAX_BACKOFF_MS)),
            max_recoveries: self.max_recoveries.unwrap_or(DEFAULT_MAX_RECOVERIES),
            richlist_size: self.richlist_size.unwrap_or(DEFAULT_RICHLIST_SIZE),
        };

        SyncConfig::new(params)
    }
}

fn default_pool_size() -> usize {
    num_cpus::get().max(1)
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}

fn read_env_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        _ => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, key: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_env_with_default(lookup, key, default_ms).map(Duration::from_millis)
}
