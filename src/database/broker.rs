//! Bounded, role-aware access to the store
//!
//! The broker owns the single database instance and hands out scoped
//! [`StoreHandle`]s. At most `max_connections` handles are held at once,
//! readers and writer combined, and at most one of them is a writer. Readers
//! are never blocked by the writer beyond the shared slot limit.
//!
//! Acquisition that cannot complete within the per-attempt timeout is retried
//! with exponential backoff. Timing goes through the [`Clock`] trait so the
//! retry schedule can be exercised without real sleeps.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duckdb::Connection;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::duckdb::{StoreLocation, StoreOptions, count_rows, open_store, query_json, table_exists};
use super::guard::ensure_read_only;
use super::{DatabaseError, DatabaseResult, QueryResult};

/// Access role requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reporting access; statements are restricted to queries
    Reader,
    /// Exclusive write access used by the pipeline
    Writer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

/// Source of delays for acquisition timeouts and backoff
#[async_trait]
pub trait Clock: Send + Sync {
    /// Resolve after `duration` has elapsed
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Randomisation applied to each backoff delay
#[derive(Clone, Default)]
pub enum Jitter {
    /// Delays are used as computed
    #[default]
    None,
    /// Add a uniformly distributed amount in `[0, max]`
    Uniform(Duration),
    /// Map the computed delay to the delay actually slept
    Custom(Arc<dyn Fn(Duration) -> Duration + Send + Sync>),
}

impl Jitter {
    fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Uniform(max) if max.is_zero() => delay,
            Jitter::Uniform(max) => {
                let extra = rand::thread_rng().gen_range(0.0..=max.as_secs_f64());
                delay + Duration::from_secs_f64(extra)
            }
            Jitter::Custom(f) => f(delay),
        }
    }
}

impl std::fmt::Debug for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Jitter::None => write!(f, "None"),
            Jitter::Uniform(max) => f.debug_tuple("Uniform").field(max).finish(),
            Jitter::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Exponential backoff between acquisition attempts
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Randomisation added on top
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Jitter::Uniform(Duration::from_secs(1)),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // f64::min discards NaN, so 0 * inf still lands on the cap
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        self.jitter.apply(Duration::from_secs_f64(capped))
    }
}

/// Broker settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum concurrently held handles, readers and writer combined
    pub max_connections: usize,
    /// Per-attempt wait used by `acquire_reader`/`acquire_writer`
    pub acquire_timeout: Duration,
    /// Retries after the first attempt used by `acquire_reader`/`acquire_writer`
    pub max_retries: u32,
    /// Delay schedule between attempts
    pub backoff: BackoffPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            acquire_timeout: Duration::from_secs(10),
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Error type for handle acquisition
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Every attempt timed out or failed
    #[error("Timed out acquiring {role} handle after {attempts} attempts: {last_error}")]
    AcquisitionTimeout {
        role: Role,
        attempts: u32,
        last_error: String,
    },

    /// A writer was requested from a broker opened read-only
    #[error("Store is opened read-only; writer handles are unavailable")]
    ReadOnlyStore,

    /// The slot semaphore was closed
    #[error("Broker is closed")]
    Closed,

    /// Opening the store or cloning a connection failed
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    held: AtomicUsize,
    peak_held: AtomicUsize,
}

/// Snapshot of the broker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// `acquire` calls made
    pub total_acquisitions: u64,
    /// `acquire` calls that returned a handle
    pub successful_acquisitions: u64,
    /// Backoff sleeps taken between attempts
    pub retries: u64,
    /// `acquire` calls that gave up
    pub failures: u64,
    /// Handles alive right now
    pub currently_held: usize,
    /// Highest number of handles alive at once
    pub peak_held: usize,
    /// Configured slot limit
    pub max_connections: usize,
}

/// Mediator for every access to the store
pub struct ConnectionBroker {
    location: StoreLocation,
    read_only: bool,
    root: Mutex<Connection>,
    slots: Arc<Semaphore>,
    writer: Arc<tokio::sync::Mutex<()>>,
    counters: Arc<Counters>,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("location", &self.location)
            .field("read_only", &self.read_only)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionBroker {
    /// Open the store at `location` and create a broker for it
    pub fn open(
        location: StoreLocation,
        options: &StoreOptions,
        config: BrokerConfig,
    ) -> BrokerResult<Self> {
        if config.max_connections == 0 {
            return Err(DatabaseError::ConfigError(
                "max_connections must be at least 1".to_string(),
            )
            .into());
        }

        let root = open_store(&location, options)?;
        info!(
            "Opened store {} ({}, {} slots)",
            location,
            if options.read_only { "read-only" } else { "read-write" },
            config.max_connections
        );

        Ok(Self {
            location,
            read_only: options.read_only,
            root: Mutex::new(root),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            counters: Arc::new(Counters::default()),
            config,
            clock: Arc::new(TokioClock),
        })
    }

    /// Broker over a private in-memory store
    pub fn in_memory(config: BrokerConfig) -> BrokerResult<Self> {
        Self::open(StoreLocation::InMemory, &StoreOptions::default(), config)
    }

    /// Replace the clock used for timeouts and backoff
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Reader handle using the configured timeout and retry budget
    pub async fn acquire_reader(&self) -> BrokerResult<StoreHandle> {
        self.acquire(Role::Reader, self.config.acquire_timeout, self.config.max_retries)
            .await
    }

    /// Writer handle using the configured timeout and retry budget
    pub async fn acquire_writer(&self) -> BrokerResult<StoreHandle> {
        self.acquire(Role::Writer, self.config.acquire_timeout, self.config.max_retries)
            .await
    }

    /// Acquire a handle for `role`
    ///
    /// Makes one attempt plus up to `max_retries` retries. Each attempt waits
    /// at most `timeout` for a free slot (and, for writers, for the writer
    /// lock). The handle releases its slot when dropped.
    pub async fn acquire(
        &self,
        role: Role,
        timeout: Duration,
        max_retries: u32,
    ) -> BrokerResult<StoreHandle> {
        if role == Role::Writer && self.read_only {
            return Err(BrokerError::ReadOnlyStore);
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                result = self.try_acquire(role) => Some(result),
                _ = self.clock.sleep(timeout) => None,
            };

            let last_error = match outcome {
                Some(Ok(handle)) => {
                    self.counters.successful.fetch_add(1, Ordering::Relaxed);
                    debug!("Acquired {} handle on attempt {}", role, attempts);
                    return Ok(handle);
                }
                Some(Err(BrokerError::Closed)) => return Err(BrokerError::Closed),
                Some(Err(e)) => e.to_string(),
                None => format!("no {} slot free within {:?}", role, timeout),
            };

            if attempts > max_retries {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Giving up on {} handle after {} attempts: {}",
                    role, attempts, last_error
                );
                return Err(BrokerError::AcquisitionTimeout {
                    role,
                    attempts,
                    last_error,
                });
            }

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.backoff.delay_for(attempts);
            warn!(
                "Attempt {} for {} handle failed ({}); retrying in {:?}",
                attempts, role, last_error, delay
            );
            self.clock.sleep(delay).await;
        }
    }

    async fn try_acquire(&self, role: Role) -> BrokerResult<StoreHandle> {
        // The writer lock is taken before a slot so a waiting writer does not
        // sit on a slot readers could use.
        let writer_guard = match role {
            Role::Writer => Some(Arc::clone(&self.writer).lock_owned().await),
            Role::Reader => None,
        };

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::Closed)?;

        let connection = {
            let root = self.root.lock().map_err(|_| {
                DatabaseError::ConnectionFailed("store connection lock poisoned".to_string())
            })?;
            root.try_clone().map_err(|e| {
                DatabaseError::ConnectionFailed(format!("Failed to open connection: {}", e))
            })?
        };

        let held = self.counters.held.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_held.fetch_max(held, Ordering::SeqCst);

        Ok(StoreHandle {
            connection,
            role,
            counters: Arc::clone(&self.counters),
            _writer: writer_guard,
            _permit: permit,
        })
    }

    /// Current counter values
    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            total_acquisitions: c.total.load(Ordering::Relaxed),
            successful_acquisitions: c.successful.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            currently_held: c.held.load(Ordering::SeqCst),
            peak_held: c.peak_held.load(Ordering::SeqCst),
            max_connections: self.config.max_connections,
        }
    }
}

/// Scoped access to the store
///
/// Dropping the handle frees its slot and, for writers, the writer lock.
pub struct StoreHandle {
    connection: Connection,
    role: Role,
    counters: Arc<Counters>,
    _writer: Option<OwnedMutexGuard<()>>,
    _permit: OwnedSemaphorePermit,
}

impl StoreHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Run a query and return its rows as JSON
    ///
    /// Reader handles only accept single read-only statements.
    pub fn query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        if self.role == Role::Reader {
            ensure_read_only(sql)?;
        }
        query_json(&self.connection, sql)
    }

    pub fn table_exists(&self, table: &str) -> DatabaseResult<bool> {
        table_exists(&self.connection, table)
    }

    pub fn count_rows(&self, table: &str) -> DatabaseResult<u64> {
        count_rows(&self.connection, table)
    }

    /// Raw connection for loading and rebuilding; writers only
    pub fn connection(&self) -> DatabaseResult<&Connection> {
        match self.role {
            Role::Writer => Ok(&self.connection),
            Role::Reader => Err(DatabaseError::ReadOnlyViolation(
                "reader handles do not expose the raw connection".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        self.counters.held.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_backoff(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(max_ms),
            jitter: Jitter::None,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = fixed_backoff(100, 500);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_uniform_jitter_stays_in_range() {
        let mut policy = fixed_backoff(100, 100);
        policy.jitter = Jitter::Uniform(Duration::from_millis(50));
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_custom_jitter_is_applied() {
        let mut policy = fixed_backoff(100, 1_000);
        policy.jitter = Jitter::Custom(Arc::new(|d| d + Duration::from_millis(7)));
        assert_eq!(policy.delay_for(2), Duration::from_millis(207));
    }

    #[tokio::test]
    async fn test_handles_release_their_slot() {
        let broker = ConnectionBroker::in_memory(BrokerConfig::default()).unwrap();
        {
            let _a = broker.acquire_reader().await.unwrap();
            let _b = broker.acquire_reader().await.unwrap();
            assert_eq!(broker.stats().currently_held, 2);
        }
        let stats = broker.stats();
        assert_eq!(stats.currently_held, 0);
        assert_eq!(stats.peak_held, 2);
        assert_eq!(stats.total_acquisitions, 2);
        assert_eq!(stats.successful_acquisitions, 2);
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let broker = ConnectionBroker::in_memory(BrokerConfig::default()).unwrap();
        {
            let writer = broker.acquire_writer().await.unwrap();
            writer
                .connection()
                .unwrap()
                .execute_batch("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }

        let reader = broker.acquire_reader().await.unwrap();
        assert!(reader.connection().is_err());
        assert!(matches!(
            reader.query("DELETE FROM t"),
            Err(DatabaseError::ReadOnlyViolation(_))
        ));
        assert_eq!(reader.query("SELECT a FROM t").unwrap().row_count(), 1);
        assert_eq!(reader.count_rows("t").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_only_broker_refuses_writers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.duckdb");
        {
            let broker = ConnectionBroker::open(
                StoreLocation::File(path.clone()),
                &StoreOptions::default(),
                BrokerConfig::default(),
            )
            .unwrap();
            let writer = broker.acquire_writer().await.unwrap();
            writer
                .connection()
                .unwrap()
                .execute_batch("CREATE TABLE t (a INTEGER)")
                .unwrap();
        }

        let options = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        let broker =
            ConnectionBroker::open(StoreLocation::File(path), &options, BrokerConfig::default())
                .unwrap();
        assert!(broker.is_read_only());
        assert!(matches!(
            broker.acquire_writer().await,
            Err(BrokerError::ReadOnlyStore)
        ));
        assert!(broker.acquire_reader().await.unwrap().table_exists("t").unwrap());
    }

    #[test]
    fn test_zero_slots_is_rejected() {
        let config = BrokerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(
            ConnectionBroker::in_memory(config),
            Err(BrokerError::Database(DatabaseError::ConfigError(_)))
        ));
    }
}
