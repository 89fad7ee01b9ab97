//! Tests for bounded and role-aware store access

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assessment_warehouse::database::broker::Clock;
use assessment_warehouse::{
    BackoffPolicy, BrokerConfig, BrokerError, ConnectionBroker, DatabaseError, Jitter, Role,
};
use async_trait::async_trait;

/// Clock that records every requested delay and returns immediately
#[derive(Default)]
struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

fn config(max_connections: usize, max_retries: u32) -> BrokerConfig {
    BrokerConfig {
        max_connections,
        acquire_timeout: Duration::from_millis(7),
        max_retries,
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Jitter::None,
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_stay_within_the_limit() {
    let broker = Arc::new(
        ConnectionBroker::in_memory(BrokerConfig {
            max_connections: 3,
            ..BrokerConfig::default()
        })
        .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..12 {
        let broker = Arc::clone(&broker);
        tasks.push(tokio::spawn(async move {
            let reader = broker.acquire_reader().await.unwrap();
            let result = reader.query(&format!("SELECT {} AS n", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            result.rows[0]["n"].as_i64().unwrap()
        }));
    }

    let mut seen = Vec::new();
    for task in tasks {
        seen.push(task.await.unwrap());
    }
    seen.sort();
    assert_eq!(seen, (0..12).collect::<Vec<i64>>());

    let stats = broker.stats();
    assert!(stats.peak_held <= 3, "peak {} exceeded the limit", stats.peak_held);
    assert_eq!(stats.peak_held, 3, "readers never ran concurrently");
    assert_eq!(stats.currently_held, 0);
    assert_eq!(stats.successful_acquisitions, 12);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn test_second_writer_times_out_after_backoff() {
    let clock = Arc::new(RecordingClock::default());
    let broker = ConnectionBroker::in_memory(config(3, 3))
        .unwrap()
        .with_clock(clock.clone());

    let _writer = broker.acquire_writer().await.unwrap();
    let err = broker.acquire_writer().await.unwrap_err();

    match err {
        BrokerError::AcquisitionTimeout { role, attempts, .. } => {
            assert_eq!(role, Role::Writer);
            assert_eq!(attempts, 4);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }

    let timeout = Duration::from_millis(7);
    let backoff: Vec<Duration> = clock.sleeps().into_iter().filter(|d| *d != timeout).collect();
    assert_eq!(
        backoff,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );

    let stats = broker.stats();
    assert_eq!(stats.total_acquisitions, 2);
    assert_eq!(stats.successful_acquisitions, 1);
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.currently_held, 1);
}

#[tokio::test]
async fn test_writer_is_available_again_after_release() {
    let broker = ConnectionBroker::in_memory(config(2, 0)).unwrap();

    let writer = broker.acquire_writer().await.unwrap();
    writer
        .connection()
        .unwrap()
        .execute_batch("CREATE TABLE t (x INTEGER)")
        .unwrap();
    drop(writer);

    let writer = broker.acquire_writer().await.unwrap();
    assert_eq!(writer.role(), Role::Writer);
    assert!(writer.table_exists("t").unwrap());
}

#[tokio::test]
async fn test_readers_proceed_while_writer_is_held() {
    let broker = ConnectionBroker::in_memory(config(3, 0)).unwrap();

    let writer = broker.acquire_writer().await.unwrap();
    writer
        .connection()
        .unwrap()
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2)")
        .unwrap();

    let first = broker.acquire_reader().await.unwrap();
    let second = broker.acquire_reader().await.unwrap();
    assert_eq!(first.count_rows("t").unwrap(), 2);
    assert_eq!(second.query("SELECT x FROM t ORDER BY x").unwrap().row_count(), 2);

    // Writer and two readers fill all three slots
    let err = broker
        .acquire(Role::Reader, Duration::from_millis(20), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AcquisitionTimeout { attempts: 1, .. }));

    drop(first);
    assert!(broker.acquire_reader().await.is_ok());
}

#[tokio::test]
async fn test_reader_rejects_writes() {
    let broker = ConnectionBroker::in_memory(config(2, 0)).unwrap();
    {
        let writer = broker.acquire_writer().await.unwrap();
        writer
            .connection()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
    }

    let reader = broker.acquire_reader().await.unwrap();
    for sql in [
        "INSERT INTO t VALUES (1)",
        "DELETE FROM t",
        "DROP TABLE t",
        "SELECT 1; DROP TABLE t",
    ] {
        let err = reader.query(sql).unwrap_err();
        assert!(
            matches!(err, DatabaseError::ReadOnlyViolation(_) | DatabaseError::InvalidInput(_)),
            "{} was not rejected",
            sql
        );
    }
    assert!(matches!(
        reader.connection(),
        Err(DatabaseError::ReadOnlyViolation(_))
    ));
    assert!(reader.table_exists("t").unwrap());
}
