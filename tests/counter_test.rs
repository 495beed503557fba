use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use window_counter::{
    CounterConfig, CounterError, JsonFileStore, MemoryStore, OpenError, SlidingCounter,
    SnapshotStore,
};

fn config(window_ms: u64, persist_ms: u64) -> CounterConfig {
    CounterConfig {
        window: Duration::from_millis(window_ms),
        persist_interval: Duration::from_millis(persist_ms),
        ..CounterConfig::default()
    }
}

async fn open(config: CounterConfig, store: &Arc<MemoryStore>) -> SlidingCounter {
    SlidingCounter::open(config, Arc::clone(store) as Arc<dyn SnapshotStore>)
        .await
        .unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

const LONG: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_counts_and_snapshots_on_cadence() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(config(60_000, 300), &store).await;

    assert_eq!(counter.record_request_within(LONG).await, Ok(1));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(counter.record_request_within(LONG).await, Ok(2));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(counter.record_request_within(LONG).await, Ok(3));

    assert_eq!(counter.stats().snapshots_triggered, 2);
    wait_until(|| counter.stats().snapshots_saved == 2).await;
    assert_eq!(store.save_count(), 2);
    assert_eq!(store.saved().len(), 3);
}

#[tokio::test]
async fn test_burst_inside_interval_does_not_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(config(60_000, 10_000), &store).await;

    for expected in 1..=20 {
        assert_eq!(counter.record_request_within(LONG).await, Ok(expected));
    }
    assert_eq!(counter.stats().snapshots_triggered, 0);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn test_events_expire_after_window() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(config(1_000, 300), &store).await;

    assert_eq!(counter.record_request_within(LONG).await, Ok(1));
    assert_eq!(counter.current_count(), 1);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(counter.current_count(), 0);
    assert_eq!(counter.record_request_within(LONG).await, Ok(1));
}

#[tokio::test]
async fn test_restart_hydrates_from_store() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::with_events(vec![
        now - TimeDelta::seconds(3),
        now - TimeDelta::seconds(2),
        now - TimeDelta::seconds(1),
    ]));
    let counter = open(config(60_000, 300), &store).await;

    assert_eq!(counter.current_count(), 3);
    assert_eq!(counter.record_request_within(LONG).await, Ok(4));
}

#[tokio::test]
async fn test_restart_drops_expired_entries() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::with_events(vec![
        now - TimeDelta::seconds(90),
        now - TimeDelta::seconds(30),
        now - TimeDelta::seconds(1),
    ]));
    let counter = open(config(60_000, 300), &store).await;

    assert_eq!(counter.current_count(), 2);
    assert_eq!(counter.record_request_within(LONG).await, Ok(3));
}

#[tokio::test]
async fn test_restart_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");

    let first = SlidingCounter::open(config(60_000, 300), Arc::new(JsonFileStore::new(&path)))
        .await
        .unwrap();
    for _ in 0..3 {
        first.record_request_within(LONG).await.unwrap();
    }
    first.shutdown().await.unwrap();
    assert!(path.exists());

    let second = SlidingCounter::open(config(60_000, 300), Arc::new(JsonFileStore::new(&path)))
        .await
        .unwrap();
    assert_eq!(second.current_count(), 3);
    assert_eq!(second.record_request_within(LONG).await, Ok(4));
}

#[tokio::test]
async fn test_corrupt_file_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    std::fs::write(&path, "{not json").unwrap();

    let result = SlidingCounter::open(CounterConfig::default(), Arc::new(JsonFileStore::new(&path))).await;
    assert!(matches!(result, Err(OpenError::Load(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_file_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");
    std::os::unix::fs::symlink(&path, &path).unwrap();

    let result = SlidingCounter::open(CounterConfig::default(), Arc::new(JsonFileStore::new(&path))).await;
    assert!(matches!(result, Err(OpenError::Load(_))));
}

#[tokio::test]
async fn test_invalid_config_fails_open() {
    let store = Arc::new(MemoryStore::new());
    let config = CounterConfig {
        concurrency: 0,
        ..CounterConfig::default()
    };

    let result = SlidingCounter::open(config, store).await;
    assert!(matches!(result, Err(OpenError::Config(_))));
}

#[tokio::test]
async fn test_timeout_during_processing_is_not_recorded() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(
        CounterConfig {
            concurrency: 1,
            processing_delay: Duration::from_millis(500),
            ..CounterConfig::default()
        },
        &store,
    )
    .await;

    let result = counter
        .record_request_within(Duration::from_millis(50))
        .await;
    assert_eq!(result, Err(CounterError::Timeout));

    wait_until(|| counter.stats().dropped == 1).await;
    assert_eq!(counter.current_count(), 0);
    assert_eq!(counter.stats().in_flight, 0);
}

#[tokio::test]
async fn test_timeout_while_queued_is_not_recorded() {
    let store = Arc::new(MemoryStore::new());
    let counter = Arc::new(
        open(
            CounterConfig {
                concurrency: 1,
                processing_delay: Duration::from_millis(300),
                ..CounterConfig::default()
            },
            &store,
        )
        .await,
    );

    let slow = {
        let counter = Arc::clone(&counter);
        tokio::spawn(async move { counter.record_request_within(LONG).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queued = counter
        .record_request_within(Duration::from_millis(100))
        .await;
    assert_eq!(queued, Err(CounterError::Timeout));
    assert_eq!(slow.await.unwrap(), Ok(1));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(counter.current_count(), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let counter = Arc::new(
        open(
            CounterConfig {
                concurrency: 2,
                queue_capacity: 1,
                processing_delay: Duration::from_millis(100),
                ..CounterConfig::default()
            },
            &store,
        )
        .await,
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.record_request_within(LONG).await })
        })
        .collect();

    let mut counts = Vec::new();
    for handle in handles {
        counts.push(handle.await.unwrap().unwrap());
    }
    counts.sort_unstable();

    assert_eq!(counts, (1..=8).collect::<Vec<_>>());
    assert!(started.elapsed() >= Duration::from_millis(400));
    let stats = counter.stats();
    assert!(stats.max_in_flight <= 2, "max_in_flight = {}", stats.max_in_flight);
    assert_eq!(stats.recorded, 8);
}

#[tokio::test]
async fn test_full_queue_blocks_until_deadline() {
    let store = Arc::new(MemoryStore::new());
    let counter = Arc::new(
        open(
            CounterConfig {
                concurrency: 1,
                queue_capacity: 1,
                processing_delay: Duration::from_millis(300),
                ..CounterConfig::default()
            },
            &store,
        )
        .await,
    );

    // One processing, one waiting for the permit, one filling the queue.
    let mut accepted = Vec::new();
    for _ in 0..3 {
        let counter = Arc::clone(&counter);
        accepted.push(tokio::spawn(async move {
            counter.record_request_within(LONG).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let blocked = counter
        .record_request_within(Duration::from_millis(100))
        .await;
    assert_eq!(blocked, Err(CounterError::Timeout));

    for handle in accepted {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(counter.current_count(), 3);
}

#[tokio::test]
async fn test_external_cancel_is_not_recorded() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(
        CounterConfig {
            processing_delay: Duration::from_millis(300),
            ..CounterConfig::default()
        },
        &store,
    )
    .await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = counter
        .record_request_with(Instant::now() + LONG, &cancel)
        .await;
    assert_eq!(result, Err(CounterError::Cancelled));

    wait_until(|| counter.stats().dropped == 1).await;
    assert_eq!(counter.current_count(), 0);
}

#[tokio::test]
async fn test_failed_snapshot_does_not_fail_requests() {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let counter = open(config(60_000, 200), &store).await;

    assert_eq!(counter.record_request_within(LONG).await, Ok(1));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(counter.record_request_within(LONG).await, Ok(2));

    wait_until(|| counter.stats().snapshots_failed == 1).await;
    assert_eq!(store.save_count(), 0);

    store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(counter.record_request_within(LONG).await, Ok(3));
    wait_until(|| store.save_count() == 1).await;
    assert_eq!(store.saved().len(), 3);
}

#[tokio::test]
async fn test_flush_ignores_cadence() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(config(60_000, 3_600_000), &store).await;

    counter.record_request_within(LONG).await.unwrap();
    counter.record_request_within(LONG).await.unwrap();
    assert_eq!(store.save_count(), 0);

    counter.flush().await.unwrap();
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.saved().len(), 2);
}

#[tokio::test]
async fn test_flush_of_empty_window_keeps_previous_snapshot() {
    let old = Utc::now() - TimeDelta::hours(1);
    let store = Arc::new(MemoryStore::with_events(vec![old]));
    let counter = open(config(60_000, 300), &store).await;

    assert_eq!(counter.current_count(), 0);
    counter.flush().await.unwrap();
    assert_eq!(store.saved(), vec![old]);
}

#[tokio::test]
async fn test_close_rejects_new_requests() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(CounterConfig::default(), &store).await;

    counter.record_request_within(LONG).await.unwrap();
    assert!(counter.close().await);
    assert!(counter.is_closed());
    assert_eq!(
        counter.record_request_within(LONG).await,
        Err(CounterError::Closed)
    );
    assert_eq!(counter.current_count(), 1);
}

#[tokio::test]
async fn test_shutdown_flushes_and_closes_store() {
    let store = Arc::new(MemoryStore::new());
    let counter = open(config(60_000, 3_600_000), &store).await;

    counter.record_request_within(LONG).await.unwrap();
    counter.shutdown().await.unwrap();

    assert!(store.is_closed());
    assert_eq!(store.saved().len(), 1);
    assert!(counter.is_closed());
}

#[tokio::test]
async fn test_shutdown_drains_accepted_requests() {
    let store = Arc::new(MemoryStore::new());
    let counter = Arc::new(
        open(
            CounterConfig {
                concurrency: 1,
                processing_delay: Duration::from_millis(50),
                persist_interval: Duration::from_secs(3_600),
                ..CounterConfig::default()
            },
            &store,
        )
        .await,
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.record_request_within(LONG).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    counter.shutdown().await.unwrap();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(store.saved().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_holds_when_caller_is_not_polled() {
    let store = Arc::new(MemoryStore::new());
    let counter = Arc::new(
        open(
            CounterConfig {
                processing_delay: Duration::from_millis(100),
                ..CounterConfig::default()
            },
            &store,
        )
        .await,
    );

    // The caller lives on its own runtime and is stalled right after submitting.
    let (done, result) = tokio::sync::oneshot::channel();
    let caller = Arc::clone(&counter);
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome = rt.block_on(async move {
            let request = caller.record_request(Instant::now() + Duration::from_millis(50));
            tokio::pin!(request);
            let first_poll = tokio::time::timeout(Duration::from_millis(1), &mut request).await;
            assert!(first_poll.is_err());

            std::thread::sleep(Duration::from_millis(300));
            request.await
        });
        let _ = done.send(outcome);
    });

    assert_eq!(result.await.unwrap(), Err(CounterError::Timeout));
    assert_eq!(counter.current_count(), 0);
    assert_eq!(counter.stats().recorded, 0);
    assert_eq!(counter.stats().dropped, 1);
}
