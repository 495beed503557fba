use std::sync::Arc;
use std::time::Duration;

use window_counter::{CounterConfig, MemoryStore, SlidingCounter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let config = CounterConfig {
        window: Duration::from_secs(1),
        persist_interval: Duration::from_millis(100),
        ..CounterConfig::default()
    };
    let counter = SlidingCounter::open(config, store.clone()).await?;

    let timeout = Duration::from_secs(1);
    assert_eq!(counter.record_request_within(timeout).await?, 1);
    assert_eq!(counter.record_request_within(timeout).await?, 2);

    // Move past the window: both requests are forgotten.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(counter.current_count(), 0);

    assert_eq!(counter.record_request_within(timeout).await?, 1);

    counter.shutdown().await?;
    // The final snapshot holds the one request still inside the window.
    assert_eq!(store.saved().len(), 1);
    Ok(())
}
