use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use crate::Change;
use crate::CollectionOps;
use crate::MemChangeLog;
use crate::WatchHandle;
use crate::Watcher;
use crate::WatcherConfig;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

/// How long a test waits for a change that must arrive.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits to be confident nothing arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Fast retry so freshly started logs are picked up quickly in tests.
pub fn fast_config() -> WatcherConfig {
    WatcherConfig {
        empty_log_retry_interval_ms: 1,
        ..Default::default()
    }
}

pub fn start_mem_watcher(capacity: usize) -> (MemChangeLog, Watcher) {
    enable_logger();
    let log = MemChangeLog::new(capacity);
    let watcher = Watcher::start(Arc::new(log.clone()), fast_config()).expect("watcher should start");
    (log, watcher)
}

/// Appends one single-collection transaction.
pub fn commit(
    log: &MemChangeLog,
    collection: &str,
    docs: &[(&str, i64)],
) -> u64 {
    let ops = docs
        .iter()
        .fold(CollectionOps::new(collection), |ops, (id, revno)| ops.with(*id, *revno));
    log.append(vec![ops])
}

pub async fn expect_change(handle: &mut WatchHandle) -> Change {
    timeout(DELIVERY_TIMEOUT, handle.next())
        .await
        .unwrap_or_else(|_| panic!("no change delivered on {}", handle.target()))
        .unwrap_or_else(|| panic!("watch {} ended: {:?}", handle.target(), handle.err()))
}

pub async fn expect_quiet(handle: &mut WatchHandle) {
    if let Ok(change) = timeout(QUIET_PERIOD, handle.next()).await {
        panic!("unexpected delivery on {}: {:?}", handle.target(), change);
    }
}

pub async fn expect_closed(handle: &mut WatchHandle) {
    let next = timeout(DELIVERY_TIMEOUT, handle.next())
        .await
        .unwrap_or_else(|_| panic!("watch {} did not end", handle.target()));
    assert_eq!(next, None, "watch {} should have ended", handle.target());
}
