use std::sync::Arc;
use std::time::Duration;

use fleetwatch::Change;
use fleetwatch::ChangeLog;
use fleetwatch::CollectionOps;
use fleetwatch::WatchHandle;
use fleetwatch::Watcher;
use fleetwatch::WatcherConfig;
use tokio::time::timeout;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);
/// Lets freshly spawned handles register with the core loop.
pub const SETTLE: Duration = Duration::from_millis(30);

pub fn test_config() -> WatcherConfig {
    WatcherConfig {
        empty_log_retry_interval_ms: 1,
        ..Default::default()
    }
}

pub fn start_watcher<L: ChangeLog>(log: L) -> Watcher {
    crate::enable_logger();
    Watcher::start(Arc::new(log), test_config()).expect("watcher should start")
}

pub fn ops(
    collection: &str,
    docs: &[(&str, i64)],
) -> CollectionOps {
    docs.iter()
        .fold(CollectionOps::new(collection), |ops, (id, revno)| ops.with(*id, *revno))
}

pub async fn settle() {
    tokio::time::sleep(SETTLE).await;
}

pub async fn next_change(handle: &mut WatchHandle) -> Change {
    timeout(DELIVERY_TIMEOUT, handle.next())
        .await
        .unwrap_or_else(|_| panic!("no change on {}", handle.target()))
        .unwrap_or_else(|| panic!("watch {} ended: {:?}", handle.target(), handle.err()))
}

pub async fn assert_quiet(handle: &mut WatchHandle) {
    if let Ok(change) = timeout(QUIET_PERIOD, handle.next()).await {
        panic!("unexpected delivery on {}: {:?}", handle.target(), change);
    }
}

/// Drains whatever is still buffered and waits for the output to end.
pub async fn assert_ends(handle: &mut WatchHandle) {
    timeout(DELIVERY_TIMEOUT, async {
        while handle.next().await.is_some() {}
    })
    .await
    .unwrap_or_else(|_| panic!("watch {} did not end", handle.target()));
}
