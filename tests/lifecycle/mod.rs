use std::time::Duration;

use fleetwatch::MemChangeLog;
use fleetwatch::SledChangeLog;
use fleetwatch::Watcher;
use fleetwatch::WatcherConfig;
use fleetwatch::WatcherError;
use fleetwatch::WatcherState;
use tokio::time::timeout;

use crate::common::assert_ends;
use crate::common::next_change;
use crate::common::ops;
use crate::common::settle;
use crate::common::start_watcher;
use crate::common::test_config;

#[tokio::test]
async fn test_watcher_over_sled_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = SledChangeLog::open(dir.path().join("changelog"), 100).unwrap();
    log.append(vec![ops("units", &[("u1", 1)])]).unwrap();

    let watcher = start_watcher(log.clone());
    // History is applied before the collection subscription starts
    settle().await;
    let mut u1 = watcher.watch_document("units", "u1", 1).unwrap();
    let mut units = watcher.watch_collection("units").unwrap();
    settle().await;

    log.append(vec![ops("units", &[("u1", 2), ("u2", 1)])]).unwrap();

    assert_eq!(next_change(&mut u1).await.revno, 2);
    assert_eq!(next_change(&mut units).await.revno, 2);
    assert_eq!(next_change(&mut units).await.revno, 1);

    watcher.stop().await.unwrap();
    assert_eq!(watcher.state(), WatcherState::Dead(None));
}

#[tokio::test]
async fn test_skip_history_ignores_existing_entries() {
    crate::enable_logger();
    let log = MemChangeLog::new(100);
    log.append(vec![ops("units", &[("u1", 1)])]);
    log.append(vec![ops("units", &[("u1", 2)])]);

    let config = WatcherConfig {
        skip_history: true,
        ..test_config()
    };
    let watcher = Watcher::start(std::sync::Arc::new(log.clone()), config).unwrap();
    // Known revno 0 would fire at once had the history been replayed
    let mut u1 = watcher.watch_document("units", "u1", 0).unwrap();
    settle().await;

    log.append(vec![ops("units", &[("u1", 3)])]);

    assert_eq!(next_change(&mut u1).await.revno, 3);
}

/// # Case: the log wraps around past the sync task's position
///
/// ## Setup:
/// 1. capacity-2 log, the sync task has consumed entry 1 and is tailing
/// 2. nine more entries land before it gets to run again
///
/// ## Criterias:
/// 1. the watcher dies with PositionLost
/// 2. every open handle ends and reports PositionLost
#[tokio::test]
async fn test_position_lost_propagates_to_handles() {
    let log = MemChangeLog::new(2);
    let watcher = start_watcher(log.clone());
    let mut units = watcher.watch_collection("units").unwrap();
    let mut u1 = watcher.watch_document("units", "u1", 0).unwrap();
    settle().await;

    log.append(vec![ops("units", &[("u1", 1)])]);
    assert_eq!(next_change(&mut u1).await.revno, 1);

    for revno in 2..=10 {
        log.append(vec![ops("units", &[("u1", revno)])]);
    }

    let terminal = timeout(Duration::from_secs(3), watcher.wait())
        .await
        .expect("watcher should die");
    assert_eq!(terminal, Some(WatcherError::PositionLost));

    assert_ends(&mut units).await;
    assert_ends(&mut u1).await;
    assert_eq!(units.err(), Some(WatcherError::PositionLost));
    assert_eq!(u1.err(), Some(WatcherError::PositionLost));
}

#[tokio::test]
async fn test_stop_ends_handles_with_stopped() {
    let log = MemChangeLog::new(100);
    let watcher = start_watcher(log.clone());
    let mut units = watcher.watch_collection("units").unwrap();
    settle().await;

    watcher.stop().await.unwrap();

    assert_ends(&mut units).await;
    assert_eq!(units.err(), Some(WatcherError::Stopped));
    assert!(watcher.watch_collection("").is_err());
}
