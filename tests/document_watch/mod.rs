use fleetwatch::Change;
use fleetwatch::MemChangeLog;
use fleetwatch::REVNO_DELETED;
use fleetwatch::REVNO_MISSING;

use crate::common::assert_quiet;
use crate::common::next_change;
use crate::common::ops;
use crate::common::settle;
use crate::common::start_watcher;

/// # Case: a document observed at revno 3 changes, is rewritten, then deleted
///
/// ## Criterias:
/// 1. exactly one delivery of revno 4
/// 2. the identical rewrite delivers nothing
/// 3. deletion is delivered as -1
#[tokio::test]
async fn test_document_lifecycle() {
    let log = MemChangeLog::new(1000);
    log.append(vec![ops("units", &[("u1", 3)])]);
    let watcher = start_watcher(log.clone());

    let mut u1 = watcher.watch_document("units", "u1", 3).unwrap();
    assert_quiet(&mut u1).await;

    log.append(vec![ops("units", &[("u1", 4)])]);
    assert_eq!(next_change(&mut u1).await, Change::new("units", "u1", 4));
    assert_quiet(&mut u1).await;

    log.append(vec![ops("units", &[("u1", 4)])]);
    assert_quiet(&mut u1).await;

    log.append(vec![ops("units", &[("u1", REVNO_DELETED)])]);
    let deleted = next_change(&mut u1).await;
    assert!(deleted.is_delete());

    u1.stop().await.unwrap();
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_late_subscriber_sees_existing_deletion() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    log.append(vec![ops("units", &[("u1", 5)])]);
    log.append(vec![ops("units", &[("u1", REVNO_DELETED)])]);
    settle().await;

    // Caller last saw revno 5 and must learn about the deletion
    let mut u1 = watcher.watch_document("units", "u1", 5).unwrap();

    assert_eq!(next_change(&mut u1).await.revno, REVNO_DELETED);
    assert_quiet(&mut u1).await;
}

#[tokio::test]
async fn test_never_seen_document_resolves_on_first_write() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut ghost = watcher.watch_document("units", "ghost", REVNO_MISSING).unwrap();

    assert_quiet(&mut ghost).await;
    log.append(vec![ops("units", &[("ghost", 0)])]);

    assert_eq!(next_change(&mut ghost).await.revno, 0);
}

#[tokio::test]
async fn test_integer_ids_are_supported() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut machine = watcher.watch_document("machines", 7, 0).unwrap();

    log.append(vec![fleetwatch::CollectionOps::new("machines").with(7, 1)]);

    assert_eq!(next_change(&mut machine).await, Change::new("machines", 7, 1));
}

#[tokio::test]
async fn test_many_subscribers_on_one_document() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut handles: Vec<_> = (0..8)
        .map(|_| watcher.watch_document("units", "u1", 0).unwrap())
        .collect();

    log.append(vec![ops("units", &[("u1", 1)])]);

    for handle in handles.iter_mut() {
        assert_eq!(next_change(handle).await.revno, 1);
    }
}
