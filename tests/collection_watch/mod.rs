use std::collections::HashSet;

use fleetwatch::Change;
use fleetwatch::DocId;
use fleetwatch::MemChangeLog;

use crate::common::assert_quiet;
use crate::common::next_change;
use crate::common::ops;
use crate::common::settle;
use crate::common::start_watcher;

#[tokio::test]
async fn test_multi_collection_transaction_fans_out() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut units = watcher.watch_collection("units").unwrap();
    let mut machines = watcher.watch_collection("machines").unwrap();
    settle().await;

    log.append(vec![
        ops("units", &[("u1", 1), ("u2", 1)]),
        ops("machines", &[("m1", 1)]),
    ]);

    assert_eq!(next_change(&mut units).await, Change::new("units", "u1", 1));
    assert_eq!(next_change(&mut units).await, Change::new("units", "u2", 1));
    assert_eq!(next_change(&mut machines).await, Change::new("machines", "m1", 1));
    assert_quiet(&mut units).await;
    assert_quiet(&mut machines).await;
}

/// # Case: subscriber that does not read for a while
///
/// ## Setup:
/// 1. subscribe, then let many documents change several times
///
/// ## Criterias:
/// 1. every changed document is reported
/// 2. each document is reported at its latest revno no later than the end
#[tokio::test]
async fn test_lagging_subscriber_does_not_skip_documents() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut units = watcher.watch_collection("units").unwrap();
    settle().await;

    for round in 1..=3 {
        for id in ["a", "b", "c", "d", "e"] {
            log.append(vec![ops("units", &[(id, round)])]);
        }
    }
    settle().await;

    let mut latest = std::collections::HashMap::new();
    while latest.len() < 5 || latest.values().any(|revno| *revno != 3) {
        let change = next_change(&mut units).await;
        latest.insert(change.id, change.revno);
    }
    assert_quiet(&mut units).await;
}

#[tokio::test]
async fn test_subscribers_observe_the_same_order() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let mut first = watcher.watch_collection("units").unwrap();
    let mut second = watcher.watch_collection("units").unwrap();
    settle().await;

    let ids = ["d", "b", "e", "a", "c"];
    for id in ids {
        log.append(vec![ops("units", &[(id, 1)])]);
    }

    let mut order_first = Vec::new();
    let mut order_second = Vec::new();
    for _ in 0..ids.len() {
        order_first.push(next_change(&mut first).await.id);
        order_second.push(next_change(&mut second).await.id);
    }
    assert_eq!(order_first, order_second);

    let expected: Vec<DocId> = ids.iter().map(|id| DocId::from(*id)).collect();
    assert_eq!(order_first, expected);
}

#[tokio::test]
async fn test_filtered_subscribers_agree_on_order() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let wanted: HashSet<DocId> = ["u2", "u4", "u6"].into_iter().map(DocId::from).collect();
    let filter_a = wanted.clone();
    let filter_b = wanted.clone();
    let mut a = watcher
        .watch_collection_filtered("units", move |id| filter_a.contains(id))
        .unwrap();
    let mut b = watcher
        .watch_collection_filtered("units", move |id| filter_b.contains(id))
        .unwrap();
    settle().await;

    for n in 1..=6 {
        log.append(vec![ops("units", &[(format!("u{n}").as_str(), 1)])]);
    }

    for expected in ["u2", "u4", "u6"] {
        assert_eq!(next_change(&mut a).await.id, DocId::from(expected));
        assert_eq!(next_change(&mut b).await.id, DocId::from(expected));
    }
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_others() {
    let log = MemChangeLog::new(1000);
    let watcher = start_watcher(log.clone());
    let _stalled = watcher.watch_collection("units").unwrap();
    let mut reader = watcher.watch_collection("units").unwrap();
    let mut doc = watcher.watch_document("units", "u9", 0).unwrap();
    settle().await;

    for n in 1..=9 {
        log.append(vec![ops("units", &[(format!("u{n}").as_str(), 1)])]);
    }

    for n in 1..=9 {
        assert_eq!(next_change(&mut reader).await.id, DocId::from(format!("u{n}")));
    }
    assert_eq!(next_change(&mut doc).await.revno, 1);
}
