//! Per-watcher Prometheus collectors.
//!
//! Collectors live on the watcher instance rather than in a process-wide
//! registry, so independent watchers never share counters. Owners expose them
//! by registering into their own [`Registry`].

use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;

use crate::Result;


#[derive(Clone, Debug)]
pub struct WatcherMetrics {
    /// Changes accepted by the core loop, labelled by collection
    pub changes_applied: IntCounterVec,
    /// Changes discarded because the revno matched the cached one
    pub changes_deduplicated: IntCounterVec,
    /// Change log entries skipped by the sync task
    pub malformed_entries: IntCounter,
    /// Registered collection subscriptions
    pub collection_subscriptions: IntGauge,
    /// Pending one-shot document subscriptions
    pub point_subscriptions: IntGauge,
}

impl WatcherMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            changes_applied: IntCounterVec::new(
                Opts::new("watcher_changes_applied", "Changes applied by the watcher core loop"),
                &["collection"],
            )
            .map_err(metric_error)?,
            changes_deduplicated: IntCounterVec::new(
                Opts::new(
                    "watcher_changes_deduplicated",
                    "Changes discarded because the revno was already known",
                ),
                &["collection"],
            )
            .map_err(metric_error)?,
            malformed_entries: IntCounter::new(
                "watcher_malformed_log_entries",
                "Change log entries skipped because of a malformed shape",
            )
            .map_err(metric_error)?,
            collection_subscriptions: IntGauge::new(
                "watcher_collection_subscriptions",
                "Registered collection subscriptions",
            )
            .map_err(metric_error)?,
            point_subscriptions: IntGauge::new(
                "watcher_point_subscriptions",
                "Pending one-shot document subscriptions",
            )
            .map_err(metric_error)?,
        })
    }

    /// Registers every collector with `registry`.
    pub fn register(
        &self,
        registry: &Registry,
    ) -> Result<()> {
        registry
            .register(Box::new(self.changes_applied.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.changes_deduplicated.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.malformed_entries.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.collection_subscriptions.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.point_subscriptions.clone()))
            .map_err(metric_error)?;
        Ok(())
    }
}

fn metric_error(e: prometheus::Error) -> crate::Error {
    crate::Error::Fatal(format!("metric setup failed: {e}"))
}
