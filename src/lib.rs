//! # fleetwatch
//!
//! Change-notification multiplexer for a fleet orchestrator.
//!
//! A [`Watcher`] tails a bounded [`ChangeLog`] of committed transactions and
//! fans the resulting document changes out to many subscribers:
//!
//! - [`Watcher::watch_document`] yields each new revno of one document
//! - [`Watcher::watch_collection`] yields every change of a collection, in
//!   one global order shared by all subscribers of that collection
//!
//! All watch state is owned by a single core loop task; handles talk to it
//! through message passing only.
//!
//! ```ignore
//! let log = MemChangeLog::new(10_000);
//! let watcher = Watcher::start(Arc::new(log.clone()), WatcherConfig::default())?;
//! let mut units = watcher.watch_collection("units")?;
//!
//! log.append(vec![CollectionOps::new("units").with("u1", 1)]);
//! assert_eq!(units.next().await, Some(Change::new("units", "u1", 1)));
//! ```

mod config;
mod constants;
mod core;
mod errors;
mod metrics;
mod storage;

pub use config::*;
pub use constants::REVNO_DELETED;
pub use constants::REVNO_MISSING;
pub use core::*;
pub use errors::*;
pub use metrics::*;
pub use storage::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
