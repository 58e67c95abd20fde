//! Change log abstractions tailed by the watcher, plus the in-memory and
//! sled-backed adaptors.
mod adaptors;
mod change_log;

pub use adaptors::*;
pub use change_log::*;
