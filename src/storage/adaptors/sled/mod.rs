pub mod sled_change_log;

pub use sled_change_log::*;
