pub mod mem_change_log;

pub use mem_change_log::*;
