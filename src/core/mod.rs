mod change;
mod event;
mod handle;
mod state;
mod sync_task;
mod watcher;

pub use change::*;
pub(crate) use event::*;
pub use handle::ChangeFilter;
pub use handle::WatchHandle;
pub use handle::WatchTarget;
pub(crate) use state::*;
pub(crate) use sync_task::SyncTask;
pub use watcher::*;
