// Internal modules; the public surface is curated below.
mod buffer;
mod disk;
mod guard;
mod page;
mod replacer;

// Everything the engine layers above need: the pool, its guards, and
// the disk collaborator.
pub use buffer::{BufferPoolError, BufferPoolManager, BufferPoolResult, FlushMode};
pub use disk::{DiskManager, PAGE_SIZE, PageId};
pub use guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
pub use page::{PAGE_LSN_SIZE, Page};
pub use replacer::{FrameId, LRUKReplacer, Replacer, ReplacerError};
