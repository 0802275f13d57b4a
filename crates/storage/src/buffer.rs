use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parking_lot::RwLock;
use thiserror::Error;

use crate::guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::page::Page;
use crate::replacer::{FrameId, LRUKReplacer, Replacer, ReplacerError};
use crate::{DiskManager, PAGE_SIZE, PageId};
use wal::LogManager;

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The underlying disk manager failed.
    #[error("disk manager error: {0}")]
    Io(#[from] std::io::Error),
    /// WAL flush failed.
    #[error("wal error: {0}")]
    Wal(#[from] wal::WalError),
    /// The replacer rejected a frame id.
    #[error("replacer error: {0}")]
    Replacer(#[from] ReplacerError),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Residency metadata for one frame. Guarded by the pool latch; the
/// page image itself sits behind the frame's content latch.
#[derive(Debug, Default)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct BufferPoolState {
    disk_manager: DiskManager,
    replacer: LRUKReplacer,
    frames: Vec<FrameMeta>,
    pages: Vec<Arc<RwLock<Page>>>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    log_manager: Option<Arc<LogManager>>,
}

#[derive(Default)]
struct BufferPoolMetrics {
    fetch_count: AtomicUsize,
}

/// Buffer pool manager for caching pages between disk and memory.
///
/// Cloning yields another handle to the same pool; page guards carry a
/// handle back so dropping them can unpin.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<BufferPoolState>>,
    metrics: Arc<BufferPoolMetrics>,
}

/// Flush mode for buffer pool writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Defer disk sync to later (default behavior).
    Lazy,
    /// Force the disk write to be synced.
    Force,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames and an LRU-K
    /// replacer of history depth `replacer_k`.
    pub fn new(disk_manager: DiskManager, pool_size: usize, replacer_k: usize) -> Self {
        Self::new_with_log(disk_manager, pool_size, replacer_k, None)
    }

    pub fn new_with_log(
        disk_manager: DiskManager,
        pool_size: usize,
        replacer_k: usize,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let frames = (0..pool_size).map(|_| FrameMeta::default()).collect();
        let pages = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Page::new())))
            .collect();
        let free_list = (0..pool_size).rev().collect();
        let state = BufferPoolState {
            disk_manager,
            replacer: LRUKReplacer::new(pool_size, replacer_k),
            frames,
            pages,
            page_table: HashMap::new(),
            free_list,
            log_manager,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            metrics: Arc::new(BufferPoolMetrics::default()),
        }
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, BufferPoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    /// Returns the number of page fetches since last reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    /// Resets the fetch counter to zero.
    pub fn reset_fetch_count(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed);
    }

    /// Free-frame protocol: pop the free list, else take a replacer
    /// victim, writing its image back first when dirty.
    fn acquire_frame(state: &mut BufferPoolState) -> BufferPoolResult<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(Some(frame_id));
        }
        let Some(frame_id) = state.replacer.evict() else {
            return Ok(None);
        };
        if let Some(old_page_id) = state.frames[frame_id].page_id {
            if state.frames[frame_id].is_dirty {
                // No guard can hold this frame (it was evictable), so
                // the content latch is uncontended.
                let page = state.pages[frame_id].read();
                if let Some(log_manager) = &state.log_manager {
                    log_manager.flush(page.lsn())?;
                }
                state.disk_manager.write_page(old_page_id, page.data())?;
            }
            state.page_table.remove(&old_page_id);
        }
        state.frames[frame_id].reset();
        state.pages[frame_id].write().reset();
        Ok(Some(frame_id))
    }

    /// Installs a freshly acquired frame as the home of `page_id` with a
    /// single pin, and tracks it in the replacer as non-evictable.
    fn install_frame(
        state: &mut BufferPoolState,
        frame_id: FrameId,
        page_id: PageId,
    ) -> BufferPoolResult<()> {
        let meta = &mut state.frames[frame_id];
        meta.page_id = Some(page_id);
        meta.pin_count = 1;
        meta.is_dirty = false;
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id)?;
        state.replacer.set_evictable(frame_id, false)?;
        Ok(())
    }

    /// Allocates a new page on disk and pins it in the buffer pool. The
    /// caller owns the pin and pairs it with `unpin_page`; see
    /// `new_page_guarded` for the self-releasing shape.
    pub fn new_page(&self) -> BufferPoolResult<Option<PageId>> {
        Ok(self.create_page()?.map(|(page_id, _)| page_id))
    }

    /// Allocates a new page and returns it as a guard that unpins on
    /// drop.
    pub fn new_page_guarded(&self) -> BufferPoolResult<Option<BasicPageGuard>> {
        let Some((page_id, page)) = self.create_page()? else {
            return Ok(None);
        };
        Ok(Some(BasicPageGuard::new(self.clone(), page_id, page)))
    }

    fn create_page(&self) -> BufferPoolResult<Option<(PageId, Arc<RwLock<Page>>)>> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        let Some(frame_id) = Self::acquire_frame(state)? else {
            return Ok(None);
        };
        let page_id = state.disk_manager.allocate_page()?;
        Self::install_frame(state, frame_id, page_id)?;
        Ok(Some((page_id, Arc::clone(&state.pages[frame_id]))))
    }

    /// Resolves `page_id` to a pinned frame, reading the image from disk
    /// on a miss. Each successful call stacks one more pin.
    fn fetch_frame(&self, page_id: PageId) -> BufferPoolResult<Option<Arc<RwLock<Page>>>> {
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state()?;
        let state = &mut *state;
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.frames[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id)?;
            state.replacer.set_evictable(frame_id, false)?;
            return Ok(Some(Arc::clone(&state.pages[frame_id])));
        }

        let Some(frame_id) = Self::acquire_frame(state)? else {
            return Ok(None);
        };
        {
            let mut page = state.pages[frame_id].write();
            state.disk_manager.read_page(page_id, page.data_mut())?;
        }
        Self::install_frame(state, frame_id, page_id)?;
        Ok(Some(Arc::clone(&state.pages[frame_id])))
    }

    /// Fetches a page and pins it without taking its content latch. Use
    /// the guard's `read`/`write` accessors or upgrade it.
    pub fn fetch_page_basic(&self, page_id: PageId) -> BufferPoolResult<Option<BasicPageGuard>> {
        let Some(page) = self.fetch_frame(page_id)? else {
            return Ok(None);
        };
        Ok(Some(BasicPageGuard::new(self.clone(), page_id, page)))
    }

    /// Fetches a page, pins it, and takes its shared content latch. The
    /// latch is acquired after the pool latch is released; the pin keeps
    /// the frame resident in between.
    pub fn fetch_page_read(&self, page_id: PageId) -> BufferPoolResult<Option<ReadPageGuard>> {
        let Some(page) = self.fetch_frame(page_id)? else {
            return Ok(None);
        };
        Ok(Some(ReadPageGuard::new(self.clone(), page_id, page)))
    }

    /// Fetches a page, pins it, and takes its exclusive content latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> BufferPoolResult<Option<WritePageGuard>> {
        let Some(page) = self.fetch_frame(page_id)? else {
            return Ok(None);
        };
        Ok(Some(WritePageGuard::new(self.clone(), page_id, page)))
    }

    /// Unpins a page, ORing `is_dirty` into its sticky dirty bit. When
    /// the pin count reaches zero the frame becomes evictable. Returns
    /// false when the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let meta = &mut state.frames[frame_id];
        if meta.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            meta.is_dirty = true;
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true)?;
        }
        Ok(true)
    }

    /// WAL-then-disk write of one page image already copied out of its
    /// frame.
    fn write_image_back(
        state: &mut BufferPoolState,
        page_id: PageId,
        lsn: u64,
        data: &[u8; PAGE_SIZE],
        force_disk: bool,
    ) -> BufferPoolResult<()> {
        if let Some(log_manager) = &state.log_manager {
            log_manager.flush(lsn)?;
        }
        state.disk_manager.write_page(page_id, data)?;
        if force_disk {
            state.disk_manager.sync_data()?;
        }
        Ok(())
    }

    /// Flushes a page to disk regardless of its dirty bit, then clears
    /// the bit. Returns false when the page is not resident. Pin state
    /// is unchanged on return.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        self.flush_page_with_mode(page_id, FlushMode::Lazy)
    }

    pub fn flush_page_with_mode(&self, page_id: PageId, mode: FlushMode) -> BufferPoolResult<bool> {
        // Take a transient pin so the frame stays resident, then copy
        // the image with the pool latch released: a concurrent write
        // guard on this page only delays this flush, never the pool.
        let (frame_id, page) = {
            let mut state = self.lock_state()?;
            let state = &mut *state;
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            state.frames[frame_id].pin_count += 1;
            state.replacer.set_evictable(frame_id, false)?;
            (frame_id, Arc::clone(&state.pages[frame_id]))
        };

        let (data, lsn) = {
            let page = page.read();
            (*page.data(), page.lsn())
        };

        let mut state = self.lock_state()?;
        let state = &mut *state;
        let written = Self::write_image_back(state, page_id, lsn, &data, mode == FlushMode::Force);
        if written.is_ok() {
            state.frames[frame_id].is_dirty = false;
        }
        // Drop the transient pin whether or not the write succeeded.
        state.frames[frame_id].pin_count -= 1;
        if state.frames[frame_id].pin_count == 0 {
            state.replacer.set_evictable(frame_id, true)?;
        }
        written?;
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        self.flush_all_pages_with_mode(FlushMode::Lazy)
    }

    pub fn flush_all_pages_with_mode(&self, mode: FlushMode) -> BufferPoolResult<()> {
        let resident: Vec<PageId> = {
            let state = self.lock_state()?;
            state.page_table.keys().copied().collect()
        };
        for page_id in resident {
            // Pages evicted since the snapshot report not resident and
            // are skipped; eviction already wrote them back.
            self.flush_page_with_mode(page_id, mode)?;
        }
        Ok(())
    }

    /// Drops a page from the pool and deallocates it on disk. Returns
    /// true when the page was not resident to begin with, false when it
    /// is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.frames[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id)?;
        state.frames[frame_id].reset();
        state.pages[frame_id].write().reset();
        state.free_list.push(frame_id);
        state.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Pin count of a resident page, None when not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> BufferPoolResult<Option<u32>> {
        let state = self.lock_state()?;
        Ok(state
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.frames[frame_id].pin_count))
    }
}
