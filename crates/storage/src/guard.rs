use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::PageId;
use crate::buffer::BufferPoolManager;
use crate::page::Page;

type PageLock = Arc<RwLock<Page>>;
type SharedPageLatch = ArcRwLockReadGuard<RawRwLock, Page>;
type ExclusivePageLatch = ArcRwLockWriteGuard<RawRwLock, Page>;

// Guards are move-only and their inner state is taken exactly once, on
// drop or on upgrade, so this is unreachable through the public API.
const RELEASED: &str = "page guard used after release";

/// Pin-owning page handle without a held content latch.
///
/// Dropping the guard unpins the page, dirty iff the guard wrote (or
/// was explicitly marked). Constructed only by the buffer pool.
pub struct BasicPageGuard {
    inner: Option<BasicGuardInner>,
}

struct BasicGuardInner {
    bpm: BufferPoolManager,
    page_id: PageId,
    page: PageLock,
    is_dirty: bool,
}

impl BasicPageGuard {
    pub(crate) fn new(bpm: BufferPoolManager, page_id: PageId, page: PageLock) -> Self {
        Self {
            inner: Some(BasicGuardInner {
                bpm,
                page_id,
                page,
                is_dirty: false,
            }),
        }
    }

    fn inner(&self) -> &BasicGuardInner {
        self.inner.as_ref().expect(RELEASED)
    }

    pub fn page_id(&self) -> PageId {
        self.inner().page_id
    }

    /// Takes the shared content latch for the duration of the borrow.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.inner().page.read()
    }

    /// Takes the exclusive content latch for the duration of the borrow
    /// and marks the guard dirty.
    pub fn write(&mut self) -> RwLockWriteGuard<'_, Page> {
        let inner = self.inner.as_mut().expect(RELEASED);
        inner.is_dirty = true;
        inner.page.write()
    }

    /// Marks the page dirty without writing through this guard.
    pub fn mark_dirty(&mut self) {
        self.inner.as_mut().expect(RELEASED).is_dirty = true;
    }

    /// Trades this guard for one holding the shared content latch. The
    /// pin (and any dirty mark) carries over; no unpin happens here.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        let inner = self.inner.take().expect(RELEASED);
        ReadPageGuard::with_dirty(inner.bpm, inner.page_id, inner.page, inner.is_dirty)
    }

    /// Trades this guard for one holding the exclusive content latch.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        let inner = self.inner.take().expect(RELEASED);
        WritePageGuard::new(inner.bpm, inner.page_id, inner.page)
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.bpm.unpin_page(inner.page_id, inner.is_dirty);
        }
    }
}

/// Pin-owning page handle that holds the shared content latch.
pub struct ReadPageGuard {
    inner: Option<ReadGuardInner>,
}

struct ReadGuardInner {
    bpm: BufferPoolManager,
    page_id: PageId,
    is_dirty: bool,
    latch: SharedPageLatch,
}

impl ReadPageGuard {
    pub(crate) fn new(bpm: BufferPoolManager, page_id: PageId, page: PageLock) -> Self {
        Self::with_dirty(bpm, page_id, page, false)
    }

    fn with_dirty(
        bpm: BufferPoolManager,
        page_id: PageId,
        page: PageLock,
        is_dirty: bool,
    ) -> Self {
        let latch = page.read_arc();
        Self {
            inner: Some(ReadGuardInner {
                bpm,
                page_id,
                is_dirty,
                latch,
            }),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.as_ref().expect(RELEASED).page_id
    }

    /// Marks the page dirty on release despite the shared latch, for
    /// holders that mutated it through other means.
    pub fn mark_dirty(&mut self) {
        self.inner.as_mut().expect(RELEASED).is_dirty = true;
    }
}

impl Deref for ReadPageGuard {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.inner.as_ref().expect(RELEASED).latch
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let ReadGuardInner {
                bpm,
                page_id,
                is_dirty,
                latch,
            } = inner;
            // The content latch must release before unpin re-enters the
            // pool latch.
            drop(latch);
            let _ = bpm.unpin_page(page_id, is_dirty);
        }
    }
}

/// Pin-owning page handle that holds the exclusive content latch.
/// Releasing it always unpins dirty.
pub struct WritePageGuard {
    inner: Option<WriteGuardInner>,
}

struct WriteGuardInner {
    bpm: BufferPoolManager,
    page_id: PageId,
    latch: ExclusivePageLatch,
}

impl WritePageGuard {
    pub(crate) fn new(bpm: BufferPoolManager, page_id: PageId, page: PageLock) -> Self {
        let latch = page.write_arc();
        Self {
            inner: Some(WriteGuardInner {
                bpm,
                page_id,
                latch,
            }),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.inner.as_ref().expect(RELEASED).page_id
    }
}

impl Deref for WritePageGuard {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.inner.as_ref().expect(RELEASED).latch
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.as_mut().expect(RELEASED).latch
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let WriteGuardInner {
                bpm,
                page_id,
                latch,
            } = inner;
            drop(latch);
            let _ = bpm.unpin_page(page_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{BufferPoolManager, DiskManager, PAGE_LSN_SIZE, PageId};
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    struct TestContext {
        path: PathBuf,
    }

    impl TestContext {
        fn new(test_name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("silt_guard_{}.db", test_name));
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
            Self { path }
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn setup(test_name: &str, pool_size: usize) -> (TestContext, BufferPoolManager, PageId) {
        let ctx = TestContext::new(test_name);
        let disk_manager = DiskManager::open(ctx.path.to_str().unwrap()).unwrap();
        let bpm = BufferPoolManager::new(disk_manager, pool_size, 2);
        let page_id = bpm.new_page().unwrap().unwrap();
        assert!(bpm.unpin_page(page_id, false).unwrap());
        (ctx, bpm, page_id)
    }

    #[test]
    fn test_guard_round_trip_leaves_pin_unchanged() {
        let (_ctx, bpm, page_id) = setup("round_trip", 2);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));

        {
            let guard = bpm.fetch_page_basic(page_id).unwrap().unwrap();
            assert_eq!(guard.page_id(), page_id);
            assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));
        }
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));

        {
            let _guard = bpm.fetch_page_write(page_id).unwrap().unwrap();
            assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));
        }
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));
    }

    #[test]
    fn test_read_guards_share_the_page() {
        let (_ctx, bpm, page_id) = setup("shared_reads", 2);

        let first = bpm.fetch_page_read(page_id).unwrap().unwrap();
        let second = bpm.fetch_page_read(page_id).unwrap().unwrap();
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(2));
        assert_eq!(first.lsn(), second.lsn());

        drop(first);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));
        drop(second);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));
    }

    #[test]
    fn test_basic_guard_data_access() {
        let (_ctx, bpm, page_id) = setup("basic_access", 2);

        {
            let mut guard = bpm.fetch_page_basic(page_id).unwrap().unwrap();
            guard.write().write_bytes(PAGE_LSN_SIZE, b"basic");
            assert_eq!(
                guard.read().read_bytes(PAGE_LSN_SIZE, 5).unwrap(),
                b"basic"
            );
        }

        let guard = bpm.fetch_page_read(page_id).unwrap().unwrap();
        assert_eq!(guard.read_bytes(PAGE_LSN_SIZE, 5).unwrap(), b"basic");
    }

    #[test]
    fn test_upgrade_keeps_the_pin() {
        let (_ctx, bpm, page_id) = setup("upgrade", 2);

        let basic = bpm.fetch_page_basic(page_id).unwrap().unwrap();
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));

        let mut write = basic.upgrade_write();
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));
        write.write_bytes(PAGE_LSN_SIZE, b"up");
        drop(write);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));

        let basic = bpm.fetch_page_basic(page_id).unwrap().unwrap();
        let read = basic.upgrade_read();
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));
        assert_eq!(read.read_bytes(PAGE_LSN_SIZE, 2).unwrap(), b"up");
        drop(read);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));
    }

    #[test]
    fn test_moved_guard_unpins_once() {
        let (_ctx, bpm, page_id) = setup("moves", 2);

        let guard = bpm.fetch_page_basic(page_id).unwrap().unwrap();
        let mut holder = Vec::new();
        holder.push(guard);
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(1));

        holder.clear();
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));
    }

    #[test]
    fn test_write_guard_excludes_readers() {
        let (_ctx, bpm, page_id) = setup("exclusion", 2);

        // The exclusive latch is held before the reader is spawned, so
        // the reader cannot observe the page until after the write.
        let mut write = bpm.fetch_page_write(page_id).unwrap().unwrap();
        let reader = {
            let bpm = bpm.clone();
            thread::spawn(move || {
                let guard = bpm.fetch_page_read(page_id).unwrap().unwrap();
                guard.read_bytes(PAGE_LSN_SIZE, 5).unwrap().to_vec()
            })
        };

        thread::sleep(Duration::from_millis(20));
        write.write_bytes(PAGE_LSN_SIZE, b"XLOCK");
        drop(write);

        assert_eq!(reader.join().unwrap(), b"XLOCK");
        assert_eq!(bpm.get_pin_count(page_id).unwrap(), Some(0));
    }
}
