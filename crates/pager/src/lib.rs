//! Page cache, free-list manager, and atomic-commit journal.
//!
//! The pager owns the single data file: an array of fixed-size pages. It
//! hands out cached page references by id, recycles freed pages through an
//! on-disk free-list, and brackets every mutation in a rollback journal so
//! that a crash at any point leaves the file recoverable to the last commit.
//!
//! Write path within a transaction: the first modification of a page appends
//! its pre-image to the journal (fsynced), then the cache copy is updated.
//! Commit flushes dirty pages plus the root to the data file, fsyncs, and
//! deletes the journal; rollback (or recovery on the next open) replays the
//! journal and truncates the file back to its pre-transaction length.
//!
//! # Example
//!
//! ```no_run
//! use common::Config;
//! use pager::Pager;
//!
//! let cfg = Config::builder().path("/tmp/demo.db".into()).build();
//! let (mut pager, _existed) = Pager::open(&cfg).unwrap();
//! pager.begin().unwrap();
//! let pid = pager.alloc().unwrap();
//! pager.get_mut(pid).unwrap().unwrap().data[32] = 7;
//! pager.commit().unwrap();
//! ```

mod journal;

#[cfg(test)]
mod tests;

use common::{Config, DbError, DbResult, PageId};
use hashbrown::HashSet;
use journal::Journal;
use lru::LruCache;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

/// Fixed page size of the data file; unit of I/O, caching and journaling.
pub const PAGE_SIZE: usize = 4096;

/// Default page-cache capacity in pages.
pub const MAX_CACHE_ENTRIES: usize = 100;

/// Bytes reserved at the start of every page for its own index.
pub const PAGE_HEADER: usize = 4;

// Root page layout, after the index word.
const ROOT_COUNTER: usize = 4;
const ROOT_FREE_HEAD: usize = 8;

// Free-list page layout, after the index word.
const FREE_NEXT: usize = 4;
const FREE_PREV: usize = 8;
const FREE_POINTER: usize = 12;
const FREE_SLOTS: usize = 16;
/// Freed page ids one free-list page can hold.
pub const FREE_PAGES_PER_PAGE: usize = (PAGE_SIZE - FREE_SLOTS) / 4;

/// One cached page. The first four bytes always hold the page's own index,
/// which is what lets journal entries be raw page images.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    fn zeroed(index: PageId) -> Box<Page> {
        let mut page = Box::new(Page {
            data: [0u8; PAGE_SIZE],
        });
        page.write_u32(0, index.0);
        page
    }

    pub fn index(&self) -> PageId {
        PageId(self.read_u32(0))
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Aggregate pager counters, used by tests and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagerStats {
    pub total_pages: u32,
    pub used_pages: u32,
    pub free_pages: u32,
    pub cached_pages: u32,
    pub dirty_pages: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Root {
    /// Next page id to hand out when the free list is empty.
    page_counter: u32,
    /// Most recent free-list page, 0 when the free list is empty.
    free_page_head: u32,
}

impl Root {
    fn from_image(image: &[u8; PAGE_SIZE]) -> Root {
        Root {
            page_counter: u32::from_le_bytes(image[ROOT_COUNTER..ROOT_COUNTER + 4].try_into().unwrap()),
            free_page_head: u32::from_le_bytes(
                image[ROOT_FREE_HEAD..ROOT_FREE_HEAD + 4].try_into().unwrap(),
            ),
        }
    }

    fn to_image(self) -> [u8; PAGE_SIZE] {
        let mut image = [0u8; PAGE_SIZE];
        image[..4].copy_from_slice(&PageId::ROOT.0.to_le_bytes());
        image[ROOT_COUNTER..ROOT_COUNTER + 4].copy_from_slice(&self.page_counter.to_le_bytes());
        image[ROOT_FREE_HEAD..ROOT_FREE_HEAD + 4].copy_from_slice(&self.free_page_head.to_le_bytes());
        image
    }
}

/// Pager over a single data file.
pub struct Pager {
    path: PathBuf,
    file: File,
    journal: Journal,
    root: Root,
    cache: LruCache<PageId, Box<Page>>,
    dirty: HashSet<PageId>,
    /// Pages whose pre-image already sits in the journal this transaction.
    journaled: HashSet<PageId>,
    /// Pages first allocated in this transaction; rollback reclaims them by
    /// truncation, so they are never journaled.
    fresh: HashSet<PageId>,
    /// Ids that are free-list pages or entries inside them. `get` refuses
    /// these.
    free_set: HashSet<PageId>,
    in_txn: bool,
    sync_on_commit: bool,
}

impl Pager {
    /// Open or create the data file. A leftover journal from an aborted
    /// process is replayed before anything else, so the returned pager always
    /// sees the last committed state. Returns whether the file existed.
    pub fn open(cfg: &Config) -> DbResult<(Self, bool)> {
        let path = cfg.path.clone();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut journal = Journal::new(&path);
        if journal.exists() {
            log::warn!("found journal for {}, rolling back", path.display());
            journal.replay(&mut file)?;
        }

        let existed = file.metadata()?.len() >= PAGE_SIZE as u64;
        let root = if existed {
            let mut image = [0u8; PAGE_SIZE];
            read_page_at(&mut file, PageId::ROOT, &mut image)?;
            Root::from_image(&image)
        } else {
            let root = Root {
                page_counter: 1,
                free_page_head: 0,
            };
            write_page_at(&mut file, PageId::ROOT, &root.to_image())?;
            file.sync_data()?;
            root
        };

        let free_set = scan_free_list(&mut file, root)?;
        let cache_pages = cfg.cache_pages.max(2);

        Ok((
            Self {
                path,
                file,
                journal,
                root,
                cache: LruCache::new(NonZeroUsize::new(cache_pages).unwrap()),
                dirty: HashSet::new(),
                journaled: HashSet::new(),
                fresh: HashSet::new(),
                free_set,
                in_txn: false,
                sync_on_commit: cfg.sync_on_commit,
            },
            existed,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    /// Fetch a page for reading. `Ok(None)` when the id is 0, past the
    /// allocation counter, or sitting in the free set.
    pub fn get(&mut self, pid: PageId) -> DbResult<Option<&Page>> {
        if !self.is_live(pid) {
            return Ok(None);
        }
        Ok(Some(self.fetch(pid)?))
    }

    /// Fetch a page for writing. Journals the pre-image on first touch and
    /// marks the page dirty. Mutation requires an open transaction.
    pub fn get_mut(&mut self, pid: PageId) -> DbResult<Option<&mut Page>> {
        if !self.is_live(pid) {
            return Ok(None);
        }
        self.mark_dirty(pid)?;
        Ok(Some(self.fetch_mut(pid)?))
    }

    /// Journal a page's pre-image (once per transaction) and mark it dirty.
    /// Pages created inside the current transaction are not journaled;
    /// rollback reclaims them by truncating the file.
    pub fn mark_dirty(&mut self, pid: PageId) -> DbResult<()> {
        if !self.in_txn {
            return Err(DbError::Txn("page modified outside a transaction".into()));
        }
        self.journal_page(pid)?;
        self.dirty.insert(pid);
        Ok(())
    }

    /// Allocate a page: pop the free list when possible, otherwise bump the
    /// page counter. The page comes back zero-filled (bar its index word) and
    /// dirty. Rejected outside a transaction.
    pub fn alloc(&mut self) -> DbResult<PageId> {
        if !self.in_txn {
            return Err(DbError::Txn("page allocated outside a transaction".into()));
        }

        let pid = if self.root.free_page_head == 0 {
            let pid = PageId(self.root.page_counter);
            self.root.page_counter += 1;
            self.fresh.insert(pid);
            pid
        } else {
            let pid = self.pop_free_list()?;
            // The reclaimed page carried pre-transaction content; journal it
            // before the zero-fill below destroys it.
            self.journal_page(pid)?;
            pid
        };

        self.install(pid, Page::zeroed(pid))?;
        self.dirty.insert(pid);
        Ok(pid)
    }

    /// Return a page to the free list. No-op outside a transaction, for page
    /// 0, and for ids that are unallocated or already free.
    pub fn free(&mut self, pid: PageId) -> DbResult<()> {
        if !self.in_txn
            || pid.is_null()
            || pid.0 >= self.root.page_counter
            || self.free_set.contains(&pid)
        {
            return Ok(());
        }

        self.journal_page(pid)?;
        self.push_free_list(pid)?;
        self.free_set.insert(pid);
        Ok(())
    }

    /// Begin a transaction. Nested begins are no-ops.
    pub fn begin(&mut self) -> DbResult<()> {
        if self.in_txn {
            return Ok(());
        }
        self.journal.begin(&self.root.to_image())?;
        self.journaled.clear();
        self.fresh.clear();
        self.in_txn = true;
        Ok(())
    }

    /// Commit: flush dirty pages and the root, fsync the data file, then
    /// delete the journal. No-op outside a transaction.
    pub fn commit(&mut self) -> DbResult<()> {
        if !self.in_txn {
            return Ok(());
        }
        self.flush()?;
        if self.sync_on_commit {
            self.file.sync_data()?;
        }
        self.journal.remove()?;
        self.journaled.clear();
        self.fresh.clear();
        self.in_txn = false;
        log::debug!("commit: {} pages total", self.root.page_counter);
        Ok(())
    }

    /// Roll the transaction back: restore every journaled pre-image, truncate
    /// the data file to its pre-transaction length, and rebuild the cache and
    /// free set from disk. No-op outside a transaction.
    pub fn rollback(&mut self) -> DbResult<()> {
        if !self.in_txn {
            return Ok(());
        }
        let restored = self.journal.replay(&mut self.file)?;
        if let Some(image) = restored {
            self.root = Root::from_image(&image);
        }
        self.cache.clear();
        self.dirty.clear();
        self.journaled.clear();
        self.fresh.clear();
        self.free_set = scan_free_list(&mut self.file, self.root)?;
        self.in_txn = false;
        log::debug!("rollback: restored to {} pages", self.root.page_counter);
        Ok(())
    }

    /// Flush dirty cache entries and the root page to the data file and
    /// fsync. Does not end the transaction or touch the journal.
    pub fn sync(&mut self) -> DbResult<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn stats(&self) -> PagerStats {
        let free = self.free_set.len() as u32;
        PagerStats {
            total_pages: self.root.page_counter,
            used_pages: self.root.page_counter - free,
            free_pages: free,
            cached_pages: self.cache.len() as u32,
            dirty_pages: self.dirty.len() as u32,
        }
    }

    /// Close file handles without an implicit commit. A transaction left
    /// open keeps its journal on disk, and the next open rolls it back.
    pub fn close(mut self) {
        self.journal.close();
    }

    // ---- Cache internals ----

    fn is_live(&self, pid: PageId) -> bool {
        !pid.is_null() && pid.0 < self.root.page_counter && !self.free_set.contains(&pid)
    }

    /// Load a page into the cache without liveness checks. Free-list pages
    /// are fetched through this path.
    fn fetch(&mut self, pid: PageId) -> DbResult<&Page> {
        self.ensure_cached(pid)?;
        Ok(self.cache.get(&pid).unwrap())
    }

    fn fetch_mut(&mut self, pid: PageId) -> DbResult<&mut Page> {
        self.ensure_cached(pid)?;
        Ok(self.cache.get_mut(&pid).unwrap())
    }

    fn ensure_cached(&mut self, pid: PageId) -> DbResult<()> {
        if self.cache.contains(&pid) {
            // Promote to MRU so compound free-list updates cannot evict a
            // page they are still linking.
            self.cache.promote(&pid);
            return Ok(());
        }
        let mut page = Page::zeroed(pid);
        read_page_at(&mut self.file, pid, &mut page.data)?;
        if page.read_u32(0) != pid.0 {
            // Never-written tail page; stamp the index word.
            page.write_u32(0, pid.0);
        }
        self.install(pid, page)
    }

    fn install(&mut self, pid: PageId, page: Box<Page>) -> DbResult<()> {
        self.evict_if_needed()?;
        self.cache.push(pid, page);
        Ok(())
    }

    fn evict_if_needed(&mut self) -> DbResult<()> {
        if self.cache.len() < self.cache.cap().get() {
            return Ok(());
        }
        if let Some((pid, page)) = self.cache.pop_lru() {
            if self.dirty.remove(&pid) {
                write_page_at(&mut self.file, pid, &page.data)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> DbResult<()> {
        let dirty: Vec<PageId> = self.dirty.iter().copied().collect();
        for pid in dirty {
            if let Some(page) = self.cache.peek(&pid) {
                write_page_at(&mut self.file, pid, &page.data)?;
            }
            self.dirty.remove(&pid);
        }
        write_page_at(&mut self.file, PageId::ROOT, &self.root.to_image())?;
        Ok(())
    }

    /// Append the page's current content to the journal unless it was
    /// already captured this transaction or was created inside it.
    fn journal_page(&mut self, pid: PageId) -> DbResult<()> {
        if self.journaled.contains(&pid) || self.fresh.contains(&pid) {
            return Ok(());
        }
        let mut image = [0u8; PAGE_SIZE];
        if let Some(page) = self.cache.peek(&pid) {
            image.copy_from_slice(&page.data);
        } else {
            read_page_at(&mut self.file, pid, &mut image)?;
            image[..4].copy_from_slice(&pid.0.to_le_bytes());
        }
        self.journal.append(&image)?;
        self.journaled.insert(pid);
        Ok(())
    }

    // ---- Free-list internals ----

    /// Pop one reusable id off the free list. The head page's slots drain
    /// first; an empty head page is itself the next allocation, and the list
    /// head retreats to its predecessor.
    fn pop_free_list(&mut self) -> DbResult<PageId> {
        let head = PageId(self.root.free_page_head);
        self.journal_page(head)?;
        let head_page = self.fetch_mut(head)?;
        let pointer = head_page.read_u32(FREE_POINTER);

        if pointer > 0 {
            let slot = FREE_SLOTS + (pointer as usize - 1) * 4;
            let pid = PageId(head_page.read_u32(slot));
            head_page.write_u32(FREE_POINTER, pointer - 1);
            self.dirty.insert(head);
            self.free_set.remove(&pid);
            Ok(pid)
        } else {
            // Hand the drained head page itself back to the caller.
            let prev = PageId(head_page.read_u32(FREE_PREV));
            self.root.free_page_head = prev.0;
            if !prev.is_null() {
                self.journal_page(prev)?;
                let prev_page = self.fetch_mut(prev)?;
                prev_page.write_u32(FREE_NEXT, 0);
                self.dirty.insert(prev);
            }
            self.free_set.remove(&head);
            Ok(head)
        }
    }

    /// Push a freed id onto the head free-list page. A full (or missing)
    /// head turns the freed page itself into the new head, so extending the
    /// free list never consumes a fresh page.
    fn push_free_list(&mut self, pid: PageId) -> DbResult<()> {
        let head = PageId(self.root.free_page_head);

        if !head.is_null() {
            self.journal_page(head)?;
            let head_page = self.fetch_mut(head)?;
            let pointer = head_page.read_u32(FREE_POINTER);
            if (pointer as usize) < FREE_PAGES_PER_PAGE {
                head_page.write_u32(FREE_SLOTS + pointer as usize * 4, pid.0);
                head_page.write_u32(FREE_POINTER, pointer + 1);
                self.dirty.insert(head);
                return Ok(());
            }
        }

        // No head, or head full: the freed page becomes the new head.
        let mut page = Page::zeroed(pid);
        page.write_u32(FREE_PREV, head.0);
        self.install(pid, page)?;
        self.dirty.insert(pid);

        if !head.is_null() {
            self.journal_page(head)?;
            let head_page = self.fetch_mut(head)?;
            head_page.write_u32(FREE_NEXT, pid.0);
            self.dirty.insert(head);
        }
        self.root.free_page_head = pid.0;
        Ok(())
    }
}

/// Reconstruct the free set by walking the free-list chain once: every chain
/// page plus every id recorded in its slots.
fn scan_free_list(file: &mut File, root: Root) -> DbResult<HashSet<PageId>> {
    let mut free = HashSet::new();
    let mut cursor = PageId(root.free_page_head);
    let mut image = [0u8; PAGE_SIZE];
    while !cursor.is_null() {
        if !free.insert(cursor) {
            return Err(DbError::Storage(format!(
                "free-list cycle at page {}",
                cursor.0
            )));
        }
        read_page_at(file, cursor, &mut image)?;
        let pointer = u32::from_le_bytes(image[FREE_POINTER..FREE_POINTER + 4].try_into().unwrap());
        for i in 0..pointer as usize {
            let slot = FREE_SLOTS + i * 4;
            free.insert(PageId(u32::from_le_bytes(
                image[slot..slot + 4].try_into().unwrap(),
            )));
        }
        cursor = PageId(u32::from_le_bytes(
            image[FREE_PREV..FREE_PREV + 4].try_into().unwrap(),
        ));
    }
    Ok(free)
}

/// Read one page from the file. Reads past EOF (never-flushed tail pages)
/// leave the buffer zeroed.
pub(crate) fn read_page_at(file: &mut File, pid: PageId, buf: &mut [u8; PAGE_SIZE]) -> DbResult<()> {
    buf.fill(0);
    file.seek(SeekFrom::Start(pid.0 as u64 * PAGE_SIZE as u64))?;
    let mut filled = 0;
    while filled < PAGE_SIZE {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(())
}

pub(crate) fn write_page_at(file: &mut File, pid: PageId, buf: &[u8; PAGE_SIZE]) -> DbResult<()> {
    file.seek(SeekFrom::Start(pid.0 as u64 * PAGE_SIZE as u64))?;
    file.write_all(buf)?;
    Ok(())
}
