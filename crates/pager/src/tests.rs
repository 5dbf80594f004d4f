use super::*;
use common::Config;
use std::path::Path;
use tempfile::tempdir;

fn config(path: &Path) -> Config {
    Config::builder().path(path.to_path_buf()).build()
}

fn small_config(path: &Path, cache_pages: usize) -> Config {
    Config::builder()
        .path(path.to_path_buf())
        .cache_pages(cache_pages)
        .build()
}

/// FNV-1a over the whole data file, for before/after snapshots.
fn hash_file(path: &Path) -> u64 {
    let bytes = std::fs::read(path).unwrap_or_default();
    let mut hash = 0xcbf29ce484222325u64;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic LCG so stress runs are reproducible.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
        self.0
    }

    fn below(&mut self, max: u32) -> u32 {
        self.next() % max
    }
}

#[test]
fn fresh_file_has_root_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (pager, existed) = Pager::open(&config(&path)).unwrap();
    assert!(!existed);
    assert_eq!(pager.stats().total_pages, 1);
    assert_eq!(pager.stats().free_pages, 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE_SIZE as u64);
}

#[test]
fn reopen_reports_existing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    {
        let (pager, _) = Pager::open(&config(&path)).unwrap();
        pager.close();
    }
    let (_, existed) = Pager::open(&config(&path)).unwrap();
    assert!(existed);
}

#[test]
fn alloc_requires_transaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();
    assert!(pager.alloc().is_err());
    pager.begin().unwrap();
    assert!(pager.alloc().is_ok());
    pager.commit().unwrap();
}

#[test]
fn get_refuses_null_and_out_of_range() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();
    assert!(pager.get(PageId::NULL).unwrap().is_none());
    assert!(pager.get(PageId(99)).unwrap().is_none());
}

#[test]
fn write_survives_commit_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let pid;
    {
        let (mut pager, _) = Pager::open(&config(&path)).unwrap();
        pager.begin().unwrap();
        pid = pager.alloc().unwrap();
        pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = b'a';
        pager.commit().unwrap();
        pager.close();
    }
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();
    let page = pager.get(pid).unwrap().unwrap();
    assert_eq!(page.data[PAGE_HEADER], b'a');
    assert_eq!(page.index(), pid);
}

#[test]
fn rollback_restores_file_exactly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();

    pager.begin().unwrap();
    let p1 = pager.alloc().unwrap();
    pager.get_mut(p1).unwrap().unwrap().data[PAGE_HEADER] = b'a';
    pager.commit().unwrap();

    let before = hash_file(&path);
    let stats_before = pager.stats();

    pager.begin().unwrap();
    pager.get_mut(p1).unwrap().unwrap().data[PAGE_HEADER] = b'b';
    let p2 = pager.alloc().unwrap();
    pager.get_mut(p2).unwrap().unwrap().data[PAGE_HEADER] = b'c';
    pager.sync().unwrap();
    pager.rollback().unwrap();

    assert_eq!(hash_file(&path), before);
    assert_eq!(pager.stats(), stats_before);
    assert_eq!(pager.get(p1).unwrap().unwrap().data[PAGE_HEADER], b'a');
    assert!(pager.get(p2).unwrap().is_none());
}

#[test]
fn commit_changes_file_hash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();
    let before = hash_file(&path);

    pager.begin().unwrap();
    let pid = pager.alloc().unwrap();
    pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = 1;
    pager.commit().unwrap();

    assert_ne!(hash_file(&path), before);
}

#[test]
fn crash_recovery_restores_last_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let pid;
    {
        let (mut pager, _) = Pager::open(&config(&path)).unwrap();
        pager.begin().unwrap();
        pid = pager.alloc().unwrap();
        pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = b'a';
        pager.commit().unwrap();

        // Start a second transaction, push changes all the way to disk, then
        // drop the pager without committing, as a crashed process would.
        pager.begin().unwrap();
        pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = b'b';
        pager.sync().unwrap();
    }

    assert!(journal_exists(&path));
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();
    assert!(!journal_exists(&path));
    assert_eq!(pager.get(pid).unwrap().unwrap().data[PAGE_HEADER], b'a');
}

fn journal_exists(data: &Path) -> bool {
    let mut os = data.as_os_str().to_os_string();
    os.push("-journal");
    Path::new(&os).exists()
}

#[test]
fn freed_pages_are_reused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();

    pager.begin().unwrap();
    let a = pager.alloc().unwrap();
    let b = pager.alloc().unwrap();
    pager.commit().unwrap();

    pager.begin().unwrap();
    pager.free(a).unwrap();
    assert!(pager.get(a).unwrap().is_none());
    let c = pager.alloc().unwrap();
    assert_eq!(c, a, "free list should hand the freed page back");
    assert!(pager.get(b).unwrap().is_some());
    pager.commit().unwrap();
}

#[test]
fn free_is_noop_for_invalid_targets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();

    pager.begin().unwrap();
    let a = pager.alloc().unwrap();
    pager.commit().unwrap();
    let stats = pager.stats();

    // Outside a transaction, and for page 0 or unallocated ids.
    pager.free(a).unwrap();
    assert_eq!(pager.stats(), stats);
    pager.begin().unwrap();
    pager.free(PageId::NULL).unwrap();
    pager.free(PageId(500)).unwrap();
    assert_eq!(pager.stats().free_pages, 0);
    pager.rollback().unwrap();
}

#[test]
fn stats_account_for_every_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();

    pager.begin().unwrap();
    let pages: Vec<PageId> = (0..10).map(|_| pager.alloc().unwrap()).collect();
    for pid in pages.iter().step_by(2) {
        pager.free(*pid).unwrap();
    }
    let stats = pager.stats();
    assert_eq!(stats.used_pages + stats.free_pages, stats.total_pages);
    assert_eq!(stats.free_pages, 5);
    pager.commit().unwrap();

    // The free set must survive a reopen bit for bit.
    pager.close();
    let (pager, _) = Pager::open(&config(&path)).unwrap();
    assert_eq!(pager.stats().free_pages, 5);
}

#[test]
fn cache_eviction_writes_back_dirty_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&small_config(&path, 2)).unwrap();

    pager.begin().unwrap();
    let pages: Vec<PageId> = (0..8).map(|_| pager.alloc().unwrap()).collect();
    for (i, pid) in pages.iter().enumerate() {
        pager.get_mut(*pid).unwrap().unwrap().data[PAGE_HEADER] = i as u8 + 1;
    }
    // Far more pages touched than the cache holds; earlier ones must have
    // round-tripped through disk.
    for (i, pid) in pages.iter().enumerate() {
        let page = pager.get(*pid).unwrap().unwrap();
        assert_eq!(page.data[PAGE_HEADER], i as u8 + 1);
        assert_eq!(page.index(), *pid);
    }
    pager.commit().unwrap();
}

#[test]
fn free_list_spills_across_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&small_config(&path, 16)).unwrap();

    // Enough frees to overflow one free-list page.
    let count = FREE_PAGES_PER_PAGE + 10;
    pager.begin().unwrap();
    let pages: Vec<PageId> = (0..count).map(|_| pager.alloc().unwrap()).collect();
    pager.commit().unwrap();

    pager.begin().unwrap();
    for pid in &pages {
        pager.free(*pid).unwrap();
    }
    let stats = pager.stats();
    assert_eq!(stats.free_pages as usize, count);
    assert_eq!(stats.used_pages + stats.free_pages, stats.total_pages);
    pager.commit().unwrap();

    // Drain the whole list again; every id must come back exactly once.
    pager.begin().unwrap();
    let mut reused: Vec<PageId> = (0..count).map(|_| pager.alloc().unwrap()).collect();
    pager.commit().unwrap();
    reused.sort();
    reused.dedup();
    assert_eq!(reused.len(), count);
    assert_eq!(pager.stats().free_pages, 0);
}

#[test]
fn nested_begin_and_stray_commit_are_noops() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&config(&path)).unwrap();

    pager.commit().unwrap();
    pager.rollback().unwrap();

    pager.begin().unwrap();
    let pid = pager.alloc().unwrap();
    pager.begin().unwrap(); // must not reset the journal
    pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = 9;
    pager.commit().unwrap();
    assert_eq!(pager.get(pid).unwrap().unwrap().data[PAGE_HEADER], 9);
}

/// Randomized begin/alloc/write/free/commit/rollback soak. Rollback must
/// restore the exact file hash; commit must change it.
#[test]
fn stress_random_transactions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p.db");
    let (mut pager, _) = Pager::open(&small_config(&path, 8)).unwrap();

    let mut rng = Rng(42);
    let mut committed: Vec<PageId> = Vec::new();
    let mut txn_pages: Vec<PageId> = Vec::new();
    let mut in_txn = false;
    let mut made_changes = false;
    let mut before_hash = hash_file(&path);
    let mut before_stats = pager.stats();

    for _ in 0..300 {
        let op = if committed.is_empty() && txn_pages.is_empty() {
            0
        } else {
            match rng.below(100) {
                0..=29 => 0,
                30..=59 => 1,
                60..=89 => 2,
                90..=94 => 3,
                _ => 4,
            }
        };

        if !in_txn && op <= 2 {
            before_hash = hash_file(&path);
            before_stats = pager.stats();
            pager.begin().unwrap();
            in_txn = true;
        }

        match op {
            0 => {
                let pid = pager.alloc().unwrap();
                txn_pages.push(pid);
                made_changes = true;
            }
            1 => {
                let total = committed.len() + txn_pages.len();
                let idx = rng.below(total as u32) as usize;
                let pid = if idx < committed.len() {
                    committed[idx]
                } else {
                    txn_pages[idx - committed.len()]
                };
                let value = (rng.below(26) + b'a' as u32) as u8;
                pager.get_mut(pid).unwrap().unwrap().data[PAGE_HEADER] = value;
                assert_eq!(pager.get(pid).unwrap().unwrap().data[PAGE_HEADER], value);
                made_changes = true;
            }
            2 => {
                let total = committed.len() + txn_pages.len();
                let idx = rng.below(total as u32) as usize;
                let pid = if idx < committed.len() {
                    committed.remove(idx)
                } else {
                    txn_pages.remove(idx - committed.len())
                };
                pager.free(pid).unwrap();
                made_changes = true;
            }
            3 if in_txn => {
                pager.rollback().unwrap();
                in_txn = false;
                made_changes = false;
                txn_pages.clear();
                assert_eq!(hash_file(&path), before_hash, "rollback must restore file");
                assert_eq!(pager.stats().free_pages, before_stats.free_pages);
                assert_eq!(pager.stats().total_pages, before_stats.total_pages);
            }
            4 if in_txn && made_changes => {
                pager.commit().unwrap();
                in_txn = false;
                made_changes = false;
                committed.append(&mut txn_pages);
                assert_ne!(hash_file(&path), before_hash, "commit must change file");
            }
            _ => {}
        }

        let stats = pager.stats();
        assert_eq!(stats.used_pages + stats.free_pages, stats.total_pages);
    }

    if in_txn {
        pager.commit().unwrap();
    }
}
