use super::*;
use common::Config;
use tempfile::tempdir;

fn open_pager(dir: &tempfile::TempDir) -> Pager {
    let cfg = Config::builder().path(dir.path().join("blob.db")).build();
    let (pager, _) = Pager::open(&cfg).unwrap();
    pager
}

fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn empty_blob_is_null() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    pager.begin().unwrap();
    let head = create(&mut pager, &[]).unwrap();
    assert!(head.is_null());
    assert!(read_full(&mut pager, head).unwrap().is_empty());
    pager.commit().unwrap();
}

#[test]
fn round_trip_boundary_sizes() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);

    for n in [1, HEAD_CAPACITY, HEAD_CAPACITY + 1, 3 * HEAD_CAPACITY] {
        let bytes = pattern(n);
        pager.begin().unwrap();
        let head = create(&mut pager, &bytes).unwrap();
        pager.commit().unwrap();
        assert_eq!(read_full(&mut pager, head).unwrap(), bytes, "size {n}");
    }
}

#[test]
fn round_trip_survives_reopen() {
    let dir = tempdir().unwrap();
    let bytes = pattern(2 * HEAD_CAPACITY + 17);
    let head;
    {
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        head = create(&mut pager, &bytes).unwrap();
        pager.commit().unwrap();
        pager.close();
    }
    let mut pager = open_pager(&dir);
    assert_eq!(read_full(&mut pager, head).unwrap(), bytes);
}

#[test]
fn streamed_read_matches_full_read() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let bytes = pattern(2 * HEAD_CAPACITY + CHAIN_CAPACITY / 2);

    pager.begin().unwrap();
    let head = create(&mut pager, &bytes).unwrap();
    pager.commit().unwrap();

    let (size, mut next, first) = read_head(&mut pager, head).unwrap();
    let mut streamed = first;
    while !next.is_null() {
        let (chunk, following) = read_page(&mut pager, next).unwrap();
        streamed.extend_from_slice(&chunk);
        next = following;
    }
    streamed.truncate(size as usize);
    assert_eq!(streamed, bytes);
}

#[test]
fn delete_releases_every_page() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let bytes = pattern(3 * HEAD_CAPACITY);

    pager.begin().unwrap();
    let head = create(&mut pager, &bytes).unwrap();
    pager.commit().unwrap();
    let before = pager.stats();

    pager.begin().unwrap();
    delete(&mut pager, head).unwrap();
    pager.commit().unwrap();

    let after = pager.stats();
    assert_eq!(after.total_pages, before.total_pages);
    assert!(after.free_pages > before.free_pages);
    assert!(pager.get(head).unwrap().is_none(), "head must be unreachable");

    // Freed chain pages feed later allocations.
    pager.begin().unwrap();
    let reused = pager.alloc().unwrap();
    assert!(reused.0 < before.total_pages);
    pager.commit().unwrap();
}

#[test]
fn delete_of_null_is_noop() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    delete(&mut pager, PageId::NULL).unwrap();
}

#[test]
fn blob_create_rolls_back_with_transaction() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);

    pager.begin().unwrap();
    let head = create(&mut pager, &pattern(HEAD_CAPACITY + 1)).unwrap();
    pager.rollback().unwrap();

    assert!(pager.get(head).unwrap().is_none());
    assert_eq!(pager.stats().total_pages, 1);
}
