use super::*;
use common::Config;
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use types::DataType;

fn open_pager(dir: &tempfile::TempDir) -> Pager {
    let cfg = Config::builder()
        .path(dir.path().join("tree.db"))
        .cache_pages(16)
        .build();
    let (mut pager, _) = Pager::open(&cfg).unwrap();
    pager.begin().unwrap();
    pager
}

fn u32_tree(pager: &mut Pager) -> BPlusTree {
    BPlusTree::create(pager, DataType::U32, 4, true).unwrap()
}

fn key(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Deterministic LCG, as in the pager stress harness.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
        self.0
    }
}

fn shuffled(n: u32, rng: &mut Rng) -> Vec<u32> {
    let mut keys: Vec<u32> = (0..n).collect();
    for i in (1..keys.len()).rev() {
        let j = (rng.next() as usize) % (i + 1);
        keys.swap(i, j);
    }
    keys
}

#[test]
fn geometry_is_derived_from_sizes() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    // 4072 data bytes, 8 per leaf entry, 8 per internal slot.
    assert_eq!(tree.leaf_max, 509);
    assert_eq!(tree.internal_max, 508);
    assert!(tree.leaf_min >= MIN_ENTRY_COUNT / 2);

    // Oversized records are rejected.
    assert!(BPlusTree::create(&mut pager, DataType::U32, 8000, false).is_err());
}

#[test]
fn empty_tree_cursor_positions() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    assert!(!cur.first(&mut pager).unwrap());
    assert!(!cur.last(&mut pager).unwrap());
    assert!(!cur.seek(&mut pager, &key(5)).unwrap());
    assert_eq!(cur.state(), CursorState::Invalid);
    assert!(tree.is_empty(&mut pager).unwrap());
}

#[test]
fn insert_and_seek_small() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    for v in [5u32, 1, 9, 3, 7] {
        assert!(cur.insert(&mut pager, &key(v), &key(v * 100)).unwrap());
        tree.validate(&mut pager).unwrap();
    }
    assert_eq!(tree.len(&mut pager).unwrap(), 5);

    for v in [1u32, 3, 5, 7, 9] {
        assert!(cur.seek(&mut pager, &key(v)).unwrap());
        assert_eq!(cur.record(&mut pager).unwrap(), key(v * 100));
    }
    assert!(!cur.seek(&mut pager, &key(4)).unwrap());
}

#[test]
fn duplicate_insert_is_rejected() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    assert!(cur.insert(&mut pager, &key(42), &key(1)).unwrap());
    assert!(!cur.insert(&mut pager, &key(42), &key(2)).unwrap());
    assert_eq!(tree.len(&mut pager).unwrap(), 1);
    // The original record must be untouched.
    assert!(cur.seek(&mut pager, &key(42)).unwrap());
    assert_eq!(cur.record(&mut pager).unwrap(), key(1));
}

#[test]
fn update_rewrites_record_in_place() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    cur.insert(&mut pager, &key(7), &key(70)).unwrap();
    assert!(cur.update(&mut pager, &key(71)).unwrap());
    assert!(cur.seek(&mut pager, &key(7)).unwrap());
    assert_eq!(cur.record(&mut pager).unwrap(), key(71));
    assert_eq!(tree.len(&mut pager).unwrap(), 1);
}

#[test]
fn sequential_inserts_split_and_stay_valid() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let count = 3000u32;

    for v in 0..count {
        assert!(cur.insert(&mut pager, &key(v), &key(v * 2)).unwrap());
    }
    tree.validate(&mut pager).unwrap();
    assert_eq!(tree.len(&mut pager).unwrap(), count as u64);

    for v in 0..count {
        assert!(cur.seek(&mut pager, &key(v)).unwrap(), "key {v} missing");
        assert_eq!(cur.record(&mut pager).unwrap(), key(v * 2));
    }
}

#[test]
fn random_inserts_and_full_scan() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let mut rng = Rng(7);
    let keys = shuffled(2000, &mut rng);

    for &v in &keys {
        assert!(cur.insert(&mut pager, &key(v), &key(v ^ 0xdead)).unwrap());
    }
    tree.validate(&mut pager).unwrap();

    // Forward scan sees every key exactly once, in order.
    let mut seen = Vec::new();
    let mut more = cur.first(&mut pager).unwrap();
    while more {
        seen.push(u32::from_le_bytes(cur.key(&mut pager).unwrap().try_into().unwrap()));
        more = cur.next(&mut pager).unwrap();
    }
    let expected: Vec<u32> = (0..2000).collect();
    assert_eq!(seen, expected);

    // Backward scan mirrors it.
    let mut back = Vec::new();
    let mut more = cur.last(&mut pager).unwrap();
    while more {
        back.push(u32::from_le_bytes(cur.key(&mut pager).unwrap().try_into().unwrap()));
        more = cur.prev(&mut pager).unwrap();
    }
    back.reverse();
    assert_eq!(back, expected);
}

#[test]
fn seek_cmp_finds_neighbors() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    for v in [10u32, 20, 30, 40] {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }

    let probe = |cur: &mut Cursor, pager: &mut Pager, v: u32, op| -> Option<u32> {
        if cur.seek_cmp(pager, &key(v), op).unwrap() {
            Some(u32::from_le_bytes(cur.key(pager).unwrap().try_into().unwrap()))
        } else {
            None
        }
    };

    assert_eq!(probe(&mut cur, &mut pager, 20, CompareOp::Eq), Some(20));
    assert_eq!(probe(&mut cur, &mut pager, 25, CompareOp::Eq), None);

    assert_eq!(probe(&mut cur, &mut pager, 25, CompareOp::Ge), Some(30));
    assert_eq!(probe(&mut cur, &mut pager, 20, CompareOp::Ge), Some(20));
    assert_eq!(probe(&mut cur, &mut pager, 20, CompareOp::Gt), Some(30));
    assert_eq!(probe(&mut cur, &mut pager, 40, CompareOp::Gt), None);

    assert_eq!(probe(&mut cur, &mut pager, 25, CompareOp::Le), Some(20));
    assert_eq!(probe(&mut cur, &mut pager, 20, CompareOp::Le), Some(20));
    assert_eq!(probe(&mut cur, &mut pager, 20, CompareOp::Lt), Some(10));
    assert_eq!(probe(&mut cur, &mut pager, 10, CompareOp::Lt), None);
    assert_eq!(probe(&mut cur, &mut pager, 5, CompareOp::Ge), Some(10));
    assert_eq!(probe(&mut cur, &mut pager, 45, CompareOp::Le), Some(40));
}

#[test]
fn seek_cmp_across_leaf_boundaries() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    // Even keys only, enough to span several leaves.
    let count = 4000u32;
    for v in 0..count {
        cur.insert(&mut pager, &key(v * 2), &key(0)).unwrap();
    }

    let mut rng = Rng(99);
    for _ in 0..200 {
        let probe = rng.next() % (count * 2);
        let found = cur.seek_cmp(&mut pager, &key(probe), CompareOp::Ge).unwrap();
        if probe <= (count - 1) * 2 {
            assert!(found);
            let got = u32::from_le_bytes(cur.key(&mut pager).unwrap().try_into().unwrap());
            assert_eq!(got, probe + (probe & 1), "Ge neighbor of {probe}");
        } else {
            assert!(!found);
        }

        let found = cur.seek_cmp(&mut pager, &key(probe), CompareOp::Le).unwrap();
        assert!(found);
        let got = u32::from_le_bytes(cur.key(&mut pager).unwrap().try_into().unwrap());
        assert_eq!(got, probe - (probe & 1), "Le neighbor of {probe}");
    }
}

#[test]
fn delete_drains_tree_forward() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let count = 2000u32;

    for v in 0..count {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    for v in 0..count {
        assert!(cur.seek(&mut pager, &key(v)).unwrap());
        assert!(cur.delete(&mut pager).unwrap());
        if v % 97 == 0 {
            tree.validate(&mut pager).unwrap();
        }
    }
    tree.validate(&mut pager).unwrap();
    assert!(tree.is_empty(&mut pager).unwrap());
    assert!(!cur.first(&mut pager).unwrap());
}

#[test]
fn delete_drains_tree_backward() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let count = 2000u32;

    for v in 0..count {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    for v in (0..count).rev() {
        assert!(cur.seek(&mut pager, &key(v)).unwrap());
        assert!(cur.delete(&mut pager).unwrap());
        if v % 97 == 0 {
            tree.validate(&mut pager).unwrap();
        }
    }
    assert!(tree.is_empty(&mut pager).unwrap());
}

#[test]
fn random_delete_keeps_survivors() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let mut rng = Rng(21);
    let count = 2000u32;
    let keys = shuffled(count, &mut rng);

    for &v in &keys {
        cur.insert(&mut pager, &key(v), &key(v + 1)).unwrap();
    }
    let (gone, kept) = keys.split_at(keys.len() / 2);
    for &v in gone {
        assert!(cur.seek(&mut pager, &key(v)).unwrap());
        assert!(cur.delete(&mut pager).unwrap());
    }
    tree.validate(&mut pager).unwrap();
    assert_eq!(tree.len(&mut pager).unwrap(), kept.len() as u64);

    for &v in gone {
        assert!(!cur.seek(&mut pager, &key(v)).unwrap(), "deleted {v} still present");
    }
    for &v in kept {
        assert!(cur.seek(&mut pager, &key(v)).unwrap(), "survivor {v} missing");
        assert_eq!(cur.record(&mut pager).unwrap(), key(v + 1));
    }
}

#[test]
fn delete_of_missing_key_reports_false() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    cur.insert(&mut pager, &key(1), &key(1)).unwrap();
    assert!(!cur.seek(&mut pager, &key(2)).unwrap());
    // The cursor is clamped to a real entry; delete removes that entry, so
    // check the not-found path through an invalid cursor instead.
    let mut fresh = Cursor::new(tree);
    assert!(!fresh.delete(&mut pager).unwrap());
}

#[test]
fn root_page_id_is_stable_across_splits_and_collapses() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    let root = tree.root_page;
    let count = 3000u32;

    for v in 0..count {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    // Multiple levels now exist, yet the descriptor still opens at the same
    // root page.
    let reopened = BPlusTree::open(root, DataType::U32, 4).unwrap();
    let mut cur2 = Cursor::new(reopened);
    assert!(cur2.seek(&mut pager, &key(1500)).unwrap());

    for v in 0..count {
        cur.seek(&mut pager, &key(v)).unwrap();
        cur.delete(&mut pager).unwrap();
    }
    tree.validate(&mut pager).unwrap();
    assert!(tree.is_empty(&mut pager).unwrap());
    assert_eq!(tree.root_page, root);
}

#[test]
fn char_keys_order_lexicographically() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = BPlusTree::create(&mut pager, DataType::char(16), 4, true).unwrap();
    let mut cur = Cursor::new(tree);

    let make = |s: &str| {
        let mut k = [0u8; 16];
        k[..s.len()].copy_from_slice(s.as_bytes());
        k
    };
    for name in ["delta", "alpha", "charlie", "bravo"] {
        cur.insert(&mut pager, &make(name), &key(0)).unwrap();
    }

    let mut seen = Vec::new();
    let mut more = cur.first(&mut pager).unwrap();
    while more {
        let k = cur.key(&mut pager).unwrap();
        let end = k.iter().position(|&b| b == 0).unwrap_or(k.len());
        seen.push(String::from_utf8(k[..end].to_vec()).unwrap());
        more = cur.next(&mut pager).unwrap();
    }
    assert_eq!(seen, vec!["alpha", "bravo", "charlie", "delta"]);
}

#[test]
fn dual_keys_support_composite_ranges() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let dual = DataType::dual(DataType::U32, DataType::U32).unwrap();
    let tree = BPlusTree::create(&mut pager, dual, 0, true).unwrap();
    let mut cur = Cursor::new(tree);

    let make = |user: u32, order: u32| {
        let mut k = user.to_le_bytes().to_vec();
        k.extend_from_slice(&order.to_le_bytes());
        k
    };
    for user in 1..=3u32 {
        for order in 1..=5u32 {
            assert!(cur.insert(&mut pager, &make(user, order), &[]).unwrap());
        }
    }
    tree.validate(&mut pager).unwrap();

    // Range scan: user 2, orders >= 3.
    assert!(cur.seek_cmp(&mut pager, &make(2, 3), CompareOp::Ge).unwrap());
    let mut hits = Vec::new();
    loop {
        let k = cur.key(&mut pager).unwrap();
        let user = u32::from_le_bytes(k[..4].try_into().unwrap());
        let order = u32::from_le_bytes(k[4..].try_into().unwrap());
        if user != 2 {
            break;
        }
        hits.push(order);
        if !cur.next(&mut pager).unwrap() {
            break;
        }
    }
    assert_eq!(hits, vec![3, 4, 5]);
}

#[test]
fn clear_releases_all_pages() {
    let dir = tempdir().unwrap();
    let mut pager = open_pager(&dir);
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);

    for v in 0..2000u32 {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    let before = pager.stats();
    assert!(before.total_pages > 3);

    tree.clear(&mut pager).unwrap();
    let after = pager.stats();
    assert_eq!(after.used_pages + after.free_pages, after.total_pages);
    // Only the pager root (plus free-list bookkeeping) stays in use.
    assert!(after.free_pages >= before.total_pages - 2);
    assert!(pager.get(tree.root_page).unwrap().is_none());
}

#[test]
fn mutations_roll_back_with_the_transaction() {
    let dir = tempdir().unwrap();
    let cfg = Config::builder().path(dir.path().join("tree.db")).build();
    let (mut pager, _) = Pager::open(&cfg).unwrap();

    pager.begin().unwrap();
    let tree = u32_tree(&mut pager);
    let mut cur = Cursor::new(tree);
    for v in 0..100u32 {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    pager.commit().unwrap();

    pager.begin().unwrap();
    for v in 100..1500u32 {
        cur.insert(&mut pager, &key(v), &key(v)).unwrap();
    }
    pager.rollback().unwrap();

    tree.validate(&mut pager).unwrap();
    assert_eq!(tree.len(&mut pager).unwrap(), 100);
    assert!(cur.seek(&mut pager, &key(50)).unwrap());
    assert!(!cur.seek(&mut pager, &key(200)).unwrap());
}
