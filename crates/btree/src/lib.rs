//! Disk-resident B+tree: an ordered map from fixed-size typed keys to
//! fixed-size records, built on pager storage.
//!
//! All data lives in leaves; internal nodes only route. Leaves form a
//! doubly linked chain for ordered scans. Fan-out is derived from the key
//! and record sizes when a tree is created, so one node always fills one
//! page exactly. Structural changes preserve the root's page id by swapping
//! page contents, which keeps catalog root references valid across splits
//! and collapses.
//!
//! Cursors never hold page pointers, only a leaf page id and an entry
//! index; the pager is free to evict and re-read pages between operations.

mod node;

#[cfg(test)]
mod tests;

use common::{CompareOp, DbError, DbResult, PageId};
use node::{NODE_DATA, Node};
use pager::Pager;
use types::DataType;

/// Smallest fan-out a tree may be created with; keys or records so large
/// that fewer entries fit in a node are rejected.
pub const MIN_ENTRY_COUNT: u32 = 3;

const MAX_DEPTH: usize = 64;

/// B+tree configuration. Cheap to copy; all state lives in pages, so a
/// cursor can carry its own copy of this descriptor.
#[derive(Clone, Copy, Debug)]
pub struct BPlusTree {
    pub root_page: PageId,
    pub key_type: DataType,
    pub record_size: u32,
    pub(crate) key_size: u32,
    pub(crate) leaf_max: u32,
    pub(crate) leaf_min: u32,
    pub(crate) leaf_split: u32,
    pub(crate) internal_max: u32,
    pub(crate) internal_min: u32,
    pub(crate) internal_split: u32,
}

impl BPlusTree {
    /// Create a tree: derive fan-outs and, when `init` is set, allocate an
    /// empty leaf as the root. Allocation requires an open transaction.
    pub fn create(
        pager: &mut Pager,
        key_type: DataType,
        record_size: u32,
        init: bool,
    ) -> DbResult<Self> {
        let mut tree = Self::with_geometry(PageId::NULL, key_type, record_size)?;
        if init {
            let root = pager.alloc()?;
            tree.root_page = root;
            tree.write_node(pager, &Node::new_leaf(root))?;
        }
        Ok(tree)
    }

    /// Reconstruct the descriptor for an existing tree. Geometry derivation
    /// is deterministic, so only the root id, key type, and record size need
    /// to be stored elsewhere.
    pub fn open(root_page: PageId, key_type: DataType, record_size: u32) -> DbResult<Self> {
        let mut tree = Self::with_geometry(root_page, key_type, record_size)?;
        tree.root_page = root_page;
        Ok(tree)
    }

    fn with_geometry(root_page: PageId, key_type: DataType, record_size: u32) -> DbResult<Self> {
        let key_size = key_type.total_size();
        if key_size == 0 {
            return Err(DbError::Tree("key type has no size".into()));
        }
        let leaf_max = NODE_DATA as u32 / (key_size + record_size);
        let internal_max = (NODE_DATA as u32 - 4) / (key_size + 4);
        if leaf_max < MIN_ENTRY_COUNT || internal_max < MIN_ENTRY_COUNT {
            return Err(DbError::Tree(format!(
                "key/record too large for one page: {leaf_max} leaf entries"
            )));
        }
        Ok(Self {
            root_page,
            key_type,
            record_size,
            key_size,
            leaf_max,
            leaf_min: leaf_max / 2,
            leaf_split: leaf_max / 2,
            internal_max,
            internal_min: (internal_max - 1) / 2,
            internal_split: internal_max / 2,
        })
    }

    /// Free every page of the tree, the root included.
    pub fn clear(&self, pager: &mut Pager) -> DbResult<()> {
        let mut stack = vec![self.root_page];
        while let Some(pid) = stack.pop() {
            let node = self.read_node(pager, pid)?;
            if !node.is_leaf() {
                for i in 0..=node.num_keys() {
                    stack.push(node.child(self, i));
                }
            }
            pager.free(pid)?;
        }
        Ok(())
    }

    /// Entry count over a full leaf scan.
    pub fn len(&self, pager: &mut Pager) -> DbResult<u64> {
        let mut count = 0u64;
        let mut pid = self.leftmost_leaf(pager)?;
        let mut hops = 0usize;
        while !pid.is_null() {
            let node = self.read_node(pager, pid)?;
            count += node.num_keys() as u64;
            pid = node.next_leaf();
            hops += 1;
            if hops > 1 << 24 {
                return Err(DbError::Tree("leaf chain does not terminate".into()));
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self, pager: &mut Pager) -> DbResult<bool> {
        let root = self.read_node(pager, self.root_page)?;
        Ok(root.is_leaf() && root.num_keys() == 0)
    }

    // ---- Node I/O ----

    fn read_node(&self, pager: &mut Pager, pid: PageId) -> DbResult<Node> {
        let page = pager
            .get(pid)?
            .ok_or_else(|| DbError::Tree(format!("tree page {} not found", pid.0)))?;
        Ok(Node::from_page(page))
    }

    fn write_node(&self, pager: &mut Pager, node: &Node) -> DbResult<()> {
        let page = pager
            .get_mut(node.index())?
            .ok_or_else(|| DbError::Tree(format!("tree page {} not found", node.index().0)))?;
        page.data.copy_from_slice(node.page.as_slice());
        Ok(())
    }

    fn find_leaf(&self, pager: &mut Pager, key: &[u8]) -> DbResult<PageId> {
        let mut pid = self.root_page;
        for _ in 0..MAX_DEPTH {
            let node = self.read_node(pager, pid)?;
            if node.is_leaf() {
                return Ok(pid);
            }
            pid = node.child(self, node.child_index(self, key));
        }
        Err(DbError::Tree("tree deeper than the depth bound".into()))
    }

    fn leftmost_leaf(&self, pager: &mut Pager) -> DbResult<PageId> {
        self.edge_leaf(pager, false)
    }

    fn rightmost_leaf(&self, pager: &mut Pager) -> DbResult<PageId> {
        self.edge_leaf(pager, true)
    }

    fn edge_leaf(&self, pager: &mut Pager, rightmost: bool) -> DbResult<PageId> {
        let mut pid = self.root_page;
        for _ in 0..MAX_DEPTH {
            let node = self.read_node(pager, pid)?;
            if node.is_leaf() {
                return Ok(pid);
            }
            let i = if rightmost { node.num_keys() } else { 0 };
            pid = node.child(self, i);
        }
        Err(DbError::Tree("tree deeper than the depth bound".into()))
    }

    // ---- Insertion ----

    fn insert_entry(&self, pager: &mut Pager, key: &[u8], record: &[u8]) -> DbResult<bool> {
        let leaf_pid = self.find_leaf(pager, key)?;
        let node = self.read_node(pager, leaf_pid)?;
        let (_, exact) = node.lower_bound(self, key);
        if exact {
            return Ok(false);
        }

        let leaf_pid = if node.num_keys() == self.leaf_max {
            self.split_leaf(pager, leaf_pid)?;
            // The split may have grown the tree; descend again.
            self.find_leaf(pager, key)?
        } else {
            leaf_pid
        };

        let mut node = self.read_node(pager, leaf_pid)?;
        let (pos, _) = node.lower_bound(self, key);
        node.leaf_insert(self, pos, key, record);
        self.write_node(pager, &node)?;
        Ok(true)
    }

    /// Move the root's payload to a fresh page and leave the root as an
    /// internal node with that page as its only child. Keeps the root's
    /// page id stable across splits.
    fn demote_root(&self, pager: &mut Pager) -> DbResult<PageId> {
        let root = self.read_node(pager, self.root_page)?;
        let new_pid = pager.alloc()?;

        let mut moved = root;
        moved.set_index(new_pid);
        moved.set_parent(self.root_page);
        if !moved.is_leaf() {
            for i in 0..=moved.num_keys() {
                self.set_parent_of(pager, moved.child(self, i), new_pid)?;
            }
        }
        self.write_node(pager, &moved)?;

        let mut new_root = Node::new_internal(self.root_page);
        new_root.set_child(self, 0, new_pid);
        self.write_node(pager, &new_root)?;
        Ok(new_pid)
    }

    fn set_parent_of(&self, pager: &mut Pager, pid: PageId, parent: PageId) -> DbResult<()> {
        let mut node = self.read_node(pager, pid)?;
        node.set_parent(parent);
        self.write_node(pager, &node)
    }

    fn split_leaf(&self, pager: &mut Pager, pid: PageId) -> DbResult<()> {
        let pid = if pid == self.root_page {
            self.demote_root(pager)?
        } else {
            pid
        };

        let mut node = self.read_node(pager, pid)?;
        let right_pid = pager.alloc()?;
        let mut right = Node::new_leaf(right_pid);

        let n = node.num_keys();
        let split = self.leaf_split;
        for i in split..n {
            right.set_key(self, i - split, node.key(self, i));
            if self.record_size > 0 {
                right.set_record(self, i - split, node.record(self, i));
            }
        }
        right.set_num_keys(n - split);
        node.set_num_keys(split);

        right.set_parent(node.parent());
        right.set_next_leaf(node.next_leaf());
        right.set_prev_leaf(pid);
        node.set_next_leaf(right_pid);
        if !right.next_leaf().is_null() {
            let mut after = self.read_node(pager, right.next_leaf())?;
            after.set_prev_leaf(right_pid);
            self.write_node(pager, &after)?;
        }

        let separator = right.key(self, 0).to_vec();
        let parent = node.parent();
        self.write_node(pager, &node)?;
        self.write_node(pager, &right)?;
        self.insert_separator(pager, parent, &separator, right_pid)
    }

    /// Insert a separator and its right child into an internal node,
    /// splitting it first when full.
    fn insert_separator(
        &self,
        pager: &mut Pager,
        pid: PageId,
        key: &[u8],
        right_child: PageId,
    ) -> DbResult<()> {
        let mut pid = pid;
        let node = self.read_node(pager, pid)?;
        if node.num_keys() == self.internal_max {
            let (left_pid, mid, right_pid) = self.split_internal(pager, pid)?;
            pid = if types::compare(self.key_type, key, &mid) == std::cmp::Ordering::Less {
                left_pid
            } else {
                right_pid
            };
        }

        let mut node = self.read_node(pager, pid)?;
        let pos = node.child_index(self, key);
        node.internal_insert(self, pos, key, right_child);
        self.write_node(pager, &node)?;
        self.set_parent_of(pager, right_child, pid)
    }

    fn split_internal(&self, pager: &mut Pager, pid: PageId) -> DbResult<(PageId, Vec<u8>, PageId)> {
        let pid = if pid == self.root_page {
            self.demote_root(pager)?
        } else {
            pid
        };

        let mut node = self.read_node(pager, pid)?;
        let right_pid = pager.alloc()?;
        let mut right = Node::new_internal(right_pid);

        let n = node.num_keys();
        let split = self.internal_split;
        let mid = node.key(self, split).to_vec();
        for i in (split + 1)..n {
            right.set_key(self, i - split - 1, node.key(self, i));
        }
        for i in (split + 1)..=n {
            right.set_child(self, i - split - 1, node.child(self, i));
        }
        right.set_num_keys(n - split - 1);
        right.set_parent(node.parent());
        node.set_num_keys(split);

        for i in 0..=right.num_keys() {
            self.set_parent_of(pager, right.child(self, i), right_pid)?;
        }

        let parent = node.parent();
        self.write_node(pager, &node)?;
        self.write_node(pager, &right)?;
        self.insert_separator(pager, parent, &mid, right_pid)?;
        Ok((pid, mid, right_pid))
    }

    // ---- Deletion ----

    fn delete_at(&self, pager: &mut Pager, leaf_pid: PageId, pos: u32) -> DbResult<()> {
        let mut node = self.read_node(pager, leaf_pid)?;
        let old_key = node.key(self, pos).to_vec();
        node.leaf_remove(self, pos);
        self.write_node(pager, &node)?;

        // The leaf is the source of truth for its own minimum; any ancestor
        // separator that was a copy of the removed key must follow it.
        if pos == 0 && node.num_keys() > 0 && leaf_pid != self.root_page {
            let new_min = node.key(self, 0).to_vec();
            self.fix_separators(pager, leaf_pid, &old_key, &new_min)?;
        }

        self.rebalance(pager, leaf_pid)
    }

    fn fix_separators(
        &self,
        pager: &mut Pager,
        from: PageId,
        old_key: &[u8],
        new_min: &[u8],
    ) -> DbResult<()> {
        let mut child = from;
        for _ in 0..MAX_DEPTH {
            let node = self.read_node(pager, child)?;
            let parent_pid = node.parent();
            if parent_pid.is_null() {
                return Ok(());
            }
            let mut parent = self.read_node(pager, parent_pid)?;
            if let Some(cpos) = parent.child_position(self, child) {
                if cpos > 0
                    && types::compare(self.key_type, parent.key(self, cpos - 1), old_key)
                        == std::cmp::Ordering::Equal
                {
                    parent.set_key(self, cpos - 1, new_min);
                    self.write_node(pager, &parent)?;
                }
            }
            child = parent_pid;
        }
        Ok(())
    }

    fn min_keys_of(&self, node: &Node) -> u32 {
        if node.is_leaf() {
            self.leaf_min
        } else {
            self.internal_min
        }
    }

    fn rebalance(&self, pager: &mut Pager, pid: PageId) -> DbResult<()> {
        let node = self.read_node(pager, pid)?;

        if pid == self.root_page {
            // The root may underflow freely; an empty internal root collapses
            // into its only child, an empty leaf root stays as is.
            if !node.is_leaf() && node.num_keys() == 0 {
                self.collapse_root(pager)?;
            }
            return Ok(());
        }

        if node.num_keys() >= self.min_keys_of(&node) {
            return Ok(());
        }

        let parent_pid = node.parent();
        let parent = self.read_node(pager, parent_pid)?;
        let cpos = parent
            .child_position(self, pid)
            .ok_or_else(|| DbError::Tree(format!("page {} missing from its parent", pid.0)))?;

        if cpos > 0 {
            let left = self.read_node(pager, parent.child(self, cpos - 1))?;
            if left.num_keys() > self.min_keys_of(&left) {
                return self.borrow_from_left(pager, parent_pid, cpos);
            }
        }
        if cpos < parent.num_keys() {
            let right = self.read_node(pager, parent.child(self, cpos + 1))?;
            if right.num_keys() > self.min_keys_of(&right) {
                return self.borrow_from_right(pager, parent_pid, cpos);
            }
        }

        // Merge with the right sibling, or the left when this is the
        // rightmost child.
        let lpos = if cpos == parent.num_keys() { cpos - 1 } else { cpos };
        self.merge_children(pager, parent_pid, lpos)?;
        self.rebalance(pager, parent_pid)
    }

    fn borrow_from_left(&self, pager: &mut Pager, parent_pid: PageId, cpos: u32) -> DbResult<()> {
        let mut parent = self.read_node(pager, parent_pid)?;
        let left_pid = parent.child(self, cpos - 1);
        let node_pid = parent.child(self, cpos);
        let mut left = self.read_node(pager, left_pid)?;
        let mut node = self.read_node(pager, node_pid)?;
        let last = left.num_keys() - 1;

        if node.is_leaf() {
            let key = left.key(self, last).to_vec();
            let record = left.record(self, last).to_vec();
            node.leaf_insert(self, 0, &key, &record);
            left.set_num_keys(last);
            parent.set_key(self, cpos - 1, &key);
        } else {
            let separator = parent.key(self, cpos - 1).to_vec();
            let moved_child = left.child(self, last + 1);
            node.internal_insert_front(self, &separator, moved_child);
            parent.set_key(self, cpos - 1, left.key(self, last));
            left.set_num_keys(last);
            self.set_parent_of(pager, moved_child, node_pid)?;
        }

        self.write_node(pager, &left)?;
        self.write_node(pager, &node)?;
        self.write_node(pager, &parent)
    }

    fn borrow_from_right(&self, pager: &mut Pager, parent_pid: PageId, cpos: u32) -> DbResult<()> {
        let mut parent = self.read_node(pager, parent_pid)?;
        let node_pid = parent.child(self, cpos);
        let right_pid = parent.child(self, cpos + 1);
        let mut node = self.read_node(pager, node_pid)?;
        let mut right = self.read_node(pager, right_pid)?;

        if node.is_leaf() {
            let key = right.key(self, 0).to_vec();
            let record = right.record(self, 0).to_vec();
            node.leaf_insert(self, node.num_keys(), &key, &record);
            right.leaf_remove(self, 0);
            parent.set_key(self, cpos, right.key(self, 0));
        } else {
            let separator = parent.key(self, cpos).to_vec();
            let moved_child = right.child(self, 0);
            node.internal_push_back(self, &separator, moved_child);
            parent.set_key(self, cpos, right.key(self, 0));
            right.internal_remove_front(self);
            self.set_parent_of(pager, moved_child, node_pid)?;
        }

        self.write_node(pager, &node)?;
        self.write_node(pager, &right)?;
        self.write_node(pager, &parent)
    }

    /// Merge `child[lpos + 1]` into `child[lpos]`, dropping one separator
    /// from the parent and freeing the drained page.
    fn merge_children(&self, pager: &mut Pager, parent_pid: PageId, lpos: u32) -> DbResult<()> {
        let mut parent = self.read_node(pager, parent_pid)?;
        let left_pid = parent.child(self, lpos);
        let right_pid = parent.child(self, lpos + 1);
        let mut left = self.read_node(pager, left_pid)?;
        let right = self.read_node(pager, right_pid)?;
        let n = left.num_keys();

        if left.is_leaf() {
            for i in 0..right.num_keys() {
                left.set_key(self, n + i, right.key(self, i));
                if self.record_size > 0 {
                    left.set_record(self, n + i, right.record(self, i));
                }
            }
            left.set_num_keys(n + right.num_keys());
            left.set_next_leaf(right.next_leaf());
            if !right.next_leaf().is_null() {
                let mut after = self.read_node(pager, right.next_leaf())?;
                after.set_prev_leaf(left_pid);
                self.write_node(pager, &after)?;
            }
        } else {
            left.set_key(self, n, parent.key(self, lpos));
            for i in 0..right.num_keys() {
                left.set_key(self, n + 1 + i, right.key(self, i));
            }
            for i in 0..=right.num_keys() {
                let moved = right.child(self, i);
                left.set_child(self, n + 1 + i, moved);
                self.set_parent_of(pager, moved, left_pid)?;
            }
            left.set_num_keys(n + 1 + right.num_keys());
        }

        parent.internal_remove(self, lpos);
        self.write_node(pager, &left)?;
        self.write_node(pager, &parent)?;
        pager.free(right_pid)
    }

    /// Replace an empty internal root with its only child, keeping the
    /// root's page id.
    fn collapse_root(&self, pager: &mut Pager) -> DbResult<()> {
        let root = self.read_node(pager, self.root_page)?;
        let child_pid = root.child(self, 0);
        let child = self.read_node(pager, child_pid)?;

        let mut promoted = child;
        promoted.set_index(self.root_page);
        promoted.set_parent(PageId::NULL);
        if promoted.is_leaf() {
            promoted.set_next_leaf(PageId::NULL);
            promoted.set_prev_leaf(PageId::NULL);
        } else {
            for i in 0..=promoted.num_keys() {
                self.set_parent_of(pager, promoted.child(self, i), self.root_page)?;
            }
        }
        self.write_node(pager, &promoted)?;
        pager.free(child_pid)
    }

    // ---- Structural validation ----

    /// Walk the whole tree checking every structural invariant: uniform leaf
    /// depth, parent links, strict key order, child-key separation, node
    /// fill bounds, and the leaf chain. Test harnesses call this after every
    /// mutation.
    pub fn validate(&self, pager: &mut Pager) -> DbResult<()> {
        let mut leaf_depth: Option<usize> = None;
        let mut ordered_count = 0u64;
        self.validate_node(
            pager,
            self.root_page,
            PageId::NULL,
            0,
            None,
            None,
            &mut leaf_depth,
            &mut ordered_count,
        )?;
        self.validate_leaf_chain(pager, ordered_count)
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_node(
        &self,
        pager: &mut Pager,
        pid: PageId,
        parent: PageId,
        depth: usize,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        leaf_depth: &mut Option<usize>,
        ordered_count: &mut u64,
    ) -> DbResult<()> {
        if depth > MAX_DEPTH {
            return Err(DbError::Tree("validate: depth bound exceeded".into()));
        }
        let node = self.read_node(pager, pid)?;
        let n = node.num_keys();

        if node.parent() != parent {
            return Err(DbError::Tree(format!(
                "validate: page {} has parent {}, expected {}",
                pid.0,
                node.parent().0,
                parent.0
            )));
        }
        if pid != self.root_page {
            let min = self.min_keys_of(&node);
            let max = if node.is_leaf() {
                self.leaf_max
            } else {
                self.internal_max
            };
            if n < min || n > max {
                return Err(DbError::Tree(format!(
                    "validate: page {} holds {n} keys outside [{min}, {max}]",
                    pid.0
                )));
            }
        }

        for i in 0..n {
            if i + 1 < n
                && types::compare(self.key_type, node.key(self, i), node.key(self, i + 1))
                    != std::cmp::Ordering::Less
            {
                return Err(DbError::Tree(format!(
                    "validate: page {} keys not strictly increasing at {i}",
                    pid.0
                )));
            }
            if let Some(lo) = &lower {
                if types::compare(self.key_type, node.key(self, i), lo) == std::cmp::Ordering::Less {
                    return Err(DbError::Tree(format!(
                        "validate: page {} key below subtree bound",
                        pid.0
                    )));
                }
            }
            if let Some(hi) = &upper {
                if types::compare(self.key_type, node.key(self, i), hi) != std::cmp::Ordering::Less {
                    return Err(DbError::Tree(format!(
                        "validate: page {} key at or above subtree bound",
                        pid.0
                    )));
                }
            }
        }

        if node.is_leaf() {
            match leaf_depth {
                Some(expected) if *expected != depth => {
                    return Err(DbError::Tree(format!(
                        "validate: leaf {} at depth {depth}, expected {expected}",
                        pid.0
                    )));
                }
                None => *leaf_depth = Some(depth),
                _ => {}
            }
            *ordered_count += n as u64;
            return Ok(());
        }

        for i in 0..=n {
            let child = node.child(self, i);
            if child == pid {
                return Err(DbError::Tree(format!("validate: page {} is its own child", pid.0)));
            }
            let child_lower = if i == 0 {
                lower.clone()
            } else {
                Some(node.key(self, i - 1).to_vec())
            };
            let child_upper = if i == n {
                upper.clone()
            } else {
                Some(node.key(self, i).to_vec())
            };
            self.validate_node(
                pager,
                child,
                pid,
                depth + 1,
                child_lower,
                child_upper,
                leaf_depth,
                ordered_count,
            )?;
        }
        Ok(())
    }

    fn validate_leaf_chain(&self, pager: &mut Pager, expected: u64) -> DbResult<()> {
        let first = self.leftmost_leaf(pager)?;
        let mut pid = first;
        let mut prev = PageId::NULL;
        let mut count = 0u64;
        let mut last_key: Option<Vec<u8>> = None;
        let mut hops = 0u64;

        while !pid.is_null() {
            hops += 1;
            if hops > expected + 2 {
                return Err(DbError::Tree("validate: leaf chain has a cycle".into()));
            }
            let node = self.read_node(pager, pid)?;
            if !node.is_leaf() {
                return Err(DbError::Tree(format!(
                    "validate: chain page {} is not a leaf",
                    pid.0
                )));
            }
            if node.prev_leaf() != prev {
                return Err(DbError::Tree(format!(
                    "validate: leaf {} prev link broken",
                    pid.0
                )));
            }
            if node.next_leaf() == pid || node.prev_leaf() == pid {
                return Err(DbError::Tree(format!(
                    "validate: leaf {} references itself",
                    pid.0
                )));
            }
            for i in 0..node.num_keys() {
                if let Some(last) = &last_key {
                    if types::compare(self.key_type, last, node.key(self, i))
                        != std::cmp::Ordering::Less
                    {
                        return Err(DbError::Tree(
                            "validate: leaf chain out of order".into(),
                        ));
                    }
                }
                last_key = Some(node.key(self, i).to_vec());
                count += 1;
            }
            prev = pid;
            pid = node.next_leaf();
        }

        if count != expected {
            return Err(DbError::Tree(format!(
                "validate: chain count {count} != tree count {expected}"
            )));
        }
        let rightmost = self.rightmost_leaf(pager)?;
        if prev != rightmost && expected > 0 {
            return Err(DbError::Tree("validate: chain does not end at the rightmost leaf".into()));
        }
        Ok(())
    }
}

/// Position within an ordered container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// Not positioned on an entry.
    Invalid,
    /// Positioned on a live entry.
    Valid,
    /// The referenced page disappeared underneath the cursor.
    Fault,
}

/// B+tree cursor. Refers to its position by page id and index only, so
/// cache eviction between operations is harmless.
#[derive(Clone, Debug)]
pub struct Cursor {
    tree: BPlusTree,
    leaf: PageId,
    index: u32,
    state: CursorState,
}

impl Cursor {
    pub fn new(tree: BPlusTree) -> Self {
        Self {
            tree,
            leaf: PageId::NULL,
            index: 0,
            state: CursorState::Invalid,
        }
    }

    pub fn tree(&self) -> &BPlusTree {
        &self.tree
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    /// Raw positioning: descend to the target leaf and report the lower
    /// bound there without clamping.
    fn seek_raw(&mut self, pager: &mut Pager, key: &[u8]) -> DbResult<(bool, u32, u32)> {
        let leaf_pid = self.tree.find_leaf(pager, key)?;
        let node = self.tree.read_node(pager, leaf_pid)?;
        let (pos, exact) = node.lower_bound(&self.tree, key);
        self.leaf = leaf_pid;
        let n = node.num_keys();
        if n == 0 {
            self.state = CursorState::Invalid;
            self.index = 0;
        } else {
            self.state = CursorState::Valid;
            self.index = pos.min(n - 1);
        }
        Ok((exact, pos, n))
    }

    /// Position at the matching entry, or at the insertion point clamped to
    /// the target leaf's last entry when the key is absent. Returns whether
    /// an exact match was found.
    pub fn seek(&mut self, pager: &mut Pager, key: &[u8]) -> DbResult<bool> {
        let (exact, _, _) = self.seek_raw(pager, key)?;
        Ok(exact)
    }

    /// Position at the first entry satisfying `op` relative to `key`,
    /// walking forward for Ge/Gt and backward for Le/Lt. Returns whether a
    /// qualifying entry exists.
    pub fn seek_cmp(&mut self, pager: &mut Pager, key: &[u8], op: CompareOp) -> DbResult<bool> {
        let (exact, pos, n) = self.seek_raw(pager, key)?;
        if n == 0 {
            return Ok(false);
        }
        match op {
            CompareOp::Eq | CompareOp::Ne => Ok(exact),
            CompareOp::Ge => {
                if pos < n {
                    self.index = pos;
                    Ok(true)
                } else {
                    self.next(pager)
                }
            }
            CompareOp::Gt => {
                let found = self.seek_cmp(pager, key, CompareOp::Ge)?;
                if !found {
                    return Ok(false);
                }
                if types::compare(self.tree.key_type, &self.key(pager)?, key)
                    == std::cmp::Ordering::Equal
                {
                    return self.next(pager);
                }
                Ok(true)
            }
            CompareOp::Le => {
                if exact {
                    self.index = pos;
                    return Ok(true);
                }
                if pos == n {
                    // Every key in this leaf is smaller; the clamp already
                    // points at the largest.
                    self.index = n - 1;
                    return Ok(true);
                }
                if pos > 0 {
                    self.index = pos - 1;
                    return Ok(true);
                }
                self.index = pos;
                self.prev(pager)
            }
            CompareOp::Lt => {
                let found = self.seek_cmp(pager, key, CompareOp::Le)?;
                if !found {
                    return Ok(false);
                }
                if types::compare(self.tree.key_type, &self.key(pager)?, key)
                    == std::cmp::Ordering::Equal
                {
                    return self.prev(pager);
                }
                Ok(true)
            }
        }
    }

    /// Move to the first entry. Returns false on an empty tree.
    pub fn first(&mut self, pager: &mut Pager) -> DbResult<bool> {
        let leaf = self.tree.leftmost_leaf(pager)?;
        let node = self.tree.read_node(pager, leaf)?;
        self.leaf = leaf;
        self.index = 0;
        if node.num_keys() == 0 {
            self.state = CursorState::Invalid;
            Ok(false)
        } else {
            self.state = CursorState::Valid;
            Ok(true)
        }
    }

    /// Move to the last entry. Returns false on an empty tree.
    pub fn last(&mut self, pager: &mut Pager) -> DbResult<bool> {
        let leaf = self.tree.rightmost_leaf(pager)?;
        let node = self.tree.read_node(pager, leaf)?;
        self.leaf = leaf;
        if node.num_keys() == 0 {
            self.index = 0;
            self.state = CursorState::Invalid;
            Ok(false)
        } else {
            self.index = node.num_keys() - 1;
            self.state = CursorState::Valid;
            Ok(true)
        }
    }

    /// Advance along the leaf chain. Past the last entry the cursor goes
    /// invalid and false comes back.
    pub fn next(&mut self, pager: &mut Pager) -> DbResult<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let node = match pager.get(self.leaf)? {
            Some(page) => Node::from_page(page),
            None => {
                self.state = CursorState::Fault;
                return Ok(false);
            }
        };
        if self.index + 1 < node.num_keys() {
            self.index += 1;
            return Ok(true);
        }
        let next = node.next_leaf();
        if next.is_null() {
            self.state = CursorState::Invalid;
            return Ok(false);
        }
        self.leaf = next;
        self.index = 0;
        Ok(true)
    }

    /// Step backward along the leaf chain.
    pub fn prev(&mut self, pager: &mut Pager) -> DbResult<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let node = match pager.get(self.leaf)? {
            Some(page) => Node::from_page(page),
            None => {
                self.state = CursorState::Fault;
                return Ok(false);
            }
        };
        if self.index > 0 {
            self.index -= 1;
            return Ok(true);
        }
        let prev = node.prev_leaf();
        if prev.is_null() {
            self.state = CursorState::Invalid;
            return Ok(false);
        }
        let prev_node = self.tree.read_node(pager, prev)?;
        self.leaf = prev;
        self.index = prev_node.num_keys().saturating_sub(1);
        Ok(true)
    }

    /// Key bytes at the current position.
    pub fn key(&mut self, pager: &mut Pager) -> DbResult<Vec<u8>> {
        let node = self.current_node(pager)?;
        Ok(node.key(&self.tree, self.index).to_vec())
    }

    /// Record bytes at the current position.
    pub fn record(&mut self, pager: &mut Pager) -> DbResult<Vec<u8>> {
        let node = self.current_node(pager)?;
        Ok(node.record(&self.tree, self.index).to_vec())
    }

    fn current_node(&mut self, pager: &mut Pager) -> DbResult<Node> {
        if self.state != CursorState::Valid {
            return Err(DbError::Tree("cursor is not positioned on an entry".into()));
        }
        match pager.get(self.leaf)? {
            Some(page) => {
                let node = Node::from_page(page);
                if self.index >= node.num_keys() {
                    self.state = CursorState::Fault;
                    return Err(DbError::Tree("cursor points past its leaf".into()));
                }
                Ok(node)
            }
            None => {
                self.state = CursorState::Fault;
                Err(DbError::Tree("cursor leaf page disappeared".into()))
            }
        }
    }

    /// Insert a key/record pair. Duplicates are rejected with `Ok(false)`;
    /// on success the cursor is left on the new entry.
    pub fn insert(&mut self, pager: &mut Pager, key: &[u8], record: &[u8]) -> DbResult<bool> {
        if !self.tree.insert_entry(pager, key, record)? {
            // Leave the cursor on the conflicting entry.
            self.seek(pager, key)?;
            return Ok(false);
        }
        self.seek(pager, key)?;
        Ok(true)
    }

    /// Overwrite the record at the current position; the key is unchanged.
    pub fn update(&mut self, pager: &mut Pager, record: &[u8]) -> DbResult<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let mut node = self.current_node(pager)?;
        node.set_record(&self.tree, self.index, record);
        self.tree.write_node(pager, &node)?;
        Ok(true)
    }

    /// Remove the current entry and rebalance. The cursor is re-anchored at
    /// the deleted key's former position, clamped to the surviving leaf, or
    /// invalidated when the tree became empty.
    pub fn delete(&mut self, pager: &mut Pager) -> DbResult<bool> {
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let old_key = self.key(pager)?;
        self.tree.delete_at(pager, self.leaf, self.index)?;
        self.seek(pager, &old_key)?;
        Ok(true)
    }
}
