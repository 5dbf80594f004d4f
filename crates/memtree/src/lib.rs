//! Ephemeral red-black tree for intermediate query results.
//!
//! Offers the same cursor surface as the persistent B+tree but lives
//! entirely in memory: ORDER BY and GROUP BY state goes here and is thrown
//! away with the tree when the query ends. Nodes and their inline key and
//! record bytes come from a pool owned by the tree, so teardown is one
//! deallocation and deleted nodes are simply unlinked, never freed one by
//! one.
//!
//! With `allow_duplicates` the tree orders entries by key and then by
//! record bytes, so repeated insertions of identical keys all survive and
//! traversal visits each one. The `rebalance` flag can be switched off for
//! build-once scan-once workloads, degrading insertion to plain BST shape
//! in exchange for skipping the color fix-up.


use common::{CompareOp, DbError, DbResult};
use std::cmp::Ordering;
use types::DataType;

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    left: u32,
    right: u32,
    parent: u32,
    color: Color,
}

/// In-memory ordered map from fixed-size keys to fixed-size records.
pub struct MemTree {
    nodes: Vec<Node>,
    bytes: Vec<u8>,
    root: u32,
    key_type: DataType,
    key_size: u32,
    record_size: u32,
    data_size: u32,
    node_count: u32,
    allow_duplicates: bool,
    rebalance: bool,
}

impl MemTree {
    pub fn new(key_type: DataType, record_size: u32, allow_duplicates: bool) -> DbResult<Self> {
        let key_size = key_type.total_size();
        if key_size == 0 {
            return Err(DbError::Tree("key type has no size".into()));
        }
        Ok(Self {
            nodes: Vec::new(),
            bytes: Vec::new(),
            root: NIL,
            key_type,
            key_size,
            record_size,
            data_size: key_size + record_size,
            node_count: 0,
            allow_duplicates,
            rebalance: true,
        })
    }

    /// Disable the red-black fix-up: inserts keep plain BST shape.
    pub fn with_rebalance(mut self, rebalance: bool) -> Self {
        self.rebalance = rebalance;
        self
    }

    pub fn key_type(&self) -> DataType {
        self.key_type
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn len(&self) -> u32 {
        self.node_count
    }

    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }

    // ---- Node pool ----

    fn data_offset(&self, id: u32) -> usize {
        id as usize * self.data_size as usize
    }

    fn key_of(&self, id: u32) -> &[u8] {
        let off = self.data_offset(id);
        &self.bytes[off..off + self.key_size as usize]
    }

    fn record_of(&self, id: u32) -> &[u8] {
        let off = self.data_offset(id) + self.key_size as usize;
        &self.bytes[off..off + self.record_size as usize]
    }

    fn record_mut(&mut self, id: u32) -> &mut [u8] {
        let off = self.data_offset(id) + self.key_size as usize;
        &mut self.bytes[off..off + self.record_size as usize]
    }

    fn new_node(&mut self, key: &[u8], record: &[u8]) -> u32 {
        let id = self.nodes.len() as u32;
        let off = self.bytes.len();
        self.bytes.resize(off + self.data_size as usize, 0);
        let ks = (self.key_size as usize).min(key.len());
        self.bytes[off..off + ks].copy_from_slice(&key[..ks]);
        let rec_off = off + self.key_size as usize;
        let rs = (self.record_size as usize).min(record.len());
        self.bytes[rec_off..rec_off + rs].copy_from_slice(&record[..rs]);
        self.nodes.push(Node {
            left: NIL,
            right: NIL,
            parent: NIL,
            color: Color::Red,
        });
        id
    }

    fn left(&self, id: u32) -> u32 {
        self.nodes[id as usize].left
    }

    fn right(&self, id: u32) -> u32 {
        self.nodes[id as usize].right
    }

    fn parent(&self, id: u32) -> u32 {
        self.nodes[id as usize].parent
    }

    fn color(&self, id: u32) -> Color {
        if id == NIL {
            Color::Black
        } else {
            self.nodes[id as usize].color
        }
    }

    fn set_color(&mut self, id: u32, color: Color) {
        if id != NIL {
            self.nodes[id as usize].color = color;
        }
    }

    /// Entry ordering: by key, then by record bytes when duplicates are
    /// allowed, so identical entries sort next to each other.
    fn entry_cmp(&self, key: &[u8], record: &[u8], id: u32) -> Ordering {
        let ord = types::compare(self.key_type, key, self.key_of(id));
        if ord != Ordering::Equal || !self.allow_duplicates {
            return ord;
        }
        record[..self.record_size as usize].cmp(self.record_of(id))
    }

    // ---- Search ----

    fn min_node(&self, mut id: u32) -> u32 {
        while id != NIL && self.left(id) != NIL {
            id = self.left(id);
        }
        id
    }

    fn max_node(&self, mut id: u32) -> u32 {
        while id != NIL && self.right(id) != NIL {
            id = self.right(id);
        }
        id
    }

    fn successor(&self, id: u32) -> u32 {
        if self.right(id) != NIL {
            return self.min_node(self.right(id));
        }
        let mut child = id;
        let mut up = self.parent(id);
        while up != NIL && child == self.right(up) {
            child = up;
            up = self.parent(up);
        }
        up
    }

    fn predecessor(&self, id: u32) -> u32 {
        if self.left(id) != NIL {
            return self.max_node(self.left(id));
        }
        let mut child = id;
        let mut up = self.parent(id);
        while up != NIL && child == self.left(up) {
            child = up;
            up = self.parent(up);
        }
        up
    }

    /// First node whose key is `>=` the probe (leftmost among duplicates).
    fn lower_bound(&self, key: &[u8]) -> u32 {
        let mut candidate = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            if types::compare(self.key_type, self.key_of(cursor), key) == Ordering::Less {
                cursor = self.right(cursor);
            } else {
                candidate = cursor;
                cursor = self.left(cursor);
            }
        }
        candidate
    }

    /// Last node whose key satisfies `op` going downward (`Le`/`Lt`).
    fn upper_candidate(&self, key: &[u8], strict: bool) -> u32 {
        let mut candidate = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            let ord = types::compare(self.key_type, self.key_of(cursor), key);
            let qualifies = match ord {
                Ordering::Less => true,
                Ordering::Equal => !strict,
                Ordering::Greater => false,
            };
            if qualifies {
                candidate = cursor;
                cursor = self.right(cursor);
            } else {
                cursor = self.left(cursor);
            }
        }
        candidate
    }

    /// First node whose key is strictly greater than the probe.
    fn strict_upper_bound(&self, key: &[u8]) -> u32 {
        let mut candidate = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            if types::compare(self.key_type, self.key_of(cursor), key) == Ordering::Greater {
                candidate = cursor;
                cursor = self.left(cursor);
            } else {
                cursor = self.right(cursor);
            }
        }
        candidate
    }

    // ---- Insertion ----

    /// Insert an entry. `Ok` carries the new node; `Err` carries the node
    /// the entry collided with (duplicates disabled, or an identical
    /// key+record pair already present).
    fn insert_entry(&mut self, key: &[u8], record: &[u8]) -> Result<u32, u32> {
        let mut parent = NIL;
        let mut cursor = self.root;
        let mut went_left = false;
        while cursor != NIL {
            parent = cursor;
            match self.entry_cmp(key, record, cursor) {
                Ordering::Less => {
                    cursor = self.left(cursor);
                    went_left = true;
                }
                Ordering::Greater => {
                    cursor = self.right(cursor);
                    went_left = false;
                }
                Ordering::Equal => {
                    if !self.allow_duplicates {
                        return Err(cursor);
                    }
                    // A fully identical entry; keep multiset semantics by
                    // descending right.
                    cursor = self.right(cursor);
                    went_left = false;
                }
            }
        }

        let id = self.new_node(key, record);
        self.nodes[id as usize].parent = parent;
        if parent == NIL {
            self.root = id;
        } else if went_left {
            self.nodes[parent as usize].left = id;
        } else {
            self.nodes[parent as usize].right = id;
        }
        self.node_count += 1;

        if self.rebalance {
            self.insert_fixup(id);
        }
        self.set_color(self.root, Color::Black);
        Ok(id)
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.right(x);
        let yl = self.left(y);
        self.nodes[x as usize].right = yl;
        if yl != NIL {
            self.nodes[yl as usize].parent = x;
        }
        let xp = self.parent(x);
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.left(xp) == x {
            self.nodes[xp as usize].left = y;
        } else {
            self.nodes[xp as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.left(x);
        let yr = self.right(y);
        self.nodes[x as usize].left = yr;
        if yr != NIL {
            self.nodes[yr as usize].parent = x;
        }
        let xp = self.parent(x);
        self.nodes[y as usize].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.right(xp) == x {
            self.nodes[xp as usize].right = y;
        } else {
            self.nodes[xp as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if g == NIL {
                break;
            }
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
    }

    // ---- Deletion ----

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    /// Returns the parent that `v` (possibly NIL) now hangs from.
    fn transplant(&mut self, u: u32, v: u32) -> u32 {
        let up = self.parent(u);
        if up == NIL {
            self.root = v;
        } else if self.left(up) == u {
            self.nodes[up as usize].left = v;
        } else {
            self.nodes[up as usize].right = v;
        }
        if v != NIL {
            self.nodes[v as usize].parent = up;
        }
        up
    }

    /// Unlink node `z`. The node slot stays in the pool; only the links
    /// change. Classic pointer-based red-black deletion, with the fix-up
    /// tracking the removed node's replacement and its parent explicitly
    /// because there is no sentinel to hang a parent pointer on.
    fn remove_node(&mut self, z: u32) {
        let mut y = z;
        let mut y_color = self.color(y);
        let x;
        let mut x_parent;

        if self.left(z) == NIL {
            x = self.right(z);
            x_parent = self.transplant(z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            x_parent = self.transplant(z, x);
        } else {
            y = self.min_node(self.right(z));
            y_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.transplant(y, x);
                let zr = self.right(z);
                self.nodes[y as usize].right = zr;
                self.nodes[zr as usize].parent = y;
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.nodes[y as usize].left = zl;
            self.nodes[zl as usize].parent = y;
            self.set_color(y, self.color(z));
        }

        if self.rebalance && y_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }
        self.node_count -= 1;
    }

    fn delete_fixup(&mut self, mut x: u32, mut x_parent: u32) {
        while x != self.root && self.color(x) == Color::Black {
            if x_parent == NIL {
                break;
            }
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        self.set_color(self.left(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.right(w), Color::Black);
                    self.rotate_left(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        self.set_color(self.right(w), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, Color::Black);
                    self.set_color(self.left(w), Color::Black);
                    self.rotate_right(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    // ---- Checks used by tests ----

    /// Verify BST ordering, parent links, and (when rebalancing) the
    /// red-black color invariants.
    pub fn check_invariants(&self) -> DbResult<()> {
        if self.root == NIL {
            return Ok(());
        }
        if self.rebalance && self.color(self.root) != Color::Black {
            return Err(DbError::Tree("red-black: root is red".into()));
        }
        let mut count = 0u32;
        self.check_node(self.root, NIL, &mut count)?;
        if count != self.node_count {
            return Err(DbError::Tree(format!(
                "node count {count} != tracked {}",
                self.node_count
            )));
        }
        // In-order traversal must be sorted.
        let mut id = self.min_node(self.root);
        let mut prev: Option<u32> = None;
        while id != NIL {
            if let Some(p) = prev {
                let ord = types::compare(self.key_type, self.key_of(p), self.key_of(id));
                if ord == Ordering::Greater {
                    return Err(DbError::Tree("in-order traversal out of order".into()));
                }
                if ord == Ordering::Equal && !self.allow_duplicates {
                    return Err(DbError::Tree("duplicate keys without allow_duplicates".into()));
                }
            }
            prev = Some(id);
            id = self.successor(id);
        }
        Ok(())
    }

    /// Returns the black height of the subtree.
    fn check_node(&self, id: u32, parent: u32, count: &mut u32) -> DbResult<u32> {
        if id == NIL {
            return Ok(1);
        }
        *count += 1;
        if self.parent(id) != parent {
            return Err(DbError::Tree("parent link broken".into()));
        }
        if self.rebalance
            && self.color(id) == Color::Red
            && (self.color(self.left(id)) == Color::Red
                || self.color(self.right(id)) == Color::Red)
        {
            return Err(DbError::Tree("red node with red child".into()));
        }
        let lh = self.check_node(self.left(id), id, count)?;
        let rh = self.check_node(self.right(id), id, count)?;
        if self.rebalance && lh != rh {
            return Err(DbError::Tree("black heights diverge".into()));
        }
        let own = if self.color(id) == Color::Black { 1 } else { 0 };
        Ok(lh + own)
    }
}

/// Position within a [`MemTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    Invalid,
    Valid,
}

/// Cursor over a [`MemTree`], identical in shape to the B+tree cursor.
#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    current: u32,
    state: CursorState,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            current: NIL,
            state: CursorState::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    fn land(&mut self, id: u32) -> bool {
        if id == NIL {
            self.state = CursorState::Invalid;
            false
        } else {
            self.current = id;
            self.state = CursorState::Valid;
            true
        }
    }

    /// Position at the first entry matching `key`, or at the nearest entry
    /// when absent. Returns whether an exact match was found.
    pub fn seek(&mut self, tree: &MemTree, key: &[u8]) -> bool {
        let lb = tree.lower_bound(key);
        if lb != NIL {
            self.land(lb);
            return types::compare(tree.key_type, tree.key_of(lb), key) == Ordering::Equal;
        }
        // Past the maximum; clamp to the last entry, as the B+tree cursor
        // clamps to its target leaf.
        self.land(tree.max_node(tree.root));
        false
    }

    /// Position at the first entry satisfying `op` relative to `key`.
    pub fn seek_cmp(&mut self, tree: &MemTree, key: &[u8], op: CompareOp) -> bool {
        let target = match op {
            CompareOp::Eq | CompareOp::Ne => {
                let lb = tree.lower_bound(key);
                if lb != NIL && types::compare(tree.key_type, tree.key_of(lb), key) == Ordering::Equal
                {
                    lb
                } else {
                    NIL
                }
            }
            CompareOp::Ge => tree.lower_bound(key),
            CompareOp::Gt => tree.strict_upper_bound(key),
            CompareOp::Le => tree.upper_candidate(key, false),
            CompareOp::Lt => tree.upper_candidate(key, true),
        };
        self.land(target)
    }

    pub fn first(&mut self, tree: &MemTree) -> bool {
        self.land(tree.min_node(tree.root))
    }

    pub fn last(&mut self, tree: &MemTree) -> bool {
        self.land(tree.max_node(tree.root))
    }

    pub fn next(&mut self, tree: &MemTree) -> bool {
        if self.state != CursorState::Valid {
            return false;
        }
        self.land(tree.successor(self.current))
    }

    pub fn prev(&mut self, tree: &MemTree) -> bool {
        if self.state != CursorState::Valid {
            return false;
        }
        self.land(tree.predecessor(self.current))
    }

    pub fn key<'t>(&self, tree: &'t MemTree) -> DbResult<&'t [u8]> {
        if self.state != CursorState::Valid {
            return Err(DbError::Tree("cursor is not positioned on an entry".into()));
        }
        Ok(tree.key_of(self.current))
    }

    pub fn record<'t>(&self, tree: &'t MemTree) -> DbResult<&'t [u8]> {
        if self.state != CursorState::Valid {
            return Err(DbError::Tree("cursor is not positioned on an entry".into()));
        }
        Ok(tree.record_of(self.current))
    }

    /// Insert an entry; on collision the cursor lands on the existing entry
    /// and `Ok(false)` comes back, mirroring the B+tree cursor contract.
    pub fn insert(&mut self, tree: &mut MemTree, key: &[u8], record: &[u8]) -> bool {
        match tree.insert_entry(key, record) {
            Ok(id) => {
                self.land(id);
                true
            }
            Err(existing) => {
                self.land(existing);
                false
            }
        }
    }

    /// Overwrite the record bytes at the current position.
    pub fn update(&mut self, tree: &mut MemTree, record: &[u8]) -> bool {
        if self.state != CursorState::Valid {
            return false;
        }
        let rs = tree.record_size as usize;
        let n = rs.min(record.len());
        let dst = tree.record_mut(self.current);
        dst.fill(0);
        dst[..n].copy_from_slice(&record[..n]);
        true
    }

    /// Unlink the current entry. The cursor moves to the successor, falling
    /// back to the predecessor at the high end, and goes invalid when the
    /// tree empties.
    pub fn delete(&mut self, tree: &mut MemTree) -> bool {
        if self.state != CursorState::Valid {
            return false;
        }
        let doomed = self.current;
        let next = tree.successor(doomed);
        let prev = tree.predecessor(doomed);
        tree.remove_node(doomed);
        if next != NIL {
            self.land(next);
        } else {
            self.land(prev);
        }
        true
    }
}
