//! Cursor contexts: one shape over the three storage kinds.
//!
//! An `Open` opcode carries a [`CursorPlan`] describing what to attach to a
//! slot. Persistent cursors wrap a B+tree descriptor, ephemeral cursors own
//! their tree for the life of the slot (intermediate results die with the
//! program), and blob cursors hold just a head page id.

use common::{CompareOp, DbError, DbResult, PageId};
use memtree::MemTree;
use pager::Pager;
use types::{DataType, TypedValue};

/// Column layout of a cursor: the key type followed by the record columns,
/// with precomputed record offsets.
#[derive(Clone, Debug)]
pub struct Layout {
    types: Vec<DataType>,
    offsets: Vec<u32>,
    record_size: u32,
}

impl Layout {
    /// Build a layout from column types; column 0 is the key.
    pub fn new(types: Vec<DataType>) -> DbResult<Self> {
        if types.is_empty() {
            return Err(DbError::Vm("layout needs at least a key column".into()));
        }
        let mut offsets = Vec::with_capacity(types.len().saturating_sub(1));
        let mut record_size = 0u32;
        for ty in &types[1..] {
            offsets.push(record_size);
            record_size += ty.total_size();
        }
        Ok(Self {
            types,
            offsets,
            record_size,
        })
    }

    pub fn key_type(&self) -> DataType {
        self.types[0]
    }

    pub fn column_count(&self) -> usize {
        self.types.len()
    }

    pub fn column_type(&self, index: usize) -> DbResult<DataType> {
        self.types
            .get(index)
            .copied()
            .ok_or_else(|| DbError::Vm(format!("column {index} out of range")))
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    fn record_slice<'r>(&self, record: &'r [u8], index: usize) -> DbResult<&'r [u8]> {
        let ty = self.column_type(index)?;
        let off = self.offsets[index - 1] as usize;
        Ok(&record[off..off + ty.total_size() as usize])
    }

    /// Assemble a record buffer from a register run holding the non-key
    /// columns in declaration order.
    fn build_record(&self, values: &[TypedValue]) -> DbResult<Vec<u8>> {
        if values.len() != self.types.len() - 1 {
            return Err(DbError::Vm(format!(
                "record run holds {} values, layout wants {}",
                values.len(),
                self.types.len() - 1
            )));
        }
        let mut record = vec![0u8; self.record_size as usize];
        for (i, value) in values.iter().enumerate() {
            let ty = self.types[i + 1];
            let off = self.offsets[i] as usize;
            types::copy_into(ty, &mut record[off..], &value.data);
        }
        Ok(record)
    }

    fn build_key(&self, value: &TypedValue) -> Vec<u8> {
        let size = self.key_type().total_size() as usize;
        let mut key = vec![0u8; size];
        let n = size.min(value.data.len());
        key[..n].copy_from_slice(&value.data[..n]);
        key
    }
}

/// What an `Open` opcode attaches to a cursor slot.
#[derive(Clone, Debug)]
pub enum CursorPlan {
    /// Persistent B+tree with the given column layout.
    BPlus {
        tree: btree::BPlusTree,
        layout: Layout,
    },
    /// Ephemeral tree created on open, dropped on close.
    Mem {
        layout: Layout,
        allow_duplicates: bool,
    },
    /// Blob accessor; rows reference blobs by head page id.
    Blob,
}

pub(crate) enum VmCursor {
    BPlus {
        cursor: btree::Cursor,
        layout: Layout,
    },
    Mem {
        tree: MemTree,
        cursor: memtree::Cursor,
        layout: Layout,
    },
    Blob {
        head: PageId,
    },
}

impl VmCursor {
    pub(crate) fn open(plan: &CursorPlan) -> DbResult<VmCursor> {
        match plan {
            CursorPlan::BPlus { tree, layout } => Ok(VmCursor::BPlus {
                cursor: btree::Cursor::new(*tree),
                layout: layout.clone(),
            }),
            CursorPlan::Mem {
                layout,
                allow_duplicates,
            } => Ok(VmCursor::Mem {
                tree: MemTree::new(layout.key_type(), layout.record_size(), *allow_duplicates)?,
                cursor: memtree::Cursor::new(),
                layout: layout.clone(),
            }),
            CursorPlan::Blob => Ok(VmCursor::Blob {
                head: PageId::NULL,
            }),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self {
            VmCursor::BPlus { cursor, .. } => cursor.is_valid(),
            VmCursor::Mem { cursor, .. } => cursor.is_valid(),
            VmCursor::Blob { head } => !head.is_null(),
        }
    }

    pub(crate) fn rewind(&mut self, pager: &mut Pager, to_end: bool) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, .. } => {
                if to_end {
                    cursor.last(pager)
                } else {
                    cursor.first(pager)
                }
            }
            VmCursor::Mem { tree, cursor, .. } => Ok(if to_end {
                cursor.last(tree)
            } else {
                cursor.first(tree)
            }),
            VmCursor::Blob { .. } => Ok(false),
        }
    }

    pub(crate) fn step(&mut self, pager: &mut Pager, forward: bool) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, .. } => {
                if forward {
                    cursor.next(pager)
                } else {
                    cursor.prev(pager)
                }
            }
            VmCursor::Mem { tree, cursor, .. } => Ok(if forward {
                cursor.next(tree)
            } else {
                cursor.prev(tree)
            }),
            VmCursor::Blob { .. } => Ok(false),
        }
    }

    pub(crate) fn seek(
        &mut self,
        pager: &mut Pager,
        key: &TypedValue,
        op: CompareOp,
    ) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, layout } => {
                let probe = layout.build_key(key);
                cursor.seek_cmp(pager, &probe, op)
            }
            VmCursor::Mem { tree, cursor, layout } => {
                let probe = layout.build_key(key);
                Ok(cursor.seek_cmp(tree, &probe, op))
            }
            VmCursor::Blob { head } => {
                let id = PageId(key.as_u32()?);
                *head = id;
                Ok(!id.is_null() && pager.get(id)?.is_some())
            }
        }
    }

    /// Read one column. Column 0 is the key; a blob cursor's column 0 is
    /// the whole byte content.
    pub(crate) fn column(&mut self, pager: &mut Pager, index: usize) -> DbResult<TypedValue> {
        match self {
            VmCursor::BPlus { cursor, layout } => {
                if index == 0 {
                    let key = cursor.key(pager)?;
                    Ok(TypedValue::from_bytes(layout.key_type(), &key))
                } else {
                    let record = cursor.record(pager)?;
                    let slice = layout.record_slice(&record, index)?;
                    Ok(TypedValue::from_bytes(layout.column_type(index)?, slice))
                }
            }
            VmCursor::Mem { tree, cursor, layout } => {
                if index == 0 {
                    Ok(TypedValue::from_bytes(layout.key_type(), cursor.key(tree)?))
                } else {
                    let slice = layout.record_slice(cursor.record(tree)?, index)?;
                    Ok(TypedValue::from_bytes(layout.column_type(index)?, slice))
                }
            }
            VmCursor::Blob { head } => {
                if index != 0 {
                    return Err(DbError::Vm("blob cursors have a single column".into()));
                }
                let bytes = blob::read_full(pager, *head)?;
                if bytes.len() > u16::MAX as usize {
                    return Err(DbError::Vm("blob too large for a register value".into()));
                }
                Ok(TypedValue {
                    ty: DataType::varchar(bytes.len() as u16),
                    data: bytes,
                })
            }
        }
    }

    /// Insert from a register run: the first value is the key, the rest are
    /// the record columns. A blob cursor takes a single value holding the
    /// byte content and remembers the new head id.
    pub(crate) fn insert(&mut self, pager: &mut Pager, run: &[TypedValue]) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, layout } => {
                let key = layout.build_key(&run[0]);
                let record = layout.build_record(&run[1..])?;
                cursor.insert(pager, &key, &record)
            }
            VmCursor::Mem { tree, cursor, layout } => {
                let key = layout.build_key(&run[0]);
                let record = layout.build_record(&run[1..])?;
                Ok(cursor.insert(tree, &key, &record))
            }
            VmCursor::Blob { head } => {
                *head = blob::create(pager, &run[0].data)?;
                Ok(true)
            }
        }
    }

    /// Overwrite the record at the current position from a register run of
    /// the non-key columns.
    pub(crate) fn update(&mut self, pager: &mut Pager, run: &[TypedValue]) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, layout } => {
                let record = layout.build_record(run)?;
                cursor.update(pager, &record)
            }
            VmCursor::Mem { tree, cursor, layout } => {
                let record = layout.build_record(run)?;
                Ok(cursor.update(tree, &record))
            }
            VmCursor::Blob { .. } => Err(DbError::Vm("blobs are immutable; delete and recreate".into())),
        }
    }

    pub(crate) fn delete(&mut self, pager: &mut Pager) -> DbResult<bool> {
        match self {
            VmCursor::BPlus { cursor, .. } => cursor.delete(pager),
            VmCursor::Mem { tree, cursor, .. } => Ok(cursor.delete(tree)),
            VmCursor::Blob { head } => {
                if head.is_null() {
                    return Ok(false);
                }
                blob::delete(pager, *head)?;
                *head = PageId::NULL;
                Ok(true)
            }
        }
    }
}
