//! Self-describing schema storage.
//!
//! The master catalog is an ordinary B+tree rooted at a fixed page, keyed by
//! object name (fixed char) with a fixed-size descriptor record per table or
//! index. On open the database scans that tree and installs each descriptor
//! into the in-memory [`Catalog`] map; creating an object appends a
//! descriptor. This crate owns the descriptor codec and the map; the scan
//! itself runs through the VM, which is wired up a layer above.

use ahash::RandomState;
use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult, PageId};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use types::DataType;

type Map<K, V> = HashMap<K, V, RandomState>;

/// Page id the master catalog tree is rooted at. The first allocation of a
/// fresh database lands here, and it never moves: splits and collapses swap
/// page contents instead of reparenting the root.
pub const MASTER_ROOT_PAGE: PageId = PageId(1);

/// Key type of the master tree: fixed-size object name.
pub const MASTER_NAME_LEN: u16 = 32;

/// Columns a descriptor can carry, including the key column.
pub const MAX_COLUMNS: usize = 8;

/// Fixed storage for one column name.
pub const COLUMN_NAME_LEN: usize = 16;

/// Encoded size of [`CatalogRecord`] under the fixed-int bincode config:
/// kind + root + key type + record size + column count + column types +
/// column names.
pub const CATALOG_RECORD_SIZE: u32 = (1 + 4 + 8 + 4 + 1 + 8 * MAX_COLUMNS + COLUMN_NAME_LEN * MAX_COLUMNS) as u32;

fn bincode_config() -> impl BincodeConfig {
    config::legacy()
}

/// What a catalog entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Table,
    Index,
}

/// On-disk descriptor stored as the master tree's record. Fixed shape so
/// every entry encodes to exactly [`CATALOG_RECORD_SIZE`] bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CatalogRecord {
    kind: u8,
    root_page: u32,
    key_type: u64,
    record_size: u32,
    column_count: u8,
    column_types: [u64; MAX_COLUMNS],
    column_names: [[u8; COLUMN_NAME_LEN]; MAX_COLUMNS],
}

/// A named, typed column. Column 0 is always the tree key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub ty: DataType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// In-memory description of one table or index.
#[derive(Clone, Debug, PartialEq)]
pub struct TableMeta {
    pub name: String,
    pub kind: ObjectKind,
    pub root_page: PageId,
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn key_type(&self) -> DataType {
        self.columns[0].ty
    }

    /// Total bytes of the non-key columns, which is the tree's record size.
    pub fn record_size(&self) -> u32 {
        self.columns[1..].iter().map(|c| c.ty.total_size()).sum()
    }

    /// Column types in declaration order, key first.
    pub fn column_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.ty).collect()
    }

    /// Ordinal of a column by name.
    pub fn column_index(&self, name: &str) -> Option<u32> {
        self.columns.iter().position(|c| c.name == name).map(|i| i as u32)
    }

    /// Encode into the fixed-size master-tree record.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        if self.columns.is_empty() {
            return Err(DbError::Catalog(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        if self.columns.len() > MAX_COLUMNS {
            return Err(DbError::Catalog(format!(
                "table '{}' exceeds {MAX_COLUMNS} columns",
                self.name
            )));
        }

        let mut record = CatalogRecord {
            kind: match self.kind {
                ObjectKind::Table => 0,
                ObjectKind::Index => 1,
            },
            root_page: self.root_page.0,
            key_type: self.key_type().to_bits(),
            record_size: self.record_size(),
            column_count: self.columns.len() as u8,
            column_types: [0; MAX_COLUMNS],
            column_names: [[0; COLUMN_NAME_LEN]; MAX_COLUMNS],
        };
        for (i, column) in self.columns.iter().enumerate() {
            if column.name.len() >= COLUMN_NAME_LEN {
                return Err(DbError::Catalog(format!(
                    "column name '{}' too long",
                    column.name
                )));
            }
            record.column_types[i] = column.ty.to_bits();
            record.column_names[i][..column.name.len()].copy_from_slice(column.name.as_bytes());
        }

        let bytes = encode_to_vec(&record, bincode_config())
            .map_err(|e| DbError::Catalog(format!("encode descriptor failed: {e}")))?;
        debug_assert_eq!(bytes.len(), CATALOG_RECORD_SIZE as usize);
        Ok(bytes)
    }

    /// Decode a master-tree record back into a descriptor.
    pub fn decode(name: &str, bytes: &[u8]) -> DbResult<TableMeta> {
        let (record, _): (CatalogRecord, usize) = decode_from_slice(bytes, bincode_config())
            .map_err(|e| DbError::Catalog(format!("decode descriptor failed: {e}")))?;

        let count = record.column_count as usize;
        if count == 0 || count > MAX_COLUMNS {
            return Err(DbError::Catalog(format!(
                "descriptor for '{name}' has bad column count {count}"
            )));
        }
        let mut columns = Vec::with_capacity(count);
        for i in 0..count {
            let raw = &record.column_names[i];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let column_name = std::str::from_utf8(&raw[..end])
                .map_err(|_| DbError::Catalog(format!("descriptor for '{name}' has a non-utf8 column name")))?;
            columns.push(ColumnMeta::new(
                column_name,
                DataType::from_bits(record.column_types[i]),
            ));
        }

        Ok(TableMeta {
            name: name.to_string(),
            kind: if record.kind == 0 {
                ObjectKind::Table
            } else {
                ObjectKind::Index
            },
            root_page: PageId(record.root_page),
            columns,
        })
    }
}

/// In-memory map of all known tables and indexes, rebuilt from the master
/// tree on open.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: Map<String, TableMeta>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: Map::default(),
        }
    }

    /// Returns an immutable reference to a table by name.
    pub fn table(&self, name: &str) -> DbResult<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::Catalog(format!("unknown table '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Install a descriptor, as the bootstrap scan callback does. Replaces
    /// any previous entry of the same name.
    pub fn install(&mut self, meta: TableMeta) {
        self.tables.insert(meta.name.clone(), meta);
    }

    pub fn remove(&mut self, name: &str) -> DbResult<TableMeta> {
        self.tables
            .remove(name)
            .ok_or_else(|| DbError::Catalog(format!("unknown table '{name}'")))
    }

    /// Immutable iterator over all registered objects.
    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_meta() -> TableMeta {
        TableMeta {
            name: "users".into(),
            kind: ObjectKind::Table,
            root_page: PageId(7),
            columns: vec![
                ColumnMeta::new("user_id", DataType::U32),
                ColumnMeta::new("username", DataType::char(16)),
                ColumnMeta::new("age", DataType::U32),
            ],
        }
    }

    #[test]
    fn record_size_is_fixed() {
        assert_eq!(CATALOG_RECORD_SIZE, 210);
        let encoded = users_meta().encode().unwrap();
        assert_eq!(encoded.len(), CATALOG_RECORD_SIZE as usize);
    }

    #[test]
    fn descriptor_round_trips() {
        let meta = users_meta();
        let encoded = meta.encode().unwrap();
        let decoded = TableMeta::decode("users", &encoded).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.key_type(), DataType::U32);
        assert_eq!(decoded.record_size(), 20);
        assert_eq!(decoded.column_index("age"), Some(2));
        assert_eq!(decoded.column_index("missing"), None);
    }

    #[test]
    fn index_descriptors_round_trip() {
        let dual = DataType::dual(DataType::U32, DataType::U32).unwrap();
        let meta = TableMeta {
            name: "idx_orders_by_user".into(),
            kind: ObjectKind::Index,
            root_page: PageId(42),
            columns: vec![ColumnMeta::new("key", dual)],
        };
        let decoded = TableMeta::decode(&meta.name, &meta.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, ObjectKind::Index);
        assert_eq!(decoded.key_type(), dual);
        assert_eq!(decoded.record_size(), 0);
    }

    #[test]
    fn encode_rejects_wide_tables() {
        let mut meta = users_meta();
        for i in 0..MAX_COLUMNS {
            meta.columns.push(ColumnMeta::new(format!("c{i}"), DataType::U32));
        }
        assert!(meta.encode().is_err());

        let mut meta = users_meta();
        meta.columns[1].name = "a".repeat(COLUMN_NAME_LEN);
        assert!(meta.encode().is_err());
    }

    #[test]
    fn catalog_lookup_and_removal() {
        let mut catalog = Catalog::new();
        catalog.install(users_meta());

        assert!(catalog.contains("users"));
        assert_eq!(catalog.table("users").unwrap().root_page, PageId(7));
        let err = catalog.table("orders").unwrap_err();
        assert!(format!("{err}").contains("unknown table"));

        catalog.remove("users").unwrap();
        assert!(catalog.table("users").is_err());
        assert!(catalog.is_empty());
    }
}
