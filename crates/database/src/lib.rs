//! Database context: the single object a host embeds.
//!
//! Owns the pager and the catalog and runs programs through the VM. Opening
//! a path replays any leftover journal (inside the pager), then either
//! bootstraps a fresh master catalog or rebuilds the in-memory catalog by
//! scanning the master tree through the VM with a result callback that
//! installs each descriptor.
//!
//! # Example
//!
//! ```no_run
//! use common::Config;
//! use database::Database;
//! use catalog::ColumnMeta;
//! use types::DataType;
//!
//! let cfg = Config::builder().path("/tmp/app.db".into()).build();
//! let mut db = Database::open(cfg).unwrap();
//! db.create_table(
//!     "users",
//!     vec![
//!         ColumnMeta::new("user_id", DataType::U32),
//!         ColumnMeta::new("age", DataType::U32),
//!     ],
//! )
//! .unwrap();
//! ```

use btree::BPlusTree;
use catalog::{
    CATALOG_RECORD_SIZE, Catalog, ColumnMeta, MASTER_NAME_LEN, MASTER_ROOT_PAGE, ObjectKind,
    TableMeta,
};
use common::{Config, DbError, DbResult};
use pager::Pager;
use types::{DataType, TypedValue};
use vm::{CursorPlan, ExitStatus, Layout, Program, ProgramBuilder, ResultCallback, Vm};

/// Embedded database over one data file.
pub struct Database {
    pager: Pager,
    catalog: Catalog,
}

impl Database {
    /// Open or create a database. Journal recovery happens before anything
    /// else; an existing file then has its catalog scanned into memory.
    pub fn open(config: Config) -> DbResult<Self> {
        let path = config.path.clone();
        let (mut pager, existed) = Pager::open(&config)?;
        let mut catalog = Catalog::new();

        if existed {
            bootstrap_catalog(&mut pager, &mut catalog)?;
            log::debug!(
                "opened {} with {} catalog entries",
                path.display(),
                catalog.len()
            );
        } else {
            pager.begin()?;
            let master = BPlusTree::create(
                &mut pager,
                DataType::char(MASTER_NAME_LEN),
                CATALOG_RECORD_SIZE,
                true,
            )?;
            if master.root_page != MASTER_ROOT_PAGE {
                return Err(DbError::Catalog(format!(
                    "master catalog landed at page {}, expected {}",
                    master.root_page.0, MASTER_ROOT_PAGE.0
                )));
            }
            pager.commit()?;
            log::info!("initialized fresh database at {}", path.display());
        }

        Ok(Self { pager, catalog })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Direct pager access, for hosts that manage raw pages or blobs.
    pub fn pager(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub fn table(&self, name: &str) -> DbResult<&TableMeta> {
        self.catalog.table(name)
    }

    /// Cursor plan for a catalog object, ready for an `Open` opcode.
    pub fn plan_for(&self, name: &str) -> DbResult<CursorPlan> {
        let meta = self.catalog.table(name)?;
        Ok(CursorPlan::BPlus {
            tree: BPlusTree::open(meta.root_page, meta.key_type(), meta.record_size())?,
            layout: Layout::new(meta.column_types())?,
        })
    }

    /// Create a table. Column 0 is the key; the rest make up the record.
    pub fn create_table(&mut self, name: &str, columns: Vec<ColumnMeta>) -> DbResult<()> {
        self.create_object(name, ObjectKind::Table, columns)
    }

    /// Create a secondary index structure: a key-only tree, typically with
    /// a dual key packed from the indexed columns.
    pub fn create_index(&mut self, name: &str, key_type: DataType) -> DbResult<()> {
        self.create_object(name, ObjectKind::Index, vec![ColumnMeta::new("key", key_type)])
    }

    fn create_object(
        &mut self,
        name: &str,
        kind: ObjectKind,
        columns: Vec<ColumnMeta>,
    ) -> DbResult<()> {
        if self.catalog.contains(name) {
            return Err(DbError::Catalog(format!("table '{name}' already exists")));
        }
        if name.len() >= MASTER_NAME_LEN as usize {
            return Err(DbError::Catalog(format!("object name '{name}' too long")));
        }
        if columns.is_empty() {
            return Err(DbError::Catalog("a table needs at least a key column".into()));
        }

        let meta = self.with_txn(|db| {
            let key_type = columns[0].ty;
            let record_size: u32 = columns[1..].iter().map(|c| c.ty.total_size()).sum();
            let tree = BPlusTree::create(&mut db.pager, key_type, record_size, true)?;
            let meta = TableMeta {
                name: name.to_string(),
                kind,
                root_page: tree.root_page,
                columns,
            };

            let mut cursor = btree::Cursor::new(master_tree()?);
            let key = TypedValue::from_char(name, MASTER_NAME_LEN);
            if !cursor.insert(&mut db.pager, &key.data, &meta.encode()?)? {
                return Err(DbError::Catalog(format!("table '{name}' already exists")));
            }
            Ok(meta)
        })?;

        self.catalog.install(meta);
        Ok(())
    }

    /// Drop a table or index: free its tree and remove its descriptor.
    pub fn drop_table(&mut self, name: &str) -> DbResult<()> {
        let meta = self.catalog.table(name)?.clone();
        self.with_txn(|db| {
            let tree = BPlusTree::open(meta.root_page, meta.key_type(), meta.record_size())?;
            tree.clear(&mut db.pager)?;

            let mut cursor = btree::Cursor::new(master_tree()?);
            let key = TypedValue::from_char(name, MASTER_NAME_LEN);
            if !cursor.seek(&mut db.pager, &key.data)? {
                return Err(DbError::Catalog(format!(
                    "descriptor for '{name}' missing from the master catalog"
                )));
            }
            cursor.delete(&mut db.pager)?;
            Ok(())
        })?;
        self.catalog.remove(name)?;
        Ok(())
    }

    /// Execute a program, handing result rows to `callback`.
    pub fn execute(
        &mut self,
        program: &Program,
        callback: &mut ResultCallback<'_>,
    ) -> DbResult<ExitStatus> {
        Vm::new(&mut self.pager).execute(program, callback)
    }

    pub fn begin(&mut self) -> DbResult<()> {
        self.pager.begin()
    }

    pub fn commit(&mut self) -> DbResult<()> {
        self.pager.commit()
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        self.pager.rollback()
    }

    /// Flush without committing. A following crash rolls back to the last
    /// commit.
    pub fn sync(&mut self) -> DbResult<()> {
        self.pager.sync()
    }

    /// Close file handles. No implicit commit: an open transaction leaves
    /// its journal behind for recovery.
    pub fn close(self) {
        self.pager.close();
    }

    /// Run `f` in its own transaction unless one is already open, rolling
    /// back on error.
    fn with_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> DbResult<T>) -> DbResult<T> {
        let owned = !self.pager.in_transaction();
        if owned {
            self.pager.begin()?;
        }
        match f(self) {
            Ok(value) => {
                if owned {
                    self.pager.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if owned {
                    self.pager.rollback()?;
                }
                Err(err)
            }
        }
    }
}

/// Descriptor of the master catalog tree at its fixed root.
fn master_tree() -> DbResult<BPlusTree> {
    BPlusTree::open(
        MASTER_ROOT_PAGE,
        DataType::char(MASTER_NAME_LEN),
        CATALOG_RECORD_SIZE,
    )
}

/// Column layout of a master-tree row: object name plus the raw descriptor.
fn master_layout() -> DbResult<Layout> {
    Layout::new(vec![
        DataType::char(MASTER_NAME_LEN),
        DataType::char(CATALOG_RECORD_SIZE as u16),
    ])
}

/// Scan the master tree through the VM, installing every descriptor into
/// the catalog. The result callback is the catalog installer here; normal
/// queries swap in their own sink.
fn bootstrap_catalog(pager: &mut Pager, catalog: &mut Catalog) -> DbResult<()> {
    let plan = CursorPlan::BPlus {
        tree: master_tree()?,
        layout: master_layout()?,
    };

    let mut prog = ProgramBuilder::new();
    let cursor = prog.open_cursor(plan);
    let has_row = prog.first(cursor);
    let scan = prog.begin_while(has_row);
    let row = prog.columns(cursor, 0, 2);
    prog.result(row, 2);
    prog.next(cursor, has_row);
    prog.end_while(scan);
    prog.close_cursor(cursor);
    prog.halt();
    let program = prog.resolve()?;

    let mut failure: Option<DbError> = None;
    {
        let mut install = |values: &[TypedValue]| {
            if failure.is_some() {
                return;
            }
            let parsed = values[0]
                .as_str()
                .and_then(|name| TableMeta::decode(name, &values[1].data));
            match parsed {
                Ok(meta) => catalog.install(meta),
                Err(err) => failure = Some(err),
            }
        };
        Vm::new(pager).execute(&program, &mut install)?;
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
