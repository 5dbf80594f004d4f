
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Identifier for a page in the data file.
///
/// Pages are addressed by 32-bit index; index 0 is the pager root and also
/// doubles as the "null" page reference.
/// Examples:
/// - `let root = PageId::ROOT;`
/// - `let node = PageId(42);`
/// - `if next.is_null() { /* end of chain */ }`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// The reserved metadata page at the start of the data file.
    pub const ROOT: PageId = PageId(0);
    /// Sentinel for "no page"; shares index 0 with the root, which is never
    /// a valid target for ordinary page references.
    pub const NULL: PageId = PageId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Comparison operator used by cursor seeks and the `Test` opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Human-readable symbol, used in trace output and errors.
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Arithmetic operator for the `Arith` opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Boolean connective for the `Logic` opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

/// Canonical error type shared across database subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("tree: {0}")]
    Tree(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("vm: {0}")]
    Vm(String),
    #[error("txn: {0}")]
    Txn(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the database components.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .path(PathBuf::from("./my.db"))
///     .cache_pages(64)
///     .sync_on_commit(false)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Path of the single data file; the rollback journal lives beside it
    /// with a `-journal` suffix.
    #[builder(default = PathBuf::from("./data.db"))]
    pub path: PathBuf,
    /// Number of pages the cache keeps resident.
    #[builder(default = 100)]
    pub cache_pages: usize,
    /// Whether commit fsyncs the data file before deleting the journal.
    /// Disabled only by tests that do not exercise durability.
    #[builder(default = true)]
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data.db"),
            cache_pages: 100,
            sync_on_commit: true,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{ArithOp, CompareOp, Config, DbError, DbResult, LogicOp, PageId};
}
