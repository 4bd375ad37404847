use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use types::{SqlType, Value};
use uuid::Uuid;

/// Identifier for a column within an index schema.
/// Examples:
/// - `let id_col: ColumnId = 0; // maps to "id"`
/// - `let name_col: ColumnId = 1; // maps to "name"`
pub type ColumnId = u16;

/// Identity of a remote node contributing partial query results.
///
/// Opaque and unique per node; the set of sources feeding an index is fixed
/// by registration before any page flows. The nil id is reserved for
/// synthetic pages that belong to no source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub Uuid);

impl SourceId {
    /// Generate a fresh random source identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The reserved no-source identity carried by synthetic pages.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Positional row representation backed by `types::Value`.
/// Examples:
/// - `let row = Row::new(vec![Value::Int(1)]);`
/// - `let row = Row::new(vec![Value::Text("alice".into()), Value::Bool(true)]);`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

/// One column of an index schema: a name paired with its value type.
/// Examples:
/// - `let id = Column::new("id", SqlType::Int);`
/// - `let name = Column::new("name", SqlType::Text);`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: SqlType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Sort direction of one merge key column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One column of the ordering an index promises to its consumers.
///
/// A sorted merge index carries a list of these; the k-way merge and any
/// range filtering compare rows key by key, in list order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeKey {
    pub column: ColumnId,
    pub direction: SortDirection,
}

impl MergeKey {
    pub fn asc(column: ColumnId) -> Self {
        Self {
            column,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: ColumnId) -> Self {
        Self {
            column,
            direction: SortDirection::Desc,
        }
    }
}

/// Compare two rows under a merge key list.
///
/// Missing columns compare as NULL so short rows never panic the merge.
pub fn compare_rows(a: &Row, b: &Row, keys: &[MergeKey]) -> Ordering {
    for key in keys {
        let idx = key.column as usize;
        let va = a.values.get(idx).unwrap_or(&Value::Null);
        let vb = b.values.get(idx).unwrap_or(&Value::Null);

        let ord = match key.direction {
            SortDirection::Asc => va.total_cmp(vb),
            SortDirection::Desc => va.total_cmp(vb).reverse(),
        };

        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

/// Canonical error type shared across the merge engine.
///
/// `Clone` because a single injected failure fans out to every source lane
/// and is latched by cursors for replay on later pulls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// A contributing node died or reported an error; the whole stream is lost.
    #[error("source failure: {0}")]
    SourceFailure(String),
    /// The in-memory row cache outgrew its cap and a lookup needed it back.
    #[error("fetched result set too large (cap {0})")]
    FetchedTooLarge(usize),
    /// Mutation or other non-scan operation requested on a merge index.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Broken caller contract: duplicate first page, unknown source, double registration.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Result alias that carries a `MergeError`.
pub type MergeResult<T> = Result<T, MergeError>;

/// Environment variable overriding the fetched-row cache cap.
pub const MAX_FETCH_SIZE_ENV: &str = "MERGE_TABLE_MAX_SIZE";

const DEFAULT_MAX_FETCH_SIZE: usize = 10_000;

/// Runtime configuration for the merge engine.
///
/// # Example
/// ```
/// use common::Config;
///
/// let config = Config::builder().max_fetch_size(500).build();
/// assert_eq!(config.max_fetch_size, 500);
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct Config {
    /// Rows the index may keep cached for cursor replay before the cache is
    /// discarded. Defaults from `MERGE_TABLE_MAX_SIZE`, falling back to 10 000.
    #[builder(default = max_fetch_size_from_env())]
    pub max_fetch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_fetch_size: max_fetch_size_from_env(),
        }
    }
}

fn max_fetch_size_from_env() -> usize {
    std::env::var(MAX_FETCH_SIZE_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_FETCH_SIZE)
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        compare_rows, Column, Config, MergeError, MergeKey, MergeResult, Row, SourceId,
    };
    pub use types::{SqlType, Value};
}
