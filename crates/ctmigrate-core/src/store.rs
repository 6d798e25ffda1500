//! Store seams consumed by the exporter and the restorer.

use crate::collection::Collection;
use crate::record::RecordRef;

/// One raw column value as a source store returns it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// The store cannot be opened or reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// One record was refused (constraint violation, malformed value). The
    /// surrounding batch may continue.
    #[error("record rejected: {0}")]
    RecordRejected(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

impl StoreError {
    #[must_use]
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::RecordRejected(_))
    }
}

/// Read side of a store whose schema is not known in advance.
pub trait SourceStore {
    /// Names of every table in the store.
    ///
    /// # Errors
    /// Returns an error when the store catalog cannot be read at all.
    fn table_names(&self) -> Result<Vec<String>, StoreError>;

    /// Ordered column names of `table`, empty when the table does not exist.
    ///
    /// # Errors
    /// Returns an error when the table layout cannot be inspected.
    fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Every row of `table` as positional values, ordered ascending by
    /// `order_by`.
    ///
    /// # Errors
    /// Returns an error when the rows cannot be read.
    fn fetch_rows(&self, table: &str, order_by: &str) -> Result<Vec<Vec<RawValue>>, StoreError>;

    /// Short description of where the data comes from, written into exports.
    fn source_label(&self) -> String;
}

/// Write side of a store the restorer controls.
///
/// Implementations only ever address content collections, so identity and
/// session tables are out of reach by construction.
pub trait RecordStore {
    /// Start the single unit of work that a restore commits or rolls back.
    ///
    /// # Errors
    /// Returns an error when no transaction can be started.
    fn begin(&mut self) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the collection cannot be counted.
    fn count(&mut self, collection: Collection) -> Result<usize, StoreError>;

    /// Delete every row of `collection`, returning how many were removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    fn purge(&mut self, collection: Collection) -> Result<usize, StoreError>;

    /// Insert one record, letting the store assign its identity.
    ///
    /// # Errors
    /// Returns [`StoreError::RecordRejected`] for a record-level refusal, any
    /// other variant for an operation-level failure.
    fn insert(&mut self, record: RecordRef<'_>) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the commit fails; the unit of work is then lost.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the rollback itself fails.
    fn rollback(&mut self) -> Result<(), StoreError>;
}
