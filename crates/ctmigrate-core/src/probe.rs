//! Schema probing for source stores that may not match the canonical layout.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::store::{SourceStore, StoreError};

/// A collection located in a source store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedTable {
    pub collection: Collection,
    pub name: String,
    pub columns: Vec<String>,
}

impl ResolvedTable {
    /// Stable ordering key: the identity column when present, else `rowid`.
    #[must_use]
    pub fn order_key(&self) -> &'static str {
        if self.columns.iter().any(|column| column == "id") {
            "id"
        } else {
            "rowid"
        }
    }
}

/// List every table the source store holds.
///
/// # Errors
/// Returns an error when the store catalog cannot be read.
pub fn list_collections<S: SourceStore + ?Sized>(store: &S) -> Result<BTreeSet<String>, StoreError> {
    Ok(store.table_names()?.into_iter().collect())
}

/// Ordered column names for `table`; a missing table yields an empty list.
///
/// # Errors
/// Returns an error when the table layout cannot be inspected.
pub fn columns_of<S: SourceStore + ?Sized>(store: &S, table: &str) -> Result<Vec<String>, StoreError> {
    store.table_columns(table)
}

/// Locate `collection` among `tables`, preferring the canonical table name
/// over legacy ones. `None` means the collection is absent from the source.
///
/// # Errors
/// Returns an error when the located table cannot be inspected.
pub fn resolve_table<S: SourceStore + ?Sized>(
    store: &S,
    tables: &BTreeSet<String>,
    collection: Collection,
) -> Result<Option<ResolvedTable>, StoreError> {
    let Some(name) =
        collection.table_candidates().iter().find(|candidate| tables.contains(**candidate))
    else {
        return Ok(None);
    };

    let columns = columns_of(store, name)?;
    Ok(Some(ResolvedTable { collection, name: (*name).to_string(), columns }))
}
