//! Walks every canonical collection of a source store into one document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::collection::Collection;
use crate::document::{ExportInfo, MigrationDocument, MigrationType, FORMAT_VERSION};
use crate::error::MigrationError;
use crate::mapper::map_row;
use crate::probe::{list_collections, resolve_table};
use crate::store::SourceStore;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportOptions {
    pub migration_type: MigrationType,
    /// Overrides the store's own description in `export_info`.
    pub source_label: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { migration_type: MigrationType::CompleteReplacement, source_label: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExportIssueKind {
    /// One row could not be mapped and was left out.
    RowSkipped,
    /// The collection could not be read and was exported empty.
    CollectionFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportIssue {
    pub collection: Collection,
    pub kind: ExportIssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionExport {
    /// Physical table the collection was read from, `None` when absent.
    pub table: Option<String>,
    pub exported: usize,
    pub skipped: usize,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportOutcome {
    pub collections: BTreeMap<Collection, CollectionExport>,
    pub issues: Vec<ExportIssue>,
}

impl ExportOutcome {
    #[must_use]
    pub fn total_exported(&self) -> usize {
        self.collections.values().map(|collection| collection.exported).sum()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExportRun {
    pub document: MigrationDocument,
    pub outcome: ExportOutcome,
}

/// Export every canonical collection of `store`.
///
/// Absent collections export empty. Rows that fail to map are skipped and a
/// collection that cannot be read exports empty; both are reported in the
/// outcome rather than failing the run.
///
/// # Errors
/// Returns [`MigrationError::Connection`] when the store cannot be enumerated.
pub fn export_all<S: SourceStore + ?Sized>(
    store: &S,
    options: &ExportOptions,
) -> Result<ExportRun, MigrationError> {
    let tables = list_collections(store)
        .map_err(|err| MigrationError::Connection(format!("cannot enumerate source store: {err}")))?;

    let export_info = ExportInfo {
        timestamp: now_rfc3339(),
        format_version: FORMAT_VERSION.to_string(),
        migration_type: options.migration_type,
        source_label: options.source_label.clone().unwrap_or_else(|| store.source_label()),
    };
    let mut document = MigrationDocument::new(export_info);
    let mut outcome = ExportOutcome::default();

    for collection in Collection::ALL {
        let mut report = CollectionExport::default();
        let table = match resolve_table(store, &tables, collection) {
            Ok(Some(table)) => table,
            Ok(None) => {
                debug!(%collection, "collection absent from source, exporting empty");
                outcome.collections.insert(collection, report);
                continue;
            }
            Err(err) => {
                warn!(%collection, error = %err, "cannot inspect collection, exporting empty");
                report.failed = true;
                outcome.issues.push(ExportIssue {
                    collection,
                    kind: ExportIssueKind::CollectionFailed,
                    detail: err.to_string(),
                });
                outcome.collections.insert(collection, report);
                continue;
            }
        };
        report.table = Some(table.name.clone());

        let rows = match store.fetch_rows(&table.name, table.order_key()) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%collection, table = %table.name, error = %err, "cannot read collection, exporting empty");
                report.failed = true;
                outcome.issues.push(ExportIssue {
                    collection,
                    kind: ExportIssueKind::CollectionFailed,
                    detail: err.to_string(),
                });
                outcome.collections.insert(collection, report);
                continue;
            }
        };

        for (position, values) in rows.iter().enumerate() {
            match map_row(&table.columns, values, collection) {
                Ok(record) => {
                    document.push(record);
                    report.exported += 1;
                }
                Err(err) => {
                    warn!(%collection, position, error = %err, "row skipped");
                    report.skipped += 1;
                    outcome.issues.push(ExportIssue {
                        collection,
                        kind: ExportIssueKind::RowSkipped,
                        detail: format!("row {position}: {err}"),
                    });
                }
            }
        }

        info!(%collection, table = %table.name, exported = report.exported, skipped = report.skipped, "collection exported");
        outcome.collections.insert(collection, report);
    }

    Ok(ExportRun { document, outcome })
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| OffsetDateTime::now_utc().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Scalar;
    use crate::store::{RawValue, StoreError};

    #[derive(Default)]
    struct MemorySource {
        tables: BTreeMap<String, (Vec<String>, Vec<Vec<RawValue>>)>,
        broken: Option<String>,
        unreachable: bool,
    }

    impl MemorySource {
        fn with_table(mut self, name: &str, columns: &[&str], rows: Vec<Vec<RawValue>>) -> Self {
            let columns = columns.iter().map(ToString::to_string).collect();
            self.tables.insert(name.to_string(), (columns, rows));
            self
        }
    }

    impl SourceStore for MemorySource {
        fn table_names(&self) -> Result<Vec<String>, StoreError> {
            if self.unreachable {
                return Err(StoreError::Unavailable("gone".to_string()));
            }
            Ok(self.tables.keys().cloned().collect())
        }

        fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
            Ok(self.tables.get(table).map(|(columns, _)| columns.clone()).unwrap_or_default())
        }

        fn fetch_rows(&self, table: &str, _: &str) -> Result<Vec<Vec<RawValue>>, StoreError> {
            if self.broken.as_deref() == Some(table) {
                return Err(StoreError::Operation("disk I/O error".to_string()));
            }
            Ok(self.tables.get(table).map(|(_, rows)| rows.clone()).unwrap_or_default())
        }

        fn source_label(&self) -> String {
            "memory".to_string()
        }
    }

    #[test]
    fn legacy_source_without_protocols_exports_cleanly() -> anyhow::Result<()> {
        let source = MemorySource::default().with_table(
            "sicks",
            &["id", "diesease", "diesease_img"],
            vec![
                vec![RawValue::Integer(1), RawValue::from("Stroke"), RawValue::Blob(vec![1, 2, 3])],
                vec![RawValue::Integer(2), RawValue::from("Pneumonia"), RawValue::from("base64")],
            ],
        );

        let run = export_all(&source, &ExportOptions::default())?;
        let doc = &run.document;
        assert_eq!(doc.export_info.migration_type, MigrationType::CompleteReplacement);
        assert_eq!(doc.export_info.source_label, "memory");
        assert_eq!(doc.export_info.format_version, FORMAT_VERSION);
        assert_eq!(doc.clinical_entries.len(), 2);
        assert_eq!(doc.clinical_entries[1].disease, Scalar::text("Pneumonia"));
        assert!(doc.protocols.is_empty());
        assert!(run.outcome.issues.is_empty());

        let encoded = crate::codec::encode(doc)?;
        let value: serde_json::Value = serde_json::from_str(&encoded)?;
        for entry in value["clinical_entries"].as_array().cloned().unwrap_or_default() {
            assert_eq!(entry["disease_img"], serde_json::json!(""));
        }

        let protocols = run.outcome.collections.get(&Collection::Protocols);
        assert_eq!(protocols.map(|report| report.table.clone()), Some(None));
        Ok(())
    }

    #[test]
    fn unmappable_rows_are_skipped_and_counted() -> anyhow::Result<()> {
        let source = MemorySource::default().with_table(
            "notices",
            &["id", "title"],
            vec![
                vec![RawValue::Integer(1), RawValue::from("ok")],
                vec![RawValue::Integer(2), RawValue::Blob(vec![9])],
                vec![RawValue::Integer(3), RawValue::from("also ok")],
            ],
        );

        let run = export_all(&source, &ExportOptions::default())?;
        let Some(notices) = run.outcome.collections.get(&Collection::Notices) else {
            return Err(anyhow::anyhow!("notices missing from outcome"));
        };
        assert_eq!(notices.exported, 2);
        assert_eq!(notices.skipped, 1);
        assert_eq!(run.outcome.issues.len(), 1);
        assert_eq!(run.outcome.issues[0].kind, ExportIssueKind::RowSkipped);
        assert_eq!(run.outcome.total_exported(), 2);
        Ok(())
    }

    #[test]
    fn unreadable_collection_exports_empty() -> anyhow::Result<()> {
        let mut source = MemorySource::default()
            .with_table("protocols", &["id", "title"], vec![vec![RawValue::Integer(1), RawValue::from("p")]])
            .with_table("notices", &["id", "title"], vec![vec![RawValue::Integer(1), RawValue::from("n")]]);
        source.broken = Some("protocols".to_string());

        let run = export_all(
            &source,
            &ExportOptions { migration_type: MigrationType::Additive, source_label: Some("nightly".into()) },
        )?;
        assert!(run.document.protocols.is_empty());
        assert_eq!(run.document.notices.len(), 1);
        assert_eq!(run.document.export_info.source_label, "nightly");
        assert_eq!(run.outcome.issues[0].kind, ExportIssueKind::CollectionFailed);
        Ok(())
    }

    #[test]
    fn unreachable_store_is_a_connection_error() {
        let source = MemorySource { unreachable: true, ..MemorySource::default() };
        assert!(matches!(
            export_all(&source, &ExportOptions::default()),
            Err(MigrationError::Connection(_))
        ));
    }
}
