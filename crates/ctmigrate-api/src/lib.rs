use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use ctmigrate_core::{
    archive, codec, export_all, restore, Collection, ExportIssue, ExportOptions, ExportRun,
    MigrationDocument, MigrationError, MigrationType, RestoreObserver, RestoreOptions,
    RestorePhase, RestoreReport,
};
use ctmigrate_store_sqlite::SqliteStore;
pub use ctmigrate_store_sqlite::SchemaReport;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Outcome discriminator shared by every migration operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Ok,
    Failed { kind: String, reason: String },
}

impl OperationStatus {
    #[must_use]
    pub fn failed(err: &MigrationError) -> Self {
        Self::Failed { kind: err.kind().to_string(), reason: err.to_string() }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub migration_type: MigrationType,
    /// Bundle a raw copy of the database next to the document.
    pub include_source_store: bool,
    /// Overrides the `sqlite:<path>` label written into the document.
    #[serde(default)]
    pub source_label: Option<String>,
}

impl Default for ArchiveRequest {
    fn default() -> Self {
        Self {
            migration_type: MigrationType::CompleteReplacement,
            include_source_store: true,
            source_label: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportSummary {
    pub file_name: String,
    pub exported_at: String,
    pub migration_type: MigrationType,
    pub record_counts: BTreeMap<Collection, usize>,
    pub total_records: usize,
    pub includes_source_store: bool,
    pub issues: Vec<ExportIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveExport {
    #[serde(flatten)]
    pub status: OperationStatus,
    #[serde(skip)]
    pub archive: Option<Vec<u8>>,
    pub summary: Option<ExportSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentExport {
    #[serde(flatten)]
    pub status: OperationStatus,
    #[serde(skip)]
    pub document: Option<String>,
    pub summary: Option<ExportSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyExport {
    #[serde(flatten)]
    pub status: OperationStatus,
    #[serde(skip)]
    pub document: Option<String>,
    pub summary: Option<ExportSummary>,
    /// Operator-facing description of what the migration will do.
    pub migration_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRestore {
    #[serde(flatten)]
    pub status: OperationStatus,
    pub report: Option<RestoreReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPreview {
    pub migration_type: MigrationType,
    pub exported_at: String,
    pub format_version: String,
    pub source_label: String,
    pub record_counts: BTreeMap<Collection, usize>,
    pub rejected_counts: BTreeMap<Collection, usize>,
    pub total_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPreviewResult {
    #[serde(flatten)]
    pub status: OperationStatus,
    pub preview: Option<UploadPreview>,
}

/// Logs restore progress through `tracing`.
struct TracingObserver;

impl RestoreObserver for TracingObserver {
    fn phase_changed(&mut self, phase: RestorePhase) {
        tracing::debug!(%phase, "restore phase changed");
    }

    fn progress(&mut self, collection: Collection, done: usize, total: usize) {
        tracing::info!(%collection, done, total, "restore progress");
    }
}

#[derive(Debug, Clone)]
pub struct MigrationApi {
    db_path: PathBuf,
}

impl MigrationApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_source(path: &Path) -> Result<SqliteStore, MigrationError> {
        SqliteStore::open_existing(path).map_err(|err| MigrationError::Connection(format!("{err:#}")))
    }

    /// Create any missing content and account tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema cannot be applied.
    pub fn init_schema(&self) -> Result<SchemaReport> {
        let mut store = self.open_store()?;
        store.ensure_schema()
    }

    /// Row count per content collection.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or counted.
    pub fn collection_counts(&self) -> Result<BTreeMap<Collection, usize>> {
        let store = self.open_store()?;
        store.collection_counts()
    }

    /// Export the database as a ZIP archive. Never fails outright; the
    /// status carries the reason instead.
    #[must_use]
    pub fn export_migration_archive(&self, request: &ArchiveRequest) -> ArchiveExport {
        match self.build_archive(request) {
            Ok((archive, summary)) => {
                ArchiveExport { status: OperationStatus::Ok, archive: Some(archive), summary: Some(summary) }
            }
            Err(err) => {
                tracing::warn!(error = %err, "archive export failed");
                ArchiveExport { status: OperationStatus::failed(&err), archive: None, summary: None }
            }
        }
    }

    fn build_archive(&self, request: &ArchiveRequest) -> Result<(Vec<u8>, ExportSummary), MigrationError> {
        let store = Self::open_source(&self.db_path)?;
        let options = ExportOptions {
            migration_type: request.migration_type,
            source_label: request.source_label.clone(),
        };
        let run = export_all(&store, &options)?;

        let snapshot = if request.include_source_store {
            match store.snapshot_bytes() {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "raw store copy unavailable");
                    None
                }
            }
        } else {
            None
        };

        let archive = archive::write_archive(&run.document, snapshot.as_deref())?;
        let summary = summarize(&run, "ct_system_backup", "zip", snapshot.is_some());
        tracing::info!(file_name = %summary.file_name, records = summary.total_records, "archive exported");
        Ok((archive, summary))
    }

    /// Export the database as a bare JSON document.
    #[must_use]
    pub fn export_document(&self, options: &ExportOptions) -> DocumentExport {
        let exported = Self::open_source(&self.db_path).and_then(|store| {
            let run = export_all(&store, options)?;
            let document = codec::encode(&run.document)?;
            Ok((document, summarize(&run, "ct_system_export", "json", false)))
        });
        match exported {
            Ok((document, summary)) => {
                DocumentExport { status: OperationStatus::Ok, document: Some(document), summary: Some(summary) }
            }
            Err(err) => {
                tracing::warn!(error = %err, "document export failed");
                DocumentExport { status: OperationStatus::failed(&err), document: None, summary: None }
            }
        }
    }

    /// Export a legacy database file into a complete-replacement document.
    #[must_use]
    pub fn export_legacy(&self, legacy_path: &Path) -> LegacyExport {
        let exported = Self::open_source(legacy_path).and_then(|store| {
            let options = ExportOptions {
                migration_type: MigrationType::CompleteReplacement,
                source_label: Some(format!("legacy:{}", legacy_path.display())),
            };
            let run = export_all(&store, &options)?;
            let document = codec::encode(&run.document)?;
            let notes = migration_notes(&run.document);
            Ok((document, summarize(&run, "legacy_migration", "json", false), notes))
        });
        match exported {
            Ok((document, summary, notes)) => LegacyExport {
                status: OperationStatus::Ok,
                document: Some(document),
                summary: Some(summary),
                migration_notes: Some(notes),
            },
            Err(err) => {
                tracing::warn!(error = %err, path = %legacy_path.display(), "legacy export failed");
                LegacyExport {
                    status: OperationStatus::failed(&err),
                    document: None,
                    summary: None,
                    migration_notes: None,
                }
            }
        }
    }

    /// Restore an uploaded archive or bare document into the database.
    ///
    /// Missing tables are created inside the restore transaction and vanish
    /// with it on failure. The database file itself is created on open and
    /// stays behind.
    #[must_use]
    pub fn restore_from_upload(&self, bytes: &[u8]) -> UploadRestore {
        self.restore_from_upload_with(bytes, &RestoreOptions::default())
    }

    #[must_use]
    pub fn restore_from_upload_with(&self, bytes: &[u8], options: &RestoreOptions) -> UploadRestore {
        match self.apply_upload(bytes, options) {
            Ok(report) => UploadRestore { status: OperationStatus::Ok, report: Some(report) },
            Err(err) => {
                tracing::warn!(error = %err, "restore failed");
                UploadRestore { status: OperationStatus::failed(&err), report: None }
            }
        }
    }

    fn apply_upload(&self, bytes: &[u8], options: &RestoreOptions) -> Result<RestoreReport, MigrationError> {
        let doc = archive::read_upload(bytes)?;
        let mut store = self
            .open_store()
            .map_err(|err| MigrationError::Connection(format!("{err:#}")))?
            .with_schema_bootstrap();
        restore(&mut store, &doc, options, &mut TracingObserver).map_err(|failure| {
            tracing::warn!(phase = %failure.phase, "restore rolled back");
            failure.error
        })
    }

    /// Decode an upload and describe it without touching the database.
    #[must_use]
    pub fn preview_upload(&self, bytes: &[u8]) -> UploadPreviewResult {
        match archive::read_upload(bytes) {
            Ok(doc) => UploadPreviewResult { status: OperationStatus::Ok, preview: Some(preview(&doc)) },
            Err(err) => UploadPreviewResult { status: OperationStatus::failed(&err), preview: None },
        }
    }
}

fn preview(doc: &MigrationDocument) -> UploadPreview {
    let info = &doc.export_info;
    UploadPreview {
        migration_type: info.migration_type,
        exported_at: info.timestamp.clone(),
        format_version: info.format_version.clone(),
        source_label: info.source_label.clone(),
        record_counts: doc.counts(),
        rejected_counts: Collection::ALL
            .into_iter()
            .map(|collection| (collection, doc.rejected_in(collection)))
            .collect(),
        total_records: doc.total_records(),
    }
}

fn summarize(run: &ExportRun, stem: &str, extension: &str, includes_source_store: bool) -> ExportSummary {
    let doc = &run.document;
    ExportSummary {
        file_name: format!("{stem}_{}.{extension}", file_stamp(OffsetDateTime::now_utc())),
        exported_at: doc.export_info.timestamp.clone(),
        migration_type: doc.export_info.migration_type,
        record_counts: doc.counts(),
        total_records: doc.total_records(),
        includes_source_store,
        issues: run.outcome.issues.clone(),
    }
}

fn file_stamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn migration_notes(doc: &MigrationDocument) -> String {
    let records = Collection::ALL
        .into_iter()
        .map(|collection| format!("  - {}: {}", collection.display_name(), doc.len_of(collection)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Legacy migration summary\n\
         \n\
         Records:\n\
         {records}\n\
         \n\
         Exported at: {timestamp}\n\
         Migration type: {migration_type}\n  \
         - All existing content in the target will be deleted.\n  \
         - It is replaced entirely by the legacy data.\n\
         \n\
         Not migrated:\n  \
         - User accounts and sessions.\n  \
         - Images (stored as empty values).\n",
        timestamp = doc.export_info.timestamp,
        migration_type = doc.export_info.migration_type,
    )
}
