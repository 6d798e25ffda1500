//! Migration and backup engine for the CT reference library.
//!
//! Records are read from a [`SourceStore`], normalized into a
//! [`MigrationDocument`], serialized through [`codec`] or [`archive`], and
//! re-applied to a [`RecordStore`] by [`restore`].

pub mod archive;
pub mod codec;
pub mod collection;
pub mod document;
pub mod error;
pub mod exporter;
pub mod mapper;
pub mod probe;
pub mod record;
pub mod restorer;
pub mod store;

pub use collection::{Collection, FieldKind, FieldSpec, CONTENT_COLLECTIONS, PRESERVED_TABLES};
pub use document::{ExportInfo, MigrationDocument, MigrationType, RejectedRecord, FORMAT_VERSION};
pub use error::{MappingError, MigrationError};
pub use exporter::{
    export_all, CollectionExport, ExportIssue, ExportIssueKind, ExportOptions, ExportOutcome,
    ExportRun,
};
pub use record::{ClinicalEntry, Notice, Protocol, Record, RecordRef, RedactedImage, Scalar};
pub use restorer::{
    restore, CollectionReport, NoopObserver, RestoreFailure, RestoreIssue, RestoreObserver,
    RestoreOptions, RestorePhase, RestoreReport,
};
pub use store::{RawValue, RecordStore, SourceStore, StoreError};
