//! Applies a migration document to a target store inside one transaction.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collection::{Collection, CONTENT_COLLECTIONS};
use crate::document::{MigrationDocument, MigrationType};
use crate::error::MigrationError;
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "phase", content = "collection")]
pub enum RestorePhase {
    NotStarted,
    Counting,
    Purging,
    Inserting(Collection),
    Committing,
    Committed,
    Aborted,
}

impl Display for RestorePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not_started"),
            Self::Counting => f.write_str("counting"),
            Self::Purging => f.write_str("purging"),
            Self::Inserting(collection) => write!(f, "inserting({collection})"),
            Self::Committing => f.write_str("committing"),
            Self::Committed => f.write_str("committed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreOptions {
    /// Records between two progress callbacks. Zero disables them.
    pub progress_every: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { progress_every: 10 }
    }
}

/// Receives restore progress. Purely informational.
pub trait RestoreObserver {
    fn phase_changed(&mut self, _phase: RestorePhase) {}

    fn progress(&mut self, _collection: Collection, _done: usize, _total: usize) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RestoreObserver for NoopObserver {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionReport {
    pub inserted: usize,
    /// Rows present before a complete replacement purged them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_before_insert: Option<usize>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreIssue {
    pub collection: Collection,
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreReport {
    pub migration_type: MigrationType,
    pub collections: BTreeMap<Collection, CollectionReport>,
    pub issues: Vec<RestoreIssue>,
}

impl RestoreReport {
    fn new(migration_type: MigrationType) -> Self {
        Self {
            migration_type,
            collections: Collection::ALL
                .into_iter()
                .map(|collection| (collection, CollectionReport::default()))
                .collect(),
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub fn collection(&self, collection: Collection) -> CollectionReport {
        self.collections.get(&collection).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn total_inserted(&self) -> usize {
        self.collections.values().map(|report| report.inserted).sum()
    }

    #[must_use]
    pub fn total_skipped(&self) -> usize {
        self.collections.values().map(|report| report.skipped).sum()
    }

    fn entry(&mut self, collection: Collection) -> &mut CollectionReport {
        self.collections.entry(collection).or_default()
    }
}

/// A restore that was rolled back.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("restore aborted while {phase}: {error}")]
pub struct RestoreFailure {
    /// Phase the failure happened in.
    pub phase: RestorePhase,
    pub error: MigrationError,
}

struct Run<'a, S: ?Sized, O: ?Sized> {
    store: &'a mut S,
    observer: &'a mut O,
    phase: RestorePhase,
}

impl<S: RecordStore + ?Sized, O: RestoreObserver + ?Sized> Run<'_, S, O> {
    fn enter(&mut self, phase: RestorePhase) {
        debug!(%phase, "restore phase");
        self.phase = phase;
        self.observer.phase_changed(phase);
    }

    fn fail(&self, error: StoreError) -> RestoreFailure {
        let error = match error {
            StoreError::Unavailable(message) => MigrationError::Connection(message),
            other => MigrationError::Transaction(other.to_string()),
        };
        RestoreFailure { phase: self.phase, error }
    }

    fn apply(
        &mut self,
        doc: &MigrationDocument,
        options: &RestoreOptions,
    ) -> Result<RestoreReport, RestoreFailure> {
        let migration_type = doc.export_info.migration_type;
        let mut report = RestoreReport::new(migration_type);

        self.enter(RestorePhase::Counting);
        if migration_type.purges_target() {
            for collection in CONTENT_COLLECTIONS {
                let existing = self.store.count(collection).map_err(|err| self.fail(err))?;
                report.entry(collection).deleted_before_insert = Some(existing);
            }

            self.enter(RestorePhase::Purging);
            for collection in CONTENT_COLLECTIONS {
                let removed = self.store.purge(collection).map_err(|err| self.fail(err))?;
                info!(%collection, removed, "collection purged");
            }
        }

        for collection in Collection::ALL {
            self.enter(RestorePhase::Inserting(collection));
            let records = doc.records(collection);
            let total = records.len();
            let mut inserted = 0;
            let mut skipped = doc.rejected_in(collection);

            for rejected in doc.rejected.iter().filter(|rejected| rejected.collection == collection) {
                warn!(%collection, label = %rejected.label, reason = %rejected.reason, "record skipped");
                report.issues.push(RestoreIssue {
                    collection,
                    label: rejected.label.clone(),
                    reason: rejected.reason.clone(),
                });
            }

            for (done, record) in records.into_iter().enumerate() {
                match self.store.insert(record) {
                    Ok(()) => inserted += 1,
                    Err(err) if err.is_record_level() => {
                        let label = record.label();
                        warn!(%collection, %label, error = %err, "record skipped");
                        skipped += 1;
                        report.issues.push(RestoreIssue { collection, label, reason: err.to_string() });
                    }
                    Err(err) => return Err(self.fail(err)),
                }
                if options.progress_every > 0 && (done + 1) % options.progress_every == 0 {
                    self.observer.progress(collection, done + 1, total);
                }
            }

            let entry = report.entry(collection);
            entry.inserted = inserted;
            entry.skipped = skipped;
            info!(%collection, inserted, skipped, "collection restored");
        }

        self.enter(RestorePhase::Committing);
        self.store.commit().map_err(|err| self.fail(err))?;
        self.enter(RestorePhase::Committed);
        Ok(report)
    }
}

/// Apply `doc` to `store` under the document's migration type.
///
/// A complete replacement counts then purges every content collection before
/// inserting; any other type appends. Records the store refuses one by one
/// are skipped and reported. Identities are never written.
///
/// # Errors
/// Returns [`RestoreFailure`] on any operation-level error, after rolling
/// the store back.
pub fn restore<S: RecordStore + ?Sized>(
    store: &mut S,
    doc: &MigrationDocument,
    options: &RestoreOptions,
    observer: &mut dyn RestoreObserver,
) -> Result<RestoreReport, RestoreFailure> {
    let mut run = Run { store, observer, phase: RestorePhase::NotStarted };
    run.observer.phase_changed(RestorePhase::NotStarted);
    info!(migration_type = %doc.export_info.migration_type, records = doc.total_records(), "restore started");

    if let Err(err) = run.store.begin() {
        let failure = run.fail(err);
        run.enter(RestorePhase::Aborted);
        return Err(failure);
    }

    match run.apply(doc, options) {
        Ok(report) => {
            info!(inserted = report.total_inserted(), skipped = report.total_skipped(), "restore committed");
            Ok(report)
        }
        Err(failure) => {
            warn!(phase = %failure.phase, error = %failure.error, "restore failed, rolling back");
            if let Err(err) = run.store.rollback() {
                warn!(error = %err, "rollback failed");
            }
            run.enter(RestorePhase::Aborted);
            Err(failure)
        }
    }
}
