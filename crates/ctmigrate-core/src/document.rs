use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::record::{ClinicalEntry, Notice, Protocol, Record, RecordRef};

/// Format version written by this exporter.
pub const FORMAT_VERSION: &str = "2.0";

/// Merge policy carried by a document. Unrecognized values decode as
/// [`MigrationType::Unknown`], which restores additively.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    Additive,
    CompleteReplacement,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MigrationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Additive => "additive",
            Self::CompleteReplacement => "complete_replacement",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn purges_target(self) -> bool {
        matches!(self, Self::CompleteReplacement)
    }
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ExportInfo {
    #[serde(alias = "export_date")]
    pub timestamp: String,
    #[serde(alias = "version")]
    pub format_version: String,
    pub migration_type: MigrationType,
    #[serde(alias = "source")]
    pub source_label: String,
}

/// A record dropped while decoding a document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RejectedRecord {
    pub collection: Collection,
    pub position: usize,
    pub label: String,
    pub reason: String,
}

/// The portable migration document.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MigrationDocument {
    pub export_info: ExportInfo,
    pub clinical_entries: Vec<ClinicalEntry>,
    pub notices: Vec<Notice>,
    pub protocols: Vec<Protocol>,
    /// In-memory only; never encoded.
    pub rejected: Vec<RejectedRecord>,
}

impl MigrationDocument {
    #[must_use]
    pub fn new(export_info: ExportInfo) -> Self {
        Self { export_info, ..Self::default() }
    }

    pub fn push(&mut self, record: Record) {
        match record {
            Record::ClinicalEntry(entry) => self.clinical_entries.push(entry),
            Record::Notice(notice) => self.notices.push(notice),
            Record::Protocol(protocol) => self.protocols.push(protocol),
        }
    }

    #[must_use]
    pub fn len_of(&self, collection: Collection) -> usize {
        match collection {
            Collection::ClinicalEntries => self.clinical_entries.len(),
            Collection::Notices => self.notices.len(),
            Collection::Protocols => self.protocols.len(),
        }
    }

    /// Records of `collection` in document order.
    #[must_use]
    pub fn records(&self, collection: Collection) -> Vec<RecordRef<'_>> {
        match collection {
            Collection::ClinicalEntries => {
                self.clinical_entries.iter().map(RecordRef::ClinicalEntry).collect()
            }
            Collection::Notices => self.notices.iter().map(RecordRef::Notice).collect(),
            Collection::Protocols => self.protocols.iter().map(RecordRef::Protocol).collect(),
        }
    }

    #[must_use]
    pub fn rejected_in(&self, collection: Collection) -> usize {
        self.rejected.iter().filter(|rejected| rejected.collection == collection).count()
    }

    /// Record count per collection, every collection present.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<Collection, usize> {
        Collection::ALL.into_iter().map(|collection| (collection, self.len_of(collection))).collect()
    }

    #[must_use]
    pub fn total_records(&self) -> usize {
        Collection::ALL.into_iter().map(|collection| self.len_of(collection)).sum()
    }
}
