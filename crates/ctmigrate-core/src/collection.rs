use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The fixed set of content collections a migration document carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    ClinicalEntries,
    Notices,
    Protocols,
}

/// Collections purged by a complete replacement. This is every collection.
pub const CONTENT_COLLECTIONS: [Collection; 3] =
    [Collection::ClinicalEntries, Collection::Notices, Collection::Protocols];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldKind {
    Identity,
    Content,
    /// Always stored and exported empty.
    Image,
    /// Content that a store may fill in when empty.
    Timestamp,
}

/// One canonical field and the legacy names it is also known by.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, aliases: &[], kind }
}

const fn legacy(name: &'static str, alias: &'static [&'static str], kind: FieldKind) -> FieldSpec {
    FieldSpec { name, aliases: alias, kind }
}

const CLINICAL_ENTRY_FIELDS: [FieldSpec; 16] = [
    field("id", FieldKind::Identity),
    legacy("disease", &["diesease"], FieldKind::Content),
    legacy("disease_text", &["diesease_text"], FieldKind::Content),
    field("keyword", FieldKind::Content),
    field("protocol", FieldKind::Content),
    field("protocol_text", FieldKind::Content),
    field("processing", FieldKind::Content),
    field("processing_text", FieldKind::Content),
    field("contrast", FieldKind::Content),
    field("contrast_text", FieldKind::Content),
    legacy("disease_img", &["diesease_img"], FieldKind::Image),
    field("protocol_img", FieldKind::Image),
    field("processing_img", FieldKind::Image),
    field("contrast_img", FieldKind::Image),
    field("created_at", FieldKind::Timestamp),
    field("updated_at", FieldKind::Timestamp),
];

const NOTICE_FIELDS: [FieldSpec; 6] = [
    field("id", FieldKind::Identity),
    field("title", FieldKind::Content),
    legacy("body", &["main"], FieldKind::Content),
    legacy("image", &["post_img"], FieldKind::Image),
    field("created_at", FieldKind::Timestamp),
    field("updated_at", FieldKind::Timestamp),
];

const PROTOCOL_FIELDS: [FieldSpec; 7] = [
    field("id", FieldKind::Identity),
    field("category", FieldKind::Content),
    field("title", FieldKind::Content),
    field("content", FieldKind::Content),
    legacy("image", &["protocol_img"], FieldKind::Image),
    field("created_at", FieldKind::Timestamp),
    field("updated_at", FieldKind::Timestamp),
];

/// Tables that hold credentials and sessions. Migration documents never carry
/// them and no restore mode deletes from them.
pub const PRESERVED_TABLES: [&str; 2] = ["users", "user_sessions"];

impl Collection {
    pub const ALL: [Collection; 3] = CONTENT_COLLECTIONS;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClinicalEntries => "clinical_entries",
            Self::Notices => "notices",
            Self::Protocols => "protocols",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clinical_entries" => Some(Self::ClinicalEntries),
            "notices" => Some(Self::Notices),
            "protocols" => Some(Self::Protocols),
            _ => None,
        }
    }

    /// Document keys accepted on decode, canonical key first.
    #[must_use]
    pub fn document_keys(self) -> &'static [&'static str] {
        match self {
            Self::ClinicalEntries => &["clinical_entries", "sicks"],
            Self::Notices => &["notices", "forms"],
            Self::Protocols => &["protocols"],
        }
    }

    /// Physical table names probed in a source store, canonical name first.
    #[must_use]
    pub fn table_candidates(self) -> &'static [&'static str] {
        match self {
            Self::ClinicalEntries => &["clinical_entries", "sicks"],
            Self::Notices => &["notices", "forms"],
            Self::Protocols => &["protocols"],
        }
    }

    /// Table the canonical target schema writes into.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        self.as_str()
    }

    /// Canonical fields in document order.
    #[must_use]
    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::ClinicalEntries => &CLINICAL_ENTRY_FIELDS,
            Self::Notices => &NOTICE_FIELDS,
            Self::Protocols => &PROTOCOL_FIELDS,
        }
    }

    #[must_use]
    pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|spec| spec.name == name)
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::ClinicalEntries => "Clinical entries",
            Self::Notices => "Notices",
            Self::Protocols => "CT protocols",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserved_tables_never_overlap_content_tables() {
        for collection in CONTENT_COLLECTIONS {
            for table in collection.table_candidates() {
                assert!(!PRESERVED_TABLES.contains(table), "{table} is both content and preserved");
            }
        }
    }

    #[test]
    fn field_lists_match_record_shapes() -> anyhow::Result<()> {
        let samples = [
            (Collection::ClinicalEntries, serde_json::to_value(crate::record::ClinicalEntry::default())?),
            (Collection::Notices, serde_json::to_value(crate::record::Notice::default())?),
            (Collection::Protocols, serde_json::to_value(crate::record::Protocol::default())?),
        ];
        for (collection, value) in samples {
            let keys: Vec<&str> = value
                .as_object()
                .map(|object| object.keys().map(String::as_str).collect())
                .unwrap_or_default();
            let names: Vec<&str> = collection.fields().iter().map(|spec| spec.name).collect();
            assert_eq!(keys, names, "{collection}");
        }
        Ok(())
    }

    #[test]
    fn parse_accepts_only_canonical_names() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
        }
        assert_eq!(Collection::parse("sicks"), None);
        assert_eq!(Collection::parse("users"), None);
    }
}
