//! Raw source rows to canonical records.

use std::collections::HashMap;

use crate::collection::Collection;
use crate::error::MappingError;
use crate::record::{ClinicalEntry, Notice, Protocol, Record, RedactedImage, Scalar};
use crate::store::RawValue;

struct RowLookup<'a> {
    collection: Collection,
    values: HashMap<&'a str, &'a RawValue>,
}

impl<'a> RowLookup<'a> {
    fn new(collection: Collection, columns: &'a [String], values: &'a [RawValue]) -> Self {
        let values = columns.iter().map(String::as_str).zip(values.iter()).collect();
        Self { collection, values }
    }

    fn find(&self, field: &str) -> Option<&'a RawValue> {
        let aliases = self.collection.field(field).map_or(&[][..], |spec| spec.aliases);
        std::iter::once(field).chain(aliases.iter().copied()).find_map(|name| self.values.get(name).copied())
    }

    fn scalar(&self, field: &'static str) -> Result<Scalar, MappingError> {
        match self.find(field) {
            None | Some(RawValue::Null) => Ok(Scalar::empty()),
            Some(RawValue::Integer(value)) => Ok(Scalar::Integer(*value)),
            Some(RawValue::Real(value)) => Ok(Scalar::Text(value.to_string())),
            Some(RawValue::Text(text)) => Ok(Scalar::Text(text.clone())),
            Some(RawValue::Blob(_)) => {
                Err(MappingError::BinaryField { collection: self.collection, field })
            }
        }
    }

    fn identity(&self) -> Result<Option<i64>, MappingError> {
        let invalid = |value: String| MappingError::InvalidIdentity { collection: self.collection, value };
        match self.find("id") {
            None | Some(RawValue::Null) => Ok(None),
            Some(RawValue::Integer(value)) => Ok(Some(*value)),
            Some(RawValue::Text(text)) if text.trim().is_empty() => Ok(None),
            Some(RawValue::Text(text)) => text.trim().parse().map(Some).map_err(|_| invalid(text.clone())),
            Some(RawValue::Real(value)) => Err(invalid(value.to_string())),
            Some(RawValue::Blob(bytes)) => Err(invalid(format!("<{} bytes>", bytes.len()))),
        }
    }
}

/// Convert one positional source row into the canonical record for
/// `collection`.
///
/// Columns are matched by name, canonical name first and legacy aliases after.
/// Missing or NULL values take the field default, and image fields are
/// always emptied whatever the source holds.
///
/// # Errors
/// Returns [`MappingError`] when a content field holds binary data or the
/// identity is not an integer.
pub fn map_row(
    columns: &[String],
    values: &[RawValue],
    collection: Collection,
) -> Result<Record, MappingError> {
    let row = RowLookup::new(collection, columns, values);
    let record = match collection {
        Collection::ClinicalEntries => Record::ClinicalEntry(ClinicalEntry {
            id: row.identity()?,
            disease: row.scalar("disease")?,
            disease_text: row.scalar("disease_text")?,
            keyword: row.scalar("keyword")?,
            protocol: row.scalar("protocol")?,
            protocol_text: row.scalar("protocol_text")?,
            processing: row.scalar("processing")?,
            processing_text: row.scalar("processing_text")?,
            contrast: row.scalar("contrast")?,
            contrast_text: row.scalar("contrast_text")?,
            disease_img: RedactedImage,
            protocol_img: RedactedImage,
            processing_img: RedactedImage,
            contrast_img: RedactedImage,
            created_at: row.scalar("created_at")?,
            updated_at: row.scalar("updated_at")?,
        }),
        Collection::Notices => Record::Notice(Notice {
            id: row.identity()?,
            title: row.scalar("title")?,
            body: row.scalar("body")?,
            image: RedactedImage,
            created_at: row.scalar("created_at")?,
            updated_at: row.scalar("updated_at")?,
        }),
        Collection::Protocols => Record::Protocol(Protocol {
            id: row.identity()?,
            category: row.scalar("category")?,
            title: row.scalar("title")?,
            content: row.scalar("content")?,
            image: RedactedImage,
            created_at: row.scalar("created_at")?,
            updated_at: row.scalar("updated_at")?,
        }),
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn legacy_columns_map_to_canonical_fields() -> anyhow::Result<()> {
        let cols = columns(&["id", "diesease", "diesease_text", "diesease_img", "keyword"]);
        let values = vec![
            RawValue::Integer(3),
            RawValue::from("Stroke"),
            RawValue::from("Acute"),
            RawValue::Blob(vec![0xff, 0xd8]),
            RawValue::Null,
        ];

        let Record::ClinicalEntry(entry) = map_row(&cols, &values, Collection::ClinicalEntries)?
        else {
            return Err(anyhow::anyhow!("expected a clinical entry"));
        };
        assert_eq!(entry.id, Some(3));
        assert_eq!(entry.disease, Scalar::text("Stroke"));
        assert_eq!(entry.disease_text, Scalar::text("Acute"));
        assert_eq!(entry.keyword, Scalar::empty());
        assert_eq!(entry.disease_img, RedactedImage);
        Ok(())
    }

    #[test]
    fn canonical_column_wins_over_alias() -> anyhow::Result<()> {
        let cols = columns(&["main", "body", "title"]);
        let values = vec![RawValue::from("legacy"), RawValue::from("canonical"), RawValue::from("t")];
        let Record::Notice(notice) = map_row(&cols, &values, Collection::Notices)? else {
            return Err(anyhow::anyhow!("expected a notice"));
        };
        assert_eq!(notice.body, Scalar::text("canonical"));
        assert_eq!(notice.id, None);
        Ok(())
    }

    #[test]
    fn reals_become_text_and_extra_values_are_ignored() -> anyhow::Result<()> {
        let cols = columns(&["category", "title"]);
        let values =
            vec![RawValue::Real(2.5), RawValue::Integer(9), RawValue::from("unlabelled extra")];
        let Record::Protocol(protocol) = map_row(&cols, &values, Collection::Protocols)? else {
            return Err(anyhow::anyhow!("expected a protocol"));
        };
        assert_eq!(protocol.category, Scalar::text("2.5"));
        assert_eq!(protocol.title, Scalar::Integer(9));
        assert_eq!(protocol.content, Scalar::empty());
        Ok(())
    }

    #[test]
    fn binary_content_and_bad_identity_are_rejected() {
        let blob = map_row(
            &columns(&["title"]),
            &[RawValue::Blob(vec![1, 2])],
            Collection::Notices,
        );
        assert_eq!(
            blob,
            Err(MappingError::BinaryField { collection: Collection::Notices, field: "title" })
        );

        let identity = map_row(&columns(&["id"]), &[RawValue::from("abc")], Collection::Protocols);
        assert!(matches!(identity, Err(MappingError::InvalidIdentity { .. })));
    }
}
