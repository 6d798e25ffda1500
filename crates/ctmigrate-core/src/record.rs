//! Canonical record shapes, one closed struct per collection.
//!
//! Every field has a documented default: `Scalar::Text("")` for content,
//! `None` for the identity, and the redacted token for images. Records decode
//! leniently (unknown keys ignored, missing keys defaulted, legacy key names
//! accepted) so that one odd document never forces a hand-edit.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

use serde::de::{self, IgnoredAny, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::collection::Collection;

/// Label used when a record has no usable human-readable name.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// A portable field value: text or integer.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Scalar {
    Integer(i64),
    Text(String),
}

impl Scalar {
    #[must_use]
    pub fn empty() -> Self {
        Self::Text(String::new())
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(text) if text.is_empty())
    }

    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Integer(value) => Cow::Owned(value.to_string()),
            Self::Text(text) => Cow::Borrowed(text),
        }
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Self::empty()
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Text(text) => serializer.serialize_str(text),
        }
    }
}

struct ScalarVisitor;

impl Visitor<'_> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("a string or a number")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Scalar, E> {
        Ok(Scalar::Integer(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Scalar, E> {
        Ok(i64::try_from(value).map_or_else(|_| Scalar::Text(value.to_string()), Scalar::Integer))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Scalar, E> {
        Ok(Scalar::Text(value.to_string()))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Scalar, E> {
        Ok(Scalar::Text(value.to_string()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<Scalar, E> {
        Ok(Scalar::Text(value))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::empty())
    }

    fn visit_none<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::empty())
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// Image or binary payload slot. It carries no data: it always encodes as
/// `""` and discards whatever a document holds in its place.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct RedactedImage;

impl Serialize for RedactedImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

impl<'de> Deserialize<'de> for RedactedImage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Self)
    }
}

/// Source-store identity, encoded as an integer or `""` when absent.
pub(crate) mod identity {
    use std::fmt::{self, Formatter};

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.serialize_i64(*id),
            None => serializer.serialize_str(""),
        }
    }

    struct IdentityVisitor;

    impl Visitor<'_> for IdentityVisitor {
        type Value = Option<i64>;

        fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str("an integer identity or an empty string")
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Option<i64>, E> {
            Ok(Some(value))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Option<i64>, E> {
            i64::try_from(value)
                .map(Some)
                .map_err(|_| E::custom(format!("identity {value} is out of range")))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Option<i64>, E> {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse()
                .map(Some)
                .map_err(|_| E::custom(format!("identity `{value}` is not an integer")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        deserializer.deserialize_any(IdentityVisitor)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ClinicalEntry {
    #[serde(with = "identity")]
    pub id: Option<i64>,
    #[serde(alias = "diesease")]
    pub disease: Scalar,
    #[serde(alias = "diesease_text")]
    pub disease_text: Scalar,
    pub keyword: Scalar,
    pub protocol: Scalar,
    pub protocol_text: Scalar,
    pub processing: Scalar,
    pub processing_text: Scalar,
    pub contrast: Scalar,
    pub contrast_text: Scalar,
    #[serde(alias = "diesease_img")]
    pub disease_img: RedactedImage,
    pub protocol_img: RedactedImage,
    pub processing_img: RedactedImage,
    pub contrast_img: RedactedImage,
    pub created_at: Scalar,
    pub updated_at: Scalar,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Notice {
    #[serde(with = "identity")]
    pub id: Option<i64>,
    pub title: Scalar,
    #[serde(alias = "main")]
    pub body: Scalar,
    #[serde(alias = "post_img")]
    pub image: RedactedImage,
    pub created_at: Scalar,
    pub updated_at: Scalar,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Protocol {
    #[serde(with = "identity")]
    pub id: Option<i64>,
    pub category: Scalar,
    pub title: Scalar,
    pub content: Scalar,
    #[serde(alias = "protocol_img")]
    pub image: RedactedImage,
    pub created_at: Scalar,
    pub updated_at: Scalar,
}

/// An owned record of any collection, as produced by the record mapper.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Record {
    ClinicalEntry(ClinicalEntry),
    Notice(Notice),
    Protocol(Protocol),
}

impl Record {
    #[must_use]
    pub fn collection(&self) -> Collection {
        self.borrowed().collection()
    }

    #[must_use]
    pub fn borrowed(&self) -> RecordRef<'_> {
        match self {
            Self::ClinicalEntry(entry) => RecordRef::ClinicalEntry(entry),
            Self::Notice(notice) => RecordRef::Notice(notice),
            Self::Protocol(protocol) => RecordRef::Protocol(protocol),
        }
    }
}

/// A borrowed record handed to a store for insertion.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordRef<'a> {
    ClinicalEntry(&'a ClinicalEntry),
    Notice(&'a Notice),
    Protocol(&'a Protocol),
}

impl<'a> RecordRef<'a> {
    #[must_use]
    pub fn collection(self) -> Collection {
        match self {
            Self::ClinicalEntry(_) => Collection::ClinicalEntries,
            Self::Notice(_) => Collection::Notices,
            Self::Protocol(_) => Collection::Protocols,
        }
    }

    /// Value of a content or timestamp field by canonical name.
    #[must_use]
    pub fn scalar(self, field: &str) -> Option<&'a Scalar> {
        let value = match (self, field) {
            (Self::ClinicalEntry(entry), "disease") => &entry.disease,
            (Self::ClinicalEntry(entry), "disease_text") => &entry.disease_text,
            (Self::ClinicalEntry(entry), "keyword") => &entry.keyword,
            (Self::ClinicalEntry(entry), "protocol") => &entry.protocol,
            (Self::ClinicalEntry(entry), "protocol_text") => &entry.protocol_text,
            (Self::ClinicalEntry(entry), "processing") => &entry.processing,
            (Self::ClinicalEntry(entry), "processing_text") => &entry.processing_text,
            (Self::ClinicalEntry(entry), "contrast") => &entry.contrast,
            (Self::ClinicalEntry(entry), "contrast_text") => &entry.contrast_text,
            (Self::ClinicalEntry(entry), "created_at") => &entry.created_at,
            (Self::ClinicalEntry(entry), "updated_at") => &entry.updated_at,
            (Self::Notice(notice), "title") => &notice.title,
            (Self::Notice(notice), "body") => &notice.body,
            (Self::Notice(notice), "created_at") => &notice.created_at,
            (Self::Notice(notice), "updated_at") => &notice.updated_at,
            (Self::Protocol(protocol), "category") => &protocol.category,
            (Self::Protocol(protocol), "title") => &protocol.title,
            (Self::Protocol(protocol), "content") => &protocol.content,
            (Self::Protocol(protocol), "created_at") => &protocol.created_at,
            (Self::Protocol(protocol), "updated_at") => &protocol.updated_at,
            _ => return None,
        };
        Some(value)
    }

    /// Human-readable name used in logs and reports in place of the identity.
    #[must_use]
    pub fn label(self) -> String {
        let name = match self {
            Self::ClinicalEntry(entry) => &entry.disease,
            Self::Notice(notice) => &notice.title,
            Self::Protocol(protocol) => &protocol.title,
        };
        if name.is_empty() {
            UNKNOWN_LABEL.to_string()
        } else {
            name.to_string()
        }
    }
}

/// Keys holding the human-readable label of a raw document record.
pub(crate) fn label_keys(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::ClinicalEntries => &["disease", "diesease"],
        Collection::Notices | Collection::Protocols => &["title"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::FieldKind;

    #[test]
    fn identity_encodes_absent_as_empty_string() -> anyhow::Result<()> {
        let notice = Notice { title: Scalar::text("Holiday hours"), ..Notice::default() };
        let value = serde_json::to_value(&notice)?;
        assert_eq!(value["id"], serde_json::json!(""));
        assert_eq!(value["image"], serde_json::json!(""));
        assert_eq!(value["body"], serde_json::json!(""));
        Ok(())
    }

    #[test]
    fn legacy_keys_decode_into_canonical_fields() -> anyhow::Result<()> {
        let entry: ClinicalEntry = serde_json::from_value(serde_json::json!({
            "id": 7,
            "diesease": "Stroke",
            "diesease_text": "Acute onset",
            "diesease_img": "data:image/png;base64,AAAA",
            "keyword": "brain"
        }))?;
        assert_eq!(entry.id, Some(7));
        assert_eq!(entry.disease, Scalar::text("Stroke"));
        assert_eq!(entry.disease_text, Scalar::text("Acute onset"));
        assert_eq!(entry.disease_img, RedactedImage);
        assert_eq!(entry.contrast, Scalar::empty());

        let notice: Notice =
            serde_json::from_value(serde_json::json!({ "title": "t", "main": "b", "post_img": "x" }))?;
        assert_eq!(notice.body, Scalar::text("b"));
        Ok(())
    }

    #[test]
    fn scalar_defaults_null_and_rejects_nested_values() -> anyhow::Result<()> {
        assert_eq!(serde_json::from_value::<Scalar>(serde_json::Value::Null)?, Scalar::empty());
        assert!(serde_json::from_value::<Scalar>(serde_json::json!({ "a": 1 })).is_err());
        assert!(serde_json::from_value::<Scalar>(serde_json::json!(true)).is_err());
        Ok(())
    }

    #[test]
    fn identity_accepts_numeric_strings_and_rejects_words() {
        let ok: Result<Protocol, _> = serde_json::from_value(serde_json::json!({ "id": "12" }));
        assert!(matches!(ok, Ok(Protocol { id: Some(12), .. })));
        let bad: Result<Protocol, _> = serde_json::from_value(serde_json::json!({ "id": "twelve" }));
        assert!(bad.is_err());
    }

    #[test]
    fn every_content_field_is_addressable_by_name() {
        let notice = Notice::default();
        let protocol = Protocol::default();
        let entry = ClinicalEntry::default();
        let records = [
            RecordRef::Notice(&notice),
            RecordRef::Protocol(&protocol),
            RecordRef::ClinicalEntry(&entry),
        ];
        for record in records {
            for spec in record.collection().fields() {
                let addressable = record.scalar(spec.name).is_some();
                let expected = matches!(spec.kind, FieldKind::Content | FieldKind::Timestamp);
                assert_eq!(addressable, expected, "{}.{}", record.collection(), spec.name);
            }
        }
    }

    #[test]
    fn label_falls_back_when_name_is_empty() {
        let protocol = Protocol::default();
        assert_eq!(RecordRef::Protocol(&protocol).label(), UNKNOWN_LABEL);
        let entry = ClinicalEntry { disease: Scalar::text("Pneumonia"), ..ClinicalEntry::default() };
        assert_eq!(RecordRef::ClinicalEntry(&entry).label(), "Pneumonia");
    }
}
