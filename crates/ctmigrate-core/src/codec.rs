//! JSON encoding of migration documents.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::document::{ExportInfo, MigrationDocument, RejectedRecord};
use crate::error::MigrationError;
use crate::record::{
    label_keys, ClinicalEntry, Notice, Protocol, Record, UNKNOWN_LABEL,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Serialize)]
struct WireDocument<'a> {
    export_info: &'a ExportInfo,
    clinical_entries: &'a [ClinicalEntry],
    notices: &'a [Notice],
    protocols: &'a [Protocol],
}

/// Render `doc` as pretty-printed JSON. Rejected records are not written.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when serialization fails.
pub fn encode(doc: &MigrationDocument) -> Result<String, MigrationError> {
    let wire = WireDocument {
        export_info: &doc.export_info,
        clinical_entries: &doc.clinical_entries,
        notices: &doc.notices,
        protocols: &doc.protocols,
    };
    serde_json::to_string_pretty(&wire).map_err(|err| MigrationError::Encode(err.to_string()))
}

/// Parse a document from raw upload bytes, tolerating a UTF-8 byte order mark.
///
/// # Errors
/// Returns [`MigrationError::Decode`] for non UTF-8 input or any error
/// [`decode`] reports.
pub fn decode_bytes(bytes: &[u8]) -> Result<MigrationDocument, MigrationError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|err| MigrationError::Decode(format!("document is not UTF-8: {err}")))?;
    decode(text)
}

/// Parse a document.
///
/// The root must be an object with `export_info`. Collection keys are looked
/// up by canonical name then legacy name; a missing or null key is an empty
/// collection. Records that cannot be read are moved to
/// [`MigrationDocument::rejected`] rather than failing the whole decode.
///
/// # Errors
/// Returns [`MigrationError::Decode`] for invalid JSON, a non-object root, a
/// missing or malformed `export_info`, or a collection that is not an array.
pub fn decode(input: &str) -> Result<MigrationDocument, MigrationError> {
    let value: Value = serde_json::from_str(input)
        .map_err(|err| MigrationError::Decode(format!("document is not valid JSON: {err}")))?;
    let Value::Object(mut root) = value else {
        return Err(MigrationError::Decode("document root must be an object".to_string()));
    };
    let Some(info) = root.remove("export_info") else {
        return Err(MigrationError::Decode("document is missing export_info".to_string()));
    };
    let export_info: ExportInfo = serde_json::from_value(info)
        .map_err(|err| MigrationError::Decode(format!("export_info is malformed: {err}")))?;

    let mut doc = MigrationDocument::new(export_info);
    for collection in Collection::ALL {
        for (position, item) in take_collection(&mut root, collection)?.into_iter().enumerate() {
            match decode_record(collection, item) {
                Ok(record) => doc.push(record),
                Err((label, reason)) => {
                    tracing::debug!(%collection, position, %label, %reason, "record rejected on decode");
                    doc.rejected.push(RejectedRecord { collection, position, label, reason });
                }
            }
        }
    }
    Ok(doc)
}

fn take_collection(
    root: &mut Map<String, Value>,
    collection: Collection,
) -> Result<Vec<Value>, MigrationError> {
    let Some((key, value)) = collection
        .document_keys()
        .iter()
        .find_map(|key| root.remove(*key).map(|value| (*key, value)))
    else {
        return Ok(Vec::new());
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        other => Err(MigrationError::Decode(format!(
            "`{key}` must be an array, found {}",
            json_kind(&other)
        ))),
    }
}

fn decode_record(collection: Collection, item: Value) -> Result<Record, (String, String)> {
    if !item.is_object() {
        return Err((UNKNOWN_LABEL.to_string(), format!("record is {}, not an object", json_kind(&item))));
    }
    let label = raw_label(collection, &item);
    let parsed = match collection {
        Collection::ClinicalEntries => parse(item).map(Record::ClinicalEntry),
        Collection::Notices => parse(item).map(Record::Notice),
        Collection::Protocols => parse(item).map(Record::Protocol),
    };
    parsed.map_err(|reason| (label, reason))
}

fn parse<T: DeserializeOwned>(item: Value) -> Result<T, String> {
    serde_json::from_value(item).map_err(|err| err.to_string())
}

fn raw_label(collection: Collection, item: &Value) -> String {
    label_keys(collection)
        .iter()
        .find_map(|key| match item.get(*key) {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
