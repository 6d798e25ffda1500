//! ZIP bundle holding a document, an optional raw store copy and a manifest.

use std::io::{Cursor, Read, Seek, Write};

use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::codec;
use crate::collection::Collection;
use crate::document::{MigrationDocument, MigrationType};
use crate::error::MigrationError;

pub const DOCUMENT_ENTRY: &str = "backup_data.json";
pub const SOURCE_STORE_ENTRY: &str = "source_store.sqlite3";
pub const MANIFEST_ENTRY: &str = "README.txt";

#[derive(Debug, thiserror::Error)]
enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] ZipError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl From<ArchiveError> for MigrationError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Migration(inner) => inner,
            other => Self::Archive(other.to_string()),
        }
    }
}

/// Build a deflated archive for `doc`. `source_store` is the raw store copy;
/// when absent the entry is left out.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when the document cannot be rendered
/// and [`MigrationError::Archive`] when the ZIP cannot be written.
pub fn write_archive(
    doc: &MigrationDocument,
    source_store: Option<&[u8]>,
) -> Result<Vec<u8>, MigrationError> {
    Ok(build_archive(doc, source_store)?)
}

fn build_archive(doc: &MigrationDocument, source_store: Option<&[u8]>) -> Result<Vec<u8>, ArchiveError> {
    let encoded = codec::encode(doc)?;
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(DOCUMENT_ENTRY, options)?;
    zip.write_all(encoded.as_bytes())?;

    match source_store {
        Some(bytes) => {
            zip.start_file(SOURCE_STORE_ENTRY, options)?;
            zip.write_all(bytes)?;
        }
        None => tracing::info!(entry = SOURCE_STORE_ENTRY, "raw store copy unavailable, entry omitted"),
    }

    zip.start_file(MANIFEST_ENTRY, options)?;
    zip.write_all(manifest_text(doc, source_store.is_some()).as_bytes())?;

    Ok(zip.finish()?.into_inner())
}

/// Decode an upload that is either an archive or a bare document.
///
/// A readable ZIP is treated as an archive and must hold
/// [`DOCUMENT_ENTRY`]; anything else is decoded as a bare document.
///
/// # Errors
/// Returns [`MigrationError::Decode`] when no document can be read.
pub fn read_upload(bytes: &[u8]) -> Result<MigrationDocument, MigrationError> {
    let Ok(mut archive) = ZipArchive::new(Cursor::new(bytes)) else {
        return codec::decode_bytes(bytes);
    };
    match read_entry(&mut archive, DOCUMENT_ENTRY) {
        Ok(Some(document)) => codec::decode_bytes(&document),
        Ok(None) => Err(MigrationError::Decode(format!("archive has no {DOCUMENT_ENTRY} entry"))),
        Err(err) => Err(MigrationError::Decode(format!("archive entry unreadable: {err}"))),
    }
}

/// Raw store copy carried by an archive, if any.
///
/// # Errors
/// Returns [`MigrationError::Archive`] when `bytes` is not a readable ZIP.
pub fn read_source_store(bytes: &[u8]) -> Result<Option<Vec<u8>>, MigrationError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(ArchiveError::from)?;
    Ok(read_entry(&mut archive, SOURCE_STORE_ENTRY)?)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(Some(contents))
}

/// Plain-text manifest describing an archive.
#[must_use]
pub fn manifest_text(doc: &MigrationDocument, includes_source_store: bool) -> String {
    let info = &doc.export_info;
    let mut lines = vec![
        "ctmigrate backup".to_string(),
        "================".to_string(),
        String::new(),
        format!("Created: {}", info.timestamp),
        format!("Format version: {}", info.format_version),
        format!("Migration type: {}", info.migration_type),
    ];
    if !info.source_label.is_empty() {
        lines.push(format!("Source: {}", info.source_label));
    }

    lines.extend([String::new(), "Records:".to_string()]);
    lines.extend(
        Collection::ALL
            .into_iter()
            .map(|collection| format!("  {}: {}", collection.display_name(), doc.len_of(collection))),
    );

    lines.extend([
        String::new(),
        "Contents:".to_string(),
        format!("  {DOCUMENT_ENTRY}: portable migration document (JSON)"),
    ]);
    if includes_source_store {
        lines.push(format!("  {SOURCE_STORE_ENTRY}: raw copy of the source database"));
    }
    lines.extend([
        format!("  {MANIFEST_ENTRY}: this file"),
        String::new(),
        "Restore:".to_string(),
        format!("  Upload this archive or {DOCUMENT_ENTRY} to the restore screen,"),
        "  or run `ctm --db <target> restore --in <file>`.".to_string(),
        String::new(),
        "Notes:".to_string(),
        "  - Images are not included; image fields are exported empty.".to_string(),
        "  - User accounts and sessions are not included.".to_string(),
    ]);
    lines.push(if info.migration_type == MigrationType::CompleteReplacement {
        "  - Restoring replaces all existing content in the target.".to_string()
    } else {
        "  - Restoring appends to existing content in the target.".to_string()
    });

    let mut text = lines.join("\n");
    text.push('\n');
    text
}
