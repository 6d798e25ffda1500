use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ctm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ctm"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ctm binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ctm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ctm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout_json(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_document(path: &Path, migration_type: &str, diseases: &[&str]) {
    let entries: Vec<Value> = diseases
        .iter()
        .map(|disease| serde_json::json!({ "disease": disease, "disease_text": "text" }))
        .collect();
    let document = serde_json::json!({
        "export_info": {
            "timestamp": "2024-05-01T10:00:00Z",
            "format_version": "2.0",
            "migration_type": migration_type,
            "source_label": "fixture"
        },
        "clinical_entries": entries,
        "notices": [{ "title": "Holiday hours", "body": "Closed" }],
        "protocols": []
    });
    fs::write(path, document.to_string())
        .unwrap_or_else(|err| panic!("failed to write document {}: {err}", path.display()));
}

fn collection_count(value: &Value, collection: &str) -> i64 {
    let counts = value
        .get("record_counts")
        .unwrap_or_else(|| panic!("missing record_counts in payload: {value}"));
    as_i64(counts, collection)
}

// Test IDs: TCLI-001
#[test]
fn db_init_creates_canonical_tables() {
    let dir = unique_temp_dir("ctm-cli-init");
    let db = dir.join("target.sqlite3");

    let init = run_json(["--db", path_str(&db), "db", "init"]);
    assert_eq!(as_str(&init, "contract_version"), "cli.v1");
    let tables = init
        .get("collection_tables")
        .unwrap_or_else(|| panic!("missing collection_tables in payload: {init}"));
    assert_eq!(as_str(tables, "clinical_entries"), "clinical_entries");
    assert_eq!(as_str(tables, "protocols"), "protocols");

    let counts = run_json(["--db", path_str(&db), "db", "counts"]);
    assert_eq!(collection_count(&counts, "clinical_entries"), 0);
    assert_eq!(as_i64(&counts, "total_records"), 0);
}

// Test IDs: TCLI-002
#[test]
fn backup_archive_replaces_target_content() {
    let dir = unique_temp_dir("ctm-cli-backup");
    let source_db = dir.join("source.sqlite3");
    let target_db = dir.join("target.sqlite3");
    let source_doc = dir.join("source.json");
    let target_doc = dir.join("target.json");
    let archive = dir.join("backup.zip");

    write_document(&source_doc, "complete_replacement", &["Stroke", "Pneumonia"]);
    write_document(&target_doc, "additive", &["a", "b", "c", "d", "e"]);

    let seeded = run_json(["--db", path_str(&source_db), "restore", "--in", path_str(&source_doc)]);
    assert_eq!(as_str(&seeded, "status"), "ok");
    run_json(["--db", path_str(&target_db), "restore", "--in", path_str(&target_doc)]);

    let backup =
        run_json(["--db", path_str(&source_db), "backup", "--out", path_str(&archive)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(archive.exists());
    let summary = backup.get("summary").unwrap_or_else(|| panic!("missing summary: {backup}"));
    assert_eq!(collection_count(summary, "clinical_entries"), 2);
    assert_eq!(as_str(summary, "migration_type"), "complete_replacement");

    let restored = run_json([
        "--db",
        path_str(&target_db),
        "restore",
        "--in",
        path_str(&archive),
        "--progress-every",
        "1",
    ]);
    assert_eq!(as_str(&restored, "status"), "ok");
    let clinical = restored
        .get("report")
        .and_then(|report| report.get("collections"))
        .and_then(|collections| collections.get("clinical_entries"))
        .unwrap_or_else(|| panic!("missing clinical_entries report: {restored}"));
    assert_eq!(as_i64(clinical, "deleted_before_insert"), 5);
    assert_eq!(as_i64(clinical, "inserted"), 2);

    let counts = run_json(["--db", path_str(&target_db), "db", "counts"]);
    assert_eq!(collection_count(&counts, "clinical_entries"), 2);
    assert_eq!(collection_count(&counts, "notices"), 1);
    assert_eq!(collection_count(&counts, "protocols"), 0);
}

// Test IDs: TCLI-003
#[test]
fn export_then_preview_reports_document_shape() {
    let dir = unique_temp_dir("ctm-cli-export");
    let db = dir.join("source.sqlite3");
    let doc = dir.join("seed.json");
    let exported = dir.join("out").join("export.json");

    write_document(&doc, "additive", &["Stroke"]);
    run_json(["--db", path_str(&db), "restore", "--in", path_str(&doc)]);

    let export = run_json([
        "--db",
        path_str(&db),
        "export",
        "--out",
        path_str(&exported),
        "--migration-type",
        "additive",
    ]);
    assert_eq!(as_str(&export, "status"), "ok");
    assert_eq!(as_str(&export, "out"), path_str(&exported));

    let preview = run_json(["--db", path_str(&db), "preview", "--in", path_str(&exported)]);
    let details = preview.get("preview").unwrap_or_else(|| panic!("missing preview: {preview}"));
    assert_eq!(as_str(details, "migration_type"), "additive");
    assert_eq!(as_str(details, "format_version"), "2.0");
    assert_eq!(collection_count(details, "clinical_entries"), 1);
    assert_eq!(as_i64(details, "total_records"), 2);
}

// Test IDs: TCLI-004
#[test]
fn malformed_upload_exits_non_zero_with_failed_status() {
    let dir = unique_temp_dir("ctm-cli-malformed");
    let db = dir.join("target.sqlite3");
    let upload = dir.join("broken.json");
    fs::write(&upload, r#"{ "clinical_entries": [] }"#)
        .unwrap_or_else(|err| panic!("failed to write upload: {err}"));

    let output = run_ctm(["--db", path_str(&db), "restore", "--in", path_str(&upload)]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(as_str(&value, "status"), "failed");
    assert_eq!(as_str(&value, "kind"), "decode");
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
}

// Test IDs: TCLI-005
#[test]
fn export_from_missing_database_reports_connection_failure() {
    let dir = unique_temp_dir("ctm-cli-missing");
    let db = dir.join("absent.sqlite3");
    let out = dir.join("backup.zip");

    let output = run_ctm(["--db", path_str(&db), "backup", "--out", path_str(&out)]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(as_str(&value, "kind"), "connection");
    assert!(!out.exists());
    assert!(!db.exists());
}
