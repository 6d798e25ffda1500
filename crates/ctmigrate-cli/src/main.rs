use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ctmigrate_api::{ArchiveRequest, ExportSummary, MigrationApi, OperationStatus};
use ctmigrate_core::{ExportOptions, MigrationType, RestoreOptions};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ctm")]
#[command(about = "CT library migration and backup CLI")]
struct Cli {
    #[arg(long, default_value = "./ctmigrate.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    /// Write the content collections as a bare JSON document.
    Export(ExportArgs),
    /// Write a ZIP backup archive.
    Backup(BackupArgs),
    /// Apply a backup archive or JSON document to the database.
    Restore(RestoreArgs),
    /// Describe an upload without touching the database.
    Preview(PreviewArgs),
    /// Convert a legacy database file into a replacement document.
    LegacyExport(LegacyExportArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Init,
    Counts,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = MigrationTypeArg::CompleteReplacement)]
    migration_type: MigrationTypeArg,
    #[arg(long)]
    source_label: Option<String>,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = MigrationTypeArg::CompleteReplacement)]
    migration_type: MigrationTypeArg,
    #[arg(long, default_value_t = false)]
    no_source_store: bool,
    #[arg(long)]
    source_label: Option<String>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = 10)]
    progress_every: usize,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct LegacyExportArgs {
    #[arg(long)]
    legacy_db: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MigrationTypeArg {
    Additive,
    CompleteReplacement,
}

impl MigrationTypeArg {
    fn into_migration_type(self) -> MigrationType {
        match self {
            Self::Additive => MigrationType::Additive,
            Self::CompleteReplacement => MigrationType::CompleteReplacement,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Print the operation result, then turn a failed status into a non-zero exit.
fn emit_outcome(operation: &str, status: &OperationStatus, value: Value) -> Result<()> {
    emit_json(value)?;
    match status {
        OperationStatus::Ok => Ok(()),
        OperationStatus::Failed { kind, reason } => {
            Err(anyhow!("{operation} failed ({kind}): {reason}"))
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ctmigrate=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let api = MigrationApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Export(args) => run_export(&args, &api),
        Command::Backup(args) => run_backup(&args, &api),
        Command::Restore(args) => run_restore(&args, &api),
        Command::Preview(args) => run_preview(&args, &api),
        Command::LegacyExport(args) => run_legacy_export(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &MigrationApi) -> Result<()> {
    match command {
        DbCommand::Init => {
            let report = api.init_schema()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize schema report")?)
        }
        DbCommand::Counts => {
            let counts = api.collection_counts()?;
            let total: usize = counts.values().sum();
            emit_json(serde_json::json!({
                "db": api.db_path(),
                "record_counts": counts,
                "total_records": total
            }))
        }
    }
}

fn output_path(requested: Option<&PathBuf>, summary: Option<&ExportSummary>) -> Option<PathBuf> {
    requested.cloned().or_else(|| summary.map(|summary| PathBuf::from(&summary.file_name)))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn insert_field(value: &mut Value, key: &str, field: Value) {
    if let Value::Object(object) = value {
        object.insert(key.to_string(), field);
    }
}

fn run_export(args: &ExportArgs, api: &MigrationApi) -> Result<()> {
    let options = ExportOptions {
        migration_type: args.migration_type.into_migration_type(),
        source_label: args.source_label.clone(),
    };
    let result = api.export_document(&options);
    let mut value = serde_json::to_value(&result).context("failed to serialize export result")?;
    if let (Some(document), Some(out)) =
        (result.document.as_ref(), output_path(args.out.as_ref(), result.summary.as_ref()))
    {
        write_output(&out, document.as_bytes())?;
        insert_field(&mut value, "out", serde_json::json!(out));
    }
    emit_outcome("export", &result.status, value)
}

fn run_backup(args: &BackupArgs, api: &MigrationApi) -> Result<()> {
    let request = ArchiveRequest {
        migration_type: args.migration_type.into_migration_type(),
        include_source_store: !args.no_source_store,
        source_label: args.source_label.clone(),
    };
    let result = api.export_migration_archive(&request);
    let mut value = serde_json::to_value(&result).context("failed to serialize backup result")?;
    if let (Some(archive), Some(out)) =
        (result.archive.as_ref(), output_path(args.out.as_ref(), result.summary.as_ref()))
    {
        write_output(&out, archive)?;
        insert_field(&mut value, "out", serde_json::json!(out));
        insert_field(&mut value, "archive_bytes", serde_json::json!(archive.len()));
    }
    emit_outcome("backup", &result.status, value)
}

fn read_upload(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read upload {}", path.display()))
}

fn run_restore(args: &RestoreArgs, api: &MigrationApi) -> Result<()> {
    let bytes = read_upload(&args.input)?;
    tracing::debug!(input = %args.input.display(), bytes = bytes.len(), "upload read");
    let options = RestoreOptions { progress_every: args.progress_every };
    let result = api.restore_from_upload_with(&bytes, &options);
    let mut value = serde_json::to_value(&result).context("failed to serialize restore result")?;
    insert_field(&mut value, "restored_from", serde_json::json!(args.input));
    emit_outcome("restore", &result.status, value)
}

fn run_preview(args: &PreviewArgs, api: &MigrationApi) -> Result<()> {
    let bytes = read_upload(&args.input)?;
    let result = api.preview_upload(&bytes);
    let value = serde_json::to_value(&result).context("failed to serialize preview result")?;
    emit_outcome("preview", &result.status, value)
}

fn run_legacy_export(args: &LegacyExportArgs, api: &MigrationApi) -> Result<()> {
    let result = api.export_legacy(&args.legacy_db);
    let mut value =
        serde_json::to_value(&result).context("failed to serialize legacy export result")?;
    if let (Some(document), Some(out)) =
        (result.document.as_ref(), output_path(args.out.as_ref(), result.summary.as_ref()))
    {
        write_output(&out, document.as_bytes())?;
        insert_field(&mut value, "out", serde_json::json!(out));
    }
    emit_outcome("legacy export", &result.status, value)
}
