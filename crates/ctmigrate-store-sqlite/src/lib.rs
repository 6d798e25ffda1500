use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ctmigrate_core::{
    Collection, FieldKind, RawValue, RecordRef, RecordStore, Scalar, SourceStore, StoreError,
    PRESERVED_TABLES,
};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, ErrorCode, ToSql};
use serde::{Deserialize, Serialize};

const CREATE_CLINICAL_ENTRIES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS clinical_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  disease TEXT NOT NULL,
  disease_text TEXT NOT NULL,
  keyword TEXT,
  protocol TEXT,
  protocol_text TEXT,
  processing TEXT,
  processing_text TEXT,
  contrast TEXT,
  contrast_text TEXT,
  disease_img TEXT,
  protocol_img TEXT,
  processing_img TEXT,
  contrast_img TEXT,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const CREATE_NOTICES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT,
  body TEXT,
  image TEXT,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const CREATE_PROTOCOLS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS protocols (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  category TEXT NOT NULL,
  title TEXT NOT NULL,
  content TEXT NOT NULL,
  image TEXT,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

const CREATE_PRESERVED_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  email TEXT UNIQUE NOT NULL,
  userid TEXT,
  password TEXT NOT NULL,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS user_sessions (
  user_id INTEGER PRIMARY KEY,
  session_data TEXT,
  last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

/// Column-aware insert statement for one collection's target table.
#[derive(Debug, Clone)]
struct InsertPlan {
    sql: String,
    /// Canonical field bound to each positional parameter.
    bound_fields: Vec<&'static str>,
}

pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    plans: BTreeMap<Collection, InsertPlan>,
    /// Apply the schema inside the restore transaction opened by `begin`.
    bootstrap_on_begin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaReport {
    /// Canonical tables created because the collection had no table yet.
    pub created_tables: Vec<String>,
    /// Table each collection resolves to after the bootstrap.
    pub collection_tables: BTreeMap<Collection, String>,
}

impl SqliteStore {
    /// Open (or create) a SQLite store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, path: path.to_path_buf(), plans: BTreeMap::new(), bootstrap_on_begin: false })
    }

    /// Open a store that must already exist on disk.
    ///
    /// # Errors
    /// Returns an error when the file is missing or cannot be opened.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("database file does not exist: {}", path.display()));
        }
        Self::open(path)
    }

    /// Create missing tables as part of every restore transaction, so an
    /// aborted restore leaves no new tables behind.
    #[must_use]
    pub fn with_schema_bootstrap(mut self) -> Self {
        self.bootstrap_on_begin = true;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create canonical content tables for collections that have no table
    /// yet, plus the preserved account tables. Legacy tables are left as they
    /// are and keep receiving their collection.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read or a table cannot be created.
    pub fn ensure_schema(&mut self) -> Result<SchemaReport> {
        let tx = self.conn.transaction().context("failed to start schema transaction")?;
        let report = apply_schema(&tx)?;
        tx.commit().context("failed to commit schema transaction")?;
        self.plans.clear();
        Ok(report)
    }

    /// Row count per collection; a collection without a table counts zero.
    ///
    /// # Errors
    /// Returns an error when a table cannot be counted.
    pub fn collection_counts(&self) -> Result<BTreeMap<Collection, usize>> {
        let mut counts = BTreeMap::new();
        for collection in Collection::ALL {
            let count = match resolve_target_table(&self.conn, collection)? {
                Some(table) => count_rows(&self.conn, &table)?,
                None => 0,
            };
            counts.insert(collection, count);
        }
        Ok(counts)
    }

    /// Row count of an arbitrary table, `None` when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the table cannot be counted.
    pub fn table_row_count(&self, table: &str) -> Result<Option<usize>> {
        if !table_exists(&self.conn, table)? {
            return Ok(None);
        }
        count_rows(&self.conn, table).map(Some)
    }

    /// Consistent copy of the whole database file, taken with the online
    /// backup API.
    ///
    /// # Errors
    /// Returns an error when the backup or the read-back fails.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("failed to create snapshot directory")?;
        let out_file = dir.path().join("snapshot.sqlite3");

        self.conn
            .backup(DatabaseName::Main, &out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;

        fs::read(&out_file)
            .with_context(|| format!("failed to read sqlite backup at {}", out_file.display()))
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .context("failed to read sqlite catalog")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn read_rows(&self, table: &str, order_by: &str) -> Result<Vec<Vec<RawValue>>> {
        let sql = format!("SELECT * FROM {} ORDER BY {} ASC", quote_ident(table), quote_ident(order_by));
        let mut stmt =
            self.conn.prepare(&sql).with_context(|| format!("failed to prepare read of {table}"))?;
        let width = stmt.column_count();
        let mut rows = stmt.query([]).with_context(|| format!("failed to read {table}"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(raw_value(row.get_ref(index)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn target_table(&self, collection: Collection) -> Result<Option<String>> {
        resolve_target_table(&self.conn, collection)
    }

    fn insert_record(&mut self, record: RecordRef<'_>) -> Result<()> {
        let collection = record.collection();
        let plan = insert_plan(&self.conn, &mut self.plans, collection)?;
        let bound = plan.bound_fields.iter().map(|field| ScalarParam(record.scalar(field)));

        let mut stmt = self
            .conn
            .prepare_cached(&plan.sql)
            .with_context(|| format!("failed to prepare insert into {collection}"))?;
        stmt.execute(params_from_iter(bound))
            .with_context(|| format!("failed to insert {collection} record"))?;
        Ok(())
    }
}

impl SourceStore for SqliteStore {
    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.list_tables().map_err(|err| store_error(&err))
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        table_columns(&self.conn, table).map_err(|err| store_error(&err))
    }

    fn fetch_rows(&self, table: &str, order_by: &str) -> Result<Vec<Vec<RawValue>>, StoreError> {
        self.read_rows(table, order_by).map_err(|err| store_error(&err))
    }

    fn source_label(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

impl RecordStore for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        self.plans.clear();
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("failed to begin restore transaction")
            .map_err(|err| store_error(&err))?;
        if !self.bootstrap_on_begin {
            return Ok(());
        }
        if let Err(err) = apply_schema(&self.conn) {
            if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %rollback, "rollback after failed bootstrap failed");
            }
            return Err(StoreError::Operation(format!("{err:#}")));
        }
        Ok(())
    }

    fn count(&mut self, collection: Collection) -> Result<usize, StoreError> {
        let counted = self.target_table(collection).and_then(|table| match table {
            Some(table) => count_rows(&self.conn, &table),
            None => Ok(0),
        });
        counted.map_err(|err| store_error(&err))
    }

    fn purge(&mut self, collection: Collection) -> Result<usize, StoreError> {
        let purged = self.target_table(collection).and_then(|table| match table {
            Some(table) => self
                .conn
                .execute(&format!("DELETE FROM {}", quote_ident(&table)), [])
                .with_context(|| format!("failed to purge {table}")),
            None => Ok(0),
        });
        purged.map_err(|err| store_error(&err))
    }

    fn insert(&mut self, record: RecordRef<'_>) -> Result<(), StoreError> {
        self.insert_record(record).map_err(|err| {
            // RAISE(ROLLBACK) and ON CONFLICT ROLLBACK end the transaction
            // themselves; nothing after this may run in autocommit.
            if self.conn.is_autocommit() {
                StoreError::Operation(format!("transaction was rolled back by the store: {err:#}"))
            } else {
                store_error(&err)
            }
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .context("failed to commit restore transaction")
            .map_err(|err| store_error(&err))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .context("failed to roll back restore transaction")
            .map_err(|err| store_error(&err))
    }
}

struct ScalarParam<'a>(Option<&'a Scalar>);

impl ToSql for ScalarParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Some(Scalar::Integer(value)) => ToSqlOutput::from(*value),
            Some(Scalar::Text(text)) => ToSqlOutput::from(text.as_str()),
            None => ToSqlOutput::from(""),
        })
    }
}

/// Classify a store failure. Constraint violations only concern the record
/// being written; open failures mean the store is unreachable.
fn store_error(err: &anyhow::Error) -> StoreError {
    let message = format!("{err:#}");
    let code = err.chain().find_map(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => Some(failure.code),
        _ => None,
    });
    match code {
        Some(ErrorCode::ConstraintViolation) => StoreError::RecordRejected(message),
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied) => {
            StoreError::Unavailable(message)
        }
        _ => StoreError::Operation(message),
    }
}

/// Create canonical tables for collections without one, plus the preserved
/// account tables. Runs inside whatever transaction `conn` is in.
fn apply_schema(conn: &Connection) -> Result<SchemaReport> {
    let mut created_tables = Vec::new();
    let mut collection_tables = BTreeMap::new();

    for collection in Collection::ALL {
        let table = match resolve_target_table(conn, collection)? {
            Some(table) => table,
            None => {
                conn.execute_batch(create_table_sql(collection))
                    .with_context(|| format!("failed to create table {}", collection.table_name()))?;
                created_tables.push(collection.table_name().to_string());
                collection.table_name().to_string()
            }
        };
        collection_tables.insert(collection, table);
    }

    for table in PRESERVED_TABLES {
        if !table_exists(conn, table)? {
            created_tables.push(table.to_string());
        }
    }
    conn.execute_batch(CREATE_PRESERVED_TABLES_SQL).context("failed to apply account tables")?;

    if !created_tables.is_empty() {
        tracing::info!(tables = ?created_tables, "schema bootstrapped");
    }
    Ok(SchemaReport { created_tables, collection_tables })
}

fn create_table_sql(collection: Collection) -> &'static str {
    match collection {
        Collection::ClinicalEntries => CREATE_CLINICAL_ENTRIES_SQL,
        Collection::Notices => CREATE_NOTICES_SQL,
        Collection::Protocols => CREATE_PROTOCOLS_SQL,
    }
}

fn insert_plan<'p>(
    conn: &Connection,
    plans: &'p mut BTreeMap<Collection, InsertPlan>,
    collection: Collection,
) -> Result<&'p InsertPlan> {
    if !plans.contains_key(&collection) {
        let plan = build_insert_plan(conn, collection)?;
        tracing::debug!(%collection, sql = %plan.sql, "insert plan prepared");
        plans.insert(collection, plan);
    }
    plans.get(&collection).ok_or_else(|| anyhow!("insert plan for {collection} was not cached"))
}

fn build_insert_plan(conn: &Connection, collection: Collection) -> Result<InsertPlan> {
    let Some(table) = resolve_target_table(conn, collection)? else {
        return Err(anyhow!("target store has no table for {collection}; run `ctm db init` first"));
    };
    let available = table_columns(conn, &table)?;

    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut bound_fields = Vec::new();
    for spec in collection.fields() {
        let Some(column) = std::iter::once(spec.name)
            .chain(spec.aliases.iter().copied())
            .find(|candidate| available.iter().any(|name| name == candidate))
        else {
            continue;
        };
        match spec.kind {
            FieldKind::Identity => continue,
            FieldKind::Content => {
                bound_fields.push(spec.name);
                values.push(format!("?{}", bound_fields.len()));
            }
            FieldKind::Image => values.push("''".to_string()),
            FieldKind::Timestamp => {
                bound_fields.push(spec.name);
                values.push(format!("COALESCE(NULLIF(?{}, ''), CURRENT_TIMESTAMP)", bound_fields.len()));
            }
        }
        columns.push(quote_ident(column));
    }

    if columns.is_empty() {
        return Err(anyhow!("table {table} has no columns for {collection}"));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&table),
        columns.join(", "),
        values.join(", ")
    );
    Ok(InsertPlan { sql, bound_fields })
}

fn resolve_target_table(conn: &Connection, collection: Collection) -> Result<Option<String>> {
    for candidate in collection.table_candidates() {
        if table_exists(conn, candidate)? {
            return Ok(Some((*candidate).to_string()));
        }
    }
    Ok(None)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).with_context(|| format!("row count for {table} out of range: {count}"))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn raw_value(value: ValueRef<'_>) -> RawValue {
    match value {
        ValueRef::Null => RawValue::Null,
        ValueRef::Integer(value) => RawValue::Integer(value),
        ValueRef::Real(value) => RawValue::Real(value),
        ValueRef::Text(bytes) => RawValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => RawValue::Blob(bytes.to_vec()),
    }
}
