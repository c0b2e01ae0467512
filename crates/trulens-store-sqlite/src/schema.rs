use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use trulens_store_core::DbMeta;

pub(crate) const TABLE_META: &str = "meta";
pub(crate) const TABLE_RECORDS: &str = "records";
pub(crate) const TABLE_FEEDBACKS: &str = "feedbacks";
pub(crate) const TABLE_FEEDBACK_DEFS: &str = "feedback_defs";
pub(crate) const TABLE_APPS: &str = "apps";

/// Tables dropped by a reset. `meta` is not among them, so the version
/// marker outlives a reset.
pub(crate) const DATA_TABLES: [&str; 4] = [
    TABLE_RECORDS,
    TABLE_FEEDBACKS,
    TABLE_FEEDBACK_DEFS,
    TABLE_APPS,
];

pub(crate) const META_TRULENS_VERSION: &str = "trulens_version";
pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";

const SCHEMA_META: &str = r"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT NOT NULL PRIMARY KEY,
  value TEXT
);
";

// Column order is part of the on-disk contract: records is read with `r.*`.
const SCHEMA_DATA_V1: &str = r"
CREATE TABLE IF NOT EXISTS records (
  record_id TEXT NOT NULL PRIMARY KEY,
  app_id TEXT NOT NULL,
  input TEXT,
  output TEXT,
  record_json TEXT NOT NULL,
  tags TEXT NOT NULL,
  ts REAL NOT NULL,
  cost_json TEXT NOT NULL,
  perf_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedbacks (
  feedback_result_id TEXT NOT NULL PRIMARY KEY,
  record_id TEXT NOT NULL,
  feedback_definition_id TEXT,
  last_ts REAL NOT NULL,
  status TEXT NOT NULL,
  error TEXT,
  calls_json TEXT NOT NULL,
  result REAL,
  name TEXT NOT NULL,
  cost_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback_defs (
  feedback_definition_id TEXT NOT NULL PRIMARY KEY,
  feedback_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS apps (
  app_id TEXT NOT NULL PRIMARY KEY,
  app_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_app ON records(app_id);
CREATE INDEX IF NOT EXISTS idx_feedbacks_record ON feedbacks(record_id);
";

const RECORDS_COLUMNS: &[&str] = &[
    "record_id",
    "app_id",
    "input",
    "output",
    "record_json",
    "tags",
    "ts",
    "cost_json",
    "perf_json",
];

const FEEDBACKS_COLUMNS: &[&str] = &[
    "feedback_result_id",
    "record_id",
    "feedback_definition_id",
    "last_ts",
    "status",
    "error",
    "calls_json",
    "result",
    "name",
    "cost_json",
];

pub(crate) struct Migration {
    pub(crate) version: i64,
    pub(crate) description: &'static str,
    pub(crate) apply: fn(&Connection) -> Result<()>,
}

/// Forward migrations in ascending version order. Each runs at most once per
/// database; the highest applied version is kept under `schema_version`.
pub(crate) const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "baseline records/feedbacks/feedback_defs/apps layout",
    apply: create_data_tables,
}];

pub(crate) fn current_schema_version() -> i64 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Creates any missing table and stamps version markers. Safe on every
/// startup: nothing is dropped or rewritten.
pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    let meta = read_meta(conn)?;

    conn.execute_batch(SCHEMA_META)
        .context("failed to create meta table")?;

    if meta.trulens_version.is_none() {
        tracing::info!(
            "stamping unversioned database with {META_TRULENS_VERSION} {}",
            env!("CARGO_PKG_VERSION")
        );
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_TRULENS_VERSION, env!("CARGO_PKG_VERSION")],
        )
        .context("failed to stamp trulens_version")?;
    }

    for (table_name, required) in [
        (TABLE_RECORDS, RECORDS_COLUMNS),
        (TABLE_FEEDBACKS, FEEDBACKS_COLUMNS),
    ] {
        if table_exists(conn, table_name)? {
            ensure_table_has_columns(conn, table_name, required)?;
        }
    }

    create_data_tables(conn)?;
    apply_pending_migrations(conn, &meta)
}

fn apply_pending_migrations(conn: &Connection, meta: &DbMeta) -> Result<()> {
    let applied = match meta.attributes.get(META_SCHEMA_VERSION) {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("invalid {META_SCHEMA_VERSION} in meta: {raw}"))?,
        None => 0,
    };
    let supported = current_schema_version();
    if applied > supported {
        return Err(anyhow!(
            "database schema version {applied} is newer than supported version {supported}"
        ));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(
            "applying schema migration {}: {}",
            migration.version,
            migration.description
        );
        (migration.apply)(conn).with_context(|| {
            format!("failed to apply schema migration {}", migration.version)
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_SCHEMA_VERSION, migration.version.to_string()],
        )
        .context("failed to record schema migration")?;
    }

    Ok(())
}

fn create_data_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_DATA_V1)
        .context("failed to apply data schema")
}

pub(crate) fn drop_data_tables(conn: &Connection) -> Result<()> {
    for table in DATA_TABLES {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))
            .with_context(|| format!("failed to drop table {table}"))?;
    }
    Ok(())
}

/// Reads the meta table. A database without one (fresh or pre-versioned)
/// yields empty metadata rather than an error.
pub(crate) fn read_meta(conn: &Connection) -> Result<DbMeta> {
    if !table_exists(conn, TABLE_META)? {
        return Ok(DbMeta::default());
    }

    let mut stmt = conn.prepare("SELECT key, value FROM meta")?;
    let mut rows = stmt.query([])?;
    let mut attributes = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let value: Option<String> = row.get(1)?;
        attributes.insert(key, value.unwrap_or_default());
    }

    Ok(DbMeta {
        trulens_version: attributes.get(META_TRULENS_VERSION).cloned(),
        attributes,
    })
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

pub(crate) fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, required: &[&str]) -> Result<()> {
    let columns = table_columns(conn, table_name)?;
    let missing = required
        .iter()
        .filter(|column| !columns.iter().any(|existing| existing.as_str() == **column))
        .copied()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "table {table_name} is missing columns: {}",
            missing.join(", ")
        ))
    }
}
