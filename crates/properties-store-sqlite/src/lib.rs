use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod settings;
mod users;

pub use settings::SqliteSettingStore;
pub use users::SqliteUserStore;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn latest_version(migrations: &[&str]) -> Result<i64> {
    i64::try_from(migrations.len()).context("migration count exceeds i64")
}

fn schema_status(conn: &Connection, migrations: &[&str]) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let target_version = latest_version(migrations)?;
    let pending_versions = if current_version < target_version {
        ((current_version + 1)..=target_version).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version, pending_versions })
}

/// Apply pending migrations; entry `n` of `migrations` brings the schema to version `n + 1`.
fn migrate(conn: &mut Connection, migrations: &[&str]) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let target_version = latest_version(migrations)?;
    let current_version = current_schema_version(conn)?;
    if current_version > target_version {
        return Err(anyhow!(
            "unsupported schema version {current_version}; expected at most {target_version}"
        ));
    }

    for (version, sql) in (1_i64..).zip(migrations.iter()) {
        if version <= current_version {
            continue;
        }

        // Immediate: concurrent openers of a fresh database queue on the write lock.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        if current_schema_version(&tx)? >= version {
            continue;
        }
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    }

    Ok(())
}

fn integrity_check(conn: &Connection, migrations: &[&str]) -> Result<IntegrityReport> {
    let quick_check_message: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
        .context("failed to run PRAGMA quick_check")?;

    let mut stmt =
        conn.prepare("PRAGMA foreign_key_check").context("failed to prepare PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut foreign_key_violations = Vec::new();
    for row in rows {
        foreign_key_violations.push(row?);
    }

    let schema_status = schema_status(conn, migrations)?;
    Ok(IntegrityReport {
        quick_check_ok: quick_check_message == "ok",
        quick_check_message,
        foreign_key_violations,
        schema_status,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Numbered placeholders `?1, ?2, ...` for an `IN (...)` list.
fn placeholders(count: usize) -> String {
    (1..=count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn optional_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(rfc3339).transpose()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Nanoseconds since the Unix epoch, the sortable form of a timestamp.
fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn optional_unix_nanos(value: Option<OffsetDateTime>) -> Result<Option<i64>> {
    value.map(unix_nanos).transpose()
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}
