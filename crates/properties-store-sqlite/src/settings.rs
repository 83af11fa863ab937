use std::path::Path;

use anyhow::{anyhow, Context, Result};
use properties_core::{Bundle, BundleId, BundleValue, SettingDefinition};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::{
    integrity_check, migrate, open_connection, optional_rfc3339, parse_optional_rfc3339,
    parse_rfc3339, placeholders, rfc3339, schema_status, IntegrityReport, SchemaStatus,
};

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS bundles (
  id INTEGER PRIMARY KEY CHECK (id > 0),
  parent_id INTEGER NOT NULL DEFAULT 0 CHECK (parent_id >= 0),
  name TEXT NOT NULL UNIQUE,
  tag TEXT
);

CREATE TABLE IF NOT EXISTS settings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS settings_values (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  setting_id INTEGER NOT NULL,
  value TEXT NOT NULL,
  FOREIGN KEY (setting_id) REFERENCES settings(id)
);

CREATE TABLE IF NOT EXISTS bundles_values (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  bundle_id INTEGER NOT NULL,
  value_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  expired_at TEXT,
  FOREIGN KEY (bundle_id) REFERENCES bundles(id),
  FOREIGN KEY (value_id) REFERENCES settings_values(id)
);

CREATE INDEX IF NOT EXISTS idx_bundles_tag ON bundles(tag);
CREATE INDEX IF NOT EXISTS idx_bundles_values_bundle ON bundles_values(bundle_id);
";

const MIGRATIONS: &[&str] = &[MIGRATION_001_SQL];

const BUNDLE_COLUMNS: &str = "id, parent_id, name, tag";

/// Bundle catalog and setting values ("settings" database).
///
/// `bundles.parent_id` is deliberately not a foreign key: a parent missing from
/// the catalog is a legal, dangling reference.
pub struct SqliteSettingStore {
    conn: Connection,
}

impl SqliteSettingStore {
    /// Open the settings database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema_status(&self.conn, MIGRATIONS)
    }

    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        migrate(&mut self.conn, MIGRATIONS)
    }

    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        integrity_check(&self.conn, MIGRATIONS)
    }

    /// Add one bundle to the catalog.
    ///
    /// # Errors
    /// Returns an error when validation fails or the id/name is already taken.
    pub fn insert_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        bundle.validate().map_err(|err| anyhow!(err))?;

        self.conn
            .execute(
                "INSERT INTO bundles(id, parent_id, name, tag) VALUES (?1, ?2, ?3, ?4)",
                params![bundle.id.0, bundle.parent_id.0, bundle.name, bundle.tag],
            )
            .with_context(|| format!("failed to insert bundle {}", bundle.name))?;
        Ok(())
    }

    /// Define a new setting name.
    ///
    /// # Errors
    /// Returns an error when the name is blank or already defined.
    pub fn insert_setting(&mut self, name: &str) -> Result<SettingDefinition> {
        let mut definition = SettingDefinition { id: 0, name: name.to_string() };
        definition.validate().map_err(|err| anyhow!(err))?;

        self.conn
            .execute("INSERT INTO settings(name) VALUES (?1)", params![definition.name])
            .with_context(|| format!("failed to insert setting {name}"))?;
        definition.id = self.conn.last_insert_rowid();
        Ok(definition)
    }

    /// Bind a value of an existing setting to an existing bundle for the
    /// value's window.
    ///
    /// # Errors
    /// Returns an error when validation fails, the setting is unknown, or the
    /// bundle does not exist.
    pub fn insert_bundle_value(&mut self, value: &BundleValue) -> Result<()> {
        value.validate().map_err(|err| anyhow!(err))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;

        let setting_id: i64 = tx
            .query_row("SELECT id FROM settings WHERE name = ?1", params![value.name], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to look up setting")?
            .ok_or_else(|| anyhow!("unknown setting: {}", value.name))?;

        tx.execute(
            "INSERT INTO settings_values(setting_id, value) VALUES (?1, ?2)",
            params![setting_id, value.value],
        )
        .context("failed to insert setting value")?;
        let value_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO bundles_values(bundle_id, value_id, created_at, expired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                value.bundle_id.0,
                value_id,
                rfc3339(value.created_at)?,
                optional_rfc3339(value.expired_at)?,
            ],
        )
        .with_context(|| format!("failed to bind value to bundle {}", value.bundle_id))?;

        tx.commit().context("failed to commit bundle value")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn bundles_list(&self) -> Result<Vec<Bundle>> {
        self.query_bundles(&format!("SELECT {BUNDLE_COLUMNS} FROM bundles ORDER BY id"), [])
    }

    /// Bundles with any of `ids`; unknown ids are skipped.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn bundles_by_id(&self, ids: &[BundleId]) -> Result<Vec<Bundle>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        self.query_bundles(&sql, params_from_iter(ids.iter().map(|id| id.0)))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn bundles_by_tag(&self, tag: &str) -> Result<Vec<Bundle>> {
        self.query_bundles(
            &format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE tag = ?1 ORDER BY id"),
            params![tag],
        )
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn bundles_by_name(&self, names: &[String]) -> Result<Vec<Bundle>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE name IN ({}) ORDER BY id",
            placeholders(names.len())
        );
        self.query_bundles(&sql, params_from_iter(names.iter()))
    }

    /// Distinct non-empty tags in lexical order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn tags_list(&self) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT DISTINCT tag FROM bundles WHERE tag IS NOT NULL AND tag <> '' ORDER BY tag",
        )
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn settings_list(&self) -> Result<Vec<String>> {
        self.query_strings("SELECT name FROM settings ORDER BY id")
    }

    /// Every value row bound to one of `bundle_ids`, whatever its window.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or timestamps cannot be parsed.
    pub fn values_for(&self, bundle_ids: &[BundleId]) -> Result<Vec<BundleValue>> {
        if bundle_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT bv.bundle_id, s.name, v.value, bv.created_at, bv.expired_at
             FROM bundles_values bv
             JOIN settings_values v ON v.id = bv.value_id
             JOIN settings s ON s.id = v.setting_id
             WHERE bv.bundle_id IN ({})
             ORDER BY bv.id",
            placeholders(bundle_ids.len())
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bundle_ids.iter().map(|id| id.0)))?;
        let mut values = Vec::new();

        while let Some(row) = rows.next()? {
            let created_at: String = row.get(3)?;
            let expired_at: Option<String> = row.get(4)?;
            values.push(BundleValue {
                bundle_id: BundleId(row.get(0)?),
                name: row.get(1)?,
                value: row.get(2)?,
                created_at: parse_rfc3339(&created_at)?,
                expired_at: parse_optional_rfc3339(expired_at.as_deref())?,
            });
        }

        Ok(values)
    }

    fn query_bundles<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Bundle>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare bundle query")?;
        let rows = stmt.query_map(params, read_bundle)?;

        let mut bundles = Vec::new();
        for row in rows {
            bundles.push(row.context("failed to read bundle row")?);
        }
        Ok(bundles)
    }

    fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }
}

fn read_bundle(row: &Row<'_>) -> rusqlite::Result<Bundle> {
    Ok(Bundle {
        id: BundleId(row.get(0)?),
        parent_id: BundleId(row.get(1)?),
        name: row.get(2)?,
        tag: row.get(3)?,
    })
}
