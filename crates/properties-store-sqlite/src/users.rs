use std::path::Path;

use anyhow::{anyhow, Context, Result};
use properties_core::{AssignmentId, AssignmentVersion, BundleId, UserAssignment, UserId};
use rusqlite::{params, Connection, Row};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    integrity_check, migrate, open_connection, optional_rfc3339, optional_unix_nanos,
    parse_optional_rfc3339, parse_rfc3339, rfc3339, schema_status, unix_nanos, IntegrityReport,
    SchemaStatus,
};

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS user_assignments (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  assignment_id TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL CHECK (user_id <> 0),
  bundle_ids_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_at_ns INTEGER NOT NULL,
  expires_at TEXT,
  expires_at_ns INTEGER,
  CHECK ((expires_at IS NULL) = (expires_at_ns IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_user_assignments_window
  ON user_assignments(user_id, created_at_ns, seq);
";

const VERSION_COLUMNS: &str = "assignment_id, bundle_ids_json, created_at, expires_at";

const MIGRATIONS: &[&str] = &[MIGRATION_001_SQL];

/// Append-only store of per-user assignment versions ("users" database).
pub struct SqliteUserStore {
    conn: Connection,
}

impl SqliteUserStore {
    /// Open the users database and configure required runtime pragmas.
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

    /// Append a new version for `user_id` created at `created_at`.
    ///
    /// # Errors
    /// Returns an error for the zero user id or when the row cannot be written.
    pub fn append(
        &mut self,
        user_id: UserId,
        assignment: &UserAssignment,
        created_at: OffsetDateTime,
    ) -> Result<AssignmentVersion> {
        user_id.validate().map_err(|err| anyhow!(err))?;

        let version = AssignmentVersion {
            assignment_id: AssignmentId::new(),
            user_id,
            bundle_ids: assignment.bundle_ids.clone(),
            created_at,
            expires_at: assignment.expires_at,
        };

        let bundle_ids_json = serde_json::to_string(&version.bundle_ids)
            .context("failed to encode assignment bundle ids")?;

        self.conn
            .execute(
                "INSERT INTO user_assignments(
                   assignment_id, user_id, bundle_ids_json,
                   created_at, created_at_ns, expires_at, expires_at_ns
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    version.assignment_id.to_string(),
                    user_id.0,
                    bundle_ids_json,
                    rfc3339(version.created_at)?,
                    unix_nanos(version.created_at)?,
                    optional_rfc3339(version.expires_at)?,
                    optional_unix_nanos(version.expires_at)?,
                ],
            )
            .with_context(|| format!("failed to append assignment for user {user_id}"))?;

        Ok(version)
    }

    /// Append a version stamped with the current time.
    ///
    /// # Errors
    /// Returns an error for the zero user id or when the row cannot be written.
    pub fn set(&mut self, user_id: UserId, assignment: &UserAssignment) -> Result<AssignmentVersion> {
        self.append(user_id, assignment, OffsetDateTime::now_utc())
    }

    /// Every stored version of `user_id` in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn versions(&self, user_id: UserId) -> Result<Vec<AssignmentVersion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM user_assignments WHERE user_id = ?1 ORDER BY seq"
        ))?;

        let mut rows = stmt.query(params![user_id.0])?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next()? {
            versions.push(decode_version(user_id, row)?);
        }

        Ok(versions)
    }

    /// The version of `user_id` in effect at `at`, if any.
    ///
    /// The window `[created_at, expires_at)` is applied in SQL; among covering
    /// versions the latest `created_at` wins and ties go to the later insert.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get(&self, user_id: UserId, at: OffsetDateTime) -> Result<Option<AssignmentVersion>> {
        let at = unix_nanos(at)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {VERSION_COLUMNS}
             FROM user_assignments
             WHERE user_id = ?1
               AND created_at_ns <= ?2
               AND (expires_at_ns IS NULL OR expires_at_ns > ?2)
             ORDER BY created_at_ns DESC, seq DESC
             LIMIT 1"
        ))?;

        let mut rows = stmt.query(params![user_id.0, at])?;
        let version = match rows.next()? {
            Some(row) => Some(decode_version(user_id, row)?),
            None => None,
        };
        Ok(version)
    }
}

fn decode_version(user_id: UserId, row: &Row<'_>) -> Result<AssignmentVersion> {
    let assignment_id: String = row.get(0)?;
    let bundle_ids_json: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let expires_at: Option<String> = row.get(3)?;

    let assignment_id = Ulid::from_string(&assignment_id)
        .with_context(|| format!("invalid assignment_id ULID: {assignment_id}"))?;
    let bundle_ids = serde_json::from_str::<Vec<BundleId>>(&bundle_ids_json)
        .with_context(|| format!("invalid bundle_ids_json for assignment {assignment_id}"))?;

    Ok(AssignmentVersion {
        assignment_id: AssignmentId(assignment_id),
        user_id,
        bundle_ids,
        created_at: parse_rfc3339(&created_at)?,
        expires_at: parse_optional_rfc3339(expires_at.as_deref())?,
    })
}
