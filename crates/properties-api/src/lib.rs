use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use properties_core::{
    AssignmentVersion, Bundle, BundleId, BundleValue, PropertiesError, Setting, SettingDefinition,
    UserId,
};
use properties_store_sqlite::{IntegrityReport, SchemaStatus, SqliteSettingStore, SqliteUserStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod handler;
mod store;

pub use handler::Handler;
pub use store::{SettingStore, UserStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseSchemaStatus {
    pub users: SchemaStatus,
    pub settings: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseMigrateResult {
    pub users: MigrateResult,
    pub settings: MigrateResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseIntegrityReport {
    pub users: IntegrityReport,
    pub settings: IntegrityReport,
}

impl DatabaseIntegrityReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        [&self.users, &self.settings]
            .iter()
            .all(|report| report.quick_check_ok && report.foreign_key_violations.is_empty())
    }
}

/// Assignment request shared by `set-tag`, `unset-tag`, `set-bundles` and
/// `unset-bundles`. Tag operations only look at the first item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignRequest {
    pub user_id: UserId,
    pub items: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expire: Option<OffsetDateTime>,
}

impl AssignRequest {
    /// # Errors
    /// Returns [`PropertiesError::Validation`] for the zero user id or an empty item list.
    pub fn validate(&self) -> Result<(), PropertiesError> {
        self.user_id.validate()?;
        if self.items.is_empty() {
            return Err(PropertiesError::Validation("items MUST contain at least one entry".to_string()));
        }
        Ok(())
    }

    /// Set paths only: an `expire` at or before `now` would append a version
    /// that is never in effect.
    ///
    /// # Errors
    /// Returns [`PropertiesError::Validation`] when `expire` is not after `now`.
    pub fn validate_expire(&self, now: OffsetDateTime) -> Result<(), PropertiesError> {
        match self.expire {
            Some(expire) if expire <= now => Err(PropertiesError::Validation(
                "expire MUST be in the future".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn first_item(&self) -> Result<&str, PropertiesError> {
        self.items
            .first()
            .map(String::as_str)
            .ok_or_else(|| PropertiesError::Validation("items MUST contain at least one entry".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddBundleRequest {
    pub id: BundleId,
    #[serde(default)]
    pub parent_id: BundleId,
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddSettingRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddBundleValueRequest {
    pub bundle_id: BundleId,
    pub name: String,
    pub value: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expired_at: Option<OffsetDateTime>,
}

type SqliteHandler = Handler<SqliteSettingStore, SqliteUserStore>;

/// SQLite-backed facade used by the HTTP service and the CLI.
///
/// Stores are opened and migrated per call. Writes for the same user are
/// serialized within the process; clones share the lock map.
#[derive(Debug, Clone)]
pub struct PropertiesApi {
    users_db: PathBuf,
    settings_db: PathBuf,
    user_locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl PropertiesApi {
    #[must_use]
    pub fn new(users_db: PathBuf, settings_db: PathBuf) -> Self {
        Self { users_db, settings_db, user_locks: Arc::new(DashMap::new()) }
    }

    fn open_handler(&self) -> Result<SqliteHandler> {
        let mut settings = SqliteSettingStore::open(&self.settings_db)?;
        settings.migrate()?;
        let mut users = SqliteUserStore::open(&self.users_db)?;
        users.migrate()?;
        Ok(Handler::new(settings, users))
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        let entry = self.user_locks.entry(user_id).or_default();
        Arc::clone(entry.value())
    }

    /// Run one read-modify-write for `user_id` while holding its lock.
    ///
    /// The lock entry is evicted once no other writer holds it, so the map
    /// only tracks users with writes in flight.
    fn with_user_lock<T>(
        &self,
        user_id: UserId,
        write: impl FnOnce(&mut SqliteHandler) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let lock = self.user_lock(user_id);
            let guard = lock.lock().map_err(|_| anyhow!("user lock poisoned for user {user_id}"));
            match guard {
                Ok(_guard) => self.open_handler().and_then(|mut handler| write(&mut handler)),
                Err(err) => Err(err),
            }
        };
        self.user_locks.remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Inspect schema status of both databases without mutating data.
    ///
    /// # Errors
    /// Returns an error when either `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<DatabaseSchemaStatus> {
        let users = SqliteUserStore::open(&self.users_db)?.schema_status()?;
        let settings = SqliteSettingStore::open(&self.settings_db)?.schema_status()?;
        Ok(DatabaseSchemaStatus { users, settings })
    }

    /// Apply pending migrations to both databases, or report planned versions
    /// in dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<DatabaseMigrateResult> {
        let mut users = SqliteUserStore::open(&self.users_db)?;
        let before = users.schema_status()?;
        let users = if dry_run {
            planned(before)
        } else {
            users.migrate()?;
            applied(before, &users.schema_status()?)
        };

        let mut settings = SqliteSettingStore::open(&self.settings_db)?;
        let before = settings.schema_status()?;
        let settings = if dry_run {
            planned(before)
        } else {
            settings.migrate()?;
            applied(before, &settings.schema_status()?)
        };

        Ok(DatabaseMigrateResult { users, settings })
    }

    /// Run `SQLite` integrity probes on both databases after migrating them.
    ///
    /// # Errors
    /// Returns an error when either database cannot be opened, migrated or probed.
    pub fn integrity_check(&self) -> Result<DatabaseIntegrityReport> {
        let mut users = SqliteUserStore::open(&self.users_db)?;
        users.migrate()?;
        let mut settings = SqliteSettingStore::open(&self.settings_db)?;
        settings.migrate()?;
        Ok(DatabaseIntegrityReport {
            users: users.integrity_check()?,
            settings: settings.integrity_check()?,
        })
    }

    /// Setting values in effect for `user_id` at `when` (default: now).
    ///
    /// # Errors
    /// Returns an error when validation or any store read fails.
    pub fn get_settings(&self, user_id: UserId, when: Option<OffsetDateTime>) -> Result<Vec<Setting>> {
        let when = when.unwrap_or_else(OffsetDateTime::now_utc);
        self.open_handler()?.get_settings(user_id, when)
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_settings(&self) -> Result<Vec<String>> {
        self.open_handler()?.list_settings()
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_bundles(&self) -> Result<Vec<Bundle>> {
        self.open_handler()?.list_bundles()
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        self.open_handler()?.list_tags()
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn set_tag(&self, request: &AssignRequest) -> Result<AssignmentVersion> {
        request.validate()?;
        request.validate_expire(OffsetDateTime::now_utc())?;
        let tag = request.first_item()?;
        self.with_user_lock(request.user_id, |handler| {
            handler.set_tag(request.user_id, tag, request.expire)
        })
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn unset_tag(&self, request: &AssignRequest) -> Result<AssignmentVersion> {
        request.validate()?;
        let tag = request.first_item()?;
        self.with_user_lock(request.user_id, |handler| handler.unset_tag(request.user_id, tag))
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn set_bundles(&self, request: &AssignRequest) -> Result<AssignmentVersion> {
        request.validate()?;
        request.validate_expire(OffsetDateTime::now_utc())?;
        self.with_user_lock(request.user_id, |handler| {
            handler.set_bundles(request.user_id, &request.items, request.expire)
        })
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn unset_bundles(&self, request: &AssignRequest) -> Result<AssignmentVersion> {
        request.validate()?;
        self.with_user_lock(request.user_id, |handler| {
            handler.unset_bundles(request.user_id, &request.items)
        })
    }

    /// Add one bundle to the catalog.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_bundle(&self, input: AddBundleRequest) -> Result<Bundle> {
        let bundle =
            Bundle { id: input.id, parent_id: input.parent_id, name: input.name, tag: input.tag };
        self.open_handler()?.add_bundle(&bundle)?;
        Ok(bundle)
    }

    /// Define one setting name.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_setting(&self, input: &AddSettingRequest) -> Result<SettingDefinition> {
        self.open_handler()?.add_setting(&input.name)
    }

    /// Bind a setting value to a bundle; `created_at` defaults to now.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_bundle_value(&self, input: AddBundleValueRequest) -> Result<BundleValue> {
        let value = BundleValue {
            bundle_id: input.bundle_id,
            name: input.name,
            value: input.value,
            created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
            expired_at: input.expired_at,
        };
        self.open_handler()?.add_bundle_value(&value)?;
        Ok(value)
    }
}

fn planned(before: SchemaStatus) -> MigrateResult {
    MigrateResult {
        dry_run: true,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: before.pending_versions,
        after_version: None,
        up_to_date: None,
    }
}

fn applied(before: SchemaStatus, after: &SchemaStatus) -> MigrateResult {
    MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: before.pending_versions,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use time::Duration;

    fn unique_temp_db_path(kind: &str) -> PathBuf {
        std::env::temp_dir().join(format!("properties-api-{kind}-{}.sqlite3", ulid::Ulid::new()))
    }

    fn temp_api() -> (PropertiesApi, Vec<PathBuf>) {
        let users_db = unique_temp_db_path("users");
        let settings_db = unique_temp_db_path("settings");
        let api = PropertiesApi::new(users_db.clone(), settings_db.clone());
        (api, vec![users_db, settings_db])
    }

    fn cleanup(paths: &[PathBuf]) {
        for path in paths {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
            }
        }
    }

    fn seed_catalog(api: &PropertiesApi) -> Result<()> {
        for (id, parent_id, name, tag) in [
            (1, 0, "base", "tier"),
            (2, 1, "base-plus", "premium"),
            (3, 0, "beta", "experiments"),
        ] {
            api.add_bundle(AddBundleRequest {
                id: BundleId(id),
                parent_id: BundleId(parent_id),
                name: name.to_string(),
                tag: Some(tag.to_string()),
            })?;
        }
        api.add_setting(&AddSettingRequest { name: "theme".to_string() })?;
        api.add_setting(&AddSettingRequest { name: "quota".to_string() })?;
        Ok(())
    }

    fn assign(user_id: i64, items: &[&str]) -> AssignRequest {
        AssignRequest {
            user_id: UserId(user_id),
            items: items.iter().map(|item| (*item).to_string()).collect(),
            expire: None,
        }
    }

    fn assign_with(request: &AssignRequest, item: &str) -> AssignRequest {
        AssignRequest { items: vec![item.to_string()], ..request.clone() }
    }

    #[test]
    fn migrate_dry_run_then_apply_covers_both_databases() -> Result<()> {
        let (api, paths) = temp_api();

        let planned = api.migrate(true)?;
        assert!(planned.users.dry_run);
        assert_eq!(planned.users.would_apply_versions, vec![1]);
        assert_eq!(planned.settings.would_apply_versions, vec![1]);

        let applied = api.migrate(false)?;
        assert_eq!(applied.users.up_to_date, Some(true));
        assert_eq!(applied.settings.after_version, Some(1));

        let status = api.schema_status()?;
        assert!(status.users.pending_versions.is_empty());
        assert!(status.settings.pending_versions.is_empty());
        assert!(api.integrity_check()?.is_ok());

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn assignment_flow_resolves_settings() -> Result<()> {
        let (api, paths) = temp_api();
        seed_catalog(&api)?;

        let since = OffsetDateTime::now_utc() - Duration::hours(1);
        for (bundle_id, name, value) in
            [(1, "theme", "light"), (2, "theme", "dark"), (2, "quota", "100")]
        {
            api.add_bundle_value(AddBundleValueRequest {
                bundle_id: BundleId(bundle_id),
                name: name.to_string(),
                value: value.to_string(),
                created_at: Some(since),
                expired_at: None,
            })?;
        }

        let version = api.set_tag(&assign(9, &["tier"]))?;
        assert_eq!(version.bundle_ids, vec![BundleId(1)]);
        assert_eq!(
            api.get_settings(UserId(9), None)?,
            vec![Setting { name: "theme".to_string(), value: "light".to_string() }]
        );

        let version = api.set_bundles(&assign(9, &["base-plus"]))?;
        assert_eq!(version.bundle_ids, vec![BundleId(2)]);
        let names = api
            .get_settings(UserId(9), None)?
            .into_iter()
            .map(|setting| format!("{}={}", setting.name, setting.value))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["theme=dark".to_string(), "quota=100".to_string()]);

        let version = api.unset_bundles(&assign(9, &["base-plus"]))?;
        assert_eq!(version.bundle_ids, vec![BundleId(1)]);

        let version = api.unset_tag(&assign(9, &["tier", "ignored"]))?;
        assert_eq!(version.bundle_ids, vec![BundleId::NONE]);
        assert!(api.get_settings(UserId(9), None)?.is_empty());

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn invalid_requests_are_validation_errors() -> Result<()> {
        let (api, paths) = temp_api();

        for request in [assign(0, &["tier"]), assign(5, &[])] {
            let Err(err) = api.set_tag(&request) else {
                panic!("request must be rejected: {request:?}");
            };
            assert!(err.downcast_ref::<PropertiesError>().is_some());
        }

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn set_rejects_expiry_that_already_passed() -> Result<()> {
        let (api, paths) = temp_api();
        seed_catalog(&api)?;

        let mut request = assign(5, &["tier"]);
        request.expire = Some(OffsetDateTime::now_utc() - Duration::minutes(1));
        for result in [api.set_tag(&request), api.set_bundles(&assign_with(&request, "base"))] {
            let Err(err) = result else {
                panic!("past expiry must be rejected");
            };
            assert!(err.downcast_ref::<PropertiesError>().is_some());
        }
        assert!(api.get_settings(UserId(5), None)?.is_empty());

        request.expire = Some(OffsetDateTime::now_utc() + Duration::days(1));
        assert_eq!(api.set_tag(&request)?.bundle_ids, vec![BundleId(1)]);

        // Unset keeps the stored expiry, so a stale `expire` field is ignored.
        request.expire = Some(OffsetDateTime::now_utc() - Duration::days(1));
        assert_eq!(api.unset_tag(&request)?.bundle_ids, vec![BundleId::NONE]);

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn user_lock_entries_are_released_after_writes() -> Result<()> {
        let (api, paths) = temp_api();
        seed_catalog(&api)?;

        for user_id in 1..=5 {
            api.set_tag(&assign(user_id, &["tier"]))?;
        }
        assert!(api.set_tag(&assign(0, &["tier"])).is_err());
        assert!(api.user_locks.is_empty());

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn catalog_listings_round_trip() -> Result<()> {
        let (api, paths) = temp_api();
        seed_catalog(&api)?;

        assert_eq!(api.list_tags()?, vec!["experiments", "premium", "tier"]);
        assert_eq!(api.list_settings()?, vec!["theme", "quota"]);
        assert_eq!(api.list_bundles()?.len(), 3);

        cleanup(&paths);
        Ok(())
    }

    #[test]
    fn concurrent_writes_for_one_user_are_serialized() -> Result<()> {
        let (api, paths) = temp_api();
        let bundle_count = 8_i64;
        for id in 1..=bundle_count {
            api.add_bundle(AddBundleRequest {
                id: BundleId(id),
                parent_id: BundleId::NONE,
                name: format!("bundle-{id}"),
                tag: None,
            })?;
        }

        let mut handles = Vec::new();
        for id in 1..=bundle_count {
            let api = api.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let name = format!("bundle-{id}");
                api.set_bundles(&assign(77, &[name.as_str()]))?;
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            thread_result?;
        }

        // Every merge saw the previous one: no update was lost.
        let final_ids = SqliteUserStore::open(&paths[0])?
            .get(UserId(77), OffsetDateTime::now_utc())?
            .map(|version| version.bundle_ids)
            .unwrap_or_default();
        assert_eq!(final_ids, (1..=bundle_count).map(BundleId).collect::<Vec<_>>());
        assert!(api.user_locks.is_empty());

        cleanup(&paths);
        Ok(())
    }
}
