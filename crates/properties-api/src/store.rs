use anyhow::Result;
use properties_core::{
    AssignmentVersion, Bundle, BundleId, BundleValue, SettingDefinition, UserAssignment, UserId,
};
use properties_store_sqlite::{SqliteSettingStore, SqliteUserStore};
use time::OffsetDateTime;

/// Bundle catalog and setting values as seen by the [`crate::Handler`].
///
/// Lookups by unknown ids, names or tags yield empty results, never errors.
pub trait SettingStore {
    /// # Errors
    /// Returns an error when the backing store fails.
    fn bundles_by_id(&self, ids: &[BundleId]) -> Result<Vec<Bundle>>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn bundles_by_tag(&self, tag: &str) -> Result<Vec<Bundle>>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn bundles_by_name(&self, names: &[String]) -> Result<Vec<Bundle>>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn bundles_list(&self) -> Result<Vec<Bundle>>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn tags_list(&self) -> Result<Vec<String>>;

    /// # Errors
    /// Returns an error when the backing store fails.
    fn settings_list(&self) -> Result<Vec<String>>;

    /// All value rows bound to `bundle_ids`, regardless of their windows.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn values_for(&self, bundle_ids: &[BundleId]) -> Result<Vec<BundleValue>>;

    /// # Errors
    /// Returns an error when validation or the backing store fails.
    fn insert_bundle(&mut self, bundle: &Bundle) -> Result<()>;

    /// # Errors
    /// Returns an error when validation or the backing store fails.
    fn insert_setting(&mut self, name: &str) -> Result<SettingDefinition>;

    /// # Errors
    /// Returns an error when validation or the backing store fails.
    fn insert_bundle_value(&mut self, value: &BundleValue) -> Result<()>;
}

/// Append-only per-user assignment versions.
pub trait UserStore {
    /// The version in effect at `at`; `None` when nothing is active.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn get(&self, user_id: UserId, at: OffsetDateTime) -> Result<Option<AssignmentVersion>>;

    /// Append a new version stamped with the current time.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    fn set(&mut self, user_id: UserId, assignment: &UserAssignment) -> Result<AssignmentVersion>;
}

impl SettingStore for SqliteSettingStore {
    fn bundles_by_id(&self, ids: &[BundleId]) -> Result<Vec<Bundle>> {
        SqliteSettingStore::bundles_by_id(self, ids)
    }

    fn bundles_by_tag(&self, tag: &str) -> Result<Vec<Bundle>> {
        SqliteSettingStore::bundles_by_tag(self, tag)
    }

    fn bundles_by_name(&self, names: &[String]) -> Result<Vec<Bundle>> {
        SqliteSettingStore::bundles_by_name(self, names)
    }

    fn bundles_list(&self) -> Result<Vec<Bundle>> {
        SqliteSettingStore::bundles_list(self)
    }

    fn tags_list(&self) -> Result<Vec<String>> {
        SqliteSettingStore::tags_list(self)
    }

    fn settings_list(&self) -> Result<Vec<String>> {
        SqliteSettingStore::settings_list(self)
    }

    fn values_for(&self, bundle_ids: &[BundleId]) -> Result<Vec<BundleValue>> {
        SqliteSettingStore::values_for(self, bundle_ids)
    }

    fn insert_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        SqliteSettingStore::insert_bundle(self, bundle)
    }

    fn insert_setting(&mut self, name: &str) -> Result<SettingDefinition> {
        SqliteSettingStore::insert_setting(self, name)
    }

    fn insert_bundle_value(&mut self, value: &BundleValue) -> Result<()> {
        SqliteSettingStore::insert_bundle_value(self, value)
    }
}

impl UserStore for SqliteUserStore {
    fn get(&self, user_id: UserId, at: OffsetDateTime) -> Result<Option<AssignmentVersion>> {
        SqliteUserStore::get(self, user_id, at)
    }

    fn set(&mut self, user_id: UserId, assignment: &UserAssignment) -> Result<AssignmentVersion> {
        SqliteUserStore::set(self, user_id, assignment)
    }
}
