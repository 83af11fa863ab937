use anyhow::Result;
use properties_core::{
    drop_bundles, merge_bundles, project_settings, AssignmentVersion, Bundle, BundleValue,
    Setting, SettingDefinition, UserAssignment, UserId,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::store::{SettingStore, UserStore};

/// Read-modify-write driver over a catalog and an assignment store.
///
/// The handler does not serialize concurrent writers; callers sharing a user
/// across threads must hold a per-user lock around each write (see
/// [`crate::PropertiesApi`]).
pub struct Handler<S, U> {
    settings: S,
    users: U,
}

impl<S: SettingStore, U: UserStore> Handler<S, U> {
    pub fn new(settings: S, users: U) -> Self {
        Self { settings, users }
    }

    /// Setting values in effect for `user_id` at `when`.
    ///
    /// # Errors
    /// Returns a validation error for the zero user id, or any store failure.
    pub fn get_settings(&self, user_id: UserId, when: OffsetDateTime) -> Result<Vec<Setting>> {
        user_id.validate()?;
        info!(%user_id, %when, "get-settings");

        let Some(version) = self.users.get(user_id, when)? else {
            return Ok(Vec::new());
        };
        let values = self.settings.values_for(&version.bundle_ids)?;
        Ok(project_settings(&version.bundle_ids, &values, when))
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_settings(&self) -> Result<Vec<String>> {
        self.settings.settings_list()
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_bundles(&self) -> Result<Vec<Bundle>> {
        self.settings.bundles_list()
    }

    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        self.settings.tags_list()
    }

    /// Merge every bundle carrying `tag` into the user's active set.
    ///
    /// # Errors
    /// Returns a validation error for the zero user id, or any store failure.
    pub fn set_tag(
        &mut self,
        user_id: UserId,
        tag: &str,
        expire: Option<OffsetDateTime>,
    ) -> Result<AssignmentVersion> {
        user_id.validate()?;
        info!(%user_id, tag, "set-tag");
        let incoming = self.settings.bundles_by_tag(tag)?;
        self.apply_merge(user_id, &incoming, expire)
    }

    /// Merge the named bundles into the user's active set.
    ///
    /// # Errors
    /// Returns a validation error for the zero user id, or any store failure.
    pub fn set_bundles(
        &mut self,
        user_id: UserId,
        names: &[String],
        expire: Option<OffsetDateTime>,
    ) -> Result<AssignmentVersion> {
        user_id.validate()?;
        info!(%user_id, ?names, "set-bundles");
        let incoming = self.settings.bundles_by_name(names)?;
        self.apply_merge(user_id, &incoming, expire)
    }

    /// Drop every bundle carrying `tag` from the user's active set.
    ///
    /// # Errors
    /// Returns a validation error for the zero user id, or any store failure.
    pub fn unset_tag(&mut self, user_id: UserId, tag: &str) -> Result<AssignmentVersion> {
        user_id.validate()?;
        info!(%user_id, tag, "unset-tag");
        let outgoing = self.settings.bundles_by_tag(tag)?;
        self.apply_drop(user_id, &outgoing)
    }

    /// Drop the named bundles from the user's active set.
    ///
    /// # Errors
    /// Returns a validation error for the zero user id, or any store failure.
    pub fn unset_bundles(&mut self, user_id: UserId, names: &[String]) -> Result<AssignmentVersion> {
        user_id.validate()?;
        info!(%user_id, ?names, "unset-bundles");
        let outgoing = self.settings.bundles_by_name(names)?;
        self.apply_drop(user_id, &outgoing)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        bundle.validate()?;
        info!(bundle_id = %bundle.id, name = %bundle.name, "add-bundle");
        self.settings.insert_bundle(bundle)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_setting(&mut self, name: &str) -> Result<SettingDefinition> {
        info!(name, "add-setting");
        self.settings.insert_setting(name)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_bundle_value(&mut self, value: &BundleValue) -> Result<()> {
        value.validate()?;
        info!(bundle_id = %value.bundle_id, name = %value.name, "add-bundle-value");
        self.settings.insert_bundle_value(value)
    }

    fn current(&self, user_id: UserId) -> Result<(Vec<Bundle>, Option<OffsetDateTime>)> {
        let Some(version) = self.users.get(user_id, OffsetDateTime::now_utc())? else {
            return Ok((Vec::new(), None));
        };
        let bundles = self.settings.bundles_by_id(&version.bundle_ids)?;
        Ok((bundles, version.expires_at))
    }

    fn apply_merge(
        &mut self,
        user_id: UserId,
        incoming: &[Bundle],
        expire: Option<OffsetDateTime>,
    ) -> Result<AssignmentVersion> {
        let (current, _) = self.current(user_id)?;
        let bundle_ids = merge_bundles(&current, incoming).into_iter().collect::<Vec<_>>();
        debug!(%user_id, ?bundle_ids, "merged active bundles");

        self.users.set(user_id, &UserAssignment { bundle_ids, expires_at: expire })
    }

    fn apply_drop(&mut self, user_id: UserId, outgoing: &[Bundle]) -> Result<AssignmentVersion> {
        let (current, expires_at) = self.current(user_id)?;
        let bundle_ids = drop_bundles(&current, outgoing);
        debug!(%user_id, ?bundle_ids, "dropped active bundles");

        self.users.set(user_id, &UserAssignment { bundle_ids, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use properties_core::{select_assignment, AssignmentId, BundleId, PropertiesError};
    use time::Duration;

    #[derive(Default)]
    struct MemorySettings {
        bundles: Vec<Bundle>,
        definitions: Vec<SettingDefinition>,
        values: Vec<BundleValue>,
    }

    impl SettingStore for MemorySettings {
        fn bundles_by_id(&self, ids: &[BundleId]) -> Result<Vec<Bundle>> {
            Ok(self.bundles.iter().filter(|bundle| ids.contains(&bundle.id)).cloned().collect())
        }

        fn bundles_by_tag(&self, tag: &str) -> Result<Vec<Bundle>> {
            Ok(self
                .bundles
                .iter()
                .filter(|bundle| bundle.tag.as_deref() == Some(tag))
                .cloned()
                .collect())
        }

        fn bundles_by_name(&self, names: &[String]) -> Result<Vec<Bundle>> {
            Ok(self.bundles.iter().filter(|bundle| names.contains(&bundle.name)).cloned().collect())
        }

        fn bundles_list(&self) -> Result<Vec<Bundle>> {
            Ok(self.bundles.clone())
        }

        fn tags_list(&self) -> Result<Vec<String>> {
            let mut tags = self.bundles.iter().filter_map(|bundle| bundle.tag.clone()).collect::<Vec<_>>();
            tags.sort();
            tags.dedup();
            Ok(tags)
        }

        fn settings_list(&self) -> Result<Vec<String>> {
            Ok(self.definitions.iter().map(|definition| definition.name.clone()).collect())
        }

        fn values_for(&self, bundle_ids: &[BundleId]) -> Result<Vec<BundleValue>> {
            Ok(self
                .values
                .iter()
                .filter(|value| bundle_ids.contains(&value.bundle_id))
                .cloned()
                .collect())
        }

        fn insert_bundle(&mut self, bundle: &Bundle) -> Result<()> {
            self.bundles.push(bundle.clone());
            Ok(())
        }

        fn insert_setting(&mut self, name: &str) -> Result<SettingDefinition> {
            let id = i64::try_from(self.definitions.len())? + 1;
            let definition = SettingDefinition { id, name: name.to_string() };
            self.definitions.push(definition.clone());
            Ok(definition)
        }

        fn insert_bundle_value(&mut self, value: &BundleValue) -> Result<()> {
            self.values.push(value.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryUsers {
        versions: Vec<AssignmentVersion>,
    }

    impl UserStore for MemoryUsers {
        fn get(&self, user_id: UserId, at: OffsetDateTime) -> Result<Option<AssignmentVersion>> {
            let versions = self
                .versions
                .iter()
                .filter(|version| version.user_id == user_id)
                .cloned()
                .collect::<Vec<_>>();
            Ok(select_assignment(&versions, at).cloned())
        }

        fn set(&mut self, user_id: UserId, assignment: &UserAssignment) -> Result<AssignmentVersion> {
            let version = AssignmentVersion {
                assignment_id: AssignmentId::new(),
                user_id,
                bundle_ids: assignment.bundle_ids.clone(),
                created_at: OffsetDateTime::now_utc(),
                expires_at: assignment.expires_at,
            };
            self.versions.push(version.clone());
            Ok(version)
        }
    }

    fn bundle(id: i64, parent_id: i64, name: &str, tag: &str) -> Bundle {
        Bundle {
            id: BundleId(id),
            parent_id: BundleId(parent_id),
            name: name.to_string(),
            tag: Some(tag.to_string()),
        }
    }

    fn ids(values: &[i64]) -> Vec<BundleId> {
        values.iter().copied().map(BundleId).collect()
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    fn handler() -> Handler<MemorySettings, MemoryUsers> {
        let settings = MemorySettings {
            bundles: vec![
                bundle(1, 0, "base", "tier"),
                bundle(2, 1, "base-plus", "premium"),
                bundle(3, 0, "beta", "experiments"),
                bundle(4, 3, "beta-dark", "experiments"),
            ],
            ..MemorySettings::default()
        };
        Handler::new(settings, MemoryUsers::default())
    }

    #[test]
    fn set_tag_merges_into_empty_assignment() -> Result<()> {
        let mut handler = handler();
        let version = handler.set_tag(UserId(1), "tier", None)?;
        assert_eq!(version.bundle_ids, ids(&[1]));
        assert_eq!(version.user_id, UserId(1));
        Ok(())
    }

    #[test]
    fn child_replaces_parent_and_unset_falls_back() -> Result<()> {
        let mut handler = handler();
        handler.set_bundles(UserId(1), &names(&["base"]), None)?;

        let upgraded = handler.set_bundles(UserId(1), &names(&["base-plus"]), None)?;
        assert_eq!(upgraded.bundle_ids, ids(&[2]));

        let downgraded = handler.unset_bundles(UserId(1), &names(&["base-plus"]))?;
        assert_eq!(downgraded.bundle_ids, ids(&[1]));

        let cleared = handler.unset_tag(UserId(1), "tier")?;
        assert_eq!(cleared.bundle_ids, ids(&[0]));
        Ok(())
    }

    #[test]
    fn parent_selection_replaces_existing_child() -> Result<()> {
        let mut handler = handler();
        handler.set_bundles(UserId(1), &names(&["beta-dark", "base"]), None)?;

        let version = handler.set_bundles(UserId(1), &names(&["beta"]), None)?;
        assert_eq!(version.bundle_ids, ids(&[1, 3]));
        Ok(())
    }

    #[test]
    fn tag_selecting_parent_and_child_keeps_both() -> Result<()> {
        let mut handler = handler();
        let version = handler.set_tag(UserId(1), "experiments", None)?;
        assert_eq!(version.bundle_ids, ids(&[3, 4]));
        Ok(())
    }

    #[test]
    fn later_merge_collapses_child_of_kept_parent() -> Result<()> {
        let mut handler = handler();
        handler.set_tag(UserId(1), "experiments", None)?;

        let version = handler.set_tag(UserId(1), "tier", None)?;
        assert_eq!(version.bundle_ids, ids(&[1, 3]));
        Ok(())
    }

    #[test]
    fn unknown_selection_keeps_current_set() -> Result<()> {
        let mut handler = handler();
        handler.set_tag(UserId(1), "tier", None)?;
        assert_eq!(handler.set_tag(UserId(1), "missing", None)?.bundle_ids, ids(&[1]));
        assert_eq!(handler.unset_bundles(UserId(1), &names(&["nope"]))?.bundle_ids, ids(&[1]));
        Ok(())
    }

    #[test]
    fn set_takes_request_expiry_and_unset_keeps_previous() -> Result<()> {
        let mut handler = handler();
        let expire = OffsetDateTime::now_utc() + Duration::days(7);

        let set = handler.set_tag(UserId(1), "tier", Some(expire))?;
        assert_eq!(set.expires_at, Some(expire));

        let unset = handler.unset_tag(UserId(1), "tier")?;
        assert_eq!(unset.expires_at, Some(expire));

        let reset = handler.set_tag(UserId(1), "tier", None)?;
        assert_eq!(reset.expires_at, None);
        Ok(())
    }

    #[test]
    fn zero_user_is_a_validation_error() {
        let mut handler = handler();
        let Err(err) = handler.set_tag(UserId(0), "tier", None) else {
            panic!("zero user id must be rejected");
        };
        assert!(err.downcast_ref::<PropertiesError>().is_some());
        assert!(handler.get_settings(UserId(0), OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn get_settings_projects_active_bundles_at_time() -> Result<()> {
        let mut handler = handler();
        let start = OffsetDateTime::now_utc() - Duration::days(1);
        handler.add_setting("theme")?;
        handler.add_bundle_value(&BundleValue {
            bundle_id: BundleId(1),
            name: "theme".to_string(),
            value: "light".to_string(),
            created_at: start,
            expired_at: None,
        })?;
        handler.add_bundle_value(&BundleValue {
            bundle_id: BundleId(3),
            name: "theme".to_string(),
            value: "beta".to_string(),
            created_at: start,
            expired_at: None,
        })?;

        assert!(handler.get_settings(UserId(1), OffsetDateTime::now_utc())?.is_empty());

        handler.set_tag(UserId(1), "tier", None)?;
        let settings = handler.get_settings(UserId(1), OffsetDateTime::now_utc())?;
        assert_eq!(settings, vec![Setting { name: "theme".to_string(), value: "light".to_string() }]);

        // Before any assignment version existed nothing applies.
        assert!(handler.get_settings(UserId(1), start)?.is_empty());
        Ok(())
    }

    #[test]
    fn catalog_writes_are_validated() {
        let mut handler = handler();
        assert!(handler.add_bundle(&bundle(0, 0, "zero", "tier")).is_err());
        assert!(handler
            .add_bundle_value(&BundleValue {
                bundle_id: BundleId(1),
                name: " ".to_string(),
                value: "x".to_string(),
                created_at: OffsetDateTime::now_utc(),
                expired_at: None,
            })
            .is_err());
    }

    #[test]
    fn listings_delegate_to_catalog() -> Result<()> {
        let mut handler = handler();
        handler.add_setting("theme")?;
        assert_eq!(handler.list_tags()?, names(&["experiments", "premium", "tier"]));
        assert_eq!(handler.list_bundles()?.len(), 4);
        assert_eq!(handler.list_settings()?, names(&["theme"]));
        Ok(())
    }
}
