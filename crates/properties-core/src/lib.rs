use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PropertiesError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Identity of one bundle in the catalog. `0` is the "no bundle" sentinel used
/// for root parents and for bundles dropped without a parent.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct BundleId(pub i64);

impl BundleId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Display for BundleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// # Errors
    /// Returns [`PropertiesError::Validation`] for the zero id.
    pub fn validate(self) -> Result<(), PropertiesError> {
        if self.0 == 0 {
            return Err(PropertiesError::Validation("user_id MUST be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AssignmentId(pub Ulid);

impl AssignmentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AssignmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AssignmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Bundle {
    pub id: BundleId,
    #[serde(default)]
    pub parent_id: BundleId,
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
}

impl Bundle {
    #[must_use]
    pub fn parent(&self) -> Option<BundleId> {
        if self.parent_id.is_none() {
            None
        } else {
            Some(self.parent_id)
        }
    }

    /// Validate a catalog entry before it is written.
    ///
    /// # Errors
    /// Returns [`PropertiesError::Validation`] when the id is not positive, the
    /// parent is negative or self-referencing, or name/tag are blank.
    pub fn validate(&self) -> Result<(), PropertiesError> {
        if self.id.0 <= 0 {
            return Err(PropertiesError::Validation("bundle id MUST be positive".to_string()));
        }

        if self.parent_id.0 < 0 {
            return Err(PropertiesError::Validation(
                "bundle parent_id MUST be 0 or a positive id".to_string(),
            ));
        }

        if self.parent_id == self.id {
            return Err(PropertiesError::Validation(
                "bundle MUST NOT be its own parent".to_string(),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(PropertiesError::Validation("bundle name MUST be provided".to_string()));
        }

        if self.tag.as_ref().is_some_and(|tag| tag.trim().is_empty()) {
            return Err(PropertiesError::Validation(
                "bundle tag MUST be non-blank when provided".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SettingDefinition {
    pub id: i64,
    pub name: String,
}

impl SettingDefinition {
    /// # Errors
    /// Returns [`PropertiesError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<(), PropertiesError> {
        if self.name.trim().is_empty() {
            return Err(PropertiesError::Validation("setting name MUST be provided".to_string()));
        }
        Ok(())
    }
}

/// One setting value bound to a bundle for the window `[created_at, expired_at)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleValue {
    pub bundle_id: BundleId,
    pub name: String,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expired_at: Option<OffsetDateTime>,
}

impl BundleValue {
    #[must_use]
    pub fn in_scope(&self, at: OffsetDateTime) -> bool {
        window_contains(self.created_at, self.expired_at, at)
    }

    /// # Errors
    /// Returns [`PropertiesError::Validation`] when the setting name is blank or
    /// the window is empty.
    pub fn validate(&self) -> Result<(), PropertiesError> {
        if self.name.trim().is_empty() {
            return Err(PropertiesError::Validation("setting name MUST be provided".to_string()));
        }

        if self.expired_at.is_some_and(|expired_at| expired_at <= self.created_at) {
            return Err(PropertiesError::Validation(
                "expired_at MUST be after created_at".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserAssignment {
    pub bundle_ids: Vec<BundleId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// One append-only stored snapshot of a user's active bundles.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssignmentVersion {
    pub assignment_id: AssignmentId,
    pub user_id: UserId,
    pub bundle_ids: Vec<BundleId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl AssignmentVersion {
    #[must_use]
    pub fn covers(&self, at: OffsetDateTime) -> bool {
        window_contains(self.created_at, self.expires_at, at)
    }

    #[must_use]
    pub fn assignment(&self) -> UserAssignment {
        UserAssignment { bundle_ids: self.bundle_ids.clone(), expires_at: self.expires_at }
    }
}

fn window_contains(
    start: OffsetDateTime,
    end: Option<OffsetDateTime>,
    at: OffsetDateTime,
) -> bool {
    if at < start {
        return false;
    }
    match end {
        Some(end) => at < end,
        None => true,
    }
}

/// Add `incoming` bundles to the active set described by `current`.
///
/// Every incoming id is kept. A current bundle is omitted when an incoming
/// bundle is its child (the finer selection replaces it) or when its parent is
/// already in the result (the broader selection replaces it). The result grows
/// as current bundles are kept, so a parent listed before its child in
/// `current` also collapses that child. Only the immediate parent/child
/// relation is inspected.
#[must_use]
pub fn merge_bundles(current: &[Bundle], incoming: &[Bundle]) -> BTreeSet<BundleId> {
    let superseded_parents =
        incoming.iter().filter_map(Bundle::parent).collect::<BTreeSet<_>>();

    let mut merged = incoming.iter().map(|bundle| bundle.id).collect::<BTreeSet<_>>();
    for bundle in current {
        if superseded_parents.contains(&bundle.id) {
            continue;
        }

        if bundle.parent().is_some_and(|parent| merged.contains(&parent)) {
            continue;
        }

        merged.insert(bundle.id);
    }

    merged
}

/// Remove `to_remove` from `current`, falling back to each removed bundle's
/// parent.
///
/// The output is index-aligned with `current`: it has the same length and may
/// hold duplicates or [`BundleId::NONE`] for removed roots.
#[must_use]
pub fn drop_bundles(current: &[Bundle], to_remove: &[Bundle]) -> Vec<BundleId> {
    let removed = to_remove.iter().map(|bundle| bundle.id).collect::<BTreeSet<_>>();

    current
        .iter()
        .map(|bundle| if removed.contains(&bundle.id) { bundle.parent_id } else { bundle.id })
        .collect()
}

/// Resolve the setting values in effect at `at` for the `active` bundles.
///
/// Rows are returned in input order; several bundles may yield the same
/// setting name.
#[must_use]
pub fn project_settings(
    active: &[BundleId],
    values: &[BundleValue],
    at: OffsetDateTime,
) -> Vec<Setting> {
    let active = active.iter().copied().collect::<BTreeSet<_>>();

    values
        .iter()
        .filter(|row| active.contains(&row.bundle_id) && row.in_scope(at))
        .map(|row| Setting { name: row.name.clone(), value: row.value.clone() })
        .collect()
}

/// Pick the assignment version in effect at `at`: the latest-created version
/// whose own window covers `at`. On equal `created_at` the later entry wins.
#[must_use]
pub fn select_assignment(
    versions: &[AssignmentVersion],
    at: OffsetDateTime,
) -> Option<&AssignmentVersion> {
    versions
        .iter()
        .enumerate()
        .filter(|(_, version)| version.covers(at))
        .max_by_key(|(index, version)| (version.created_at, *index))
        .map(|(_, version)| version)
}
