use chrono::{DateTime, Utc};

use metalayer_core::{MetaValue, Overlay, OverlayKey, ScopeKind};

use crate::error::StorageError;

/// Provenance of an installed system definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionInfo {
    pub base_type: String,
    pub base_name: String,
    pub package_id: Option<String>,
    pub package_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One overlay write inside an [`UpgradeCommit`].
#[derive(Debug, Clone)]
pub struct OverlayWrite {
    pub overlay: Overlay,
    pub expected_version: Option<u64>,
}

/// A new package version of one definition together with every overlay
/// re-based onto it. Applied in a single transaction.
#[derive(Debug, Clone)]
pub struct UpgradeCommit {
    pub base_type: String,
    pub base_name: String,
    pub package_id: Option<String>,
    pub package_version: Option<String>,
    pub document: MetaValue,
    pub overlays: Vec<OverlayWrite>,
}

pub trait OverlayStore {
    /// The active overlay for `key`, if any.
    fn get_overlay(&self, key: &OverlayKey) -> Result<Option<Overlay>, StorageError>;

    /// Create (`expected_version = None`) or update an overlay. Returns the
    /// stored record with its new version.
    fn save_overlay(
        &mut self,
        overlay: &Overlay,
        expected_version: Option<u64>,
    ) -> Result<Overlay, StorageError>;

    /// Soft delete. `None` when no active overlay exists for `key`.
    fn remove_overlay(
        &mut self,
        key: &OverlayKey,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Overlay>, StorageError>;

    fn list_overlays(&self, base_type: &str, scope: ScopeKind) -> Result<Vec<Overlay>, StorageError>;

    /// Active overlays of every scope for one item within a tenant.
    fn overlays_for(
        &self,
        base_type: &str,
        base_name: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Overlay>, StorageError>;

    /// Every record ever stored for `key`, oldest first.
    fn overlay_history(&self, key: &OverlayKey) -> Result<Vec<Overlay>, StorageError>;
}

pub trait DefinitionStore {
    fn get_definition(&self, base_type: &str, base_name: &str) -> Result<Option<MetaValue>, StorageError>;

    fn put_definition(
        &mut self,
        base_type: &str,
        base_name: &str,
        package_id: Option<&str>,
        package_version: Option<&str>,
        document: &MetaValue,
    ) -> Result<(), StorageError>;

    fn definition_info(
        &self,
        base_type: &str,
        base_name: &str,
    ) -> Result<Option<DefinitionInfo>, StorageError>;

    /// Install the new definition and all re-based overlays atomically.
    fn commit_upgrade(&mut self, commit: &UpgradeCommit) -> Result<Vec<Overlay>, StorageError>;
}
