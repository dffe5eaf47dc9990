use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::OverlayId;
use crate::patch::Patch;
use crate::path::FieldPath;
use crate::value::MetaValue;

/// Owner of a user-scoped overlay. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Owner(String);

impl Owner {
    pub fn new(owner: impl Into<String>) -> Result<Self, CoreError> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(CoreError::InvalidOwner);
        }
        Ok(Self(owner))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Owner {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Owner::new(value)
    }
}

impl From<Owner> for String {
    fn from(owner: Owner) -> Self {
        owner.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum OverlayScope {
    Platform,
    User { owner: Owner },
}

impl OverlayScope {
    pub fn user(owner: impl Into<String>) -> Result<Self, CoreError> {
        Ok(Self::User {
            owner: Owner::new(owner)?,
        })
    }

    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Platform => ScopeKind::Platform,
            Self::User { .. } => ScopeKind::User,
        }
    }

    pub fn owner(&self) -> Option<&Owner> {
        match self {
            Self::Platform => None,
            Self::User { owner } => Some(owner),
        }
    }
}

impl fmt::Display for OverlayScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform => f.write_str("platform"),
            Self::User { owner } => write!(f, "user:{owner}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Platform,
    User,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "platform" => Ok(Self::Platform),
            "user" => Ok(Self::User),
            _ => Err(CoreError::Serialization(format!("unknown scope: {s}"))),
        }
    }
}

/// Identity of an overlay slot. At most one active overlay exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlayKey {
    pub base_type: String,
    pub base_name: String,
    pub scope: OverlayScope,
    pub tenant_id: Option<String>,
}

impl OverlayKey {
    pub fn new(base_type: impl Into<String>, base_name: impl Into<String>, scope: OverlayScope) -> Self {
        Self {
            base_type: base_type.into(),
            base_name: base_name.into(),
            scope,
            tenant_id: None,
        }
    }

    pub fn platform(base_type: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self::new(base_type, base_name, OverlayScope::Platform)
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// The platform-scope key for the same item and tenant.
    pub fn platform_key(&self) -> OverlayKey {
        OverlayKey {
            scope: OverlayScope::Platform,
            ..self.clone()
        }
    }
}

impl fmt::Display for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.base_type, self.base_name, self.scope)?;
        if let Some(tenant) = &self.tenant_id {
            write!(f, "#{tenant}")?;
        }
        Ok(())
    }
}

/// Audit record of one customized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: FieldPath,
    pub original_value: Option<MetaValue>,
    pub current_value: Option<MetaValue>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub id: OverlayId,
    pub key: OverlayKey,
    pub package_id: Option<String>,
    /// Vendor version the patch was authored (or last re-based) against.
    pub package_version: Option<String>,
    pub patch: Patch,
    pub changes: Vec<FieldChange>,
    pub active: bool,
    /// Stamped by the store; 0 until first saved.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

impl Overlay {
    pub fn new(key: OverlayKey, patch: Patch, actor: &str) -> Self {
        let now = Utc::now();
        Self {
            id: OverlayId::new(),
            key,
            package_id: None,
            package_version: None,
            patch,
            changes: Vec::new(),
            active: true,
            version: 0,
            created_at: now,
            updated_at: now,
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
        }
    }

    pub fn with_package(mut self, package_id: Option<String>, package_version: Option<String>) -> Self {
        self.package_id = package_id;
        self.package_version = package_version;
        self
    }

    pub fn check_invariants(&self) -> Result<(), CoreError> {
        if let Some(change) = self.changes.iter().find(|c| !self.patch.contains(&c.path)) {
            return Err(CoreError::InvalidOverlay(format!(
                "change recorded for {} which is not in the patch",
                change.path
            )));
        }
        Ok(())
    }

    /// Drop audit entries whose path is no longer patched.
    pub fn prune_changes(&mut self) {
        let patch = &self.patch;
        self.changes.retain(|c| patch.contains(&c.path));
    }
}
