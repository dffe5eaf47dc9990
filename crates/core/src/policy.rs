//! Per-type customization policy and its enforcement.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;
use crate::patch::{Patch, flatten, is_noop_entry};
use crate::path::{FieldPath, PatternSet};
use crate::value::MetaValue;

/// Declarative policy, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizationPolicy {
    pub allow_customization: bool,
    pub locked_fields: Vec<String>,
    /// Whitelist; when non-empty only these paths may be patched.
    pub customizable_fields: Vec<String>,
    pub allow_add_fields: bool,
    pub allow_delete_fields: bool,
}

impl Default for CustomizationPolicy {
    fn default() -> Self {
        Self {
            allow_customization: true,
            locked_fields: Vec::new(),
            customizable_fields: Vec::new(),
            allow_add_fields: true,
            allow_delete_fields: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRule {
    CustomizationDisabled,
    LockedField { pattern: String },
    NotCustomizable,
    AdditionNotAllowed,
    DeletionNotAllowed,
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomizationDisabled => f.write_str("customization is disabled for this type"),
            Self::LockedField { pattern } => write!(f, "field is locked by {pattern:?}"),
            Self::NotCustomizable => f.write_str("field is not in the customizable whitelist"),
            Self::AdditionNotAllowed => f.write_str("adding fields is not allowed"),
            Self::DeletionNotAllowed => f.write_str("deleting fields is not allowed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub path: FieldPath,
    pub rule: PolicyRule,
}

/// Every violation found in one proposed patch. Nothing is accepted when
/// this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy rejected patch: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<PolicyViolation>,
}

fn summarize(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.path, v.rule))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn touches(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path.to_string() == path)
    }
}

/// Policy with its patterns compiled once, reused for every validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    allow_customization: bool,
    locked: PatternSet,
    customizable: PatternSet,
    allow_add_fields: bool,
    allow_delete_fields: bool,
}

impl Default for CompiledPolicy {
    fn default() -> Self {
        Self {
            allow_customization: true,
            locked: PatternSet::default(),
            customizable: PatternSet::default(),
            allow_add_fields: true,
            allow_delete_fields: true,
        }
    }
}

impl CompiledPolicy {
    pub fn compile(policy: &CustomizationPolicy) -> Result<Self, CoreError> {
        Ok(Self {
            allow_customization: policy.allow_customization,
            locked: PatternSet::compile(&policy.locked_fields)?,
            customizable: PatternSet::compile(&policy.customizable_fields)?,
            allow_add_fields: policy.allow_add_fields,
            allow_delete_fields: policy.allow_delete_fields,
        })
    }

    /// Whether a customer may keep a value at `path` at all, independent of
    /// the base document. Used when re-basing overlays onto a new version.
    pub fn permits(&self, path: &FieldPath) -> Option<PolicyRule> {
        if !self.allow_customization {
            return Some(PolicyRule::CustomizationDisabled);
        }
        if let Some(pattern) = self.locked.first_covering(path) {
            return Some(PolicyRule::LockedField {
                pattern: pattern.as_str().to_string(),
            });
        }
        if !self.customizable.is_empty() && !self.customizable.covers(path) {
            return Some(PolicyRule::NotCustomizable);
        }
        None
    }

    pub fn validate(&self, base: &MetaValue, patch: &Patch) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        if !self.allow_customization {
            if !patch.is_empty() {
                violations.extend(patch.paths().map(|path| PolicyViolation {
                    path: path.clone(),
                    rule: PolicyRule::CustomizationDisabled,
                }));
            }
            return finish(violations);
        }

        for (path, value) in &flatten(patch) {
            if is_noop_entry(base, path, value) {
                continue;
            }
            let mut flag = |rule| {
                violations.push(PolicyViolation {
                    path: path.clone(),
                    rule,
                })
            };
            let existing = base.get_path(path);
            let destructive = !value.is_map();

            if let Some(pattern) = self.locked.first_covering(path) {
                flag(PolicyRule::LockedField {
                    pattern: pattern.as_str().to_string(),
                });
            } else if destructive && existing.is_some() {
                // Replacing or deleting an ancestor rewrites locked descendants.
                if let Some(pattern) = self
                    .locked
                    .iter()
                    .find(|p| p.reaches_into(path) && p.exists_below(base, path))
                {
                    flag(PolicyRule::LockedField {
                        pattern: pattern.as_str().to_string(),
                    });
                }
            }

            if !self.customizable.is_empty() && !self.customizable.covers(path) {
                flag(PolicyRule::NotCustomizable);
            }

            match (value, existing) {
                (MetaValue::Null, Some(_)) if !self.allow_delete_fields => {
                    flag(PolicyRule::DeletionNotAllowed)
                }
                (MetaValue::Null, _) => {}
                (_, None) if !self.allow_add_fields => flag(PolicyRule::AdditionNotAllowed),
                _ => {}
            }
        }
        if !violations.is_empty() {
            tracing::debug!(count = violations.len(), "patch rejected by policy");
        }
        finish(violations)
    }
}

fn finish(violations: Vec<PolicyViolation>) -> Result<(), ValidationError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}
