//! Three-way re-basing of a customer overlay onto a new package version.
//!
//! Package changes (`base -> incoming`) and customer changes (the overlay
//! patch) are flattened to leaf paths and grouped: a group root is a changed
//! path with no changed ancestor, and every changed descendant joins its
//! root's group. A group touched by one side resolves automatically; a group
//! touched by both is classified at its root. Conflicts are returned as data.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::CoreError;
use crate::patch::{Patch, apply_entry, apply_patch, diff, diff_at, flatten, is_noop_entry};
use crate::path::FieldPath;
use crate::policy::CompiledPolicy;
use crate::strategy::{Classification, CompiledStrategy};
use crate::value::MetaValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestedResolution {
    KeepCustom,
    AcceptIncoming,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    KeepCustom,
    AcceptIncoming,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub path: FieldPath,
    pub base_value: Option<MetaValue>,
    pub incoming_value: Option<MetaValue>,
    pub custom_value: Option<MetaValue>,
    pub suggested_resolution: SuggestedResolution,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoResolution {
    pub path: FieldPath,
    pub resolution: Resolution,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub total_fields: usize,
    pub unchanged: usize,
    pub auto_resolved: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub success: bool,
    pub merged_metadata: MetaValue,
    /// Customer-owned changes re-based onto the incoming version.
    pub updated_patch: Patch,
    pub conflicts: Vec<MergeConflict>,
    pub auto_resolved: Vec<AutoResolution>,
    pub stats: MergeStats,
}

/// A reviewer's answer to one manual conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    KeepCustom,
    AcceptIncoming,
    Value(MetaValue),
}

pub struct MergeInput<'a> {
    pub base: &'a MetaValue,
    pub incoming: &'a MetaValue,
    pub overlay_patch: Option<&'a Patch>,
    pub policy: &'a CompiledPolicy,
    pub strategy: &'a CompiledStrategy,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sides {
    package: bool,
    customer: bool,
}

struct Group {
    root: FieldPath,
    members: Vec<(FieldPath, Sides)>,
}

impl Group {
    fn sides(&self) -> Sides {
        self.members.iter().fold(Sides::default(), |acc, (_, s)| Sides {
            package: acc.package || s.package,
            customer: acc.customer || s.customer,
        })
    }

    fn customer_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.members
            .iter()
            .filter(|(_, s)| s.customer)
            .map(|(p, _)| p)
    }
}

fn group_changes(package: &Patch, customer: &Patch) -> Vec<Group> {
    let mut union: BTreeMap<FieldPath, Sides> = BTreeMap::new();
    for path in package.paths() {
        union.entry(path.clone()).or_default().package = true;
    }
    for path in customer.paths() {
        union.entry(path.clone()).or_default().customer = true;
    }

    let mut groups: Vec<Group> = Vec::new();
    for (path, sides) in union {
        match groups.last_mut() {
            Some(group) if group.root.is_ancestor_of(&path) => group.members.push((path, sides)),
            _ => groups.push(Group {
                root: path.clone(),
                members: vec![(path, sides)],
            }),
        }
    }
    groups
}

struct Resolver<'a> {
    input: &'a MergeInput<'a>,
    customer: Patch,
    custom_doc: MetaValue,
    merged: MetaValue,
    conflicts: Vec<MergeConflict>,
    auto_resolved: Vec<AutoResolution>,
    unchanged: usize,
}

impl Resolver<'_> {
    fn accept(&mut self, path: &FieldPath, description: impl Into<String>) {
        self.auto_resolved.push(AutoResolution {
            path: path.clone(),
            resolution: Resolution::AcceptIncoming,
            description: description.into(),
        });
    }

    fn blocked_by_policy<'p>(&self, paths: impl IntoIterator<Item = &'p FieldPath>) -> Option<String> {
        paths.into_iter().find_map(|p| {
            self.input
                .policy
                .permits(p)
                .map(|rule| format!("customization of {p} dropped: {rule}"))
        })
    }

    fn resolve_one_sided(&mut self, group: &Group, sides: Sides) {
        for (path, _) in &group.members {
            if sides.package {
                self.accept(path, "package change accepted");
                continue;
            }
            if let Some(reason) = self.blocked_by_policy([path]) {
                self.accept(path, reason);
                continue;
            }
            if let Some(value) = self.customer.get(path).cloned() {
                apply_entry(&mut self.merged, path, &value);
            }
            self.auto_resolved.push(AutoResolution {
                path: path.clone(),
                resolution: Resolution::KeepCustom,
                description: "customization kept".into(),
            });
        }
    }

    fn resolve_both_sided(&mut self, group: &Group) {
        let root = &group.root;
        let base_value = self.input.base.get_path(root);
        let incoming_value = self.input.incoming.get_path(root);
        let custom_value = self.custom_doc.get_path(root);
        if incoming_value == custom_value {
            self.unchanged += 1;
            return;
        }

        let classification = self
            .input
            .strategy
            .classify(root, base_value, incoming_value, custom_value);
        let (value, resolution, description) = match classification {
            Classification::Converged => {
                self.unchanged += 1;
                return;
            }
            Classification::AcceptIncoming { reason } => {
                self.accept(root, reason);
                return;
            }
            Classification::Manual { reason } => {
                self.conflicts.push(MergeConflict {
                    path: root.clone(),
                    base_value: base_value.cloned(),
                    incoming_value: incoming_value.cloned(),
                    custom_value: custom_value.cloned(),
                    suggested_resolution: SuggestedResolution::Manual,
                    reason: Some(reason),
                });
                return;
            }
            Classification::KeepCustom { reason } => {
                (custom_value.cloned(), Resolution::KeepCustom, reason)
            }
            Classification::Merged { value, reason } => (Some(value), Resolution::Merged, reason),
        };

        let blocked = self.blocked_by_policy(std::iter::once(root).chain(group.customer_paths()));
        if let Some(reason) = blocked {
            self.accept(root, reason);
            return;
        }
        self.merged.put_path(root, value);
        self.auto_resolved.push(AutoResolution {
            path: root.clone(),
            resolution,
            description,
        });
    }
}

/// Re-base `overlay_patch` from `base` onto `incoming`.
pub fn resolve_upgrade(input: &MergeInput<'_>) -> MergeResult {
    let empty = Patch::new();
    let overlay_patch = input.overlay_patch.unwrap_or(&empty);
    let package = flatten(&diff(input.base, input.incoming));
    // Node markers over maps the base already has are not customer changes.
    let customer: Patch = flatten(overlay_patch)
        .iter()
        .filter(|(path, value)| !is_noop_entry(input.base, path, value))
        .map(|(path, value)| (path.clone(), value.clone()))
        .collect();
    let groups = group_changes(&package, &customer);

    let mut resolver = Resolver {
        input,
        custom_doc: apply_patch(input.base, overlay_patch),
        customer,
        merged: input.incoming.clone(),
        conflicts: Vec::new(),
        auto_resolved: Vec::new(),
        unchanged: 0,
    };

    for group in &groups {
        let sides = group.sides();
        if sides.package && sides.customer {
            resolver.resolve_both_sided(group);
        } else {
            resolver.resolve_one_sided(group, sides);
        }
    }

    let Resolver {
        merged,
        conflicts,
        auto_resolved,
        unchanged,
        ..
    } = resolver;
    let stats = MergeStats {
        total_fields: unchanged + auto_resolved.len() + conflicts.len(),
        unchanged,
        auto_resolved: auto_resolved.len(),
        conflicts: conflicts.len(),
    };
    tracing::debug!(
        total = stats.total_fields,
        auto_resolved = stats.auto_resolved,
        conflicts = stats.conflicts,
        "merge resolved"
    );
    MergeResult {
        success: conflicts.is_empty(),
        updated_patch: diff(input.incoming, &merged),
        merged_metadata: merged,
        conflicts,
        auto_resolved,
        stats,
    }
}

impl MergeResult {
    pub fn conflict(&self, path: &FieldPath) -> Option<&MergeConflict> {
        self.conflicts.iter().find(|c| &c.path == path)
    }

    /// Settle one manual conflict. The decision is applied to the merged
    /// document and the re-based patch.
    pub fn resolve_conflict(&mut self, path: &FieldPath, decision: Decision) -> Result<(), CoreError> {
        let index = self
            .conflicts
            .iter()
            .position(|c| &c.path == path)
            .ok_or_else(|| CoreError::UnknownConflict(path.to_string()))?;
        let conflict = self.conflicts.remove(index);

        let (value, resolution) = match decision {
            Decision::KeepCustom => (conflict.custom_value.clone(), Resolution::KeepCustom),
            Decision::AcceptIncoming => (conflict.incoming_value.clone(), Resolution::AcceptIncoming),
            Decision::Value(v) => (Some(v), Resolution::Merged),
        };
        self.updated_patch.remove_overlapping(path);
        self.updated_patch
            .extend(diff_at(path, conflict.incoming_value.as_ref(), value.as_ref()));
        self.merged_metadata.put_path(path, value);
        self.auto_resolved.push(AutoResolution {
            path: path.clone(),
            resolution,
            description: "resolved by reviewer".into(),
        });

        self.stats.conflicts = self.conflicts.len();
        self.stats.auto_resolved = self.auto_resolved.len();
        self.success = self.conflicts.is_empty();
        Ok(())
    }
}
