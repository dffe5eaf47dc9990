//! Merge-patch deltas over metadata documents.
//!
//! A [`Patch`] maps dot paths to replacement values; `Null` deletes. Map values
//! merge into existing maps key by key, everything else replaces wholesale.
//! Arrays are never merged element-wise.

use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::path::FieldPath;
use crate::value::{MetaMap, MetaValue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(BTreeMap<FieldPath, MetaValue>);

impl Patch {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, path: FieldPath, value: MetaValue) -> Option<MetaValue> {
        self.0.insert(path, value)
    }

    /// Insert after parsing `path`; convenient for literal patches.
    pub fn set(&mut self, path: &str, value: impl Into<MetaValue>) -> Result<(), CoreError> {
        self.0.insert(path.parse()?, value.into());
        Ok(())
    }

    pub fn get(&self, path: &FieldPath) -> Option<&MetaValue> {
        self.0.get(path)
    }

    pub fn remove(&mut self, path: &FieldPath) -> Option<MetaValue> {
        self.0.remove(path)
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FieldPath, MetaValue> {
        self.0.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.keys()
    }

    /// Drop every entry at, above or below `path`.
    pub fn remove_overlapping(&mut self, path: &FieldPath) {
        self.0.retain(|p, _| !p.overlaps(path));
    }

    pub fn extend(&mut self, other: Patch) {
        self.0.extend(other.0);
    }

    /// Build a patch from a JSON object keyed by dot paths.
    pub fn from_json(value: serde_json::Value) -> Result<Self, CoreError> {
        match value {
            serde_json::Value::Object(map) => {
                let mut patch = Patch::new();
                for (key, v) in map {
                    patch.insert(key.parse()?, MetaValue::from(v));
                }
                Ok(patch)
            }
            other => Err(CoreError::Serialization(format!(
                "patch must be an object of paths, got {other}"
            ))),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Push one leaf entry, letting it supersede earlier entries beneath it.
    fn push_leaf(&mut self, path: FieldPath, value: MetaValue) {
        let replaces_subtree = !matches!(&value, MetaValue::Map(m) if m.is_empty());
        if replaces_subtree {
            let stale: Vec<FieldPath> = self
                .0
                .range(path.clone()..)
                .skip_while(|(p, _)| **p == path)
                .take_while(|(p, _)| path.is_ancestor_of(p))
                .map(|(p, _)| p.clone())
                .collect();
            for p in stale {
                self.0.remove(&p);
            }
        }
        self.0.insert(path, value);
    }
}

impl FromIterator<(FieldPath, MetaValue)> for Patch {
    fn from_iter<T: IntoIterator<Item = (FieldPath, MetaValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = (&'a FieldPath, &'a MetaValue);
    type IntoIter = btree_map::Iter<'a, FieldPath, MetaValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// RFC 7396 merge of `patch` into `target`.
fn merge_value(target: Option<MetaValue>, patch: &MetaValue) -> MetaValue {
    match patch {
        MetaValue::Map(patch_map) => {
            let mut map = match target {
                Some(MetaValue::Map(m)) => m,
                _ => MetaMap::new(),
            };
            for (key, value) in patch_map {
                if value.is_null() {
                    map.remove(key);
                } else {
                    let existing = map.remove(key);
                    map.insert(key.clone(), merge_value(existing, value));
                }
            }
            MetaValue::Map(map)
        }
        other => other.clone(),
    }
}

pub(crate) fn apply_entry(doc: &mut MetaValue, path: &FieldPath, value: &MetaValue) {
    match value {
        MetaValue::Null => {
            doc.remove_path(path);
        }
        MetaValue::Map(_) => {
            let merged = merge_value(doc.get_path(path).cloned(), value);
            doc.set_path(path, merged);
        }
        other => doc.set_path(path, other.clone()),
    }
}

/// Apply `patch` to `base`, returning the merged document. Idempotent.
pub fn apply_patch(base: &MetaValue, patch: &Patch) -> MetaValue {
    let mut doc = base.clone();
    for (path, value) in patch {
        apply_entry(&mut doc, path, value);
    }
    doc
}

/// Minimal patch that turns `base` into `target`.
///
/// Members equal to `Null` in `target` count as absent, since a merge patch
/// cannot express "set to null".
pub fn diff(base: &MetaValue, target: &MetaValue) -> Patch {
    let mut out = Patch::new();
    let empty = MetaMap::new();
    let base_map = base.as_map().unwrap_or(&empty);
    let target_map = target.as_map().unwrap_or(&empty);
    diff_maps(None, base_map, target_map, &mut out);
    out
}

/// Patch entries, rooted at `path`, that turn `before` into `after`.
pub fn diff_at(path: &FieldPath, before: Option<&MetaValue>, after: Option<&MetaValue>) -> Patch {
    let mut out = Patch::new();
    match (before, after) {
        (_, None) | (_, Some(MetaValue::Null)) => {
            if before.is_some() {
                out.insert(path.clone(), MetaValue::Null);
            }
        }
        (None, Some(value)) => {
            out.insert(path.clone(), value.clone());
        }
        (Some(b), Some(a)) => diff_values(path, b, a, &mut out),
    }
    out
}

fn diff_maps(prefix: Option<&FieldPath>, base: &MetaMap, target: &MetaMap, out: &mut Patch) {
    let at = |key: &str| match prefix {
        Some(p) => p.child(key),
        None => FieldPath::single(key),
    };
    for (key, base_value) in base {
        match target.get(key) {
            None | Some(MetaValue::Null) => {
                out.insert(at(key), MetaValue::Null);
            }
            Some(target_value) => diff_values(&at(key), base_value, target_value, out),
        }
    }
    for (key, target_value) in target {
        if !base.contains_key(key) && !target_value.is_null() {
            out.insert(at(key), target_value.clone());
        }
    }
}

fn diff_values(path: &FieldPath, base: &MetaValue, target: &MetaValue, out: &mut Patch) {
    if base == target {
        return;
    }
    match (base, target) {
        (MetaValue::Map(b), MetaValue::Map(t)) => diff_maps(Some(path), b, t, out),
        _ => {
            out.insert(path.clone(), target.clone());
        }
    }
}

/// Leaf form of a patch: non-empty map values are decomposed into entries for
/// their descendants. Applying the result is equivalent to applying `patch`.
pub fn flatten(patch: &Patch) -> Patch {
    let mut out = Patch::new();
    for (path, value) in patch {
        flatten_entry(path.clone(), value, &mut out);
    }
    out
}

fn flatten_entry(path: FieldPath, value: &MetaValue, out: &mut Patch) {
    match value {
        MetaValue::Map(map) if !map.is_empty() => {
            // A map with nothing but deletions still guarantees the node exists.
            if map.values().all(MetaValue::is_null) {
                out.push_leaf(path.clone(), MetaValue::empty_map());
            }
            for (key, child) in map {
                flatten_entry(path.child(key.clone()), child, out);
            }
        }
        other => out.push_leaf(path, other.clone()),
    }
}

/// Whether the flattened entry `path => value` leaves `base` untouched.
/// `flatten` keeps deletion-only nodes alive with an empty map, which does
/// nothing where `base` already holds a map.
pub fn is_noop_entry(base: &MetaValue, path: &FieldPath, value: &MetaValue) -> bool {
    match value {
        MetaValue::Map(m) if m.is_empty() => base.get_path(path).is_some_and(MetaValue::is_map),
        _ => false,
    }
}

/// Compose two patches so that applying the result equals applying `first`
/// then `second`.
pub fn merge_patches(first: &Patch, second: &Patch) -> Patch {
    let mut out = flatten(first);
    for (path, value) in &flatten(second) {
        out.push_leaf(path.clone(), value.clone());
    }
    out
}

/// `system <- platform <- user`; missing layers are empty patches.
pub fn resolve_layers(
    system: &MetaValue,
    platform: Option<&Patch>,
    user: Option<&Patch>,
) -> MetaValue {
    let mut doc = system.clone();
    for layer in [platform, user].into_iter().flatten() {
        doc = apply_patch(&doc, layer);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> MetaValue {
        MetaValue::from(v)
    }

    fn patch(v: serde_json::Value) -> Patch {
        Patch::from_json(v).unwrap()
    }

    #[test]
    fn null_deletes_key() {
        let base = doc(json!({"label": "Status", "help": "x"}));
        let merged = apply_patch(&base, &patch(json!({"help": null})));
        assert_eq!(merged, doc(json!({"label": "Status"})));
    }

    #[test]
    fn null_on_missing_parent_does_not_create_it() {
        let base = doc(json!({"label": "Status"}));
        let merged = apply_patch(&base, &patch(json!({"fields.status.help": null})));
        assert_eq!(merged, base);
    }

    #[test]
    fn map_values_merge_recursively() {
        let base = doc(json!({"fields": {"status": {"label": "S", "type": "text"}}}));
        let merged = apply_patch(
            &base,
            &patch(json!({"fields": {"status": {"label": "Account Status", "type": null}}})),
        );
        assert_eq!(merged, doc(json!({"fields": {"status": {"label": "Account Status"}}})));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let base = doc(json!({"options": ["a", "b"]}));
        let merged = apply_patch(&base, &patch(json!({"options": ["c"]})));
        assert_eq!(merged, doc(json!({"options": ["c"]})));
    }

    #[test]
    fn type_mismatch_replaces() {
        let base = doc(json!({"fields": {"status": "legacy"}}));
        let merged = apply_patch(&base, &patch(json!({"fields.status": {"label": "S", "x": null}})));
        assert_eq!(merged, doc(json!({"fields": {"status": {"label": "S"}}})));
    }

    #[test]
    fn dot_paths_address_nested_nodes() {
        let base = doc(json!({"fields": {"status": {"label": "S"}}}));
        let merged = apply_patch(&base, &patch(json!({"fields.status.label": "Account Status"})));
        assert_eq!(merged, doc(json!({"fields": {"status": {"label": "Account Status"}}})));
    }

    #[test]
    fn apply_is_idempotent() {
        let base = doc(json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"}));
        let p = patch(json!({"a": {"b": null, "e": {"f": 1}}, "d": null, "g.h": true}));
        let once = apply_patch(&base, &p);
        assert_eq!(apply_patch(&once, &p), once);
    }

    #[test]
    fn diff_is_minimal() {
        let base = doc(json!({"fields": {"status": {"label": "S", "type": "text"}}, "name": "x"}));
        let target = doc(json!({"fields": {"status": {"label": "T", "type": "text"}}}));
        let d = diff(&base, &target);
        assert_eq!(d, patch(json!({"fields.status.label": "T", "name": null})));
        assert_eq!(apply_patch(&base, &d), target);
    }

    #[test]
    fn diff_of_equal_documents_is_empty() {
        let base = doc(json!({"a": {"b": [1, 2]}}));
        assert!(diff(&base, &base.clone()).is_empty());
    }

    #[test]
    fn diff_replaces_when_shapes_differ() {
        let base = doc(json!({"a": {"b": 1}}));
        let target = doc(json!({"a": [1]}));
        assert_eq!(diff(&base, &target), patch(json!({"a": [1]})));
    }

    #[test]
    fn flatten_decomposes_maps() {
        let p = patch(json!({"fields.status": {"label": "S", "help": null}, "name": "x"}));
        let flat = flatten(&p);
        assert_eq!(
            flat,
            patch(json!({"fields.status.label": "S", "fields.status.help": null, "name": "x"}))
        );
    }

    #[test]
    fn flatten_keeps_node_for_deletion_only_maps() {
        let base = doc(json!({}));
        let p = patch(json!({"a": {"x": null}}));
        let flat = flatten(&p);
        assert_eq!(apply_patch(&base, &flat), apply_patch(&base, &p));
        assert_eq!(apply_patch(&base, &flat), doc(json!({"a": {}})));
    }

    #[test]
    fn node_marker_is_noop_only_over_an_existing_map() {
        let flat = flatten(&patch(json!({"fields.status": {"help": null}})));
        let marker: FieldPath = "fields.status".parse().unwrap();
        let value = flat.get(&marker).unwrap();
        assert_eq!(value, &MetaValue::empty_map());

        let existing = doc(json!({"fields": {"status": {"help": "h"}}}));
        assert!(is_noop_entry(&existing, &marker, value));
        assert!(!is_noop_entry(&doc(json!({"fields": {}})), &marker, value));
        assert!(!is_noop_entry(&doc(json!({"fields": {"status": 3}})), &marker, value));
        let help: FieldPath = "fields.status.help".parse().unwrap();
        assert!(!is_noop_entry(&existing, &help, &MetaValue::Null));
    }

    #[test]
    fn flatten_later_entries_supersede_descendants() {
        let base = doc(json!({"a": {"x": 1}}));
        let p = patch(json!({"a": {"x": {"y": 1}}, "a.x": 2}));
        assert_eq!(apply_patch(&base, &flatten(&p)), apply_patch(&base, &p));
    }

    #[test]
    fn merge_patches_composes() {
        let base = doc(json!({"a": {"b": 1, "c": 2}, "d": 3}));
        let first = patch(json!({"a.b": 10, "d": null}));
        let second = patch(json!({"a": null, "e": 5}));
        let composed = merge_patches(&first, &second);
        assert_eq!(
            apply_patch(&base, &composed),
            apply_patch(&apply_patch(&base, &first), &second)
        );
        assert!(!composed.contains(&"a.b".parse().unwrap()));
    }

    #[test]
    fn layers_apply_platform_then_user() {
        let system = doc(json!({"label": "Status", "help": "h"}));
        let platform = patch(json!({"label": "Account Status", "help": "p"}));
        let user = patch(json!({"label": "My Status"}));
        let effective = resolve_layers(&system, Some(&platform), Some(&user));
        assert_eq!(effective, doc(json!({"label": "My Status", "help": "p"})));
        assert_eq!(resolve_layers(&system, None, None), system);
    }

    #[test]
    fn patch_serializes_as_path_object() {
        let p = patch(json!({"fields.status.label": "S"}));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json, json!({"fields.status.label": "S"}));
        let bytes = p.to_msgpack().unwrap();
        assert_eq!(Patch::from_msgpack(&bytes).unwrap(), p);
    }
}
