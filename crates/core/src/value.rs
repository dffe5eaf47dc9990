use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::path::FieldPath;

pub type MetaMap = BTreeMap<String, MetaValue>;

/// A schema-less metadata document node.
///
/// Serialized untagged, so documents read and write as plain JSON (or the
/// MessagePack equivalent in storage).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Array(Vec<MetaValue>),
    Map(MetaMap),
}

impl PartialEq for MetaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for MetaValue {}

impl MetaValue {
    pub fn empty_map() -> Self {
        MetaValue::Map(MetaMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetaValue::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self, MetaValue::Map(_))
    }

    pub fn as_map(&self) -> Option<&MetaMap> {
        match self {
            MetaValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetaValue]> {
        match self {
            MetaValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Short name of the variant, used in conflict reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            MetaValue::Null => "null",
            MetaValue::Bool(_) => "bool",
            MetaValue::Integer(_) | MetaValue::Float(_) => "number",
            MetaValue::Text(_) => "text",
            MetaValue::Array(_) => "array",
            MetaValue::Map(_) => "map",
        }
    }

    /// Looks up the node at `path`. The root itself is never addressed by a path.
    pub fn get_path(&self, path: &FieldPath) -> Option<&MetaValue> {
        let mut node = self;
        for segment in path.segments() {
            node = node.as_map()?.get(segment)?;
        }
        Some(node)
    }

    /// Writes `value` at `path`, creating intermediate maps. Intermediates that
    /// are not maps are replaced by empty maps.
    pub fn set_path(&mut self, path: &FieldPath, value: MetaValue) {
        let (parent, leaf) = path.split_last();
        let mut node = self;
        for segment in parent {
            node = node
                .ensure_map()
                .entry(segment.clone())
                .or_insert_with(MetaValue::empty_map);
        }
        node.ensure_map().insert(leaf.to_string(), value);
    }

    /// Removes the node at `path`, returning it. Missing intermediates are a no-op.
    pub fn remove_path(&mut self, path: &FieldPath) -> Option<MetaValue> {
        let (parent, leaf) = path.split_last();
        let mut node = self;
        for segment in parent {
            node = match node {
                MetaValue::Map(m) => m.get_mut(segment)?,
                _ => return None,
            };
        }
        match node {
            MetaValue::Map(m) => m.remove(leaf),
            _ => None,
        }
    }

    /// Writes `value` at `path`, or removes the node when `value` is `None`.
    pub fn put_path(&mut self, path: &FieldPath, value: Option<MetaValue>) {
        match value {
            Some(v) => self.set_path(path, v),
            None => {
                self.remove_path(path);
            }
        }
    }

    fn ensure_map(&mut self) -> &mut MetaMap {
        if !self.is_map() {
            *self = MetaValue::empty_map();
        }
        match self {
            MetaValue::Map(m) => m,
            _ => unreachable!("value was just replaced by a map"),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl From<serde_json::Value> for MetaValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => MetaValue::Null,
            serde_json::Value::Bool(b) => MetaValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => MetaValue::Integer(i),
                None => MetaValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => MetaValue::Text(s),
            serde_json::Value::Array(items) => {
                MetaValue::Array(items.into_iter().map(MetaValue::from).collect())
            }
            serde_json::Value::Object(map) => MetaValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, MetaValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<MetaValue> for serde_json::Value {
    fn from(value: MetaValue) -> Self {
        match value {
            MetaValue::Null => serde_json::Value::Null,
            MetaValue::Bool(b) => serde_json::Value::Bool(b),
            MetaValue::Integer(i) => serde_json::Value::from(i),
            // Non-finite floats have no JSON form.
            MetaValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            MetaValue::Text(s) => serde_json::Value::String(s),
            MetaValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            MetaValue::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Integer(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    #[test]
    fn json_conversion_preserves_shape() {
        let raw = json!({"label": "Status", "order": 3, "weight": 0.5, "tags": ["a", null]});
        let value = MetaValue::from(raw.clone());
        assert_eq!(value.get_path(&path("order")), Some(&MetaValue::Integer(3)));
        assert_eq!(value.get_path(&path("weight")), Some(&MetaValue::Float(0.5)));
        assert_eq!(serde_json::Value::from(value), raw);
    }

    #[test]
    fn serde_is_plain_json() {
        let value = MetaValue::from(json!({"a": {"b": [1, true, "x"]}}));
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"a":{"b":[1,true,"x"]}}"#);
        let back: MetaValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn msgpack_roundtrip() {
        let value = MetaValue::from(json!({"fields": {"status": {"label": "S", "size": 1.25}}, "n": null}));
        let bytes = value.to_msgpack().unwrap();
        assert_eq!(MetaValue::from_msgpack(&bytes).unwrap(), value);
    }

    #[test]
    fn set_path_creates_and_replaces_intermediates() {
        let mut doc = MetaValue::from(json!({"a": 1}));
        doc.set_path(&path("a.b.c"), MetaValue::from("x"));
        assert_eq!(doc, MetaValue::from(json!({"a": {"b": {"c": "x"}}})));
    }

    #[test]
    fn remove_path_missing_is_noop() {
        let mut doc = MetaValue::from(json!({"a": {"b": 1}}));
        assert_eq!(doc.remove_path(&path("a.x.y")), None);
        assert_eq!(doc.remove_path(&path("a.b")), Some(MetaValue::Integer(1)));
        assert_eq!(doc, MetaValue::from(json!({"a": {}})));
    }

    #[test]
    fn float_equality_is_total() {
        assert_eq!(MetaValue::Float(f64::NAN), MetaValue::Float(f64::NAN));
        assert_ne!(MetaValue::Integer(1), MetaValue::Float(1.0));
    }
}
