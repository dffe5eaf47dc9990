use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::value::MetaValue;

/// A dot-notation path into a metadata document, e.g. `fields.status.label`.
///
/// Segments containing `.` or `\` are escaped as `\.` and `\\` in text form.
/// Ordering is segment-wise, so a parent always sorts before its descendants.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn from_segments<I, S>(segments: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(CoreError::InvalidPath {
                path: String::new(),
                reason: "path has no segments".into(),
            });
        }
        Ok(Self(segments))
    }

    pub fn single(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn split_last(&self) -> (&[String], &str) {
        match self.0.split_last() {
            Some((last, parent)) => (parent, last.as_str()),
            None => (&[], ""),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> FieldPath {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        FieldPath(segments)
    }

    /// Append all of `suffix`'s segments.
    pub fn join(&self, suffix: &FieldPath) -> FieldPath {
        let mut segments = self.0.clone();
        segments.extend(suffix.0.iter().cloned());
        FieldPath(segments)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &FieldPath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }

    /// True when the two paths are equal or one contains the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl FromStr for FieldPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidPath {
            path: s.to_string(),
            reason: reason.to_string(),
        };
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped @ ('.' | '\\')) => current.push(escaped),
                    _ => return Err(invalid("dangling escape")),
                },
                '.' => {
                    if current.is_empty() {
                        return Err(invalid("empty segment"));
                    }
                    segments.push(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }
        if current.is_empty() {
            return Err(invalid("empty segment"));
        }
        segments.push(current);
        Ok(Self(segments))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            for c in segment.chars() {
                if c == '.' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({self})")
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Any,
    Exact(String),
}

/// Path pattern where a `*` segment matches exactly one path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, CoreError> {
        let path: FieldPath = pattern.parse().map_err(|_| CoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "not a valid dot path".into(),
        })?;
        let segments = path
            .0
            .into_iter()
            .map(|s| {
                if s == "*" {
                    PatternSegment::Any
                } else {
                    PatternSegment::Exact(s)
                }
            })
            .collect();
        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn prefix_matches(&self, segments: &[String]) -> bool {
        self.segments
            .iter()
            .zip(segments)
            .all(|(p, s)| match p {
                PatternSegment::Any => true,
                PatternSegment::Exact(e) => e == s,
            })
    }

    pub fn matches(&self, path: &FieldPath) -> bool {
        self.segments.len() == path.len() && self.prefix_matches(path.segments())
    }

    /// Matches `path` itself or one of its ancestors.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.segments.len() <= path.len() && self.prefix_matches(path.segments())
    }

    /// The pattern lies strictly below `path`: replacing or deleting `path`
    /// would also rewrite whatever the pattern names.
    pub fn reaches_into(&self, path: &FieldPath) -> bool {
        self.segments.len() > path.len() && self.prefix_matches(path.segments())
    }

    /// Whether `doc` holds a node under `path` that this pattern names.
    /// Only meaningful when the pattern reaches into `path`.
    pub fn exists_below(&self, doc: &MetaValue, path: &FieldPath) -> bool {
        match doc.get_path(path) {
            Some(node) => segments_exist(node, self.segments.get(path.len()..).unwrap_or(&[])),
            None => false,
        }
    }
}

fn segments_exist(node: &MetaValue, remaining: &[PatternSegment]) -> bool {
    let Some((head, rest)) = remaining.split_first() else {
        return true;
    };
    let Some(map) = node.as_map() else {
        return false;
    };
    match head {
        PatternSegment::Any => map.values().any(|child| segments_exist(child, rest)),
        PatternSegment::Exact(key) => map.get(key).is_some_and(|child| segments_exist(child, rest)),
    }
}

/// A compiled group of patterns, built once and reused across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<PathPattern>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, CoreError> {
        let patterns = patterns
            .iter()
            .map(|p| PathPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathPattern> {
        self.patterns.iter()
    }

    pub fn first_covering(&self, path: &FieldPath) -> Option<&PathPattern> {
        self.patterns.iter().find(|p| p.covers(path))
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.first_covering(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_roundtrip() {
        let p = path("fields.status.label");
        assert_eq!(p.segments(), ["fields", "status", "label"]);
        assert_eq!(p.to_string(), "fields.status.label");
    }

    #[test]
    fn escaped_segments() {
        let p = FieldPath::from_segments(["options", "v1.2", "a\\b"]).unwrap();
        let text = p.to_string();
        assert_eq!(text, "options.v1\\.2.a\\\\b");
        assert_eq!(path(&text), p);
    }

    #[test]
    fn rejects_empty_segments() {
        assert!("".parse::<FieldPath>().is_err());
        assert!("a..b".parse::<FieldPath>().is_err());
        assert!("a.".parse::<FieldPath>().is_err());
        assert!("a\\".parse::<FieldPath>().is_err());
    }

    #[test]
    fn parents_sort_before_children() {
        let mut paths = vec![path("a.b"), path("b"), path("a"), path("a.b.c")];
        paths.sort();
        assert_eq!(paths, vec![path("a"), path("a.b"), path("a.b.c"), path("b")]);
    }

    #[test]
    fn wildcard_matches_exactly_one_segment() {
        let p = PathPattern::compile("fields.*.label").unwrap();
        assert!(p.matches(&path("fields.status.label")));
        assert!(!p.matches(&path("fields.status.options.extra")));
        assert!(!p.matches(&path("fields.label")));
    }

    #[test]
    fn covers_descendants_only() {
        let p = PathPattern::compile("type").unwrap();
        assert!(p.covers(&path("type")));
        assert!(p.covers(&path("type.format")));
        assert!(!p.covers(&path("types")));
        assert!(!p.reaches_into(&path("type")));
    }

    #[test]
    fn reaches_into_ancestors() {
        let p = PathPattern::compile("fields.*.label").unwrap();
        assert!(p.reaches_into(&path("fields")));
        assert!(p.reaches_into(&path("fields.status")));
        assert!(!p.reaches_into(&path("views.status")));
    }

    #[test]
    fn serde_uses_text_form() {
        let p = path("fields.name");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"fields.name\"");
        let back: FieldPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
