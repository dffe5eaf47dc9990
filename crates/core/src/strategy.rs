//! Merge strategy configuration and the conflict classifier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::patch::{apply_patch, diff};
use crate::path::{FieldPath, PatternSet};
use crate::value::MetaValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    KeepCustom,
    AcceptIncoming,
    #[default]
    ThreeWayMerge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStrategyConfig {
    pub default_strategy: MergeStrategy,
    pub always_accept_incoming: Vec<String>,
    pub always_keep_custom: Vec<String>,
    pub auto_resolve_non_conflicting: bool,
}

impl Default for MergeStrategyConfig {
    fn default() -> Self {
        Self {
            default_strategy: MergeStrategy::ThreeWayMerge,
            always_accept_incoming: Vec::new(),
            always_keep_custom: Vec::new(),
            auto_resolve_non_conflicting: true,
        }
    }
}

/// Outcome of classifying one changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    KeepCustom { reason: String },
    AcceptIncoming { reason: String },
    /// Incoming and custom already agree.
    Converged,
    /// Both sides changed disjoint parts of a map; `value` combines them.
    Merged { value: MetaValue, reason: String },
    Manual { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStrategy {
    default_strategy: MergeStrategy,
    always_accept_incoming: PatternSet,
    always_keep_custom: PatternSet,
    auto_resolve_non_conflicting: bool,
}

impl Default for CompiledStrategy {
    fn default() -> Self {
        Self {
            default_strategy: MergeStrategy::ThreeWayMerge,
            always_accept_incoming: PatternSet::default(),
            always_keep_custom: PatternSet::default(),
            auto_resolve_non_conflicting: true,
        }
    }
}

impl CompiledStrategy {
    pub fn compile(config: &MergeStrategyConfig) -> Result<Self, CoreError> {
        Ok(Self {
            default_strategy: config.default_strategy,
            always_accept_incoming: PatternSet::compile(&config.always_accept_incoming)?,
            always_keep_custom: PatternSet::compile(&config.always_keep_custom)?,
            auto_resolve_non_conflicting: config.auto_resolve_non_conflicting,
        })
    }

    pub fn default_strategy(&self) -> MergeStrategy {
        self.default_strategy
    }

    /// Decide how a path changed by both the vendor and the customer resolves.
    /// Pure; `None` means the node is absent on that side.
    pub fn classify(
        &self,
        path: &FieldPath,
        base: Option<&MetaValue>,
        incoming: Option<&MetaValue>,
        custom: Option<&MetaValue>,
    ) -> Classification {
        if let Some(pattern) = self.always_accept_incoming.first_covering(path) {
            return Classification::AcceptIncoming {
                reason: format!("matches always-accept-incoming pattern {:?}", pattern.as_str()),
            };
        }
        if let Some(pattern) = self.always_keep_custom.first_covering(path) {
            return Classification::KeepCustom {
                reason: format!("matches always-keep-custom pattern {:?}", pattern.as_str()),
            };
        }
        match self.default_strategy {
            MergeStrategy::KeepCustom => Classification::KeepCustom {
                reason: "default strategy keeps customizations".into(),
            },
            MergeStrategy::AcceptIncoming => Classification::AcceptIncoming {
                reason: "default strategy accepts package changes".into(),
            },
            MergeStrategy::ThreeWayMerge => self.three_way(base, incoming, custom),
        }
    }

    fn three_way(
        &self,
        base: Option<&MetaValue>,
        incoming: Option<&MetaValue>,
        custom: Option<&MetaValue>,
    ) -> Classification {
        if incoming == custom {
            return Classification::Converged;
        }
        if let (Some(incoming @ MetaValue::Map(_)), Some(custom @ MetaValue::Map(_))) =
            (incoming, custom)
        {
            if !self.auto_resolve_non_conflicting {
                return Classification::Manual {
                    reason: "both sides changed this map and auto-resolution is off".into(),
                };
            }
            let empty = MetaValue::empty_map();
            let base = base.filter(|b| b.is_map()).unwrap_or(&empty);
            let package_side = diff(base, incoming);
            let customer_side = diff(base, custom);
            let overlapping = package_side
                .paths()
                .find(|p| customer_side.paths().any(|c| c.overlaps(p)));
            return match overlapping {
                None => Classification::Merged {
                    value: apply_patch(incoming, &customer_side),
                    reason: "package and customer changed disjoint keys".into(),
                },
                Some(p) => Classification::Manual {
                    reason: format!("both sides changed {p} to different values"),
                },
            };
        }
        Classification::Manual {
            reason: format!(
                "package changed to {} and customer changed to {}",
                describe(incoming),
                describe(custom)
            ),
        }
    }
}

fn describe(value: Option<&MetaValue>) -> String {
    match value {
        None => "<removed>".to_string(),
        Some(MetaValue::Text(s)) => format!("{s:?}"),
        Some(other) => other.kind().to_string(),
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepCustom => "keep-custom",
            Self::AcceptIncoming => "accept-incoming",
            Self::ThreeWayMerge => "three-way-merge",
        })
    }
}
