pub mod error;
pub mod ids;
pub mod merge;
pub mod overlay;
pub mod patch;
pub mod path;
pub mod policy;
pub mod strategy;
pub mod value;

pub use error::CoreError;
pub use ids::*;
pub use merge::{
    AutoResolution, Decision, MergeConflict, MergeInput, MergeResult, MergeStats, Resolution,
    SuggestedResolution, resolve_upgrade,
};
pub use overlay::{FieldChange, Overlay, OverlayKey, OverlayScope, Owner, ScopeKind};
pub use patch::{
    Patch, apply_patch, diff, diff_at, flatten, is_noop_entry, merge_patches, resolve_layers,
};
pub use path::{FieldPath, PathPattern, PatternSet};
pub use policy::{CompiledPolicy, CustomizationPolicy, PolicyRule, PolicyViolation, ValidationError};
pub use strategy::{Classification, CompiledStrategy, MergeStrategy, MergeStrategyConfig};
pub use value::{MetaMap, MetaValue};
