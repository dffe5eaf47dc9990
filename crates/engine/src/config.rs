//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! tenant_id = "acme"
//!
//! [default_strategy]
//! default_strategy = "three-way-merge"
//!
//! [strategies.view]
//! default_strategy = "keep-custom"
//! always_accept_incoming = ["type"]
//!
//! [policies.object]
//! locked_fields = ["type", "fields.*.type"]
//! allow_delete_fields = false
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use metalayer_core::{CustomizationPolicy, MergeStrategyConfig};

use crate::error::EngineError;

/// The config file name looked up by embedding applications.
pub const CONFIG_FILE_NAME: &str = "metalayer.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tenant every key is scoped to. `None` for single-tenant deployments.
    pub tenant_id: Option<String>,

    /// Strategy for types without an entry in `strategies`.
    pub default_strategy: MergeStrategyConfig,

    /// Per base type merge strategies.
    pub strategies: BTreeMap<String, MergeStrategyConfig>,

    /// Per base type customization policies. Unlisted types are unrestricted.
    pub policies: BTreeMap<String, CustomizationPolicy>,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading engine config");
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}
