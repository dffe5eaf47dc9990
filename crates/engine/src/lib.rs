pub mod config;
pub mod error;
pub mod events;
pub mod upgrade;

pub use config::EngineConfig;
pub use error::EngineError;
pub use events::{EventEmitter, OverlayEvent, OverlayEventKind, SubscriberError};
pub use upgrade::{CancelToken, ItemOutcome, ItemReport, LayerResult, UpgradeItem};

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use metalayer_core::{
    CompiledPolicy, CompiledStrategy, CustomizationPolicy, FieldChange, MergeInput, MergeResult,
    MergeStrategyConfig, MetaValue, Overlay, OverlayKey, OverlayScope, Owner, Patch, apply_patch,
    flatten, is_noop_entry, merge_patches, resolve_upgrade,
};
use metalayer_storage::{DefinitionStore, OverlayStore};

/// Customization overlays over vendor definitions, backed by a store `S`.
pub struct OverlayEngine<S> {
    config: EngineConfig,
    storage: S,
    default_policy: CompiledPolicy,
    policies: HashMap<String, CompiledPolicy>,
    default_strategy: CompiledStrategy,
    strategies: HashMap<String, CompiledStrategy>,
    events: EventEmitter,
}

impl<S: OverlayStore + DefinitionStore> OverlayEngine<S> {
    /// Compiles every configured policy and strategy up front.
    pub fn new(config: EngineConfig, storage: S) -> Result<Self, EngineError> {
        let policies = config
            .policies
            .iter()
            .map(|(base_type, policy)| -> Result<_, EngineError> {
                Ok((base_type.clone(), CompiledPolicy::compile(policy)?))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        let strategies = config
            .strategies
            .iter()
            .map(|(base_type, strategy)| -> Result<_, EngineError> {
                Ok((base_type.clone(), CompiledStrategy::compile(strategy)?))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        let default_strategy = CompiledStrategy::compile(&config.default_strategy)?;
        Ok(Self {
            config,
            storage,
            default_policy: CompiledPolicy::default(),
            policies,
            default_strategy,
            strategies,
            events: EventEmitter::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    // ========================================================================
    // Policies, Strategies and Subscribers
    // ========================================================================

    pub fn register_policy(
        &mut self,
        base_type: &str,
        policy: &CustomizationPolicy,
    ) -> Result<(), EngineError> {
        let compiled = CompiledPolicy::compile(policy)?;
        self.policies.insert(base_type.to_string(), compiled);
        Ok(())
    }

    pub fn set_strategy(
        &mut self,
        base_type: &str,
        strategy: &MergeStrategyConfig,
    ) -> Result<(), EngineError> {
        let compiled = CompiledStrategy::compile(strategy)?;
        self.strategies.insert(base_type.to_string(), compiled);
        Ok(())
    }

    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: Fn(&OverlayEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.events.subscribe(subscriber);
    }

    pub fn policy_for(&self, base_type: &str) -> &CompiledPolicy {
        self.policies.get(base_type).unwrap_or(&self.default_policy)
    }

    pub fn strategy_for(&self, base_type: &str) -> &CompiledStrategy {
        self.strategies.get(base_type).unwrap_or(&self.default_strategy)
    }

    fn key(&self, base_type: &str, base_name: &str, scope: OverlayScope) -> OverlayKey {
        OverlayKey::new(base_type, base_name, scope).with_tenant(self.config.tenant_id.clone())
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Install or replace a system definition without re-basing overlays.
    pub fn install_definition(
        &mut self,
        base_type: &str,
        base_name: &str,
        package_id: Option<&str>,
        package_version: Option<&str>,
        document: &MetaValue,
    ) -> Result<(), EngineError> {
        self.storage
            .put_definition(base_type, base_name, package_id, package_version, document)?;
        info!(base_type, base_name, ?package_version, "definition installed");
        Ok(())
    }

    fn system_definition(&self, base_type: &str, base_name: &str) -> Result<MetaValue, EngineError> {
        self.storage
            .get_definition(base_type, base_name)?
            .ok_or_else(|| EngineError::NotFound(format!("definition {base_type}/{base_name}")))
    }

    /// The document an overlay at `key` is written against: the system
    /// definition, plus the platform overlay for user scope.
    fn layer_below(&self, key: &OverlayKey) -> Result<MetaValue, EngineError> {
        let system = self.system_definition(&key.base_type, &key.base_name)?;
        match key.scope {
            OverlayScope::Platform => Ok(system),
            OverlayScope::User { .. } => match self.storage.get_overlay(&key.platform_key())? {
                Some(platform) => Ok(apply_patch(&system, &platform.patch)),
                None => Ok(system),
            },
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_overlay(
        &self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
    ) -> Result<Option<Overlay>, EngineError> {
        Ok(self.storage.get_overlay(&self.key(base_type, base_name, scope))?)
    }

    /// System definition with the platform overlay and, when `owner` is
    /// given, that user's overlay applied.
    pub fn get_effective(
        &self,
        base_type: &str,
        base_name: &str,
        owner: Option<&Owner>,
    ) -> Result<MetaValue, EngineError> {
        let platform_key = self.key(base_type, base_name, OverlayScope::Platform);
        let mut effective = self.layer_below(&platform_key)?;
        if let Some(platform) = self.storage.get_overlay(&platform_key)? {
            effective = apply_patch(&effective, &platform.patch);
        }
        if let Some(owner) = owner {
            let user_key = self.key(
                base_type,
                base_name,
                OverlayScope::User {
                    owner: owner.clone(),
                },
            );
            if let Some(user) = self.storage.get_overlay(&user_key)? {
                effective = apply_patch(&effective, &user.patch);
            }
        }
        Ok(effective)
    }

    pub fn overlay_history(
        &self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
    ) -> Result<Vec<Overlay>, EngineError> {
        Ok(self.storage.overlay_history(&self.key(base_type, base_name, scope))?)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Validate and persist `overlay`. `expected_version` is `None` to create
    /// and the version last read to update.
    pub fn save_overlay(
        &mut self,
        mut overlay: Overlay,
        expected_version: Option<u64>,
        actor: &str,
    ) -> Result<Overlay, EngineError> {
        overlay.check_invariants()?;
        if overlay.key.tenant_id.is_none() {
            overlay.key.tenant_id = self.config.tenant_id.clone();
        }
        let base = self.layer_below(&overlay.key)?;
        self.policy_for(&overlay.key.base_type)
            .validate(&base, &overlay.patch)?;

        overlay.updated_at = Utc::now();
        overlay.updated_by = actor.to_string();
        let saved = self.storage.save_overlay(&overlay, expected_version)?;
        info!(key = %saved.key, version = saved.version, "overlay saved");
        self.events
            .emit(&OverlayEvent::new(OverlayEventKind::Applied, &saved.key, actor));
        Ok(saved)
    }

    /// Create or extend the overlay for one item. `patch` is composed onto the
    /// existing overlay and its paths are recorded as changes by `actor`.
    pub fn customize(
        &mut self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
        patch: &Patch,
        actor: &str,
        expected_version: Option<u64>,
    ) -> Result<Overlay, EngineError> {
        let key = self.key(base_type, base_name, scope);
        let below = self.layer_below(&key)?;
        let (mut overlay, expected_version) = match self.storage.get_overlay(&key)? {
            Some(existing) => {
                let version = expected_version.unwrap_or(existing.version);
                (existing, Some(version))
            }
            None => (Overlay::new(key, Patch::new(), actor), expected_version),
        };

        overlay.patch = merge_patches(&overlay.patch, patch);
        let now = Utc::now();
        for (path, value) in &flatten(patch) {
            if is_noop_entry(&below, path, value) {
                continue;
            }
            overlay.changes.retain(|c| &c.path != path);
            overlay.changes.push(FieldChange {
                path: path.clone(),
                original_value: below.get_path(path).cloned(),
                current_value: Some(value.clone()).filter(|v| !v.is_null()),
                changed_by: actor.to_string(),
                changed_at: now,
            });
        }
        overlay.prune_changes();
        debug!(key = %overlay.key, paths = patch.len(), "customizing overlay");
        self.save_overlay(overlay, expected_version, actor)
    }

    /// Soft delete the active overlay; its history is kept.
    pub fn remove_overlay(
        &mut self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
        actor: &str,
    ) -> Result<Overlay, EngineError> {
        let key = self.key(base_type, base_name, scope);
        let removed = self
            .storage
            .remove_overlay(&key, actor, Utc::now())?
            .ok_or_else(|| EngineError::NotFound(format!("overlay {key}")))?;
        info!(key = %key, version = removed.version, "overlay removed");
        self.events
            .emit(&OverlayEvent::new(OverlayEventKind::Removed, &key, actor));
        Ok(removed)
    }

    // ========================================================================
    // Merging
    // ========================================================================

    /// Re-base `overlay_patch` from `base` onto `incoming` with the policy and
    /// strategy registered for `base_type`. Nothing is persisted.
    pub fn resolve_upgrade(
        &self,
        base_type: &str,
        base_name: &str,
        base: &MetaValue,
        incoming: &MetaValue,
        overlay_patch: Option<&Patch>,
    ) -> MergeResult {
        debug!(base_type, base_name, "resolving upgrade");
        resolve_upgrade(&MergeInput {
            base,
            incoming,
            overlay_patch,
            policy: self.policy_for(base_type),
            strategy: self.strategy_for(base_type),
        })
    }

    /// Persist a conflict-free merge as the overlay's new patch. Returns `None`
    /// when there is no overlay and nothing customer-owned to store.
    pub fn commit_merge(
        &mut self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
        result: &MergeResult,
        package_version: Option<&str>,
        actor: &str,
    ) -> Result<Option<Overlay>, EngineError> {
        let key = self.key(base_type, base_name, scope);
        if !result.success {
            return Err(EngineError::UnresolvedConflicts {
                key: key.to_string(),
                count: result.conflicts.len(),
            });
        }
        let (mut overlay, expected_version) = match self.storage.get_overlay(&key)? {
            Some(existing) => {
                let version = existing.version;
                (existing, Some(version))
            }
            None if result.updated_patch.is_empty() => {
                debug!(key = %key, "nothing to commit");
                return Ok(None);
            }
            None => (Overlay::new(key, Patch::new(), actor), None),
        };
        overlay.patch = result.updated_patch.clone();
        if let Some(version) = package_version {
            overlay.package_version = Some(version.to_string());
        }
        overlay.prune_changes();
        self.save_overlay(overlay, expected_version, actor).map(Some)
    }
}
