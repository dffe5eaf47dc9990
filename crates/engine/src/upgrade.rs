//! Package upgrades: re-basing every overlay of an item onto a new version.
//!
//! For one item the platform overlay is re-based from the old system
//! definition onto the new one. Each user overlay is then re-based from the
//! old platform-effective document onto the new platform-effective document.
//! The item commits only when every layer merged cleanly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use metalayer_core::{
    MergeInput, MergeResult, MetaValue, Overlay, OverlayKey, ScopeKind, apply_patch,
    resolve_upgrade,
};
use metalayer_storage::{DefinitionStore, OverlayStore, OverlayWrite, UpgradeCommit};

use crate::error::EngineError;
use crate::events::{OverlayEvent, OverlayEventKind};
use crate::OverlayEngine;

/// Shared cancellation flag, checked between batch items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A new package version of one system definition.
#[derive(Debug, Clone)]
pub struct UpgradeItem {
    pub base_type: String,
    pub base_name: String,
    pub package_id: Option<String>,
    pub package_version: Option<String>,
    pub document: MetaValue,
    /// Recorded as the author of re-based overlays.
    pub installed_by: String,
}

/// Merge outcome for one overlay layer of an item.
#[derive(Debug, Clone)]
pub struct LayerResult {
    pub key: OverlayKey,
    pub result: MergeResult,
}

#[derive(Debug)]
pub enum ItemOutcome {
    /// New definition and re-based overlays are stored.
    Committed { overlays: Vec<Overlay> },
    /// At least one layer needs a reviewer; nothing was written.
    Conflicted { layers: Vec<LayerResult> },
    Failed(EngineError),
    Cancelled,
}

#[derive(Debug)]
pub struct ItemReport {
    pub base_type: String,
    pub base_name: String,
    pub outcome: ItemOutcome,
}

impl<S: OverlayStore + DefinitionStore> OverlayEngine<S> {
    /// Upgrade each item independently, in order. Items already committed stay
    /// committed when the batch is cancelled.
    pub fn upgrade_batch(&mut self, items: &[UpgradeItem], cancel: &CancelToken) -> Vec<ItemReport> {
        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            let outcome = if cancel.is_cancelled() {
                ItemOutcome::Cancelled
            } else {
                match self.upgrade_item(item) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(base_type = %item.base_type, base_name = %item.base_name, error = %err, "upgrade failed");
                        ItemOutcome::Failed(err)
                    }
                }
            };
            reports.push(ItemReport {
                base_type: item.base_type.clone(),
                base_name: item.base_name.clone(),
                outcome,
            });
        }
        reports
    }

    fn merge_layer(
        &self,
        item: &UpgradeItem,
        base: &MetaValue,
        incoming: &MetaValue,
        overlay: Option<&Overlay>,
    ) -> MergeResult {
        resolve_upgrade(&MergeInput {
            base,
            incoming,
            overlay_patch: overlay.map(|o| &o.patch),
            policy: self.policy_for(&item.base_type),
            strategy: self.strategy_for(&item.base_type),
        })
    }

    fn upgrade_item(&mut self, item: &UpgradeItem) -> Result<ItemOutcome, EngineError> {
        let old_system = self
            .storage
            .get_definition(&item.base_type, &item.base_name)?
            .unwrap_or_else(MetaValue::empty_map);
        let (platform, users): (Vec<Overlay>, Vec<Overlay>) = self
            .storage
            .overlays_for(&item.base_type, &item.base_name, self.config.tenant_id.as_deref())?
            .into_iter()
            .partition(|o| o.key.scope.kind() == ScopeKind::Platform);
        let platform = platform.into_iter().next();

        let platform_result = self.merge_layer(item, &old_system, &item.document, platform.as_ref());
        let old_effective = match &platform {
            Some(p) => apply_patch(&old_system, &p.patch),
            None => old_system.clone(),
        };
        let new_effective = platform_result.merged_metadata.clone();

        let mut layers = Vec::with_capacity(users.len() + 1);
        if let Some(p) = &platform {
            layers.push((p.clone(), platform_result));
        }
        for user in users {
            let result = self.merge_layer(item, &old_effective, &new_effective, Some(&user));
            layers.push((user, result));
        }

        if layers.iter().any(|(_, result)| !result.success) {
            let conflicts: usize = layers.iter().map(|(_, r)| r.conflicts.len()).sum();
            warn!(
                base_type = %item.base_type,
                base_name = %item.base_name,
                conflicts,
                "upgrade needs review"
            );
            let layers = layers
                .into_iter()
                .map(|(overlay, result)| LayerResult {
                    key: overlay.key,
                    result,
                })
                .collect();
            return Ok(ItemOutcome::Conflicted { layers });
        }

        let now = Utc::now();
        let overlays = layers
            .into_iter()
            .map(|(mut overlay, result)| {
                let expected_version = Some(overlay.version);
                overlay.patch = result.updated_patch;
                overlay.package_id = item.package_id.clone();
                overlay.package_version = item.package_version.clone();
                overlay.updated_at = now;
                overlay.updated_by = item.installed_by.clone();
                overlay.prune_changes();
                OverlayWrite {
                    overlay,
                    expected_version,
                }
            })
            .collect();
        let commit = UpgradeCommit {
            base_type: item.base_type.clone(),
            base_name: item.base_name.clone(),
            package_id: item.package_id.clone(),
            package_version: item.package_version.clone(),
            document: item.document.clone(),
            overlays,
        };
        let saved = self.storage.commit_upgrade(&commit)?;
        info!(
            base_type = %item.base_type,
            base_name = %item.base_name,
            package_version = ?item.package_version,
            overlays = saved.len(),
            "upgrade committed"
        );
        for overlay in &saved {
            self.events.emit(&OverlayEvent::new(
                OverlayEventKind::Applied,
                &overlay.key,
                &item.installed_by,
            ));
        }
        Ok(ItemOutcome::Committed { overlays: saved })
    }
}
