use metalayer_core::{
    CustomizationPolicy, Decision, MergeStrategy, MergeStrategyConfig, OverlayScope, Owner,
    Resolution, ScopeKind,
};
use metalayer_engine::{CancelToken, EngineConfig, EngineError, ItemOutcome, OverlayEventKind, UpgradeItem};
use metalayer_harness::{TestPlatform, doc, patch};
use metalayer_storage::DefinitionStore;
use pretty_assertions::assert_eq;
use serde_json::json;

fn item(base_type: &str, base_name: &str, version: &str, document: serde_json::Value) -> UpgradeItem {
    UpgradeItem {
        base_type: base_type.into(),
        base_name: base_name.into(),
        package_id: Some("test-package".into()),
        package_version: Some(version.into()),
        document: doc(document),
        installed_by: "installer".into(),
    }
}

fn installed_version(platform: &TestPlatform, base_type: &str, base_name: &str) -> Option<String> {
    platform
        .engine
        .storage()
        .definition_info(base_type, base_name)
        .ok()
        .flatten()
        .and_then(|info| info.package_version)
}

// ============================================================================
// Single Item
// ============================================================================

#[test]
fn label_customization_survives_unchanged_vendor_label() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "Status", "options": ["a", "b"]}))?;
    platform.customize(
        "object",
        "account",
        OverlayScope::Platform,
        json!({"label": "Account Status"}),
        "admin",
    )?;

    let reports = platform.engine.upgrade_batch(
        &[item(
            "object",
            "account",
            "2.0.0",
            json!({"label": "Status", "options": ["a", "b"], "help": "New"}),
        )],
        &CancelToken::new(),
    );
    let ItemOutcome::Committed { overlays } = &reports[0].outcome else {
        panic!("expected commit, got {:?}", reports[0].outcome);
    };
    assert_eq!(overlays.len(), 1);
    assert_eq!(overlays[0].patch, patch(json!({"label": "Account Status"}))?);
    assert_eq!(overlays[0].version, 2);
    assert_eq!(overlays[0].package_version.as_deref(), Some("2.0.0"));
    assert_eq!(overlays[0].updated_by, "installer");

    assert_eq!(installed_version(&platform, "object", "account").as_deref(), Some("2.0.0"));
    assert_eq!(
        platform.engine.get_effective("object", "account", None)?,
        doc(json!({"label": "Account Status", "options": ["a", "b"], "help": "New"}))
    );
    Ok(())
}

#[test]
fn divergent_option_edits_need_review() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "Status", "options": ["a", "b"]}))?;
    platform.customize(
        "object",
        "account",
        OverlayScope::Platform,
        json!({"options": ["a", "b", "d"]}),
        "admin",
    )?;

    let mut reports = platform.engine.upgrade_batch(
        &[item("object", "account", "2.0.0", json!({"label": "Status", "options": ["a", "b", "c"]}))],
        &CancelToken::new(),
    );
    let ItemOutcome::Conflicted { mut layers } = reports.remove(0).outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(layers.len(), 1);
    let conflicts = &layers[0].result.conflicts;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].path.to_string(), "options");
    assert_eq!(conflicts[0].base_value, Some(doc(json!(["a", "b"]))));
    assert_eq!(conflicts[0].incoming_value, Some(doc(json!(["a", "b", "c"]))));
    assert_eq!(conflicts[0].custom_value, Some(doc(json!(["a", "b", "d"]))));

    // Nothing was written.
    assert_eq!(installed_version(&platform, "object", "account").as_deref(), Some("1.0.0"));
    let overlay = platform
        .engine
        .get_overlay("object", "account", OverlayScope::Platform)?
        .ok_or("overlay missing")?;
    assert_eq!(overlay.version, 1);

    // A reviewer keeps the customer's options and commits.
    let mut result = layers.remove(0).result;
    let unresolved = platform
        .engine
        .commit_merge("object", "account", OverlayScope::Platform, &result, Some("2.0.0"), "reviewer")
        .unwrap_err();
    assert!(matches!(unresolved, EngineError::UnresolvedConflicts { count: 1, .. }));

    result.resolve_conflict(&"options".parse()?, Decision::KeepCustom)?;
    assert!(result.success);
    assert!(result
        .auto_resolved
        .iter()
        .any(|a| a.path.to_string() == "options" && a.resolution == Resolution::KeepCustom));

    platform.install("object", "account", "2.0.0", json!({"label": "Status", "options": ["a", "b", "c"]}))?;
    let committed = platform.engine.commit_merge(
        "object",
        "account",
        OverlayScope::Platform,
        &result,
        Some("2.0.0"),
        "reviewer",
    )?
    .ok_or("merge not committed")?;
    assert_eq!(committed.version, 2);
    assert_eq!(committed.patch, patch(json!({"options": ["a", "b", "d"]}))?);
    assert_eq!(committed.package_version.as_deref(), Some("2.0.0"));
    assert_eq!(
        platform.engine.get_effective("object", "account", None)?,
        doc(json!({"label": "Status", "options": ["a", "b", "d"]}))
    );
    Ok(())
}

#[test]
fn converged_customization_rebases_to_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "Status"}))?;
    platform.customize("object", "account", OverlayScope::Platform, json!({"label": "Account Status"}), "admin")?;

    let reports = platform.engine.upgrade_batch(
        &[item("object", "account", "2.0.0", json!({"label": "Account Status"}))],
        &CancelToken::new(),
    );
    let ItemOutcome::Committed { overlays } = &reports[0].outcome else {
        panic!("expected commit");
    };
    assert!(overlays[0].patch.is_empty());
    assert!(overlays[0].changes.is_empty());
    Ok(())
}

#[test]
fn newly_locked_fields_fall_back_to_vendor() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "Account", "type": "standard"}))?;
    platform.customize(
        "object",
        "account",
        OverlayScope::Platform,
        json!({"label": "Mine", "type": "custom"}),
        "admin",
    )?;
    platform.engine.register_policy(
        "object",
        &CustomizationPolicy {
            locked_fields: vec!["type".into()],
            ..Default::default()
        },
    )?;

    let reports = platform.engine.upgrade_batch(
        &[item("object", "account", "2.0.0", json!({"label": "Account", "type": "standard", "help": "h"}))],
        &CancelToken::new(),
    );
    let ItemOutcome::Committed { overlays } = &reports[0].outcome else {
        panic!("expected commit");
    };
    assert_eq!(overlays[0].patch, patch(json!({"label": "Mine"}))?);
    assert_eq!(overlays[0].changes.len(), 1);
    assert_eq!(
        platform.engine.get_effective("object", "account", None)?,
        doc(json!({"label": "Mine", "type": "standard", "help": "h"}))
    );
    Ok(())
}

#[test]
fn configured_strategies_resolve_without_review() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_toml_str(
        r#"
        [strategies.object]
        always_accept_incoming = ["options"]

        [strategies.view]
        default_strategy = "keep-custom"
        "#,
    )?;
    let mut platform = TestPlatform::with_config(config)?;
    platform.install("object", "account", "1.0.0", json!({"options": ["a", "b"]}))?;
    platform.install("view", "list", "1.0.0", json!({"columns": ["name"]}))?;
    platform.customize("object", "account", OverlayScope::Platform, json!({"options": ["a", "b", "d"]}), "admin")?;
    platform.customize("view", "list", OverlayScope::Platform, json!({"columns": ["name", "owner"]}), "admin")?;

    let reports = platform.engine.upgrade_batch(
        &[
            item("object", "account", "2.0.0", json!({"options": ["a", "b", "c"]})),
            item("view", "list", "2.0.0", json!({"columns": ["name", "stage"]})),
        ],
        &CancelToken::new(),
    );
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, ItemOutcome::Committed { .. })));
    assert_eq!(
        platform.engine.get_effective("object", "account", None)?,
        doc(json!({"options": ["a", "b", "c"]}))
    );
    assert_eq!(
        platform.engine.get_effective("view", "list", None)?,
        doc(json!({"columns": ["name", "owner"]}))
    );
    Ok(())
}

// ============================================================================
// Layered Overlays
// ============================================================================

#[test]
fn user_overlays_rebase_onto_new_platform_document() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "S", "help": "h", "order": 1}))?;
    platform.customize("object", "account", OverlayScope::Platform, json!({"label": "P"}), "admin")?;
    platform.customize("object", "account", OverlayScope::user("alice")?, json!({"help": "U"}), "alice")?;

    let reports = platform.engine.upgrade_batch(
        &[item("object", "account", "2.0.0", json!({"label": "S", "help": "h", "order": 2}))],
        &CancelToken::new(),
    );
    let ItemOutcome::Committed { overlays } = &reports[0].outcome else {
        panic!("expected commit");
    };
    assert_eq!(overlays.len(), 2);
    assert_eq!(overlays[0].key.scope.kind(), ScopeKind::Platform);
    assert_eq!(overlays[1].patch, patch(json!({"help": "U"}))?);

    let alice = Owner::new("alice")?;
    assert_eq!(
        platform.engine.get_effective("object", "account", Some(&alice))?,
        doc(json!({"label": "P", "help": "U", "order": 2}))
    );
    Ok(())
}

#[test]
fn user_conflict_blocks_the_whole_item() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "S", "help": "h"}))?;
    platform.customize("object", "account", OverlayScope::Platform, json!({"help": "P"}), "admin")?;
    platform.customize("object", "account", OverlayScope::user("alice")?, json!({"label": "U"}), "alice")?;

    let reports = platform.engine.upgrade_batch(
        &[item("object", "account", "2.0.0", json!({"label": "V", "help": "h"}))],
        &CancelToken::new(),
    );
    let ItemOutcome::Conflicted { layers } = &reports[0].outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(layers.len(), 2);
    assert!(layers[0].result.success);
    assert!(!layers[1].result.success);
    assert_eq!(layers[1].key.scope, OverlayScope::user("alice")?);
    assert_eq!(layers[1].result.conflicts[0].base_value, Some(doc(json!("S"))));

    assert_eq!(installed_version(&platform, "object", "account").as_deref(), Some("1.0.0"));
    let platform_overlay = platform
        .engine
        .get_overlay("object", "account", OverlayScope::Platform)?
        .ok_or("platform overlay missing")?;
    assert_eq!(platform_overlay.version, 1);
    Ok(())
}

// ============================================================================
// Batches
// ============================================================================

#[test]
fn items_are_independent() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "A"}))?;
    platform.install("object", "contact", "1.0.0", json!({"label": "C"}))?;
    platform.customize("object", "account", OverlayScope::Platform, json!({"label": "Mine"}), "admin")?;

    let reports = platform.engine.upgrade_batch(
        &[
            item("object", "account", "2.0.0", json!({"label": "Vendor"})),
            item("object", "contact", "2.0.0", json!({"label": "Contact"})),
            item("object", "lead", "1.0.0", json!({"label": "Lead"})),
        ],
        &CancelToken::new(),
    );
    assert!(matches!(reports[0].outcome, ItemOutcome::Conflicted { .. }));
    assert!(matches!(reports[1].outcome, ItemOutcome::Committed { .. }));
    assert!(matches!(reports[2].outcome, ItemOutcome::Committed { .. }));
    assert_eq!(reports[2].base_name, "lead");
    assert_eq!(installed_version(&platform, "object", "account").as_deref(), Some("1.0.0"));
    assert_eq!(installed_version(&platform, "object", "contact").as_deref(), Some("2.0.0"));
    assert_eq!(installed_version(&platform, "object", "lead").as_deref(), Some("1.0.0"));
    Ok(())
}

#[test]
fn cancellation_stops_remaining_items() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    for name in ["account", "contact", "lead"] {
        platform.install("object", name, "1.0.0", json!({"label": name}))?;
    }
    platform.customize("object", "account", OverlayScope::Platform, json!({"help": "custom"}), "admin")?;

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    platform.engine.subscribe(move |event| {
        if event.kind == OverlayEventKind::Applied && event.actor == "installer" {
            trigger.cancel();
        }
        Ok(())
    });

    let items: Vec<_> = ["account", "contact", "lead"]
        .into_iter()
        .map(|name| item("object", name, "2.0.0", json!({"label": name, "order": 1})))
        .collect();
    let reports = platform.engine.upgrade_batch(&items, &cancel);
    assert!(matches!(reports[0].outcome, ItemOutcome::Committed { .. }));
    assert!(matches!(reports[1].outcome, ItemOutcome::Cancelled));
    assert!(matches!(reports[2].outcome, ItemOutcome::Cancelled));

    // Completed work stays committed.
    assert_eq!(installed_version(&platform, "object", "account").as_deref(), Some("2.0.0"));
    assert_eq!(installed_version(&platform, "object", "contact").as_deref(), Some("1.0.0"));
    Ok(())
}

#[test]
fn pure_resolution_uses_registered_strategy() -> Result<(), Box<dyn std::error::Error>> {
    let platform = TestPlatform::new()?;
    let base = doc(json!({"label": "S"}));
    let incoming = doc(json!({"label": "V"}));
    let custom = patch(json!({"label": "C"}))?;
    let result = platform
        .engine
        .resolve_upgrade("object", "account", &base, &incoming, Some(&custom));
    assert!(!result.success);
    assert_eq!(result.stats.conflicts, 1);
    assert_eq!(result.merged_metadata, incoming);
    Ok(())
}

#[test]
fn map_form_deletion_keeps_vendor_edits_beside_it() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.engine.set_strategy(
        "object",
        &MergeStrategyConfig {
            default_strategy: MergeStrategy::KeepCustom,
            ..Default::default()
        },
    )?;
    platform.install(
        "object",
        "account",
        "1.0.0",
        json!({"label": "Account", "fields": {"status": {"label": "S", "help": "h"}}}),
    )?;
    platform.customize(
        "object",
        "account",
        OverlayScope::Platform,
        json!({"fields.status": {"help": null}}),
        "admin",
    )?;

    let reports = platform.engine.upgrade_batch(
        &[item(
            "object",
            "account",
            "2.0.0",
            json!({"label": "Account", "fields": {"status": {"label": "V", "help": "h"}}}),
        )],
        &CancelToken::new(),
    );
    let ItemOutcome::Committed { overlays } = &reports[0].outcome else {
        panic!("expected commit, got {:?}", reports[0].outcome);
    };
    assert_eq!(overlays[0].patch, patch(json!({"fields.status.help": null}))?);
    assert_eq!(
        platform.engine.get_effective("object", "account", None)?,
        doc(json!({"label": "Account", "fields": {"status": {"label": "V"}}}))
    );
    Ok(())
}

#[test]
fn committing_an_empty_merge_without_overlay_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut platform = TestPlatform::new()?;
    platform.install("object", "account", "1.0.0", json!({"label": "S"}))?;
    let events = platform.record_events();
    let base = doc(json!({"label": "S"}));
    let incoming = doc(json!({"label": "V"}));
    let result = platform
        .engine
        .resolve_upgrade("object", "account", &base, &incoming, None);
    assert!(result.success);
    assert!(result.updated_patch.is_empty());

    let committed = platform.engine.commit_merge(
        "object",
        "account",
        OverlayScope::Platform,
        &result,
        Some("2.0.0"),
        "reviewer",
    )?;
    assert!(committed.is_none());
    assert!(platform
        .engine
        .get_overlay("object", "account", OverlayScope::Platform)?
        .is_none());
    assert!(events.lock().map_err(|_| "poisoned")?.is_empty());
    Ok(())
}
