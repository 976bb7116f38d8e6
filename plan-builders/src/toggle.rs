// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The batch addon toggle builder.
//!
//! Compares each requested plugin config's enabled flag against the
//! stored one and emits deploy or remove steps only for real
//! transitions. A request whose enabled state matches the stored record
//! produces neither a write nor a step, so re-submitting a batch leaves
//! the persisted configuration byte-identical.

use std::collections::BTreeMap;

use cluster_types::{
    check_dependencies, Cluster, ClusterStore, NodeInformation, PluginConfig,
};
use plan_engine::{LogLevel, Operation, OperationType};
use slog::{debug, info, warn, Logger};

use crate::addons::{AddOnAction, AddOnRegistry};
use crate::{runner_node, PlanError};

pub fn build_toggle_plan(
    cluster: &Cluster,
    nodes: &[NodeInformation],
    requested: &[PluginConfig],
    registry: &AddOnRegistry,
    store: &dyn ClusterStore,
    log: &Logger,
) -> Result<Operation, PlanError> {
    let runner = runner_node(nodes)?;

    // Dependencies are checked against the post-toggle plugin map, so a
    // batch may enable an addon together with its prerequisite.
    let mut merged: BTreeMap<String, PluginConfig> = cluster.plugins.clone();
    for config in requested {
        merged.insert(config.name.clone(), config.clone());
    }
    for config in requested.iter().filter(|c| c.enabled) {
        check_dependencies(&config.resolved(&merged))?;
    }
    for config in requested {
        if registry.get(&config.name).is_none() {
            return Err(PlanError::UnknownAddOn(config.name.clone()));
        }
    }

    let mut op = Operation::new(cluster.id, OperationType::ToggleAddOns);

    for config in requested {
        let prev = store.plugin_config(cluster.id, &config.name)?;
        let prev_enabled = prev.as_ref().map_or(false, |c| c.enabled);
        if prev_enabled == config.enabled {
            // Unchanged enabled state: the stored record stays
            // byte-identical and no step is emitted.
            debug!(
                log, "addon enabled state unchanged, skipping";
                "addon" => &config.name,
            );
            continue;
        }

        // get() was checked above.
        let addon = match registry.get(&config.name) {
            Some(addon) => addon,
            None => continue,
        };

        store.put_plugin_config(cluster.id, config)?;

        let action = if config.enabled {
            AddOnAction::Deploy
        } else {
            AddOnAction::Remove
        };

        if let Err(error) =
            addon.deploy_or_remove(&mut op, cluster, runner, action)
        {
            warn!(
                log, "addon toggle step construction failed";
                "addon" => addon.name(),
                "error" => %error,
            );
            op.log(
                LogLevel::Warn,
                format!(
                    "addon {} toggle construction failed: {error}",
                    addon.name()
                ),
            );
        }
    }

    info!(
        log, "toggle plan built";
        "cluster_id" => %cluster.id,
        "requested" => requested.len(),
        "steps" => op.steps.len(),
    );
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::ManifestAddOn;
    use crate::test_support::{test_cluster, test_logger, test_node};
    use cluster_types::{ClusterRole, MemStore, NodeRole};

    fn registry_with(names: &[&str]) -> AddOnRegistry {
        let mut registry = AddOnRegistry::new();
        for name in names {
            registry.register(Box::new(ManifestAddOn::new(
                *name,
                format!("{name}.yaml"),
            )));
        }
        registry
    }

    #[test]
    fn identical_request_produces_no_steps_and_no_writes() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();
        let config = PluginConfig::new("metrics", true);
        store.put_plugin_config(cluster.id, &config).unwrap();

        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[config],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("plan builds");
        assert!(op.steps.is_empty());
    }

    #[test]
    fn unchanged_enabled_state_keeps_persisted_config_byte_identical() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();

        let mut stored = PluginConfig::new("metrics", true);
        stored.settings = serde_json::json!({ "retention": "7d" });
        store.put_plugin_config(cluster.id, &stored).unwrap();

        // Same enabled flag, different settings: no redeploy, and the
        // stored record must not be rewritten.
        let mut requested = PluginConfig::new("metrics", true);
        requested.settings = serde_json::json!({ "retention": "30d" });

        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[requested],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("plan builds");

        assert!(op.steps.is_empty());
        let after = store
            .plugin_config(cluster.id, "metrics")
            .unwrap()
            .expect("config still present");
        assert_eq!(after, stored);
    }

    #[test]
    fn enabling_persists_the_config_and_emits_a_deploy_step() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();
        let config = PluginConfig::new("metrics", true);

        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[config.clone()],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("plan builds");

        assert_eq!(op.steps.len(), 1);
        assert_eq!(op.steps[0].name, "deploy-metrics");
        let stored = store
            .plugin_config(cluster.id, "metrics")
            .unwrap()
            .expect("config persisted");
        assert_eq!(stored, config);
    }

    #[test]
    fn disabling_a_running_addon_emits_a_remove_step() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();
        store
            .put_plugin_config(
                cluster.id,
                &PluginConfig::new("metrics", true),
            )
            .unwrap();

        let disabled = PluginConfig::new("metrics", false);
        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[disabled],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("plan builds");

        assert_eq!(op.steps.len(), 1);
        assert_eq!(op.steps[0].name, "remove-metrics");
        let stored = store
            .plugin_config(cluster.id, "metrics")
            .unwrap()
            .expect("config persisted");
        assert!(!stored.enabled);
    }

    #[test]
    fn disabling_an_absent_addon_is_a_no_op() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();

        // Absent defaults to disabled, so disabled-to-disabled is not a
        // transition: nothing is written and nothing is emitted.
        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[PluginConfig::new("metrics", false)],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("plan builds");

        assert!(op.steps.is_empty());
        assert!(store
            .plugin_config(cluster.id, "metrics")
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_addon_name_is_rejected_before_any_write() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics"]);
        let store = MemStore::new();

        let err = build_toggle_plan(
            &cluster,
            &nodes,
            &[PluginConfig::new("mystery", true)],
            &registry,
            &store,
            &test_logger(),
        )
        .expect_err("unknown addon");
        assert!(matches!(err, PlanError::UnknownAddOn(name) if name == "mystery"));
        assert!(store
            .plugin_config(cluster.id, "mystery")
            .unwrap()
            .is_none());
    }

    #[test]
    fn batch_may_enable_an_addon_with_its_prerequisite() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = registry_with(&["metrics", "dashboard"]);
        let store = MemStore::new();

        let metrics = PluginConfig::new("metrics", true);
        let mut dashboard = PluginConfig::new("dashboard", true);
        dashboard.requires = vec!["metrics".to_string()];

        let op = build_toggle_plan(
            &cluster,
            &nodes,
            &[metrics, dashboard],
            &registry,
            &store,
            &test_logger(),
        )
        .expect("prerequisite satisfied within the batch");
        assert_eq!(op.steps.len(), 2);
    }
}
