// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The addon contract, the ordered registry, and the installer drivers.
//!
//! Addons are optional, independently installable cluster components. The
//! concrete manifest generators live outside this workspace; what the
//! builders see is the [`AddOn`] contract: a resolved enabled flag and
//! methods that append deploy or teardown steps to an operation.
//!
//! Addons are independent units of failure: the installer drivers collect
//! per-addon errors and keep going, returning the aggregate for
//! visibility.

use std::fmt;

use cluster_types::{
    Cluster, ComponentStatus, LicenseMask, NodeId, NodeInformation, Pluggable,
};
use plan_engine::{NodeStep, Operation, Step, Task};
use slog::{debug, warn, Logger};

use crate::LIVENESS_SETTLE_WAIT;

/// Whether an installer pass is putting the addon in or taking it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOnAction {
    Deploy,
    Remove,
}

/// Computes an addon's effective enabled flag from its plugin
/// configuration, the cluster's license mask, and the cluster's role.
///
/// A missing plugin disables the addon; a license-gated addon stays off
/// unless the mask carries every required bit; host and member clusters
/// forbid cluster-local application layers; otherwise the plugin's own
/// flag decides.
pub fn resolve_enabled(
    required_license: LicenseMask,
    cluster_local: bool,
    plugin: Option<&dyn Pluggable>,
    license: LicenseMask,
    cluster: &Cluster,
) -> bool {
    let Some(plugin) = plugin else {
        return false;
    };
    if !required_license.is_empty() && !license.contains(required_license) {
        return false;
    }
    if cluster_local && cluster.forbids_cluster_local_addons() {
        return false;
    }
    plugin.enabled()
}

/// The execution-facing addon contract.
///
/// `runner` is the node the addon's kubectl work executes on (the first
/// control-plane node in every builder).
pub trait AddOn: Send + Sync {
    fn name(&self) -> &str;

    /// License bits this addon requires; the empty mask means ungated.
    fn required_license(&self) -> LicenseMask {
        LicenseMask::NONE
    }

    /// True for application layers that may only run on independent
    /// clusters.
    fn cluster_local(&self) -> bool {
        false
    }

    /// The enabled flag as computed by the last [`AddOn::resolve`] call.
    fn is_enabled(&self) -> bool;

    /// Recomputes the effective enabled flag; see [`resolve_enabled`].
    fn resolve(
        &mut self,
        plugin: Option<&dyn Pluggable>,
        license: LicenseMask,
        cluster: &Cluster,
    );

    /// Appends this addon's deploy or teardown steps (batch-toggle scope).
    fn deploy_or_remove(
        &self,
        operation: &mut Operation,
        cluster: &Cluster,
        runner: NodeId,
        action: AddOnAction,
    ) -> anyhow::Result<()>;

    /// Cluster-lifecycle-scoped variant; defaults to the plain hook.
    fn deploy_or_remove_with_cluster(
        &self,
        operation: &mut Operation,
        cluster: &Cluster,
        runner: NodeId,
        action: AddOnAction,
    ) -> anyhow::Result<()> {
        self.deploy_or_remove(operation, cluster, runner, action)
    }

    /// Node-scale-scoped hook; most addons have no per-node work.
    fn deploy_or_remove_with_node_change(
        &self,
        _operation: &mut Operation,
        _cluster: &Cluster,
        _nodes: &[NodeInformation],
        _action: AddOnAction,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A post-install health-check step, or `None` when the addon has
    /// nothing to probe. The default probe waits for the addon's pods and
    /// records the observed status on the cluster record.
    fn liveness_probe(&self, _cluster: &Cluster, runner: NodeId) -> Option<Step> {
        let name = self.name().to_string();
        let probe = Step::new(format!("probe-{name}"))
            .best_effort()
            .with_node_step(
                NodeStep::new(format!("probe-{name}"), runner).task(
                    Task::ShellCommands {
                        commands: vec![format!(
                            "kubectl -n {name} wait --for=condition=Ready \
                             pods --all --timeout=120s"
                        )],
                    },
                ),
            )
            .with_on_all_done(Box::new(move |cluster: &mut Cluster| {
                cluster
                    .component_status
                    .insert(name.clone(), ComponentStatus::Running);
            }));
        Some(probe)
    }
}

/// The fixed-order addon list. Install and removal order is registration
/// order; the builders register storage providers before database
/// operators before application layers because later addons' manifests may
/// assume earlier ones exist.
#[derive(Default)]
pub struct AddOnRegistry {
    addons: Vec<Box<dyn AddOn>>,
}

impl fmt::Debug for AddOnRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.addons.iter().map(|a| a.name()))
            .finish()
    }
}

impl AddOnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, addon: Box<dyn AddOn>) {
        self.addons.push(addon);
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AddOn> {
        self.addons.iter().map(Box::as_ref)
    }

    pub fn get(&self, name: &str) -> Option<&dyn AddOn> {
        self.iter().find(|a| a.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Resolves every addon's enabled flag against the cluster's plugin
    /// configurations and license mask.
    pub fn resolve_all(&mut self, cluster: &Cluster, license: LicenseMask) {
        for addon in &mut self.addons {
            let plugin = cluster
                .plugins
                .get(addon.name())
                .map(|config| config as &dyn Pluggable);
            addon.resolve(plugin, license, cluster);
        }
    }
}

/// Aggregate of per-addon failures from one installer pass. Sibling
/// addons are unaffected.
#[derive(Debug)]
pub struct AddOnErrors(pub Vec<(String, anyhow::Error)>);

impl fmt::Display for AddOnErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} addon(s) failed:", self.0.len())?;
        for (name, error) in &self.0 {
            write!(f, " {name}: {error:#};")?;
        }
        Ok(())
    }
}

impl std::error::Error for AddOnErrors {}

fn collect(
    errors: Vec<(String, anyhow::Error)>,
) -> Result<(), AddOnErrors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AddOnErrors(errors))
    }
}

/// Batch-toggle-scoped installer: appends each enabled addon's steps via
/// the plain contract hook.
pub fn install_addons(
    registry: &AddOnRegistry,
    operation: &mut Operation,
    cluster: &Cluster,
    runner: NodeId,
    action: AddOnAction,
    log: &Logger,
) -> Result<(), AddOnErrors> {
    let mut errors = Vec::new();
    for addon in registry.iter() {
        if !addon.is_enabled() {
            debug!(log, "addon disabled, skipping"; "addon" => addon.name());
            continue;
        }
        if let Err(error) =
            addon.deploy_or_remove(operation, cluster, runner, action)
        {
            warn!(
                log, "addon step construction failed";
                "addon" => addon.name(),
                "error" => %error,
            );
            errors.push((addon.name().to_string(), error));
        }
    }
    collect(errors)
}

/// Cluster-lifecycle-scoped installer.
///
/// When `creating` is set, every collected liveness probe is appended
/// after one fixed settle-delay barrier. Teardown never probes.
pub fn install_addons_with_cluster(
    registry: &AddOnRegistry,
    operation: &mut Operation,
    cluster: &Cluster,
    runner: NodeId,
    action: AddOnAction,
    creating: bool,
    log: &Logger,
) -> Result<(), AddOnErrors> {
    let mut errors = Vec::new();
    let mut probes = Vec::new();
    for addon in registry.iter() {
        if !addon.is_enabled() {
            debug!(log, "addon disabled, skipping"; "addon" => addon.name());
            continue;
        }
        if let Err(error) =
            addon.deploy_or_remove_with_cluster(operation, cluster, runner, action)
        {
            warn!(
                log, "addon step construction failed";
                "addon" => addon.name(),
                "error" => %error,
            );
            errors.push((addon.name().to_string(), error));
            continue;
        }
        if creating && action == AddOnAction::Deploy {
            if let Some(probe) = addon.liveness_probe(cluster, runner) {
                probes.push(probe);
            }
        }
    }
    if !probes.is_empty() {
        operation
            .append_step(Step::barrier("addon-settle", LIVENESS_SETTLE_WAIT));
        for probe in probes {
            operation.append_step(probe);
        }
    }
    collect(errors)
}

/// Node-scale-scoped installer: invokes the per-node hooks for the diffed
/// nodes only.
pub fn install_addons_with_node_change(
    registry: &AddOnRegistry,
    operation: &mut Operation,
    cluster: &Cluster,
    nodes: &[NodeInformation],
    action: AddOnAction,
    log: &Logger,
) -> Result<(), AddOnErrors> {
    let mut errors = Vec::new();
    for addon in registry.iter() {
        if !addon.is_enabled() {
            debug!(log, "addon disabled, skipping"; "addon" => addon.name());
            continue;
        }
        if let Err(error) = addon
            .deploy_or_remove_with_node_change(operation, cluster, nodes, action)
        {
            warn!(
                log, "addon node hook failed";
                "addon" => addon.name(),
                "error" => %error,
            );
            errors.push((addon.name().to_string(), error));
        }
    }
    collect(errors)
}

/// A manifest-driven addon: applies (or deletes) one rendered manifest on
/// the runner node. Concrete third-party generators wrap this or
/// implement [`AddOn`] themselves.
pub struct ManifestAddOn {
    pub name: String,
    pub manifest: String,
    pub required_license: LicenseMask,
    pub cluster_local: bool,
    enabled: bool,
}

impl ManifestAddOn {
    pub fn new(name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
            required_license: LicenseMask::NONE,
            cluster_local: false,
            enabled: false,
        }
    }

    pub fn license_gated(mut self, required: LicenseMask) -> Self {
        self.required_license = required;
        self
    }

    pub fn cluster_local(mut self) -> Self {
        self.cluster_local = true;
        self
    }
}

impl AddOn for ManifestAddOn {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_license(&self) -> LicenseMask {
        self.required_license
    }

    fn cluster_local(&self) -> bool {
        self.cluster_local
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn resolve(
        &mut self,
        plugin: Option<&dyn Pluggable>,
        license: LicenseMask,
        cluster: &Cluster,
    ) {
        self.enabled = resolve_enabled(
            self.required_license,
            self.cluster_local,
            plugin,
            license,
            cluster,
        );
    }

    fn deploy_or_remove(
        &self,
        operation: &mut Operation,
        _cluster: &Cluster,
        runner: NodeId,
        action: AddOnAction,
    ) -> anyhow::Result<()> {
        let task = match action {
            AddOnAction::Deploy => {
                Task::KubectlApply { manifest: self.manifest.clone() }
            }
            AddOnAction::Remove => {
                Task::KubectlDelete { target: self.manifest.clone() }
            }
        };
        let verb = match action {
            AddOnAction::Deploy => "deploy",
            AddOnAction::Remove => "remove",
        };
        let mut step = Step::new(format!("{verb}-{}", self.name))
            .with_node_step(
                NodeStep::new(format!("{verb}-{}", self.name), runner)
                    .task(task),
            );
        if action == AddOnAction::Remove {
            step = step.best_effort();
        }
        operation.append_step(step);
        Ok(())
    }
}
