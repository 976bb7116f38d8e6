// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intent → plan translation.
//!
//! One builder per operation intent (create, destroy, node add/remove,
//! batch addon toggle, upgrade). A builder receives the cluster spec, the
//! relevant node set and, where applicable, a diff payload, and emits
//! steps into the operation in a fixed sequence using the `plan-engine`
//! primitives. Every plan-construction failure surfaces here, before any
//! step is dispatched; the operation is never created half-built.
//!
//! The addon contract, the ordered registry, and the installer drivers
//! live in [`addons`].

use cluster_types::{
    Cluster, DependencyCheckError, NodeId, NodeInformation, PluginConfig,
    StoreError,
};
use cluster_types::ClusterStore;
use plan_engine::Operation;
use slog::Logger;
use std::time::Duration;
use thiserror::Error;

pub mod addons;
mod create;
mod destroy;
mod scale;
mod tasks;
mod toggle;
mod upgrade;

pub use create::build_create_plan;
pub use destroy::build_destroy_plan;
pub use scale::{build_scale_plan, NodeDiff};
pub use toggle::build_toggle_plan;
pub use upgrade::build_upgrade_plan;

use addons::AddOnRegistry;

/// Settle delay between the last addon install step and the liveness
/// probes; manifests need a moment to schedule before probing is useful.
pub const LIVENESS_SETTLE_WAIT: Duration = Duration::from_secs(30);

/// Default reply timeout for long-running node work (init, join, runtime
/// install, upgrade).
pub(crate) const LONG_NODE_WORK_TIMEOUT: Duration = Duration::from_secs(600);

/// Container runtime version the create plan installs.
pub(crate) const CONTAINERD_VERSION: &str = "1.6.21";

/// Plan-construction failure: surfaced before any step dispatches.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cluster has no control-plane node")]
    NoControlPlane,

    #[error("no nodes provided for the requested change")]
    EmptyNodeSet,

    #[error(transparent)]
    DependencyCheck(#[from] DependencyCheckError),

    #[error("store access failed")]
    Store(#[from] StoreError),

    #[error("toggle request names unknown addon {0:?}")]
    UnknownAddOn(String),
}

/// The caller-facing intent, dispatched to the matching builder.
#[derive(Debug)]
pub enum Intent<'a> {
    CreateCluster { nodes: &'a [NodeInformation] },
    DeleteCluster { nodes: &'a [NodeInformation] },
    ChangeNodes { nodes: &'a [NodeInformation], diff: &'a NodeDiff },
    ToggleAddOns {
        nodes: &'a [NodeInformation],
        requested: &'a [PluginConfig],
    },
    UpgradeCluster { nodes: &'a [NodeInformation], target_version: &'a str },
}

/// Builds the plan for one intent. The registry must already be resolved
/// (see [`AddOnRegistry::resolve_all`]).
pub fn build_plan(
    cluster: &Cluster,
    intent: Intent<'_>,
    registry: &AddOnRegistry,
    store: &dyn ClusterStore,
    log: &Logger,
) -> Result<Operation, PlanError> {
    match intent {
        Intent::CreateCluster { nodes } => {
            build_create_plan(cluster, nodes, registry, log)
        }
        Intent::DeleteCluster { nodes } => {
            build_destroy_plan(cluster, nodes, registry, log)
        }
        Intent::ChangeNodes { nodes, diff } => {
            build_scale_plan(cluster, nodes, diff, registry, log)
        }
        Intent::ToggleAddOns { nodes, requested } => {
            build_toggle_plan(cluster, nodes, requested, registry, store, log)
        }
        Intent::UpgradeCluster { nodes, target_version } => {
            build_upgrade_plan(cluster, nodes, target_version, log)
        }
    }
}

/// Resolves the runner node (the first control-plane node) for kubectl
/// work, from a node set that must contain at least one control plane.
pub(crate) fn runner_node(
    nodes: &[NodeInformation],
) -> Result<NodeId, PlanError> {
    nodes
        .iter()
        .find(|n| n.is_control_plane())
        .map(|n| n.id)
        .ok_or(PlanError::NoControlPlane)
}
