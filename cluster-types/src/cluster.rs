// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster record.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plugin::PluginConfig;

/// Identifier for one cluster record.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a cluster participates in a multi-cluster deployment.
///
/// Host and member clusters delegate their application layer to the host
/// platform, which forbids enabling cluster-local application addons on
/// them.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    /// A standalone cluster; all addons may be enabled.
    Independent,
    /// The hosting cluster of a multi-cluster deployment.
    Host,
    /// A cluster managed by a host cluster.
    Member,
}

/// The CNI provider deployed with the cluster.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CniKind {
    Calico,
    Flannel,
}

/// Pod network configuration rendered into the first control plane's init
/// task.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CniConfig {
    pub kind: CniKind,
    pub pod_cidr: String,
    pub service_cidr: String,
    /// Whether the CNI runs a VXLAN overlay. Relevant to the offload
    /// workaround on affected operating systems.
    pub vxlan: bool,
}

/// A namespace the destroy plan is allowed to drain and reclaim storage
/// from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NamespaceSpec {
    pub name: String,
    /// When false, teardown leaves the namespace's claims alone.
    pub reclaimable: bool,
}

/// Health as last observed by an addon liveness probe.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Unknown,
    Installing,
    Running,
    Degraded,
    Removed,
}

/// One cluster record as read from and written back to the store.
///
/// The engine mutates `component_status` (via step hooks) and the batch
/// addon toggle mutates `plugins`; everything else is caller-owned input.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    /// Kubernetes version, e.g. "1.23.6".
    pub kube_version: String,
    pub role: ClusterRole,
    pub cni: CniConfig,
    pub namespaces: Vec<NamespaceSpec>,
    /// Addon configuration keyed by addon name.
    pub plugins: BTreeMap<String, PluginConfig>,
    /// Last observed addon health, keyed by addon name.
    pub component_status: BTreeMap<String, ComponentStatus>,
}

impl Cluster {
    /// Names of the namespaces teardown may drain and reclaim.
    pub fn reclaimable_namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces
            .iter()
            .filter(|ns| ns.reclaimable)
            .map(|ns| ns.name.as_str())
    }

    /// True when cluster-local application addons are forbidden by the
    /// cluster's role.
    pub fn forbids_cluster_local_addons(&self) -> bool {
        matches!(self.role, ClusterRole::Host | ClusterRole::Member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(role: ClusterRole) -> Cluster {
        Cluster {
            id: ClusterId::new(),
            name: "c1".to_string(),
            kube_version: "1.23.6".to_string(),
            role,
            cni: CniConfig {
                kind: CniKind::Calico,
                pod_cidr: "10.244.0.0/16".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                vxlan: false,
            },
            namespaces: vec![
                NamespaceSpec { name: "default".to_string(), reclaimable: false },
                NamespaceSpec { name: "apps".to_string(), reclaimable: true },
            ],
            plugins: BTreeMap::new(),
            component_status: BTreeMap::new(),
        }
    }

    #[test]
    fn reclaimable_namespaces_filters() {
        let c = cluster(ClusterRole::Independent);
        let names: Vec<_> = c.reclaimable_namespaces().collect();
        assert_eq!(names, vec!["apps"]);
    }

    #[test]
    fn role_gates_cluster_local_addons() {
        assert!(!cluster(ClusterRole::Independent)
            .forbids_cluster_local_addons());
        assert!(cluster(ClusterRole::Host).forbids_cluster_local_addons());
        assert!(cluster(ClusterRole::Member).forbids_cluster_local_addons());
    }
}
