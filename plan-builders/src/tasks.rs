// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node partitioning and task assembly shared by the builders.

use cluster_types::{Cluster, CniKind, NodeInformation, OsKind};
use plan_engine::Task;

/// Nodes classified for plan construction. A node carrying both roles
/// appears in `control_planes` and `dual` but not in `workers_only`, so
/// node-scoped work processes it exactly once.
#[derive(Debug)]
pub(crate) struct Partition<'a> {
    pub control_planes: Vec<&'a NodeInformation>,
    pub workers_only: Vec<&'a NodeInformation>,
    pub dual: Vec<&'a NodeInformation>,
}

impl<'a> Partition<'a> {
    pub fn new(nodes: &'a [NodeInformation]) -> Self {
        let control_planes: Vec<_> =
            nodes.iter().filter(|n| n.is_control_plane()).collect();
        let workers_only: Vec<_> = nodes
            .iter()
            .filter(|n| n.is_worker() && !n.is_control_plane())
            .collect();
        let dual: Vec<_> = nodes.iter().filter(|n| n.is_dual_role()).collect();
        Self { control_planes, workers_only, dual }
    }

    pub fn first_control_plane(&self) -> Option<&'a NodeInformation> {
        self.control_planes.first().copied()
    }
}

/// Renders the kubeadm configuration written to the first control plane
/// before `kubeadm init` runs. Inlined into the task payload; the engine
/// never interprets it.
pub(crate) fn render_kubeadm_config(cluster: &Cluster) -> String {
    format!(
        "apiVersion: kubeadm.k8s.io/v1beta3\n\
         kind: ClusterConfiguration\n\
         clusterName: {name}\n\
         kubernetesVersion: v{version}\n\
         networking:\n\
         \x20 podSubnet: {pod_cidr}\n\
         \x20 serviceSubnet: {service_cidr}\n",
        name = cluster.name,
        version = cluster.kube_version,
        pod_cidr = cluster.cni.pod_cidr,
        service_cidr = cluster.cni.service_cidr,
    )
}

/// Renders the CNI manifest applied right after init. Only the base
/// network provider is rendered here; everything else is an addon.
pub(crate) fn render_cni_manifest(cluster: &Cluster) -> String {
    let provider = match cluster.cni.kind {
        CniKind::Calico => "calico",
        CniKind::Flannel => "flannel",
    };
    format!(
        "# {provider} network provider\n\
         apiVersion: v1\n\
         kind: ConfigMap\n\
         metadata:\n\
         \x20 name: {provider}-config\n\
         \x20 namespace: kube-system\n\
         data:\n\
         \x20 pod-cidr: {pod_cidr}\n\
         \x20 backend: {backend}\n",
        pod_cidr = cluster.cni.pod_cidr,
        backend = if cluster.cni.vxlan { "vxlan" } else { "host-gw" },
    )
}

/// OS preparation every node gets before anything Kubernetes-related.
pub(crate) fn basic_config_tasks() -> Vec<Task> {
    vec![Task::ShellCommands {
        commands: vec![
            "swapoff -a && sed -i '/ swap / s/^/#/' /etc/fstab".to_string(),
            "modprobe br_netfilter overlay".to_string(),
            "sysctl -w net.bridge.bridge-nf-call-iptables=1 \
             net.ipv4.ip_forward=1"
                .to_string(),
        ],
    }]
}

pub(crate) fn kubeadm_join_worker_task(cluster: &Cluster) -> Task {
    Task::ShellCommands {
        commands: vec![format!(
            "kubeadm join --config /etc/kubernetes/join-{}.yaml",
            cluster.name
        )],
    }
}

pub(crate) fn kubeadm_join_control_plane_task(cluster: &Cluster) -> Task {
    Task::ShellCommands {
        commands: vec![format!(
            "kubeadm join --control-plane --config \
             /etc/kubernetes/join-{}.yaml",
            cluster.name
        )],
    }
}

pub(crate) fn untaint_task(node: &NodeInformation) -> Task {
    Task::ShellCommands {
        commands: vec![format!(
            "kubectl taint nodes {} node-role.kubernetes.io/control-plane- \
             --overwrite",
            node.hostname
        )],
    }
}

/// Whether the checksum-offload workaround applies: Flannel over VXLAN on
/// Ubuntu hosts mangles UDP checksums on the overlay interface.
pub(crate) fn needs_vxlan_offload_fix(
    cluster: &Cluster,
    node: &NodeInformation,
) -> bool {
    cluster.cni.kind == CniKind::Flannel
        && cluster.cni.vxlan
        && node.os == OsKind::Ubuntu
}

pub(crate) fn vxlan_offload_fix_task() -> Task {
    Task::ShellCommands {
        commands: vec![
            "ethtool --offload flannel.1 tx-checksum-ip-generic off"
                .to_string(),
        ],
    }
}
