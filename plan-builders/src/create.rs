// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster-create builder.

use std::time::Duration;

use cluster_types::{check_dependencies, Cluster, NodeId, NodeInformation};
use plan_engine::{
    DynamicNodeSteps, LogLevel, NodeStep, Operation, OperationType, Step,
    Task, TimeoutPolicy,
};
use slog::{info, warn, Logger};

use crate::addons::{install_addons_with_cluster, AddOnAction, AddOnRegistry};
use crate::tasks::{
    basic_config_tasks, kubeadm_join_control_plane_task,
    kubeadm_join_worker_task, needs_vxlan_offload_fix, render_cni_manifest,
    render_kubeadm_config, untaint_task, vxlan_offload_fix_task, Partition,
};
use crate::{PlanError, CONTAINERD_VERSION, LONG_NODE_WORK_TIMEOUT};

/// Delay before join steps dispatch, letting the control plane settle
/// after the previous step's last reply.
const JOIN_SETTLE_WAIT: Duration = Duration::from_secs(10);

/// Translates a cluster spec and its node set into the create plan.
///
/// Addon dependencies are validated up front: a spec whose enabled
/// plugins have unsatisfied prerequisites never produces an operation.
pub fn build_create_plan(
    cluster: &Cluster,
    nodes: &[NodeInformation],
    registry: &AddOnRegistry,
    log: &Logger,
) -> Result<Operation, PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::EmptyNodeSet);
    }
    for config in cluster.plugins.values() {
        check_dependencies(&config.resolved(&cluster.plugins))?;
    }

    let partition = Partition::new(nodes);
    let first = partition
        .first_control_plane()
        .ok_or(PlanError::NoControlPlane)?;

    let mut op = Operation::new(cluster.id, OperationType::CreateCluster);

    let renames: Vec<_> = nodes.iter().filter(|n| n.rename_host).collect();
    if !renames.is_empty() {
        let mut step = Step::new("rename-hostnames");
        for node in renames {
            step = step.with_node_step(
                NodeStep::new("rename-host", node.id).task(Task::RenameHost {
                    hostname: node.hostname.clone(),
                }),
            );
        }
        op.append_step(step);
    }

    let mut basic = Step::new("basic-config");
    for node in nodes {
        let mut node_step = NodeStep::new("basic-config", node.id)
            .with_reply_timeout(LONG_NODE_WORK_TIMEOUT);
        for task in basic_config_tasks() {
            node_step = node_step.task(task);
        }
        basic = basic.with_node_step(node_step);
    }
    op.append_step(basic);

    let mut runtime = Step::new("install-container-runtime");
    for node in nodes {
        runtime = runtime.with_node_step(
            NodeStep::new("install-runtime", node.id)
                .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                .task(Task::InstallRuntime {
                    version: CONTAINERD_VERSION.to_string(),
                }),
        );
    }
    op.append_step(runtime);

    // Multi-master clusters front the API server with a local balancer
    // on every control plane; it must exist before init renders the
    // control-plane endpoint into the kubeadm config.
    if partition.control_planes.len() > 1 {
        let endpoints: Vec<String> = partition
            .control_planes
            .iter()
            .map(|n| format!("{}:6443", n.address))
            .collect();
        let mut step = Step::new("configure-load-balancer");
        for node in &partition.control_planes {
            step = step.with_node_step(
                NodeStep::new("configure-load-balancer", node.id).task(
                    Task::ConfigureLoadBalancer {
                        endpoints: endpoints.clone(),
                    },
                ),
            );
        }
        op.append_step(step);
    }

    // Losing the one node being initialized is fatal, hence the tight
    // abort threshold.
    op.append_step(
        Step::new("init-first-control-plane")
            .with_timeout_policy(TimeoutPolicy::Abort { abort_when_count: 1 })
            .with_node_step(
                NodeStep::new("kubeadm-init", first.id)
                    .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                    .task(Task::WriteTextFile {
                        path: "/etc/kubernetes/kubeadm-config.yaml"
                            .to_string(),
                        content: render_kubeadm_config(cluster),
                    })
                    .task(Task::ShellCommands {
                        commands: vec![
                            "kubeadm init --config \
                             /etc/kubernetes/kubeadm-config.yaml"
                                .to_string(),
                        ],
                    })
                    .task(Task::KubectlApply {
                        manifest: render_cni_manifest(cluster),
                    }),
            ),
    );

    if partition.control_planes.len() > 1 {
        let mut join = Step::new("join-control-plane")
            .with_wait_before_run(JOIN_SETTLE_WAIT);
        for node in &partition.control_planes[1..] {
            join = join.with_node_step(
                NodeStep::new("kubeadm-join-control-plane", node.id)
                    .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                    .task(kubeadm_join_control_plane_task(cluster)),
            );
        }
        op.append_step(join);

        op.append_step(Step::new("get-admin-conf").with_node_step(
            NodeStep::new("get-admin-conf", first.id).task(
                Task::ShellCommands {
                    commands: vec![
                        "cat /etc/kubernetes/admin.conf".to_string()
                    ],
                },
            ),
        ));

        let targets: Vec<NodeId> =
            partition.control_planes[1..].iter().map(|n| n.id).collect();
        op.append_step(
            Step::new("propagate-admin-conf")
                .ignoring_dynamic_error()
                .with_dynamic(DynamicNodeSteps::new(
                    move |data, _cluster, _op| {
                        let content = data.require("0")?.to_string();
                        Ok(targets
                            .iter()
                            .map(|&node| {
                                NodeStep::new("write-admin-conf", node).task(
                                    Task::WriteTextFile {
                                        path: "/etc/kubernetes/admin.conf"
                                            .to_string(),
                                        content: content.clone(),
                                    },
                                )
                            })
                            .collect())
                    },
                )),
        );
    }

    if !partition.workers_only.is_empty() {
        let mut join =
            Step::new("join-workers").with_wait_before_run(JOIN_SETTLE_WAIT);
        for node in &partition.workers_only {
            join = join.with_node_step(
                NodeStep::new("kubeadm-join", node.id)
                    .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                    .task(kubeadm_join_worker_task(cluster)),
            );
        }
        op.append_step(join);
    }

    let offload_nodes: Vec<_> = nodes
        .iter()
        .filter(|n| needs_vxlan_offload_fix(cluster, n))
        .collect();
    if !offload_nodes.is_empty() {
        let mut step = Step::new("disable-vxlan-offload").best_effort();
        for node in offload_nodes {
            step = step.with_node_step(
                NodeStep::new("disable-offload", node.id)
                    .task(vxlan_offload_fix_task()),
            );
        }
        op.append_step(step);
    }

    if !partition.dual.is_empty() {
        let mut node_step = NodeStep::new("untaint-nodes", first.id);
        for node in &partition.dual {
            node_step = node_step.task(untaint_task(node));
        }
        op.append_step(
            Step::new("untaint-dual-role-nodes").with_node_step(node_step),
        );
    }

    if let Err(errors) = install_addons_with_cluster(
        registry,
        &mut op,
        cluster,
        first.id,
        AddOnAction::Deploy,
        true,
        log,
    ) {
        warn!(log, "addon step construction degraded"; "errors" => %errors);
        op.log(
            LogLevel::Warn,
            format!("addon step construction degraded: {errors}"),
        );
    }

    info!(
        log, "create plan built";
        "cluster_id" => %cluster.id,
        "steps" => op.steps.len(),
    );
    Ok(op)
}
