// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders for adding nodes to and removing nodes from a running
//! cluster.

use std::collections::BTreeSet;
use std::time::Duration;

use cluster_types::{Cluster, NodeId, NodeInformation};
use plan_engine::{
    LogLevel, NodeStep, Operation, OperationType, Step, Task,
};
use slog::{info, warn, Logger};

use crate::addons::{
    install_addons_with_node_change, AddOnAction, AddOnRegistry,
};
use crate::tasks::{
    basic_config_tasks, kubeadm_join_control_plane_task,
    kubeadm_join_worker_task, needs_vxlan_offload_fix, untaint_task,
    vxlan_offload_fix_task, Partition,
};
use crate::{PlanError, CONTAINERD_VERSION, LONG_NODE_WORK_TIMEOUT};

const JOIN_SETTLE_WAIT: Duration = Duration::from_secs(10);

/// The membership change a scale operation applies.
#[derive(Clone, Debug, Default)]
pub struct NodeDiff {
    pub added: Vec<NodeInformation>,
    pub removed: Vec<NodeInformation>,
}

impl NodeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Builds the plan for a node membership change.
///
/// `nodes` is the full membership after the change. The node driving
/// kubectl work is the first retained control plane, never a node
/// being removed.
pub fn build_scale_plan(
    cluster: &Cluster,
    nodes: &[NodeInformation],
    diff: &NodeDiff,
    registry: &AddOnRegistry,
    log: &Logger,
) -> Result<Operation, PlanError> {
    if diff.is_empty() {
        return Err(PlanError::EmptyNodeSet);
    }
    let removed_ids: BTreeSet<NodeId> =
        diff.removed.iter().map(|n| n.id).collect();
    let retained: Vec<&NodeInformation> =
        nodes.iter().filter(|n| !removed_ids.contains(&n.id)).collect();
    let runner = retained
        .iter()
        .find(|n| n.is_control_plane())
        .map(|n| n.id)
        .ok_or(PlanError::NoControlPlane)?;

    let op_type = if diff.added.is_empty() {
        OperationType::RemoveNodes
    } else {
        OperationType::AddNodes
    };
    let mut op = Operation::new(cluster.id, op_type);

    if !diff.added.is_empty() {
        append_add_steps(&mut op, cluster, &diff.added, runner);
        if let Err(errors) = install_addons_with_node_change(
            registry,
            &mut op,
            cluster,
            &diff.added,
            AddOnAction::Deploy,
            log,
        ) {
            warn!(log, "addon node-add hook degraded"; "errors" => %errors);
            op.log(
                LogLevel::Warn,
                format!("addon node-add hook degraded: {errors}"),
            );
        }
    }

    if !diff.removed.is_empty() {
        append_remove_steps(&mut op, &diff.removed, runner);
        if let Err(errors) = install_addons_with_node_change(
            registry,
            &mut op,
            cluster,
            &diff.removed,
            AddOnAction::Remove,
            log,
        ) {
            warn!(log, "addon node-remove hook degraded"; "errors" => %errors);
            op.log(
                LogLevel::Warn,
                format!("addon node-remove hook degraded: {errors}"),
            );
        }
    }

    info!(
        log, "scale plan built";
        "cluster_id" => %cluster.id,
        "added" => diff.added.len(),
        "removed" => diff.removed.len(),
        "steps" => op.steps.len(),
    );
    Ok(op)
}

fn append_add_steps(
    op: &mut Operation,
    cluster: &Cluster,
    added: &[NodeInformation],
    runner: NodeId,
) {
    let partition = Partition::new(added);

    let renames: Vec<_> = added.iter().filter(|n| n.rename_host).collect();
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
    for node in added {
        let mut node_step = NodeStep::new("basic-config", node.id)
            .with_reply_timeout(LONG_NODE_WORK_TIMEOUT);
        for task in basic_config_tasks() {
            node_step = node_step.task(task);
        }
        basic = basic.with_node_step(node_step);
    }
    op.append_step(basic);

    let mut runtime = Step::new("install-container-runtime");
    for node in added {
        runtime = runtime.with_node_step(
            NodeStep::new("install-runtime", node.id)
                .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                .task(Task::InstallRuntime {
                    version: CONTAINERD_VERSION.to_string(),
                }),
        );
    }
    op.append_step(runtime);

    if !partition.control_planes.is_empty() {
        let mut join = Step::new("join-control-plane")
            .with_wait_before_run(JOIN_SETTLE_WAIT);
        for node in &partition.control_planes {
            join = join.with_node_step(
                NodeStep::new("kubeadm-join-control-plane", node.id)
                    .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                    .task(kubeadm_join_control_plane_task(cluster)),
            );
        }
        op.append_step(join);
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

    let offload_nodes: Vec<_> = added
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
        let mut node_step = NodeStep::new("untaint-nodes", runner);
        for node in &partition.dual {
            node_step = node_step.task(untaint_task(node));
        }
        op.append_step(
            Step::new("untaint-dual-role-nodes").with_node_step(node_step),
        );
    }
}

fn append_remove_steps(
    op: &mut Operation,
    removed: &[NodeInformation],
    runner: NodeId,
) {
    // Eviction runs from the retained control plane; only the final
    // local cleanup touches the departing node itself.
    let mut drain = NodeStep::new("cordon-and-drain", runner)
        .with_reply_timeout(LONG_NODE_WORK_TIMEOUT);
    for node in removed {
        drain = drain.task(Task::ShellCommands {
            commands: vec![
                format!("kubectl cordon {}", node.hostname),
                format!(
                    "kubectl drain {} --ignore-daemonsets \
                     --delete-emptydir-data",
                    node.hostname
                ),
            ],
        });
    }
    op.append_step(
        Step::new("cordon-and-drain-nodes").with_node_step(drain),
    );

    let mut delete = NodeStep::new("delete-nodes", runner);
    for node in removed {
        delete = delete.task(Task::KubectlDelete {
            target: format!("node/{}", node.hostname),
        });
    }
    op.append_step(Step::new("delete-node-objects").with_node_step(delete));

    let mut cleanup = Step::new("cleanup-removed-nodes").best_effort();
    for node in removed {
        cleanup = cleanup.with_node_step(
            NodeStep::new("kubeadm-reset", node.id)
                .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
                .task(Task::ShellCommands {
                    commands: vec![
                        "kubeadm reset --force".to_string(),
                        "rm -rf /etc/cni/net.d".to_string(),
                    ],
                }),
        );
    }
    op.append_step(cleanup);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_cluster, test_logger, test_node};
    use cluster_types::{ClusterRole, NodeRole};
    use plan_engine::ReplyPolicy;

    #[test]
    fn adding_workers_scopes_steps_to_the_new_nodes() {
        let cluster = test_cluster(ClusterRole::Independent);
        let existing = test_node("m0", &[NodeRole::ControlPlane]);
        let new_worker = test_node("w1", &[NodeRole::Worker]);
        let nodes = vec![existing.clone(), new_worker.clone()];
        let diff = NodeDiff { added: vec![new_worker], removed: vec![] };
        let registry = AddOnRegistry::new();

        let op = build_scale_plan(
            &cluster,
            &nodes,
            &diff,
            &registry,
            &test_logger(),
        )
        .expect("plan builds");

        assert!(matches!(op.op_type, OperationType::AddNodes));
        let basic =
            op.steps.iter().find(|s| s.name == "basic-config").unwrap();
        assert_eq!(basic.node_steps.len(), 1);
        assert!(op.steps.iter().any(|s| s.name == "join-workers"));
        assert!(op.steps.iter().all(|s| s.name != "join-control-plane"));
    }

    #[test]
    fn removal_evicts_from_a_retained_control_plane() {
        let cluster = test_cluster(ClusterRole::Independent);
        let m0 = test_node("m0", &[NodeRole::ControlPlane]);
        let m1 = test_node("m1", &[NodeRole::ControlPlane]);
        let nodes = vec![m0.clone(), m1.clone()];
        let diff = NodeDiff { added: vec![], removed: vec![m0.clone()] };
        let registry = AddOnRegistry::new();

        let op = build_scale_plan(
            &cluster,
            &nodes,
            &diff,
            &registry,
            &test_logger(),
        )
        .expect("plan builds");

        assert!(matches!(op.op_type, OperationType::RemoveNodes));
        let drain = op
            .steps
            .iter()
            .find(|s| s.name == "cordon-and-drain-nodes")
            .expect("drain step exists");
        // m0 is leaving, so m1 drives the eviction.
        assert_eq!(drain.node_steps[0].node_id, m1.id);

        let cleanup = op
            .steps
            .iter()
            .find(|s| s.name == "cleanup-removed-nodes")
            .expect("cleanup step exists");
        assert!(matches!(cleanup.reply_policy, ReplyPolicy::Ignore));
        assert_eq!(cleanup.node_steps[0].node_id, m0.id);
    }

    #[test]
    fn removing_the_last_control_plane_is_rejected() {
        let cluster = test_cluster(ClusterRole::Independent);
        let m0 = test_node("m0", &[NodeRole::ControlPlane]);
        let w0 = test_node("w0", &[NodeRole::Worker]);
        let nodes = vec![m0.clone(), w0];
        let diff = NodeDiff { added: vec![], removed: vec![m0] };
        let registry = AddOnRegistry::new();

        let err = build_scale_plan(
            &cluster,
            &nodes,
            &diff,
            &registry,
            &test_logger(),
        )
        .expect_err("no control plane left");
        assert!(matches!(err, PlanError::NoControlPlane));
    }

    #[test]
    fn empty_diff_is_rejected() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("m0", &[NodeRole::ControlPlane])];
        let registry = AddOnRegistry::new();
        let err = build_scale_plan(
            &cluster,
            &nodes,
            &NodeDiff::default(),
            &registry,
            &test_logger(),
        )
        .expect_err("empty diff");
        assert!(matches!(err, PlanError::EmptyNodeSet));
    }
}
