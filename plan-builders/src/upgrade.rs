// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster-upgrade builder.
//!
//! Upgrade order is fixed: the first control plane alone, then the
//! remaining control planes in parallel, then the workers in parallel,
//! and finally a kubelet restart pass over every control plane. A
//! failure anywhere halts the operation; a half-upgraded cluster must
//! not keep rolling forward.

use cluster_types::{Cluster, NodeInformation};
use plan_engine::{NodeStep, Operation, OperationType, Step, Task};
use slog::{info, Logger};

use crate::tasks::Partition;
use crate::{PlanError, LONG_NODE_WORK_TIMEOUT};

fn cordon_drain_tasks(node: &NodeInformation) -> Task {
    Task::ShellCommands {
        commands: vec![
            format!("kubectl cordon {}", node.hostname),
            format!(
                "kubectl drain {} --ignore-daemonsets \
                 --delete-emptydir-data",
                node.hostname
            ),
        ],
    }
}

fn upgrade_node_step(
    node: &NodeInformation,
    target_version: &str,
    first_control_plane: bool,
) -> NodeStep {
    let upgrade_command = if first_control_plane {
        format!("kubeadm upgrade apply v{target_version} --yes")
    } else {
        "kubeadm upgrade node".to_string()
    };
    NodeStep::new("upgrade-node", node.id)
        .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
        .task(cordon_drain_tasks(node))
        .task(Task::DownloadDependency {
            package: "kubernetes-node".to_string(),
            version: target_version.to_string(),
        })
        .task(Task::ShellCommands {
            commands: vec![
                format!("kubeadm config images pull --kubernetes-version v{target_version}"),
                upgrade_command,
                "systemctl daemon-reload".to_string(),
                "systemctl restart kubelet".to_string(),
                format!("kubectl uncordon {}", node.hostname),
            ],
        })
}

pub fn build_upgrade_plan(
    cluster: &Cluster,
    nodes: &[NodeInformation],
    target_version: &str,
    log: &Logger,
) -> Result<Operation, PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::EmptyNodeSet);
    }
    let partition = Partition::new(nodes);
    let first = partition
        .first_control_plane()
        .ok_or(PlanError::NoControlPlane)?;

    let mut op = Operation::new(cluster.id, OperationType::UpgradeCluster);

    op.append_step(
        Step::new("upgrade-first-control-plane").with_node_step(
            upgrade_node_step(first, target_version, true),
        ),
    );

    if partition.control_planes.len() > 1 {
        let mut step = Step::new("upgrade-remaining-control-planes");
        for node in &partition.control_planes[1..] {
            step = step
                .with_node_step(upgrade_node_step(node, target_version, false));
        }
        op.append_step(step);
    }

    if !partition.workers_only.is_empty() {
        let mut step = Step::new("upgrade-workers");
        for node in &partition.workers_only {
            step = step
                .with_node_step(upgrade_node_step(node, target_version, false));
        }
        op.append_step(step);
    }

    // The control-plane kubelets restart last, once every node runs the
    // new version.
    let mut restart = Step::new("restart-control-plane-kubelets");
    for node in &partition.control_planes {
        restart = restart.with_node_step(
            NodeStep::new("restart-kubelet", node.id).task(
                Task::RestartService { unit: "kubelet".to_string() },
            ),
        );
    }
    op.append_step(restart);

    info!(
        log, "upgrade plan built";
        "cluster_id" => %cluster.id,
        "target_version" => target_version,
        "steps" => op.steps.len(),
    );
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_cluster, test_logger, test_node};
    use cluster_types::{ClusterRole, NodeRole};

    fn step_names(op: &Operation) -> Vec<&str> {
        op.steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn upgrade_order_is_first_master_then_masters_then_workers() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![
            test_node("m0", &[NodeRole::ControlPlane]),
            test_node("m1", &[NodeRole::ControlPlane]),
            test_node("m2", &[NodeRole::ControlPlane]),
            test_node("w0", &[NodeRole::Worker]),
            test_node("w1", &[NodeRole::Worker]),
        ];
        let op =
            build_upgrade_plan(&cluster, &nodes, "1.24.2", &test_logger())
                .expect("plan builds");

        assert_eq!(
            step_names(&op),
            vec![
                "upgrade-first-control-plane",
                "upgrade-remaining-control-planes",
                "upgrade-workers",
                "restart-control-plane-kubelets",
            ]
        );
        assert_eq!(op.steps[0].node_steps.len(), 1);
        assert_eq!(op.steps[1].node_steps.len(), 2);
        assert_eq!(op.steps[2].node_steps.len(), 2);
        assert_eq!(op.steps[3].node_steps.len(), 3);
    }

    #[test]
    fn only_the_first_control_plane_runs_upgrade_apply() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![
            test_node("m0", &[NodeRole::ControlPlane]),
            test_node("m1", &[NodeRole::ControlPlane]),
        ];
        let op =
            build_upgrade_plan(&cluster, &nodes, "1.24.2", &test_logger())
                .expect("plan builds");

        let commands_of = |step: &Step| -> Vec<String> {
            step.node_steps[0]
                .tasks
                .iter()
                .filter_map(|t| match t {
                    Task::ShellCommands { commands } => Some(commands.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        };

        let first = commands_of(&op.steps[0]);
        assert!(first
            .iter()
            .any(|c| c.contains("kubeadm upgrade apply v1.24.2")));

        let rest = commands_of(&op.steps[1]);
        assert!(rest.iter().any(|c| c == "kubeadm upgrade node"));
        assert!(!rest.iter().any(|c| c.contains("upgrade apply")));
    }

    #[test]
    fn single_node_cluster_skips_the_parallel_passes() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes =
            vec![test_node("m0", &[NodeRole::ControlPlane, NodeRole::Worker])];
        let op =
            build_upgrade_plan(&cluster, &nodes, "1.24.2", &test_logger())
                .expect("plan builds");

        assert_eq!(
            step_names(&op),
            vec![
                "upgrade-first-control-plane",
                "restart-control-plane-kubelets",
            ]
        );
    }

    #[test]
    fn worker_only_set_is_rejected() {
        let cluster = test_cluster(ClusterRole::Independent);
        let nodes = vec![test_node("w0", &[NodeRole::Worker])];
        let err =
            build_upgrade_plan(&cluster, &nodes, "1.24.2", &test_logger())
                .expect_err("no control plane");
        assert!(matches!(err, PlanError::NoControlPlane));
    }
}
