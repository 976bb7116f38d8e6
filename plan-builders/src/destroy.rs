// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster-destroy builder.
//!
//! Every step here is best-effort. Teardown keeps going past nodes
//! that are already gone or unreachable so that the rest of the
//! cluster still gets cleaned up.

use cluster_types::{Cluster, NodeInformation};
use plan_engine::{
    LogLevel, NodeStep, Operation, OperationType, Step, Task,
};
use slog::{info, warn, Logger};

use crate::addons::{install_addons_with_cluster, AddOnAction, AddOnRegistry};
use crate::tasks::Partition;
use crate::{PlanError, LONG_NODE_WORK_TIMEOUT};

fn reset_node_step(node: &NodeInformation) -> NodeStep {
    NodeStep::new("kubeadm-reset", node.id)
        .with_reply_timeout(LONG_NODE_WORK_TIMEOUT)
        .task(Task::ShellCommands {
            commands: vec![
                "kubeadm reset --force".to_string(),
                "rm -rf /etc/cni/net.d".to_string(),
                "systemctl restart containerd".to_string(),
            ],
        })
}

pub fn build_destroy_plan(
    cluster: &Cluster,
    nodes: &[NodeInformation],
    registry: &AddOnRegistry,
    log: &Logger,
) -> Result<Operation, PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::EmptyNodeSet);
    }
    let partition = Partition::new(nodes);
    let runner = partition
        .first_control_plane()
        .ok_or(PlanError::NoControlPlane)?;

    let mut op = Operation::new(cluster.id, OperationType::DeleteCluster);

    let reclaimable: Vec<_> = cluster.reclaimable_namespaces().collect();
    if !reclaimable.is_empty() {
        let mut node_step = NodeStep::new("drain-namespaces", runner.id)
            .with_reply_timeout(LONG_NODE_WORK_TIMEOUT);
        for ns in reclaimable {
            node_step = node_step.task(Task::KubectlDelete {
                target: format!("namespace/{ns}"),
            });
        }
        op.append_step(
            Step::new("drain-reclaimable-namespaces")
                .best_effort()
                .with_node_step(node_step),
        );
    }

    // Workers reset before control planes so the API server outlives
    // the nodes it is evicting.
    if !partition.workers_only.is_empty() {
        let mut step = Step::new("reset-workers").best_effort();
        for node in &partition.workers_only {
            step = step.with_node_step(reset_node_step(node));
        }
        op.append_step(step);
    }

    let mut step = Step::new("reset-control-planes").best_effort();
    for node in &partition.control_planes {
        step = step.with_node_step(reset_node_step(node));
    }
    op.append_step(step);

    if let Err(errors) = install_addons_with_cluster(
        registry,
        &mut op,
        cluster,
        runner.id,
        AddOnAction::Remove,
        false,
        log,
    ) {
        warn!(log, "addon teardown construction degraded"; "errors" => %errors);
        op.log(
            LogLevel::Warn,
            format!("addon teardown construction degraded: {errors}"),
        );
    }

    info!(
        log, "destroy plan built";
        "cluster_id" => %cluster.id,
        "steps" => op.steps.len(),
    );
    Ok(op)
}
