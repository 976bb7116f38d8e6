// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operation record: one requested cluster change and its plan.

use std::fmt;

use cluster_types::ClusterId;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::step::Step;

/// Identifier for one operation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The intent an operation was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateCluster,
    DeleteCluster,
    AddNodes,
    RemoveNodes,
    ToggleAddOns,
    UpgradeCluster,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of the operation's append-only audit trail.
#[derive(Clone, Debug, Serialize)]
pub struct OperationLogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// One requested change to one cluster.
///
/// Built by a plan builder in one call; mutated by the executor as steps
/// resolve; immutable once [`Operation::is_terminal`] returns true.
///
/// `steps` is append-only and insertion order is execution order. Nothing
/// may skip or reorder a step after it is appended.
#[derive(Debug)]
pub struct Operation {
    pub id: OperationId,
    pub cluster_id: ClusterId,
    pub op_type: OperationType,
    pub steps: Vec<Step>,
    pub status: OperationStatus,
    pub logs: Vec<OperationLogEntry>,
}

impl Operation {
    pub fn new(cluster_id: ClusterId, op_type: OperationType) -> Self {
        Self {
            id: OperationId::new(),
            cluster_id,
            op_type,
            steps: Vec::new(),
            status: OperationStatus::Pending,
            logs: Vec::new(),
        }
    }

    /// Appends a step and returns its execution index.
    pub fn append_step(&mut self, step: Step) -> usize {
        debug_assert!(
            !self.is_terminal(),
            "appending a step to a terminal operation"
        );
        self.steps.push(step);
        self.steps.len() - 1
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        debug_assert!(
            !self.is_terminal() || matches!(level, LogLevel::Error),
            "logging to a terminal operation"
        );
        self.logs.push(OperationLogEntry { level, message: message.into() });
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OperationStatus::Done | OperationStatus::Failed)
    }

    /// The opaque structured record persisted for this operation.
    ///
    /// Steps are summarized by name and fan-out; the closures they carry
    /// are rebuilt from intent, never persisted.
    pub fn record(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "cluster_id": self.cluster_id,
            "type": self.op_type,
            "status": self.status,
            "logs": self.logs,
            "steps": self
                .steps
                .iter()
                .map(|step| {
                    json!({
                        "name": step.name,
                        "node_steps": step.node_steps.len(),
                        "finished": step.status.finished.len(),
                        "succeeded": step.status.succeeded.len(),
                        "failed": step.status.failed.len(),
                        "timed_out": step.status.timed_out.len(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;

    #[test]
    fn step_indices_are_dense_and_ordered() {
        let mut op =
            Operation::new(ClusterId::new(), OperationType::CreateCluster);
        for i in 0..4 {
            let index = op.append_step(Step::new(format!("step-{i}")));
            assert_eq!(index, i);
        }
        let names: Vec<_> =
            op.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["step-0", "step-1", "step-2", "step-3"]);
    }

    #[test]
    fn record_summarizes_steps() {
        let mut op =
            Operation::new(ClusterId::new(), OperationType::DeleteCluster);
        op.append_step(Step::new("teardown"));
        op.log(LogLevel::Info, "starting");
        let record = op.record();
        assert_eq!(record["type"], "delete_cluster");
        assert_eq!(record["steps"][0]["name"], "teardown");
    }
}
