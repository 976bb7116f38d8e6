// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps, node steps, and tasks.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use cluster_types::{Cluster, NodeId};
use debug_ignore::DebugIgnore;
use serde::Serialize;
use uuid::Uuid;

use crate::completion::{ReplyPolicy, TimeoutPolicy};
use crate::dynamic::DynamicNodeSteps;

/// Identifier shared by steps and node steps.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One task in a node step's ordered chain.
///
/// The engine does not interpret task semantics; it only orders and tags
/// them. Payloads are rendered by the builders and opaque from here on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    KubectlApply { manifest: String },
    KubectlDelete { target: String },
    ShellCommands { commands: Vec<String> },
    InstallRuntime { version: String },
    DownloadDependency { package: String, version: String },
    WriteTextFile { path: String, content: String },
    RenameHost { hostname: String },
    ConfigureLoadBalancer { endpoints: Vec<String> },
    RestartService { unit: String },
}

/// The unit of work sent to one node: an ordered task chain. Tasks execute
/// strictly in order on the node; a node step belongs to exactly one step
/// and one node.
#[derive(Clone, Debug, Serialize)]
pub struct NodeStep {
    pub id: StepId,
    pub name: String,
    pub node_id: NodeId,
    /// How long the executor waits for this node's reply before treating
    /// the node step as timed out. `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
    pub tasks: Vec<Task>,
}

impl NodeStep {
    pub fn new(name: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            id: StepId::new(),
            name: name.into(),
            node_id,
            reply_timeout: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }
}

/// A hook run inside a completion handler against the shared cluster
/// record (e.g. a liveness probe writing the observed component status).
pub type ClusterHook = Box<dyn FnMut(&mut Cluster) + Send>;

/// Per-node accounting for one step.
///
/// `finished` drives completion for both policy families; `succeeded`,
/// `failed` and `timed_out` keep the degraded outcomes separately
/// observable. `finished` is always a superset of the other three.
#[derive(Debug, Default)]
pub struct StepStatus {
    pub finished: BTreeSet<NodeId>,
    pub succeeded: BTreeSet<NodeId>,
    pub failed: BTreeSet<NodeId>,
    pub timed_out: BTreeSet<NodeId>,
}

impl StepStatus {
    pub fn mark_succeeded(&mut self, node: NodeId) {
        self.succeeded.insert(node);
        self.finished.insert(node);
    }

    pub fn mark_failed(&mut self, node: NodeId) {
        self.failed.insert(node);
        self.finished.insert(node);
    }

    pub fn mark_timed_out(&mut self, node: NodeId) {
        self.timed_out.insert(node);
        self.finished.insert(node);
    }

    /// True once the step finished without any failed or timed-out node.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// One execution barrier: all node steps must reach a terminal per-node
/// outcome before the next step starts.
///
/// A step with no node steps (and no dynamic constructor) is a pure delay
/// barrier. A step owns its node steps exclusively.
#[derive(Debug)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    /// Delay applied before dispatch, used to let a previous asynchronous
    /// action settle.
    pub wait_before_run: Duration,
    pub node_steps: Vec<NodeStep>,
    pub reply_policy: ReplyPolicy,
    pub timeout_policy: TimeoutPolicy,
    /// Run when a node reports failure under the Abort reply policy.
    pub on_failure: Option<DebugIgnore<ClusterHook>>,
    /// Run once the step is about to signal completion.
    pub on_all_done: Option<DebugIgnore<ClusterHook>>,
    /// When set, the node steps are constructed lazily at dispatch time
    /// from data returned by earlier steps; `node_steps` is replaced with
    /// the result.
    pub dynamic: Option<DynamicNodeSteps>,
    /// Downgrades a dynamic construction failure from fatal to a logged
    /// no-op barrier.
    pub ignore_dynamic_error: bool,
    pub status: StepStatus,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: StepId::new(),
            name: name.into(),
            wait_before_run: Duration::ZERO,
            node_steps: Vec::new(),
            reply_policy: ReplyPolicy::Abort,
            timeout_policy: TimeoutPolicy::Abort { abort_when_count: 1 },
            on_failure: None,
            on_all_done: None,
            dynamic: None,
            ignore_dynamic_error: false,
            status: StepStatus::default(),
        }
    }

    /// A step with no node steps, used purely to wait out a settle delay.
    pub fn barrier(name: impl Into<String>, wait: Duration) -> Self {
        let mut step = Self::new(name);
        step.wait_before_run = wait;
        step
    }

    pub fn with_wait_before_run(mut self, wait: Duration) -> Self {
        self.wait_before_run = wait;
        self
    }

    pub fn with_node_step(mut self, node_step: NodeStep) -> Self {
        self.node_steps.push(node_step);
        self
    }

    pub fn with_reply_policy(mut self, policy: ReplyPolicy) -> Self {
        self.reply_policy = policy;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Applies the Ignore families to both reply and timeout handling;
    /// the default for destructive and best-effort steps.
    pub fn best_effort(mut self) -> Self {
        self.reply_policy = ReplyPolicy::Ignore;
        self.timeout_policy = TimeoutPolicy::Ignore;
        self
    }

    pub fn with_on_failure(mut self, hook: ClusterHook) -> Self {
        self.on_failure = Some(DebugIgnore(hook));
        self
    }

    pub fn with_on_all_done(mut self, hook: ClusterHook) -> Self {
        self.on_all_done = Some(DebugIgnore(hook));
        self
    }

    pub fn with_dynamic(mut self, dynamic: DynamicNodeSteps) -> Self {
        self.dynamic = Some(dynamic);
        self
    }

    pub fn ignoring_dynamic_error(mut self) -> Self {
        self.ignore_dynamic_error = true;
        self
    }

    /// Internal consistency check: no more successes than node steps.
    pub fn is_consistent(&self) -> bool {
        self.status.succeeded.len() <= self.node_steps.len()
            && self.status.finished.len() <= self.node_steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_finished_superset() {
        let mut status = StepStatus::default();
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        status.mark_succeeded(a);
        status.mark_failed(b);
        status.mark_timed_out(c);
        assert_eq!(status.finished.len(), 3);
        assert!(status.finished.contains(&a));
        assert!(status.finished.contains(&b));
        assert!(status.finished.contains(&c));
        assert!(!status.is_clean());
    }

    #[test]
    fn barrier_has_no_fan_out() {
        let step = Step::barrier("settle", Duration::from_secs(30));
        assert!(step.node_steps.is_empty());
        assert_eq!(step.wait_before_run, Duration::from_secs(30));
    }
}
