// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The step completion state machine.
//!
//! Two orthogonal policy families, each with a reply-handling variant and a
//! timeout-handling variant; a step picks one of each independently.
//!
//! Exactly one reply-processing or timeout-processing call may push a
//! signal into a step's [`CompletionToken`]. Both families guard this with
//! the same accumulate-then-compare-to-fan-out test, which is the core
//! correctness invariant preventing double-signaling and deadlock.
//!
//! Handler invocations for a given step must be serialized by the caller
//! (the executor's event loop does this); the handlers take `&mut`
//! everywhere and do no locking of their own.

use cluster_types::{Cluster, NodeId, NodeReply, ReplyStatus};
use slog::{error, info, warn, Logger};

use crate::dynamic::ReturnData;
use crate::operation::{LogLevel, OperationLogEntry};
use crate::step::Step;

/// How a step resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSignal {
    /// Every node step resolved; under the Abort family this also means
    /// every node succeeded.
    Done,
    /// A required node failed (Abort reply policy only).
    Error,
    /// The timed-out node count reached the abort threshold (Abort timeout
    /// policy only).
    Timeout,
}

/// One-shot completion token for a step.
///
/// The first signal wins; a second delivery attempt is a handler bug and
/// trips a debug assertion.
#[derive(Debug, Default)]
pub struct CompletionToken {
    delivered: Option<StepSignal>,
}

impl CompletionToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&mut self, signal: StepSignal) {
        debug_assert!(
            self.delivered.is_none(),
            "step completion signaled twice: {:?} then {:?}",
            self.delivered,
            signal
        );
        if self.delivered.is_none() {
            self.delivered = Some(signal);
        }
    }

    pub fn signaled(&self) -> Option<StepSignal> {
        self.delivered
    }
}

/// Reply-handling policy for a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// A single failing reply halts the operation without waiting for the
    /// remaining nodes.
    Abort,
    /// Failures are recorded and logged as warnings; the step completes
    /// once every node has replied, regardless of outcome.
    Ignore,
}

/// Timeout-handling policy for a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Losing `abort_when_count` nodes cancels the remainder of the
    /// operation; `abort_when_count: 1` is used when losing even one node
    /// is fatal (e.g. the single control plane during init).
    Abort { abort_when_count: usize },
    /// Timed-out nodes are remembered but never cancel anything.
    Ignore,
}

/// The shared state a completion handler is allowed to mutate, borrowed
/// from the operation and its surroundings for the duration of one handler
/// invocation.
pub struct StepContext<'a> {
    pub logs: &'a mut Vec<OperationLogEntry>,
    pub cluster: &'a mut Cluster,
    pub return_data: &'a mut ReturnData,
    pub token: &'a mut CompletionToken,
    pub log: &'a Logger,
}

impl StepContext<'_> {
    fn audit(&mut self, level: LogLevel, message: String) {
        self.logs.push(OperationLogEntry { level, message });
    }
}

/// Folds one node reply into the step's completion state.
pub fn handle_reply(step: &mut Step, reply: NodeReply, cx: &mut StepContext<'_>) {
    let node = reply.node_id;
    let fan_out = step.node_steps.len();

    // Return data is merged regardless of policy or outcome so later
    // steps' dynamic constructors can see it.
    cx.return_data.merge(reply.return_data);

    match step.reply_policy {
        ReplyPolicy::Abort => match reply.status {
            ReplyStatus::Failure => {
                step.status.mark_failed(node);
                error!(
                    cx.log, "node step failed";
                    "step" => &step.name,
                    "node_id" => %node,
                    "message" => &reply.message,
                );
                cx.audit(
                    LogLevel::Error,
                    format!(
                        "step {:?}: node {node} failed: {}",
                        step.name, reply.message
                    ),
                );
                if let Some(hook) = &mut step.on_failure {
                    (hook.0)(cx.cluster);
                }
                cx.token.signal(StepSignal::Error);
            }
            ReplyStatus::Success => {
                step.status.mark_succeeded(node);
                if step.status.succeeded.len() == fan_out {
                    if let Some(hook) = &mut step.on_all_done {
                        (hook.0)(cx.cluster);
                    }
                    cx.token.signal(StepSignal::Done);
                }
            }
        },
        ReplyPolicy::Ignore => {
            match reply.status {
                ReplyStatus::Failure => {
                    step.status.mark_failed(node);
                    warn!(
                        cx.log, "node step failed (ignored)";
                        "step" => &step.name,
                        "node_id" => %node,
                        "message" => &reply.message,
                    );
                    cx.audit(
                        LogLevel::Warn,
                        format!(
                            "step {:?}: node {node} failed (ignored): {}",
                            step.name, reply.message
                        ),
                    );
                }
                ReplyStatus::Success => {
                    step.status.mark_succeeded(node);
                }
            }
            if step.status.finished.len() == fan_out {
                if let Some(hook) = &mut step.on_all_done {
                    (hook.0)(cx.cluster);
                }
                cx.token.signal(StepSignal::Done);
            }
        }
    }

    debug_assert!(step.is_consistent());
}

/// Folds one per-node timeout into the step's completion state.
pub fn handle_timeout(step: &mut Step, node: NodeId, cx: &mut StepContext<'_>) {
    let fan_out = step.node_steps.len();
    step.status.mark_timed_out(node);

    match step.timeout_policy {
        TimeoutPolicy::Abort { abort_when_count } => {
            error!(
                cx.log, "node step timed out";
                "step" => &step.name,
                "node_id" => %node,
                "timed_out" => step.status.timed_out.len(),
                "abort_when_count" => abort_when_count,
            );
            cx.audit(
                LogLevel::Error,
                format!("step {:?}: node {node} timed out", step.name),
            );
            if step.status.timed_out.len() >= abort_when_count {
                if let Some(hook) = &mut step.on_all_done {
                    (hook.0)(cx.cluster);
                }
                cx.token.signal(StepSignal::Timeout);
            }
        }
        TimeoutPolicy::Ignore => {
            warn!(
                cx.log, "node step timed out (ignored)";
                "step" => &step.name,
                "node_id" => %node,
            );
            cx.audit(
                LogLevel::Warn,
                format!(
                    "step {:?}: node {node} timed out (ignored)",
                    step.name
                ),
            );
            if step.status.finished.len() == fan_out {
                if let Some(hook) = &mut step.on_all_done {
                    (hook.0)(cx.cluster);
                }
                cx.token.signal(StepSignal::Done);
            }
        }
    }

    debug_assert!(step.is_consistent());
    if step.status.finished.len() == fan_out && cx.token.signaled().is_none() {
        info!(
            cx.log, "step fully resolved with unreached abort threshold";
            "step" => &step.name,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::NodeStep;
    use cluster_types::{
        CniConfig, CniKind, Cluster, ClusterId, ClusterRole,
    };
    use std::collections::BTreeMap;

    fn test_cluster() -> Cluster {
        Cluster {
            id: ClusterId::new(),
            name: "test".to_string(),
            kube_version: "1.23.6".to_string(),
            role: ClusterRole::Independent,
            cni: CniConfig {
                kind: CniKind::Calico,
                pod_cidr: "10.244.0.0/16".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                vxlan: false,
            },
            namespaces: Vec::new(),
            plugins: BTreeMap::new(),
            component_status: BTreeMap::new(),
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    struct Harness {
        cluster: Cluster,
        logs: Vec<OperationLogEntry>,
        return_data: ReturnData,
        token: CompletionToken,
        log: Logger,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cluster: test_cluster(),
                logs: Vec::new(),
                return_data: ReturnData::new(),
                token: CompletionToken::new(),
                log: test_logger(),
            }
        }

        fn cx(&mut self) -> StepContext<'_> {
            StepContext {
                logs: &mut self.logs,
                cluster: &mut self.cluster,
                return_data: &mut self.return_data,
                token: &mut self.token,
                log: &self.log,
            }
        }
    }

    fn fan_out_step(policy: ReplyPolicy, nodes: &[NodeId]) -> Step {
        let mut step = Step::new("fan-out").with_reply_policy(policy);
        for &node in nodes {
            step = step.with_node_step(NodeStep::new("work", node));
        }
        step
    }

    #[test]
    fn abort_signals_error_before_all_replies() {
        let nodes = [NodeId::new(), NodeId::new(), NodeId::new()];
        let mut step = fan_out_step(ReplyPolicy::Abort, &nodes);
        let mut harness = Harness::new();

        handle_reply(
            &mut step,
            NodeReply::success(nodes[0]),
            &mut harness.cx(),
        );
        assert_eq!(harness.token.signaled(), None);

        handle_reply(
            &mut step,
            NodeReply::failure(nodes[1], "kubeadm join failed"),
            &mut harness.cx(),
        );
        // Early exit: one node has not replied at all.
        assert_eq!(harness.token.signaled(), Some(StepSignal::Error));
        assert_eq!(step.status.finished.len(), 2);
        assert!(step.status.failed.contains(&nodes[1]));
    }

    #[test]
    fn abort_signals_done_once_every_node_succeeds() {
        let nodes = [NodeId::new(), NodeId::new()];
        let mut step = fan_out_step(ReplyPolicy::Abort, &nodes);
        let mut harness = Harness::new();

        handle_reply(
            &mut step,
            NodeReply::success(nodes[0]),
            &mut harness.cx(),
        );
        assert_eq!(harness.token.signaled(), None);
        handle_reply(
            &mut step,
            NodeReply::success(nodes[1]),
            &mut harness.cx(),
        );
        assert_eq!(harness.token.signaled(), Some(StepSignal::Done));
        assert!(step.status.is_clean());
    }

    #[test]
    fn ignore_completes_iff_every_node_replied_and_never_errors() {
        let nodes = [NodeId::new(), NodeId::new(), NodeId::new()];
        let mut step = fan_out_step(ReplyPolicy::Ignore, &nodes);
        step.timeout_policy = TimeoutPolicy::Ignore;
        let mut harness = Harness::new();

        handle_reply(
            &mut step,
            NodeReply::failure(nodes[0], "already gone"),
            &mut harness.cx(),
        );
        assert_eq!(harness.token.signaled(), None);

        handle_timeout(&mut step, nodes[1], &mut harness.cx());
        assert_eq!(harness.token.signaled(), None);

        handle_reply(
            &mut step,
            NodeReply::success(nodes[2]),
            &mut harness.cx(),
        );
        assert_eq!(harness.token.signaled(), Some(StepSignal::Done));

        // Degraded outcomes stay separately observable.
        assert_eq!(step.status.finished.len(), 3);
        assert_eq!(step.status.succeeded.len(), 1);
        assert_eq!(step.status.failed.len(), 1);
        assert_eq!(step.status.timed_out.len(), 1);
        assert!(!step.status.is_clean());
    }

    #[test]
    fn ignore_merges_return_data_from_failures() {
        let node = NodeId::new();
        let mut step = fan_out_step(ReplyPolicy::Ignore, &[node]);
        let mut harness = Harness::new();

        let reply = NodeReply::failure(node, "partial")
            .with_return_data("0", "captured-anyway");
        handle_reply(&mut step, reply, &mut harness.cx());
        assert_eq!(harness.return_data.get("0"), Some("captured-anyway"));
    }

    #[test]
    fn timeout_abort_threshold() {
        let nodes = [NodeId::new(), NodeId::new(), NodeId::new()];
        let mut step = fan_out_step(ReplyPolicy::Abort, &nodes);
        step.timeout_policy = TimeoutPolicy::Abort { abort_when_count: 2 };
        let mut harness = Harness::new();

        handle_timeout(&mut step, nodes[0], &mut harness.cx());
        assert_eq!(harness.token.signaled(), None);
        handle_timeout(&mut step, nodes[1], &mut harness.cx());
        assert_eq!(harness.token.signaled(), Some(StepSignal::Timeout));
    }

    #[test]
    fn all_done_hook_runs_on_completion() {
        let node = NodeId::new();
        let mut step = fan_out_step(ReplyPolicy::Ignore, &[node])
            .with_on_all_done(Box::new(|cluster: &mut Cluster| {
                cluster.component_status.insert(
                    "storage-provider".to_string(),
                    cluster_types::ComponentStatus::Running,
                );
            }));
        let mut harness = Harness::new();

        handle_reply(&mut step, NodeReply::success(node), &mut harness.cx());
        assert_eq!(
            harness.cluster.component_status.get("storage-provider"),
            Some(&cluster_types::ComponentStatus::Running)
        );
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "signaled twice"))]
    fn token_rejects_second_signal() {
        let mut token = CompletionToken::new();
        token.signal(StepSignal::Done);
        token.signal(StepSignal::Error);
        // Release builds keep the first signal.
        assert_eq!(token.signaled(), Some(StepSignal::Done));
    }
}
