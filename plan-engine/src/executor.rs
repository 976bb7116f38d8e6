// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The serialized event loop that drives an operation's steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_types::{Cluster, NodeId, NodeReply};
use futures::future::BoxFuture;
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};

use crate::completion::{
    handle_reply, handle_timeout, CompletionToken, StepContext, StepSignal,
};
use crate::dynamic::ReturnData;
use crate::errors::ExecutionError;
use crate::operation::{
    LogLevel, Operation, OperationId, OperationStatus,
};
use crate::step::{NodeStep, StepId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rejected node step: {0}")]
    Rejected(String),
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
}

/// The message-bus seam: submits one node step's task chain to the node's
/// agent. The matching reply arrives later on the executor's reply
/// receiver; submission itself only confirms hand-off.
pub trait Transport: Send + Sync {
    fn submit(
        &self,
        operation: OperationId,
        step: StepId,
        node_step: NodeStep,
    ) -> BoxFuture<'_, Result<(), TransportError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn submit(
        &self,
        operation: OperationId,
        step: StepId,
        node_step: NodeStep,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        (**self).submit(operation, step, node_step)
    }
}

/// Drives one operation's steps strictly in order.
///
/// All reply and timeout delivery funnels through this loop, which is what
/// discharges the serialization contract the completion handlers rely on:
/// at most one handler invocation is active per step at any time.
pub struct PlanExecutor<T> {
    transport: T,
    replies: mpsc::Receiver<NodeReply>,
    log: Logger,
}

impl<T: Transport> PlanExecutor<T> {
    pub fn new(
        transport: T,
        replies: mpsc::Receiver<NodeReply>,
        log: &Logger,
    ) -> Self {
        Self {
            transport,
            replies,
            log: log.new(o!("component" => "PlanExecutor")),
        }
    }

    /// Executes the operation to completion or to its first fatal step.
    ///
    /// On success the operation is `Done` and the accumulated cross-step
    /// return data is handed back; on failure the operation is `Failed`
    /// with the halting step recorded in its audit log.
    pub async fn run(
        mut self,
        operation: &mut Operation,
        cluster: &mut Cluster,
    ) -> Result<ReturnData, ExecutionError> {
        let log = self.log.new(o!("operation_id" => operation.id.to_string()));
        operation.status = OperationStatus::Running;
        operation.log(
            LogLevel::Info,
            format!("operation {} ({:?}) started", operation.id, operation.op_type),
        );
        let mut return_data = ReturnData::new();

        for index in 0..operation.steps.len() {
            let wait = operation.steps[index].wait_before_run;
            if wait > Duration::ZERO {
                info!(
                    log, "waiting before dispatch";
                    "step" => &operation.steps[index].name,
                    "wait_ms" => wait.as_millis() as u64,
                );
                sleep(wait).await;
            }

            // Dynamic steps are constructed here, after every earlier step
            // has fully resolved, so they may read any earlier step's
            // return data.
            let dynamic_result = match &operation.steps[index].dynamic {
                Some(dynamic) => {
                    Some(dynamic.evaluate(&return_data, cluster, operation))
                }
                None => None,
            };
            match dynamic_result {
                None => {}
                Some(Ok(node_steps)) => {
                    let step = &mut operation.steps[index];
                    info!(
                        log, "dynamic node steps constructed";
                        "step" => &step.name,
                        "count" => node_steps.len(),
                    );
                    step.node_steps = node_steps;
                }
                Some(Err(source)) => {
                    let name = operation.steps[index].name.clone();
                    if operation.steps[index].ignore_dynamic_error {
                        warn!(
                            log, "dynamic construction failed; step becomes a no-op";
                            "step" => &name,
                            "error" => %source,
                        );
                        operation.log(
                            LogLevel::Warn,
                            format!(
                                "step {name:?}: node step construction failed, \
                                 skipping: {source}"
                            ),
                        );
                        operation.steps[index].node_steps.clear();
                    } else {
                        error!(
                            log, "dynamic construction failed";
                            "step" => &name,
                            "error" => %source,
                        );
                        operation.log(
                            LogLevel::Error,
                            format!(
                                "step {name:?}: node step construction \
                                 failed: {source}"
                            ),
                        );
                        operation.status = OperationStatus::Failed;
                        return Err(ExecutionError::DynamicStep {
                            step: name,
                            source,
                        });
                    }
                }
            }

            if operation.steps[index].node_steps.is_empty() {
                debug!(
                    log, "barrier step resolved";
                    "step" => &operation.steps[index].name,
                );
                continue;
            }

            let (step_id, step_name, to_submit) = {
                let step = &operation.steps[index];
                (step.id, step.name.clone(), step.node_steps.clone())
            };
            for node_step in to_submit {
                let node_id = node_step.node_id;
                if let Err(source) =
                    self.transport.submit(operation.id, step_id, node_step).await
                {
                    operation.log(
                        LogLevel::Error,
                        format!(
                            "step {step_name:?}: submitting work for node \
                             {node_id} failed: {source}"
                        ),
                    );
                    operation.status = OperationStatus::Failed;
                    return Err(ExecutionError::Transport {
                        step: step_name,
                        source,
                    });
                }
            }

            let signal = self
                .drive_step(operation, index, cluster, &mut return_data)
                .await?;
            match signal {
                StepSignal::Done => {
                    info!(log, "step resolved"; "step" => &step_name);
                }
                StepSignal::Error => {
                    let failed_nodes: Vec<String> = operation.steps[index]
                        .status
                        .failed
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                    operation.status = OperationStatus::Failed;
                    operation.log(
                        LogLevel::Error,
                        format!("operation halted at step {step_name:?}"),
                    );
                    return Err(ExecutionError::StepFailed {
                        step: step_name,
                        failed_nodes,
                    });
                }
                StepSignal::Timeout => {
                    let timed_out_nodes: Vec<String> = operation.steps[index]
                        .status
                        .timed_out
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                    operation.status = OperationStatus::Failed;
                    operation.log(
                        LogLevel::Error,
                        format!(
                            "operation halted at step {step_name:?} (timeout)"
                        ),
                    );
                    return Err(ExecutionError::StepTimedOut {
                        step: step_name,
                        timed_out_nodes,
                    });
                }
            }
        }

        operation.log(LogLevel::Info, "operation complete");
        operation.status = OperationStatus::Done;
        info!(log, "operation complete");
        Ok(return_data)
    }

    /// Waits out one dispatched step: races the reply receiver against the
    /// earliest outstanding per-node deadline and folds each event into the
    /// step's completion state until the token fires.
    async fn drive_step(
        &mut self,
        operation: &mut Operation,
        index: usize,
        cluster: &mut Cluster,
        return_data: &mut ReturnData,
    ) -> Result<StepSignal, ExecutionError> {
        let Operation { steps, logs, .. } = operation;
        let step = &mut steps[index];

        let mut outstanding: BTreeMap<NodeId, Option<Instant>> = step
            .node_steps
            .iter()
            .map(|ns| {
                (ns.node_id, ns.reply_timeout.map(|t| Instant::now() + t))
            })
            .collect();
        let mut token = CompletionToken::new();

        enum Wake {
            Reply(Option<NodeReply>),
            Deadline,
        }

        loop {
            let next_deadline = outstanding.values().filter_map(|d| *d).min();
            let wake = match next_deadline {
                Some(deadline) => tokio::select! {
                    reply = self.replies.recv() => Wake::Reply(reply),
                    _ = sleep_until(deadline) => Wake::Deadline,
                },
                None => Wake::Reply(self.replies.recv().await),
            };

            match wake {
                Wake::Reply(None) => {
                    return Err(ExecutionError::RepliesClosed {
                        step: step.name.clone(),
                    });
                }
                Wake::Reply(Some(reply)) => {
                    // A late reply from an earlier step, or a duplicate,
                    // must not corrupt this step's accounting.
                    if outstanding.remove(&reply.node_id).is_none() {
                        debug!(
                            self.log, "dropping reply for node not outstanding";
                            "step" => &step.name,
                            "node_id" => %reply.node_id,
                        );
                        continue;
                    }
                    let mut cx = StepContext {
                        logs,
                        cluster,
                        return_data,
                        token: &mut token,
                        log: &self.log,
                    };
                    handle_reply(step, reply, &mut cx);
                }
                Wake::Deadline => {
                    let now = Instant::now();
                    let expired: Vec<NodeId> = outstanding
                        .iter()
                        .filter_map(|(node, deadline)| match deadline {
                            Some(d) if *d <= now => Some(*node),
                            _ => None,
                        })
                        .collect();
                    for node in expired {
                        outstanding.remove(&node);
                        let mut cx = StepContext {
                            logs,
                            cluster,
                            return_data,
                            token: &mut token,
                            log: &self.log,
                        };
                        handle_timeout(step, node, &mut cx);
                        if token.signaled().is_some() {
                            break;
                        }
                    }
                }
            }

            if let Some(signal) = token.signaled() {
                return Ok(signal);
            }
            // Every node resolved without a signal: only reachable when
            // timed-out nodes stayed below the Abort threshold while the
            // rest succeeded. A required node is still gone, which is
            // fatal under the Abort family.
            if outstanding.is_empty() {
                return Ok(StepSignal::Timeout);
            }
        }
    }
}
