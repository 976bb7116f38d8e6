// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operation plan model and its execution control.
//!
//! An [`Operation`] is one requested change to one cluster, expressed as an
//! ordered sequence of [`Step`]s. Each step fans a set of [`NodeStep`]s out
//! to remote node agents and acts as a barrier: every node step must reach a
//! terminal per-node outcome before the next step is built or dispatched.
//!
//! Partial failure is governed by two interchangeable policy families
//! ([`ReplyPolicy`], [`TimeoutPolicy`]): the Abort family halts the
//! operation on the first failing or timed-out node, the Ignore family
//! records the misbehavior and proceeds once every node has resolved.
//!
//! A step may defer the construction of its node steps until dispatch time
//! ([`DynamicNodeSteps`]), reading data returned by any earlier step from
//! the operation's accumulated [`ReturnData`].
//!
//! The [`PlanExecutor`] owns the serialized event loop that dispatches node
//! steps through a [`Transport`] and folds replies and per-node deadlines
//! into step completion. Reply and timeout delivery for a given step is
//! serialized by that loop, which is what lets the completion handlers
//! mutate shared state without locking.

mod completion;
mod dynamic;
mod errors;
mod executor;
mod operation;
mod step;

pub use completion::{
    handle_reply, handle_timeout, CompletionToken, ReplyPolicy, StepContext,
    StepSignal, TimeoutPolicy,
};
pub use dynamic::{DynamicNodeSteps, DynamicStepError, ReturnData};
pub use errors::ExecutionError;
pub use executor::{PlanExecutor, Transport, TransportError};
pub use operation::{
    LogLevel, Operation, OperationId, OperationLogEntry, OperationStatus,
    OperationType,
};
pub use step::{ClusterHook, NodeStep, Step, StepId, StepStatus, Task};
