// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors surfaced while driving an operation.

use thiserror::Error;

use crate::dynamic::DynamicStepError;
use crate::executor::TransportError;

/// Why an operation stopped advancing.
///
/// All variants are fatal to the operation: the caller gets the failure for
/// manual remediation or retry-from-start. Tolerated per-node failures
/// (Ignore families) never surface here; they are recorded in the
/// operation's audit log and step status instead.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("step {step:?} failed on node(s) {failed_nodes:?}")]
    StepFailed { step: String, failed_nodes: Vec<String> },

    #[error("step {step:?} timed out on node(s) {timed_out_nodes:?}")]
    StepTimedOut { step: String, timed_out_nodes: Vec<String> },

    #[error("dynamic node step construction failed for step {step:?}")]
    DynamicStep {
        step: String,
        #[source]
        source: DynamicStepError,
    },

    #[error("failed to submit step {step:?} to the transport")]
    Transport {
        step: String,
        #[source]
        source: TransportError,
    },

    #[error("reply channel closed while step {step:?} was outstanding")]
    RepliesClosed { step: String },
}
