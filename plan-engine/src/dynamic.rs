// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lazily constructed node steps and the cross-step return data they read.

use std::collections::BTreeMap;

use cluster_types::Cluster;
use debug_ignore::DebugIgnore;
use thiserror::Error;

use crate::operation::Operation;
use crate::step::NodeStep;

/// Key/value outputs accumulated from every reply processed so far.
///
/// Replies merge their `return_data` maps in as they arrive (later writes
/// win); dynamic node-step constructors read it. Because a step is fully
/// resolved before the next one is built, a constructor sees the data of
/// every earlier step.
#[derive(Clone, Debug, Default)]
pub struct ReturnData(BTreeMap<String, String>);

impl ReturnData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Reads a key a dynamic constructor requires, failing with
    /// [`DynamicStepError::MissingPrerequisite`] when the upstream step
    /// never published it.
    pub fn require(&self, key: &str) -> Result<&str, DynamicStepError> {
        self.get(key).ok_or_else(|| DynamicStepError::MissingPrerequisite {
            key: key.to_string(),
        })
    }

    pub fn merge(&mut self, data: BTreeMap<String, String>) {
        self.0.extend(data);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Failure while constructing a step's node steps at dispatch time.
#[derive(Clone, Debug, Error)]
pub enum DynamicStepError {
    #[error("missing prerequisite data: key {key:?} was never published")]
    MissingPrerequisite { key: String },
    #[error("node step construction failed: {0}")]
    Construction(String),
}

type DynamicFn = dyn Fn(&ReturnData, &Cluster, &Operation) -> Result<Vec<NodeStep>, DynamicStepError>
    + Send
    + Sync;

/// A pure function evaluated at dispatch time to build a step's node steps
/// from data already returned by earlier steps.
///
/// Inputs are explicit (no captured mutable state) so constructors stay
/// testable in isolation.
pub struct DynamicNodeSteps {
    f: DebugIgnore<Box<DynamicFn>>,
}

impl std::fmt::Debug for DynamicNodeSteps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicNodeSteps").finish()
    }
}

impl DynamicNodeSteps {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(
                &ReturnData,
                &Cluster,
                &Operation,
            ) -> Result<Vec<NodeStep>, DynamicStepError>
            + Send
            + Sync
            + 'static,
    {
        Self { f: DebugIgnore(Box::new(f)) }
    }

    pub fn evaluate(
        &self,
        return_data: &ReturnData,
        cluster: &Cluster,
        operation: &Operation,
    ) -> Result<Vec<NodeStep>, DynamicStepError> {
        (self.f)(return_data, cluster, operation)
    }
}
