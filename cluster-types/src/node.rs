// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node records.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one node record.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roles a node may take inside the cluster. A node carrying both roles is
/// processed once for node-scoped work and untainted after joining so it
/// can also run workloads.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

/// Operating system family reported by the node agent, as far as the
/// builders care about it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Ubuntu,
    Centos,
    Other,
}

/// One node record as read from the store.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NodeInformation {
    pub id: NodeId,
    pub hostname: String,
    pub address: IpAddr,
    pub roles: BTreeSet<NodeRole>,
    pub os: OsKind,
    /// When set, the create plan renames the host to `hostname` before any
    /// other work on the node.
    pub rename_host: bool,
}

impl NodeInformation {
    pub fn is_control_plane(&self) -> bool {
        self.roles.contains(&NodeRole::ControlPlane)
    }

    pub fn is_worker(&self) -> bool {
        self.roles.contains(&NodeRole::Worker)
    }

    pub fn is_dual_role(&self) -> bool {
        self.is_control_plane() && self.is_worker()
    }
}
