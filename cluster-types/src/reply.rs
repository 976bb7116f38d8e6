// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reply contract remote node agents honor.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Terminal per-node outcome of one node step.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Failure,
}

/// What the transport delivers back once a node step finishes on a node.
///
/// `return_data` carries captured task output keyed by the task's index
/// within the node step, stringified (key `"0"` is the first task's
/// output). Later steps may read it through the operation's accumulated
/// return data.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NodeReply {
    pub node_id: NodeId,
    pub status: ReplyStatus,
    pub return_data: BTreeMap<String, String>,
    pub message: String,
}

impl NodeReply {
    pub fn success(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: ReplyStatus::Success,
            return_data: BTreeMap::new(),
            message: String::new(),
        }
    }

    pub fn failure(node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            node_id,
            status: ReplyStatus::Failure,
            return_data: BTreeMap::new(),
            message: message.into(),
        }
    }

    pub fn with_return_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.return_data.insert(key.into(), value.into());
        self
    }
}
