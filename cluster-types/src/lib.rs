// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared record types and ports for the cluster orchestration engine.
//!
//! This crate holds the data that crosses subsystem boundaries: the cluster
//! and node records, the addon plugin contract and its dependency
//! validation, the reply contract remote agents honor, and the persistence
//! port the engine reads and writes whole records through.
//!
//! Nothing in here performs I/O; the engine and the builders consume these
//! types and the ports are implemented elsewhere.

mod cluster;
mod node;
mod plugin;
mod reply;
mod store;

pub use cluster::{
    CniConfig, CniKind, Cluster, ClusterId, ClusterRole, ComponentStatus,
    NamespaceSpec,
};
pub use node::{NodeId, NodeInformation, NodeRole, OsKind};
pub use plugin::{
    check_dependencies, DependencyCheckError, LicenseMask, Pluggable,
    PluginConfig, PluginStatus,
};
pub use reply::{NodeReply, ReplyStatus};
pub use store::{ClusterStore, MemStore, StoreError};
