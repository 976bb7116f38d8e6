// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistence port.
//!
//! The engine consumes the backing store only through whole-record
//! accessors: synchronous calls returning a value-or-none plus error,
//! never partial or streamed reads. Operation records are opaque
//! structured data at this boundary.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

use crate::cluster::{Cluster, ClusterId};
use crate::node::{NodeId, NodeInformation};
use crate::plugin::PluginConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),
}

/// Whole-record accessors over the backing key/value store.
pub trait ClusterStore: Send + Sync {
    fn cluster(&self, id: ClusterId) -> Result<Option<Cluster>, StoreError>;
    fn put_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;

    fn node(&self, id: NodeId) -> Result<Option<NodeInformation>, StoreError>;
    fn put_node(&self, node: &NodeInformation) -> Result<(), StoreError>;

    fn plugin_config(
        &self,
        cluster: ClusterId,
        name: &str,
    ) -> Result<Option<PluginConfig>, StoreError>;
    fn put_plugin_config(
        &self,
        cluster: ClusterId,
        config: &PluginConfig,
    ) -> Result<(), StoreError>;

    fn operation_record(
        &self,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, StoreError>;
    fn put_operation_record(
        &self,
        id: Uuid,
        record: serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// In-memory store used by the test suite and local development.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

#[derive(Debug, Default)]
struct MemStoreInner {
    clusters: BTreeMap<ClusterId, Cluster>,
    nodes: BTreeMap<NodeId, NodeInformation>,
    plugins: BTreeMap<(ClusterId, String), PluginConfig>,
    operations: BTreeMap<Uuid, serde_json::Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterStore for MemStore {
    fn cluster(&self, id: ClusterId) -> Result<Option<Cluster>, StoreError> {
        Ok(self.inner.lock().unwrap().clusters.get(&id).cloned())
    }

    fn put_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .clusters
            .insert(cluster.id, cluster.clone());
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<Option<NodeInformation>, StoreError> {
        Ok(self.inner.lock().unwrap().nodes.get(&id).cloned())
    }

    fn put_node(&self, node: &NodeInformation) -> Result<(), StoreError> {
        self.inner.lock().unwrap().nodes.insert(node.id, node.clone());
        Ok(())
    }

    fn plugin_config(
        &self,
        cluster: ClusterId,
        name: &str,
    ) -> Result<Option<PluginConfig>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .plugins
            .get(&(cluster, name.to_string()))
            .cloned())
    }

    fn put_plugin_config(
        &self,
        cluster: ClusterId,
        config: &PluginConfig,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .plugins
            .insert((cluster, config.name.clone()), config.clone());
        Ok(())
    }

    fn operation_record(
        &self,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.inner.lock().unwrap().operations.get(&id).cloned())
    }

    fn put_operation_record(
        &self,
        id: Uuid,
        record: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().operations.insert(id, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_config_round_trip() {
        let store = MemStore::new();
        let cluster = ClusterId::new();
        let config = PluginConfig::new("storage-provider", true);

        assert!(store
            .plugin_config(cluster, "storage-provider")
            .unwrap()
            .is_none());
        store.put_plugin_config(cluster, &config).unwrap();
        let read = store
            .plugin_config(cluster, "storage-provider")
            .unwrap()
            .expect("config was written");
        assert_eq!(read, config);
    }
}
