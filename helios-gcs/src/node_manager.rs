// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node manager: the authoritative alive/dead node set.
//!
//! Registered listeners observe node additions and removals synchronously,
//! in registration order, on the thread that produced the event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use helios_common::id::{ClusterID, NodeID};
use helios_common::status::HeliosResult;

use crate::pubsub::{GcsPublisher, PubChannel, PubMessage};
use crate::table_storage::{GcsInitData, GcsTableStorage};
use crate::types::{NodeRecord, NodeState};

/// Callback invoked on node addition or removal.
pub type NodeEventCallback = Box<dyn Fn(&NodeRecord) + Send + Sync>;

pub struct GcsNodeManager {
    alive_nodes: RwLock<HashMap<NodeID, Arc<NodeRecord>>>,
    /// Dead nodes are cached for queries.
    dead_nodes: RwLock<HashMap<NodeID, Arc<NodeRecord>>>,
    /// node_id -> drain deadline (ms since epoch).
    draining_nodes: RwLock<HashMap<NodeID, i64>>,
    cluster_id: RwLock<Option<ClusterID>>,
    node_added_listeners: RwLock<Vec<NodeEventCallback>>,
    node_removed_listeners: RwLock<Vec<NodeEventCallback>>,
    table_storage: Arc<GcsTableStorage>,
    publisher: Arc<GcsPublisher>,
}

impl GcsNodeManager {
    pub fn new(table_storage: Arc<GcsTableStorage>, publisher: Arc<GcsPublisher>) -> Self {
        Self {
            alive_nodes: RwLock::new(HashMap::new()),
            dead_nodes: RwLock::new(HashMap::new()),
            draining_nodes: RwLock::new(HashMap::new()),
            cluster_id: RwLock::new(None),
            node_added_listeners: RwLock::new(Vec::new()),
            node_removed_listeners: RwLock::new(Vec::new()),
            table_storage,
            publisher,
        }
    }

    /// Seed the alive/dead sets from the persisted snapshot. Listeners are
    /// not invoked for preexisting nodes.
    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut alive = self.alive_nodes.write();
        let mut dead = self.dead_nodes.write();
        for (node_id, record) in &init_data.nodes {
            let record = Arc::new(record.clone());
            if record.is_alive() {
                alive.insert(*node_id, record);
            } else {
                dead.insert(*node_id, record);
            }
        }
    }

    pub fn set_cluster_id(&self, cluster_id: ClusterID) {
        *self.cluster_id.write() = Some(cluster_id);
    }

    pub fn cluster_id(&self) -> Option<ClusterID> {
        *self.cluster_id.read()
    }

    fn publish_node_state(&self, record: &NodeRecord) {
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode node record for publish");
                return;
            }
        };
        self.publisher.publish(PubMessage {
            channel: PubChannel::NodeInfo,
            key: record.node_id.binary(),
            payload,
        });
    }

    /// Handle a node registration.
    pub async fn register_node(&self, mut record: NodeRecord) -> HeliosResult<()> {
        record.state = NodeState::Alive;
        let node_id = record.node_id;

        self.table_storage
            .node_table()
            .put(&node_id.hex(), &record)
            .await?;

        let record = Arc::new(record);
        self.alive_nodes.write().insert(node_id, record.clone());

        self.publish_node_state(&record);

        for listener in self.node_added_listeners.read().iter() {
            listener(&record);
        }

        tracing::info!(%node_id, "Node registered");
        Ok(())
    }

    /// Graceful unregistration.
    pub async fn unregister_node(&self, node_id: &NodeID) -> HeliosResult<()> {
        self.remove_node(node_id).await
    }

    /// Invoked (via the default reactor) when the health checker declares
    /// the node dead.
    pub async fn on_node_failure(&self, node_id: &NodeID) -> HeliosResult<()> {
        self.remove_node(node_id).await
    }

    async fn remove_node(&self, node_id: &NodeID) -> HeliosResult<()> {
        let Some(record) = self.alive_nodes.write().remove(node_id) else {
            return Ok(());
        };

        let mut dead_record = (*record).clone();
        dead_record.state = NodeState::Dead;
        dead_record.end_time_ms = helios_util::time::current_time_ms();

        if let Err(e) = self
            .table_storage
            .node_table()
            .put(&node_id.hex(), &dead_record)
            .await
        {
            tracing::warn!(%node_id, error = %e, "Failed to persist dead node state");
        }

        let dead_record = Arc::new(dead_record);
        self.dead_nodes.write().insert(*node_id, dead_record.clone());
        self.draining_nodes.write().remove(node_id);

        self.publish_node_state(&dead_record);

        for listener in self.node_removed_listeners.read().iter() {
            listener(&dead_record);
        }

        tracing::info!(%node_id, "Node removed");
        Ok(())
    }

    /// Mark an alive node as draining until `deadline_ms`.
    pub fn drain_node(&self, node_id: &NodeID, deadline_ms: i64) {
        if self.alive_nodes.read().contains_key(node_id) {
            self.draining_nodes.write().insert(*node_id, deadline_ms);
            tracing::info!(%node_id, deadline_ms, "Node draining");
        }
    }

    pub fn get_all_node_info(&self) -> Vec<NodeRecord> {
        let alive = self.alive_nodes.read();
        let dead = self.dead_nodes.read();
        alive
            .values()
            .chain(dead.values())
            .map(|n| (**n).clone())
            .collect()
    }

    pub fn is_node_alive(&self, node_id: &NodeID) -> bool {
        self.alive_nodes.read().contains_key(node_id)
    }

    pub fn is_node_dead(&self, node_id: &NodeID) -> bool {
        self.dead_nodes.read().contains_key(node_id)
    }

    pub fn get_alive_node(&self, node_id: &NodeID) -> Option<Arc<NodeRecord>> {
        self.alive_nodes.read().get(node_id).cloned()
    }

    pub fn get_all_alive_nodes(&self) -> HashMap<NodeID, Arc<NodeRecord>> {
        self.alive_nodes.read().clone()
    }

    pub fn get_draining_nodes(&self) -> HashMap<NodeID, i64> {
        self.draining_nodes.read().clone()
    }

    pub fn num_alive_nodes(&self) -> usize {
        self.alive_nodes.read().len()
    }

    pub fn add_node_added_listener(&self, callback: NodeEventCallback) {
        self.node_added_listeners.write().push(callback);
    }

    pub fn add_node_removed_listener(&self, callback: NodeEventCallback) {
        self.node_removed_listeners.write().push(callback);
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsNodeManager: {} alive, {} dead, {} draining",
            self.num_alive_nodes(),
            self.dead_nodes.read().len(),
            self.draining_nodes.read().len()
        )
    }
}
