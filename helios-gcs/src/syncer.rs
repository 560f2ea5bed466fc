// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cluster state synchronization endpoint.
//!
//! The bidirectional streaming transport is an external collaborator. This
//! module owns what the core exchanges with it: versioned sync messages,
//! the broadcast entry point (used for the global-GC command), and the
//! liveness side-channel: any message received from a node proves that
//! node was recently alive, which the health checker consumes.

use std::collections::HashMap;

use parking_lot::Mutex;

use helios_common::id::NodeID;
use helios_common::reactor::Reactor;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SyncPayload {
    ResourceView {
        resources_total: HashMap<String, f64>,
        resources_available: HashMap<String, f64>,
    },
    Commands {
        should_global_gc: bool,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncMessage {
    /// Monotonic per-sender version; stale versions are dropped.
    pub version: i64,
    pub node_id: NodeID,
    pub payload: SyncPayload,
}

/// Callback invoked with the sender's id whenever a sync message arrives.
pub type NodeActivityCallback = Box<dyn Fn(NodeID) + Send + Sync>;

pub struct GcsSyncer {
    reactor: Reactor,
    on_node_activity: NodeActivityCallback,
    /// Latest received version per sender, for stale-drop.
    peer_versions: Mutex<HashMap<NodeID, i64>>,
    /// Messages broadcast to the cluster, newest last.
    broadcast_log: Mutex<Vec<SyncMessage>>,
}

impl GcsSyncer {
    pub fn new(reactor: Reactor, on_node_activity: NodeActivityCallback) -> Self {
        Self {
            reactor,
            on_node_activity,
            peer_versions: Mutex::new(HashMap::new()),
            broadcast_log: Mutex::new(Vec::new()),
        }
    }

    /// Accept a message from a node. Returns whether it was fresh. Either
    /// way the sender demonstrably lives, so the activity callback fires.
    pub fn receive_message(&self, message: SyncMessage) -> bool {
        (self.on_node_activity)(message.node_id);

        let mut versions = self.peer_versions.lock();
        let entry = versions.entry(message.node_id).or_insert(i64::MIN);
        if message.version <= *entry {
            tracing::debug!(node_id = %message.node_id, version = message.version, "Dropping stale sync message");
            return false;
        }
        *entry = message.version;
        true
    }

    /// Queue a message for delivery to every connected node.
    pub fn broadcast_message(&self, message: SyncMessage) {
        self.broadcast_log.lock().push(message.clone());
        self.reactor.post("GcsSyncer.broadcast", move || {
            tracing::debug!(node_id = %message.node_id, "Broadcasting sync message");
        });
    }

    pub fn last_broadcast(&self) -> Option<SyncMessage> {
        self.broadcast_log.lock().last().cloned()
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcast_log.lock().len()
    }

    pub fn forget_peer(&self, node_id: &NodeID) {
        self.peer_versions.lock().remove(node_id);
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsSyncer: {} peers, {} broadcasts",
            self.peer_versions.lock().len(),
            self.broadcast_count()
        )
    }
}
