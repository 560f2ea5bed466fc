// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cluster-wide resource view consulted when dispatching pending work.
//! The placement algorithms themselves are external collaborators.

use std::collections::HashMap;

use parking_lot::RwLock;

use helios_common::id::NodeID;

#[derive(Debug, Clone, Default)]
pub struct NodeResources {
    pub total: HashMap<String, f64>,
    pub available: HashMap<String, f64>,
}

pub struct ClusterResourceScheduler {
    /// The control plane's own scheduling identity.
    local_node_id: NodeID,
    nodes: RwLock<HashMap<NodeID, NodeResources>>,
}

impl ClusterResourceScheduler {
    pub fn new(local_node_id: NodeID) -> Self {
        Self {
            local_node_id,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_node_id(&self) -> NodeID {
        self.local_node_id
    }

    pub fn add_or_update_node(&self, node_id: NodeID, resources: NodeResources) {
        self.nodes.write().insert(node_id, resources);
    }

    pub fn remove_node(&self, node_id: &NodeID) {
        self.nodes.write().remove(node_id);
    }

    /// Whether any node can currently fit the demand.
    pub fn is_schedulable(&self, demand: &HashMap<String, f64>) -> bool {
        let nodes = self.nodes.read();
        nodes.values().any(|resources| {
            demand
                .iter()
                .all(|(name, amount)| resources.available.get(name).copied().unwrap_or(0.0) >= *amount)
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len()
    }
}
