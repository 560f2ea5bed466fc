// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource manager: per-node capacity and load as reported by raylets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use helios_common::id::NodeID;
use helios_rpc::ResourceLoad;

use crate::cluster_resource_scheduler::{ClusterResourceScheduler, NodeResources};
use crate::table_storage::GcsInitData;
use crate::types::NodeRecord;

/// Callback invoked whenever cluster resources changed.
pub type ResourcesChangedCallback = Box<dyn Fn() + Send + Sync>;

pub struct GcsResourceManager {
    scheduler: Arc<ClusterResourceScheduler>,
    node_resources: RwLock<HashMap<NodeID, ResourceLoad>>,
    resources_changed_listeners: Mutex<Vec<ResourcesChangedCallback>>,
}

impl GcsResourceManager {
    pub fn new(scheduler: Arc<ClusterResourceScheduler>) -> Self {
        Self {
            scheduler,
            node_resources: RwLock::new(HashMap::new()),
            resources_changed_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for record in init_data.nodes.values() {
            if record.is_alive() {
                self.on_node_add(record);
            }
        }
    }

    /// Seed capacity from the node's registration record.
    pub fn on_node_add(&self, record: &NodeRecord) {
        let load = ResourceLoad {
            resources_total: record.resources_total.clone(),
            resources_available: record.resources_total.clone(),
            resource_load: HashMap::new(),
        };
        self.scheduler.add_or_update_node(
            record.node_id,
            NodeResources {
                total: load.resources_total.clone(),
                available: load.resources_available.clone(),
            },
        );
        self.node_resources.write().insert(record.node_id, load);
        self.notify_resources_changed();
    }

    pub fn on_node_dead(&self, node_id: &NodeID) {
        self.node_resources.write().remove(node_id);
        self.scheduler.remove_node(node_id);
        self.notify_resources_changed();
    }

    /// Apply a load report pulled from (or pushed by) a raylet.
    pub fn update_resource_loads(&self, node_id: &NodeID, load: ResourceLoad) {
        self.scheduler.add_or_update_node(
            *node_id,
            NodeResources {
                total: load.resources_total.clone(),
                available: load.resources_available.clone(),
            },
        );
        self.node_resources.write().insert(*node_id, load);
        self.notify_resources_changed();
    }

    pub fn add_resources_changed_listener(&self, callback: ResourcesChangedCallback) {
        self.resources_changed_listeners.lock().push(callback);
    }

    fn notify_resources_changed(&self) {
        for listener in self.resources_changed_listeners.lock().iter() {
            listener();
        }
    }

    pub fn get_all_available_resources(&self) -> HashMap<NodeID, HashMap<String, f64>> {
        self.node_resources
            .read()
            .iter()
            .map(|(id, load)| (*id, load.resources_available.clone()))
            .collect()
    }

    pub fn get_all_total_resources(&self) -> HashMap<NodeID, HashMap<String, f64>> {
        self.node_resources
            .read()
            .iter()
            .map(|(id, load)| (*id, load.resources_total.clone()))
            .collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_resources.read().len()
    }

    pub fn debug_string(&self) -> String {
        format!("GcsResourceManager: {} nodes", self.num_nodes())
    }
}
