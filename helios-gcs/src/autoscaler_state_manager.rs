// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Autoscaler state manager: maintains the cluster view the autoscaler
//! polls. Scaling policy itself is an external collaborator.

use std::collections::HashMap;

use parking_lot::RwLock;

use helios_common::id::NodeID;
use helios_rpc::ResourceLoad;

use crate::table_storage::GcsInitData;
use crate::types::NodeRecord;

#[derive(Debug, Clone, Default)]
pub struct AutoscalerNodeView {
    pub resources_total: HashMap<String, f64>,
    pub resources_available: HashMap<String, f64>,
    pub resource_load: HashMap<String, f64>,
}

pub struct GcsAutoscalerStateManager {
    session_name: String,
    node_views: RwLock<HashMap<NodeID, AutoscalerNodeView>>,
}

impl GcsAutoscalerStateManager {
    pub fn new(session_name: String) -> Self {
        Self {
            session_name,
            node_views: RwLock::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for record in init_data.nodes.values() {
            if record.is_alive() {
                self.on_node_add(record);
            }
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn on_node_add(&self, record: &NodeRecord) {
        self.node_views.write().insert(
            record.node_id,
            AutoscalerNodeView {
                resources_total: record.resources_total.clone(),
                resources_available: record.resources_total.clone(),
                resource_load: HashMap::new(),
            },
        );
    }

    pub fn on_node_dead(&self, node_id: &NodeID) {
        self.node_views.write().remove(node_id);
    }

    pub fn update_resource_load_and_usage(&self, node_id: &NodeID, load: ResourceLoad) {
        let mut views = self.node_views.write();
        if let Some(view) = views.get_mut(node_id) {
            view.resources_total = load.resources_total;
            view.resources_available = load.resources_available;
            view.resource_load = load.resource_load;
        }
    }

    /// Aggregate demand across the cluster, for scale-up decisions.
    pub fn get_cluster_resource_state(&self) -> HashMap<String, f64> {
        let mut demand: HashMap<String, f64> = HashMap::new();
        for view in self.node_views.read().values() {
            for (resource, amount) in &view.resource_load {
                *demand.entry(resource.clone()).or_default() += amount;
            }
        }
        demand
    }

    pub fn num_nodes(&self) -> usize {
        self.node_views.read().len()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsAutoscalerStateManager: session {}, {} nodes",
            self.session_name,
            self.num_nodes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeState;

    fn node_id(v: u8) -> NodeID {
        let mut data = [0u8; 28];
        data[0] = v;
        NodeID::from_binary(&data)
    }

    fn make_record(v: u8) -> NodeRecord {
        NodeRecord {
            node_id: node_id(v),
            node_name: format!("node-{v}"),
            state: NodeState::Alive,
            node_manager_address: "127.0.0.1".to_string(),
            node_manager_port: 9000,
            resources_total: HashMap::from([("CPU".to_string(), 4.0)]),
            start_time_ms: 0,
            end_time_ms: 0,
        }
    }

    #[test]
    fn test_view_follows_node_lifecycle() {
        let mgr = GcsAutoscalerStateManager::new("session".to_string());
        mgr.on_node_add(&make_record(1));
        assert_eq!(mgr.num_nodes(), 1);
        mgr.on_node_dead(&node_id(1));
        assert_eq!(mgr.num_nodes(), 0);
    }

    #[test]
    fn test_cluster_demand_aggregates_load() {
        let mgr = GcsAutoscalerStateManager::new("session".to_string());
        mgr.on_node_add(&make_record(1));
        mgr.on_node_add(&make_record(2));

        for v in [1u8, 2] {
            mgr.update_resource_load_and_usage(
                &node_id(v),
                ResourceLoad {
                    resources_total: HashMap::from([("CPU".to_string(), 4.0)]),
                    resources_available: HashMap::new(),
                    resource_load: HashMap::from([("CPU".to_string(), 3.0)]),
                },
            );
        }

        let demand = mgr.get_cluster_resource_state();
        assert_eq!(demand.get("CPU"), Some(&6.0));
    }

    #[test]
    fn test_load_for_unknown_node_is_ignored() {
        let mgr = GcsAutoscalerStateManager::new("session".to_string());
        mgr.update_resource_load_and_usage(&node_id(9), ResourceLoad::default());
        assert_eq!(mgr.num_nodes(), 0);
    }
}
