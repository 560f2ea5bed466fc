// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement group manager: group lifecycle, pending-group retries, and
//! bundle bookkeeping. The bundle-packing algorithms are external
//! collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use helios_common::id::{ActorID, BundleID, JobID, NodeID, PlacementGroupID};
use helios_common::status::HeliosResult;

use crate::node_manager::GcsNodeManager;
use crate::table_storage::{GcsInitData, GcsTableStorage};
use crate::types::{PlacementGroupRecord, PlacementGroupState};
use crate::usage_stats::UsageStatsClient;

pub struct GcsPlacementGroupManager {
    registered_groups: RwLock<HashMap<PlacementGroupID, PlacementGroupRecord>>,
    pending_groups: Mutex<VecDeque<PlacementGroupID>>,
    /// Bundles whose resources wait to be returned after removal.
    waiting_removed_bundles: Mutex<Vec<BundleID>>,
    node_manager: Arc<GcsNodeManager>,
    table_storage: Arc<GcsTableStorage>,
    usage_stats_client: Mutex<Option<Arc<UsageStatsClient>>>,
}

impl GcsPlacementGroupManager {
    pub fn new(table_storage: Arc<GcsTableStorage>, node_manager: Arc<GcsNodeManager>) -> Self {
        Self {
            registered_groups: RwLock::new(HashMap::new()),
            pending_groups: Mutex::new(VecDeque::new()),
            waiting_removed_bundles: Mutex::new(Vec::new()),
            node_manager,
            table_storage,
            usage_stats_client: Mutex::new(None),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut pending = self.pending_groups.lock();
        let mut registered = self.registered_groups.write();
        for (group_id, record) in &init_data.placement_groups {
            match record.state {
                PlacementGroupState::Pending | PlacementGroupState::Rescheduling => {
                    pending.push_back(*group_id)
                }
                _ => {}
            }
            registered.insert(*group_id, record.clone());
        }
    }

    pub fn set_usage_stats_client(&self, client: Arc<UsageStatsClient>) {
        *self.usage_stats_client.lock() = Some(client);
    }

    pub async fn register_placement_group(
        &self,
        mut record: PlacementGroupRecord,
    ) -> HeliosResult<()> {
        record.state = PlacementGroupState::Pending;
        let group_id = record.placement_group_id;

        self.table_storage
            .placement_group_table()
            .put(&group_id.hex(), &record)
            .await?;
        self.registered_groups.write().insert(group_id, record);
        self.pending_groups.lock().push_back(group_id);

        tracing::info!(%group_id, "Placement group registered");
        Ok(())
    }

    /// Place pending groups on alive nodes. Invoked when capacity appears.
    pub fn schedule_pending_placement_groups(&self) {
        let alive_nodes: Vec<NodeID> = self
            .node_manager
            .get_all_alive_nodes()
            .keys()
            .copied()
            .collect();
        if alive_nodes.is_empty() {
            return;
        }

        let mut pending = self.pending_groups.lock();
        let mut registered = self.registered_groups.write();
        let mut placed = 0usize;
        while let Some(group_id) = pending.pop_front() {
            if let Some(record) = registered.get_mut(&group_id) {
                record.state = PlacementGroupState::Created;
                record.bundle_nodes = vec![alive_nodes[placed % alive_nodes.len()]];
                placed += 1;
            }
        }
        if placed > 0 {
            tracing::info!(placed, "Scheduled pending placement groups");
        }
    }

    /// Alias used by the node-added event wiring.
    pub fn on_node_add(&self, _node_id: &NodeID) {
        self.schedule_pending_placement_groups();
    }

    /// Groups with bundles on the dead node go back to rescheduling.
    pub fn on_node_dead(&self, node_id: &NodeID) {
        // Same acquisition order as scheduling: pending before registered.
        let mut pending = self.pending_groups.lock();
        let mut registered = self.registered_groups.write();
        for (group_id, record) in registered.iter_mut() {
            if record.bundle_nodes.contains(node_id)
                && record.state == PlacementGroupState::Created
            {
                record.state = PlacementGroupState::Rescheduling;
                record.bundle_nodes.clear();
                pending.push_back(*group_id);
                tracing::info!(%group_id, %node_id, "Rescheduling placement group from dead node");
            }
        }
    }

    /// Remove groups created by a finished job.
    pub fn clean_placement_group_if_needed_when_job_dead(&self, job_id: &JobID) {
        let mut registered = self.registered_groups.write();
        for (group_id, record) in registered.iter_mut() {
            if record.creator_job_id == *job_id && record.state != PlacementGroupState::Removed {
                record.state = PlacementGroupState::Removed;
                let mut waiting = self.waiting_removed_bundles.lock();
                waiting.extend(
                    record
                        .bundle_nodes
                        .drain(..)
                        .enumerate()
                        .map(|(i, _)| (*group_id, i as i64)),
                );
                tracing::info!(%group_id, %job_id, "Removed placement group of finished job");
            }
        }
    }

    /// Remove groups created by a dead actor. Actor-scoped groups reuse
    /// the creator-job linkage, so this currently only logs.
    pub fn clean_placement_group_if_needed_when_actor_dead(&self, actor_id: &ActorID) {
        tracing::debug!(%actor_id, "Checking placement groups of dead actor");
        self.clean_placement_group_if_needed_when_job_dead(&actor_id.job_id());
    }

    /// Return resources of bundles whose removal was deferred (e.g. until
    /// the hosting worker died).
    pub fn handle_waiting_removed_bundles(&self) {
        let drained: Vec<BundleID> = self.waiting_removed_bundles.lock().drain(..).collect();
        if !drained.is_empty() {
            tracing::info!(bundles = drained.len(), "Returned resources of removed bundles");
        }
    }

    pub fn get_placement_group(&self, group_id: &PlacementGroupID) -> Option<PlacementGroupRecord> {
        self.registered_groups.read().get(group_id).cloned()
    }

    pub fn num_pending_groups(&self) -> usize {
        self.pending_groups.lock().len()
    }

    pub fn num_waiting_removed_bundles(&self) -> usize {
        self.waiting_removed_bundles.lock().len()
    }

    pub fn record_metrics(&self) {
        tracing::debug!(
            registered = self.registered_groups.read().len(),
            pending = self.num_pending_groups(),
            "placement group manager metrics"
        );
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsPlacementGroupManager: {} registered, {} pending",
            self.registered_groups.read().len(),
            self.num_pending_groups()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{GcsPublisher, ALL_CHANNELS};
    use crate::store_client::InMemoryStoreClient;
    use crate::types::{NodeRecord, NodeState};
    use helios_common::reactor::ReactorPool;

    fn node_id(v: u8) -> NodeID {
        let mut data = [0u8; 28];
        data[0] = v;
        NodeID::from_binary(&data)
    }

    fn make_node_record(v: u8) -> NodeRecord {
        NodeRecord {
            node_id: node_id(v),
            node_name: format!("node-{v}"),
            state: NodeState::Alive,
            node_manager_address: "127.0.0.1".to_string(),
            node_manager_port: 9000,
            resources_total: HashMap::new(),
            start_time_ms: 0,
            end_time_ms: 0,
        }
    }

    fn make_group_record(job: u32) -> PlacementGroupRecord {
        PlacementGroupRecord {
            placement_group_id: PlacementGroupID::of(&JobID::from_int(job)),
            state: PlacementGroupState::Pending,
            creator_job_id: JobID::from_int(job),
            bundle_nodes: Vec::new(),
        }
    }

    fn make_managers(pool: &ReactorPool) -> (Arc<GcsNodeManager>, GcsPlacementGroupManager) {
        let storage = Arc::new(GcsTableStorage::new(Arc::new(InMemoryStoreClient::new())));
        let publisher = Arc::new(GcsPublisher::new(
            ALL_CHANNELS.to_vec(),
            pool.by_name("publisher"),
        ));
        let node_manager = Arc::new(GcsNodeManager::new(storage.clone(), publisher));
        let pg_manager = GcsPlacementGroupManager::new(storage, node_manager.clone());
        (node_manager, pg_manager)
    }

    #[tokio::test]
    async fn test_pending_group_retries_on_node_add() {
        let pool = ReactorPool::new();
        let (node_manager, pg_manager) = make_managers(&pool);

        let record = make_group_record(1);
        let group_id = record.placement_group_id;
        pg_manager.register_placement_group(record).await.unwrap();

        pg_manager.on_node_add(&node_id(1));
        assert_eq!(pg_manager.num_pending_groups(), 1);

        node_manager.register_node(make_node_record(1)).await.unwrap();
        pg_manager.on_node_add(&node_id(1));
        assert_eq!(pg_manager.num_pending_groups(), 0);
        assert_eq!(
            pg_manager.get_placement_group(&group_id).unwrap().state,
            PlacementGroupState::Created
        );
    }

    #[tokio::test]
    async fn test_node_death_reschedules_groups() {
        let pool = ReactorPool::new();
        let (node_manager, pg_manager) = make_managers(&pool);

        node_manager.register_node(make_node_record(1)).await.unwrap();
        let record = make_group_record(1);
        let group_id = record.placement_group_id;
        pg_manager.register_placement_group(record).await.unwrap();
        pg_manager.schedule_pending_placement_groups();

        pg_manager.on_node_dead(&node_id(1));
        assert_eq!(pg_manager.num_pending_groups(), 1);
        assert_eq!(
            pg_manager.get_placement_group(&group_id).unwrap().state,
            PlacementGroupState::Rescheduling
        );
    }

    #[tokio::test]
    async fn test_job_death_removes_groups_and_queues_bundles() {
        let pool = ReactorPool::new();
        let (node_manager, pg_manager) = make_managers(&pool);

        node_manager.register_node(make_node_record(1)).await.unwrap();
        let record = make_group_record(3);
        let group_id = record.placement_group_id;
        pg_manager.register_placement_group(record).await.unwrap();
        pg_manager.schedule_pending_placement_groups();

        pg_manager.clean_placement_group_if_needed_when_job_dead(&JobID::from_int(3));
        assert_eq!(
            pg_manager.get_placement_group(&group_id).unwrap().state,
            PlacementGroupState::Removed
        );
        assert_eq!(pg_manager.num_waiting_removed_bundles(), 1);

        pg_manager.handle_waiting_removed_bundles();
        assert_eq!(pg_manager.num_waiting_removed_bundles(), 0);
    }
}
