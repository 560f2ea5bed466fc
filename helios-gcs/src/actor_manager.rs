// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Actor manager: registration, pending-actor scheduling, and node/worker
//! death handling. The scheduling policy itself is an external
//! collaborator; pending actors are placed on any alive node.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use helios_common::id::{ActorID, NodeID, WorkerID};
use helios_common::status::HeliosResult;

use crate::node_manager::GcsNodeManager;
use crate::table_storage::{GcsInitData, GcsTableStorage};
use crate::types::{ActorRecord, ActorState};
use crate::usage_stats::UsageStatsClient;

pub struct GcsActorManager {
    registered_actors: RwLock<HashMap<ActorID, ActorRecord>>,
    pending_actors: Mutex<VecDeque<ActorID>>,
    node_manager: Arc<GcsNodeManager>,
    table_storage: Arc<GcsTableStorage>,
    /// Invoked when an actor dies, so dependents can clean up.
    actor_destroyed_callback: Mutex<Option<Box<dyn Fn(&ActorID) + Send + Sync>>>,
    usage_stats_client: Mutex<Option<Arc<UsageStatsClient>>>,
}

impl GcsActorManager {
    pub fn new(table_storage: Arc<GcsTableStorage>, node_manager: Arc<GcsNodeManager>) -> Self {
        Self {
            registered_actors: RwLock::new(HashMap::new()),
            pending_actors: Mutex::new(VecDeque::new()),
            node_manager,
            table_storage,
            actor_destroyed_callback: Mutex::new(None),
            usage_stats_client: Mutex::new(None),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut pending = self.pending_actors.lock();
        let mut registered = self.registered_actors.write();
        for (actor_id, record) in &init_data.actors {
            if record.state == ActorState::Pending || record.state == ActorState::Restarting {
                pending.push_back(*actor_id);
            }
            registered.insert(*actor_id, record.clone());
        }
    }

    pub fn set_actor_destroyed_callback(&self, callback: Box<dyn Fn(&ActorID) + Send + Sync>) {
        *self.actor_destroyed_callback.lock() = Some(callback);
    }

    pub fn set_usage_stats_client(&self, client: Arc<UsageStatsClient>) {
        *self.usage_stats_client.lock() = Some(client);
    }

    pub async fn register_actor(&self, mut record: ActorRecord) -> HeliosResult<()> {
        record.state = ActorState::Pending;
        let actor_id = record.actor_id;

        self.table_storage
            .actor_table()
            .put(&actor_id.hex(), &record)
            .await?;
        self.registered_actors.write().insert(actor_id, record);
        self.pending_actors.lock().push_back(actor_id);

        tracing::info!(%actor_id, "Actor registered");
        Ok(())
    }

    /// Place pending actors on alive nodes. Invoked when capacity appears
    /// (node added, resources changed).
    pub fn schedule_pending_actors(&self) {
        let alive_nodes: Vec<NodeID> = self
            .node_manager
            .get_all_alive_nodes()
            .keys()
            .copied()
            .collect();
        if alive_nodes.is_empty() {
            return;
        }

        let mut pending = self.pending_actors.lock();
        let mut registered = self.registered_actors.write();
        let mut placed = 0usize;
        while let Some(actor_id) = pending.pop_front() {
            if let Some(record) = registered.get_mut(&actor_id) {
                let node = alive_nodes[placed % alive_nodes.len()];
                record.state = ActorState::Alive;
                record.node_id = Some(node);
                placed += 1;
            }
        }
        if placed > 0 {
            tracing::info!(placed, "Scheduled pending actors");
        }
    }

    /// Reconstruct actors that lived on a dead node.
    pub fn on_node_dead(&self, node_id: &NodeID, node_ip_address: &str) {
        // Same acquisition order as scheduling: pending before registered.
        let mut pending = self.pending_actors.lock();
        let mut registered = self.registered_actors.write();
        let mut restarting = 0usize;
        for (actor_id, record) in registered.iter_mut() {
            if record.node_id == Some(*node_id) && record.state == ActorState::Alive {
                record.state = ActorState::Restarting;
                record.node_id = None;
                record.worker_id = None;
                pending.push_back(*actor_id);
                restarting += 1;
            }
        }
        if restarting > 0 {
            tracing::info!(
                %node_id,
                node_ip_address,
                restarting,
                "Restarting actors from dead node"
            );
        }
    }

    /// Record the death of the actor hosted by a dead worker. A creation
    /// task exception, when present, becomes part of the actor's record.
    pub fn on_worker_dead(
        &self,
        node_id: &NodeID,
        worker_id: &WorkerID,
        creation_task_exception: Option<String>,
    ) {
        let mut destroyed = Vec::new();
        {
            let mut registered = self.registered_actors.write();
            for (actor_id, record) in registered.iter_mut() {
                if record.worker_id == Some(*worker_id) && record.state != ActorState::Dead {
                    record.state = ActorState::Dead;
                    record.creation_task_exception = creation_task_exception.clone();
                    destroyed.push(*actor_id);
                }
            }
        }
        for actor_id in &destroyed {
            tracing::info!(%actor_id, %node_id, %worker_id, "Actor died with its worker");
            if let Some(callback) = self.actor_destroyed_callback.lock().as_ref() {
                callback(actor_id);
            }
        }
    }

    pub fn get_actor(&self, actor_id: &ActorID) -> Option<ActorRecord> {
        self.registered_actors.read().get(actor_id).cloned()
    }

    pub fn num_pending_actors(&self) -> usize {
        self.pending_actors.lock().len()
    }

    pub fn num_registered_actors(&self) -> usize {
        self.registered_actors.read().len()
    }

    pub fn record_metrics(&self) {
        tracing::debug!(
            registered = self.num_registered_actors(),
            pending = self.num_pending_actors(),
            "actor manager metrics"
        );
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsActorManager: {} registered, {} pending",
            self.num_registered_actors(),
            self.num_pending_actors()
        )
    }
}
