// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Control-plane table records.
//!
//! These are the values persisted in the GCS tables and handed to event
//! listeners. The wire transport lives outside this core, so records are
//! plain serde structs rather than generated protobuf types.

use std::collections::HashMap;

use helios_common::id::{ActorID, JobID, NodeID, PlacementGroupID, WorkerID};
use helios_rpc::{NodeAddress, WorkerAddress};

// ─── Nodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeState {
    Alive,
    Dead,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeID,
    pub node_name: String,
    pub state: NodeState,
    pub node_manager_address: String,
    pub node_manager_port: u16,
    /// Capacity the node registered with.
    pub resources_total: HashMap<String, f64>,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

impl NodeRecord {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(
            self.node_id,
            self.node_manager_address.clone(),
            self.node_manager_port,
        )
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }
}

// ─── Jobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub job_id: JobID,
    pub is_dead: bool,
    /// Node hosting the job's driver.
    pub driver_node_id: NodeID,
    pub namespace: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

// ─── Actors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ActorState {
    Pending,
    Alive,
    Restarting,
    Dead,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActorRecord {
    pub actor_id: ActorID,
    pub job_id: JobID,
    pub state: ActorState,
    pub name: String,
    /// Node and worker currently hosting the actor, once scheduled.
    pub node_id: Option<NodeID>,
    pub worker_id: Option<WorkerID>,
    /// Serialized exception from a failed creation task, if any.
    pub creation_task_exception: Option<String>,
}

// ─── Placement groups ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PlacementGroupState {
    Pending,
    Created,
    Rescheduling,
    Removed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlacementGroupRecord {
    pub placement_group_id: PlacementGroupID,
    pub state: PlacementGroupState,
    pub creator_job_id: JobID,
    /// Nodes carrying this group's bundles, once placed.
    pub bundle_nodes: Vec<NodeID>,
}

// ─── Workers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WorkerExitType {
    IdleExit,
    IntendedSystemExit,
    UserError,
    SystemError,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub ip_address: String,
    pub port: u16,
    pub is_alive: bool,
    pub exit_type: Option<WorkerExitType>,
    pub exit_detail: String,
    /// Serialized exception from the actor creation task this worker was
    /// executing when it died, if any.
    pub creation_task_exception: Option<String>,
}

impl WorkerRecord {
    pub fn worker_address(&self) -> WorkerAddress {
        WorkerAddress {
            worker_id: self.worker_id,
            node_id: self.node_id,
            ip_address: self.ip_address.clone(),
            port: self.port,
        }
    }
}
