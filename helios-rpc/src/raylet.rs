// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Raylet (node manager) client interface.

use std::collections::HashMap;

use helios_common::id::{NodeID, WorkerID};
use helios_common::status::{HeliosError, HeliosResult};

/// Network address of a raylet.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeAddress {
    pub node_id: NodeID,
    pub ip_address: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(node_id: NodeID, ip_address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            ip_address: ip_address.into(),
            port,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.ip_address, self.port)
    }
}

/// Resource totals, availability, and demand reported by one raylet.
#[derive(Debug, Clone, Default)]
pub struct ResourceLoad {
    pub resources_total: HashMap<String, f64>,
    pub resources_available: HashMap<String, f64>,
    pub resource_load: HashMap<String, f64>,
}

/// Client interface to a raylet.
///
/// The blocked/unblocked notifications are the worker-local IPC that
/// brackets blocking object-store gets so the scheduler may reclaim the
/// worker's resources. The async methods are the control-plane RPCs the
/// GCS issues against remote raylets.
#[async_trait::async_trait]
pub trait RayletClient: Send + Sync {
    /// The calling worker is about to block on a get.
    fn notify_task_blocked(&self) -> HeliosResult<()>;

    /// The calling worker finished its blocking get.
    fn notify_task_unblocked(&self) -> HeliosResult<()>;

    /// Whether a worker process on this raylet's node has exited.
    async fn is_local_worker_dead(&self, worker_id: &WorkerID) -> HeliosResult<bool>;

    /// Pull the node's current resource load.
    async fn get_resource_load(&self) -> HeliosResult<ResourceLoad>;

    /// Channel used for unary health probes against this node, if the
    /// transport is wired.
    fn channel(&self) -> Option<tonic::transport::Channel>;

    fn address(&self) -> &NodeAddress;
}

/// Raylet client backed by a lazily-connected tonic channel.
///
/// Only the channel (health probing) is live here; the data-plane RPCs
/// belong to the external transport and report `RpcError` until a real
/// client is injected in its place.
pub struct ChannelRayletClient {
    address: NodeAddress,
    channel: Option<tonic::transport::Channel>,
}

impl ChannelRayletClient {
    pub fn connect(address: NodeAddress) -> Self {
        let channel = tonic::transport::Endpoint::from_shared(address.endpoint())
            .ok()
            .map(|ep| ep.connect_lazy());
        if channel.is_none() {
            tracing::warn!(?address, "invalid raylet endpoint");
        }
        Self { address, channel }
    }

    fn not_wired(&self, what: &str) -> HeliosError {
        HeliosError::rpc_error(
            format!("{what}: no transport to raylet at {}", self.address.endpoint()),
            tonic::Code::Unavailable as i32,
        )
    }
}

#[async_trait::async_trait]
impl RayletClient for ChannelRayletClient {
    fn notify_task_blocked(&self) -> HeliosResult<()> {
        Err(self.not_wired("notify_task_blocked"))
    }

    fn notify_task_unblocked(&self) -> HeliosResult<()> {
        Err(self.not_wired("notify_task_unblocked"))
    }

    async fn is_local_worker_dead(&self, _worker_id: &WorkerID) -> HeliosResult<bool> {
        Err(self.not_wired("is_local_worker_dead"))
    }

    async fn get_resource_load(&self) -> HeliosResult<ResourceLoad> {
        Err(self.not_wired("get_resource_load"))
    }

    fn channel(&self) -> Option<tonic::transport::Channel> {
        self.channel.clone()
    }

    fn address(&self) -> &NodeAddress {
        &self.address
    }
}
