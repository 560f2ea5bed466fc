// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Client pools for raylet and worker connections.
//!
//! Pools cache one client per peer and drop it on the corresponding
//! node-removed / worker-dead event. Factories are injectable so tests can
//! substitute mock clients.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use helios_common::id::{NodeID, WorkerID};

use crate::raylet::{ChannelRayletClient, NodeAddress, RayletClient};

// ─── Raylet pool ────────────────────────────────────────────────────────────

pub type RayletClientFactory = Box<dyn Fn(&NodeAddress) -> Arc<dyn RayletClient> + Send + Sync>;

/// One raylet client per node.
pub struct RayletClientPool {
    clients: Mutex<HashMap<NodeID, Arc<dyn RayletClient>>>,
    factory: RayletClientFactory,
}

impl RayletClientPool {
    pub fn new(factory: RayletClientFactory) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Pool whose clients carry a lazy tonic channel to the node address.
    pub fn with_default_factory() -> Self {
        Self::new(Box::new(|addr| {
            Arc::new(ChannelRayletClient::connect(addr.clone()))
        }))
    }

    /// Get the cached client for a node, connecting if needed.
    pub fn get_or_connect_by_address(&self, address: &NodeAddress) -> Arc<dyn RayletClient> {
        let mut clients = self.clients.lock();
        clients
            .entry(address.node_id)
            .or_insert_with(|| (self.factory)(address))
            .clone()
    }

    /// Get the cached client for a node. Does not connect.
    pub fn get_or_connect_by_id(&self, node_id: &NodeID) -> Option<Arc<dyn RayletClient>> {
        self.clients.lock().get(node_id).cloned()
    }

    /// Drop the cached client for a node.
    pub fn disconnect(&self, node_id: &NodeID) {
        if self.clients.lock().remove(node_id).is_some() {
            tracing::debug!(?node_id, "Disconnected raylet client");
        }
    }

    pub fn num_connected(&self) -> usize {
        self.clients.lock().len()
    }
}

// ─── Worker pool ────────────────────────────────────────────────────────────

/// Network address of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub ip_address: String,
    pub port: u16,
}

/// Client interface to a worker process. The data plane is external; the
/// core only tracks membership and identity.
pub trait WorkerClient: Send + Sync {
    fn address(&self) -> &WorkerAddress;
}

struct PooledWorkerClient {
    address: WorkerAddress,
}

impl WorkerClient for PooledWorkerClient {
    fn address(&self) -> &WorkerAddress {
        &self.address
    }
}

pub type WorkerClientFactory = Box<dyn Fn(&WorkerAddress) -> Arc<dyn WorkerClient> + Send + Sync>;

/// Callback invoked when the transport reports a worker client as
/// unavailable. The control plane decides whether to disconnect.
pub type WorkerUnavailableCallback = Box<dyn Fn(WorkerAddress) + Send + Sync>;

/// One worker client per worker id, with node-level eviction.
pub struct WorkerClientPool {
    clients: Mutex<HashMap<WorkerID, Arc<dyn WorkerClient>>>,
    factory: WorkerClientFactory,
    unavailable_callback: Mutex<Option<WorkerUnavailableCallback>>,
}

impl WorkerClientPool {
    pub fn new(factory: WorkerClientFactory) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            factory,
            unavailable_callback: Mutex::new(None),
        }
    }

    pub fn with_default_factory() -> Self {
        Self::new(Box::new(|addr| {
            Arc::new(PooledWorkerClient {
                address: addr.clone(),
            })
        }))
    }

    /// Install the unavailable-worker policy (set once during bootstrap).
    pub fn set_unavailable_callback(&self, callback: WorkerUnavailableCallback) {
        *self.unavailable_callback.lock() = Some(callback);
    }

    /// Transport hook: a call against this worker failed.
    pub fn notify_unavailable(&self, address: WorkerAddress) {
        let callback = self.unavailable_callback.lock();
        if let Some(cb) = callback.as_ref() {
            cb(address);
        }
    }

    pub fn get_or_connect(&self, address: &WorkerAddress) -> Arc<dyn WorkerClient> {
        let mut clients = self.clients.lock();
        clients
            .entry(address.worker_id)
            .or_insert_with(|| (self.factory)(address))
            .clone()
    }

    /// Drop the cached client for one worker.
    pub fn disconnect_worker(&self, worker_id: &WorkerID) {
        if self.clients.lock().remove(worker_id).is_some() {
            tracing::debug!(?worker_id, "Disconnected worker client");
        }
    }

    /// Drop every cached client hosted on a node.
    pub fn disconnect_node(&self, node_id: &NodeID) {
        let mut clients = self.clients.lock();
        clients.retain(|_, client| client.address().node_id != *node_id);
    }

    pub fn num_connected(&self) -> usize {
        self.clients.lock().len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
