// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Typed tables over the raw store client, and the initial state snapshot
//! loaded at bootstrap.
//!
//! Keys are the hex form of the relevant ID; values are serde-encoded
//! records.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use helios_common::id::{ActorID, JobID, NodeID, PlacementGroupID, WorkerID};
use helios_common::status::{HeliosError, HeliosResult};

use crate::store_client::StoreClient;
use crate::types::{ActorRecord, JobRecord, NodeRecord, PlacementGroupRecord, WorkerRecord};

/// Table names used by the control plane.
pub mod table_names {
    pub const NODE: &str = "Node";
    pub const JOB: &str = "Job";
    pub const ACTOR: &str = "Actor";
    pub const PLACEMENT_GROUP: &str = "PlacementGroup";
    pub const WORKER: &str = "Worker";
}

/// A typed table backed by a raw store client.
pub struct GcsTable<V> {
    table_name: String,
    store_client: Arc<dyn StoreClient>,
    _phantom: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> GcsTable<V> {
    pub fn new(table_name: &str, store_client: Arc<dyn StoreClient>) -> Self {
        Self {
            table_name: table_name.to_string(),
            store_client,
            _phantom: PhantomData,
        }
    }

    pub async fn put(&self, key: &str, value: &V) -> HeliosResult<()> {
        let data = serde_json::to_vec(value)
            .map_err(|e| HeliosError::invalid(format!("record encode error: {e}")))?;
        self.store_client
            .put(&self.table_name, key, data, true)
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> HeliosResult<Option<V>> {
        match self.store_client.get(&self.table_name, key).await? {
            Some(data) => {
                let value = serde_json::from_slice(&data)
                    .map_err(|e| HeliosError::invalid(format!("record decode error: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> HeliosResult<HashMap<String, V>> {
        let raw = self.store_client.get_all(&self.table_name).await?;
        let mut result = HashMap::with_capacity(raw.len());
        for (key, data) in raw {
            let value = serde_json::from_slice(&data)
                .map_err(|e| HeliosError::invalid(format!("record decode error: {e}")))?;
            result.insert(key, value);
        }
        Ok(result)
    }

    pub async fn delete(&self, key: &str) -> HeliosResult<bool> {
        self.store_client.delete(&self.table_name, key).await
    }

    pub async fn batch_delete(&self, keys: &[String]) -> HeliosResult<i64> {
        self.store_client.batch_delete(&self.table_name, keys).await
    }
}

/// All GCS tables, created once during server construction.
pub struct GcsTableStorage {
    store_client: Arc<dyn StoreClient>,
}

impl GcsTableStorage {
    pub fn new(store_client: Arc<dyn StoreClient>) -> Self {
        Self { store_client }
    }

    pub fn store_client(&self) -> &Arc<dyn StoreClient> {
        &self.store_client
    }

    pub fn node_table(&self) -> GcsTable<NodeRecord> {
        GcsTable::new(table_names::NODE, self.store_client.clone())
    }

    pub fn job_table(&self) -> GcsTable<JobRecord> {
        GcsTable::new(table_names::JOB, self.store_client.clone())
    }

    pub fn actor_table(&self) -> GcsTable<ActorRecord> {
        GcsTable::new(table_names::ACTOR, self.store_client.clone())
    }

    pub fn placement_group_table(&self) -> GcsTable<PlacementGroupRecord> {
        GcsTable::new(table_names::PLACEMENT_GROUP, self.store_client.clone())
    }

    pub fn worker_table(&self) -> GcsTable<WorkerRecord> {
        GcsTable::new(table_names::WORKER, self.store_client.clone())
    }
}

/// Snapshot of persisted tables loaded before the managers are built.
#[derive(Default)]
pub struct GcsInitData {
    pub nodes: HashMap<NodeID, NodeRecord>,
    pub jobs: HashMap<JobID, JobRecord>,
    pub actors: HashMap<ActorID, ActorRecord>,
    pub placement_groups: HashMap<PlacementGroupID, PlacementGroupRecord>,
    pub workers: HashMap<WorkerID, WorkerRecord>,
}

impl GcsInitData {
    pub async fn load(storage: &GcsTableStorage) -> HeliosResult<Self> {
        let mut init = Self::default();
        for (key, record) in storage.node_table().get_all().await? {
            init.nodes.insert(NodeID::from_hex(&key), record);
        }
        for (key, record) in storage.job_table().get_all().await? {
            init.jobs.insert(JobID::from_hex(&key), record);
        }
        for (key, record) in storage.actor_table().get_all().await? {
            init.actors.insert(ActorID::from_hex(&key), record);
        }
        for (key, record) in storage.placement_group_table().get_all().await? {
            init.placement_groups
                .insert(PlacementGroupID::from_hex(&key), record);
        }
        for (key, record) in storage.worker_table().get_all().await? {
            init.workers.insert(WorkerID::from_hex(&key), record);
        }
        tracing::info!(
            nodes = init.nodes.len(),
            jobs = init.jobs.len(),
            actors = init.actors.len(),
            placement_groups = init.placement_groups.len(),
            workers = init.workers.len(),
            "Loaded persisted cluster state"
        );
        Ok(init)
    }
}
