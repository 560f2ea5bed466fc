// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! GCS server: bootstrap orchestration, event wiring, and periodic
//! maintenance.
//!
//! Construction selects the storage backend and builds the pieces that
//! exist before any manager (tables, internal KV, publisher, client
//! pools). `start` then loads persisted state, acquires the cluster id,
//! builds the managers in dependency order, installs the event listeners,
//! starts the RPC surface, and arms the maintenance timers.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use helios_common::config::HeliosConfig;
use helios_common::constants::{
    AUTOSCALER_STATE_NAMESPACE, AUTOSCALER_V2_ENABLED_KEY, CLUSTER_ID_KEY, CLUSTER_ID_NAMESPACE,
    DEBUG_STATE_FILENAME, GCS_PID_KEY, IN_MEMORY_STORAGE, REDIS_STORAGE,
};
use helios_common::id::{ClusterID, NodeID, GCS_NODE_ID};
use helios_common::reactor::{PeriodicalRunner, Reactor, ReactorPool};
use helios_common::status::{HeliosError, HeliosResult};
use helios_rpc::{RayletClientPool, WorkerClientPool};
use helios_util::throttler::Throttler;

use crate::actor_manager::GcsActorManager;
use crate::autoscaler_state_manager::GcsAutoscalerStateManager;
use crate::cluster_resource_scheduler::ClusterResourceScheduler;
use crate::cluster_task_manager::ClusterTaskManager;
use crate::function_manager::GcsFunctionManager;
use crate::health_check_manager::{GcsHealthCheckManager, HealthCheckConfig};
use crate::job_manager::GcsJobManager;
use crate::kv_manager::GcsInternalKvManager;
use crate::node_manager::GcsNodeManager;
use crate::placement_group_manager::GcsPlacementGroupManager;
use crate::pubsub::{GcsPublisher, PubSubHandler, ALL_CHANNELS};
use crate::resource_manager::GcsResourceManager;
use crate::runtime_env_manager::RuntimeEnvManager;
use crate::store_client::{
    InMemoryStoreClient, InternalKv, RedisStoreClient, StoreClient, StoreClientInternalKv,
};
use crate::syncer::{GcsSyncer, SyncMessage, SyncPayload};
use crate::table_storage::{GcsInitData, GcsTableStorage};
use crate::task_manager::GcsTaskManager;
use crate::usage_stats::UsageStatsClient;
use crate::worker_manager::GcsWorkerManager;

// ─── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GcsServerConfig {
    pub grpc_server_name: String,
    pub grpc_server_port: u16,
    pub node_ip_address: String,
    pub redis_address: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub enable_redis_ssl: bool,
    pub log_dir: Option<String>,
    pub session_name: String,
    pub raylet_config_list: String,
    pub config: HeliosConfig,
}

impl Default for GcsServerConfig {
    fn default() -> Self {
        Self {
            grpc_server_name: "GcsServer".to_string(),
            grpc_server_port: 6379,
            node_ip_address: "127.0.0.1".to_string(),
            redis_address: None,
            redis_username: None,
            redis_password: None,
            enable_redis_ssl: false,
            log_dir: None,
            session_name: "session".to_string(),
            raylet_config_list: String::new(),
            config: HeliosConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    InMemory,
    RedisPersist,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => write!(f, "StorageType::InMemory"),
            Self::RedisPersist => write!(f, "StorageType::RedisPersist"),
        }
    }
}

// ─── RPC server facade ──────────────────────────────────────────────────────

/// Surface the transport binds to. The transport itself (service
/// registration, sockets, auth) is an external collaborator; the core
/// stamps the cluster id here and flips it on/off.
pub struct RpcServer {
    name: String,
    port: u16,
    cluster_id: RwLock<Option<ClusterID>>,
    services: Mutex<Vec<String>>,
    started: AtomicBool,
}

impl RpcServer {
    pub fn new(name: String, port: u16) -> Self {
        Self {
            name,
            port,
            cluster_id: RwLock::new(None),
            services: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn set_cluster_id(&self, cluster_id: ClusterID) {
        *self.cluster_id.write() = Some(cluster_id);
    }

    /// The id stamped on every RPC for tenancy isolation.
    pub fn cluster_id(&self) -> Option<ClusterID> {
        *self.cluster_id.read()
    }

    pub fn register_service(&self, service: &str) {
        self.services.lock().push(service.to_string());
    }

    pub fn registered_services(&self) -> Vec<String> {
        self.services.lock().clone()
    }

    pub fn run(&self) {
        self.started.store(true, Ordering::Release);
        tracing::info!(name = %self.name, port = self.port, "RPC server running");
    }

    pub fn shutdown(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

// ─── Managers ───────────────────────────────────────────────────────────────

/// Everything built by `do_start`, in construction order.
pub struct GcsManagers {
    pub cluster_resource_scheduler: Arc<ClusterResourceScheduler>,
    pub node_manager: Arc<GcsNodeManager>,
    pub cluster_task_manager: Arc<ClusterTaskManager>,
    pub resource_manager: Arc<GcsResourceManager>,
    pub health_check_manager: Arc<GcsHealthCheckManager>,
    pub syncer: Arc<GcsSyncer>,
    pub function_manager: Arc<GcsFunctionManager>,
    pub runtime_env_manager: Arc<RuntimeEnvManager>,
    pub job_manager: Arc<GcsJobManager>,
    pub placement_group_manager: Arc<GcsPlacementGroupManager>,
    pub actor_manager: Arc<GcsActorManager>,
    pub worker_manager: Arc<GcsWorkerManager>,
    pub task_manager: Arc<GcsTaskManager>,
    pub autoscaler_state_manager: Arc<GcsAutoscalerStateManager>,
    pub usage_stats_client: Arc<UsageStatsClient>,
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct GcsServer {
    config: GcsServerConfig,
    storage_type: StorageType,
    reactors: Arc<ReactorPool>,
    table_storage: Arc<GcsTableStorage>,
    kv: Arc<dyn InternalKv>,
    kv_manager: Arc<GcsInternalKvManager>,
    publisher: Arc<GcsPublisher>,
    pubsub_handler: Arc<PubSubHandler>,
    rpc_server: Arc<RpcServer>,
    raylet_client_pool: Arc<RayletClientPool>,
    worker_client_pool: Arc<WorkerClientPool>,
    managers: Option<Arc<GcsManagers>>,
    global_gc_throttler: Arc<Throttler>,
    task_pending_schedule_detected: Arc<AtomicU64>,
    periodic_runners: Mutex<Vec<PeriodicalRunner>>,
    is_started: AtomicBool,
    is_stopped: AtomicBool,
}

impl GcsServer {
    pub fn new(config: GcsServerConfig) -> HeliosResult<Self> {
        Self::new_with_client_pools(
            config,
            Arc::new(RayletClientPool::with_default_factory()),
            Arc::new(WorkerClientPool::with_default_factory()),
        )
    }

    /// Constructor with injectable client pools, used by tests to
    /// substitute mock raylet/worker transports.
    pub fn new_with_client_pools(
        config: GcsServerConfig,
        raylet_client_pool: Arc<RayletClientPool>,
        worker_client_pool: Arc<WorkerClientPool>,
    ) -> HeliosResult<Self> {
        let storage_type = Self::select_storage_type(&config)?;
        let store_client: Arc<dyn StoreClient> = match storage_type {
            StorageType::InMemory => Arc::new(InMemoryStoreClient::new()),
            StorageType::RedisPersist => {
                Arc::new(RedisStoreClient::new(&Self::redis_url(&config), String::new())?)
            }
        };
        Self::new_with_storage(config, store_client, raylet_client_pool, worker_client_pool)
    }

    /// Constructor over an explicit storage backend. Lets an embedder (or
    /// a restart test) keep one backend across server instances.
    pub fn new_with_storage(
        config: GcsServerConfig,
        store_client: Arc<dyn StoreClient>,
        raylet_client_pool: Arc<RayletClientPool>,
        worker_client_pool: Arc<WorkerClientPool>,
    ) -> HeliosResult<Self> {
        let storage_type = Self::select_storage_type(&config)?;
        tracing::info!(%storage_type, "GCS storage type");

        let reactors = Arc::new(ReactorPool::new());

        let table_storage = Arc::new(GcsTableStorage::new(store_client.clone()));
        let kv: Arc<dyn InternalKv> = Arc::new(StoreClientInternalKv::new(store_client));
        let kv_manager = Arc::new(GcsInternalKvManager::new(
            kv.clone(),
            config.raylet_config_list.clone(),
            reactors.by_name("internal_kv"),
        ));

        let publisher = Arc::new(GcsPublisher::new(
            ALL_CHANNELS.to_vec(),
            reactors.by_name("publisher"),
        ));
        let pubsub_handler = Arc::new(PubSubHandler::new());

        let rpc_server = Arc::new(RpcServer::new(
            config.grpc_server_name.clone(),
            config.grpc_server_port,
        ));

        let global_gc_throttler = Arc::new(Throttler::new(Duration::from_secs(
            config.config.global_gc_min_interval_s,
        )));

        Ok(Self {
            config,
            storage_type,
            reactors,
            table_storage,
            kv,
            kv_manager,
            publisher,
            pubsub_handler,
            rpc_server,
            raylet_client_pool,
            worker_client_pool,
            managers: None,
            global_gc_throttler,
            task_pending_schedule_detected: Arc::new(AtomicU64::new(0)),
            periodic_runners: Mutex::new(Vec::new()),
            is_started: AtomicBool::new(false),
            is_stopped: AtomicBool::new(false),
        })
    }

    fn select_storage_type(config: &GcsServerConfig) -> HeliosResult<StorageType> {
        match config.config.gcs_storage.as_str() {
            IN_MEMORY_STORAGE => {
                if config.redis_address.is_some() {
                    tracing::info!(
                        redis_address = ?config.redis_address,
                        "Using external Redis for KV storage"
                    );
                    Ok(StorageType::RedisPersist)
                } else {
                    Ok(StorageType::InMemory)
                }
            }
            REDIS_STORAGE => {
                if config.redis_address.is_none() {
                    return Err(HeliosError::invalid(
                        "redis storage selected but no redis address configured",
                    ));
                }
                Ok(StorageType::RedisPersist)
            }
            other => Err(HeliosError::invalid(format!(
                "Unsupported GCS storage type: {other}"
            ))),
        }
    }

    fn redis_url(config: &GcsServerConfig) -> String {
        let address = config.redis_address.as_deref().unwrap_or_default();
        let scheme = if config.enable_redis_ssl { "rediss" } else { "redis" };
        match (&config.redis_username, &config.redis_password) {
            (Some(user), Some(pass)) => format!("{scheme}://{user}:{pass}@{address}"),
            (None, Some(pass)) => format!("{scheme}://:{pass}@{address}"),
            _ => format!("{scheme}://{address}"),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn config(&self) -> &GcsServerConfig {
        &self.config
    }

    pub fn reactors(&self) -> &Arc<ReactorPool> {
        &self.reactors
    }

    pub fn kv(&self) -> &Arc<dyn InternalKv> {
        &self.kv
    }

    pub fn kv_manager(&self) -> &Arc<GcsInternalKvManager> {
        &self.kv_manager
    }

    pub fn publisher(&self) -> &Arc<GcsPublisher> {
        &self.publisher
    }

    pub fn pubsub_handler(&self) -> &Arc<PubSubHandler> {
        &self.pubsub_handler
    }

    pub fn rpc_server(&self) -> &Arc<RpcServer> {
        &self.rpc_server
    }

    pub fn raylet_client_pool(&self) -> &Arc<RayletClientPool> {
        &self.raylet_client_pool
    }

    pub fn worker_client_pool(&self) -> &Arc<WorkerClientPool> {
        &self.worker_client_pool
    }

    /// All managers. Only valid after `start`.
    pub fn managers(&self) -> &Arc<GcsManagers> {
        self.managers.as_ref().expect("GcsServer not started")
    }

    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::Acquire)
    }

    // ─── Bootstrap ──────────────────────────────────────────────────────

    pub async fn start(&mut self) -> HeliosResult<()> {
        if self.is_started() {
            return Err(HeliosError::invalid("GcsServer already started"));
        }

        // Record our pid so external tooling can find the process.
        let pid_written = self
            .kv
            .put("", GCS_PID_KEY, std::process::id().to_string().into_bytes(), true)
            .await?;
        if !pid_written {
            tracing::warn!("Overwrote a previous GCS pid entry in the KV store");
        }

        let init_data = GcsInitData::load(&self.table_storage).await?;
        let cluster_id = self.get_or_generate_cluster_id().await?;
        self.rpc_server.set_cluster_id(cluster_id);

        self.do_start(init_data, cluster_id).await?;

        self.is_started.store(true, Ordering::Release);
        Ok(())
    }

    /// Look up the persisted cluster id, or generate and persist one.
    /// Losing the insert race to a concurrent bootstrap is fatal.
    async fn get_or_generate_cluster_id(&self) -> HeliosResult<ClusterID> {
        match self.kv.get(CLUSTER_ID_NAMESPACE, CLUSTER_ID_KEY).await? {
            Some(bytes) => {
                if bytes.len() != ClusterID::SIZE {
                    return Err(HeliosError::invalid(format!(
                        "persisted cluster id has {} bytes, expected {}",
                        bytes.len(),
                        ClusterID::SIZE
                    )));
                }
                let cluster_id = ClusterID::from_binary(&bytes);
                tracing::info!(%cluster_id, "Found existing cluster id");
                Ok(cluster_id)
            }
            None => {
                let cluster_id = ClusterID::from_random();
                tracing::info!(%cluster_id, "No existing cluster id found, generated a new one");
                let added = self
                    .kv
                    .put(CLUSTER_ID_NAMESPACE, CLUSTER_ID_KEY, cluster_id.binary(), false)
                    .await?;
                if !added {
                    return Err(HeliosError::invalid(
                        "failed to persist the new cluster id: lost an insert race",
                    ));
                }
                Ok(cluster_id)
            }
        }
    }

    async fn do_start(&mut self, init_data: GcsInitData, cluster_id: ClusterID) -> HeliosResult<()> {
        let default_reactor = self.reactors.default_reactor();

        // Construction order is load-bearing: every manager depends only
        // on its predecessors.
        let cluster_resource_scheduler = Arc::new(ClusterResourceScheduler::new(GCS_NODE_ID));

        let node_manager = Arc::new(GcsNodeManager::new(
            self.table_storage.clone(),
            self.publisher.clone(),
        ));
        node_manager.initialize(&init_data);
        node_manager.set_cluster_id(cluster_id);
        self.rpc_server.register_service("NodeInfo");

        let cluster_task_manager = Arc::new(ClusterTaskManager::new(
            cluster_resource_scheduler.clone(),
        ));

        let resource_manager = Arc::new(GcsResourceManager::new(
            cluster_resource_scheduler.clone(),
        ));
        resource_manager.initialize(&init_data);
        self.rpc_server.register_service("NodeResourceInfo");

        let health_check_manager = self.init_health_check_manager(&node_manager, &default_reactor);
        for record in init_data.nodes.values().filter(|n| n.is_alive()) {
            let client = self.raylet_client_pool.get_or_connect_by_address(&record.address());
            match client.channel() {
                Some(channel) => health_check_manager.add_node(record.node_id, channel),
                None => tracing::warn!(node_id = %record.node_id, "No channel for health checking"),
            }
        }

        let syncer = {
            let health = health_check_manager.clone();
            Arc::new(GcsSyncer::new(
                self.reactors.by_name("syncer"),
                Box::new(move |node_id: NodeID| health.mark_node_healthy(node_id)),
            ))
        };
        self.rpc_server.register_service("Syncer");

        self.rpc_server.register_service("InternalKV");

        let function_manager = Arc::new(GcsFunctionManager::new(self.kv.clone()));

        self.rpc_server.register_service("InternalPubSub");

        let runtime_env_manager = self.init_runtime_env_manager(&default_reactor);
        self.rpc_server.register_service("RuntimeEnv");

        let job_manager = Arc::new(GcsJobManager::new(
            self.table_storage.clone(),
            self.publisher.clone(),
            function_manager.clone(),
            runtime_env_manager.clone(),
        ));
        job_manager.initialize(&init_data);
        self.rpc_server.register_service("JobInfo");

        let placement_group_manager = Arc::new(GcsPlacementGroupManager::new(
            self.table_storage.clone(),
            node_manager.clone(),
        ));
        placement_group_manager.initialize(&init_data);
        self.rpc_server.register_service("PlacementGroupInfo");

        let actor_manager = Arc::new(GcsActorManager::new(
            self.table_storage.clone(),
            node_manager.clone(),
        ));
        actor_manager.initialize(&init_data);
        {
            let pg_manager = placement_group_manager.clone();
            actor_manager.set_actor_destroyed_callback(Box::new(move |actor_id| {
                pg_manager.clean_placement_group_if_needed_when_actor_dead(actor_id);
            }));
        }
        self.rpc_server.register_service("ActorInfo");

        let worker_manager = Arc::new(GcsWorkerManager::new(
            self.table_storage.clone(),
            self.publisher.clone(),
        ));
        self.rpc_server.register_service("WorkerInfo");

        let task_manager = Arc::new(GcsTaskManager::new(self.reactors.by_name("task_manager")));
        self.rpc_server.register_service("TaskInfo");

        let autoscaler_state_manager = self.init_autoscaler_state_manager(&init_data).await?;
        self.rpc_server.register_service("AutoscalerState");

        let usage_stats_client = Arc::new(UsageStatsClient::new(
            self.kv.clone(),
            default_reactor.clone(),
        ));
        actor_manager.set_usage_stats_client(usage_stats_client.clone());
        placement_group_manager.set_usage_stats_client(usage_stats_client.clone());
        worker_manager.set_usage_stats_client(usage_stats_client.clone());
        task_manager.set_usage_stats_client(usage_stats_client.clone());
        usage_stats_client.record_extra_usage_tag("gcs_storage", self.config.config.gcs_storage.clone());

        let managers = Arc::new(GcsManagers {
            cluster_resource_scheduler,
            node_manager,
            cluster_task_manager,
            resource_manager,
            health_check_manager,
            syncer,
            function_manager,
            runtime_env_manager,
            job_manager,
            placement_group_manager,
            actor_manager,
            worker_manager,
            task_manager,
            autoscaler_state_manager,
            usage_stats_client,
        });

        self.install_event_listeners(&managers, &default_reactor);
        self.install_worker_unavailable_callback(&managers, &default_reactor);

        self.managers = Some(managers);

        self.rpc_server.run();

        self.arm_periodic_timers(&default_reactor);

        Ok(())
    }

    fn init_health_check_manager(
        &self,
        node_manager: &Arc<GcsNodeManager>,
        default_reactor: &Reactor,
    ) -> Arc<GcsHealthCheckManager> {
        // Node death routes through the default reactor into the node
        // manager, like every other node-state mutation.
        let node_manager = node_manager.clone();
        let reactor = default_reactor.clone();
        let death_callback = Arc::new(move |node_id: NodeID| {
            let node_manager = node_manager.clone();
            reactor.spawn(async move {
                if let Err(e) = node_manager.on_node_failure(&node_id).await {
                    tracing::warn!(%node_id, error = %e, "Failed to process node failure");
                }
            });
        });
        GcsHealthCheckManager::new(
            default_reactor.clone(),
            HealthCheckConfig::from_helios_config(&self.config.config),
            death_callback,
        )
    }

    fn init_runtime_env_manager(&self, default_reactor: &Reactor) -> Arc<RuntimeEnvManager> {
        let kv = self.kv.clone();
        let reactor = default_reactor.clone();
        Arc::new(RuntimeEnvManager::new(Box::new(move |uri, callback| {
            // A valid URI is of the form "<protocol>://<hash>".
            let Some((protocol, _)) = uri.split_once("://") else {
                tracing::error!(%uri, "Runtime env URI must be of the form <protocol>://<hash>");
                callback(false);
                return;
            };
            if protocol != "gcs" {
                // Some URIs do not correspond to entries the GCS owns.
                callback(true);
                return;
            }
            let kv = kv.clone();
            reactor.spawn(async move {
                match kv.del("", &uri, false).await {
                    Ok(removed) => callback(removed > 0),
                    Err(e) => {
                        tracing::warn!(%uri, error = %e, "Failed to delete runtime env URI");
                        callback(false);
                    }
                }
            });
        })))
    }

    async fn init_autoscaler_state_manager(
        &self,
        init_data: &GcsInitData,
    ) -> HeliosResult<Arc<GcsAutoscalerStateManager>> {
        let v2_enabled = if self.config.config.enable_autoscaler_v2 { "1" } else { "0" };
        tracing::info!(v2_enabled, "Autoscaler V2 flag");

        let newly_written = self
            .kv
            .put(
                AUTOSCALER_STATE_NAMESPACE,
                AUTOSCALER_V2_ENABLED_KEY,
                v2_enabled.as_bytes().to_vec(),
                true,
            )
            .await?;
        if !newly_written {
            // An overwrite does not reveal whether the value changed (e.g.
            // across a GCS restart); read it back to make sure it matches.
            let stored = self
                .kv
                .get(AUTOSCALER_STATE_NAMESPACE, AUTOSCALER_V2_ENABLED_KEY)
                .await?
                .ok_or_else(|| {
                    HeliosError::invalid("autoscaler v2 flag missing right after write")
                })?;
            if stored != v2_enabled.as_bytes() {
                return Err(HeliosError::invalid(
                    "autoscaler v2 flag in storage does not match this server's config",
                ));
            }
        }

        let manager = Arc::new(GcsAutoscalerStateManager::new(
            self.config.session_name.clone(),
        ));
        manager.initialize(init_data);
        Ok(manager)
    }

    /// Wire the node/worker/job event listeners. Registration order is the
    /// invocation order.
    fn install_event_listeners(&self, managers: &Arc<GcsManagers>, default_reactor: &Reactor) {
        // Node added: capacity first, then retry everything that was
        // waiting for a node, then start health checking.
        {
            let resource_manager = managers.resource_manager.clone();
            let placement_group_manager = managers.placement_group_manager.clone();
            let actor_manager = managers.actor_manager.clone();
            let autoscaler_state_manager = managers.autoscaler_state_manager.clone();
            let raylet_client_pool = self.raylet_client_pool.clone();
            let health_check_manager = managers.health_check_manager.clone();
            let cluster_task_manager = managers.cluster_task_manager.clone();
            managers.node_manager.add_node_added_listener(Box::new(move |record| {
                resource_manager.on_node_add(record);
                placement_group_manager.on_node_add(&record.node_id);
                actor_manager.schedule_pending_actors();
                autoscaler_state_manager.on_node_add(record);
                let client = raylet_client_pool.get_or_connect_by_address(&record.address());
                match client.channel() {
                    Some(channel) => health_check_manager.add_node(record.node_id, channel),
                    None => {
                        tracing::warn!(node_id = %record.node_id, "No channel for health checking")
                    }
                }
                cluster_task_manager.schedule_and_dispatch_tasks();
            }));
        }

        // Node removed: mark state dead everywhere, drop connections, stop
        // health checking, prune pubsub.
        {
            let resource_manager = managers.resource_manager.clone();
            let placement_group_manager = managers.placement_group_manager.clone();
            let actor_manager = managers.actor_manager.clone();
            let job_manager = managers.job_manager.clone();
            let raylet_client_pool = self.raylet_client_pool.clone();
            let worker_client_pool = self.worker_client_pool.clone();
            let health_check_manager = managers.health_check_manager.clone();
            let pubsub_handler = self.pubsub_handler.clone();
            let autoscaler_state_manager = managers.autoscaler_state_manager.clone();
            let reactor = default_reactor.clone();
            managers.node_manager.add_node_removed_listener(Box::new(move |record| {
                let node_id = record.node_id;
                resource_manager.on_node_dead(&node_id);
                placement_group_manager.on_node_dead(&node_id);
                actor_manager.on_node_dead(&node_id, &record.node_manager_address);
                {
                    let job_manager = job_manager.clone();
                    reactor.spawn(async move {
                        job_manager.on_node_dead(&node_id).await;
                    });
                }
                raylet_client_pool.disconnect(&node_id);
                worker_client_pool.disconnect_node(&node_id);
                health_check_manager.remove_node(&node_id);
                pubsub_handler.remove_subscriber_from(node_id.as_bytes());
                autoscaler_state_manager.on_node_dead(&node_id);
            }));
        }

        // Worker dead.
        {
            let worker_client_pool = self.worker_client_pool.clone();
            let actor_manager = managers.actor_manager.clone();
            let placement_group_manager = managers.placement_group_manager.clone();
            let pubsub_handler = self.pubsub_handler.clone();
            let task_manager = managers.task_manager.clone();
            managers.worker_manager.add_worker_dead_listener(Box::new(move |record| {
                worker_client_pool.disconnect_worker(&record.worker_id);
                actor_manager.on_worker_dead(
                    &record.node_id,
                    &record.worker_id,
                    record.creation_task_exception.clone(),
                );
                placement_group_manager.handle_waiting_removed_bundles();
                pubsub_handler.remove_subscriber_from(record.worker_id.as_bytes());
                task_manager.on_worker_dead(record);
            }));
        }

        // Job finished.
        {
            let task_manager = managers.task_manager.clone();
            let placement_group_manager = managers.placement_group_manager.clone();
            managers.job_manager.add_job_finished_listener(Box::new(move |record| {
                task_manager.on_job_finished(&record.job_id, record.end_time_ms);
                placement_group_manager
                    .clean_placement_group_if_needed_when_job_dead(&record.job_id);
            }));
        }

        // Resource change only matters when the control plane itself
        // schedules actors.
        if self.config.config.gcs_actor_scheduling_enabled {
            let placement_group_manager = managers.placement_group_manager.clone();
            let cluster_task_manager = managers.cluster_task_manager.clone();
            let reactor = default_reactor.clone();
            managers.resource_manager.add_resources_changed_listener(Box::new(move || {
                let placement_group_manager = placement_group_manager.clone();
                let cluster_task_manager = cluster_task_manager.clone();
                reactor.post("GcsServer.schedule_on_resources_changed", move || {
                    placement_group_manager.schedule_pending_placement_groups();
                    cluster_task_manager.schedule_and_dispatch_tasks();
                });
            }));
        }
    }

    /// A worker client reported unavailable is only dropped once its node
    /// is gone or its raylet confirms the process died.
    fn install_worker_unavailable_callback(
        &self,
        managers: &Arc<GcsManagers>,
        default_reactor: &Reactor,
    ) {
        let node_manager = managers.node_manager.clone();
        let raylet_client_pool = self.raylet_client_pool.clone();
        let worker_client_pool = Arc::downgrade(&self.worker_client_pool);
        let reactor = default_reactor.clone();
        self.worker_client_pool.set_unavailable_callback(Box::new(move |address| {
            let Some(pool) = Weak::upgrade(&worker_client_pool) else {
                return;
            };
            if node_manager.get_alive_node(&address.node_id).is_none() {
                pool.disconnect_worker(&address.worker_id);
                return;
            }
            let Some(raylet) = raylet_client_pool.get_or_connect_by_id(&address.node_id) else {
                return;
            };
            let worker_id = address.worker_id;
            reactor.spawn(async move {
                match raylet.is_local_worker_dead(&worker_id).await {
                    Ok(true) => {
                        tracing::info!(%worker_id, "Disconnecting dead worker client");
                        pool.disconnect_worker(&worker_id);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::info!(%worker_id, error = %e, "Failed to check worker liveness");
                    }
                }
            });
        }));
    }

    fn arm_periodic_timers(&self, default_reactor: &Reactor) {
        let mut runners = self.periodic_runners.lock();
        let managers = self.managers.as_ref().expect("managers built").clone();

        // Metrics at half the report interval so the exporter never reads
        // a stale window.
        {
            let managers = managers.clone();
            runners.push(PeriodicalRunner::start(
                default_reactor,
                Duration::from_millis(self.config.config.metrics_report_interval_ms / 2),
                "GcsServer.metrics_report",
                move || record_metrics(&managers),
            ));
        }

        // Debug dump plus the global GC attempt.
        {
            let managers = managers.clone();
            let publisher = self.publisher.clone();
            let pubsub_handler = self.pubsub_handler.clone();
            let reactors = self.reactors.clone();
            let log_dir = self.config.log_dir.clone();
            let throttler = self.global_gc_throttler.clone();
            let detected = self.task_pending_schedule_detected.clone();
            runners.push(PeriodicalRunner::start(
                default_reactor,
                Duration::from_millis(self.config.config.debug_dump_period_milliseconds),
                "GcsServer.debug_state_dump",
                move || {
                    if let Some(dir) = &log_dir {
                        let state =
                            build_debug_state(&managers, &publisher, &pubsub_handler, &reactors);
                        if let Err(e) = dump_debug_state_to_file(dir, &state) {
                            tracing::warn!(error = %e, "Failed to dump debug state");
                        }
                    }
                    try_global_gc(&managers, &throttler, &detected);
                },
            ));
        }

        // Reactor event stats print.
        if self.config.config.event_stats && self.config.config.event_stats_print_interval_ms > 0 {
            let reactors = self.reactors.clone();
            runners.push(PeriodicalRunner::start(
                default_reactor,
                Duration::from_millis(self.config.config.event_stats_print_interval_ms as u64),
                "GcsServer.event_stats_print",
                move || {
                    for reactor in reactors.all_reactors() {
                        tracing::info!(
                            reactor = reactor.name(),
                            stats = %reactor.stats().stats_string(),
                            "Reactor event stats"
                        );
                    }
                },
            ));
        }

        // Pull resource loads from every alive raylet; a failed pull only
        // skips that node's round.
        {
            let managers = managers.clone();
            let raylet_client_pool = self.raylet_client_pool.clone();
            let reactor = default_reactor.clone();
            runners.push(PeriodicalRunner::start(
                default_reactor,
                Duration::from_millis(
                    self.config.config.gcs_pull_resource_loads_period_milliseconds,
                ),
                "GcsServer.raylet_load_pull",
                move || {
                    for (node_id, record) in managers.node_manager.get_all_alive_nodes() {
                        let client = match raylet_client_pool.get_or_connect_by_id(&node_id) {
                            Some(client) => client,
                            None => raylet_client_pool.get_or_connect_by_address(&record.address()),
                        };
                        let resource_manager = managers.resource_manager.clone();
                        let autoscaler = managers.autoscaler_state_manager.clone();
                        reactor.spawn(async move {
                            match client.get_resource_load().await {
                                Ok(load) => {
                                    resource_manager.update_resource_loads(&node_id, load.clone());
                                    autoscaler.update_resource_load_and_usage(&node_id, load);
                                }
                                Err(e) => {
                                    tracing::debug!(
                                        %node_id,
                                        error = %e,
                                        "Failed to pull resource load; skipping this round"
                                    );
                                }
                            }
                        });
                    }
                },
            ));
        }
    }

    /// One global-GC check, as run by the debug-dump timer. Public so the
    /// behavior is testable without waiting for the timer.
    pub fn try_global_gc(&self) {
        try_global_gc(
            self.managers(),
            &self.global_gc_throttler,
            &self.task_pending_schedule_detected,
        );
    }

    pub fn debug_state(&self) -> String {
        build_debug_state(
            self.managers(),
            &self.publisher,
            &self.pubsub_handler,
            &self.reactors,
        )
    }

    /// Truncate-write the debug state file under the configured log dir.
    pub fn dump_debug_state(&self) -> HeliosResult<()> {
        let Some(dir) = &self.config.log_dir else {
            return Ok(());
        };
        dump_debug_state_to_file(dir, &self.debug_state())
    }

    pub fn stop(&mut self) {
        if self.is_stopped.load(Ordering::Acquire) {
            return;
        }
        tracing::info!("Stopping GCS server");

        self.periodic_runners.lock().clear();
        self.rpc_server.shutdown();
        self.reactors.shutdown_all();

        self.is_stopped.store(true, Ordering::Release);
        tracing::info!("GCS server stopped");
    }
}

impl Drop for GcsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Maintenance helpers ────────────────────────────────────────────────────

fn record_metrics(managers: &GcsManagers) {
    managers.actor_manager.record_metrics();
    managers.placement_group_manager.record_metrics();
    managers.task_manager.record_metrics();
    managers.job_manager.record_metrics();
}

/// Broadcast one should-global-gc command when the pending queue stayed
/// non-empty across consecutive checks and the throttler has a token.
fn try_global_gc(managers: &GcsManagers, throttler: &Throttler, detected: &AtomicU64) {
    if managers.cluster_task_manager.pending_queue_size() == 0 {
        detected.store(0, Ordering::Relaxed);
        return;
    }
    // Only after two consecutive detections, and under throttling, to
    // avoid spurious triggers.
    if detected.fetch_add(1, Ordering::Relaxed) > 0 && throttler.able_to_run() {
        managers.syncer.broadcast_message(SyncMessage {
            version: helios_util::time::current_time_ns() as i64,
            node_id: GCS_NODE_ID,
            payload: SyncPayload::Commands {
                should_global_gc: true,
            },
        });
        throttler.run_now();
    }
}

fn build_debug_state(
    managers: &GcsManagers,
    publisher: &GcsPublisher,
    pubsub_handler: &PubSubHandler,
    reactors: &ReactorPool,
) -> String {
    let mut state = String::from("Gcs Debug state:\n\n");
    for section in [
        managers.node_manager.debug_string(),
        managers.actor_manager.debug_string(),
        managers.resource_manager.debug_string(),
        managers.placement_group_manager.debug_string(),
        publisher.debug_string(),
        pubsub_handler.debug_string(),
        managers.runtime_env_manager.debug_string(),
        managers.task_manager.debug_string(),
        managers.cluster_task_manager.debug_string(),
        managers.health_check_manager.debug_string(),
        managers.syncer.debug_string(),
        managers.autoscaler_state_manager.debug_string(),
    ] {
        state.push_str(&section);
        state.push_str("\n\n");
    }
    for reactor in reactors.all_reactors() {
        state.push_str(&format!(
            "{} reactor event stats:\n{}\n",
            reactor.name(),
            reactor.stats().stats_string()
        ));
    }
    state
}

fn dump_debug_state_to_file(log_dir: &str, state: &str) -> HeliosResult<()> {
    let path = std::path::Path::new(log_dir).join(DEBUG_STATE_FILENAME);
    let mut file = std::fs::File::create(&path)
        .map_err(|e| HeliosError::io_error(format!("open {}: {e}", path.display())))?;
    file.write_all(state.as_bytes())
        .map_err(|e| HeliosError::io_error(format!("write {}: {e}", path.display())))?;
    Ok(())
}
