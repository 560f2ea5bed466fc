// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end tests of the GCS server bootstrap and event wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use helios_common::config::HeliosConfig;
use helios_common::id::{ActorID, JobID, NodeID, TaskID, WorkerID};
use helios_gcs::server::{GcsServer, GcsServerConfig};
use helios_gcs::store_client::{InMemoryStoreClient, StoreClient};
use helios_gcs::syncer::SyncPayload;
use helios_gcs::types::{
    ActorRecord, ActorState, JobRecord, NodeRecord, NodeState, WorkerExitType, WorkerRecord,
};
use helios_rpc::{RayletClientPool, WorkerClientPool};

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
        // Nothing listens here; health probes against this address fail.
        node_manager_port: 1,
        resources_total: HashMap::from([("CPU".to_string(), 4.0)]),
        start_time_ms: helios_util::time::current_time_ms(),
        end_time_ms: 0,
    }
}

fn make_job_record(id: u32, driver_node: u8) -> JobRecord {
    JobRecord {
        job_id: JobID::from_int(id),
        is_dead: false,
        driver_node_id: node_id(driver_node),
        namespace: "default".to_string(),
        start_time_ms: helios_util::time::current_time_ms(),
        end_time_ms: 0,
    }
}

async fn started_server(config: GcsServerConfig) -> GcsServer {
    let mut server = GcsServer::new(config).unwrap();
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn test_bootstrap_in_memory() {
    let mut server = started_server(GcsServerConfig::default()).await;

    assert!(server.is_started());
    assert!(server.rpc_server().is_started());
    assert!(server.rpc_server().cluster_id().is_some());

    // Construction order shows up as service registration order.
    let services = server.rpc_server().registered_services();
    assert_eq!(services.first().map(String::as_str), Some("NodeInfo"));
    assert!(services.contains(&"InternalKV".to_string()));
    assert!(services.contains(&"AutoscalerState".to_string()));

    // The managers agree on the cluster id.
    assert_eq!(
        server.managers().node_manager.cluster_id(),
        server.rpc_server().cluster_id()
    );

    // Starting twice is refused.
    assert!(server.start().await.is_err());
    server.stop();
}

#[tokio::test]
async fn test_unknown_storage_type_is_fatal() {
    let config = GcsServerConfig {
        config: HeliosConfig {
            gcs_storage: "papyrus".to_string(),
            ..HeliosConfig::default()
        },
        ..GcsServerConfig::default()
    };
    assert!(GcsServer::new(config).is_err());
}

#[tokio::test]
async fn test_cluster_id_survives_restart() {
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());

    let first_id = {
        let mut server = GcsServer::new_with_storage(
            GcsServerConfig::default(),
            store.clone(),
            Arc::new(RayletClientPool::with_default_factory()),
            Arc::new(WorkerClientPool::with_default_factory()),
        )
        .unwrap();
        server.start().await.unwrap();
        let id = server.rpc_server().cluster_id().unwrap();
        server.stop();
        id
    };

    let mut server = GcsServer::new_with_storage(
        GcsServerConfig::default(),
        store,
        Arc::new(RayletClientPool::with_default_factory()),
        Arc::new(WorkerClientPool::with_default_factory()),
    )
    .unwrap();
    server.start().await.unwrap();
    assert_eq!(server.rpc_server().cluster_id(), Some(first_id));
    server.stop();
}

#[tokio::test]
async fn test_node_added_event_wiring() {
    let server = started_server(GcsServerConfig::default()).await;
    let managers = server.managers().clone();

    // A pending actor and a queued task wait for capacity.
    managers
        .actor_manager
        .register_actor(ActorRecord {
            actor_id: ActorID::of(&JobID::from_int(1), &TaskID::nil(), 0),
            job_id: JobID::from_int(1),
            state: ActorState::Pending,
            name: "a".to_string(),
            node_id: None,
            worker_id: None,
            creation_task_exception: None,
        })
        .await
        .unwrap();
    managers.cluster_task_manager.queue_task(TaskID::from_random());

    managers.node_manager.register_node(make_node_record(1)).await.unwrap();

    assert_eq!(managers.resource_manager.num_nodes(), 1);
    assert_eq!(managers.autoscaler_state_manager.num_nodes(), 1);
    assert_eq!(managers.actor_manager.num_pending_actors(), 0);
    assert_eq!(managers.cluster_task_manager.pending_queue_size(), 0);
    assert!(managers.health_check_manager.get_all_nodes().contains(&node_id(1)));
    assert_eq!(server.raylet_client_pool().num_connected(), 1);
}

#[tokio::test]
async fn test_node_removed_event_wiring() {
    let server = started_server(GcsServerConfig::default()).await;
    let managers = server.managers().clone();

    managers.node_manager.register_node(make_node_record(1)).await.unwrap();
    managers.job_manager.add_job(make_job_record(1, 1)).await.unwrap();

    managers.node_manager.unregister_node(&node_id(1)).await.unwrap();

    assert_eq!(managers.resource_manager.num_nodes(), 0);
    assert_eq!(managers.autoscaler_state_manager.num_nodes(), 0);
    assert_eq!(server.raylet_client_pool().num_connected(), 0);

    // Health-check removal and driver-job cleanup hop through reactors.
    for _ in 0..100 {
        if managers.health_check_manager.num_monitored_nodes() == 0
            && managers.job_manager.num_running_jobs() == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(managers.health_check_manager.num_monitored_nodes(), 0);
    assert_eq!(managers.job_manager.num_running_jobs(), 0);
}

#[tokio::test]
async fn test_worker_dead_event_wiring() {
    let server = started_server(GcsServerConfig::default()).await;
    let managers = server.managers().clone();

    managers.node_manager.register_node(make_node_record(1)).await.unwrap();

    let worker_id = WorkerID::from_random();
    let actor_id = ActorID::of(&JobID::from_int(1), &TaskID::nil(), 0);
    managers
        .actor_manager
        .register_actor(ActorRecord {
            actor_id,
            job_id: JobID::from_int(1),
            state: ActorState::Pending,
            name: "a".to_string(),
            node_id: Some(node_id(1)),
            worker_id: Some(worker_id),
            creation_task_exception: None,
        })
        .await
        .unwrap();

    managers
        .worker_manager
        .report_worker_failure(WorkerRecord {
            worker_id,
            node_id: node_id(1),
            ip_address: "127.0.0.1".to_string(),
            port: 30000,
            is_alive: true,
            exit_type: Some(WorkerExitType::SystemError),
            exit_detail: "oom".to_string(),
            creation_task_exception: Some("creation failed".to_string()),
        })
        .await
        .unwrap();

    let record = managers.actor_manager.get_actor(&actor_id).unwrap();
    assert_eq!(record.state, ActorState::Dead);
    assert_eq!(record.creation_task_exception.as_deref(), Some("creation failed"));
    assert_eq!(managers.task_manager.dead_worker_events(), 1);
}

#[tokio::test]
async fn test_job_finished_event_wiring() {
    let server = started_server(GcsServerConfig::default()).await;
    let managers = server.managers().clone();

    managers.job_manager.add_job(make_job_record(3, 1)).await.unwrap();
    managers
        .job_manager
        .mark_job_finished(&JobID::from_int(3))
        .await
        .unwrap();

    let end_time = managers.task_manager.job_end_time(&JobID::from_int(3));
    assert!(end_time.is_some());
    assert!(end_time.unwrap() > 0);
}

#[tokio::test]
async fn test_global_gc_requires_two_detections_and_throttles() {
    let server = started_server(GcsServerConfig::default()).await;
    let managers = server.managers().clone();

    // Pending work with zero nodes cannot be placed.
    managers.cluster_task_manager.queue_task(TaskID::from_random());

    server.try_global_gc();
    assert_eq!(managers.syncer.broadcast_count(), 0);

    server.try_global_gc();
    assert_eq!(managers.syncer.broadcast_count(), 1);
    match managers.syncer.last_broadcast().unwrap().payload {
        SyncPayload::Commands { should_global_gc } => assert!(should_global_gc),
        other => panic!("expected a commands message, got {other:?}"),
    }

    // The throttler holds the token for the configured interval.
    server.try_global_gc();
    assert_eq!(managers.syncer.broadcast_count(), 1);
}

#[tokio::test]
async fn test_debug_dump_writes_file() {
    let log_dir = std::env::temp_dir().join(format!(
        "helios_gcs_debug_{}",
        helios_util::time::current_time_ns()
    ));
    std::fs::create_dir_all(&log_dir).unwrap();

    let config = GcsServerConfig {
        log_dir: Some(log_dir.to_string_lossy().into_owned()),
        ..GcsServerConfig::default()
    };
    let server = started_server(config).await;
    server.dump_debug_state().unwrap();

    let contents = std::fs::read_to_string(log_dir.join("debug_state_gcs.txt")).unwrap();
    assert!(contents.contains("Gcs Debug state:"));
    assert!(contents.contains("GcsNodeManager"));
    assert!(contents.contains("reactor event stats"));

    std::fs::remove_dir_all(&log_dir).ok();
}

#[tokio::test]
async fn test_unhealthy_node_is_removed_end_to_end() {
    // Tight health-check timings; the registered node's address points at
    // a closed port, so every probe fails.
    let config = GcsServerConfig {
        config: HeliosConfig {
            health_check_initial_delay_ms: 0,
            health_check_timeout_ms: 20,
            health_check_period_ms: 10,
            health_check_failure_threshold: 3,
            ..HeliosConfig::default()
        },
        ..GcsServerConfig::default()
    };
    let server = started_server(config).await;
    let managers = server.managers().clone();

    managers.node_manager.register_node(make_node_record(7)).await.unwrap();
    assert!(managers.node_manager.is_node_alive(&node_id(7)));

    for _ in 0..500 {
        if managers.node_manager.is_node_dead(&node_id(7)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(managers.node_manager.is_node_dead(&node_id(7)));
    assert!(!managers.health_check_manager.get_all_nodes().contains(&node_id(7)));
}
