// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Health-check tests against a real loopback health endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::TcpListenerStream;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

use helios_common::id::NodeID;
use helios_common::reactor::ReactorPool;
use helios_gcs::health_check_manager::{GcsHealthCheckManager, HealthCheckConfig};

fn make_nid(v: u8) -> NodeID {
    let mut data = [0u8; 28];
    data[0] = v;
    NodeID::from_binary(&data)
}

/// Serve grpc.health.v1 on an ephemeral loopback port. Returns the
/// reporter (to flip per-node status) and a channel to the server.
async fn start_health_endpoint() -> (HealthReporter, tonic::transport::Channel) {
    let (reporter, service) = tonic_health::server::health_reporter();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect_lazy();
    (reporter, channel)
}

#[tokio::test]
async fn test_healthy_node_is_never_failed() {
    let (mut reporter, channel) = start_health_endpoint().await;
    let nid = make_nid(1);
    reporter
        .set_service_status(nid.hex(), ServingStatus::Serving)
        .await;

    let pool = ReactorPool::new();
    let (tx, rx) = std::sync::mpsc::channel();
    let mgr = GcsHealthCheckManager::new(
        pool.default_reactor(),
        HealthCheckConfig {
            initial_delay_ms: 0,
            timeout_ms: 100,
            period_ms: 10,
            failure_threshold: 2,
        },
        Arc::new(move |node_id| {
            let _ = tx.send(node_id);
        }),
    );

    mgr.add_node(nid, channel);

    // Many probe periods pass; a node whose every probe succeeds must
    // never be declared dead.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());
    assert!(mgr.get_all_nodes().contains(&nid));
}

#[tokio::test]
async fn test_node_fails_after_status_flips() {
    let (mut reporter, channel) = start_health_endpoint().await;
    let nid = make_nid(2);
    reporter
        .set_service_status(nid.hex(), ServingStatus::Serving)
        .await;

    let pool = ReactorPool::new();
    let (tx, rx) = std::sync::mpsc::channel();
    let mgr = GcsHealthCheckManager::new(
        pool.default_reactor(),
        HealthCheckConfig {
            initial_delay_ms: 0,
            timeout_ms: 100,
            period_ms: 10,
            failure_threshold: 3,
        },
        Arc::new(move |node_id| {
            let _ = tx.send(node_id);
        }),
    );

    mgr.add_node(nid, channel);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mgr.get_all_nodes().contains(&nid));

    // The endpoint stays up but reports the node itself as down.
    reporter
        .set_service_status(nid.hex(), ServingStatus::NotServing)
        .await;

    let dead = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead, nid);
    assert!(!mgr.get_all_nodes().contains(&nid));
}

#[tokio::test]
async fn test_unknown_service_counts_as_failure() {
    // The endpoint serves, but never registered this node's id; probes
    // come back NOT_FOUND and the node dies.
    let (_reporter, channel) = start_health_endpoint().await;
    let nid = make_nid(3);

    let pool = ReactorPool::new();
    let (tx, rx) = std::sync::mpsc::channel();
    let mgr = GcsHealthCheckManager::new(
        pool.default_reactor(),
        HealthCheckConfig {
            initial_delay_ms: 0,
            timeout_ms: 100,
            period_ms: 10,
            failure_threshold: 2,
        },
        Arc::new(move |node_id| {
            let _ = tx.send(node_id);
        }),
    );

    mgr.add_node(nid, channel);
    let dead = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead, nid);
}
