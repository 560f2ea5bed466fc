// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pull-based node health checking.
//!
//! Each tracked node gets a probe loop on the manager's reactor: after an
//! initial delay, a unary health check runs every period under a per-probe
//! deadline. A successful probe restores the failure budget; when
//! `failure_threshold` consecutive probes fail, the node's context is
//! removed atomically with the transition to failed, so the death callback
//! fires exactly once. Out-of-band liveness hints (the sync channel)
//! arrive through `mark_node_healthy` and can absorb a probe failure that
//! raced with them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use helios_common::config::HeliosConfig;
use helios_common::id::NodeID;
use helios_common::reactor::Reactor;

/// Callback invoked when a node is declared dead.
pub type NodeDeathCallback = Arc<dyn Fn(NodeID) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Delay before a new node's first probe (ms).
    pub initial_delay_ms: u64,
    /// Deadline of each probe RPC (ms).
    pub timeout_ms: u64,
    /// Interval between probes of one node (ms).
    pub period_ms: u64,
    /// Consecutive failures before the node is declared dead.
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            timeout_ms: 10_000,
            period_ms: 5_000,
            failure_threshold: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn from_helios_config(config: &HeliosConfig) -> Self {
        Self {
            initial_delay_ms: config.health_check_initial_delay_ms,
            timeout_ms: config.health_check_timeout_ms,
            period_ms: config.health_check_period_ms,
            failure_threshold: config.health_check_failure_threshold,
        }
    }
}

/// Per-node probe state.
struct HealthCheckContext {
    health_check_remaining: u32,
    /// Freshest proof of liveness, from probes or out-of-band hints.
    latest_known_healthy_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    cancel_tx: mpsc::Sender<()>,
}

pub struct GcsHealthCheckManager {
    reactor: Reactor,
    config: HealthCheckConfig,
    /// Only living nodes are bookkept; a failed node's entry is removed
    /// together with the failed transition.
    contexts: Mutex<HashMap<NodeID, HealthCheckContext>>,
    on_node_death: NodeDeathCallback,
}

impl GcsHealthCheckManager {
    pub fn new(
        reactor: Reactor,
        config: HealthCheckConfig,
        on_node_death: NodeDeathCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            config,
            contexts: Mutex::new(HashMap::new()),
            on_node_death,
        })
    }

    /// Start tracking a node. Safe to call from any thread. Re-adding a
    /// node restarts its probe loop.
    pub fn add_node(self: &Arc<Self>, node_id: NodeID, channel: tonic::transport::Channel) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        {
            let mut contexts = self.contexts.lock();
            if let Some(previous) = contexts.insert(
                node_id,
                HealthCheckContext {
                    health_check_remaining: self.config.failure_threshold,
                    latest_known_healthy_at: None,
                    last_failure_at: None,
                    cancel_tx,
                },
            ) {
                // Stop the superseded probe loop.
                let _ = previous.cancel_tx.try_send(());
            }
        }

        let this = Arc::clone(self);
        let config = self.config.clone();
        self.reactor.spawn(async move {
            tokio::time::sleep(Duration::from_millis(config.initial_delay_ms)).await;

            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(config.period_ms)) => {
                        let probe_started_at = Instant::now();
                        let healthy =
                            check_node_health(channel.clone(), node_id, config.timeout_ms).await;
                        if !this.on_probe_result(node_id, healthy, probe_started_at) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Apply one probe outcome. Returns whether the loop should continue.
    fn on_probe_result(&self, node_id: NodeID, healthy: bool, probe_started_at: Instant) -> bool {
        let mut contexts = self.contexts.lock();
        let Some(ctx) = contexts.get_mut(&node_id) else {
            // Removed externally, or superseded by a re-add.
            return false;
        };

        if healthy {
            ctx.latest_known_healthy_at = Some(Instant::now());
            ctx.health_check_remaining = self.config.failure_threshold;
            return true;
        }

        // A liveness hint newer than this probe's start overrides the
        // failed probe.
        if ctx
            .latest_known_healthy_at
            .is_some_and(|at| at > probe_started_at)
        {
            ctx.health_check_remaining = self.config.failure_threshold;
            return true;
        }

        ctx.last_failure_at = Some(Instant::now());
        ctx.health_check_remaining = ctx.health_check_remaining.saturating_sub(1);
        tracing::debug!(
            %node_id,
            remaining = ctx.health_check_remaining,
            "Node health probe failed"
        );
        if ctx.health_check_remaining > 0 {
            return true;
        }

        // Removing the context together with the failed transition makes
        // the death callback exactly-once.
        contexts.remove(&node_id);
        drop(contexts);
        tracing::warn!(%node_id, "Node declared dead by health check");
        (self.on_node_death)(node_id);
        false
    }

    /// Stop tracking a node. Safe to call from any thread.
    pub fn remove_node(self: &Arc<Self>, node_id: &NodeID) {
        let this = Arc::clone(self);
        let node_id = *node_id;
        self.reactor.post("HealthCheck.remove_node", move || {
            if let Some(ctx) = this.contexts.lock().remove(&node_id) {
                let _ = ctx.cancel_tx.try_send(());
            }
        });
    }

    /// Out-of-band proof of recent liveness (e.g. the sync channel heard
    /// from the node). Refreshes the liveness timestamp and, when fresher
    /// than the last failure, restores the failure budget. Safe to call
    /// from any thread.
    pub fn mark_node_healthy(self: &Arc<Self>, node_id: NodeID) {
        let this = Arc::clone(self);
        self.reactor.post("HealthCheck.mark_node_healthy", move || {
            let now = Instant::now();
            let mut contexts = this.contexts.lock();
            if let Some(ctx) = contexts.get_mut(&node_id) {
                ctx.latest_known_healthy_at = Some(now);
                if ctx.last_failure_at.map_or(true, |failure| now > failure) {
                    ctx.health_check_remaining = this.config.failure_threshold;
                }
            }
        });
    }

    /// Nodes currently tracked and not failed.
    pub fn get_all_nodes(&self) -> Vec<NodeID> {
        self.contexts.lock().keys().copied().collect()
    }

    pub fn num_monitored_nodes(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsHealthCheckManager: {} monitored nodes",
            self.num_monitored_nodes()
        )
    }
}

/// One unary probe. The service name carries the node id so a shared
/// health endpoint can answer per node.
async fn check_node_health(
    channel: tonic::transport::Channel,
    node_id: NodeID,
    timeout_ms: u64,
) -> bool {
    use tonic_health::pb::health_check_response::ServingStatus;

    let mut client = tonic_health::pb::health_client::HealthClient::new(channel);
    let request = tonic_health::pb::HealthCheckRequest {
        service: node_id.hex(),
    };
    match tokio::time::timeout(Duration::from_millis(timeout_ms), client.check(request)).await {
        Ok(Ok(response)) => response.into_inner().status == ServingStatus::Serving as i32,
        // Non-ok status and deadline-exceeded both count as failures.
        _ => false,
    }
}
