// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker manager: records worker failures and fans them out to the
//! registered worker-dead listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use helios_common::status::HeliosResult;

use crate::pubsub::{GcsPublisher, PubChannel, PubMessage};
use crate::table_storage::GcsTableStorage;
use crate::types::WorkerRecord;
use crate::usage_stats::UsageStatsClient;

/// Callback invoked with the failure record of a dead worker.
pub type WorkerDeadCallback = Box<dyn Fn(&WorkerRecord) + Send + Sync>;

pub struct GcsWorkerManager {
    table_storage: Arc<GcsTableStorage>,
    publisher: Arc<GcsPublisher>,
    worker_dead_listeners: RwLock<Vec<WorkerDeadCallback>>,
    dead_workers_count: AtomicU64,
    usage_stats_client: Mutex<Option<Arc<UsageStatsClient>>>,
}

impl GcsWorkerManager {
    pub fn new(table_storage: Arc<GcsTableStorage>, publisher: Arc<GcsPublisher>) -> Self {
        Self {
            table_storage,
            publisher,
            worker_dead_listeners: RwLock::new(Vec::new()),
            dead_workers_count: AtomicU64::new(0),
            usage_stats_client: Mutex::new(None),
        }
    }

    pub fn set_usage_stats_client(&self, client: Arc<UsageStatsClient>) {
        *self.usage_stats_client.lock() = Some(client);
    }

    /// Record a worker failure, persist it, publish the delta, and invoke
    /// the listeners in registration order.
    pub async fn report_worker_failure(&self, mut record: WorkerRecord) -> HeliosResult<()> {
        record.is_alive = false;
        let worker_id = record.worker_id;

        self.table_storage
            .worker_table()
            .put(&worker_id.hex(), &record)
            .await?;
        self.dead_workers_count.fetch_add(1, Ordering::Relaxed);

        if let Ok(payload) = serde_json::to_vec(&record) {
            self.publisher.publish(PubMessage {
                channel: PubChannel::WorkerDelta,
                key: worker_id.binary(),
                payload,
            });
        }

        for listener in self.worker_dead_listeners.read().iter() {
            listener(&record);
        }

        tracing::info!(%worker_id, exit_detail = %record.exit_detail, "Worker failure reported");
        Ok(())
    }

    pub fn add_worker_dead_listener(&self, callback: WorkerDeadCallback) {
        self.worker_dead_listeners.write().push(callback);
    }

    pub fn dead_workers_count(&self) -> u64 {
        self.dead_workers_count.load(Ordering::Relaxed)
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsWorkerManager: {} dead workers reported",
            self.dead_workers_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::ALL_CHANNELS;
    use crate::store_client::InMemoryStoreClient;
    use crate::types::WorkerExitType;
    use helios_common::id::{NodeID, WorkerID};
    use helios_common::reactor::ReactorPool;

    fn make_record() -> WorkerRecord {
        WorkerRecord {
            worker_id: WorkerID::from_random(),
            node_id: NodeID::from_random(),
            ip_address: "127.0.0.1".to_string(),
            port: 30000,
            is_alive: true,
            exit_type: Some(WorkerExitType::SystemError),
            exit_detail: "killed".to_string(),
            creation_task_exception: None,
        }
    }

    fn make_manager(pool: &ReactorPool) -> GcsWorkerManager {
        let storage = Arc::new(GcsTableStorage::new(Arc::new(InMemoryStoreClient::new())));
        let publisher = Arc::new(GcsPublisher::new(
            ALL_CHANNELS.to_vec(),
            pool.by_name("publisher"),
        ));
        GcsWorkerManager::new(storage, publisher)
    }

    #[tokio::test]
    async fn test_failure_is_persisted_and_published() {
        let pool = ReactorPool::new();
        let mgr = make_manager(&pool);
        let record = make_record();
        let worker_id = record.worker_id;

        mgr.report_worker_failure(record).await.unwrap();
        assert_eq!(mgr.dead_workers_count(), 1);
        assert_eq!(mgr.publisher.publish_count(PubChannel::WorkerDelta), 1);

        let stored = mgr
            .table_storage
            .worker_table()
            .get(&worker_id.hex())
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_alive);
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let pool = ReactorPool::new();
        let mgr = make_manager(&pool);

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["pool", "actors", "tasks"] {
            let order = order.clone();
            mgr.add_worker_dead_listener(Box::new(move |_| order.lock().push(tag)));
        }

        mgr.report_worker_failure(make_record()).await.unwrap();
        assert_eq!(order.lock().as_slice(), &["pool", "actors", "tasks"]);
    }
}
