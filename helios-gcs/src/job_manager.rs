// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job manager: job lifecycle and driver-node death handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use helios_common::id::{JobID, NodeID};
use helios_common::status::HeliosResult;

use crate::function_manager::GcsFunctionManager;
use crate::pubsub::{GcsPublisher, PubChannel, PubMessage};
use crate::runtime_env_manager::RuntimeEnvManager;
use crate::table_storage::{GcsInitData, GcsTableStorage};
use crate::types::JobRecord;

/// Callback invoked when a job finishes, with its final record.
pub type JobFinishedCallback = Box<dyn Fn(&JobRecord) + Send + Sync>;

pub struct GcsJobManager {
    /// job_id -> start time (ms) for running jobs.
    running_jobs: RwLock<HashMap<JobID, u64>>,
    /// All job records, including finished.
    job_records: RwLock<HashMap<JobID, JobRecord>>,
    finished_listeners: RwLock<Vec<JobFinishedCallback>>,
    finished_jobs_count: AtomicI64,
    table_storage: Arc<GcsTableStorage>,
    publisher: Arc<GcsPublisher>,
    function_manager: Arc<GcsFunctionManager>,
    runtime_env_manager: Arc<RuntimeEnvManager>,
}

impl GcsJobManager {
    pub fn new(
        table_storage: Arc<GcsTableStorage>,
        publisher: Arc<GcsPublisher>,
        function_manager: Arc<GcsFunctionManager>,
        runtime_env_manager: Arc<RuntimeEnvManager>,
    ) -> Self {
        Self {
            running_jobs: RwLock::new(HashMap::new()),
            job_records: RwLock::new(HashMap::new()),
            finished_listeners: RwLock::new(Vec::new()),
            finished_jobs_count: AtomicI64::new(0),
            table_storage,
            publisher,
            function_manager,
            runtime_env_manager,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut running = self.running_jobs.write();
        let mut records = self.job_records.write();
        for (job_id, record) in &init_data.jobs {
            if !record.is_dead {
                running.insert(*job_id, record.start_time_ms);
            }
            records.insert(*job_id, record.clone());
        }
    }

    pub async fn add_job(&self, record: JobRecord) -> HeliosResult<()> {
        let job_id = record.job_id;

        self.table_storage
            .job_table()
            .put(&job_id.hex(), &record)
            .await?;

        self.running_jobs.write().insert(job_id, record.start_time_ms);
        self.job_records.write().insert(job_id, record.clone());
        self.function_manager.add_job_reference(job_id);

        self.publish_job(&record);
        tracing::info!(%job_id, "Job added");
        Ok(())
    }

    pub async fn mark_job_finished(&self, job_id: &JobID) -> HeliosResult<()> {
        self.running_jobs.write().remove(job_id);

        let finished = {
            let mut records = self.job_records.write();
            match records.get_mut(job_id) {
                Some(record) => {
                    record.is_dead = true;
                    record.end_time_ms = helios_util::time::current_time_ms();
                    Some(record.clone())
                }
                None => None,
            }
        };

        let Some(record) = finished else {
            return Ok(());
        };

        self.table_storage
            .job_table()
            .put(&job_id.hex(), &record)
            .await?;
        self.finished_jobs_count.fetch_add(1, Ordering::Relaxed);

        self.function_manager.remove_job_reference(*job_id).await;
        self.runtime_env_manager.remove_uri_reference(&job_id.hex());

        self.publish_job(&record);
        for listener in self.finished_listeners.read().iter() {
            listener(&record);
        }

        tracing::info!(%job_id, "Job finished");
        Ok(())
    }

    /// Finish every job whose driver lived on the dead node.
    pub async fn on_node_dead(&self, node_id: &NodeID) {
        let doomed: Vec<JobID> = {
            let running = self.running_jobs.read();
            let records = self.job_records.read();
            running
                .keys()
                .filter(|job_id| {
                    records
                        .get(job_id)
                        .map(|r| r.driver_node_id == *node_id)
                        .unwrap_or(false)
                })
                .copied()
                .collect()
        };
        for job_id in doomed {
            tracing::info!(%job_id, %node_id, "Finishing job whose driver node died");
            if let Err(e) = self.mark_job_finished(&job_id).await {
                tracing::warn!(%job_id, error = %e, "Failed to finish job of dead node");
            }
        }
    }

    fn publish_job(&self, record: &JobRecord) {
        if let Ok(payload) = serde_json::to_vec(record) {
            self.publisher.publish(PubMessage {
                channel: PubChannel::Job,
                key: record.job_id.binary(),
                payload,
            });
        }
    }

    pub fn add_job_finished_listener(&self, callback: JobFinishedCallback) {
        self.finished_listeners.write().push(callback);
    }

    pub async fn get_next_job_id(&self) -> HeliosResult<JobID> {
        let next = self.table_storage.store_client().get_next_job_id().await?;
        Ok(JobID::from_int(next as u32))
    }

    pub fn get_all_job_info(&self, limit: Option<usize>) -> Vec<JobRecord> {
        let records = self.job_records.read();
        match limit {
            Some(limit) => records.values().take(limit).cloned().collect(),
            None => records.values().cloned().collect(),
        }
    }

    pub fn num_running_jobs(&self) -> usize {
        self.running_jobs.read().len()
    }

    pub fn finished_jobs_count(&self) -> i64 {
        self.finished_jobs_count.load(Ordering::Relaxed)
    }

    pub fn record_metrics(&self) {
        tracing::debug!(
            running = self.num_running_jobs(),
            finished = self.finished_jobs_count(),
            "job manager metrics"
        );
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsJobManager: {} running, {} finished",
            self.num_running_jobs(),
            self.finished_jobs_count()
        )
    }
}
