// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task manager: task-event bookkeeping driven by job and worker
//! lifecycle events. Runs on its own named reactor so event ingestion
//! cannot stall the default reactor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use helios_common::id::JobID;
use helios_common::reactor::Reactor;

use crate::types::WorkerRecord;
use crate::usage_stats::UsageStatsClient;

pub struct GcsTaskManager {
    reactor: Reactor,
    /// job_id -> end time (ms) recorded when the job finished.
    job_end_times: RwLock<HashMap<JobID, u64>>,
    dead_worker_events: AtomicU64,
    usage_stats_client: Mutex<Option<Arc<UsageStatsClient>>>,
}

impl GcsTaskManager {
    pub fn new(reactor: Reactor) -> Self {
        Self {
            reactor,
            job_end_times: RwLock::new(HashMap::new()),
            dead_worker_events: AtomicU64::new(0),
            usage_stats_client: Mutex::new(None),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn set_usage_stats_client(&self, client: Arc<UsageStatsClient>) {
        *self.usage_stats_client.lock() = Some(client);
    }

    /// Record a job's end time; task events arriving later for this job
    /// are attributed to a finished job.
    pub fn on_job_finished(&self, job_id: &JobID, end_time_ms: u64) {
        self.job_end_times.write().insert(*job_id, end_time_ms);
        let job_id = *job_id;
        self.reactor.post("GcsTaskManager.on_job_finished", move || {
            tracing::debug!(%job_id, "Marked task events of finished job");
        });
    }

    /// Attribute in-flight task events of the dead worker.
    pub fn on_worker_dead(&self, record: &WorkerRecord) {
        self.dead_worker_events.fetch_add(1, Ordering::Relaxed);
        let worker_id = record.worker_id;
        self.reactor.post("GcsTaskManager.on_worker_dead", move || {
            tracing::debug!(%worker_id, "Marked task events of dead worker");
        });
    }

    pub fn job_end_time(&self, job_id: &JobID) -> Option<u64> {
        self.job_end_times.read().get(job_id).copied()
    }

    pub fn dead_worker_events(&self) -> u64 {
        self.dead_worker_events.load(Ordering::Relaxed)
    }

    pub fn record_metrics(&self) {
        tracing::debug!(
            finished_jobs = self.job_end_times.read().len(),
            dead_workers = self.dead_worker_events(),
            "task manager metrics"
        );
    }

    pub fn debug_string(&self) -> String {
        format!(
            "GcsTaskManager: {} finished jobs, {} dead worker events",
            self.job_end_times.read().len(),
            self.dead_worker_events()
        )
    }
}
