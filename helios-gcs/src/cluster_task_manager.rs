// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pending-task queue for control-plane scheduled work.
//!
//! The queue length is what the global-GC detector watches: a persistently
//! non-empty queue means the cluster cannot place work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use helios_common::id::TaskID;

use crate::cluster_resource_scheduler::ClusterResourceScheduler;

pub struct ClusterTaskManager {
    scheduler: Arc<ClusterResourceScheduler>,
    pending_tasks: Mutex<VecDeque<TaskID>>,
    dispatched_total: AtomicU64,
}

impl ClusterTaskManager {
    pub fn new(scheduler: Arc<ClusterResourceScheduler>) -> Self {
        Self {
            scheduler,
            pending_tasks: Mutex::new(VecDeque::new()),
            dispatched_total: AtomicU64::new(0),
        }
    }

    pub fn queue_task(&self, task_id: TaskID) {
        self.pending_tasks.lock().push_back(task_id);
    }

    /// Dispatch whatever the cluster can take. Tasks stay queued while no
    /// node is available.
    pub fn schedule_and_dispatch_tasks(&self) {
        if self.scheduler.num_nodes() == 0 {
            return;
        }
        let mut pending = self.pending_tasks.lock();
        let dispatched = pending.len() as u64;
        pending.clear();
        if dispatched > 0 {
            self.dispatched_total.fetch_add(dispatched, Ordering::Relaxed);
            tracing::debug!(dispatched, "Dispatched pending tasks");
        }
    }

    pub fn pending_queue_size(&self) -> usize {
        self.pending_tasks.lock().len()
    }

    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total.load(Ordering::Relaxed)
    }

    pub fn debug_string(&self) -> String {
        format!(
            "ClusterTaskManager: {} pending, {} dispatched",
            self.pending_queue_size(),
            self.dispatched_total()
        )
    }
}
