// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-worker context: current task/actor/job IDs and index counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use helios_common::id::{ActorID, JobID, TaskID, WorkerID};

/// The kind of process this context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    Driver,
    Worker,
}

/// Per-worker mutable context tracking the current task, actor, and job.
pub struct WorkerContext {
    worker_type: WorkerType,
    worker_id: WorkerID,
    /// Thread the worker executes tasks on; blocking-call resource release
    /// only applies there.
    main_thread_id: ThreadId,
    current_job_id: parking_lot::Mutex<JobID>,
    current_task_id: parking_lot::Mutex<TaskID>,
    current_actor_id: parking_lot::Mutex<ActorID>,
    task_index: AtomicU64,
    put_index: AtomicU64,
}

impl WorkerContext {
    /// Create a new worker context. The calling thread becomes the
    /// worker's main thread.
    pub fn new(worker_type: WorkerType, worker_id: WorkerID, job_id: JobID) -> Self {
        Self {
            worker_type,
            worker_id,
            main_thread_id: std::thread::current().id(),
            current_job_id: parking_lot::Mutex::new(job_id),
            current_task_id: parking_lot::Mutex::new(TaskID::nil()),
            current_actor_id: parking_lot::Mutex::new(ActorID::nil()),
            task_index: AtomicU64::new(0),
            put_index: AtomicU64::new(0),
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker_id
    }

    pub fn current_job_id(&self) -> JobID {
        *self.current_job_id.lock()
    }

    pub fn set_current_job_id(&self, job_id: JobID) {
        *self.current_job_id.lock() = job_id;
    }

    pub fn current_task_id(&self) -> TaskID {
        *self.current_task_id.lock()
    }

    pub fn set_current_task_id(&self, task_id: TaskID) {
        *self.current_task_id.lock() = task_id;
        // A new task starts fresh index counters.
        self.task_index.store(0, Ordering::Relaxed);
        self.put_index.store(0, Ordering::Relaxed);
    }

    pub fn current_actor_id(&self) -> ActorID {
        *self.current_actor_id.lock()
    }

    pub fn set_current_actor_id(&self, actor_id: ActorID) {
        *self.current_actor_id.lock() = actor_id;
    }

    /// Get the next task index (atomically incremented).
    pub fn get_next_task_index(&self) -> u64 {
        self.task_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the next put index (atomically incremented).
    pub fn get_next_put_index(&self) -> u64 {
        self.put_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a blocking get from the current thread should release the
    /// worker's resources back to the scheduler. Only non-actor task
    /// workers on their main thread qualify.
    pub fn should_release_resources_on_blocking_calls(&self) -> bool {
        self.worker_type == WorkerType::Worker
            && self.current_actor_id().is_nil()
            && std::thread::current().id() == self.main_thread_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ctx(worker_type: WorkerType) -> WorkerContext {
        WorkerContext::new(worker_type, WorkerID::from_random(), JobID::from_int(1))
    }

    #[test]
    fn test_worker_context_basic() {
        let ctx = make_ctx(WorkerType::Worker);
        assert_eq!(ctx.worker_type(), WorkerType::Worker);
        assert_eq!(ctx.current_job_id(), JobID::from_int(1));
        assert!(ctx.current_task_id().is_nil());
        assert!(ctx.current_actor_id().is_nil());
    }

    #[test]
    fn test_set_current_task_resets_counters() {
        let ctx = make_ctx(WorkerType::Worker);
        assert_eq!(ctx.get_next_task_index(), 0);
        assert_eq!(ctx.get_next_task_index(), 1);
        ctx.set_current_task_id(TaskID::from_random());
        assert_eq!(ctx.get_next_task_index(), 0);
        assert_eq!(ctx.get_next_put_index(), 0);
    }

    #[test]
    fn test_worker_on_main_thread_releases_resources() {
        let ctx = make_ctx(WorkerType::Worker);
        assert!(ctx.should_release_resources_on_blocking_calls());
    }

    #[test]
    fn test_driver_never_releases_resources() {
        let ctx = make_ctx(WorkerType::Driver);
        assert!(!ctx.should_release_resources_on_blocking_calls());
    }

    #[test]
    fn test_actor_task_does_not_release_resources() {
        let ctx = make_ctx(WorkerType::Worker);
        ctx.set_current_actor_id(ActorID::of(&JobID::from_int(1), &TaskID::nil(), 0));
        assert!(!ctx.should_release_resources_on_blocking_calls());
    }

    #[test]
    fn test_off_main_thread_does_not_release_resources() {
        let ctx = std::sync::Arc::new(make_ctx(WorkerType::Worker));
        let ctx_clone = ctx.clone();
        let off_main = std::thread::spawn(move || {
            ctx_clone.should_release_resources_on_blocking_calls()
        })
        .join()
        .unwrap();
        assert!(!off_main);
        assert!(ctx.should_release_resources_on_blocking_calls());
    }
}
