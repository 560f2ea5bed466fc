// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The worker-local in-memory object store.
//!
//! One mutex guards the object map, the pending-waiter tables, and the
//! occupancy counters. Each blocking `GetRequest` carries its own
//! mutex/condvar pair so a put wakes exactly the waiters interested in the
//! delivered id. Async get callbacks are drained under the store lock but
//! always dispatched through the reactor; they never run inline or under
//! any lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use helios_common::config::HeliosConfig;
use helios_common::id::ObjectID;
use helios_common::reactor::Reactor;
use helios_common::status::{HeliosError, HeliosResult};
use helios_rpc::RayletClient;

use crate::context::WorkerContext;
use crate::object::{ErrorKind, HeliosObject};

/// External reference tracking attached to the store. When present it takes
/// over entry-removal decisions (see `RefCountedRemovePolicy`).
pub trait ReferenceCounter: Send + Sync {
    fn has_reference(&self, object_id: &ObjectID) -> bool;
}

/// What `remove_after_get` means while a reference counter is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefCountedRemovePolicy {
    /// The entry stays in the store; the reference counter governs its
    /// eventual deletion through an explicit `delete`.
    #[default]
    Retain,
    /// `remove_after_get` removes the entry regardless of the counter.
    Remove,
}

/// Store tunables, threaded in explicitly.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Upper bound on one slice of a blocking wait, so signal checks stay
    /// responsive.
    pub check_signal_interval_ms: i64,
    /// Age before an unobserved error object is reported as unhandled.
    pub unhandled_error_grace_period_ms: u64,
    /// Cap on entries examined per unhandled-error scan. Entries beyond the
    /// cap are best-effort: they surface on a later scan or on delete, in
    /// unspecified order.
    pub unhandled_error_scan_limit: usize,
    pub ref_counted_remove_policy: RefCountedRemovePolicy,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            check_signal_interval_ms: 100,
            unhandled_error_grace_period_ms: 5_000,
            unhandled_error_scan_limit: 1_000,
            ref_counted_remove_policy: RefCountedRemovePolicy::default(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn from_helios_config(config: &HeliosConfig) -> Self {
        Self {
            check_signal_interval_ms: config.check_signal_interval_milliseconds,
            unhandled_error_grace_period_ms: config.unhandled_error_grace_period_ms,
            unhandled_error_scan_limit: config.unhandled_error_scan_limit,
            ref_counted_remove_policy: RefCountedRemovePolicy::default(),
        }
    }
}

/// Occupancy counters reported by `MemoryStore::stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStoreStats {
    pub num_in_plasma: i64,
    pub num_local_objects: i64,
    pub num_local_objects_bytes: i64,
}

type AsyncGetCallback = Box<dyn FnOnce(Arc<HeliosObject>) + Send>;
type SignalCheck = Box<dyn Fn() -> HeliosResult<()> + Send + Sync>;
type UnhandledExceptionHandler = Box<dyn Fn(&HeliosObject) + Send + Sync>;
type ObjectAllocator = Box<dyn Fn(HeliosObject, &ObjectID) -> Arc<HeliosObject> + Send + Sync>;

// ─── GetRequest ─────────────────────────────────────────────────────────────

struct GetRequestState {
    fulfilled: HashMap<ObjectID, Arc<HeliosObject>>,
    is_ready: bool,
}

/// An in-flight blocking multi-object get.
///
/// Owned jointly by the blocked caller and by every pending-waiter list it
/// was registered under; the caller removes it from all lists before
/// returning.
struct GetRequest {
    object_ids: HashSet<ObjectID>,
    num_objects: usize,
    remove_after_get: bool,
    abort_if_any_exception: bool,
    state: Mutex<GetRequestState>,
    cv: Condvar,
}

impl GetRequest {
    fn new(
        object_ids: HashSet<ObjectID>,
        num_objects: usize,
        remove_after_get: bool,
        abort_if_any_exception: bool,
    ) -> Arc<Self> {
        assert!(num_objects <= object_ids.len());
        Arc::new(Self {
            object_ids,
            num_objects,
            remove_after_get,
            abort_if_any_exception,
            state: Mutex::new(GetRequestState {
                fulfilled: HashMap::new(),
                is_ready: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn object_ids(&self) -> &HashSet<ObjectID> {
        &self.object_ids
    }

    fn should_remove_objects(&self) -> bool {
        self.remove_after_get
    }

    /// Block until the request is ready or `timeout_ms` elapses.
    /// `timeout_ms == -1` waits forever. Returns readiness.
    fn wait(&self, timeout_ms: i64) -> bool {
        assert!(timeout_ms >= 0 || timeout_ms == -1);
        let mut state = self.state.lock();
        if timeout_ms == -1 {
            while !state.is_ready {
                self.cv.wait(&mut state);
            }
            return true;
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        while !state.is_ready {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cv.wait_for(&mut state, deadline - now);
        }
        state.is_ready
    }

    /// Deliver a value. Idempotent once ready.
    fn set(&self, object_id: ObjectID, object: Arc<HeliosObject>) {
        let mut state = self.state.lock();
        if state.is_ready {
            // Already hit the number of objects to return.
            return;
        }
        object.set_accessed();
        let is_exception = object.is_exception() && !object.is_in_plasma();
        state.fulfilled.insert(object_id, object);
        if state.fulfilled.len() == self.num_objects
            || (self.abort_if_any_exception && is_exception)
        {
            state.is_ready = true;
            self.cv.notify_all();
        }
    }

    fn get(&self, object_id: &ObjectID) -> Option<Arc<HeliosObject>> {
        let state = self.state.lock();
        state.fulfilled.get(object_id).map(|obj| {
            obj.set_accessed();
            obj.clone()
        })
    }
}

// ─── Store state ────────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    /// Sealed values currently available locally.
    objects: HashMap<ObjectID, Arc<HeliosObject>>,
    /// Outstanding blocking gets, listed under every id they await.
    blocking_get_requests: HashMap<ObjectID, Vec<Arc<GetRequest>>>,
    /// One-shot callbacks registered before the value arrived.
    async_get_requests: HashMap<ObjectID, Vec<AsyncGetCallback>>,
    num_local_objects: i64,
    num_in_plasma: i64,
    num_local_objects_bytes: i64,
}

impl StoreState {
    fn emplace_object_and_update_stats(&mut self, object_id: ObjectID, entry: Arc<HeliosObject>) {
        let in_plasma = entry.is_in_plasma();
        let size = entry.size() as i64;
        if self.objects.insert(object_id, entry).is_none() {
            if in_plasma {
                self.num_in_plasma += 1;
            } else {
                self.num_local_objects += 1;
                self.num_local_objects_bytes += size;
            }
        }
        self.check_counters();
    }

    fn erase_object_and_update_stats(&mut self, object_id: &ObjectID) {
        if let Some(entry) = self.objects.remove(object_id) {
            if entry.is_in_plasma() {
                self.num_in_plasma -= 1;
            } else {
                self.num_local_objects -= 1;
                self.num_local_objects_bytes -= entry.size() as i64;
            }
        }
        self.check_counters();
    }

    fn check_counters(&self) {
        assert!(
            self.num_in_plasma >= 0
                && self.num_local_objects >= 0
                && self.num_local_objects_bytes >= 0,
            "memory store counters went negative: in_plasma={}, local={}, bytes={}",
            self.num_in_plasma,
            self.num_local_objects,
            self.num_local_objects_bytes
        );
    }
}

// ─── MemoryStore ────────────────────────────────────────────────────────────

/// Thread-safe worker-local object store.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    /// Reactor async get callbacks are dispatched on.
    reactor: Reactor,
    config: MemoryStoreConfig,
    ref_counter: Option<Arc<dyn ReferenceCounter>>,
    raylet_client: Option<Arc<dyn RayletClient>>,
    check_signals: Option<SignalCheck>,
    unhandled_exception_handler: Option<UnhandledExceptionHandler>,
    object_allocator: Option<ObjectAllocator>,
}

/// Builder for a `MemoryStore`; every collaborator is optional.
pub struct MemoryStoreBuilder {
    reactor: Reactor,
    config: MemoryStoreConfig,
    ref_counter: Option<Arc<dyn ReferenceCounter>>,
    raylet_client: Option<Arc<dyn RayletClient>>,
    check_signals: Option<SignalCheck>,
    unhandled_exception_handler: Option<UnhandledExceptionHandler>,
    object_allocator: Option<ObjectAllocator>,
}

impl MemoryStoreBuilder {
    pub fn with_config(mut self, config: MemoryStoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ref_counter(mut self, counter: Arc<dyn ReferenceCounter>) -> Self {
        self.ref_counter = Some(counter);
        self
    }

    pub fn with_raylet_client(mut self, client: Arc<dyn RayletClient>) -> Self {
        self.raylet_client = Some(client);
        self
    }

    pub fn with_signal_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> HeliosResult<()> + Send + Sync + 'static,
    {
        self.check_signals = Some(Box::new(check));
        self
    }

    pub fn with_unhandled_exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&HeliosObject) + Send + Sync + 'static,
    {
        self.unhandled_exception_handler = Some(Box::new(handler));
        self
    }

    pub fn with_object_allocator<F>(mut self, allocator: F) -> Self
    where
        F: Fn(HeliosObject, &ObjectID) -> Arc<HeliosObject> + Send + Sync + 'static,
    {
        self.object_allocator = Some(Box::new(allocator));
        self
    }

    pub fn build(self) -> MemoryStore {
        MemoryStore {
            state: Mutex::new(StoreState::default()),
            reactor: self.reactor,
            config: self.config,
            ref_counter: self.ref_counter,
            raylet_client: self.raylet_client,
            check_signals: self.check_signals,
            unhandled_exception_handler: self.unhandled_exception_handler,
            object_allocator: self.object_allocator,
        }
    }
}

impl MemoryStore {
    pub fn builder(reactor: Reactor) -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            reactor,
            config: MemoryStoreConfig::default(),
            ref_counter: None,
            raylet_client: None,
            check_signals: None,
            unhandled_exception_handler: None,
            object_allocator: None,
        }
    }

    pub fn new(reactor: Reactor) -> Self {
        Self::builder(reactor).build()
    }

    /// Whether `remove_after_get` actually removes entries, given the
    /// attached reference counter and the configured policy.
    fn remove_applies(&self) -> bool {
        self.ref_counter.is_none()
            || self.config.ref_counted_remove_policy == RefCountedRemovePolicy::Remove
    }

    /// Seal a value into the store. Idempotent: a pre-existing id is left
    /// untouched and reported as success.
    pub fn put(&self, object: HeliosObject, object_id: ObjectID) -> bool {
        tracing::debug!(%object_id, "Putting object into memory store");
        let entry: Arc<HeliosObject> = match &self.object_allocator {
            Some(allocator) => allocator(object, &object_id),
            None => Arc::new(object),
        };

        let mut async_callbacks: Vec<AsyncGetCallback> = Vec::new();
        {
            let mut state = self.state.lock();

            if state.objects.contains_key(&object_id) {
                // Object already exists in the store, which is fine.
                return true;
            }

            if let Some(callbacks) = state.async_get_requests.remove(&object_id) {
                async_callbacks = callbacks;
            }

            let mut should_add_entry = true;
            if let Some(get_requests) = state.blocking_get_requests.get(&object_id) {
                for get_request in get_requests {
                    get_request.set(object_id, entry.clone());
                    if get_request.should_remove_objects() && self.remove_applies() {
                        should_add_entry = false;
                    }
                }
            }
            // Don't keep an entry nothing references; there would be no
            // deletion callback for it.
            if let Some(counter) = &self.ref_counter {
                if !counter.has_reference(&object_id) {
                    should_add_entry = false;
                }
            }

            if should_add_entry {
                state.emplace_object_and_update_stats(object_id, entry.clone());
            } else {
                // Equivalent to the object being added and immediately
                // deleted from the store.
                self.on_delete(&entry);
            }

            if !async_callbacks.is_empty() {
                entry.set_accessed();
            }
        }

        // The callbacks must run without the store lock held and without
        // re-entering the caller of put; a single posted work item invokes
        // all of them.
        if !async_callbacks.is_empty() {
            let entry = entry.clone();
            self.reactor
                .post("MemoryStore.Put.get_async_callbacks", move || {
                    for callback in async_callbacks {
                        callback(entry.clone());
                    }
                });
        }

        true
    }

    /// Blocking multi-object get. Results are aligned with `object_ids`;
    /// waiting aborts early if any delivered object is a non-plasma
    /// exception.
    pub fn get(
        &self,
        object_ids: &[ObjectID],
        num_objects: usize,
        timeout_ms: i64,
        ctx: &WorkerContext,
        remove_after_get: bool,
    ) -> HeliosResult<Vec<Option<Arc<HeliosObject>>>> {
        let (status, results) = self.get_impl(
            object_ids,
            num_objects,
            timeout_ms,
            ctx,
            remove_after_get,
            /*abort_if_any_exception=*/ true,
            /*at_most_num_objects=*/ true,
        );
        status.map(|_| results)
    }

    fn get_impl(
        &self,
        object_ids: &[ObjectID],
        num_objects: usize,
        timeout_ms: i64,
        ctx: &WorkerContext,
        remove_after_get: bool,
        abort_if_any_exception: bool,
        at_most_num_objects: bool,
    ) -> (HeliosResult<()>, Vec<Option<Arc<HeliosObject>>>) {
        let mut results: Vec<Option<Arc<HeliosObject>>> = vec![None; object_ids.len()];

        let get_request: Arc<GetRequest>;
        {
            let mut remaining_ids: HashSet<ObjectID> = HashSet::new();
            let mut ids_to_remove: HashSet<ObjectID> = HashSet::new();
            let mut existing_objects_has_exception = false;
            let mut num_found = 0usize;

            let mut state = self.state.lock();
            for (i, object_id) in object_ids.iter().enumerate() {
                if let Some(entry) = state.objects.get(object_id) {
                    entry.set_accessed();
                    results[i] = Some(entry.clone());
                    if remove_after_get {
                        // The input may contain duplicate ids; collect into a
                        // set and erase once after the scan.
                        ids_to_remove.insert(*object_id);
                    }
                    num_found += 1;
                    if abort_if_any_exception
                        && entry.is_exception()
                        && !entry.is_in_plasma()
                    {
                        existing_objects_has_exception = true;
                    }
                } else {
                    remaining_ids.insert(*object_id);
                }
                // Only wait scans past the requested count.
                if num_found >= num_objects && at_most_num_objects {
                    break;
                }
            }

            if self.remove_applies() {
                for object_id in &ids_to_remove {
                    state.erase_object_and_update_stats(object_id);
                }
            }

            // Done if everything was already present, or enough was, or an
            // existing object already carries an exception.
            if remaining_ids.is_empty()
                || num_found >= num_objects
                || existing_objects_has_exception
            {
                return (Ok(()), results);
            }

            let required_objects = num_objects - num_found;
            get_request = GetRequest::new(
                remaining_ids,
                required_objects,
                remove_after_get,
                abort_if_any_exception,
            );
            for object_id in get_request.object_ids() {
                state
                    .blocking_get_requests
                    .entry(*object_id)
                    .or_default()
                    .push(get_request.clone());
            }
        }

        // Only non-actor tasks on the worker's main thread hand their
        // resources back while blocked.
        let should_notify_raylet =
            self.raylet_client.is_some() && ctx.should_release_resources_on_blocking_calls();
        if should_notify_raylet {
            if let Some(client) = &self.raylet_client {
                if let Err(e) = client.notify_task_blocked() {
                    tracing::warn!(error = %e, "Failed to notify raylet of blocked task");
                }
            }
        }

        // Wait in slices no longer than the signal-check interval so a
        // non-ok signal preempts the wait, including timeout_ms == -1.
        let mut done = false;
        let mut timed_out = false;
        let mut signal_status: HeliosResult<()> = Ok(());
        let mut remaining_timeout = timeout_ms;
        let mut iteration_timeout = if timeout_ms == -1 {
            self.config.check_signal_interval_ms
        } else {
            timeout_ms.min(self.config.check_signal_interval_ms)
        };

        loop {
            if timed_out || signal_status.is_err() {
                break;
            }
            done = get_request.wait(iteration_timeout);
            if done {
                break;
            }
            if let Some(check) = &self.check_signals {
                signal_status = check();
            }
            if remaining_timeout >= 0 {
                remaining_timeout -= iteration_timeout;
                iteration_timeout = iteration_timeout.min(remaining_timeout);
                timed_out = remaining_timeout <= 0;
            }
        }

        if should_notify_raylet {
            if let Some(client) = &self.raylet_client {
                if let Err(e) = client.notify_task_unblocked() {
                    tracing::warn!(error = %e, "Failed to notify raylet of unblocked task");
                }
            }
        }

        {
            let mut state = self.state.lock();
            // Splice values that arrived while we were waiting.
            for (i, object_id) in object_ids.iter().enumerate() {
                if results[i].is_none() {
                    results[i] = get_request.get(object_id);
                }
            }

            // Deregister the request from every waiter list it sits in.
            for object_id in get_request.object_ids() {
                let now_empty = match state.blocking_get_requests.get_mut(object_id) {
                    Some(get_requests) => {
                        get_requests.retain(|r| !Arc::ptr_eq(r, &get_request));
                        get_requests.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    state.blocking_get_requests.remove(object_id);
                }
            }
        }

        let status = if let Err(e) = signal_status {
            Err(e)
        } else if done {
            Ok(())
        } else {
            Err(HeliosError::timed_out("Get timed out: some object(s) not ready."))
        };
        (status, results)
    }

    /// Wait for up to `num_objects` of `object_ids` to become available.
    /// Returns the ready set and the set whose values live in plasma.
    /// Expiry of the timeout is not an error; partial results are returned.
    pub fn wait(
        &self,
        object_ids: &HashSet<ObjectID>,
        num_objects: usize,
        timeout_ms: i64,
        ctx: &WorkerContext,
    ) -> HeliosResult<(HashSet<ObjectID>, HashSet<ObjectID>)> {
        let id_vector: Vec<ObjectID> = object_ids.iter().copied().collect();
        let (status, result_objects) = self.get_impl(
            &id_vector,
            num_objects,
            timeout_ms,
            ctx,
            /*remove_after_get=*/ false,
            /*abort_if_any_exception=*/ false,
            /*at_most_num_objects=*/ false,
        );
        if let Err(e) = status {
            if !e.is_timed_out() {
                return Err(e);
            }
        }

        let mut ready = HashSet::new();
        let mut plasma_object_ids = HashSet::new();
        for (i, result) in result_objects.iter().enumerate() {
            if let Some(obj) = result {
                if obj.is_in_plasma() {
                    plasma_object_ids.insert(id_vector[i]);
                } else if ready.len() < num_objects {
                    ready.insert(id_vector[i]);
                }
            }
        }
        Ok((ready, plasma_object_ids))
    }

    /// Register a one-shot callback for an object. If the value is already
    /// present the callback is still dispatched through the reactor, never
    /// invoked inline.
    pub fn get_async<F>(&self, object_id: ObjectID, callback: F)
    where
        F: FnOnce(Arc<HeliosObject>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(entry) = state.objects.get(&object_id).cloned() {
            entry.set_accessed();
            drop(state);
            self.reactor
                .post("MemoryStore.GetAsync.callback", move || callback(entry));
        } else {
            state
                .async_get_requests
                .entry(object_id)
                .or_default()
                .push(Box::new(callback));
        }
    }

    /// Non-blocking lookup; marks the value accessed on hit.
    pub fn get_if_exists(&self, object_id: &ObjectID) -> Option<Arc<HeliosObject>> {
        let state = self.state.lock();
        state.objects.get(object_id).map(|entry| {
            entry.set_accessed();
            entry.clone()
        })
    }

    /// Erase objects, reporting unhandled errors through `on_delete`.
    pub fn delete(&self, object_ids: &[ObjectID]) {
        let mut state = self.state.lock();
        for object_id in object_ids {
            tracing::debug!(%object_id, "Deleting object from memory store");
            if let Some(entry) = state.objects.get(object_id).cloned() {
                self.on_delete(&entry);
                state.erase_object_and_update_stats(object_id);
            }
        }
    }

    /// Erase objects, but keep in-plasma sentinels locally and append their
    /// ids to `plasma_ids_to_delete` so the caller can forward them to the
    /// shared-memory store.
    pub fn delete_with_plasma_forward(
        &self,
        object_ids: &HashSet<ObjectID>,
        plasma_ids_to_delete: &mut HashSet<ObjectID>,
    ) {
        let mut state = self.state.lock();
        for object_id in object_ids {
            if let Some(entry) = state.objects.get(object_id).cloned() {
                if entry.is_in_plasma() {
                    plasma_ids_to_delete.insert(*object_id);
                } else {
                    self.on_delete(&entry);
                    state.erase_object_and_update_stats(object_id);
                }
            }
        }
    }

    /// Whether the object is present, and whether its value is in plasma.
    pub fn contains(&self, object_id: &ObjectID) -> (bool, bool) {
        let state = self.state.lock();
        match state.objects.get(object_id) {
            Some(entry) => (true, entry.is_in_plasma()),
            None => (false, false),
        }
    }

    fn is_unhandled_error(entry: &HeliosObject) -> bool {
        matches!(
            entry.error_type(),
            Some(ErrorKind::WorkerDied) | Some(ErrorKind::TaskExecutionException)
        ) && !entry.was_accessed()
    }

    fn on_delete(&self, entry: &HeliosObject) {
        if Self::is_unhandled_error(entry) {
            if let Some(handler) = &self.unhandled_exception_handler {
                handler(entry);
            }
        }
    }

    /// Report task errors that the application never observed within the
    /// grace period. Scans at most `unhandled_error_scan_limit` entries per
    /// call; each record is reported at most once because delivery flips
    /// its accessed flag.
    pub fn notify_unhandled_errors(&self) {
        let state = self.state.lock();
        let grace_ns = self.config.unhandled_error_grace_period_ms.saturating_mul(1_000_000);
        let threshold = helios_util::time::current_time_ns().saturating_sub(grace_ns);
        let mut count = 0usize;
        for entry in state.objects.values() {
            if count >= self.config.unhandled_error_scan_limit {
                break;
            }
            if Self::is_unhandled_error(entry) && entry.created_at_ns() < threshold {
                if let Some(handler) = &self.unhandled_exception_handler {
                    entry.set_accessed();
                    handler(entry);
                }
            }
            count += 1;
        }
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let state = self.state.lock();
        MemoryStoreStats {
            num_in_plasma: state.num_in_plasma,
            num_local_objects: state.num_local_objects,
            num_local_objects_bytes: state.num_local_objects_bytes,
        }
    }

    pub fn record_metrics(&self) {
        let stats = self.stats();
        tracing::debug!(
            bytes = stats.num_local_objects_bytes,
            local = stats.num_local_objects,
            in_plasma = stats.num_in_plasma,
            "memory store occupancy"
        );
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerType;
    use crate::object::Transport;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    use bytes::Bytes;
    use helios_common::id::{JobID, TaskID, WorkerID};
    use helios_common::reactor::ReactorPool;

    fn make_object_id(id: u8) -> ObjectID {
        let mut bytes = [0u8; 28];
        bytes[0] = id;
        ObjectID::from_binary(&bytes)
    }

    fn make_object(data: &[u8]) -> HeliosObject {
        HeliosObject::from_data(Bytes::copy_from_slice(data))
    }

    fn driver_ctx() -> WorkerContext {
        WorkerContext::new(WorkerType::Driver, WorkerID::from_random(), JobID::from_int(1))
    }

    struct FixedRefCounter {
        referenced: bool,
    }

    impl ReferenceCounter for FixedRefCounter {
        fn has_reference(&self, _object_id: &ObjectID) -> bool {
            self.referenced
        }
    }

    struct CountingRayletClient {
        address: helios_rpc::NodeAddress,
        blocked: AtomicU64,
        unblocked: AtomicU64,
    }

    impl CountingRayletClient {
        fn new() -> Self {
            let mut data = [0u8; 28];
            data[0] = 1;
            Self {
                address: helios_rpc::NodeAddress::new(
                    helios_common::id::NodeID::from_binary(&data),
                    "127.0.0.1",
                    1,
                ),
                blocked: AtomicU64::new(0),
                unblocked: AtomicU64::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RayletClient for CountingRayletClient {
        fn notify_task_blocked(&self) -> HeliosResult<()> {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn notify_task_unblocked(&self) -> HeliosResult<()> {
            self.unblocked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_local_worker_dead(&self, _worker_id: &WorkerID) -> HeliosResult<bool> {
            Ok(false)
        }
        async fn get_resource_load(&self) -> HeliosResult<helios_rpc::ResourceLoad> {
            Ok(helios_rpc::ResourceLoad::default())
        }
        fn channel(&self) -> Option<tonic::transport::Channel> {
            None
        }
        fn address(&self) -> &helios_rpc::NodeAddress {
            &self.address
        }
    }

    fn fast_config() -> MemoryStoreConfig {
        MemoryStoreConfig {
            check_signal_interval_ms: 10,
            ..MemoryStoreConfig::default()
        }
    }

    #[test]
    fn test_put_then_get_same_thread() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let id = make_object_id(1);

        assert!(store.put(make_object(b"x"), id));
        let results = store.get(&[id], 1, 1000, &ctx, false).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().data().as_ref(), b"x");

        let stats = store.stats();
        assert_eq!(stats.num_local_objects, 1);
        assert_eq!(stats.num_local_objects_bytes, 1);
        assert_eq!(store.contains(&id), (true, false));
    }

    #[test]
    fn test_put_is_idempotent_and_keeps_original() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let id = make_object_id(2);

        assert!(store.put(make_object(b"first"), id));
        assert!(store.put(make_object(b"second"), id));

        let results = store.get(&[id], 1, 1000, &ctx, false).unwrap();
        assert_eq!(results[0].as_ref().unwrap().data().as_ref(), b"first");
        assert_eq!(store.stats().num_local_objects, 1);
    }

    #[test]
    fn test_get_then_put_rendezvous() {
        let pool = ReactorPool::new();
        let store = Arc::new(MemoryStore::new(pool.default_reactor()));
        let id = make_object_id(3);

        let store_getter = store.clone();
        let getter = std::thread::spawn(move || {
            let ctx = driver_ctx();
            store_getter.get(&[id], 1, -1, &ctx, /*remove_after_get=*/ true)
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(store.put(make_object(b"v"), id));

        let results = getter.join().unwrap().unwrap();
        assert_eq!(results[0].as_ref().unwrap().data().as_ref(), b"v");
        // Consumed on arrival: never observable afterwards.
        assert_eq!(store.contains(&id), (false, false));
        assert_eq!(store.stats().num_local_objects, 0);
    }

    #[test]
    fn test_exception_short_circuits_get() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let exc_id = make_object_id(4);
        let absent_id = make_object_id(5);

        store.put(
            HeliosObject::from_error(ErrorKind::TaskExecutionException),
            exc_id,
        );

        let start = Instant::now();
        let results = store
            .get(&[exc_id, absent_id], 2, 5_000, &ctx, false)
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(results[0].as_ref().unwrap().is_exception());
        assert!(results[1].is_none());
    }

    #[test]
    fn test_exception_delivered_mid_wait_short_circuits() {
        let pool = ReactorPool::new();
        let store = Arc::new(
            MemoryStore::builder(pool.default_reactor())
                .with_config(fast_config())
                .build(),
        );
        let exc_id = make_object_id(6);
        let absent_id = make_object_id(7);

        let store_getter = store.clone();
        let getter = std::thread::spawn(move || {
            let ctx = driver_ctx();
            store_getter.get(&[exc_id, absent_id], 2, -1, &ctx, false)
        });

        std::thread::sleep(Duration::from_millis(30));
        store.put(HeliosObject::from_error(ErrorKind::WorkerDied), exc_id);

        let results = getter.join().unwrap().unwrap();
        assert!(results[0].as_ref().unwrap().is_exception());
        assert!(results[1].is_none());
    }

    #[test]
    fn test_wait_returns_partial_on_timeout() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(fast_config())
            .build();
        let ctx = driver_ctx();
        let ready_id = make_object_id(8);
        let absent_a = make_object_id(9);
        let absent_b = make_object_id(10);

        store.put(make_object(b"e"), ready_id);

        let ids: HashSet<ObjectID> = [ready_id, absent_a, absent_b].into_iter().collect();
        let (ready, plasma) = store.wait(&ids, 2, 100, &ctx).unwrap();
        assert_eq!(ready, [ready_id].into_iter().collect());
        assert!(plasma.is_empty());
    }

    #[test]
    fn test_wait_partitions_plasma_objects() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let local_id = make_object_id(11);
        let plasma_id = make_object_id(12);

        store.put(make_object(b"l"), local_id);
        store.put(HeliosObject::in_plasma_sentinel(), plasma_id);

        let ids: HashSet<ObjectID> = [local_id, plasma_id].into_iter().collect();
        let (ready, plasma) = store.wait(&ids, 2, 100, &ctx).unwrap();
        assert_eq!(ready, [local_id].into_iter().collect());
        assert_eq!(plasma, [plasma_id].into_iter().collect());
    }

    #[test]
    fn test_delete_forwards_plasma_ids() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let plasma_id = make_object_id(13);
        let local_id = make_object_id(14);

        store.put(HeliosObject::in_plasma_sentinel(), plasma_id);
        store.put(make_object(b"v"), local_id);
        assert_eq!(store.stats().num_in_plasma, 1);

        let mut forward = HashSet::new();
        let ids: HashSet<ObjectID> = [plasma_id, local_id].into_iter().collect();
        store.delete_with_plasma_forward(&ids, &mut forward);

        // The sentinel stays local until the plasma delete completes; the
        // heap value is gone now.
        assert_eq!(forward, [plasma_id].into_iter().collect());
        assert_eq!(store.contains(&plasma_id), (true, true));
        assert_eq!(store.contains(&local_id), (false, false));

        store.delete(&[plasma_id]);
        assert_eq!(store.contains(&plasma_id), (false, false));
        assert_eq!(store.stats().num_in_plasma, 0);
    }

    #[test]
    fn test_remove_after_get_deletes_entry() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let id = make_object_id(15);

        store.put(make_object(b"v"), id);
        let results = store.get(&[id, id], 2, 1000, &ctx, true).unwrap();
        // Duplicate ids both resolve, and the single entry is erased once.
        assert!(results[0].is_some());
        assert!(results[1].is_some());
        assert_eq!(store.contains(&id), (false, false));
        assert_eq!(store.stats().num_local_objects, 0);
    }

    #[test]
    fn test_get_stops_at_num_objects() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();
        let a = make_object_id(16);
        let b = make_object_id(17);

        store.put(make_object(b"a"), a);
        store.put(make_object(b"b"), b);

        let results = store.get(&[a, b], 1, 1000, &ctx, false).unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn test_get_timeout_is_an_error() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(fast_config())
            .build();
        let ctx = driver_ctx();

        let start = Instant::now();
        let err = store
            .get(&[make_object_id(18)], 1, 50, &ctx, false)
            .unwrap_err();
        assert!(err.is_timed_out());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_get_zero_timeout_is_non_blocking() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let ctx = driver_ctx();

        let start = Instant::now();
        let err = store
            .get(&[make_object_id(19)], 1, 0, &ctx, false)
            .unwrap_err();
        assert!(err.is_timed_out());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_signal_check_interrupts_indefinite_wait() {
        let pool = ReactorPool::new();
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(fast_config())
            .with_signal_check(move || {
                if calls_clone.fetch_add(1, Ordering::SeqCst) >= 2 {
                    Err(HeliosError::interrupted("signal received"))
                } else {
                    Ok(())
                }
            })
            .build();
        let ctx = driver_ctx();

        let err = store
            .get(&[make_object_id(20)], 1, -1, &ctx, false)
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_blocked_unblocked_bracketing() {
        let pool = ReactorPool::new();
        let raylet = Arc::new(CountingRayletClient::new());
        let store = Arc::new(
            MemoryStore::builder(pool.default_reactor())
                .with_config(fast_config())
                .with_raylet_client(raylet.clone())
                .build(),
        );
        let id = make_object_id(21);

        let store_getter = store.clone();
        let getter = std::thread::spawn(move || {
            // A task worker context created on this thread: blocking calls
            // from here release resources.
            let ctx = WorkerContext::new(
                WorkerType::Worker,
                WorkerID::from_random(),
                JobID::from_int(1),
            );
            store_getter.get(&[id], 1, 50, &ctx, false)
        });
        assert!(getter.join().unwrap().unwrap_err().is_timed_out());
        assert_eq!(raylet.blocked.load(Ordering::SeqCst), 1);
        assert_eq!(raylet.unblocked.load(Ordering::SeqCst), 1);

        // A non-blocking get does not notify at all.
        store.put(make_object(b"v"), id);
        let ctx = driver_ctx();
        store.get(&[id], 1, 1000, &ctx, false).unwrap();
        assert_eq!(raylet.blocked.load(Ordering::SeqCst), 1);
        assert_eq!(raylet.unblocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_async_called_exactly_once_and_never_inline() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let id = make_object_id(22);

        // Registered before the value arrives.
        let (tx, rx) = mpsc::channel();
        store.get_async(id, move |obj| {
            tx.send(obj.data().to_vec()).unwrap();
        });
        assert!(rx.try_recv().is_err());

        store.put(make_object(b"later"), id);
        let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, b"later");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Registered after the value arrived: still dispatched, not inline.
        let (tx2, rx2) = mpsc::channel();
        store.get_async(id, move |obj| {
            tx2.send(obj.data().to_vec()).unwrap();
        });
        assert!(rx2.try_recv().is_err());
        assert_eq!(rx2.recv_timeout(Duration::from_secs(5)).unwrap(), b"later");
    }

    #[test]
    fn test_multiple_async_callbacks_all_fire() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let id = make_object_id(23);

        let (tx, rx) = mpsc::channel();
        for i in 0..3u8 {
            let tx = tx.clone();
            store.get_async(id, move |_| tx.send(i).unwrap());
        }
        store.put(make_object(b"v"), id);

        let mut seen: Vec<u8> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_get_if_exists_marks_accessed() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());
        let id = make_object_id(24);

        assert!(store.get_if_exists(&id).is_none());
        store.put(make_object(b"v"), id);
        let obj = store.get_if_exists(&id).unwrap();
        assert!(obj.was_accessed());
    }

    #[test]
    fn test_counters_match_contents() {
        let pool = ReactorPool::new();
        let store = MemoryStore::new(pool.default_reactor());

        let local_a = make_object_id(25);
        let local_b = make_object_id(26);
        let plasma = make_object_id(27);

        store.put(make_object(b"aaa"), local_a);
        store.put(make_object(b"bb"), local_b);
        store.put(HeliosObject::in_plasma_sentinel(), plasma);

        let stats = store.stats();
        assert_eq!(stats.num_local_objects, 2);
        assert_eq!(stats.num_in_plasma, 1);
        assert_eq!(stats.num_local_objects_bytes, 5);

        store.delete(&[local_a, plasma]);
        let stats = store.stats();
        assert_eq!(stats.num_local_objects, 1);
        assert_eq!(stats.num_in_plasma, 0);
        assert_eq!(stats.num_local_objects_bytes, 2);

        // Deleting an absent id changes nothing.
        store.delete(&[local_a]);
        assert_eq!(store.stats().num_local_objects, 1);
    }

    #[test]
    fn test_unhandled_error_reported_on_delete_once() {
        let pool = ReactorPool::new();
        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = reported.clone();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_unhandled_exception_handler(move |_| {
                reported_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let id = make_object_id(28);

        store.put(
            HeliosObject::from_error(ErrorKind::TaskExecutionException),
            id,
        );
        store.delete(&[id]);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accessed_error_is_not_unhandled() {
        let pool = ReactorPool::new();
        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = reported.clone();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_unhandled_exception_handler(move |_| {
                reported_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let ctx = driver_ctx();
        let id = make_object_id(29);

        store.put(HeliosObject::from_error(ErrorKind::WorkerDied), id);
        store.get(&[id], 1, 1000, &ctx, false).unwrap();
        store.delete(&[id]);
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notify_unhandled_errors_respects_grace_and_fires_once() {
        let pool = ReactorPool::new();
        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = reported.clone();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(MemoryStoreConfig {
                unhandled_error_grace_period_ms: 50,
                ..MemoryStoreConfig::default()
            })
            .with_unhandled_exception_handler(move |_| {
                reported_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let id = make_object_id(30);

        store.put(
            HeliosObject::from_error(ErrorKind::TaskExecutionException),
            id,
        );

        // Inside the grace period nothing is reported.
        store.notify_unhandled_errors();
        assert_eq!(reported.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(80));
        store.notify_unhandled_errors();
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        // Delivery flipped the accessed flag: never reported again.
        store.notify_unhandled_errors();
        store.delete(&[id]);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_counter_retain_policy_keeps_entry() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_ref_counter(Arc::new(FixedRefCounter { referenced: true }))
            .build();
        let ctx = driver_ctx();
        let id = make_object_id(31);

        store.put(make_object(b"v"), id);
        store.get(&[id], 1, 1000, &ctx, true).unwrap();
        // The counter governs deletion; remove_after_get is overridden.
        assert_eq!(store.contains(&id), (true, false));
    }

    #[test]
    fn test_ref_counter_remove_policy_applies_removal() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(MemoryStoreConfig {
                ref_counted_remove_policy: RefCountedRemovePolicy::Remove,
                ..MemoryStoreConfig::default()
            })
            .with_ref_counter(Arc::new(FixedRefCounter { referenced: true }))
            .build();
        let ctx = driver_ctx();
        let id = make_object_id(32);

        store.put(make_object(b"v"), id);
        store.get(&[id], 1, 1000, &ctx, true).unwrap();
        assert_eq!(store.contains(&id), (false, false));
    }

    #[test]
    fn test_unreferenced_put_is_consumed_on_arrival() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_ref_counter(Arc::new(FixedRefCounter { referenced: false }))
            .build();
        let id = make_object_id(33);

        store.put(make_object(b"v"), id);
        assert_eq!(store.contains(&id), (false, false));
        assert_eq!(store.stats().num_local_objects, 0);
    }

    #[test]
    fn test_object_allocator_shapes_stored_record() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_object_allocator(|obj, _id| {
                Arc::new(
                    HeliosObject::new(
                        obj.data().clone(),
                        obj.metadata().clone(),
                        obj.nested_refs().to_vec(),
                    )
                    .with_transport(Transport::OutOfBand),
                )
            })
            .build();
        let id = make_object_id(34);

        store.put(make_object(b"v"), id);
        let obj = store.get_if_exists(&id).unwrap();
        assert_eq!(obj.transport(), Transport::OutOfBand);
    }

    #[test]
    fn test_waiter_lists_are_cleaned_up_after_timeout() {
        let pool = ReactorPool::new();
        let store = MemoryStore::builder(pool.default_reactor())
            .with_config(fast_config())
            .build();
        let ctx = driver_ctx();
        let id = make_object_id(35);

        assert!(store.get(&[id], 1, 30, &ctx, false).unwrap_err().is_timed_out());

        // A later put must not deliver into the departed waiter; the entry
        // simply lands in the store.
        store.put(make_object(b"v"), id);
        assert_eq!(store.contains(&id), (true, false));
        assert_eq!(store.stats().num_local_objects, 1);
    }

    #[test]
    fn test_two_waiters_same_id_both_wake() {
        let pool = ReactorPool::new();
        let store = Arc::new(MemoryStore::new(pool.default_reactor()));
        let id = make_object_id(36);

        let mut getters = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            getters.push(std::thread::spawn(move || {
                let ctx = driver_ctx();
                store.get(&[id], 1, -1, &ctx, false)
            }));
        }

        std::thread::sleep(Duration::from_millis(50));
        store.put(make_object(b"v"), id);

        for getter in getters {
            let results = getter.join().unwrap().unwrap();
            assert_eq!(results[0].as_ref().unwrap().data().as_ref(), b"v");
        }
    }

    #[test]
    fn test_task_counter_hash_usage() {
        // Object ids derived from the same task and index collide; distinct
        // indices do not. Guards the store against id-aliasing mistakes.
        let task = TaskID::from_random();
        assert_eq!(ObjectID::from_index(&task, 1), ObjectID::from_index(&task, 1));
        assert_ne!(ObjectID::from_index(&task, 1), ObjectID::from_index(&task, 2));
    }
}
