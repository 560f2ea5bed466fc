// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Named single-threaded reactors.
//!
//! A `Reactor` is a cooperative event loop backed by a dedicated OS thread
//! running a current-thread tokio runtime. Work posted to a reactor executes
//! serially on that one thread, in post order; there is no work stealing.
//! Subsystems that must not suffer head-of-line blocking on the default
//! reactor (publisher, internal KV, task manager, syncer) get their own
//! named reactor from the pool.
//!
//! Every posted work item carries a label that feeds per-reactor event
//! stats, which surface in the periodic stats print and the debug dump.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Name of the reactor created eagerly by every pool.
pub const DEFAULT_REACTOR_NAME: &str = "default";

// ─── Event stats ────────────────────────────────────────────────────────────

/// Posted/finished counts for one work-item label.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelStats {
    pub posted: u64,
    pub finished: u64,
}

/// Per-reactor tally of work items by label.
#[derive(Default)]
pub struct ReactorStats {
    labels: Mutex<HashMap<String, LabelStats>>,
}

impl ReactorStats {
    fn record_posted(&self, label: &str) {
        self.labels.lock().entry(label.to_string()).or_default().posted += 1;
    }

    fn record_finished(&self, label: &str) {
        self.labels.lock().entry(label.to_string()).or_default().finished += 1;
    }

    /// Stats for a single label, if any work was posted under it.
    pub fn get(&self, label: &str) -> Option<LabelStats> {
        self.labels.lock().get(label).copied()
    }

    /// All labels, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, LabelStats)> {
        let mut entries: Vec<_> = self
            .labels
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Human-readable rendering for the event-stats print and debug dump.
    pub fn stats_string(&self) -> String {
        let mut out = String::new();
        for (label, stats) in self.snapshot() {
            out.push_str(&format!(
                "{}: posted {}, finished {}\n",
                label, stats.posted, stats.finished
            ));
        }
        out
    }
}

// ─── Reactor ────────────────────────────────────────────────────────────────

struct ReactorShared {
    name: String,
    handle: tokio::runtime::Handle,
    stats: ReactorStats,
}

/// Cloneable handle to a named single-threaded event loop.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a closure. Work items execute serially, in post order,
    /// on the reactor's single thread.
    pub fn post<F>(&self, label: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.stats.record_posted(label);
        let shared = Arc::clone(&self.shared);
        let label = label.to_string();
        self.shared.handle.spawn(async move {
            f();
            shared.stats.record_finished(&label);
        });
    }

    /// Enqueue a closure to run after `delay`.
    pub fn schedule_after<F>(&self, label: &str, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.stats.record_posted(label);
        let shared = Arc::clone(&self.shared);
        let label = label.to_string();
        self.shared.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
            shared.stats.record_finished(&label);
        });
    }

    /// Run a future on the reactor thread. Used for long-lived loops
    /// (health probes, periodic runners) that must stay reactor-confined.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.handle.spawn(future)
    }

    pub fn stats(&self) -> &ReactorStats {
        &self.shared.stats
    }
}

// ─── Pool ───────────────────────────────────────────────────────────────────

struct ReactorThread {
    reactor: Reactor,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    join: Option<std::thread::JoinHandle<()>>,
}

fn spawn_reactor(name: &str) -> ReactorThread {
    let (handle_tx, handle_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let thread_name = format!("reactor-{name}");
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build reactor runtime");
            handle_tx
                .send(rt.handle().clone())
                .expect("reactor creator vanished");
            // Drive spawned work until the pool shuts this reactor down.
            rt.block_on(async {
                let _ = shutdown_rx.await;
            });
        })
        .expect("failed to spawn reactor thread");

    let handle = handle_rx.recv().expect("reactor thread died during startup");

    ReactorThread {
        reactor: Reactor {
            shared: Arc::new(ReactorShared {
                name: name.to_string(),
                handle,
                stats: ReactorStats::default(),
            }),
        },
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
    }
}

/// Set of named reactors. The default reactor exists from construction;
/// named reactors are created lazily on first use.
pub struct ReactorPool {
    reactors: Mutex<HashMap<String, ReactorThread>>,
}

impl ReactorPool {
    pub fn new() -> Self {
        let mut reactors = HashMap::new();
        reactors.insert(
            DEFAULT_REACTOR_NAME.to_string(),
            spawn_reactor(DEFAULT_REACTOR_NAME),
        );
        Self {
            reactors: Mutex::new(reactors),
        }
    }

    /// The reactor shared by all subsystems without a dedicated one.
    pub fn default_reactor(&self) -> Reactor {
        self.by_name(DEFAULT_REACTOR_NAME)
    }

    /// The named reactor, created on first use. Calling `by_name` after
    /// `shutdown_all` creates a fresh reactor.
    pub fn by_name(&self, name: &str) -> Reactor {
        let mut reactors = self.reactors.lock();
        reactors
            .entry(name.to_string())
            .or_insert_with(|| spawn_reactor(name))
            .reactor
            .clone()
    }

    /// Handles to every live reactor (for the event-stats print).
    pub fn all_reactors(&self) -> Vec<Reactor> {
        self.reactors
            .lock()
            .values()
            .map(|t| t.reactor.clone())
            .collect()
    }

    /// Stop every reactor and join its thread. Pending work is dropped.
    /// Idempotent.
    pub fn shutdown_all(&self) {
        let drained: Vec<ReactorThread> = {
            let mut reactors = self.reactors.lock();
            reactors.drain().map(|(_, t)| t).collect()
        };
        for mut thread in drained {
            if let Some(tx) = thread.shutdown_tx.take() {
                let _ = tx.send(());
            }
            if let Some(join) = thread.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Default for ReactorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

// ─── Periodic runner ────────────────────────────────────────────────────────

/// Runs a callback at a fixed interval on a reactor until stopped or
/// dropped. The first invocation happens immediately.
pub struct PeriodicalRunner {
    handle: Option<JoinHandle<()>>,
}

impl PeriodicalRunner {
    pub fn start<F>(reactor: &Reactor, interval: Duration, label: &str, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::clone(&reactor.shared);
        let label = label.to_string();
        let handle = reactor.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.stats.record_posted(&label);
                callback();
                shared.stats.record_finished(&label);
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PeriodicalRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread::ThreadId;

    #[test]
    fn test_posts_run_serially_in_order() {
        let pool = ReactorPool::new();
        let reactor = pool.default_reactor();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            reactor.post("test.order", move || order.lock().push(i));
        }
        let (tx, rx) = mpsc::channel();
        reactor.post("test.order", move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_posts_share_one_thread() {
        let pool = ReactorPool::new();
        let reactor = pool.default_reactor();

        let (tx, rx) = mpsc::channel::<ThreadId>();
        for _ in 0..2 {
            let tx = tx.clone();
            reactor.post("test.thread", move || {
                tx.send(std::thread::current().id()).unwrap()
            });
        }
        let t1 = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let t2 = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(t1, t2);
        assert_ne!(t1, std::thread::current().id());
    }

    #[test]
    fn test_named_reactors_are_distinct_threads() {
        let pool = ReactorPool::new();
        let a = pool.by_name("publisher");
        let b = pool.by_name("syncer");

        let (tx, rx) = mpsc::channel::<(String, ThreadId)>();
        for reactor in [&a, &b] {
            let tx = tx.clone();
            let name = reactor.name().to_string();
            reactor.post("test.thread", move || {
                tx.send((name, std::thread::current().id())).unwrap()
            });
        }
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(first.0, second.0);
        assert_ne!(first.1, second.1);
    }

    #[test]
    fn test_by_name_returns_same_reactor() {
        let pool = ReactorPool::new();
        let a = pool.by_name("internal_kv");
        let b = pool.by_name("internal_kv");

        let (tx, rx) = mpsc::channel::<ThreadId>();
        for reactor in [&a, &b] {
            let tx = tx.clone();
            reactor.post("test.same", move || {
                tx.send(std::thread::current().id()).unwrap()
            });
        }
        let t1 = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let t2 = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_schedule_after_delays() {
        let pool = ReactorPool::new();
        let reactor = pool.default_reactor();

        let (tx, rx) = mpsc::channel();
        let start = std::time::Instant::now();
        reactor.schedule_after("test.delay", Duration::from_millis(50), move || {
            tx.send(()).unwrap()
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_stats_track_labels() {
        let pool = ReactorPool::new();
        let reactor = pool.default_reactor();

        let (tx, rx) = mpsc::channel();
        reactor.post("store.put_callbacks", move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stats = reactor.stats().get("store.put_callbacks").unwrap();
        assert_eq!(stats.posted, 1);
        assert_eq!(stats.finished, 1);
        assert!(reactor.stats().stats_string().contains("store.put_callbacks"));
    }

    #[test]
    fn test_periodical_runner_fires_repeatedly() {
        let pool = ReactorPool::new();
        let reactor = pool.default_reactor();

        let count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let mut runner =
            PeriodicalRunner::start(&reactor, Duration::from_millis(10), "test.tick", move || {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            });

        std::thread::sleep(Duration::from_millis(100));
        let fired = count.load(std::sync::atomic::Ordering::Relaxed);
        assert!(fired >= 2, "expected at least 2 ticks, got {fired}");

        runner.stop();
        std::thread::sleep(Duration::from_millis(30));
        let after_stop = count.load(std::sync::atomic::Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_shutdown_all_is_idempotent() {
        let pool = ReactorPool::new();
        pool.by_name("task_manager");
        pool.shutdown_all();
        pool.shutdown_all();
    }
}
