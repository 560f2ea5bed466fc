// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Persistence backends for GCS state.
//!
//! Two implementations of the raw `StoreClient` interface:
//! - `InMemoryStoreClient` for single-node, non-HA deployments
//! - `RedisStoreClient` for HA deployments with external Redis
//!
//! `StoreClientInternalKv` layers the namespaced internal KV (cluster id,
//! pid, feature flags, user data) on top of either backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use helios_common::status::{HeliosError, HeliosResult};
use helios_util::backoff::ExponentialBackoff;

/// Raw table-oriented KV operations. Tables are logical namespaces
/// ("Node", "Job", ...); each is an independent key-value map.
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    /// Write a key. With `overwrite = false` an existing key is left
    /// untouched. Returns whether a new key was added.
    async fn put(&self, table: &str, key: &str, data: Vec<u8>, overwrite: bool)
        -> HeliosResult<bool>;

    async fn get(&self, table: &str, key: &str) -> HeliosResult<Option<Vec<u8>>>;

    async fn get_all(&self, table: &str) -> HeliosResult<HashMap<String, Vec<u8>>>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, table: &str, key: &str) -> HeliosResult<bool>;

    /// Delete multiple keys. Returns how many existed.
    async fn batch_delete(&self, table: &str, keys: &[String]) -> HeliosResult<i64>;

    /// Delete every key with the given prefix. Returns how many were
    /// removed.
    async fn delete_by_prefix(&self, table: &str, prefix: &str) -> HeliosResult<i64>;

    async fn get_keys(&self, table: &str, prefix: &str) -> HeliosResult<Vec<String>>;

    async fn exists(&self, table: &str, key: &str) -> HeliosResult<bool>;

    /// Next value of the auto-incrementing job counter.
    async fn get_next_job_id(&self) -> HeliosResult<i32>;
}

// ─── Internal KV ────────────────────────────────────────────────────────────

/// Namespaced KV operations backing the internal KV service and the
/// control plane's own persistent keys.
#[async_trait::async_trait]
pub trait InternalKv: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> HeliosResult<Option<Vec<u8>>>;

    /// Returns whether a new key was added (false when `overwrite = false`
    /// lost to an existing value, or when overwriting).
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        overwrite: bool,
    ) -> HeliosResult<bool>;

    /// Delete a key, or all keys under a prefix. Returns the count.
    async fn del(&self, namespace: &str, key: &str, del_by_prefix: bool) -> HeliosResult<i64>;

    async fn exists(&self, namespace: &str, key: &str) -> HeliosResult<bool>;

    async fn keys(&self, namespace: &str, prefix: &str) -> HeliosResult<Vec<String>>;
}

const KV_TABLE: &str = "InternalKV";
// Separates namespace from key inside the KV table. Namespaces are
// control-plane-chosen and never contain this byte.
const NS_SEP: char = '\u{1}';

/// Internal KV layered over a raw store client.
pub struct StoreClientInternalKv {
    store: Arc<dyn StoreClient>,
}

impl StoreClientInternalKv {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn full_key(namespace: &str, key: &str) -> String {
        format!("{namespace}{NS_SEP}{key}")
    }
}

#[async_trait::async_trait]
impl InternalKv for StoreClientInternalKv {
    async fn get(&self, namespace: &str, key: &str) -> HeliosResult<Option<Vec<u8>>> {
        self.store.get(KV_TABLE, &Self::full_key(namespace, key)).await
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        overwrite: bool,
    ) -> HeliosResult<bool> {
        self.store
            .put(KV_TABLE, &Self::full_key(namespace, key), value, overwrite)
            .await
    }

    async fn del(&self, namespace: &str, key: &str, del_by_prefix: bool) -> HeliosResult<i64> {
        let full = Self::full_key(namespace, key);
        if del_by_prefix {
            self.store.delete_by_prefix(KV_TABLE, &full).await
        } else {
            Ok(self.store.delete(KV_TABLE, &full).await? as i64)
        }
    }

    async fn exists(&self, namespace: &str, key: &str) -> HeliosResult<bool> {
        self.store.exists(KV_TABLE, &Self::full_key(namespace, key)).await
    }

    async fn keys(&self, namespace: &str, prefix: &str) -> HeliosResult<Vec<String>> {
        let ns_prefix = Self::full_key(namespace, prefix);
        let keys = self.store.get_keys(KV_TABLE, &ns_prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.split_once(NS_SEP).map(|(_, rest)| rest.to_string()))
            .collect())
    }
}

// ─── In-memory backend ──────────────────────────────────────────────────────

/// Thread-safe in-memory store client for non-HA deployments.
pub struct InMemoryStoreClient {
    tables: DashMap<String, DashMap<String, Vec<u8>>>,
    next_job_id: AtomicI64,
}

impl InMemoryStoreClient {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_job_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryStoreClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StoreClient for InMemoryStoreClient {
    async fn put(
        &self,
        table: &str,
        key: &str,
        data: Vec<u8>,
        overwrite: bool,
    ) -> HeliosResult<bool> {
        let tbl = self.tables.entry(table.to_string()).or_default();
        let existed = tbl.contains_key(key);
        if existed && !overwrite {
            return Ok(false);
        }
        tbl.insert(key.to_string(), data);
        Ok(!existed)
    }

    async fn get(&self, table: &str, key: &str) -> HeliosResult<Option<Vec<u8>>> {
        match self.tables.get(table) {
            Some(tbl) => Ok(tbl.get(key).map(|v| v.value().clone())),
            None => Ok(None),
        }
    }

    async fn get_all(&self, table: &str) -> HeliosResult<HashMap<String, Vec<u8>>> {
        match self.tables.get(table) {
            Some(tbl) => Ok(tbl
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect()),
            None => Ok(HashMap::new()),
        }
    }

    async fn delete(&self, table: &str, key: &str) -> HeliosResult<bool> {
        match self.tables.get(table) {
            Some(tbl) => Ok(tbl.remove(key).is_some()),
            None => Ok(false),
        }
    }

    async fn batch_delete(&self, table: &str, keys: &[String]) -> HeliosResult<i64> {
        let mut count = 0i64;
        if let Some(tbl) = self.tables.get(table) {
            for key in keys {
                if tbl.remove(key.as_str()).is_some() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn delete_by_prefix(&self, table: &str, prefix: &str) -> HeliosResult<i64> {
        let Some(tbl) = self.tables.get(table) else {
            return Ok(0);
        };
        let doomed: Vec<String> = tbl
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let count = doomed.len() as i64;
        for key in doomed {
            tbl.remove(&key);
        }
        Ok(count)
    }

    async fn get_keys(&self, table: &str, prefix: &str) -> HeliosResult<Vec<String>> {
        match self.tables.get(table) {
            Some(tbl) => Ok(tbl
                .iter()
                .filter(|e| e.key().starts_with(prefix))
                .map(|e| e.key().clone())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn exists(&self, table: &str, key: &str) -> HeliosResult<bool> {
        match self.tables.get(table) {
            Some(tbl) => Ok(tbl.contains_key(key)),
            None => Ok(false),
        }
    }

    async fn get_next_job_id(&self) -> HeliosResult<i32> {
        Ok(self.next_job_id.fetch_add(1, Ordering::SeqCst) as i32)
    }
}

// ─── Redis backend ──────────────────────────────────────────────────────────

/// Redis-backed store client for HA deployments. Each table maps to one
/// Redis hash.
pub struct RedisStoreClient {
    client: redis::Client,
    namespace: String,
}

/// Connection attempts before a Redis operation is reported as failed.
const REDIS_CONNECT_ATTEMPTS: u32 = 3;

impl RedisStoreClient {
    pub fn new(redis_url: &str, namespace: String) -> HeliosResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| HeliosError::redis_error(e.to_string()))?;
        Ok(Self { client, namespace })
    }

    /// Get a connection, retrying transient failures under exponential
    /// backoff with jitter.
    async fn conn(&self) -> HeliosResult<redis::aio::MultiplexedConnection> {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        );
        let mut attempt = 0u32;
        loop {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    attempt += 1;
                    if attempt >= REDIS_CONNECT_ATTEMPTS {
                        return Err(redis_err(e));
                    }
                    tracing::warn!(attempt, error = %e, "Redis connection failed; retrying");
                    tokio::time::sleep(backoff.next_delay_with_jitter()).await;
                }
            }
        }
    }

    fn table_key(&self, table: &str) -> String {
        format!("HELIOS{}@{}", self.namespace, table)
    }
}

fn redis_err(e: redis::RedisError) -> HeliosError {
    HeliosError::redis_error(e.to_string())
}

#[async_trait::async_trait]
impl StoreClient for RedisStoreClient {
    async fn put(
        &self,
        table: &str,
        key: &str,
        data: Vec<u8>,
        overwrite: bool,
    ) -> HeliosResult<bool> {
        let mut conn = self.conn().await?;
        let table_key = self.table_key(table);
        if overwrite {
            let existed: bool = redis::cmd("HEXISTS")
                .arg(&table_key)
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            let _: () = redis::cmd("HSET")
                .arg(&table_key)
                .arg(key)
                .arg(data)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            Ok(!existed)
        } else {
            let added: bool = redis::cmd("HSETNX")
                .arg(&table_key)
                .arg(key)
                .arg(data)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            Ok(added)
        }
    }

    async fn get(&self, table: &str, key: &str) -> HeliosResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        redis::cmd("HGET")
            .arg(self.table_key(table))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_all(&self, table: &str) -> HeliosResult<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn().await?;
        redis::cmd("HGETALL")
            .arg(self.table_key(table))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn delete(&self, table: &str, key: &str) -> HeliosResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.table_key(table))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn batch_delete(&self, table: &str, keys: &[String]) -> HeliosResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(self.table_key(table));
        for key in keys {
            cmd.arg(key.as_str());
        }
        cmd.query_async(&mut conn).await.map_err(redis_err)
    }

    async fn delete_by_prefix(&self, table: &str, prefix: &str) -> HeliosResult<i64> {
        let doomed = self.get_keys(table, prefix).await?;
        self.batch_delete(table, &doomed).await
    }

    async fn get_keys(&self, table: &str, prefix: &str) -> HeliosResult<Vec<String>> {
        let all: HashMap<String, Vec<u8>> = self.get_all(table).await?;
        Ok(all.into_keys().filter(|k| k.starts_with(prefix)).collect())
    }

    async fn exists(&self, table: &str, key: &str) -> HeliosResult<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("HEXISTS")
            .arg(self.table_key(table))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_next_job_id(&self) -> HeliosResult<i32> {
        let mut conn = self.conn().await?;
        let id: i64 = redis::cmd("INCR")
            .arg(format!("HELIOS{}@NextJobID", self.namespace))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(id as i32)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
