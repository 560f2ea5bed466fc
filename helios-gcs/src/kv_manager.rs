// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Internal KV manager: request validation over the internal KV store.
//!
//! Runs on its own named reactor so bulk KV traffic cannot starve the
//! default reactor.

use std::sync::Arc;

use helios_common::reactor::Reactor;
use helios_common::status::{HeliosError, HeliosResult};

use crate::store_client::InternalKv;

/// Maximum accepted key length.
const MAX_KEY_LENGTH: usize = 8192;

pub struct GcsInternalKvManager {
    kv: Arc<dyn InternalKv>,
    /// Serialized config handed to raylets at registration.
    raylet_config_list: String,
    reactor: Reactor,
}

impl GcsInternalKvManager {
    pub fn new(kv: Arc<dyn InternalKv>, raylet_config_list: String, reactor: Reactor) -> Self {
        Self {
            kv,
            raylet_config_list,
            reactor,
        }
    }

    pub fn kv(&self) -> &Arc<dyn InternalKv> {
        &self.kv
    }

    pub fn raylet_config_list(&self) -> &str {
        &self.raylet_config_list
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Keys must be non-empty and bounded.
    pub fn validate_key(key: &str) -> HeliosResult<()> {
        if key.is_empty() {
            return Err(HeliosError::invalid_argument("key must not be empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(HeliosError::invalid_argument(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(())
    }

    // ── Request handlers ─────────────────────────────────────────────

    pub async fn handle_get(&self, namespace: &str, key: &str) -> HeliosResult<Option<Vec<u8>>> {
        Self::validate_key(key)?;
        self.kv.get(namespace, key).await
    }

    pub async fn handle_put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        overwrite: bool,
    ) -> HeliosResult<bool> {
        Self::validate_key(key)?;
        self.kv.put(namespace, key, value, overwrite).await
    }

    pub async fn handle_del(
        &self,
        namespace: &str,
        key: &str,
        del_by_prefix: bool,
    ) -> HeliosResult<i64> {
        Self::validate_key(key)?;
        self.kv.del(namespace, key, del_by_prefix).await
    }

    pub async fn handle_exists(&self, namespace: &str, key: &str) -> HeliosResult<bool> {
        Self::validate_key(key)?;
        self.kv.exists(namespace, key).await
    }

    pub async fn handle_keys(&self, namespace: &str, prefix: &str) -> HeliosResult<Vec<String>> {
        self.kv.keys(namespace, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_client::{InMemoryStoreClient, StoreClientInternalKv};
    use helios_common::reactor::ReactorPool;

    fn make_manager(pool: &ReactorPool) -> GcsInternalKvManager {
        let kv = Arc::new(StoreClientInternalKv::new(Arc::new(
            InMemoryStoreClient::new(),
        )));
        GcsInternalKvManager::new(kv, "config".to_string(), pool.by_name("internal_kv"))
    }

    #[tokio::test]
    async fn test_kv_manager_crud() {
        let pool = ReactorPool::new();
        let mgr = make_manager(&pool);

        assert!(mgr
            .handle_put("ns", "key1", b"val1".to_vec(), true)
            .await
            .unwrap());
        assert_eq!(
            mgr.handle_get("ns", "key1").await.unwrap(),
            Some(b"val1".to_vec())
        );
        assert!(mgr.handle_exists("ns", "key1").await.unwrap());

        assert_eq!(mgr.handle_del("ns", "key1", false).await.unwrap(), 1);
        assert!(!mgr.handle_exists("ns", "key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_manager_rejects_bad_keys() {
        let pool = ReactorPool::new();
        let mgr = make_manager(&pool);

        let err = mgr.handle_get("ns", "").await.unwrap_err();
        assert_eq!(err.code, helios_common::status::StatusCode::InvalidArgument);

        let long_key = "x".repeat(MAX_KEY_LENGTH + 1);
        let err = mgr
            .handle_put("ns", &long_key, b"v".to_vec(), true)
            .await
            .unwrap_err();
        assert_eq!(err.code, helios_common::status::StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_kv_manager_keys_listing() {
        let pool = ReactorPool::new();
        let mgr = make_manager(&pool);

        mgr.handle_put("ns", "hel/a", b"1".to_vec(), true).await.unwrap();
        mgr.handle_put("ns", "hel/b", b"2".to_vec(), true).await.unwrap();
        mgr.handle_put("ns", "other", b"3".to_vec(), true).await.unwrap();

        let keys = mgr.handle_keys("ns", "hel/").await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
