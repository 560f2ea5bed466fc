// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Usage stats client: feature-usage tags recorded into the internal KV
//! for the external reporter to pick up.

use std::sync::Arc;

use helios_common::reactor::Reactor;

use crate::store_client::InternalKv;

const USAGE_STATS_NAMESPACE: &str = "usage_stats";

pub struct UsageStatsClient {
    kv: Arc<dyn InternalKv>,
    reactor: Reactor,
}

impl UsageStatsClient {
    pub fn new(kv: Arc<dyn InternalKv>, reactor: Reactor) -> Self {
        Self { kv, reactor }
    }

    /// Record a usage tag. Fire-and-forget; failures only log.
    pub fn record_extra_usage_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        let kv = self.kv.clone();
        let key = key.into();
        let value = value.into();
        self.reactor.spawn(async move {
            if let Err(e) = kv
                .put(
                    USAGE_STATS_NAMESPACE,
                    &format!("extra_usage_tag_{key}"),
                    value.into_bytes(),
                    true,
                )
                .await
            {
                tracing::debug!(%key, error = %e, "Failed to record usage tag");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_client::{InMemoryStoreClient, StoreClientInternalKv};
    use helios_common::reactor::ReactorPool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tag_lands_in_kv() {
        let pool = ReactorPool::new();
        let kv = Arc::new(StoreClientInternalKv::new(Arc::new(
            InMemoryStoreClient::new(),
        )));
        let client = UsageStatsClient::new(kv.clone(), pool.default_reactor());

        client.record_extra_usage_tag("gcs_storage", "memory");

        // The write happens on the reactor.
        for _ in 0..50 {
            if kv
                .exists(USAGE_STATS_NAMESPACE, "extra_usage_tag_gcs_storage")
                .await
                .unwrap()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            kv.get(USAGE_STATS_NAMESPACE, "extra_usage_tag_gcs_storage")
                .await
                .unwrap(),
            Some(b"memory".to_vec())
        );
    }
}
