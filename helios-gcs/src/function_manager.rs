// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Function manager: reference-counts jobs and evicts their exported
//! functions from the internal KV once the last reference drops.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use helios_common::id::JobID;

use crate::store_client::InternalKv;

/// KV namespace holding exported function definitions, keyed by
/// `<job_hex>:<function_id>`.
const FUNCTION_NAMESPACE: &str = "fun";

pub struct GcsFunctionManager {
    kv: Arc<dyn InternalKv>,
    job_references: Mutex<HashMap<JobID, usize>>,
}

impl GcsFunctionManager {
    pub fn new(kv: Arc<dyn InternalKv>) -> Self {
        Self {
            kv,
            job_references: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_job_reference(&self, job_id: JobID) {
        *self.job_references.lock().entry(job_id).or_insert(0) += 1;
    }

    /// Drop one reference; on the last one, evict the job's exported
    /// functions.
    pub async fn remove_job_reference(&self, job_id: JobID) {
        let evict = {
            let mut refs = self.job_references.lock();
            match refs.get_mut(&job_id) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(&job_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if evict {
            let prefix = format!("{}:", job_id.hex());
            match self.kv.del(FUNCTION_NAMESPACE, &prefix, true).await {
                Ok(removed) => {
                    tracing::debug!(%job_id, removed, "Evicted exported functions")
                }
                Err(e) => tracing::warn!(%job_id, error = %e, "Failed to evict exported functions"),
            }
        }
    }

    pub fn num_referenced_jobs(&self) -> usize {
        self.job_references.lock().len()
    }
}
