// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared constants.

/// Length of Helios full-width unique IDs in bytes.
pub const UNIQUE_ID_SIZE: usize = 28;

/// KV namespace holding the cluster id.
pub const CLUSTER_ID_NAMESPACE: &str = "cluster";

/// KV key for the authoritative cluster id.
pub const CLUSTER_ID_KEY: &str = "cluster_id";

/// KV key for the control-plane server pid (decimal string).
pub const GCS_PID_KEY: &str = "gcs_pid";

/// KV namespace for autoscaler state.
pub const AUTOSCALER_STATE_NAMESPACE: &str = "__autoscaler";

/// KV key for the autoscaler v2 feature flag ("0" or "1").
pub const AUTOSCALER_V2_ENABLED_KEY: &str = "v2_enabled";

/// File name of the periodic control-plane debug dump.
pub const DEBUG_STATE_FILENAME: &str = "debug_state_gcs.txt";

/// Storage backend names accepted by the `gcs_storage` config value.
pub const IN_MEMORY_STORAGE: &str = "memory";
pub const REDIS_STORAGE: &str = "redis";
