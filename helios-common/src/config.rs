// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Helios configuration.
//!
//! A plain value that is threaded explicitly through constructors; there is
//! no process-global config. The launcher passes overrides as a
//! base64-encoded JSON object, and `HELIOS_<field>` environment variables
//! take precedence over both defaults and JSON.

/// Tunables consumed by the core. Defaults match production settings.
#[derive(Debug, Clone)]
pub struct HeliosConfig {
    // ─── Object store ─────────────────────────────────────────
    /// Upper bound on one slice of a blocking get, so signal checks stay
    /// responsive.
    pub check_signal_interval_milliseconds: i64,
    /// How long an unobserved error object may linger before it is
    /// reported as unhandled.
    pub unhandled_error_grace_period_ms: u64,
    /// Cap on entries examined per unhandled-error scan.
    pub unhandled_error_scan_limit: usize,

    // ─── Health checking ──────────────────────────────────────
    pub health_check_initial_delay_ms: u64,
    pub health_check_timeout_ms: u64,
    pub health_check_period_ms: u64,
    pub health_check_failure_threshold: u32,

    // ─── Control plane ────────────────────────────────────────
    /// Storage backend: "memory" or "redis".
    pub gcs_storage: String,
    pub gcs_pull_resource_loads_period_milliseconds: u64,
    pub gcs_actor_scheduling_enabled: bool,
    pub enable_autoscaler_v2: bool,
    pub global_gc_min_interval_s: u64,

    // ─── Debug / metrics ──────────────────────────────────────
    pub metrics_report_interval_ms: u64,
    pub debug_dump_period_milliseconds: u64,
    pub event_stats: bool,
    pub event_stats_print_interval_ms: i64,

    // ─── Pubsub ───────────────────────────────────────────────
    pub subscriber_timeout_ms: u64,
    pub publish_batch_size: usize,
}

impl Default for HeliosConfig {
    fn default() -> Self {
        Self {
            check_signal_interval_milliseconds: 100,
            unhandled_error_grace_period_ms: 5_000,
            unhandled_error_scan_limit: 1_000,
            health_check_initial_delay_ms: 5_000,
            health_check_timeout_ms: 10_000,
            health_check_period_ms: 5_000,
            health_check_failure_threshold: 5,
            gcs_storage: "memory".to_string(),
            gcs_pull_resource_loads_period_milliseconds: 1_000,
            gcs_actor_scheduling_enabled: false,
            enable_autoscaler_v2: false,
            global_gc_min_interval_s: 30,
            metrics_report_interval_ms: 10_000,
            debug_dump_period_milliseconds: 10_000,
            event_stats: true,
            event_stats_print_interval_ms: 60_000,
            subscriber_timeout_ms: 300_000,
            publish_batch_size: 5_000,
        }
    }
}

impl HeliosConfig {
    /// Parse from base64-encoded JSON (as sent by the launcher).
    pub fn from_base64_json(b64: &str) -> Result<Self, String> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| format!("base64 decode error: {e}"))?;
        let json_str =
            String::from_utf8(decoded).map_err(|e| format!("UTF-8 decode error: {e}"))?;
        Self::from_json(&json_str)
    }

    /// Parse from a JSON string of field overrides.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, bool) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_bool()) {
                    config.$field = v;
                }
            };
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
            };
            ($field:ident, i64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_i64()) {
                    config.$field = v;
                }
            };
            ($field:ident, usize) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v as usize;
                }
            };
            ($field:ident, String) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_str()) {
                    config.$field = v.to_string();
                }
            };
        }

        set_field!(check_signal_interval_milliseconds, i64);
        set_field!(unhandled_error_grace_period_ms, u64);
        set_field!(unhandled_error_scan_limit, usize);
        set_field!(health_check_initial_delay_ms, u64);
        set_field!(health_check_timeout_ms, u64);
        set_field!(health_check_period_ms, u64);
        if let Some(v) = map
            .get("health_check_failure_threshold")
            .and_then(|v| v.as_u64())
        {
            config.health_check_failure_threshold = v as u32;
        }
        set_field!(gcs_storage, String);
        set_field!(gcs_pull_resource_loads_period_milliseconds, u64);
        set_field!(gcs_actor_scheduling_enabled, bool);
        set_field!(enable_autoscaler_v2, bool);
        set_field!(global_gc_min_interval_s, u64);
        set_field!(metrics_report_interval_ms, u64);
        set_field!(debug_dump_period_milliseconds, u64);
        set_field!(event_stats, bool);
        set_field!(event_stats_print_interval_ms, i64);
        set_field!(subscriber_timeout_ms, u64);
        set_field!(publish_batch_size, usize);

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides of the form `HELIOS_<field>`.
    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $ty:ty) => {
                let env_key = concat!("HELIOS_", stringify!($field));
                if let Ok(val) = std::env::var(env_key) {
                    if let Ok(v) = val.parse::<$ty>() {
                        self.$field = v;
                    }
                }
            };
        }

        env_override!(check_signal_interval_milliseconds, i64);
        env_override!(event_stats, bool);
        env_override!(gcs_storage, String);
        env_override!(enable_autoscaler_v2, bool);
        env_override!(gcs_actor_scheduling_enabled, bool);
        env_override!(health_check_failure_threshold, u32);
        env_override!(debug_dump_period_milliseconds, u64);
    }
}
