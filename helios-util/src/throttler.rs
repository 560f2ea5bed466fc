// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! A single-slot token bucket used to rate-limit expensive cluster-wide
//! actions (e.g. global GC broadcasts).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Allows an action at most once per `min_interval`.
///
/// `able_to_run` only inspects the bucket; the caller consumes the token
/// with `run_now` after actually performing the action.
pub struct Throttler {
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Throttler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: Mutex::new(None),
        }
    }

    /// Whether enough time has passed since the last `run_now`.
    pub fn able_to_run(&self) -> bool {
        match *self.last_run.lock() {
            None => true,
            Some(last) => last.elapsed() >= self.min_interval,
        }
    }

    /// Consume the token, starting a new interval.
    pub fn run_now(&self) {
        *self.last_run.lock() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_run_is_allowed() {
        let throttler = Throttler::new(Duration::from_secs(60));
        assert!(throttler.able_to_run());
    }

    #[test]
    fn test_run_consumes_token() {
        let throttler = Throttler::new(Duration::from_secs(60));
        throttler.run_now();
        assert!(!throttler.able_to_run());
    }

    #[test]
    fn test_token_replenishes() {
        let throttler = Throttler::new(Duration::from_millis(20));
        throttler.run_now();
        assert!(!throttler.able_to_run());
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttler.able_to_run());
    }
}
