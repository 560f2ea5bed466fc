// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Utility library for Helios.
//!
//! Logging, time helpers, random bytes, and small rate-limiting primitives
//! shared across the runtime.

pub mod backoff;
pub mod logging;
pub mod random;
pub mod throttler;
pub mod time;
