// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker-local in-memory object store.
//!
//! Holds small task results on the worker heap, coordinates producers with
//! blocking and asynchronous consumers, and tracks in-plasma sentinels for
//! values that live in the shared-memory store.

pub mod context;
pub mod memory_store;
pub mod object;
pub mod plasma;

pub use context::{WorkerContext, WorkerType};
pub use memory_store::{
    MemoryStore, MemoryStoreBuilder, MemoryStoreConfig, MemoryStoreStats, RefCountedRemovePolicy,
    ReferenceCounter,
};
pub use object::{ErrorKind, HeliosObject, Transport};
pub use plasma::PlasmaClient;
