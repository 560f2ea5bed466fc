// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared-memory object store client interface.
//!
//! The plasma daemon and its wire protocol live outside this crate. The
//! memory store only interacts with it indirectly: `MemoryStore::
//! delete_with_plasma_forward` hands back the ids of in-plasma sentinels so
//! the caller can forward them to `PlasmaClient::delete`.

use bytes::Bytes;

use helios_common::id::ObjectID;
use helios_common::status::HeliosResult;

/// Narrow capability set over the shared-memory store.
pub trait PlasmaClient: Send + Sync {
    fn connect(&self, store_socket_name: &str) -> HeliosResult<()>;

    /// Create an object buffer, spilling other objects if the store is at
    /// capacity.
    fn create_and_spill_if_needed(
        &self,
        object_id: &ObjectID,
        metadata: &[u8],
        data_size: usize,
    ) -> HeliosResult<()>;

    /// Create an object buffer only if space is available right now.
    fn try_create_immediately(
        &self,
        object_id: &ObjectID,
        metadata: &[u8],
        data_size: usize,
    ) -> HeliosResult<()>;

    /// Fetch sealed objects, blocking up to `timeout_ms` for each.
    fn get(&self, object_ids: &[ObjectID], timeout_ms: i64) -> HeliosResult<Vec<Option<Bytes>>>;

    /// Make a created object immutable and visible to readers.
    fn seal(&self, object_id: &ObjectID) -> HeliosResult<()>;

    /// Drop an unsealed object.
    fn abort(&self, object_id: &ObjectID) -> HeliosResult<()>;

    /// Release a read reference obtained from `get`.
    fn release(&self, object_id: &ObjectID) -> HeliosResult<()>;

    fn contains(&self, object_id: &ObjectID) -> HeliosResult<bool>;

    fn delete(&self, object_ids: &[ObjectID]) -> HeliosResult<()>;

    fn disconnect(&self) -> HeliosResult<()>;
}
