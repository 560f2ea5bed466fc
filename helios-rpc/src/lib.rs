// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Collaborator RPC interfaces.
//!
//! The transport itself lives outside this core; these traits name the
//! operations the core exchanges with raylets and workers, and the pools
//! manage per-node/per-worker client handles.

pub mod pools;
pub mod raylet;

pub use pools::{RayletClientPool, WorkerAddress, WorkerClient, WorkerClientPool};
pub use raylet::{ChannelRayletClient, NodeAddress, RayletClient, ResourceLoad};
