// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Fixed-width binary ID types.
//!
//! ID hierarchy:
//! - `JobID` (4 bytes)
//! - `ActorID` (16 bytes = 12 unique + 4 JobID)
//! - `TaskID` (24 bytes = 8 unique + 16 ActorID)
//! - `ObjectID` (28 bytes = 4 index + 24 TaskID)
//! - `PlacementGroupID` (18 bytes = 14 unique + 4 JobID)
//! - `UniqueID` / `WorkerID` / `NodeID` / `ClusterID` (28 bytes)
//!
//! IDs hash through MurmurHash64A so that the same bytes hash identically
//! on every node, and serialize as lowercase hex strings.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::constants::UNIQUE_ID_SIZE;

// ─── MurmurHash64A ──────────────────────────────────────────────────────────

fn murmur_hash_64a(key: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: i32 = 47;

    let len = key.len();
    let mut h: u64 = seed ^ ((len as u64).wrapping_mul(M));

    let n_blocks = len / 8;
    for i in 0..n_blocks {
        let offset = i * 8;
        let mut k = u64::from_le_bytes(key[offset..offset + 8].try_into().unwrap());

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = &key[n_blocks * 8..];
    let remaining = len & 7;
    if remaining >= 7 {
        h ^= (tail[6] as u64) << 48;
    }
    if remaining >= 6 {
        h ^= (tail[5] as u64) << 40;
    }
    if remaining >= 5 {
        h ^= (tail[4] as u64) << 32;
    }
    if remaining >= 4 {
        h ^= (tail[3] as u64) << 24;
    }
    if remaining >= 3 {
        h ^= (tail[2] as u64) << 16;
    }
    if remaining >= 2 {
        h ^= (tail[1] as u64) << 8;
    }
    if remaining >= 1 {
        h ^= tail[0] as u64;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    h
}

// ─── ID macro ───────────────────────────────────────────────────────────────

/// Generates a fixed-size binary ID type.
///
/// Each ID is a `[u8; N]` newtype with:
/// - `from_binary` / `from_hex` / `from_random` constructors
/// - `binary()` / `hex()` / `data()` accessors
/// - `Hash`, `Eq`, `PartialEq`, `Clone`, `Copy`, `Debug`, `Display`
/// - serde as a lowercase hex string
/// - `nil()` default (all 0xFF bytes)
macro_rules! define_binary_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy)]
        #[repr(C)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            /// The fixed byte size of this ID type.
            pub const SIZE: usize = $size;

            /// Create a nil ID (all 0xFF bytes).
            pub const fn nil() -> Self {
                Self {
                    data: [0xFF; $size],
                }
            }

            /// Create an ID from raw bytes. Panics if `bytes.len() != SIZE`.
            pub fn from_binary(bytes: &[u8]) -> Self {
                assert_eq!(
                    bytes.len(),
                    $size,
                    "expected {} bytes for {}, got {}",
                    $size,
                    stringify!($name),
                    bytes.len()
                );
                let mut data = [0u8; $size];
                data.copy_from_slice(bytes);
                Self { data }
            }

            /// Create an ID from a hex string. Returns `nil()` on invalid input.
            pub fn from_hex(hex_str: &str) -> Self {
                if hex_str.len() != $size * 2 {
                    tracing::error!(
                        "incorrect hex string length for {}: expected {}, got {}",
                        stringify!($name),
                        $size * 2,
                        hex_str.len()
                    );
                    return Self::nil();
                }
                match hex::decode(hex_str) {
                    Ok(bytes) => Self::from_binary(&bytes),
                    Err(_) => {
                        tracing::error!("invalid hex string for {}", stringify!($name));
                        Self::nil()
                    }
                }
            }

            /// Create a random ID.
            pub fn from_random() -> Self {
                let mut data = [0u8; $size];
                helios_util::random::fill_random(&mut data);
                Self { data }
            }

            /// Returns true if this is the nil ID (all 0xFF).
            pub fn is_nil(&self) -> bool {
                self.data == [0xFF; $size]
            }

            /// Raw byte array reference.
            pub fn data(&self) -> &[u8; $size] {
                &self.data
            }

            /// Raw bytes as `&[u8]`.
            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            /// Owned copy of the raw bytes.
            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            /// Hex-encoded string (lowercase).
            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }

            /// Node-independent MurmurHash64A of the raw bytes.
            pub fn murmur_hash(&self) -> u64 {
                murmur_hash_64a(&self.data, 0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.data == other.data
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.data.cmp(&other.data)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                // Hash the murmur output so the value is stable across nodes
                // while staying compatible with std HashMap.
                self.murmur_hash().hash(state);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                if s.len() != $size * 2 {
                    return Err(serde::de::Error::custom(format!(
                        "expected {} hex chars for {}, got {}",
                        $size * 2,
                        stringify!($name),
                        s.len()
                    )));
                }
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                Ok(Self::from_binary(&bytes))
            }
        }
    };
}

// ─── ID type definitions ────────────────────────────────────────────────────

define_binary_id!(UniqueID, UNIQUE_ID_SIZE);
define_binary_id!(JobID, 4);
define_binary_id!(ActorID, 16);
define_binary_id!(TaskID, 24);
define_binary_id!(ObjectID, 28);
define_binary_id!(PlacementGroupID, 18);
define_binary_id!(WorkerID, UNIQUE_ID_SIZE);
define_binary_id!(NodeID, UNIQUE_ID_SIZE);
define_binary_id!(ClusterID, UNIQUE_ID_SIZE);

// ─── JobID extras ───────────────────────────────────────────────────────────

impl JobID {
    /// Create a JobID from a u32 counter.
    pub fn from_int(value: u32) -> Self {
        Self {
            data: value.to_be_bytes(),
        }
    }

    /// Convert back to the u32 counter.
    pub fn to_int(&self) -> u32 {
        u32::from_be_bytes(self.data)
    }
}

// ─── ActorID extras ─────────────────────────────────────────────────────────

impl ActorID {
    const UNIQUE_BYTES_LENGTH: usize = 12;

    /// Derive an ActorID from its job and parent task position.
    pub fn of(job_id: &JobID, parent_task_id: &TaskID, parent_task_counter: usize) -> Self {
        let mut data = [0u8; 16];

        let mut hash_input = Vec::with_capacity(TaskID::SIZE + 8);
        hash_input.extend_from_slice(parent_task_id.as_bytes());
        hash_input.extend_from_slice(&(parent_task_counter as u64).to_le_bytes());

        let hash = murmur_hash_64a(&hash_input, 0);
        let hash_bytes = hash.to_le_bytes();

        data[..8].copy_from_slice(&hash_bytes);
        let hash2 = murmur_hash_64a(&hash_bytes, 1);
        data[8..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&hash2.to_le_bytes()[..4]);

        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(job_id.data());

        Self { data }
    }

    /// Extract the embedded JobID (last 4 bytes).
    pub fn job_id(&self) -> JobID {
        JobID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }
}

// ─── TaskID extras ──────────────────────────────────────────────────────────

impl TaskID {
    const UNIQUE_BYTES_LENGTH: usize = 8;

    /// The TaskID of an actor's creation task (unique bytes all zero).
    pub fn for_actor_creation_task(actor_id: &ActorID) -> Self {
        let mut data = [0u8; 24];
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());
        Self { data }
    }

    /// Derive a TaskID for a normal (non-actor) task.
    pub fn for_normal_task(
        job_id: &JobID,
        parent_task_id: &TaskID,
        parent_task_counter: usize,
    ) -> Self {
        Self::for_actor_task(job_id, parent_task_id, parent_task_counter, &ActorID::nil())
    }

    /// Derive a TaskID for an actor task.
    pub fn for_actor_task(
        _job_id: &JobID,
        parent_task_id: &TaskID,
        parent_task_counter: usize,
        actor_id: &ActorID,
    ) -> Self {
        let mut data = [0u8; 24];

        let mut hash_input = Vec::with_capacity(TaskID::SIZE + 8);
        hash_input.extend_from_slice(parent_task_id.as_bytes());
        hash_input.extend_from_slice(&(parent_task_counter as u64).to_le_bytes());
        let hash = murmur_hash_64a(&hash_input, 0);

        data[..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&hash.to_le_bytes());
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());

        Self { data }
    }

    /// The TaskID of a job's driver task.
    pub fn for_driver_task(job_id: &JobID) -> Self {
        let actor_id = ActorID::of(job_id, &TaskID::nil(), 0);
        Self::for_actor_creation_task(&actor_id)
    }

    /// Extract the embedded ActorID (last 16 bytes).
    pub fn actor_id(&self) -> ActorID {
        ActorID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }

    /// Extract the embedded JobID (through the ActorID).
    pub fn job_id(&self) -> JobID {
        self.actor_id().job_id()
    }

    /// Whether this is an actor creation task.
    pub fn is_for_actor_creation_task(&self) -> bool {
        self.data[..Self::UNIQUE_BYTES_LENGTH]
            .iter()
            .all(|&b| b == 0)
    }
}

// ─── ObjectID extras ────────────────────────────────────────────────────────

impl ObjectID {
    const INDEX_BYTES_LENGTH: usize = 4;

    /// Maximum number of objects a single task can return.
    pub const MAX_OBJECT_INDEX: u64 = (1u64 << 32) - 1;

    /// Create an ObjectID from the producing task and a return index.
    pub fn from_index(task_id: &TaskID, index: u32) -> Self {
        let mut data = [0u8; 28];
        data[..Self::INDEX_BYTES_LENGTH].copy_from_slice(&index.to_be_bytes());
        data[Self::INDEX_BYTES_LENGTH..].copy_from_slice(task_id.data());
        Self { data }
    }

    /// The return index (first 4 bytes, big-endian).
    pub fn object_index(&self) -> u32 {
        u32::from_be_bytes(self.data[..Self::INDEX_BYTES_LENGTH].try_into().unwrap())
    }

    /// Extract the embedded TaskID (last 24 bytes).
    pub fn task_id(&self) -> TaskID {
        TaskID::from_binary(&self.data[Self::INDEX_BYTES_LENGTH..])
    }
}

// ─── PlacementGroupID extras ────────────────────────────────────────────────

impl PlacementGroupID {
    const UNIQUE_BYTES_LENGTH: usize = 14;

    /// Create a random PlacementGroupID for a given job.
    pub fn of(job_id: &JobID) -> Self {
        let mut data = [0u8; 18];
        helios_util::random::fill_random(&mut data[..Self::UNIQUE_BYTES_LENGTH]);
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(job_id.data());
        Self { data }
    }

    /// Extract the embedded JobID (last 4 bytes).
    pub fn job_id(&self) -> JobID {
        JobID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }
}

// ─── Special constants ──────────────────────────────────────────────────────

/// Sentinel NodeID the control plane uses for itself (all zeros).
pub const GCS_NODE_ID: NodeID = NodeID {
    data: [0u8; UNIQUE_ID_SIZE],
};

/// Bundle ID type: (PlacementGroupID, bundle_index).
pub type BundleID = (PlacementGroupID, i64);

// ─── Tests ──────────────────────────────────────────────────────────────────
