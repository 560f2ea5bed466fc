// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The in-memory object record.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use helios_common::id::ObjectID;

/// Error tag carried by error-typed objects.
///
/// `ObjectInPlasma` is not a real error: it marks a local sentinel whose
/// actual payload lives in the shared-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ObjectInPlasma,
    WorkerDied,
    TaskExecutionException,
    ActorDied,
}

/// Transport hint for consumers that can move payloads out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    ObjectStore,
    OutOfBand,
}

/// An immutable-after-construction object value.
///
/// The `accessed` flag is one-shot monotonic: it flips to true the first
/// time any caller observes the value and is the basis of unhandled-error
/// detection.
#[derive(Debug)]
pub struct HeliosObject {
    data: Bytes,
    metadata: Bytes,
    nested_refs: Vec<ObjectID>,
    error_type: Option<ErrorKind>,
    transport: Transport,
    created_at_ns: u64,
    accessed: AtomicBool,
}

impl HeliosObject {
    pub fn new(data: Bytes, metadata: Bytes, nested_refs: Vec<ObjectID>) -> Self {
        Self {
            data,
            metadata,
            nested_refs,
            error_type: None,
            transport: Transport::default(),
            created_at_ns: helios_util::time::current_time_ns(),
            accessed: AtomicBool::new(false),
        }
    }

    /// A simple data-only object.
    pub fn from_data(data: Bytes) -> Self {
        Self::new(data, Bytes::new(), Vec::new())
    }

    /// An error-typed object with no payload.
    pub fn from_error(kind: ErrorKind) -> Self {
        let mut obj = Self::new(Bytes::new(), Bytes::new(), Vec::new());
        obj.error_type = Some(kind);
        obj
    }

    /// The local placeholder for a value sealed into the shared-memory
    /// store.
    pub fn in_plasma_sentinel() -> Self {
        Self::from_error(ErrorKind::ObjectInPlasma)
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn nested_refs(&self) -> &[ObjectID] {
        &self.nested_refs
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn created_at_ns(&self) -> u64 {
        self.created_at_ns
    }

    /// Payload plus metadata bytes; what the store's byte counter tracks.
    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.len()
    }

    pub fn error_type(&self) -> Option<ErrorKind> {
        self.error_type
    }

    pub fn is_exception(&self) -> bool {
        self.error_type.is_some()
    }

    /// Whether this is the in-plasma sentinel rather than a real value.
    pub fn is_in_plasma(&self) -> bool {
        self.error_type == Some(ErrorKind::ObjectInPlasma)
    }

    /// Record that a caller observed this value. Monotonic.
    pub fn set_accessed(&self) {
        self.accessed.store(true, Ordering::Release);
    }

    pub fn was_accessed(&self) -> bool {
        self.accessed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_data_and_metadata() {
        let obj = HeliosObject::new(
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"de"),
            Vec::new(),
        );
        assert_eq!(obj.size(), 5);
    }

    #[test]
    fn test_accessed_flag_is_monotonic() {
        let obj = HeliosObject::from_data(Bytes::from_static(b"x"));
        assert!(!obj.was_accessed());
        obj.set_accessed();
        obj.set_accessed();
        assert!(obj.was_accessed());
    }

    #[test]
    fn test_in_plasma_sentinel_is_not_a_plain_value() {
        let obj = HeliosObject::in_plasma_sentinel();
        assert!(obj.is_exception());
        assert!(obj.is_in_plasma());
        assert_eq!(obj.error_type(), Some(ErrorKind::ObjectInPlasma));
    }

    #[test]
    fn test_error_object() {
        let obj = HeliosObject::from_error(ErrorKind::WorkerDied);
        assert!(obj.is_exception());
        assert!(!obj.is_in_plasma());
    }

    #[test]
    fn test_creation_timestamp_set() {
        let obj = HeliosObject::from_data(Bytes::new());
        assert!(obj.created_at_ns() > 0);
    }
}
