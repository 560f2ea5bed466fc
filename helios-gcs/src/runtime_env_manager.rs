// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Runtime-environment URI reference counting.
//!
//! The environment plugins themselves are external; the core only tracks
//! which owner (job or detached actor) references which URIs, and invokes
//! the injected deleter when the last reference drops.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Deletes one URI; reports success through the callback.
pub type UriDeleter = Box<dyn Fn(String, Box<dyn FnOnce(bool) + Send>) + Send + Sync>;

pub struct RuntimeEnvManager {
    deleter: UriDeleter,
    /// owner key (job hex or actor hex) -> URIs it references.
    uris_by_owner: Mutex<HashMap<String, Vec<String>>>,
    /// URI -> reference count.
    uri_references: Mutex<HashMap<String, usize>>,
}

impl RuntimeEnvManager {
    pub fn new(deleter: UriDeleter) -> Self {
        Self {
            deleter,
            uris_by_owner: Mutex::new(HashMap::new()),
            uri_references: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `owner` references `uris`.
    pub fn add_uri_reference(&self, owner: &str, uris: Vec<String>) {
        let mut by_owner = self.uris_by_owner.lock();
        let mut references = self.uri_references.lock();
        for uri in &uris {
            *references.entry(uri.clone()).or_insert(0) += 1;
        }
        by_owner.entry(owner.to_string()).or_default().extend(uris);
    }

    /// Drop every reference held by `owner`, deleting URIs that reach zero.
    pub fn remove_uri_reference(&self, owner: &str) {
        let uris = match self.uris_by_owner.lock().remove(owner) {
            Some(uris) => uris,
            None => return,
        };
        let mut doomed = Vec::new();
        {
            let mut references = self.uri_references.lock();
            for uri in uris {
                if let Some(count) = references.get_mut(&uri) {
                    *count -= 1;
                    if *count == 0 {
                        references.remove(&uri);
                        doomed.push(uri);
                    }
                }
            }
        }
        for uri in doomed {
            tracing::debug!(%uri, "Deleting unreferenced runtime env URI");
            (self.deleter)(
                uri.clone(),
                Box::new(move |successful| {
                    if !successful {
                        tracing::warn!(%uri, "Failed to delete runtime env URI");
                    }
                }),
            );
        }
    }

    pub fn num_referenced_uris(&self) -> usize {
        self.uri_references.lock().len()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "RuntimeEnvManager: {} uris, {} owners",
            self.num_referenced_uris(),
            self.uris_by_owner.lock().len()
        )
    }
}
