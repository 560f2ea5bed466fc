// Copyright 2024 The Helios Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Publisher and subscriber bookkeeping for control-plane events.
//!
//! The fan-out machinery (long polling, batching, per-subscriber queues)
//! is an external collaborator; this module owns the fixed channel list,
//! the publish entry point the managers call, and subscriber membership so
//! departed nodes and workers can be pruned.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use helios_common::reactor::Reactor;

/// The fixed set of publish channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubChannel {
    Actor,
    Job,
    NodeInfo,
    WorkerDelta,
    ErrorInfo,
    Log,
    NodeResourceUsage,
}

/// Every channel the publisher is constructed with.
pub const ALL_CHANNELS: [PubChannel; 7] = [
    PubChannel::Actor,
    PubChannel::Job,
    PubChannel::NodeInfo,
    PubChannel::WorkerDelta,
    PubChannel::ErrorInfo,
    PubChannel::Log,
    PubChannel::NodeResourceUsage,
];

#[derive(Debug, Clone)]
pub struct PubMessage {
    pub channel: PubChannel,
    /// Entity the message is about (node id, worker id, ...).
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// How many recent messages are retained for inspection.
const RECENT_MESSAGE_CAP: usize = 1024;

/// Publisher over the fixed channel list. Publishes are accepted on any
/// thread and handed to the publisher reactor for delivery.
pub struct GcsPublisher {
    channels: Vec<PubChannel>,
    reactor: Reactor,
    counts: Mutex<HashMap<PubChannel, u64>>,
    recent: Mutex<VecDeque<PubMessage>>,
}

impl GcsPublisher {
    pub fn new(channels: Vec<PubChannel>, reactor: Reactor) -> Self {
        Self {
            channels,
            reactor,
            counts: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Publish a message. Returns false if the channel was not registered.
    pub fn publish(&self, message: PubMessage) -> bool {
        if !self.channels.contains(&message.channel) {
            tracing::warn!(channel = ?message.channel, "Publish to unregistered channel");
            return false;
        }
        *self.counts.lock().entry(message.channel).or_default() += 1;
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_MESSAGE_CAP {
                recent.pop_front();
            }
            recent.push_back(message.clone());
        }
        // Delivery to subscribers happens off the caller's thread.
        self.reactor.post("GcsPublisher.publish", move || {
            tracing::trace!(channel = ?message.channel, "Delivering pub message");
        });
        true
    }

    pub fn publish_count(&self, channel: PubChannel) -> u64 {
        self.counts.lock().get(&channel).copied().unwrap_or(0)
    }

    /// Recent messages on one channel, oldest first.
    pub fn recent_messages(&self, channel: PubChannel) -> Vec<PubMessage> {
        self.recent
            .lock()
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    pub fn debug_string(&self) -> String {
        let counts = self.counts.lock();
        let mut channels: Vec<_> = counts.iter().collect();
        channels.sort_by_key(|(c, _)| format!("{c:?}"));
        let summary: Vec<String> = channels
            .iter()
            .map(|(c, n)| format!("{c:?}: {n}"))
            .collect();
        format!("GcsPublisher: published {{{}}}", summary.join(", "))
    }
}

/// Subscriber membership, keyed by the subscriber's binary identity
/// (node id or worker id).
pub struct PubSubHandler {
    subscribers: Mutex<HashMap<Vec<u8>, HashSet<PubChannel>>>,
}

impl PubSubHandler {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle_subscribe(&self, subscriber_key: Vec<u8>, channel: PubChannel) {
        self.subscribers
            .lock()
            .entry(subscriber_key)
            .or_default()
            .insert(channel);
    }

    pub fn handle_unsubscribe(&self, subscriber_key: &[u8], channel: PubChannel) {
        let mut subscribers = self.subscribers.lock();
        if let Some(channels) = subscribers.get_mut(subscriber_key) {
            channels.remove(&channel);
            if channels.is_empty() {
                subscribers.remove(subscriber_key);
            }
        }
    }

    /// Drop all subscriptions held by a departed node or worker.
    pub fn remove_subscriber_from(&self, subscriber_key: &[u8]) {
        if self.subscribers.lock().remove(subscriber_key).is_some() {
            tracing::debug!("Removed departed subscriber");
        }
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn debug_string(&self) -> String {
        format!("PubSubHandler: {} subscribers", self.num_subscribers())
    }
}

impl Default for PubSubHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helios_common::reactor::ReactorPool;

    #[test]
    fn test_publish_to_registered_channel() {
        let pool = ReactorPool::new();
        let publisher = GcsPublisher::new(ALL_CHANNELS.to_vec(), pool.by_name("publisher"));

        assert!(publisher.publish(PubMessage {
            channel: PubChannel::NodeInfo,
            key: vec![1],
            payload: b"payload".to_vec(),
        }));
        assert_eq!(publisher.publish_count(PubChannel::NodeInfo), 1);
        assert_eq!(publisher.recent_messages(PubChannel::NodeInfo).len(), 1);
    }

    #[test]
    fn test_publish_to_unregistered_channel_is_rejected() {
        let pool = ReactorPool::new();
        let publisher = GcsPublisher::new(vec![PubChannel::Job], pool.by_name("publisher"));

        assert!(!publisher.publish(PubMessage {
            channel: PubChannel::NodeInfo,
            key: vec![],
            payload: vec![],
        }));
        assert_eq!(publisher.publish_count(PubChannel::NodeInfo), 0);
    }

    #[test]
    fn test_subscriber_removal() {
        let handler = PubSubHandler::new();
        handler.handle_subscribe(b"node-1".to_vec(), PubChannel::NodeInfo);
        handler.handle_subscribe(b"node-1".to_vec(), PubChannel::Job);
        handler.handle_subscribe(b"node-2".to_vec(), PubChannel::NodeInfo);
        assert_eq!(handler.num_subscribers(), 2);

        handler.remove_subscriber_from(b"node-1");
        assert_eq!(handler.num_subscribers(), 1);
    }

    #[test]
    fn test_unsubscribe_last_channel_drops_subscriber() {
        let handler = PubSubHandler::new();
        handler.handle_subscribe(b"w".to_vec(), PubChannel::WorkerDelta);
        handler.handle_unsubscribe(b"w", PubChannel::WorkerDelta);
        assert_eq!(handler.num_subscribers(), 0);
    }
}
