/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the subscription registry, the topic matcher, and the acknowledgement
registry used to correlate QoS 1 operations with user completion callbacks.
 */

use crate::client::IotClient;
use crate::config::QualityOfService;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback function type for messages delivered to a subscription.
pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback function type for messages delivered to a subscription that also wants the
/// client handle and the concrete topic the message arrived on.
pub type ExtendedMessageCallback = Arc<dyn Fn(IotClient, String, Vec<u8>) + Send + Sync>;

/// Dispatch target registered with a subscription.
#[derive(Clone)]
pub enum SubscriptionCallback {

    /// Receives the message payload only.
    Simple(MessageCallback),

    /// Receives the client handle, the matched topic, and the message payload.
    Extended(ExtendedMessageCallback),
}

impl fmt::Debug for SubscriptionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionCallback::Simple(_) => { write!(f, "SubscriptionCallback::Simple(...)") }
            SubscriptionCallback::Extended(_) => { write!(f, "SubscriptionCallback::Extended(...)") }
        }
    }
}

/// Completion callback bound to a QoS 1 packet identifier.  Invoked at most once, on the
/// work pool, when the matching acknowledgement arrives.
pub type AckCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct SubscriptionEntry {
    pub(crate) qos: QualityOfService,
    pub(crate) callback: SubscriptionCallback,
}

/// Mapping from topic filter to subscription entry.  One entry per filter; re-subscribing to
/// a filter replaces the previous entry.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>
}

impl SubscriptionRegistry {

    pub(crate) fn new() -> Self {
        SubscriptionRegistry {
            entries: HashMap::new()
        }
    }

    pub(crate) fn insert(&mut self, topic_filter: &str, qos: QualityOfService, callback: SubscriptionCallback) {
        self.entries.insert(topic_filter.to_string(), SubscriptionEntry {
            qos,
            callback
        });
    }

    pub(crate) fn remove(&mut self, topic_filter: &str) -> bool {
        self.entries.remove(topic_filter).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Snapshot of all registered (filter, qos) pairs, used for automatic resubscription.
    pub(crate) fn subscription_snapshot(&self) -> Vec<(String, QualityOfService)> {
        self.entries.iter()
            .map(|(filter, entry)| { (filter.clone(), entry.qos) })
            .collect()
    }

    /// Callbacks of every registered filter that accepts the given topic.
    pub(crate) fn callbacks_matching(&self, topic: &str) -> Vec<SubscriptionCallback> {
        self.entries.iter()
            .filter(|(filter, _)| { filter_accepts(filter, topic) })
            .map(|(_, entry)| { entry.callback.clone() })
            .collect()
    }
}

/// Positional topic filter match.
///
/// Not strict MQTT 3.1.1 filter semantics, and deliberately so:
///   * a filter segment containing `+` or `#` anywhere in the segment matches any topic
///     segment at that position
///   * comparison walks the filter's segments only; a topic with surplus trailing segments
///     still matches (prefix behavior)
///   * a topic shorter than the filter never matches
pub(crate) fn filter_accepts(topic_filter: &str, topic: &str) -> bool {
    let topic_segments: Vec<&str> = topic.split('/').collect();

    for (index, filter_segment) in topic_filter.split('/').enumerate() {
        if index >= topic_segments.len() {
            return false;
        }

        if filter_segment.contains('#') || filter_segment.contains('+') {
            continue;
        }

        if filter_segment != topic_segments[index] {
            return false;
        }
    }

    true
}

/// Mapping from in-flight QoS 1 packet identifier to completion callback.  Entries are
/// removed on first delivery and the registry is purged fully on hard disconnect.
#[derive(Default)]
pub(crate) struct AckRegistry {
    pending: HashMap<u16, AckCallback>
}

impl AckRegistry {

    pub(crate) fn new() -> Self {
        AckRegistry {
            pending: HashMap::new()
        }
    }

    pub(crate) fn bind(&mut self, packet_id: u16, callback: AckCallback) {
        self.pending.insert(packet_id, callback);
    }

    pub(crate) fn take(&mut self, packet_id: u16) -> Option<AckCallback> {
        self.pending.remove(&packet_id)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    fn noop_callback() -> SubscriptionCallback {
        SubscriptionCallback::Simple(Arc::new(|_| {}))
    }

    #[test]
    fn filter_accepts_exact_match() {
        assert!(filter_accepts("a/b", "a/b"));
        assert!(!filter_accepts("a/b", "a/c"));
        assert!(!filter_accepts("a/b", "c/b"));
    }

    #[test]
    fn filter_accepts_plus_wildcard() {
        assert!(filter_accepts("sensors/+/temp", "sensors/room1/temp"));
        assert!(filter_accepts("sensors/+/temp", "sensors/room2/temp"));
        assert!(!filter_accepts("sensors/+/temp", "sensors/room1"));
        assert!(!filter_accepts("sensors/+/temp", "sensors/room1/humidity"));
    }

    #[test]
    fn filter_accepts_surplus_topic_segments() {
        // prefix behavior: segments past the filter's length are not examined
        assert!(filter_accepts("sensors/+/temp", "sensors/room1/temp/x"));
        assert!(filter_accepts("a/b", "a/b/c/d"));
    }

    #[test]
    fn filter_accepts_hash_wildcard() {
        assert!(filter_accepts("#", "anything"));
        assert!(filter_accepts("#", "any/thing/at/all"));
        assert!(filter_accepts("sensors/#", "sensors/temp"));
        assert!(filter_accepts("sensors/#", "sensors/temp/room1"));
        assert!(!filter_accepts("sensors/#", "other"));
    }

    #[test]
    fn filter_accepts_wildcard_anywhere_in_segment() {
        // a segment merely containing a wildcard character is treated as a wildcard
        assert!(filter_accepts("sensor+/temp", "sensorA/temp"));
        assert!(filter_accepts("a/b#c", "a/anything"));
    }

    #[test]
    fn filter_accepts_topic_shorter_than_filter_fails() {
        assert!(!filter_accepts("a/b/c", "a/b"));
        assert!(!filter_accepts("+/+", "a"));
    }

    #[test]
    fn filter_accepts_empty_segments() {
        assert!(filter_accepts("a//b", "a//b"));
        assert!(filter_accepts("a/+/b", "a//b"));
    }

    #[test]
    fn registry_resubscribe_replaces_entry() {
        let mut registry = SubscriptionRegistry::new();

        registry.insert("a/b", QualityOfService::AtMostOnce, noop_callback());
        registry.insert("a/b", QualityOfService::AtLeastOnce, noop_callback());

        let snapshot = registry.subscription_snapshot();
        assert_eq!(vec![("a/b".to_string(), QualityOfService::AtLeastOnce)], snapshot);
    }

    #[test]
    fn registry_subscribe_then_unsubscribe_leaves_no_entry() {
        let mut registry = SubscriptionRegistry::new();

        registry.insert("a/b", QualityOfService::AtLeastOnce, noop_callback());
        assert!(registry.remove("a/b"));
        assert!(registry.subscription_snapshot().is_empty());
        assert!(!registry.remove("a/b"));
    }

    #[test]
    fn registry_matching_selects_all_accepting_filters() {
        let mut registry = SubscriptionRegistry::new();

        registry.insert("sensors/+/temp", QualityOfService::AtMostOnce, noop_callback());
        registry.insert("sensors/#", QualityOfService::AtMostOnce, noop_callback());
        registry.insert("other/topic", QualityOfService::AtMostOnce, noop_callback());

        assert_eq!(2, registry.callbacks_matching("sensors/room1/temp").len());
        assert_eq!(1, registry.callbacks_matching("sensors/room1").len());
        assert_eq!(0, registry.callbacks_matching("elsewhere").len());
    }

    #[test]
    fn ack_registry_delivers_at_most_once() {
        let mut registry = AckRegistry::new();
        let delivered = Arc::new(Mutex::new(0u32));

        let counter = delivered.clone();
        registry.bind(42, Box::new(move || { *counter.lock().unwrap() += 1; }));

        let callback = registry.take(42).unwrap();
        callback();
        assert!(registry.take(42).is_none());
        assert_eq!(1, *delivered.lock().unwrap());
    }

    #[test]
    fn ack_registry_purge_discards_pending_callbacks() {
        let mut registry = AckRegistry::new();
        registry.bind(1, Box::new(|| {}));
        registry.bind(2, Box::new(|| {}));

        registry.clear();
        assert!(registry.take(1).is_none());
        assert!(registry.take(2).is_none());
    }
}
