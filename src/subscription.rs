//! Exact-topic subscription index.
//!
//! Maps topic strings to the sessions subscribed to them, so a PUBLISH
//! fans out with a single lookup. Topics are compared byte-for-byte;
//! `+` and `#` are ordinary characters here, not wildcards.

use ahash::AHashMap;
use mio::Token;

/// Topic string to subscriber set.
///
/// Each topic's subscribers keep their subscription order, so two
/// lookups on the same state fan out in the same sequence.
pub struct SubscriptionStore {
    topics: AHashMap<String, Vec<Token>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            topics: AHashMap::new(),
        }
    }

    /// Add a topic -> session edge. Re-subscribing is a no-op.
    pub fn subscribe(&mut self, topic: &str, token: Token) {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        if !subscribers.contains(&token) {
            subscribers.push(token);
        }
    }

    /// Sessions subscribed to exactly `topic`.
    pub fn subscribers(&self, topic: &str) -> &[Token] {
        self.topics.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove one topic -> session edge, pruning the topic when its last
    /// subscriber goes.
    #[allow(dead_code)] // no UNSUBSCRIBE on the wire; exercised by tests
    pub fn unsubscribe(&mut self, topic: &str, token: Token) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|t| *t != token);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Remove every edge involving the session, pruning topics with no
    /// subscribers left. Called when a session is torn down.
    pub fn remove_client(&mut self, token: Token) {
        self.topics.retain(|_, subscribers| {
            subscribers.retain(|t| *t != token);
            !subscribers.is_empty()
        });
    }

    /// Number of topics with at least one subscriber.
    #[allow(dead_code)] // exercised by tests
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
