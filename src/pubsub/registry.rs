use super::{glob_match, ConnectionId};
use crate::network::ConnShared;
use crate::sync::BlockingCounter;
use ahash::RandomState;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Weak;

/// What a shard remembers about one subscriber of a channel/pattern:
/// a weak identity (never ownership), the connection's borrow token,
/// and the session thread that owns its dispatch queue.
struct SubEntry {
    queue: Weak<ConnShared>,
    borrow: BlockingCounter,
    thread_id: u32,
}

/// A subscriber snapshot handed to a publisher. The borrow token has
/// already been incremented; the publisher must release it if the
/// delivery cannot be handed off.
pub struct Subscriber {
    pub conn_id: ConnectionId,
    pub queue: Weak<ConnShared>,
    pub borrow: BlockingCounter,
    pub thread_id: u32,
    /// Set when this subscriber matched via a glob pattern.
    pub pattern: Option<Bytes>,
}

/// Per-shard pub/sub registry. A channel lives on exactly one shard
/// (its hash home); patterns are replicated to every shard. Only the
/// owning shard's thread ever touches the maps.
pub struct ChannelRegistry {
    channels: HashMap<Vec<u8>, HashMap<ConnectionId, SubEntry>, RandomState>,
    patterns: HashMap<Vec<u8>, HashMap<ConnectionId, SubEntry>, RandomState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::with_hasher(RandomState::new()),
            patterns: HashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn add_subscription(
        &mut self,
        channel: &[u8],
        conn_id: ConnectionId,
        queue: Weak<ConnShared>,
        borrow: BlockingCounter,
        thread_id: u32,
    ) {
        self.channels.entry(channel.to_vec()).or_default().insert(
            conn_id,
            SubEntry {
                queue,
                borrow,
                thread_id,
            },
        );
    }

    pub fn remove_subscription(&mut self, channel: &[u8], conn_id: ConnectionId) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    pub fn add_glob_pattern(
        &mut self,
        pattern: &[u8],
        conn_id: ConnectionId,
        queue: Weak<ConnShared>,
        borrow: BlockingCounter,
        thread_id: u32,
    ) {
        self.patterns.entry(pattern.to_vec()).or_default().insert(
            conn_id,
            SubEntry {
                queue,
                borrow,
                thread_id,
            },
        );
    }

    pub fn remove_glob_pattern(&mut self, pattern: &[u8], conn_id: ConnectionId) {
        if let Some(subs) = self.patterns.get_mut(pattern) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                self.patterns.remove(pattern);
            }
        }
    }

    /// Collect every subscriber a publish to `channel` must reach:
    /// exact-match subscribers plus all matching pattern subscribers.
    /// Each returned entry has taken one reference on its connection's
    /// borrow token.
    pub fn fetch_subscribers(&self, channel: &[u8]) -> Vec<Subscriber> {
        let mut out = Vec::new();

        if let Some(subs) = self.channels.get(channel) {
            out.reserve(subs.len());
            Self::copy_subscribers(subs, None, &mut out);
        }

        for (pattern, subs) in &self.patterns {
            if glob_match(pattern, channel) {
                Self::copy_subscribers(subs, Some(Bytes::copy_from_slice(pattern)), &mut out);
            }
        }

        out
    }

    /// Exact-match subscriber count for one channel.
    pub fn channel_subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Channels with at least one subscriber on this shard.
    pub fn channels(&self) -> Vec<Vec<u8>> {
        self.channels.keys().cloned().collect()
    }

    /// Distinct patterns registered on this shard. Patterns are
    /// replicated, so any shard answers for the whole server.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    fn copy_subscribers(
        src: &HashMap<ConnectionId, SubEntry>,
        pattern: Option<Bytes>,
        dest: &mut Vec<Subscriber>,
    ) {
        for (&conn_id, entry) in src {
            entry.borrow.inc();
            dest.push(Subscriber {
                conn_id,
                queue: entry.queue.clone(),
                borrow: entry.borrow.clone(),
                thread_id: entry.thread_id,
                pattern: pattern.clone(),
            });
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_conn(registry: &mut ChannelRegistry, channel: &[u8], conn_id: u64) -> BlockingCounter {
        let borrow = BlockingCounter::new(0);
        registry.add_subscription(channel, conn_id, Weak::new(), borrow.clone(), conn_id as u32);
        borrow
    }

    #[test]
    fn fetch_increments_borrow_tokens() {
        let mut registry = ChannelRegistry::new();
        let b1 = add_conn(&mut registry, b"c1", 1);
        let b2 = add_conn(&mut registry, b"c1", 2);
        add_conn(&mut registry, b"other", 3);

        let subs = registry.fetch_subscribers(b"c1");
        assert_eq!(subs.len(), 2);
        assert_eq!(b1.get(), 1);
        assert_eq!(b2.get(), 1);
        for sub in &subs {
            assert!(sub.pattern.is_none());
        }
        // the publisher hands each token back once delivery settles
        for sub in subs {
            sub.borrow.dec();
        }
        assert_eq!(b1.get(), 0);
    }

    #[test]
    fn pattern_matches_carry_the_pattern() {
        let mut registry = ChannelRegistry::new();
        let borrow = BlockingCounter::new(0);
        registry.add_glob_pattern(b"news.*", 7, Weak::new(), borrow.clone(), 7);

        let subs = registry.fetch_subscribers(b"news.sports");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].conn_id, 7);
        assert_eq!(subs[0].pattern.as_deref(), Some(&b"news.*"[..]));
        assert_eq!(borrow.get(), 1);

        assert!(registry.fetch_subscribers(b"weather").is_empty());
    }

    #[test]
    fn exact_and_pattern_subscribers_combine() {
        let mut registry = ChannelRegistry::new();
        add_conn(&mut registry, b"news.sports", 1);
        registry.add_glob_pattern(b"news.*", 2, Weak::new(), BlockingCounter::new(0), 2);

        let subs = registry.fetch_subscribers(b"news.sports");
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn removal_drops_empty_entries() {
        let mut registry = ChannelRegistry::new();
        add_conn(&mut registry, b"c1", 1);
        assert_eq!(registry.channel_subscriber_count(b"c1"), 1);

        registry.remove_subscription(b"c1", 1);
        assert_eq!(registry.channel_subscriber_count(b"c1"), 0);
        assert!(registry.channels().is_empty());

        registry.add_glob_pattern(b"p*", 1, Weak::new(), BlockingCounter::new(0), 1);
        assert_eq!(registry.pattern_count(), 1);
        registry.remove_glob_pattern(b"p*", 1);
        assert_eq!(registry.pattern_count(), 0);
    }
}
