pub mod handler;
mod pattern;
mod registry;

pub use pattern::glob_match;
pub use registry::{ChannelRegistry, Subscriber};

use crate::storage::StringSet;
use crate::sync::BlockingCounter;

pub type ConnectionId = u64;

/// A connection's view of its own subscriptions.
///
/// Exists iff the connection is subscribed to at least one channel or
/// pattern; its lifetime mirrors the connection's force-dispatch flag.
/// The borrow token counts publishers currently holding a reference to
/// this connection for delivery.
pub struct SubscriptionRecord {
    pub channels: StringSet,
    pub patterns: StringSet,
    pub borrow_token: BlockingCounter,
}

impl SubscriptionRecord {
    pub fn new() -> Self {
        Self {
            channels: StringSet::new(),
            patterns: StringSet::new(),
            borrow_token: BlockingCounter::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

impl Default for SubscriptionRecord {
    fn default() -> Self {
        Self::new()
    }
}
