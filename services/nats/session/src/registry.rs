//! Subscription registry shared by the client handle and the session loop.
//!
//! Sids come from one process-wide counter, so they are unique across every
//! connection in the process and strictly increasing.

use bytes::Bytes;
use dashmap::DashMap;
use nats_wire::subject::validate_queue_group;
use nats_wire::{HeaderMap, SubjectFilter, WireError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_SID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next subscription id
pub fn next_sid() -> u64 {
    NEXT_SID.fetch_add(1, Ordering::Relaxed)
}

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Subject the message was published on
    pub subject: String,
    /// Subscription it was delivered to
    pub sid: u64,
    /// Reply subject, if any
    pub reply_to: Option<String>,
    /// Parsed headers for HMSG deliveries
    pub headers: Option<HeaderMap>,
    /// Message body
    pub payload: Bytes,
}

/// Receives messages for one subscription
///
/// Handlers run synchronously inside the dispatch pass and must not block.
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message
    fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// A live subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Client-assigned subscription id
    pub sid: u64,
    /// Subject filter sent in SUB
    pub filter: SubjectFilter,
    /// Queue group, if this is a queue subscription
    pub queue_group: Option<String>,
}

struct Entry {
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    max_msgs: Option<u64>,
    delivered: u64,
}

/// Outcome of [`SubscriptionRegistry::deliver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the subscription handler
    Delivered,
    /// Handed to the handler, which then reached its message limit and was removed
    Completed(Subscription),
    /// No subscription with that sid
    NotFound,
}

/// Registry of subscriptions for one connection
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<DashMap<u64, Entry>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the filter and register a handler under a fresh sid
    pub fn register(
        &self,
        filter: &str,
        queue_group: Option<&str>,
        handler: impl MessageHandler + 'static,
    ) -> Result<Subscription, WireError> {
        let filter = SubjectFilter::parse(filter)?;
        if let Some(queue) = queue_group {
            validate_queue_group(queue)?;
        }

        let subscription = Subscription {
            sid: next_sid(),
            filter,
            queue_group: queue_group.map(str::to_string),
        };
        self.entries.insert(
            subscription.sid,
            Entry {
                subscription: subscription.clone(),
                handler: Arc::new(handler),
                max_msgs: None,
                delivered: 0,
            },
        );
        debug!(
            "Registered subscription {} on {}",
            subscription.sid, subscription.filter
        );
        Ok(subscription)
    }

    /// Remove a subscription
    pub fn unregister(&self, sid: u64) -> Option<Subscription> {
        self.entries.remove(&sid).map(|(_, e)| e.subscription)
    }

    /// Remove the subscription after `max_msgs` total deliveries
    ///
    /// Zero means unlimited. If the limit is already reached the
    /// subscription is removed immediately. Returns false for an unknown sid.
    pub fn set_max_msgs(&self, sid: u64, max_msgs: u64) -> bool {
        let reached = match self.entries.get_mut(&sid) {
            Some(mut entry) => {
                entry.max_msgs = (max_msgs > 0).then_some(max_msgs);
                max_msgs > 0 && entry.delivered >= max_msgs
            }
            None => return false,
        };
        if reached {
            self.entries.remove(&sid);
        }
        true
    }

    /// Handler registered under `sid`
    pub fn lookup(&self, sid: u64) -> Option<Arc<dyn MessageHandler>> {
        self.entries.get(&sid).map(|e| Arc::clone(&e.handler))
    }

    /// Subscription registered under `sid`
    pub fn get(&self, sid: u64) -> Option<Subscription> {
        self.entries.get(&sid).map(|e| e.subscription.clone())
    }

    /// Number of messages delivered to `sid` so far
    pub fn delivered(&self, sid: u64) -> Option<u64> {
        self.entries.get(&sid).map(|e| e.delivered)
    }

    /// Deliver `message` to the handler registered under its sid
    ///
    /// The handler runs after the registry lock is released, so it may call
    /// back into the registry.
    pub fn deliver(&self, message: Message) -> Delivery {
        let sid = message.sid;
        let (handler, completed) = match self.entries.get_mut(&sid) {
            Some(mut entry) => {
                entry.delivered += 1;
                let completed = entry.max_msgs.is_some_and(|max| entry.delivered >= max);
                (Arc::clone(&entry.handler), completed)
            }
            None => return Delivery::NotFound,
        };

        let removed = if completed {
            self.entries.remove(&sid).map(|(_, e)| e.subscription)
        } else {
            None
        };

        handler.on_message(message);

        match removed {
            Some(subscription) => Delivery::Completed(subscription),
            None => Delivery::Delivered,
        }
    }

    /// Snapshot of all subscriptions, ordered by sid
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self.entries.iter().map(|e| e.subscription.clone()).collect();
        subs.sort_by_key(|s| s.sid);
        subs
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}
