use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::core::{CallbackResult, Sample, Topic};

/// Callback invoked for every sample on a subscribed topic.
pub type SampleCallback = Box<dyn FnMut(&Sample) -> CallbackResult + Send + 'static>;

/// Opaque identifier returned by `subscribe`, used to `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    handle: SubscriptionHandle,
    callback: SampleCallback,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub topic: Topic,
    /// The removed callback was the last one on its topic.
    pub topic_now_empty: bool,
}

/// Outcome of delivering one sample to its topic's callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Active subscriptions, grouped by topic.
///
/// Topics are kept in first-registration order so reconnect replay is deterministic.
/// Entries survive reconnects; only `remove` deletes them.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: Vec<Topic>,
    subscribers: HashMap<Topic, Vec<Subscriber>>,
    index: HashMap<SubscriptionHandle, Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `topic`. Returns `true` when this is the topic's first callback.
    ///
    /// A handle that is already registered is left untouched and the new callback is dropped.
    pub fn insert(
        &mut self,
        handle: SubscriptionHandle,
        topic: Topic,
        callback: SampleCallback,
    ) -> bool {
        if self.index.contains_key(&handle) {
            warn!(%handle, %topic, "duplicate subscription handle ignored");
            return false;
        }

        self.index.insert(handle, topic.clone());
        let subscribers = self.subscribers.entry(topic.clone()).or_default();
        let first = subscribers.is_empty();
        subscribers.push(Subscriber { handle, callback });
        if first {
            self.topics.push(topic);
        }
        first
    }

    /// Remove a subscription. Unknown handles return `None`.
    pub fn remove(&mut self, handle: SubscriptionHandle) -> Option<Removed> {
        let topic = self.index.remove(&handle)?;
        let topic_now_empty = match self.subscribers.get_mut(&topic) {
            Some(subscribers) => {
                subscribers.retain(|sub| sub.handle != handle);
                subscribers.is_empty()
            }
            None => true,
        };
        if topic_now_empty {
            self.subscribers.remove(&topic);
            self.topics.retain(|t| t != &topic);
        }
        Some(Removed {
            topic,
            topic_now_empty,
        })
    }

    /// Distinct topics in first-registration order.
    pub fn topics(&self) -> impl ExactSizeIterator<Item = &Topic> {
        self.topics.iter()
    }

    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, Vec::len)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Total number of subscriptions across all topics.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Invoke every callback registered on the sample's topic, in registration order.
    ///
    /// A callback that returns `Err` or panics is logged and counted; the remaining callbacks
    /// still run. Returns `None` when nobody is subscribed to the topic.
    pub fn deliver(&mut self, sample: &Sample) -> Option<Delivery> {
        let subscribers = self.subscribers.get_mut(sample.topic().as_str())?;
        let mut delivery = Delivery::default();
        for sub in subscribers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(sample))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    delivery.failed += 1;
                    warn!(
                        handle = %sub.handle,
                        topic = %sample.topic(),
                        error = %err,
                        "subscriber callback failed"
                    );
                }
                Err(panic) => {
                    delivery.failed += 1;
                    warn!(
                        handle = %sub.handle,
                        topic = %sample.topic(),
                        panic = panic_message(panic.as_ref()),
                        "subscriber callback panicked"
                    );
                }
            }
        }
        Some(delivery)
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics)
            .field("subscriptions", &self.index.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
