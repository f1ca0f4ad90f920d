use tracing::{debug, warn};

use super::registry::SubscriptionRegistry;
use crate::core::{ConnectionHealth, Topic, decode_envelope, now_epoch_ms};

/// What happened to one inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        topic: Topic,
        delivered: usize,
        failed: usize,
    },
    /// Decoded fine but nobody is subscribed to the topic.
    Unrouted { topic: Topic },
    /// Could not be decoded; the frame is dropped.
    Dropped { reason: String },
}

/// Decodes data frames and hands the resulting samples to the registry's callbacks.
///
/// Routing is exact topic match only. Frames are processed one at a time, in arrival order,
/// inside the connection manager.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    max_frame_bytes: usize,
}

impl MessageRouter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn dispatch(&self, raw: &[u8], registry: &mut SubscriptionRegistry) -> DispatchOutcome {
        self.dispatch_at(raw, now_epoch_ms(), registry)
    }

    /// Same as `dispatch`, with an explicit receive timestamp for payloads that carry none.
    pub fn dispatch_at(
        &self,
        raw: &[u8],
        received_at_ms: i64,
        registry: &mut SubscriptionRegistry,
    ) -> DispatchOutcome {
        if raw.len() > self.max_frame_bytes {
            return DispatchOutcome::Dropped {
                reason: format!("frame too large: {} > {}", raw.len(), self.max_frame_bytes),
            };
        }

        let sample = match decode_envelope(raw, received_at_ms) {
            Ok(sample) => sample,
            Err(err) => {
                return DispatchOutcome::Dropped {
                    reason: err.to_string(),
                };
            }
        };

        match registry.deliver(&sample) {
            Some(delivery) => DispatchOutcome::Delivered {
                topic: sample.topic().clone(),
                delivered: delivery.delivered,
                failed: delivery.failed,
            },
            None => DispatchOutcome::Unrouted {
                topic: sample.topic().clone(),
            },
        }
    }
}

/// Log and count a dispatch outcome.
pub(crate) fn record_outcome(outcome: &DispatchOutcome, health: &mut ConnectionHealth) {
    match outcome {
        DispatchOutcome::Delivered { failed, .. } => health.record_delivery(*failed),
        DispatchOutcome::Unrouted { topic } => {
            health.record_unrouted();
            debug!(%topic, "frame for topic without subscribers");
        }
        DispatchOutcome::Dropped { reason } => {
            health.record_decode_failure(reason);
            warn!(reason = %reason, "dropping malformed frame");
        }
    }
}
