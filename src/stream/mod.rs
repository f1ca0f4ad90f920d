//! Subscription-multiplexed metrics stream: registry, router and the connection manager actor.

pub mod manager;
pub mod registry;
pub mod router;

pub use manager::{
    Connect, ConnectionManager, ConnectionManagerArgs, Disconnect, GetConnectionState,
    GetConnectionStats, StateCallback, Subscribe, Unsubscribe,
};
pub use registry::{Delivery, Removed, SampleCallback, SubscriptionHandle, SubscriptionRegistry};
pub use router::{DispatchOutcome, MessageRouter};
