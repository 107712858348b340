//! Real-time sync module
//!
//! Push-channel subscriptions that keep the cache in step with the remote store.

mod subscription;

pub use subscription::{
    ChannelPhase, Listener, Subscription, SubscriptionEvent, SubscriptionHandle, SyncSubscriptions,
};
