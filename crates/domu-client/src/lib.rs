//! Client half of the realtime channel: a reconnecting socket, the
//! notification poller that backs it up, and the store both feed into.

pub mod channel;
pub mod feed;
pub mod poller;
pub mod store;

pub use channel::{ChannelConfig, ChannelError, ChannelState, Identity, RealtimeChannel};
pub use feed::NotificationFeed;
pub use poller::{NotificationPoller, PollError, PollerConfig};
pub use store::NotificationStore;
