//! Live notification delivery.
//!
//! [`SubscriptionManager`] owns the per-user channel lifecycle; the wire is
//! behind [`RealtimeTransport`], with [`PusherTransport`] for
//! Pusher-compatible broadcasters.

mod manager;
mod pusher;
mod transport;

pub use manager::SubscriptionManager;
pub use pusher::PusherTransport;
pub use transport::RealtimeTransport;

#[cfg(test)]
pub(crate) use transport::local;
