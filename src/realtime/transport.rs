//! Publish/subscribe seam between the subscription manager and the wire.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::api::Result;

/// One event received on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
  pub channel: String,
  pub event: String,
  pub payload: Value,
}

/// Events of one open channel. `Err` items are channel faults; the stream
/// keeps going after them. Dropping the stream closes the channel.
pub type EventStream = BoxStream<'static, Result<ChannelEvent>>;

/// A realtime backend able to open private channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
  /// Open `channel` and return its event stream.
  async fn subscribe(&self, channel: &str) -> Result<EventStream>;
}
