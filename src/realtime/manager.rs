//! Per-user realtime subscription lifecycle.

use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::types::Notification;
use crate::api::{Error, Result};
use crate::cache::{CacheContainer, Generation};
use crate::config::RealtimeConfig;

use super::transport::{EventStream, RealtimeTransport};

struct Subscription {
  channel: String,
  /// Cache generation the pump writes under
  generation: Generation,
  pump: JoinHandle<()>,
}

impl Subscription {
  fn close(self, user_id: u64) {
    info!(user_id, channel = %self.channel, "closing realtime channel");
    self.pump.abort();
  }
}

#[derive(Default)]
struct Registry {
  subscriptions: HashMap<u64, Subscription>,
  /// User whose channel is being opened
  opening: Option<u64>,
  /// Bumped on every start and stop. A channel that finishes opening under
  /// an older epoch was superseded and is dropped.
  epoch: u64,
}

impl Registry {
  fn close_all(&mut self) {
    for (user_id, subscription) in self.subscriptions.drain() {
      subscription.close(user_id);
    }
    self.opening = None;
    self.epoch += 1;
  }
}

/// Keeps at most one live notification channel, bound to one user id.
///
/// The registry is owned here, keyed by user id, so teardown never has to
/// inspect the transport. Inbound notifications are prepended to the
/// notification cache with duplicate ids dropped, and only while the cache
/// has not been cleared since the channel opened.
pub struct SubscriptionManager {
  transport: Arc<dyn RealtimeTransport>,
  config: RealtimeConfig,
  notifications: CacheContainer<Notification>,
  registry: Mutex<Registry>,
}

impl SubscriptionManager {
  pub fn new(
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    notifications: CacheContainer<Notification>,
  ) -> Self {
    Self {
      transport,
      config,
      notifications,
      registry: Mutex::new(Registry::default()),
    }
  }

  /// Subscribe to the channel of `user_id`.
  ///
  /// A no-op when that exact user is already the only subscription, or its
  /// channel is still opening. Any other registered subscription is closed
  /// before the new one opens. The registry is not locked while the
  /// transport connects, so `stop_listening` never waits on a handshake.
  pub async fn start_listening(&self, user_id: u64) -> Result<()> {
    let epoch = {
      let mut registry = self.registry.lock().await;

      let current = registry.subscriptions.len() == 1
        && registry
          .subscriptions
          .get(&user_id)
          .is_some_and(|s| s.generation == self.notifications.generation());
      if current || registry.opening == Some(user_id) {
        debug!(user_id, "already listening");
        return Ok(());
      }

      registry.close_all();
      registry.opening = Some(user_id);
      registry.epoch
    };

    let channel = self.config.channel_for(user_id);
    let opened = self.transport.subscribe(&channel).await;

    let mut registry = self.registry.lock().await;
    if registry.epoch != epoch {
      debug!(user_id, channel = %channel, "channel superseded while opening");
      return Ok(());
    }
    registry.opening = None;

    let stream = opened.map_err(|e| {
      warn!(user_id, channel = %channel, error = %e, "failed to open realtime channel");
      e
    })?;
    info!(user_id, channel = %channel, "listening for notifications");

    let generation = self.notifications.generation();
    let pump = tokio::spawn(pump(
      stream,
      self.config.event.clone(),
      self.notifications.clone(),
      generation,
    ));
    registry.subscriptions.insert(
      user_id,
      Subscription {
        channel,
        generation,
        pump,
      },
    );
    Ok(())
  }

  /// Close the open channel, if any. Safe to call when idle.
  pub async fn stop_listening(&self) {
    self.registry.lock().await.close_all();
  }

  /// User id the manager is subscribed for.
  pub async fn active_user(&self) -> Option<u64> {
    self.registry.lock().await.subscriptions.keys().next().copied()
  }

  pub async fn is_listening(&self) -> bool {
    !self.registry.lock().await.subscriptions.is_empty()
  }
}

impl Drop for SubscriptionManager {
  fn drop(&mut self) {
    for subscription in self.registry.get_mut().subscriptions.values() {
      subscription.pump.abort();
    }
  }
}

/// Forward notification events from `stream` into the cache until the
/// channel closes. Faults are logged and skipped. Writes are made under
/// `generation`, so once the cache is cleared this channel no longer feeds
/// it.
async fn pump(
  mut stream: EventStream,
  event: String,
  notifications: CacheContainer<Notification>,
  generation: Generation,
) {
  while let Some(item) = stream.next().await {
    let received = match item {
      Ok(received) => received,
      Err(e) => {
        warn!(error = %e, "realtime channel error");
        continue;
      }
    };

    if !is_event(&received.event, &event) {
      debug!(channel = %received.channel, event = %received.event, "ignoring event");
      continue;
    }

    let notification = match decode_notification(received.payload) {
      Ok(notification) => notification,
      Err(e) => {
        warn!(channel = %received.channel, error = %e, "undecodable notification");
        continue;
      }
    };

    let id = notification.id.clone();
    if notifications.prepend_unique(generation, notification) {
      debug!(id = %id, "notification received");
    } else {
      debug!(id = %id, "notification dropped");
    }
  }
  debug!("realtime channel closed");
}

/// Broadcasters may send the bare event name, a leading-dot alias or the
/// fully qualified class name.
fn is_event(received: &str, expected: &str) -> bool {
  let expected = expected.trim_start_matches('.');
  let received = received.trim_start_matches('.');
  received == expected || received.rsplit('\\').next() == Some(expected)
}

/// The record is either the payload itself or nested under `notification`.
fn decode_notification(payload: Value) -> Result<Notification> {
  let record = match payload {
    Value::Object(mut map) if map.contains_key("notification") => {
      map.remove("notification").unwrap_or(Value::Null)
    }
    other => other,
  };
  serde_json::from_value(record).map_err(|e| Error::ChannelError(format!("bad notification payload: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::FreshnessPolicy;
  use crate::realtime::transport::local::LocalTransport;
  use serde_json::json;
  use std::time::Duration;

  const EVENT: &str = "NotificationCreated";

  fn setup() -> (Arc<LocalTransport>, SubscriptionManager, CacheContainer<Notification>) {
    let transport = Arc::new(LocalTransport::default());
    let cache = CacheContainer::new("notifications", FreshnessPolicy::NoExpiry).with_capacity(10);
    let manager = SubscriptionManager::new(
      Arc::clone(&transport) as Arc<dyn RealtimeTransport>,
      RealtimeConfig::default(),
      cache.clone(),
    );
    (transport, manager, cache)
  }

  fn notification(id: &str) -> Value {
    json!({ "id": id, "message": format!("message {}", id), "role": "user", "read": false })
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  #[tokio::test]
  async fn test_start_listening_twice_opens_once() {
    let (transport, manager, _) = setup();

    manager.start_listening(7).await.unwrap();
    manager.start_listening(7).await.unwrap();

    assert_eq!(transport.opened(), vec!["private-notifications.7".to_string()]);
    assert!(transport.is_open("private-notifications.7"));
    assert_eq!(manager.active_user().await, Some(7));
  }

  #[tokio::test]
  async fn test_duplicate_event_is_dropped() {
    let (transport, manager, cache) = setup();
    manager.start_listening(7).await.unwrap();
    let channel = "private-notifications.7";

    assert!(transport.publish(channel, EVENT, notification("N-42")));
    assert!(transport.publish(channel, EVENT, notification("N-42")));
    settle().await;

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.items()[0].id, "N-42");
  }

  #[tokio::test]
  async fn test_newest_first_and_bounded() {
    let (transport, manager, cache) = setup();
    manager.start_listening(1).await.unwrap();

    for n in 1..=12 {
      transport.publish("private-notifications.1", EVENT, json!({ "id": n, "message": "hi" }));
    }
    settle().await;

    let ids: Vec<String> = cache.items().into_iter().map(|n| n.id).collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(ids.first().map(String::as_str), Some("12"));
    assert_eq!(ids.last().map(String::as_str), Some("3"));
  }

  #[tokio::test]
  async fn test_switching_user_closes_previous_channel() {
    let (transport, manager, cache) = setup();

    manager.start_listening(1).await.unwrap();
    manager.start_listening(2).await.unwrap();
    settle().await;

    assert!(!transport.is_open("private-notifications.1"));
    assert!(transport.is_open("private-notifications.2"));
    assert_eq!(manager.active_user().await, Some(2));

    assert!(!transport.publish("private-notifications.1", EVENT, notification("stale")));
    transport.publish("private-notifications.2", EVENT, notification("fresh"));
    settle().await;
    assert_eq!(cache.items().len(), 1);
    assert_eq!(cache.items()[0].id, "fresh");
  }

  #[tokio::test]
  async fn test_channel_errors_do_not_tear_down() {
    let (transport, manager, cache) = setup();
    manager.start_listening(3).await.unwrap();
    let channel = "private-notifications.3";

    transport.fail(channel, "socket hiccup");
    transport.publish(channel, EVENT, json!({ "unexpected": true }));
    transport.publish(channel, "SomethingElse", notification("ignored"));
    transport.publish(
      channel,
      "App\\Events\\NotificationCreated",
      json!({ "notification": notification("wrapped") }),
    );
    settle().await;

    assert!(manager.is_listening().await);
    assert!(transport.is_open(channel));
    assert_eq!(cache.items().len(), 1);
    assert_eq!(cache.items()[0].id, "wrapped");
  }

  #[tokio::test]
  async fn test_stop_listening_is_idempotent() {
    let (transport, manager, _) = setup();

    manager.stop_listening().await;
    manager.start_listening(5).await.unwrap();
    manager.stop_listening().await;
    manager.stop_listening().await;
    settle().await;

    assert!(!manager.is_listening().await);
    assert_eq!(manager.active_user().await, None);
    assert!(!transport.is_open("private-notifications.5"));

    // Listening again after a stop opens a fresh channel
    manager.start_listening(5).await.unwrap();
    assert_eq!(transport.opened().len(), 2);
  }

  #[tokio::test]
  async fn test_events_after_clear_never_reach_next_user() {
    let (transport, manager, cache) = setup();
    manager.start_listening(1).await.unwrap();

    cache.clear();
    transport.publish("private-notifications.1", EVENT, notification("A-secret"));
    settle().await;
    assert!(cache.is_empty());

    manager.start_listening(2).await.unwrap();
    settle().await;
    assert!(cache.is_empty());

    transport.publish("private-notifications.2", EVENT, notification("B-own"));
    settle().await;
    let ids: Vec<String> = cache.items().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec!["B-own".to_string()]);
  }

  #[tokio::test]
  async fn test_same_user_reopens_after_clear() {
    let (transport, manager, cache) = setup();
    manager.start_listening(4).await.unwrap();
    cache.clear();

    manager.start_listening(4).await.unwrap();
    assert_eq!(transport.opened().len(), 2);

    transport.publish("private-notifications.4", EVENT, notification("N-1"));
    settle().await;
    assert_eq!(cache.len(), 1);
  }

  /// Holds every subscribe until released.
  struct SlowTransport {
    inner: Arc<LocalTransport>,
    release: Arc<tokio::sync::Notify>,
  }

  #[async_trait::async_trait]
  impl RealtimeTransport for SlowTransport {
    async fn subscribe(&self, channel: &str) -> Result<EventStream> {
      self.release.notified().await;
      self.inner.subscribe(channel).await
    }
  }

  #[tokio::test]
  async fn test_stop_does_not_wait_for_handshake() {
    let inner = Arc::new(LocalTransport::default());
    let release = Arc::new(tokio::sync::Notify::new());
    let transport = SlowTransport {
      inner: Arc::clone(&inner),
      release: Arc::clone(&release),
    };
    let cache = CacheContainer::new("notifications", FreshnessPolicy::NoExpiry).with_capacity(10);
    let manager = Arc::new(SubscriptionManager::new(
      Arc::new(transport),
      RealtimeConfig::default(),
      cache,
    ));

    let opening = {
      let manager = Arc::clone(&manager);
      tokio::spawn(async move { manager.start_listening(6).await })
    };
    settle().await;

    tokio::time::timeout(Duration::from_millis(100), manager.stop_listening())
      .await
      .expect("stop_listening blocked on the handshake");

    release.notify_one();
    opening.await.unwrap().unwrap();
    settle().await;

    // The late channel is dropped instead of registered
    assert!(!manager.is_listening().await);
    assert!(!inner.is_open("private-notifications.6"));
  }

  #[test]
  fn test_event_name_matching() {
    assert!(is_event("NotificationCreated", "NotificationCreated"));
    assert!(is_event(".NotificationCreated", "NotificationCreated"));
    assert!(is_event("App\\Events\\NotificationCreated", ".NotificationCreated"));
    assert!(!is_event("TicketCreated", "NotificationCreated"));
  }
}
