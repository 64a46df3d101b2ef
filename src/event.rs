//! Process-wide invalidation bus.
//!
//! Lets one part of the application tell a cache container to refresh
//! without holding a reference to it. Triggers are debounced per event:
//! repeated calls inside the window collapse into a single dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Buffer for the broadcast channel. Slow listeners skip what they missed.
const BUFFER_SIZE: usize = 64;

/// Named invalidation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invalidation {
  /// Tickets owned by the current identity changed
  UserTickets,
  /// The staff-wide ticket list changed
  AllTickets,
  /// Tickets assigned to a support user changed
  AssignedTickets,
  Users,
  Notifications,
  Dashboard,
}

struct Pending {
  seq: u64,
  timer: JoinHandle<()>,
}

struct Inner {
  sender: broadcast::Sender<Invalidation>,
  window: Duration,
  next_seq: AtomicU64,
  pending: Mutex<HashMap<Invalidation, Pending>>,
}

/// Debounced broadcaster for [`Invalidation`] events.
///
/// Cheap to clone; all clones share the same channel and timers.
#[derive(Clone)]
pub struct InvalidationBus {
  inner: Arc<Inner>,
}

impl InvalidationBus {
  pub fn new(window: Duration) -> Self {
    let (sender, _) = broadcast::channel(BUFFER_SIZE);
    Self {
      inner: Arc::new(Inner {
        sender,
        window,
        next_seq: AtomicU64::new(0),
        pending: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Schedule a dispatch of `event` after the debounce window.
  ///
  /// A trigger for the same event that is still waiting is replaced, so the
  /// window restarts from the latest call.
  pub fn trigger(&self, event: Invalidation) {
    let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
    let mut pending = lock(&self.inner.pending);

    let inner = Arc::clone(&self.inner);
    let timer = tokio::spawn(async move {
      tokio::time::sleep(inner.window).await;

      let mut pending = lock(&inner.pending);
      // A later trigger owns the slot now
      if pending.get(&event).map(|p| p.seq) != Some(seq) {
        return;
      }
      pending.remove(&event);
      drop(pending);

      let receivers = inner.sender.send(event).unwrap_or_default();
      debug!(?event, receivers, "invalidation dispatched");
    });

    if let Some(previous) = pending.insert(event, Pending { seq, timer }) {
      trace!(?event, "debounced");
      previous.timer.abort();
    }
  }

  pub fn trigger_user_tickets_refresh(&self) {
    self.trigger(Invalidation::UserTickets);
  }

  pub fn trigger_all_tickets_refresh(&self) {
    self.trigger(Invalidation::AllTickets);
  }

  /// Receive every event dispatched after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
    self.inner.sender.subscribe()
  }

  /// Run `handler` each time `event` is dispatched, for as long as the
  /// returned [`Registration`] is alive.
  pub fn listen<F, Fut>(&self, event: Invalidation, handler: F) -> Registration
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut receiver = self.subscribe();
    let task = tokio::spawn(async move {
      loop {
        match receiver.recv().await {
          Ok(received) if received == event => handler().await,
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(?event, skipped, "listener lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    Registration { task }
  }

  /// Number of live subscribers, listeners included.
  pub fn subscriber_count(&self) -> usize {
    self.inner.sender.receiver_count()
  }
}

impl std::fmt::Debug for InvalidationBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InvalidationBus")
      .field("window", &self.inner.window)
      .field("subscriber_count", &self.subscriber_count())
      .finish()
  }
}

/// Listener handle returned by [`InvalidationBus::listen`]. Dropping it
/// deregisters the listener.
#[must_use = "the listener stops as soon as the registration is dropped"]
pub struct Registration {
  task: JoinHandle<()>,
}

impl Drop for Registration {
  fn drop(&mut self) {
    self.task.abort();
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::broadcast::error::TryRecvError;
  use tokio::time::{sleep, Instant};

  fn bus() -> InvalidationBus {
    InvalidationBus::new(Duration::from_millis(300))
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_triggers_collapse_into_one_dispatch() {
    let bus = bus();
    let mut rx = bus.subscribe();
    let start = Instant::now();

    for _ in 0..5 {
      bus.trigger_user_tickets_refresh();
      sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(rx.recv().await.unwrap(), Invalidation::UserTickets);
    // The window restarts on every trigger
    assert!(start.elapsed() >= Duration::from_millis(380));

    sleep(Duration::from_secs(1)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_events_are_debounced_independently() {
    let bus = bus();
    let mut rx = bus.subscribe();

    bus.trigger_user_tickets_refresh();
    bus.trigger_all_tickets_refresh();
    bus.trigger_user_tickets_refresh();

    sleep(Duration::from_millis(400)).await;
    let mut received = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
    received.sort_by_key(|e| format!("{:?}", e));
    assert_eq!(received, vec![Invalidation::AllTickets, Invalidation::UserTickets]);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_triggers_outside_the_window_dispatch_separately() {
    let bus = bus();
    let mut rx = bus.subscribe();

    bus.trigger(Invalidation::Users);
    sleep(Duration::from_millis(400)).await;
    bus.trigger(Invalidation::Users);
    sleep(Duration::from_millis(400)).await;

    assert_eq!(rx.try_recv().unwrap(), Invalidation::Users);
    assert_eq!(rx.try_recv().unwrap(), Invalidation::Users);
  }

  #[tokio::test(start_paused = true)]
  async fn test_listener_runs_until_registration_dropped() {
    let bus = bus();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let registration = bus.listen(Invalidation::AllTickets, move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    bus.trigger_all_tickets_refresh();
    bus.trigger_user_tickets_refresh();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(registration);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.subscriber_count(), 0);

    bus.trigger_all_tickets_refresh();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
