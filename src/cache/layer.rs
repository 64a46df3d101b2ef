//! Cache container that orchestrates freshness checks with network fetching.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{Error, Result};

use super::freshness::{FreshnessPolicy, FreshnessToken};
use super::traits::{CacheResult, Cacheable, ScopeKey};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Vec<T>>>>;

/// Epoch of a container. `clear()` starts a new one, and writes captured
/// under an older epoch are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

struct InFlight<T> {
  id: u64,
  scope: ScopeKey,
  future: SharedFetch<T>,
}

struct State<T> {
  items: Vec<T>,
  token: Option<FreshnessToken>,
  generation: u64,
  next_request: u64,
  in_flight: Option<InFlight<T>>,
}

/// Cached collection of one resource.
///
/// Sits between consumers and a resource fetcher: fresh data is served from
/// memory, misses go to the network, and concurrent callers share a single
/// request. The fetch runs as its own task, so it completes even when every
/// caller goes away; its result is only written if the container was not
/// cleared or re-scoped in the meantime.
pub struct CacheContainer<T: Cacheable> {
  name: &'static str,
  policy: FreshnessPolicy,
  /// Maximum number of items kept, newest first
  capacity: Option<usize>,
  state: Arc<Mutex<State<T>>>,
}

impl<T: Cacheable> CacheContainer<T> {
  pub fn new(name: &'static str, policy: FreshnessPolicy) -> Self {
    Self {
      name,
      policy,
      capacity: None,
      state: Arc::new(Mutex::new(State {
        items: Vec::new(),
        token: None,
        generation: 0,
        next_request: 0,
        in_flight: None,
      })),
    }
  }

  /// Bound the collection to the first `capacity` items.
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = Some(capacity);
    self
  }

  /// Return cached items for `scope` when fresh, otherwise fetch them.
  ///
  /// 1. Scope matches and the policy says fresh → cached items, no request
  /// 2. A request for the same scope is in flight → wait for it
  /// 3. Otherwise start a request; success replaces the items, failure
  ///    clears them
  pub async fn fetch<F, Fut>(&self, scope: ScopeKey, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let (pending, joined) = {
      let mut state = lock_state(&self.state);

      if let Some(token) = state.token {
        if token.serves(&scope, self.policy, Instant::now()) {
          debug!(cache = self.name, scope = %scope, "cache hit");
          return Ok(CacheResult::from_cache(state.items.clone(), token.fetched_at));
        }
      }

      match in_flight_for(&*state, &scope) {
        Some(future) => {
          debug!(cache = self.name, scope = %scope, "joining in-flight request");
          (future, true)
        }
        None => (self.start(&mut *state, scope, fetcher), false),
      }
    };

    settle(pending, joined).await
  }

  /// Drop freshness for `scope` and fetch again.
  ///
  /// While a request for the same scope is in flight this does not start a
  /// second one; it waits for the outstanding request instead.
  pub async fn refresh<F, Fut>(&self, scope: ScopeKey, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let (pending, joined) = {
      let mut state = lock_state(&self.state);

      match in_flight_for(&*state, &scope) {
        Some(future) => {
          debug!(cache = self.name, scope = %scope, "refresh already in flight");
          (future, true)
        }
        None => {
          state.token = None;
          (self.start(&mut *state, scope, fetcher), false)
        }
      }
    };

    settle(pending, joined).await
  }

  /// Reset to the empty, never-fetched state. A request still in flight
  /// completes but its result is discarded.
  pub fn clear(&self) {
    let mut state = lock_state(&self.state);
    reset(&mut state);
    debug!(cache = self.name, "cleared");
  }

  /// Clear unless everything held, stored or in flight, was fetched for
  /// `user_id`. Returns true when the container was kept.
  pub fn clear_unless_owned_by(&self, user_id: u64) -> bool {
    let mut state = lock_state(&self.state);
    let stored = state.token.map(|t| t.scope.user_id);
    let pending = state.in_flight.as_ref().map(|f| f.scope.user_id);

    let owned = (stored.is_some() || pending.is_some())
      && stored.into_iter().chain(pending).all(|owner| owner == Some(user_id));
    if owned {
      debug!(cache = self.name, user_id, "kept for the same identity");
    } else {
      reset(&mut state);
      debug!(cache = self.name, user_id, "cleared for a new identity");
    }
    owned
  }

  fn start<F, Fut>(&self, state: &mut State<T>, scope: ScopeKey, fetcher: F) -> SharedFetch<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    state.next_request += 1;
    let id = state.next_request;
    let generation = state.generation;
    debug!(cache = self.name, scope = %scope, request = id, "cache miss, fetching");

    let name = self.name;
    let capacity = self.capacity;
    let request = fetcher();

    let task_state = Arc::clone(&self.state);
    let task = tokio::spawn(async move {
      let result = request.await;
      complete(&task_state, name, capacity, id, generation, scope, result)
    });

    let join_state = Arc::clone(&self.state);
    let future = async move {
      match task.await {
        Ok(result) => result,
        Err(e) => {
          // The task never reached `complete`; release the slot ourselves
          let mut state = lock_state(&join_state);
          if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
          }
          Err(Error::Task(e.to_string()))
        }
      }
    }
    .boxed()
    .shared();

    state.in_flight = Some(InFlight {
      id,
      scope,
      future: future.clone(),
    });
    future
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn items(&self) -> Vec<T> {
    lock_state(&self.state).items.clone()
  }

  pub fn find(&self, key: &str) -> Option<T> {
    lock_state(&self.state)
      .items
      .iter()
      .find(|item| item.cache_key() == key)
      .cloned()
  }

  pub fn len(&self) -> usize {
    lock_state(&self.state).items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// True while a request is outstanding.
  pub fn is_loading(&self) -> bool {
    lock_state(&self.state).in_flight.is_some()
  }

  /// Scope of the stored data, if any was fetched since the last clear.
  pub fn scope(&self) -> Option<ScopeKey> {
    lock_state(&self.state).token.map(|t| t.scope)
  }

  pub fn generation(&self) -> Generation {
    Generation(lock_state(&self.state).generation)
  }

  // ==========================================================================
  // Mutations
  //
  // Applied after a successful write call. Each takes the generation
  // captured before the write so a result that lands after a clear is
  // dropped.
  // ==========================================================================

  pub fn append(&self, at: Generation, item: T) -> bool {
    self.mutate(at, |items| {
      items.push(item);
      true
    })
  }

  pub fn prepend(&self, at: Generation, item: T) -> bool {
    self.mutate(at, |items| {
      items.insert(0, item);
      true
    })
  }

  /// Prepend unless an item with the same key is already present.
  pub fn prepend_unique(&self, at: Generation, item: T) -> bool {
    let key = item.cache_key();
    self.mutate(at, |items| {
      if items.iter().any(|existing| existing.cache_key() == key) {
        return false;
      }
      items.insert(0, item);
      true
    })
  }

  /// Replace the item with the same key. Returns false if it isn't cached.
  pub fn replace(&self, at: Generation, item: T) -> bool {
    let key = item.cache_key();
    self.mutate(at, |items| {
      match items.iter_mut().find(|existing| existing.cache_key() == key) {
        Some(existing) => {
          *existing = item;
          true
        }
        None => false,
      }
    })
  }

  pub fn remove(&self, at: Generation, key: &str) -> bool {
    self.mutate(at, |items| {
      let before = items.len();
      items.retain(|item| item.cache_key() != key);
      items.len() != before
    })
  }

  pub fn update_all(&self, at: Generation, mut f: impl FnMut(&mut T)) -> bool {
    self.mutate(at, |items| {
      items.iter_mut().for_each(&mut f);
      !items.is_empty()
    })
  }

  fn mutate(&self, at: Generation, op: impl FnOnce(&mut Vec<T>) -> bool) -> bool {
    let mut state = lock_state(&self.state);
    if state.generation != at.0 {
      debug!(cache = self.name, "dropping write from a cleared generation");
      return false;
    }
    let changed = op(&mut state.items);
    if let Some(capacity) = self.capacity {
      state.items.truncate(capacity);
    }
    changed
  }
}

impl<T: Cacheable> Clone for CacheContainer<T> {
  fn clone(&self) -> Self {
    Self {
      name: self.name,
      policy: self.policy,
      capacity: self.capacity,
      state: Arc::clone(&self.state),
    }
  }
}

fn lock_state<T>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reset<T>(state: &mut State<T>) {
  state.items.clear();
  state.token = None;
  state.in_flight = None;
  state.generation += 1;
}

fn in_flight_for<T>(state: &State<T>, scope: &ScopeKey) -> Option<SharedFetch<T>> {
  state
    .in_flight
    .as_ref()
    .filter(|f| f.scope == *scope)
    .map(|f| f.future.clone())
}

async fn settle<T: Clone>(pending: SharedFetch<T>, joined: bool) -> Result<CacheResult<Vec<T>>> {
  let data = pending.await?;
  Ok(if joined {
    CacheResult::joined(data)
  } else {
    CacheResult::from_network(data)
  })
}

/// Write a finished request into the container, unless it was superseded.
fn complete<T: Cacheable>(
  state: &Mutex<State<T>>,
  name: &'static str,
  capacity: Option<usize>,
  id: u64,
  generation: u64,
  scope: ScopeKey,
  result: Result<Vec<T>>,
) -> Result<Vec<T>> {
  let mut state = lock_state(state);

  let current = state.in_flight.as_ref().is_some_and(|f| f.id == id);
  if current {
    state.in_flight = None;
  }
  if !current || state.generation != generation {
    debug!(cache = name, scope = %scope, request = id, "discarding superseded response");
    return result;
  }

  match result {
    Ok(mut items) => {
      if let Some(capacity) = capacity {
        items.truncate(capacity);
      }
      debug!(cache = name, scope = %scope, count = items.len(), "stored");
      state.items = items.clone();
      state.token = Some(FreshnessToken::new(scope, Instant::now()));
      Ok(items)
    }
    Err(e) => {
      warn!(
        cache = name,
        scope = %scope,
        error = %e,
        "failed to fetch {} list, clearing cache",
        T::entity_type()
      );
      state.items.clear();
      state.token = None;
      Err(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{CacheSource, FetchKind};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq)]
  struct Item {
    id: u64,
    owner: u64,
  }

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.id.to_string()
    }

    fn entity_type() -> &'static str {
      "item"
    }
  }

  fn items(owner: u64, ids: &[u64]) -> Vec<Item> {
    ids.iter().map(|&id| Item { id, owner }).collect()
  }

  fn scope(user: u64) -> ScopeKey {
    ScopeKey::new(Some(user), FetchKind::Own)
  }

  /// Fetcher that counts invocations and answers after `delay`.
  fn fetcher(
    calls: &Arc<AtomicUsize>,
    result: Result<Vec<Item>>,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<Item>>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(delay).await;
        result
      }
      .boxed()
    }
  }

  fn ok(calls: &Arc<AtomicUsize>, data: Vec<Item>) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<Item>>> {
    fetcher(calls, Ok(data), Duration::from_millis(10))
  }

  fn ttl_cache() -> CacheContainer<Item> {
    CacheContainer::new("items", FreshnessPolicy::TimeToLive(Duration::from_secs(30)))
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetches_within_ttl_hit_network_once() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache.fetch(scope(1), ok(&calls, items(1, &[1, 2]))).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    for _ in 0..5 {
      tokio::time::sleep(Duration::from_secs(5)).await;
      let result = cache.fetch(scope(1), ok(&calls, items(1, &[9]))).await.unwrap();
      assert_eq!(result.source, CacheSource::Cache);
      assert_eq!(result.data.len(), 2);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the threshold the next read goes back to the network
    tokio::time::sleep(Duration::from_secs(10)).await;
    let result = cache.fetch(scope(1), ok(&calls, items(1, &[9]))).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.items(), items(1, &[9]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_expiry_stays_fresh_until_refresh() {
    let cache = CacheContainer::new("items", FreshnessPolicy::NoExpiry);
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(scope(1), ok(&calls, items(1, &[1]))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    cache.fetch(scope(1), ok(&calls, items(1, &[2]))).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let refreshed = cache.refresh(scope(1), ok(&calls, items(1, &[3]))).await.unwrap();
    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.items(), items(1, &[3]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_result_counts_as_fetched() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(scope(1), ok(&calls, Vec::new())).await.unwrap();
    let again = cache.fetch(scope(1), ok(&calls, Vec::new())).await.unwrap();
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_request() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let slow = Duration::from_millis(100);

    let (a, b, c) = tokio::join!(
      cache.fetch(scope(1), fetcher(&calls, Ok(items(1, &[1])), slow)),
      cache.fetch(scope(1), fetcher(&calls, Ok(items(1, &[2])), slow)),
      cache.refresh(scope(1), fetcher(&calls, Ok(items(1, &[3])), slow)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap().source, CacheSource::Network);
    let b = b.unwrap();
    assert_eq!(b.source, CacheSource::Joined);
    assert_eq!(b.data, items(1, &[1]));
    assert_eq!(c.unwrap().source, CacheSource::Joined);
    assert!(!cache.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn test_joined_callers_share_the_failure() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let failure = Err(Error::RequestFailed {
      status: 500,
      message: "Server Error".to_string(),
    });

    let (a, b) = tokio::join!(
      cache.fetch(scope(1), fetcher(&calls, failure, Duration::from_millis(50))),
      cache.refresh(scope(1), ok(&calls, items(1, &[1]))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(a, Err(Error::RequestFailed { status: 500, .. })));
    assert!(matches!(b, Err(Error::RequestFailed { status: 500, .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_leaves_cache_empty() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(scope(1), ok(&calls, items(1, &[1, 2, 3]))).await.unwrap();
    assert_eq!(cache.scope(), Some(scope(1)));

    let failure = Err(Error::Unauthorized);
    let result = cache
      .refresh(scope(1), fetcher(&calls, failure, Duration::from_millis(10)))
      .await;

    assert!(matches!(result, Err(Error::Unauthorized)));
    assert!(cache.is_empty());
    assert_eq!(cache.scope(), None);
    assert!(!cache.is_loading());

    // Heals on the next successful fetch
    cache.fetch(scope(1), ok(&calls, items(1, &[4]))).await.unwrap();
    assert_eq!(cache.items(), items(1, &[4]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_other_identity_triggers_fetch() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(scope(1), ok(&calls, items(1, &[1, 2]))).await.unwrap();
    let result = cache.fetch(scope(2), ok(&calls, items(2, &[7]))).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.items().iter().all(|item| item.owner == 2));
    assert_eq!(cache.scope(), Some(scope(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_logout_then_login_fetches_once_for_new_user() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(scope(1), ok(&calls, items(1, &[1, 2, 3]))).await.unwrap();
    assert_eq!(cache.len(), 3);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.scope(), None);

    let calls_b = Arc::new(AtomicUsize::new(0));
    let result = cache.fetch(scope(2), ok(&calls_b, items(2, &[10, 11]))).await.unwrap();
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert_eq!(result.data, items(2, &[10, 11]));
    assert!(cache.items().iter().all(|item| item.owner == 2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_discards_in_flight_response() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let background = cache.clone();
    let slow = fetcher(&calls, Ok(items(1, &[1, 2])), Duration::from_millis(100));
    let handle = tokio::spawn(async move { background.fetch(scope(1), slow).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.is_loading());

    cache.clear();
    assert!(!cache.is_loading());

    // The original caller still receives its own response...
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.data.len(), 2);
    // ...but it never lands in the cleared container
    assert!(cache.is_empty());
    assert_eq!(cache.scope(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_scope_supersedes_older_request() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let (old, new) = tokio::join!(
      cache.fetch(scope(1), fetcher(&calls, Ok(items(1, &[1])), Duration::from_millis(200))),
      cache.fetch(scope(2), fetcher(&calls, Ok(items(2, &[2])), Duration::from_millis(50))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(old.is_ok());
    assert!(new.is_ok());
    assert_eq!(cache.items(), items(2, &[2]));
    assert_eq!(cache.scope(), Some(scope(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_unless_owned_by_keeps_same_identity() {
    let cache = ttl_cache();
    let calls = Arc::new(AtomicUsize::new(0));

    // Never fetched: nothing to keep
    assert!(!cache.clear_unless_owned_by(1));

    cache.fetch(scope(1), ok(&calls, items(1, &[1, 2]))).await.unwrap();
    assert!(cache.clear_unless_owned_by(1));
    assert_eq!(cache.len(), 2);

    // A request started for the new identity survives the identity check
    let pending = {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      tokio::spawn(async move { cache.refresh(scope(2), ok(&calls, items(2, &[7]))).await })
    };
    tokio::task::yield_now().await;
    assert!(!cache.clear_unless_owned_by(2));
    assert!(cache.is_empty());

    let pending = {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      tokio::spawn(async move { cache.fetch(scope(2), ok(&calls, items(2, &[8]))).await })
    };
    tokio::task::yield_now().await;
    assert!(cache.clear_unless_owned_by(2));
    pending.await.unwrap().unwrap();
    assert_eq!(cache.items(), items(2, &[8]));
    assert_eq!(cache.scope(), Some(scope(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_mutations_after_clear_are_dropped() {
    let cache: CacheContainer<Item> = CacheContainer::new("items", FreshnessPolicy::NoExpiry);
    let before = cache.generation();
    assert!(cache.append(before, Item { id: 1, owner: 1 }));

    cache.clear();
    assert!(!cache.append(before, Item { id: 2, owner: 1 }));
    assert!(cache.is_empty());

    let now = cache.generation();
    assert!(cache.append(now, Item { id: 3, owner: 1 }));
    assert!(cache.replace(now, Item { id: 3, owner: 9 }));
    assert!(!cache.replace(now, Item { id: 4, owner: 9 }));
    assert_eq!(cache.find("3"), Some(Item { id: 3, owner: 9 }));
    assert!(cache.remove(now, "3"));
    assert!(!cache.remove(now, "3"));
  }

  #[tokio::test]
  async fn test_prepend_unique_is_bounded_and_deduplicated() {
    let cache: CacheContainer<Item> =
      CacheContainer::new("items", FreshnessPolicy::NoExpiry).with_capacity(10);
    let at = cache.generation();

    for id in 1..=12 {
      assert!(cache.prepend_unique(at, Item { id, owner: 1 }));
    }
    assert_eq!(cache.len(), 10);
    assert_eq!(cache.items()[0].id, 12);
    assert_eq!(cache.items()[9].id, 3);

    let before = cache.items();
    assert!(!cache.prepend_unique(at, Item { id: 12, owner: 1 }));
    assert_eq!(cache.items(), before);
  }
}
