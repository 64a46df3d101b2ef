//! Core traits and types for the caching system.

use std::fmt;
use tokio::time::Instant;

use crate::api::types::{Dashboard, Notification, Ticket, User};

/// Trait for entities that can be cached.
///
/// Implementors provide a unique cache key used for in-place updates,
/// removals and duplicate suppression.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (e.g., ticket id)
  fn cache_key(&self) -> String;

  /// Entity type name, used in log output
  fn entity_type() -> &'static str;
}

/// Which slice of a resource a collection was fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
  /// Records belonging to the current identity
  Own,
  /// Every record the current identity may see
  All,
  /// Tickets assigned to one support user
  Assigned(u64),
}

/// The identity and fetch kind a cached collection belongs to.
///
/// Data fetched under one scope key is never served for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey {
  pub user_id: Option<u64>,
  pub kind: FetchKind,
}

impl ScopeKey {
  pub fn new(user_id: Option<u64>, kind: FetchKind) -> Self {
    Self { user_id, kind }
  }
}

impl fmt::Display for ScopeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let user = match self.user_id {
      Some(id) => id.to_string(),
      None => "anonymous".to_string(),
    };
    match self.kind {
      FetchKind::Own => write!(f, "{}:own", user),
      FetchKind::All => write!(f, "{}:all", user),
      FetchKind::Assigned(support) => write!(f, "{}:assigned:{}", user, support),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if served from cache)
  pub fetched_at: Option<Instant>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: None,
    }
  }

  /// Create a new cache result for data produced by a request another caller started.
  pub fn joined(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Joined,
      fetched_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      fetched_at: Some(fetched_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Result of a request that was already in flight
  Joined,
  /// Data from cache, still considered fresh
  Cache,
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Ticket {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn entity_type() -> &'static str {
    "ticket"
  }
}

impl Cacheable for User {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn entity_type() -> &'static str {
    "user"
  }
}

impl Cacheable for Notification {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "notification"
  }
}

impl Cacheable for Dashboard {
  fn cache_key(&self) -> String {
    // There is only ever one dashboard per scope
    "dashboard".to_string()
  }

  fn entity_type() -> &'static str {
    "dashboard"
  }
}
