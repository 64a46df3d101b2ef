//! Freshness policy shared by every cache container.

use std::time::Duration;
use tokio::time::Instant;

use super::traits::ScopeKey;

/// When cached data stops being served without a refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
  /// Fresh until explicitly invalidated (refresh or clear)
  NoExpiry,
  /// Fresh for the given duration after the fetch completed
  TimeToLive(Duration),
}

impl FreshnessPolicy {
  pub fn is_fresh(&self, fetched_at: Instant, now: Instant) -> bool {
    match self {
      FreshnessPolicy::NoExpiry => true,
      FreshnessPolicy::TimeToLive(ttl) => now.saturating_duration_since(fetched_at) < *ttl,
    }
  }
}

/// What a stored collection was fetched under, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessToken {
  pub scope: ScopeKey,
  pub fetched_at: Instant,
}

impl FreshnessToken {
  pub fn new(scope: ScopeKey, fetched_at: Instant) -> Self {
    Self { scope, fetched_at }
  }

  /// Whether the stored data can answer a request for `scope` at `now`.
  pub fn serves(&self, scope: &ScopeKey, policy: FreshnessPolicy, now: Instant) -> bool {
    self.scope == *scope && policy.is_fresh(self.fetched_at, now)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::FetchKind;

  #[test]
  fn test_ttl_boundary() {
    let policy = FreshnessPolicy::TimeToLive(Duration::from_secs(30));
    let start = Instant::now();
    assert!(policy.is_fresh(start, start));
    assert!(policy.is_fresh(start, start + Duration::from_millis(29_999)));
    assert!(!policy.is_fresh(start, start + Duration::from_secs(30)));
  }

  #[test]
  fn test_no_expiry_is_always_fresh() {
    let start = Instant::now();
    assert!(FreshnessPolicy::NoExpiry.is_fresh(start, start + Duration::from_secs(86_400)));
  }

  #[test]
  fn test_token_requires_matching_scope() {
    let now = Instant::now();
    let token = FreshnessToken::new(ScopeKey::new(Some(1), FetchKind::Own), now);

    assert!(token.serves(&ScopeKey::new(Some(1), FetchKind::Own), FreshnessPolicy::NoExpiry, now));
    assert!(!token.serves(&ScopeKey::new(Some(2), FetchKind::Own), FreshnessPolicy::NoExpiry, now));
    assert!(!token.serves(&ScopeKey::new(Some(1), FetchKind::All), FreshnessPolicy::NoExpiry, now));
  }
}
