//! Client-side caching for the helpdesk resources.
//!
//! Each resource lives in a [`CacheContainer`]: a scoped collection with a
//! freshness policy, request de-duplication and generation-gated writes.
//! The persisted session (who is logged in) lives in [`SessionStorage`].

mod freshness;
mod layer;
mod storage;
mod traits;

pub use freshness::FreshnessPolicy;
pub use layer::{CacheContainer, Generation};
pub use storage::{SessionStorage, SqliteStorage};
pub use traits::{Cacheable, FetchKind, ScopeKey};
