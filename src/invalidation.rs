//! Prefix invalidation.
//!
//! A pass marks every entry under the requested prefixes stale, then reports
//! which of them are observed or mid-fetch and need a background refetch.
//! Marking finishes before the caller dispatches any refetch.

use std::collections::BTreeSet;

use crate::key::CacheKey;
use crate::store::{CacheStore, FetchStatus};

/// A set of keys or key prefixes processed as one invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationRequest {
  targets: BTreeSet<CacheKey>,
}

impl InvalidationRequest {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn target(mut self, prefix: CacheKey) -> Self {
    self.targets.insert(prefix);
    self
  }

  pub fn targets(&self) -> impl Iterator<Item = &CacheKey> {
    self.targets.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }
}

impl From<CacheKey> for InvalidationRequest {
  fn from(prefix: CacheKey) -> Self {
    Self::new().target(prefix)
  }
}

impl<const N: usize> From<[CacheKey; N]> for InvalidationRequest {
  fn from(prefixes: [CacheKey; N]) -> Self {
    prefixes.into_iter().collect()
  }
}

impl From<Vec<CacheKey>> for InvalidationRequest {
  fn from(prefixes: Vec<CacheKey>) -> Self {
    prefixes.into_iter().collect()
  }
}

impl FromIterator<CacheKey> for InvalidationRequest {
  fn from_iter<I: IntoIterator<Item = CacheKey>>(iter: I) -> Self {
    Self {
      targets: iter.into_iter().collect(),
    }
  }
}

/// Result of an invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidated {
  /// Every key marked stale, in key order
  pub stale: Vec<CacheKey>,
  /// The subset with a known fetcher that is observed or mid-fetch; these
  /// refetch now, superseding any fetch that started before the invalidation
  pub refetch: Vec<CacheKey>,
}

/// Keys matched by any target, each once, in key order.
pub fn matching_keys<V: Clone>(store: &CacheStore<V>, request: &InvalidationRequest) -> Vec<CacheKey> {
  let matched: BTreeSet<CacheKey> = request
    .targets()
    .flat_map(|prefix| store.keys_with_prefix(prefix))
    .collect();
  matched.into_iter().collect()
}

/// Mark every matching entry stale. Data and generations are left alone.
pub fn mark_stale<V: Clone>(store: &mut CacheStore<V>, request: &InvalidationRequest) -> Invalidated {
  let stale = matching_keys(store, request);
  let mut refetch = Vec::new();

  for key in &stale {
    if let Some(entry) = store.get_mut(key) {
      entry.mark_invalidated();
      let wanted = entry.subscriber_count() > 0 || entry.status() == FetchStatus::Fetching;
      if wanted && entry.fetcher.is_some() {
        refetch.push(key.clone());
      }
    }
  }

  Invalidated { stale, refetch }
}
