//! Keyed table of cache entries.
//!
//! The store only does entry bookkeeping: timestamps, status transitions,
//! generations and subscriber counts. It never talks to the network.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::config::{CacheConfig, Timings};
use crate::error::FetchError;
use crate::fetch::{Fetcher, InFlight};
use crate::key::CacheKey;
use crate::subscription::QuerySnapshot;
use crate::trie::KeyTrie;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
  Idle,
  Fetching,
  Success,
  Error,
}

/// Per-request timing overrides. Unset fields fall back to the key class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
  pub stale_time: Option<Duration>,
  pub gc_time: Option<Duration>,
}

impl QueryOptions {
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }
}

/// Outcome of a garbage-collection timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
  /// The entry was removed
  Evicted,
  /// The entry is mid-fetch; try again after the delay
  Deferred(Duration),
  /// The entry was re-subscribed, re-armed or already gone
  Cancelled,
}

pub struct CacheEntry<V> {
  key: CacheKey,
  data: Option<V>,
  fetched_at: Option<Instant>,
  updated_at: Option<DateTime<Utc>>,
  invalidated: bool,
  stale_time: Duration,
  gc_time: Duration,
  status: FetchStatus,
  error: Option<FetchError>,
  retry_count: u32,
  generation: u64,
  subscriber_count: usize,
  gc_epoch: u64,
  gc_timer: Option<JoinHandle<()>>,
  pub(crate) fetcher: Option<Fetcher<V>>,
  pub(crate) in_flight: Option<InFlight<V>>,
}

impl<V: Clone> CacheEntry<V> {
  fn new(key: CacheKey, timings: Timings) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      updated_at: None,
      invalidated: false,
      stale_time: timings.stale_time,
      gc_time: timings.gc_time,
      status: FetchStatus::Idle,
      error: None,
      retry_count: 0,
      generation: 0,
      subscriber_count: 0,
      gc_epoch: 0,
      gc_timer: None,
      fetcher: None,
      in_flight: None,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn data(&self) -> Option<&V> {
    self.data.as_ref()
  }

  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// Wall-clock time of the last successful write.
  pub fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at
  }

  pub fn status(&self) -> FetchStatus {
    self.status
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.error.as_ref()
  }

  pub fn retry_count(&self) -> u32 {
    self.retry_count
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscriber_count
  }

  pub fn stale_time(&self) -> Duration {
    self.stale_time
  }

  pub fn gc_time(&self) -> Duration {
    self.gc_time
  }

  /// Stale once invalidated, when never fetched, or when older than `stale_time`.
  pub fn is_stale(&self) -> bool {
    if self.invalidated {
      return true;
    }
    match self.fetched_at {
      Some(fetched_at) => Instant::now().saturating_duration_since(fetched_at) > self.stale_time,
      None => true,
    }
  }

  pub fn snapshot(&self) -> QuerySnapshot<V> {
    QuerySnapshot {
      key: self.key.clone(),
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      is_stale: self.is_stale(),
      updated_at: self.updated_at,
    }
  }

  fn apply_options(&mut self, options: &QueryOptions) {
    if let Some(stale_time) = options.stale_time {
      self.stale_time = stale_time;
    }
    if let Some(gc_time) = options.gc_time {
      self.gc_time = gc_time;
    }
  }

  pub(crate) fn put(&mut self, data: V) {
    self.data = Some(data);
    self.fetched_at = Some(Instant::now());
    self.updated_at = Some(Utc::now());
    self.invalidated = false;
    self.status = FetchStatus::Success;
    self.error = None;
    self.retry_count = 0;
    trace!(key = %self.key, generation = self.generation, "entry updated");
  }

  /// Start a new generation. Returns the generation token.
  pub(crate) fn mark_fetching(&mut self) -> u64 {
    self.status = FetchStatus::Fetching;
    self.generation += 1;
    self.retry_count = 0;
    trace!(key = %self.key, generation = self.generation, "entry fetching");
    self.generation
  }

  /// Record a surfaced error. Cached data stays servable.
  pub(crate) fn mark_error(&mut self, error: FetchError) {
    self.status = FetchStatus::Error;
    self.error = Some(error);
    trace!(key = %self.key, generation = self.generation, "entry errored");
  }

  pub(crate) fn record_retry(&mut self) -> u32 {
    let attempt = self.retry_count;
    self.retry_count += 1;
    attempt
  }

  /// Force the entry stale without touching its data or generation.
  pub(crate) fn mark_invalidated(&mut self) {
    self.invalidated = true;
  }

  /// Drop the current generation's claim on the entry, e.g. after a manual write.
  pub(crate) fn supersede(&mut self) {
    if self.in_flight.take().is_some() {
      self.generation += 1;
    }
  }

  fn cancel_gc(&mut self) {
    self.gc_epoch += 1;
    if let Some(timer) = self.gc_timer.take() {
      timer.abort();
    }
  }

  /// Begin a new gc countdown, cancelling any earlier one.
  fn arm_gc(&mut self) -> (u64, Duration) {
    self.cancel_gc();
    (self.gc_epoch, self.gc_time)
  }
}

/// The cache table. Owned by a [`crate::QueryClient`].
pub struct CacheStore<V> {
  entries: KeyTrie<CacheEntry<V>>,
  config: CacheConfig,
}

impl<V: Clone> CacheStore<V> {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      entries: KeyTrie::new(),
      config,
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry<V>> {
    self.entries.get(key)
  }

  pub(crate) fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry<V>> {
    self.entries.get_mut(key)
  }

  /// Get or create the entry for `key`. Options apply to existing entries too.
  /// The flag reports whether the entry was created.
  pub fn ensure(&mut self, key: &CacheKey, options: &QueryOptions) -> (&mut CacheEntry<V>, bool) {
    let config = &self.config;
    let (entry, created) = self
      .entries
      .get_or_insert_with(key, || CacheEntry::new(key.clone(), config.timings_for(key)));
    entry.apply_options(options);
    (entry, created)
  }

  pub fn put(&mut self, key: &CacheKey, data: V) {
    self.ensure(key, &QueryOptions::default()).0.put(data);
  }

  pub fn mark_fetching(&mut self, key: &CacheKey) -> u64 {
    self.ensure(key, &QueryOptions::default()).0.mark_fetching()
  }

  pub fn mark_error(&mut self, key: &CacheKey, error: FetchError) {
    self.ensure(key, &QueryOptions::default()).0.mark_error(error);
  }

  /// An absent entry is stale.
  pub fn is_stale(&self, key: &CacheKey) -> bool {
    self.entries.get(key).map_or(true, CacheEntry::is_stale)
  }

  /// Add a subscriber, cancelling any pending eviction.
  pub fn subscribe(&mut self, key: &CacheKey) -> &mut CacheEntry<V> {
    let (entry, _) = self.ensure(key, &QueryOptions::default());
    entry.subscriber_count += 1;
    entry.cancel_gc();
    entry
  }

  /// Remove a subscriber. When the count reaches zero the gc countdown starts:
  /// the returned epoch and delay must be handed to a timer that later calls
  /// [`CacheStore::collect`].
  pub fn unsubscribe(&mut self, key: &CacheKey) -> Option<(u64, Duration)> {
    let entry = self.entries.get_mut(key)?;
    if entry.subscriber_count == 0 {
      return None;
    }
    entry.subscriber_count -= 1;
    if entry.subscriber_count == 0 {
      Some(entry.arm_gc())
    } else {
      None
    }
  }

  /// Start the gc countdown for an entry nobody observes yet.
  pub(crate) fn arm_gc(&mut self, key: &CacheKey) -> Option<(u64, Duration)> {
    let entry = self.entries.get_mut(key)?;
    (entry.subscriber_count == 0).then(|| entry.arm_gc())
  }

  /// Attach the timer task for countdown `epoch`. A stale timer is aborted.
  pub(crate) fn attach_gc_timer(&mut self, key: &CacheKey, epoch: u64, timer: JoinHandle<()>) {
    match self.entries.get_mut(key) {
      Some(entry) if entry.gc_epoch == epoch => entry.gc_timer = Some(timer),
      _ => timer.abort(),
    }
  }

  /// Called when the countdown for `epoch` elapses.
  pub fn collect(&mut self, key: &CacheKey, epoch: u64) -> GcOutcome {
    let Some(entry) = self.entries.get_mut(key) else {
      return GcOutcome::Cancelled;
    };
    if entry.gc_epoch != epoch || entry.subscriber_count > 0 {
      return GcOutcome::Cancelled;
    }
    if entry.status == FetchStatus::Fetching {
      return GcOutcome::Deferred(entry.gc_time);
    }
    // the timer running this is finishing on its own
    entry.gc_timer = None;
    self.entries.remove(key);
    GcOutcome::Evicted
  }

  /// Keys equal to or extending `prefix`.
  pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self.entries.keys_with_prefix(prefix)
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.entries.keys()
  }

  /// Remove an entry, stopping its gc timer.
  pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
    let mut entry = self.entries.remove(key)?;
    entry.cancel_gc();
    Some(entry)
  }

  /// Remove every entry.
  pub fn clear(&mut self) -> usize {
    let mut entries = self.entries.drain();
    for entry in &mut entries {
      entry.cancel_gc();
    }
    entries.len()
  }
}
