//! Subscription registry: who observes which key, and notification fan-out.
//!
//! Each observer gets its own unbounded channel so no status transition is
//! coalesced or dropped. On registration the observer receives the current
//! snapshot, then one snapshot per transition (`fetching`, `success`, `error`).

use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::client::QueryClient;
use crate::error::FetchError;
use crate::key::CacheKey;
use crate::store::FetchStatus;

/// What an observer sees of an entry at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<V> {
  pub key: CacheKey,
  pub status: FetchStatus,
  /// Last successfully fetched data, kept across errors and refetches
  pub data: Option<V>,
  pub error: Option<FetchError>,
  pub is_stale: bool,
  pub updated_at: Option<DateTime<Utc>>,
}

pub type SubscriberId = u64;

struct Observer<V> {
  id: SubscriberId,
  tx: mpsc::UnboundedSender<QuerySnapshot<V>>,
}

pub struct SubscriptionRegistry<V> {
  next_id: SubscriberId,
  observers: HashMap<CacheKey, Vec<Observer<V>>>,
}

impl<V> Default for SubscriptionRegistry<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> SubscriptionRegistry<V> {
  pub fn new() -> Self {
    Self {
      next_id: 0,
      observers: HashMap::new(),
    }
  }

  /// Register an observer for `key` and deliver `initial` to it.
  pub fn register(
    &mut self,
    key: &CacheKey,
    initial: QuerySnapshot<V>,
  ) -> (SubscriberId, mpsc::UnboundedReceiver<QuerySnapshot<V>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    // the receiver is alive, so this cannot fail
    let _ = tx.send(initial);

    self.next_id += 1;
    let id = self.next_id;
    self
      .observers
      .entry(key.clone())
      .or_default()
      .push(Observer { id, tx });
    (id, rx)
  }

  /// Returns false if the observer was not registered.
  pub fn deregister(&mut self, key: &CacheKey, id: SubscriberId) -> bool {
    let Some(observers) = self.observers.get_mut(key) else {
      return false;
    };
    let before = observers.len();
    observers.retain(|observer| observer.id != id);
    let removed = observers.len() != before;
    if observers.is_empty() {
      self.observers.remove(key);
    }
    removed
  }

  pub fn observer_count(&self, key: &CacheKey) -> usize {
    self.observers.get(key).map_or(0, Vec::len)
  }

  /// Drop every observer. Their streams end.
  pub fn clear(&mut self) {
    self.observers.clear();
  }
}

impl<V: Clone> SubscriptionRegistry<V> {
  /// Send `snapshot` to every observer of its key. Returns how many received it.
  pub fn notify(&self, snapshot: &QuerySnapshot<V>) -> usize {
    let Some(observers) = self.observers.get(&snapshot.key) else {
      return 0;
    };
    observers
      .iter()
      .filter(|observer| observer.tx.send(snapshot.clone()).is_ok())
      .count()
  }
}

/// A live observation of one key.
///
/// Dropping the subscription unsubscribes; when the last observer of a key
/// goes away the entry's gc countdown starts.
pub struct Subscription<V: Clone + Send + Sync + 'static> {
  key: CacheKey,
  id: SubscriberId,
  rx: mpsc::UnboundedReceiver<QuerySnapshot<V>>,
  client: Option<QueryClient<V>>,
}

impl<V: Clone + Send + Sync + 'static> Subscription<V> {
  pub(crate) fn new(
    client: QueryClient<V>,
    key: CacheKey,
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<QuerySnapshot<V>>,
  ) -> Self {
    Self {
      key,
      id,
      rx,
      client: Some(client),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Wait for the next snapshot. `None` once the cache was reset.
  pub async fn next(&mut self) -> Option<QuerySnapshot<V>> {
    self.rx.recv().await
  }

  /// Take a snapshot that is already queued, without waiting.
  pub fn try_next(&mut self) -> Option<QuerySnapshot<V>> {
    self.rx.try_recv().ok()
  }

  pub fn unsubscribe(mut self) {
    self.detach();
  }

  fn detach(&mut self) {
    if let Some(client) = self.client.take() {
      client.detach(&self.key, self.id);
    }
  }
}

impl<V: Clone + Send + Sync + 'static> Stream for Subscription<V> {
  type Item = QuerySnapshot<V>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

impl<V: Clone + Send + Sync + 'static> Drop for Subscription<V> {
  fn drop(&mut self) {
    self.detach();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;

  fn snapshot(key: &CacheKey, status: FetchStatus) -> QuerySnapshot<u32> {
    QuerySnapshot {
      key: key.clone(),
      status,
      data: None,
      error: None,
      is_stale: true,
      updated_at: None,
    }
  }

  #[test]
  fn test_register_delivers_initial_snapshot() {
    let mut registry = SubscriptionRegistry::new();
    let key = cache_key!["families", "members", "F1"];
    let (_, mut rx) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    assert_eq!(rx.try_recv().unwrap().status, FetchStatus::Idle);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_notify_fans_out_in_order() {
    let mut registry = SubscriptionRegistry::new();
    let key = cache_key!["families", "members", "F1"];
    let (_, mut a) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    let (_, mut b) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    let other = cache_key!["families", "detail", "F1"];
    let (_, mut c) = registry.register(&other, snapshot(&other, FetchStatus::Idle));

    assert_eq!(registry.notify(&snapshot(&key, FetchStatus::Fetching)), 2);
    assert_eq!(registry.notify(&snapshot(&key, FetchStatus::Success)), 2);

    for rx in [&mut a, &mut b] {
      let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|s| s.status)
        .collect();
      assert_eq!(
        statuses,
        vec![FetchStatus::Idle, FetchStatus::Fetching, FetchStatus::Success]
      );
    }
    assert_eq!(c.try_recv().unwrap().status, FetchStatus::Idle);
    assert!(c.try_recv().is_err());
  }

  #[test]
  fn test_deregister() {
    let mut registry = SubscriptionRegistry::new();
    let key = cache_key!["k"];
    let (first, _a) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    let (second, _b) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    assert_eq!(registry.observer_count(&key), 2);

    assert!(registry.deregister(&key, first));
    assert!(!registry.deregister(&key, first));
    assert_eq!(registry.observer_count(&key), 1);
    assert!(registry.deregister(&key, second));
    assert_eq!(registry.observer_count(&key), 0);
    assert_eq!(registry.notify(&snapshot(&key, FetchStatus::Fetching)), 0);
  }

  #[test]
  fn test_dropped_receiver_is_not_counted() {
    let mut registry = SubscriptionRegistry::new();
    let key = cache_key!["k"];
    let (_, rx) = registry.register(&key, snapshot(&key, FetchStatus::Idle));
    drop(rx);
    assert_eq!(registry.notify(&snapshot(&key, FetchStatus::Fetching)), 0);
  }
}
