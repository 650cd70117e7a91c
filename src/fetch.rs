//! The fetch collaborator and single-flight bookkeeping.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::FetchError;
use crate::key::CacheKey;

/// A boxed future that resolves to fetched data or a classified error
pub type FetchFuture<V> = BoxFuture<'static, Result<V, FetchError>>;

type FetchFn<V> = Arc<dyn Fn(CacheKey) -> FetchFuture<V> + Send + Sync>;

/// The externally supplied async operation that loads the resource for a key.
///
/// It receives the full key, so params encoded in the key are available to it.
/// It may be invoked again for the same key once a previous call settled.
pub struct Fetcher<V> {
  inner: FetchFn<V>,
}

impl<V> Clone for Fetcher<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Send + 'static> Fetcher<V> {
  /// Wrap a closure that returns a future.
  ///
  /// ```ignore
  /// let api = api.clone();
  /// let fetcher = Fetcher::new(move |key| {
  ///   let api = api.clone();
  ///   async move { api.load(&key).await.map_err(FetchError::from) }
  /// });
  /// ```
  pub fn new<F, Fut>(fetch: F) -> Self
  where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    Self {
      inner: Arc::new(move |key| fetch(key).boxed()),
    }
  }

  pub(crate) fn call(&self, key: CacheKey) -> FetchFuture<V> {
    (self.inner)(key)
  }
}

impl<V> fmt::Debug for Fetcher<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Fetcher").finish_non_exhaustive()
  }
}

/// What one fetch generation resolved to. `None` means a newer generation
/// superseded it and its result was discarded.
pub(crate) type Settled<V> = Option<Result<V, FetchError>>;

/// A settled-result future that any number of callers can await.
pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Settled<V>>>;

/// The one outstanding fetch for an entry.
pub(crate) struct InFlight<V> {
  pub generation: u64,
  pub result: SharedFetch<V>,
}

impl<V> fmt::Debug for InFlight<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InFlight")
      .field("generation", &self.generation)
      .finish_non_exhaustive()
  }
}

/// Turn a spawned fetch task into a shareable result.
pub(crate) fn share<V>(handle: JoinHandle<Settled<V>>) -> SharedFetch<V>
where
  V: Clone + Send + Sync + 'static,
{
  async move {
    match handle.await {
      Ok(settled) => settled,
      // A cancelled task belongs to a generation that no longer exists
      Err(e) if e.is_cancelled() => None,
      Err(e) => Some(Err(FetchError::transient(format!("fetch task panicked: {}", e)))),
    }
  }
  .boxed()
  .shared()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;

  #[tokio::test]
  async fn test_fetcher_receives_key() {
    let fetcher = Fetcher::new(|key: CacheKey| async move { Ok::<_, FetchError>(key.len()) });
    let result = fetcher.call(cache_key!["a", "b", "c"]).await;
    assert_eq!(result, Ok(3));
  }

  #[tokio::test]
  async fn test_shared_result_is_seen_by_every_waiter() {
    let handle = tokio::spawn(async { Some(Ok::<_, FetchError>(42)) });
    let shared = share(handle);
    let (a, b) = tokio::join!(shared.clone(), shared);
    assert_eq!(a, Some(Ok(42)));
    assert_eq!(b, Some(Ok(42)));
  }

  #[tokio::test]
  async fn test_aborted_task_reads_as_superseded() {
    let handle = tokio::spawn(async {
      tokio::time::sleep(std::time::Duration::from_secs(60)).await;
      Some(Ok::<_, FetchError>(1))
    });
    handle.abort();
    assert_eq!(share(handle).await, None);
  }
}
