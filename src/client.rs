//! The query client: single owner of cache state.
//!
//! It coordinates fetches (one in flight per key, results committed only for
//! the newest generation), applies the retry policy, runs invalidation passes,
//! drives subscriptions and schedules garbage collection.
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new(config.cache.clone());
//! let fetcher = Fetcher::new(move |key| {
//!   let api = api.clone();
//!   async move { api.family_detail(&key).await }
//! });
//!
//! // Render whatever arrives
//! let mut sub = client.observe(&cache_key!["families", "detail", "F1"], fetcher);
//! while let Some(snapshot) = sub.next().await {
//!   render(snapshot);
//! }
//!
//! // After a mutation, everything derived from the family goes stale
//! client
//!   .mutate(api.kick_member("F1", "P9"), [cache_key!["families", "members", "F1"]])
//!   .await?;
//! ```

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::fetch::{self, Fetcher, InFlight, Settled, SharedFetch};
use crate::invalidation::{self, Invalidated, InvalidationRequest};
use crate::key::CacheKey;
use crate::retry::RetryPolicy;
use crate::store::{CacheStore, FetchStatus, GcOutcome, QueryOptions};
use crate::subscription::{QuerySnapshot, SubscriberId, Subscription, SubscriptionRegistry};

const AUTH_SIGNAL_CAPACITY: usize = 16;

/// Emitted whenever an auth failure is surfaced, so the session layer can react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSignal {
  /// The key whose fetch failed, or `None` for a mutation
  pub key: Option<CacheKey>,
  pub error: FetchError,
}

struct State<V> {
  store: CacheStore<V>,
  registry: SubscriptionRegistry<V>,
}

struct Inner<V> {
  state: Mutex<State<V>>,
  retry: RetryPolicy,
  runtime: Handle,
  auth_tx: broadcast::Sender<AuthSignal>,
}

/// What a fetch attempt's result means for the entry.
enum Commit<V> {
  Settled(Result<V, FetchError>),
  Retry(Duration),
  Superseded,
}

/// What a caller of `request` should do after looking at the entry.
enum Plan<V> {
  Ready(V),
  Await(SharedFetch<V>),
}

/// Handle to the cache. Cheap to clone; clones share state.
pub struct QueryClient<V> {
  inner: Arc<Inner<V>>,
}

impl<V> Clone for QueryClient<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Clone + Send + Sync + 'static> QueryClient<V> {
  /// Create a client bound to the current tokio runtime.
  ///
  /// # Panics
  ///
  /// Panics if called outside a tokio runtime.
  pub fn new(config: CacheConfig) -> Self {
    Self::with_runtime(config, Handle::current())
  }

  /// Create a client whose background tasks run on `runtime`.
  pub fn with_runtime(config: CacheConfig, runtime: Handle) -> Self {
    let (auth_tx, _) = broadcast::channel(AUTH_SIGNAL_CAPACITY);
    let retry = config.retry_policy();
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          store: CacheStore::new(config),
          registry: SubscriptionRegistry::new(),
        }),
        retry,
        runtime,
        auth_tx,
      }),
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.inner.retry
  }

  // Every mutation finishes before the guard drops, so a poisoned lock still
  // holds consistent entries.
  fn lock(&self) -> MutexGuard<'_, State<V>> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Subscribe to auth failures surfaced by fetches and mutations.
  pub fn auth_signals(&self) -> broadcast::Receiver<AuthSignal> {
    self.inner.auth_tx.subscribe()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn get_data(&self, key: &CacheKey) -> Option<V> {
    self.lock().store.get(key).and_then(|e| e.data().cloned())
  }

  pub fn snapshot(&self, key: &CacheKey) -> Option<QuerySnapshot<V>> {
    self.lock().store.get(key).map(|e| e.snapshot())
  }

  pub fn is_stale(&self, key: &CacheKey) -> bool {
    self.lock().store.is_stale(key)
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().store.get(key).is_some()
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().store.keys()
  }

  pub fn generation(&self, key: &CacheKey) -> Option<u64> {
    self.lock().store.get(key).map(|e| e.generation())
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self.lock().store.get(key).map_or(0, |e| e.subscriber_count())
  }

  // ==========================================================================
  // Fetching
  // ==========================================================================

  /// Get the data for `key`, fetching through `fetcher` when needed.
  ///
  /// - fresh data is returned without a fetch
  /// - stale data is returned at once and a background refetch starts
  /// - with no data, the caller waits for the fetch (and its retries)
  ///
  /// Concurrent requests for a key share one call to the fetcher.
  pub async fn request(&self, key: &CacheKey, fetcher: Fetcher<V>) -> Result<V, FetchError> {
    self.request_with(key, fetcher, QueryOptions::default()).await
  }

  pub async fn request_with(
    &self,
    key: &CacheKey,
    fetcher: Fetcher<V>,
    options: QueryOptions,
  ) -> Result<V, FetchError> {
    let (plan, gc) = {
      let mut state = self.lock();
      let (entry, created) = state.store.ensure(key, &options);
      entry.fetcher = Some(fetcher);

      let plan = if let Some(in_flight) = &entry.in_flight {
        match entry.data().cloned() {
          Some(data) => Plan::Ready(data),
          None => {
            debug!(%key, generation = in_flight.generation, "joining in-flight fetch");
            Plan::Await(in_flight.result.clone())
          }
        }
      } else {
        match entry.data().cloned() {
          Some(data) if !entry.is_stale() => Plan::Ready(data),
          Some(data) => {
            debug!(%key, "serving stale data, refetching in background");
            self.begin_fetch(&mut state, key);
            Plan::Ready(data)
          }
          None => match self.begin_fetch(&mut state, key) {
            Some(pending) => Plan::Await(pending),
            None => return Err(FetchError::client(format!("no fetcher for {}", key))),
          },
        }
      };

      let gc = if created { state.store.arm_gc(key) } else { None };
      (plan, gc)
    };

    if let Some((epoch, delay)) = gc {
      self.schedule_gc(key, epoch, delay);
    }

    match plan {
      Plan::Ready(data) => Ok(data),
      Plan::Await(pending) => self.settle(key, pending).await,
    }
  }

  /// Start a fetch for `key` without waiting for it. A no-op when the entry
  /// is fresh or already fetching.
  pub fn prefetch(&self, key: &CacheKey, fetcher: Fetcher<V>) {
    let gc = {
      let mut state = self.lock();
      let (entry, created) = state.store.ensure(key, &QueryOptions::default());
      entry.fetcher = Some(fetcher);
      if entry.in_flight.is_none() && entry.is_stale() {
        self.begin_fetch(&mut state, key);
      }
      if created {
        state.store.arm_gc(key)
      } else {
        None
      }
    };

    if let Some((epoch, delay)) = gc {
      self.schedule_gc(key, epoch, delay);
    }
  }

  /// Start a new generation for `key` and spawn its fetch. Supersedes any
  /// fetch already in flight. Returns `None` if no fetcher is known.
  fn begin_fetch(&self, state: &mut State<V>, key: &CacheKey) -> Option<SharedFetch<V>> {
    let State { store, registry } = state;
    let entry = store.get_mut(key)?;
    let fetcher = entry.fetcher.clone()?;

    let was_fetching = entry.status() == FetchStatus::Fetching;
    let generation = entry.mark_fetching();
    if was_fetching {
      debug!(%key, generation, "superseding in-flight fetch");
    } else {
      debug!(%key, generation, "starting fetch");
    }

    let task = self
      .inner
      .runtime
      .spawn(self.clone().run_fetch(key.clone(), generation, fetcher));
    let result = fetch::share(task);
    entry.in_flight = Some(InFlight {
      generation,
      result: result.clone(),
    });

    if !was_fetching {
      registry.notify(&entry.snapshot());
    }
    Some(result)
  }

  /// The fetch loop for one generation: call, then commit, retry or give up.
  ///
  /// A panicking fetcher settles the generation with a non-retried
  /// transient error so the entry can be refetched and collected.
  async fn run_fetch(self, key: CacheKey, generation: u64, fetcher: Fetcher<V>) -> Settled<V> {
    loop {
      let call = AssertUnwindSafe(async { fetcher.call(key.clone()).await }).catch_unwind();
      let (outcome, may_retry) = match call.await {
        Ok(outcome) => (outcome, true),
        Err(_) => {
          warn!(%key, generation, "fetcher panicked");
          (Err(FetchError::transient(format!("fetcher for {} panicked", key))), false)
        }
      };
      match self.commit(&key, generation, outcome, may_retry) {
        Commit::Settled(result) => return Some(result),
        Commit::Superseded => {
          debug!(%key, generation, "discarding superseded result");
          return None;
        }
        Commit::Retry(delay) => {
          tokio::time::sleep(delay).await;
          if !self.is_current(&key, generation) {
            debug!(%key, generation, "superseded during backoff");
            return None;
          }
        }
      }
    }
  }

  fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
    self.lock().store.get(key).is_some_and(|entry| {
      entry.generation() == generation && entry.status() == FetchStatus::Fetching
    })
  }

  fn commit(
    &self,
    key: &CacheKey,
    generation: u64,
    outcome: Result<V, FetchError>,
    may_retry: bool,
  ) -> Commit<V> {
    let mut state = self.lock();
    let State { store, registry } = &mut *state;

    let entry = match store.get_mut(key) {
      Some(entry) if entry.generation() == generation && entry.status() == FetchStatus::Fetching => {
        entry
      }
      _ => return Commit::Superseded,
    };

    match outcome {
      Ok(data) => {
        entry.put(data.clone());
        entry.in_flight = None;
        debug!(%key, generation, "fetch succeeded");
        registry.notify(&entry.snapshot());
        Commit::Settled(Ok(data))
      }
      Err(error) if may_retry && self.inner.retry.should_retry(&error, entry.retry_count()) => {
        let attempt = entry.record_retry();
        let delay = self.inner.retry.backoff(attempt);
        warn!(%key, generation, attempt, ?delay, %error, "fetch failed, retrying");
        Commit::Retry(delay)
      }
      Err(error) => {
        entry.mark_error(error.clone());
        entry.in_flight = None;
        warn!(%key, generation, %error, "fetch failed");
        registry.notify(&entry.snapshot());
        if error.is_auth() {
          self.signal_auth(Some(key.clone()), &error);
        }
        Commit::Settled(Err(error))
      }
    }
  }

  /// Wait for a shared fetch. If it was superseded, follow the newest one.
  async fn settle(&self, key: &CacheKey, mut pending: SharedFetch<V>) -> Result<V, FetchError> {
    loop {
      if let Some(result) = pending.await {
        return result;
      }
      pending = match self.follow(key) {
        Ok(next) => next,
        Err(outcome) => return outcome,
      };
    }
  }

  /// After a superseded fetch: the newest in-flight fetch to wait on, or the
  /// entry's settled outcome.
  fn follow(&self, key: &CacheKey) -> Result<SharedFetch<V>, Result<V, FetchError>> {
    let state = self.lock();
    let Some(entry) = state.store.get(key) else {
      return Err(Err(FetchError::transient(format!(
        "{} was removed before its fetch settled",
        key
      ))));
    };
    match (&entry.in_flight, entry.data(), entry.error()) {
      (Some(in_flight), _, _) => Ok(in_flight.result.clone()),
      (None, Some(data), _) => Err(Ok(data.clone())),
      (None, None, Some(error)) => Err(Err(error.clone())),
      (None, None, None) => Err(Err(FetchError::transient(format!(
        "fetch for {} was abandoned",
        key
      )))),
    }
  }

  fn signal_auth(&self, key: Option<CacheKey>, error: &FetchError) {
    // no receivers is fine
    let _ = self.inner.auth_tx.send(AuthSignal {
      key,
      error: error.clone(),
    });
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Write data for `key` directly. Any fetch in flight is superseded and its
  /// result discarded.
  pub fn set_data(&self, key: &CacheKey, data: V) {
    let gc = {
      let mut state = self.lock();
      let State { store, registry } = &mut *state;
      let (entry, created) = store.ensure(key, &QueryOptions::default());
      entry.supersede();
      entry.put(data);
      registry.notify(&entry.snapshot());
      if created {
        store.arm_gc(key)
      } else {
        None
      }
    };

    if let Some((epoch, delay)) = gc {
      self.schedule_gc(key, epoch, delay);
    }
  }

  /// Run a mutation once. On success the invalidation request is processed;
  /// on failure the error is returned as [`FetchError::Mutation`] and the
  /// cache is left untouched.
  pub async fn mutate<R, Fut>(
    &self,
    mutation: Fut,
    invalidates: impl Into<InvalidationRequest>,
  ) -> Result<R, FetchError>
  where
    Fut: Future<Output = Result<R, FetchError>>,
  {
    match mutation.await {
      Ok(result) => {
        self.invalidate(invalidates);
        Ok(result)
      }
      Err(cause) => {
        let error = FetchError::mutation(cause);
        warn!(%error, "mutation failed");
        if error.is_auth() {
          self.signal_auth(None, &error);
        }
        Err(error)
      }
    }
  }

  // ==========================================================================
  // Invalidation
  // ==========================================================================

  /// Mark everything under the given prefixes stale and refetch the observed
  /// entries in the background. Cached data stays visible meanwhile.
  pub fn invalidate(&self, request: impl Into<InvalidationRequest>) -> Invalidated {
    let request = request.into();
    let mut state = self.lock();

    let result = invalidation::mark_stale(&mut state.store, &request);
    for key in &result.refetch {
      self.begin_fetch(&mut state, key);
    }

    info!(
      targets = request.targets().count(),
      stale = result.stale.len(),
      refetching = result.refetch.len(),
      "invalidated"
    );
    result
  }

  /// Drop unobserved entries under the given prefixes outright. Returns the
  /// removed keys.
  pub fn remove(&self, request: impl Into<InvalidationRequest>) -> Vec<CacheKey> {
    let request = request.into();
    let mut state = self.lock();

    let removed: Vec<CacheKey> = invalidation::matching_keys(&state.store, &request)
      .into_iter()
      .filter(|key| state.store.get(key).is_some_and(|e| e.subscriber_count() == 0))
      .collect();
    for key in &removed {
      state.store.remove(key);
    }
    debug!(removed = removed.len(), "removed entries");
    removed
  }

  /// Empty the cache. Every subscription stream ends and results of fetches
  /// still in flight are discarded.
  pub fn reset(&self) {
    let mut state = self.lock();
    let removed = state.store.clear();
    state.registry.clear();
    info!(removed, "cache reset");
  }

  // ==========================================================================
  // Subscriptions
  // ==========================================================================

  /// Observe `key`. The stream starts with the current snapshot.
  ///
  /// If the entry is stale and a fetcher for it is known, a refetch starts.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription<V> {
    let mut state = self.lock();
    let State { store, registry } = &mut *state;
    let entry = store.subscribe(key);
    let refetch = entry.in_flight.is_none() && entry.fetcher.is_some() && entry.is_stale();
    let (id, rx) = registry.register(key, entry.snapshot());

    if refetch {
      self.begin_fetch(&mut state, key);
    }
    Subscription::new(self.clone(), key.clone(), id, rx)
  }

  /// Register `fetcher` for `key` and observe it.
  pub fn observe(&self, key: &CacheKey, fetcher: Fetcher<V>) -> Subscription<V> {
    self.observe_with(key, fetcher, QueryOptions::default())
  }

  pub fn observe_with(
    &self,
    key: &CacheKey,
    fetcher: Fetcher<V>,
    options: QueryOptions,
  ) -> Subscription<V> {
    {
      let mut state = self.lock();
      let (entry, _) = state.store.ensure(key, &options);
      entry.fetcher = Some(fetcher);
    }
    self.subscribe(key)
  }

  pub(crate) fn detach(&self, key: &CacheKey, id: SubscriberId) {
    let gc = {
      let mut state = self.lock();
      if !state.registry.deregister(key, id) {
        // reset already dropped this observer along with its entry
        return;
      }
      state.store.unsubscribe(key)
    };

    if let Some((epoch, delay)) = gc {
      debug!(%key, ?delay, "last subscriber left, gc scheduled");
      self.schedule_gc(key, epoch, delay);
    }
  }

  // ==========================================================================
  // Garbage collection
  // ==========================================================================

  fn schedule_gc(&self, key: &CacheKey, epoch: u64, delay: Duration) {
    let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
    let timer_key = key.clone();

    let timer = self.inner.runtime.spawn(async move {
      let mut delay = delay;
      loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
          return;
        };
        let outcome = QueryClient { inner }.collect_garbage(&timer_key, epoch);
        match outcome {
          GcOutcome::Evicted => {
            info!(key = %timer_key, "evicted unobserved entry");
            return;
          }
          GcOutcome::Deferred(next) => delay = next,
          GcOutcome::Cancelled => return,
        }
      }
    });

    self.lock().store.attach_gc_timer(key, epoch, timer);
  }

  fn collect_garbage(&self, key: &CacheKey, epoch: u64) -> GcOutcome {
    self.lock().store.collect(key, epoch)
  }
}
