use futures::future::join_all;
use querycache::{
  cache_key, CacheConfig, CacheKey, ErrorClass, FetchError, FetchStatus, Fetcher, QueryClient,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const MINUTE: Duration = Duration::from_secs(60);

/// Returns the call number as data after `latency`, counting calls.
fn counting_fetcher(latency: Duration) -> (Fetcher<u32>, Arc<AtomicU32>) {
  let calls = Arc::new(AtomicU32::new(0));
  let counter = calls.clone();
  let fetcher = Fetcher::new(move |_key| {
    let counter = counter.clone();
    async move {
      let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
      sleep(latency).await;
      Ok::<_, FetchError>(call)
    }
  });
  (fetcher, calls)
}

/// Always fails with `status`, recording when each call happened.
fn failing_fetcher(status: u16) -> (Fetcher<u32>, Arc<Mutex<Vec<Instant>>>) {
  let calls = Arc::new(Mutex::new(Vec::new()));
  let log = calls.clone();
  let fetcher = Fetcher::new(move |key: CacheKey| {
    log.lock().unwrap().push(Instant::now());
    async move { Err::<u32, _>(FetchError::from_status(status, format!("{} failed", key))) }
  });
  (fetcher, calls)
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_marks_prefix_and_leaves_siblings() {
  let client = QueryClient::new(CacheConfig {
    stale_time_ms: 10 * 60 * 1000,
    ..CacheConfig::default()
  });
  let (fetcher, _) = counting_fetcher(Duration::ZERO);

  let keys = [
    cache_key!["families", "detail", "F1"],
    cache_key!["families", "members", "F1"],
    cache_key!["families", "members", "F2"],
    cache_key!["leaderboard", "weekly"],
  ];
  for key in &keys {
    client.request(key, fetcher.clone()).await.unwrap();
    assert!(!client.is_stale(key));
  }

  let result = client.invalidate(cache_key!["families", "members"]);

  assert_eq!(result.stale, vec![keys[1].clone(), keys[2].clone()]);
  assert!(result.refetch.is_empty());
  assert!(!client.is_stale(&keys[0]));
  assert!(client.is_stale(&keys[1]));
  assert!(client.is_stale(&keys[2]));
  assert!(!client.is_stale(&keys[3]));
  // data stays servable
  assert_eq!(client.get_data(&keys[1]), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_fetch_once() {
  let client = QueryClient::new(CacheConfig::default());
  let (fetcher, calls) = counting_fetcher(Duration::from_millis(100));
  let key = cache_key!["families", "detail", "F1"];

  let results = join_all((0..10).map(|_| client.request(&key, fetcher.clone()))).await;

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(results.into_iter().all(|r| r == Ok(1)));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_then_surface() {
  let client = QueryClient::new(CacheConfig::default());
  let (fetcher, calls) = failing_fetcher(503);
  let key = cache_key!["families", "detail", "F1"];

  let err = client.request(&key, fetcher).await.unwrap_err();
  assert_eq!(err.class(), ErrorClass::Transient);

  let calls = calls.lock().unwrap().clone();
  let delays: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
  assert_eq!(
    delays,
    vec![
      Duration::from_millis(1000),
      Duration::from_millis(2000),
      Duration::from_millis(4000)
    ]
  );

  let snapshot = client.snapshot(&key).unwrap();
  assert_eq!(snapshot.status, FetchStatus::Error);
  assert_eq!(snapshot.error, Some(err));
}

#[tokio::test(start_paused = true)]
async fn test_terminal_errors_are_not_retried() {
  let client = QueryClient::new(CacheConfig::default());
  let mut signals = client.auth_signals();

  for (status, class) in [(401, ErrorClass::Auth), (404, ErrorClass::ClientError)] {
    let (fetcher, calls) = failing_fetcher(status);
    let key = cache_key!["status", status as i64];

    let err = client.request(&key, fetcher).await.unwrap_err();
    assert_eq!(err.class(), class);

    sleep(MINUTE).await;
    assert_eq!(calls.lock().unwrap().len(), 1, "status {} was retried", status);
  }

  let signal = signals.try_recv().unwrap();
  assert_eq!(signal.key, Some(cache_key!["status", 401]));
  assert!(signal.error.is_auth());
  assert!(signals.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_is_retried() {
  let client = QueryClient::new(CacheConfig::default());
  let (fetcher, calls) = failing_fetcher(429);

  let err = client.request(&cache_key!["leaderboard"], fetcher).await.unwrap_err();

  assert_eq!(err.class(), ErrorClass::RateLimited);
  assert_eq!(calls.lock().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_newer_generation_wins_over_slow_result() {
  let client = QueryClient::new(CacheConfig::default());
  let key = cache_key!["families", "detail", "F1"];

  // first call is slow, later ones are quick
  let calls = Arc::new(AtomicU32::new(0));
  let counter = calls.clone();
  let fetcher = Fetcher::new(move |_key| {
    let counter = counter.clone();
    async move {
      let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
      let latency = if call == 1 { 1000 } else { 10 };
      sleep(Duration::from_millis(latency)).await;
      Ok::<_, FetchError>(call)
    }
  });

  let mut sub = client.observe(&key, fetcher.clone());
  let waiter = {
    let client = client.clone();
    let key = key.clone();
    let fetcher = fetcher.clone();
    tokio::spawn(async move { client.request(&key, fetcher).await })
  };

  sleep(Duration::from_millis(100)).await;
  let result = client.invalidate(key.clone());
  assert_eq!(result.refetch, vec![key.clone()]);
  assert_eq!(client.generation(&key), Some(2));

  assert_eq!(waiter.await.unwrap(), Ok(2));
  sleep(Duration::from_secs(2)).await;
  assert_eq!(client.get_data(&key), Some(2));

  let statuses: Vec<(FetchStatus, Option<u32>)> = std::iter::from_fn(|| sub.try_next())
    .map(|s| (s.status, s.data))
    .collect();
  assert_eq!(
    statuses,
    vec![
      (FetchStatus::Idle, None),
      (FetchStatus::Fetching, None),
      (FetchStatus::Success, Some(2)),
    ]
  );
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_evicted_after_gc_time() {
  let client = QueryClient::new(CacheConfig::default());
  let (fetcher, _) = counting_fetcher(Duration::ZERO);
  let key = cache_key!["families", "detail", "F1"];

  let sub = client.observe(&key, fetcher);
  sleep(Duration::from_millis(1)).await;
  sub.unsubscribe();

  sleep(5 * MINUTE - Duration::from_secs(1)).await;
  assert!(client.contains(&key));

  sleep(Duration::from_secs(2)).await;
  assert!(!client.contains(&key));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_before_deadline_keeps_entry() {
  let client = QueryClient::new(CacheConfig::default());
  let (fetcher, calls) = counting_fetcher(Duration::ZERO);
  let key = cache_key!["families", "detail", "F1"];

  drop(client.observe(&key, fetcher.clone()));
  sleep(4 * MINUTE).await;

  let _sub = client.subscribe(&key);
  sleep(10 * MINUTE).await;

  assert!(client.contains(&key));
  assert_eq!(client.subscriber_count(&key), 1);
  // the stale entry refetched on resubscribe
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_family_detail_staleness_over_minutes() {
  let config = CacheConfig::default().with_key_class(
    cache_key!["families", "detail"],
    Some(5 * MINUTE),
    Some(30 * MINUTE),
  );
  let client = QueryClient::new(config);
  let (fetcher, calls) = counting_fetcher(Duration::from_millis(50));
  let key = cache_key!["families", "detail", "F1"];

  assert_eq!(client.request(&key, fetcher.clone()).await, Ok(1));
  let fetched = Instant::now();

  sleep_until_offset(fetched, 4 * MINUTE).await;
  assert_eq!(client.request(&key, fetcher.clone()).await, Ok(1));
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  sleep_until_offset(fetched, 6 * MINUTE).await;
  let started = Instant::now();
  assert_eq!(client.request(&key, fetcher.clone()).await, Ok(1));
  assert_eq!(started.elapsed(), Duration::ZERO);
  assert_eq!(client.snapshot(&key).unwrap().status, FetchStatus::Fetching);

  sleep(Duration::from_millis(100)).await;
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert_eq!(client.get_data(&key), Some(2));
  assert!(!client.is_stale(&key));
}

async fn sleep_until_offset(origin: Instant, offset: Duration) {
  tokio::time::sleep_until(origin + offset).await;
}

#[tokio::test(start_paused = true)]
async fn test_kick_member_refreshes_subscribed_members() {
  let client: QueryClient<Vec<String>> = QueryClient::new(CacheConfig::default());
  let members = Arc::new(Mutex::new(vec![
    "P1".to_string(),
    "P4".to_string(),
    "P9".to_string(),
  ]));

  let backend = members.clone();
  let fetcher = Fetcher::new(move |_key| {
    let backend = backend.clone();
    async move {
      sleep(Duration::from_millis(20)).await;
      Ok::<_, FetchError>(backend.lock().unwrap().clone())
    }
  });

  let members_key = cache_key!["families", "members", "F1"];
  let detail_key = cache_key!["families", "detail", "F1"];
  client.request(&detail_key, fetcher.clone()).await.unwrap();

  let mut sub = client.observe(&members_key, fetcher.clone());
  let initial: Vec<FetchStatus> = vec![
    sub.next().await.unwrap().status,
    sub.next().await.unwrap().status,
    sub.next().await.unwrap().status,
  ];
  assert_eq!(
    initial,
    vec![FetchStatus::Idle, FetchStatus::Fetching, FetchStatus::Success]
  );

  let backend = members.clone();
  let kick = async move {
    sleep(Duration::from_millis(20)).await;
    backend.lock().unwrap().retain(|p| p != "P9");
    Ok::<_, FetchError>(())
  };
  client
    .mutate(kick, [members_key.clone(), detail_key.clone()])
    .await
    .unwrap();

  assert!(client.is_stale(&members_key));
  assert!(client.is_stale(&detail_key));

  let fetching = sub.next().await.unwrap();
  assert_eq!(fetching.status, FetchStatus::Fetching);
  assert_eq!(
    fetching.data,
    Some(vec!["P1".to_string(), "P4".to_string(), "P9".to_string()])
  );

  let success = sub.next().await.unwrap();
  assert_eq!(success.status, FetchStatus::Success);
  assert_eq!(success.data, Some(vec!["P1".to_string(), "P4".to_string()]));
  assert!(!success.is_stale);
  // nobody observes the detail, so it waits for its next request
  assert!(client.is_stale(&detail_key));
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_leaves_cache_untouched() {
  let client = QueryClient::new(CacheConfig {
    stale_time_ms: 60 * 1000,
    ..CacheConfig::default()
  });
  let (fetcher, calls) = counting_fetcher(Duration::ZERO);
  let key = cache_key!["families", "members", "F1"];
  client.request(&key, fetcher).await.unwrap();

  let err = client
    .mutate(
      async { Err::<(), _>(FetchError::from_status(503, "unavailable")) },
      key.clone(),
    )
    .await
    .unwrap_err();

  assert_eq!(err.class(), ErrorClass::MutationError);
  assert!(!client.is_stale(&key));
  sleep(MINUTE / 2).await;
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_reads_never_wait_on_failing_refetch() {
  let client = QueryClient::new(CacheConfig {
    stale_time_ms: 60 * 1000,
    ..CacheConfig::default()
  });
  let key = cache_key!["families", "detail", "F1"];
  let (fetcher, _) = counting_fetcher(Duration::ZERO);
  assert_eq!(client.request(&key, fetcher).await, Ok(1));

  sleep(2 * MINUTE).await;
  let (failing, calls) = failing_fetcher(503);

  for _ in 0..2 {
    let started = Instant::now();
    assert_eq!(client.request(&key, failing.clone()).await, Ok(1));
    assert_eq!(started.elapsed(), Duration::ZERO);
  }
  assert_eq!(client.snapshot(&key).unwrap().status, FetchStatus::Fetching);

  sleep(Duration::from_secs(10)).await;
  assert_eq!(calls.lock().unwrap().len(), 4);
  let snapshot = client.snapshot(&key).unwrap();
  assert_eq!(snapshot.status, FetchStatus::Error);
  assert_eq!(snapshot.data, Some(1));
  assert_eq!(client.request(&key, failing).await, Ok(1));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_mid_fetch_discards_pre_mutation_read() {
  let client = QueryClient::new(CacheConfig {
    stale_time_ms: 60 * 1000,
    ..CacheConfig::default()
  });
  let key = cache_key!["families", "members", "F1"];

  let backend = Arc::new(AtomicU32::new(1));
  let calls = Arc::new(AtomicU32::new(0));
  let fetcher = {
    let backend = backend.clone();
    let calls = calls.clone();
    Fetcher::new(move |_key| {
      calls.fetch_add(1, Ordering::SeqCst);
      let value = backend.load(Ordering::SeqCst);
      async move {
        sleep(Duration::from_millis(100)).await;
        Ok::<_, FetchError>(value)
      }
    })
  };

  client.prefetch(&key, fetcher.clone());
  sleep(Duration::from_millis(10)).await;
  backend.store(2, Ordering::SeqCst);
  let result = client.invalidate(key.clone());
  assert_eq!(result.refetch, vec![key.clone()]);

  sleep(Duration::from_millis(200)).await;
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert_eq!(client.get_data(&key), Some(2));
  assert!(!client.is_stale(&key));
  assert_eq!(client.request(&key, fetcher).await, Ok(2));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetcher_settles_entry() {
  let client = QueryClient::new(CacheConfig::default());
  let key = cache_key!["families", "detail", "F1"];

  let calls = Arc::new(AtomicU32::new(0));
  let fetcher = {
    let calls = calls.clone();
    Fetcher::new(move |_key| {
      let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        if call == 1 {
          panic!("backend exploded");
        }
        Ok::<_, FetchError>(call)
      }
    })
  };

  let err = client.request(&key, fetcher.clone()).await.unwrap_err();
  assert_eq!(err.class(), ErrorClass::Transient);
  assert_eq!(client.snapshot(&key).unwrap().status, FetchStatus::Error);

  sleep(MINUTE).await;
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(client.request(&key, fetcher).await, Ok(2));
}

#[tokio::test(start_paused = true)]
async fn test_panicked_entry_is_collected() {
  let client = QueryClient::new(CacheConfig::default());
  let key = cache_key!["families", "detail", "F1"];
  let fetcher = Fetcher::new(|_key| async {
    if true {
      panic!("backend exploded");
    }
    Ok::<u32, FetchError>(0)
  });

  assert!(client.request(&key, fetcher).await.is_err());
  sleep(6 * MINUTE).await;
  assert!(!client.contains(&key));
}
