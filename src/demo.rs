//! In-memory stand-in for the remote API and the scripted scenarios the CLI runs.

use color_eyre::{eyre::eyre, Result};
use querycache::{
  cache_key, CacheKey, FetchError, FetchStatus, Fetcher, QueryClient, QueryOptions, QuerySnapshot,
  Segment,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct Family {
  pub id: String,
  pub name: String,
  pub members: Vec<String>,
}

/// Fake families backend with configurable latency and injectable failures.
pub struct FamiliesApi {
  families: Mutex<BTreeMap<String, Family>>,
  failures: Mutex<VecDeque<FetchError>>,
  latency: Duration,
  calls: AtomicUsize,
}

impl FamiliesApi {
  pub fn new(latency: Duration) -> Arc<Self> {
    let mut families = BTreeMap::new();
    families.insert(
      "F1".to_string(),
      Family {
        id: "F1".to_string(),
        name: "Night Owls".to_string(),
        members: vec!["P1".to_string(), "P4".to_string(), "P9".to_string()],
      },
    );
    families.insert(
      "F2".to_string(),
      Family {
        id: "F2".to_string(),
        name: "Early Birds".to_string(),
        members: vec!["P2".to_string()],
      },
    );

    Arc::new(Self {
      families: Mutex::new(families),
      failures: Mutex::new(VecDeque::new()),
      latency,
      calls: AtomicUsize::new(0),
    })
  }

  /// Make the next calls fail with these errors, in order.
  pub fn fail_next(&self, errors: impl IntoIterator<Item = FetchError>) {
    if let Ok(mut failures) = self.failures.lock() {
      failures.extend(errors);
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn take_failure(&self) -> Option<FetchError> {
    self.failures.lock().ok()?.pop_front()
  }

  fn family(&self, id: &str) -> Result<Family, FetchError> {
    let families = self
      .families
      .lock()
      .map_err(|_| FetchError::transient("backend unavailable"))?;
    families
      .get(id)
      .cloned()
      .ok_or_else(|| FetchError::from_status(404, format!("family {} not found", id)))
  }

  async fn load(&self, key: &CacheKey) -> Result<Value, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.latency).await;
    if let Some(error) = self.take_failure() {
      return Err(error);
    }

    match key.segments() {
      [Segment::Str(ns), Segment::Str(kind), Segment::Str(id)] if ns == "families" => {
        let family = self.family(id)?;
        match kind.as_str() {
          "detail" => Ok(json!({ "id": family.id, "name": family.name, "size": family.members.len() })),
          "members" => Ok(json!(family.members)),
          _ => Err(FetchError::from_status(404, format!("no resource for {}", key))),
        }
      }
      _ => Err(FetchError::from_status(404, format!("no resource for {}", key))),
    }
  }

  pub fn fetcher(self: &Arc<Self>) -> Fetcher<Value> {
    let api = Arc::clone(self);
    Fetcher::new(move |key| {
      let api = api.clone();
      async move { api.load(&key).await }
    })
  }

  pub async fn kick_member(&self, family_id: &str, player_id: &str) -> Result<(), FetchError> {
    tokio::time::sleep(self.latency).await;
    let mut families = self
      .families
      .lock()
      .map_err(|_| FetchError::transient("backend unavailable"))?;
    let family = families
      .get_mut(family_id)
      .ok_or_else(|| FetchError::from_status(404, format!("family {} not found", family_id)))?;

    let before = family.members.len();
    family.members.retain(|member| member != player_id);
    if family.members.len() == before {
      return Err(FetchError::from_status(
        409,
        format!("{} is not in family {}", player_id, family_id),
      ));
    }
    Ok(())
  }
}

fn detail_key(family_id: &str) -> CacheKey {
  cache_key!["families", "detail", family_id]
}

fn members_key(family_id: &str) -> CacheKey {
  cache_key!["families", "members", family_id]
}

fn describe(snapshot: &QuerySnapshot<Value>) -> String {
  let data = snapshot
    .data
    .as_ref()
    .map_or_else(|| "-".to_string(), Value::to_string);
  match &snapshot.error {
    Some(error) => format!("{} {:?} data={} error={}", snapshot.key, snapshot.status, data, error),
    None => format!("{} {:?} data={} stale={}", snapshot.key, snapshot.status, data, snapshot.is_stale),
  }
}

/// Fresh reads hit the cache, stale reads serve cached data and refetch.
pub async fn staleness(client: &QueryClient<Value>, api: &Arc<FamiliesApi>, stale: Duration) -> Result<()> {
  let key = detail_key("F1");
  let options = QueryOptions::default().stale_time(stale);

  let first = client.request_with(&key, api.fetcher(), options).await?;
  println!("initial fetch: {} (calls: {})", first, api.calls());

  tokio::time::sleep(stale * 4 / 5).await;
  let fresh = client.request_with(&key, api.fetcher(), options).await?;
  println!("within stale time: {} (calls: {})", fresh, api.calls());

  tokio::time::sleep(stale * 2 / 5).await;
  let stale_read = client.request_with(&key, api.fetcher(), options).await?;
  let status = client.snapshot(&key).map(|s| s.status);
  println!(
    "past stale time: {} served immediately, status {:?} (calls: {})",
    stale_read,
    status,
    api.calls()
  );

  tokio::time::sleep(api.latency * 2).await;
  if let Some(snapshot) = client.snapshot(&key) {
    println!("after background refetch: {}", describe(&snapshot));
  }
  Ok(())
}

/// A membership change invalidates every view derived from the family.
pub async fn kick(
  client: &QueryClient<Value>,
  api: &Arc<FamiliesApi>,
  family_id: &str,
  player_id: &str,
) -> Result<()> {
  let mut members = client.observe(&members_key(family_id), api.fetcher());
  let mut detail = client.observe(&detail_key(family_id), api.fetcher());

  // idle, fetching, success for each
  for sub in [&mut members, &mut detail] {
    while let Some(snapshot) = sub.next().await {
      println!("  {}", describe(&snapshot));
      if !matches!(snapshot.status, FetchStatus::Idle | FetchStatus::Fetching) {
        break;
      }
    }
  }

  println!("kicking {} from {}", player_id, family_id);
  let invalidates = [members_key(family_id), detail_key(family_id)];
  client
    .mutate(api.kick_member(family_id, player_id), invalidates)
    .await?;

  for sub in [&mut members, &mut detail] {
    for _ in 0..2 {
      match sub.next().await {
        Some(snapshot) => println!("  {}", describe(&snapshot)),
        None => return Err(eyre!("subscription closed before refetch finished")),
      }
    }
  }
  Ok(())
}

/// Transient failures are retried with backoff before the result appears.
pub async fn retry(client: &QueryClient<Value>, api: &Arc<FamiliesApi>, failures: usize) -> Result<()> {
  api.fail_next((0..failures).map(|i| FetchError::from_status(503, format!("outage #{}", i + 1))));
  let key = members_key("F2");

  let started = Instant::now();
  let result = client.request(&key, api.fetcher()).await;
  info!(elapsed = ?started.elapsed(), calls = api.calls(), "request settled");

  match result {
    Ok(data) => println!("got {} after {:?} and {} calls", data, started.elapsed(), api.calls()),
    Err(error) => println!("surfaced {} after {:?} and {} calls", error, started.elapsed(), api.calls()),
  }
  Ok(())
}
