//! Client-side query cache.
//!
//! Decouples what data a view needs, and how fresh it must be, from how and
//! when it is fetched:
//! - Hierarchical keys with prefix invalidation
//! - Stale-while-revalidate reads with per key-class freshness windows
//! - Single-flight fetching with generation tokens against out-of-order results
//! - Classified errors with exponential backoff for the transient ones
//! - Subscription streams and garbage collection of unobserved entries

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod invalidation;
pub mod key;
pub mod logging;
pub mod retry;
pub mod store;
pub mod subscription;
mod trie;

pub use client::{AuthSignal, QueryClient};
pub use config::{CacheConfig, Config, KeyClass, LogFormat, LoggingConfig};
pub use error::{ErrorClass, FetchError};
pub use fetch::Fetcher;
pub use invalidation::{Invalidated, InvalidationRequest};
pub use key::{CacheKey, Segment};
pub use retry::RetryPolicy;
pub use store::{CacheEntry, CacheStore, FetchStatus, GcOutcome, QueryOptions};
pub use subscription::{QuerySnapshot, Subscription};
