//! Hierarchical cache keys.
//!
//! A key is an ordered list of segments such as `["families", "detail", "F1"]`.
//! Keys compare segment by segment, and a key is a prefix of every key that
//! extends it, which is what invalidation walks on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single component of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
  Num(i64),
  Str(String),
}

impl From<&str> for Segment {
  fn from(value: &str) -> Self {
    Segment::Str(value.to_string())
  }
}

impl From<String> for Segment {
  fn from(value: String) -> Self {
    Segment::Str(value)
  }
}

impl From<&String> for Segment {
  fn from(value: &String) -> Self {
    Segment::Str(value.clone())
  }
}

impl From<i64> for Segment {
  fn from(value: i64) -> Self {
    Segment::Num(value)
  }
}

impl From<i32> for Segment {
  fn from(value: i32) -> Self {
    Segment::Num(i64::from(value))
  }
}

impl From<u32> for Segment {
  fn from(value: u32) -> Self {
    Segment::Num(i64::from(value))
  }
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Num(n) => write!(f, "{}", n),
      Segment::Str(s) => write!(f, "{:?}", s),
    }
  }
}

/// Canonical identifier for a cached resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<Segment>);

impl CacheKey {
  /// Build a key from its segments, in order.
  pub fn build<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<Segment>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True when `self` is a leading subsequence of `other`. A key is a prefix of itself.
  pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
    other.0.starts_with(&self.0)
  }

  /// Extend the key with one more segment.
  pub fn child(mut self, segment: impl Into<Segment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// Append a digest of an unordered parameter set as the final segment.
  ///
  /// Params are serialized to JSON with object keys sorted, so two param sets
  /// that differ only in field or map ordering produce the same key. Sets held
  /// in sequences should use an ordered collection (e.g. `BTreeSet`).
  ///
  /// # Panics
  ///
  /// Panics if `params` cannot be represented as JSON (for example a map with
  /// non-string keys). That is a bug at the call site, not a runtime condition.
  pub fn with_params<P: Serialize + ?Sized>(self, params: &P) -> Self {
    let digest = params_digest(params);
    self.child(digest)
  }
}

impl From<Vec<Segment>> for CacheKey {
  fn from(segments: Vec<Segment>) -> Self {
    Self(segments)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", segment)?;
    }
    write!(f, "]")
  }
}

/// Hex-encoded SHA-256 of the canonical JSON form of `params`.
fn params_digest<P: Serialize + ?Sized>(params: &P) -> String {
  // serde_json::Map is a BTreeMap here, so re-serializing a Value sorts object keys
  let value = serde_json::to_value(params)
    .unwrap_or_else(|e| panic!("cache key params are not serializable: {}", e));
  let canonical = value.to_string();

  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

/// Build a [`CacheKey`] from a list of segments of mixed types.
///
/// ```ignore
/// let key = cache_key!["families", "detail", family_id];
/// ```
#[macro_export]
macro_rules! cache_key {
  ($($segment:expr),* $(,)?) => {
    $crate::CacheKey::from(vec![$($crate::Segment::from($segment)),*])
  };
}
