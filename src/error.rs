//! Closed error taxonomy for fetches and mutations.
//!
//! Errors from the remote collaborator are classified once, where they are
//! first inspected. Retry and surfacing logic only ever match on these variants.

use thiserror::Error;

/// A classified fetch or mutation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The session is invalid. Never retried.
  #[error("authentication failed: {message}")]
  Auth { message: String },

  /// 4xx other than 429: the request itself is wrong. Never retried.
  #[error("client error: {message}")]
  Client { status: Option<u16>, message: String },

  /// 429: retried with backoff.
  #[error("rate limited: {message}")]
  RateLimited { message: String },

  /// Network failure, timeout or 5xx: retried with backoff.
  #[error("transient failure: {message}")]
  Transient { message: String },

  /// A mutation failed. Mutations are never retried, whatever the cause.
  #[error("mutation failed: {source}")]
  Mutation { source: Box<FetchError> },
}

/// The retry-relevant class of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  Auth,
  ClientError,
  RateLimited,
  Transient,
  MutationError,
}

impl ErrorClass {
  /// Whether this class of failure may be retried at all.
  pub fn is_retryable(self) -> bool {
    matches!(self, ErrorClass::RateLimited | ErrorClass::Transient)
  }
}

impl FetchError {
  pub fn auth(message: impl Into<String>) -> Self {
    Self::Auth {
      message: message.into(),
    }
  }

  pub fn client(message: impl Into<String>) -> Self {
    Self::Client {
      status: None,
      message: message.into(),
    }
  }

  pub fn rate_limited(message: impl Into<String>) -> Self {
    Self::RateLimited {
      message: message.into(),
    }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  /// Wrap the failure of a mutation collaborator. Already-wrapped errors are kept as is.
  pub fn mutation(cause: FetchError) -> Self {
    match cause {
      Self::Mutation { .. } => cause,
      other => Self::Mutation {
        source: Box::new(other),
      },
    }
  }

  /// Classify an HTTP status code.
  ///
  /// 401 is an auth failure, 408 and 5xx are transient, 429 is rate limiting and
  /// any other 4xx is a client error. Anything else reaching here is unexpected
  /// and treated as transient.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 => Self::Auth { message },
      408 => Self::Transient { message },
      429 => Self::RateLimited { message },
      400..=499 => Self::Client {
        status: Some(status),
        message,
      },
      _ => Self::Transient { message },
    }
  }

  pub fn class(&self) -> ErrorClass {
    match self {
      Self::Auth { .. } => ErrorClass::Auth,
      Self::Client { .. } => ErrorClass::ClientError,
      Self::RateLimited { .. } => ErrorClass::RateLimited,
      Self::Transient { .. } => ErrorClass::Transient,
      Self::Mutation { .. } => ErrorClass::MutationError,
    }
  }

  /// True for auth failures, including a mutation that failed on auth.
  pub fn is_auth(&self) -> bool {
    match self {
      Self::Auth { .. } => true,
      Self::Mutation { source } => source.is_auth(),
      _ => false,
    }
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    let message = err.to_string();

    if err.is_timeout() || err.is_connect() {
      return Self::Transient { message };
    }

    if let Some(status) = err.status() {
      return Self::from_status(status.as_u16(), message);
    }

    if err.is_decode() || err.is_builder() {
      return Self::Client {
        status: None,
        message,
      };
    }

    Self::Transient { message }
  }
}
