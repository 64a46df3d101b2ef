//! Error taxonomy shared by the HTTP client, the cache containers and the
//! realtime channel.
//!
//! Errors are `Clone` so a single in-flight request can hand the same
//! failure to every caller that joined it.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Field name to the messages reported for it (server 422 or client-side checks).
pub type FieldErrors = BTreeMap<String, Vec<String>>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// Non-2xx response other than 401 and 422.
  #[error("request failed ({status}): {message}")]
  RequestFailed { status: u16, message: String },

  /// 401. Auth-check paths turn this into "no user" instead of failing.
  #[error("not authenticated")]
  Unauthorized,

  /// 422 from the server, or a payload rejected before it was sent.
  #[error("validation failed: {}", summarize(.field_errors))]
  ValidationFailed { field_errors: FieldErrors },

  /// Realtime subscription fault. Logged, never fatal.
  #[error("realtime channel error: {0}")]
  ChannelError(String),

  #[error("http error: {0}")]
  Http(Arc<reqwest::Error>),

  #[error("failed to decode response: {0}")]
  Decode(Arc<serde_json::Error>),

  #[error("invalid url: {0}")]
  Url(#[from] url::ParseError),

  #[error("session storage error: {0}")]
  Storage(Arc<rusqlite::Error>),

  /// A background fetch task panicked or was aborted before it produced a result.
  #[error("background task failed: {0}")]
  Task(String),
}

impl Error {
  /// Build a `ValidationFailed` from `(field, message)` pairs.
  pub fn validation<I, K, V>(errors: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let mut field_errors = FieldErrors::new();
    for (field, message) in errors {
      field_errors
        .entry(field.into())
        .or_default()
        .push(message.into());
    }
    Error::ValidationFailed { field_errors }
  }

  /// Field errors when this is a validation failure.
  pub fn field_errors(&self) -> Option<&FieldErrors> {
    match self {
      Error::ValidationFailed { field_errors } => Some(field_errors),
      _ => None,
    }
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Error::RequestFailed { status, .. } => Some(*status),
      Error::Unauthorized => Some(401),
      Error::ValidationFailed { .. } => Some(422),
      Error::Http(e) => e.status().map(|s| s.as_u16()),
      _ => None,
    }
  }
}

fn summarize(field_errors: &FieldErrors) -> String {
  field_errors
    .iter()
    .map(|(field, messages)| format!("{}: {}", field, messages.join(" ")))
    .collect::<Vec<_>>()
    .join("; ")
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Error::Http(Arc::new(e))
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Decode(Arc::new(e))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(Arc::new(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_validation_groups_messages_by_field() {
    let err = Error::validation([
      ("title", "Title is required."),
      ("priority", "Priority is required."),
      ("title", "Title must be at least 5 characters."),
    ]);

    let fields = err.field_errors().unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields["title"].len(), 2);
    assert_eq!(err.status(), Some(422));
  }

  #[test]
  fn test_display_request_failed() {
    let err = Error::RequestFailed {
      status: 500,
      message: "Server Error".to_string(),
    };
    assert_eq!(err.to_string(), "request failed (500): Server Error");
  }

  #[test]
  fn test_display_validation_summary() {
    let err = Error::validation([("email", "Enter a valid email address.")]);
    assert_eq!(
      err.to_string(),
      "validation failed: email: Enter a valid email address."
    );
  }
}
