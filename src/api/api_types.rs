//! Serde-deserializable types matching the support desk API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use super::error::{Error, FieldErrors};
use super::types::{Ticket, TicketPriority, TicketStatus, User};

/// Responses come either bare or wrapped in `{ "data": ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MaybeWrapped<T> {
  Wrapped { data: T },
  Bare(T),
}

impl<T> MaybeWrapped<T> {
  pub fn into_inner(self) -> T {
    match self {
      MaybeWrapped::Wrapped { data } => data,
      MaybeWrapped::Bare(data) => data,
    }
  }
}

// ============================================================================
// Error body
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub errors: FieldErrors,
}

impl ApiErrorBody {
  /// Map a non-2xx status and its body onto the error taxonomy.
  pub fn into_error(self, status: u16, reason: Option<&str>) -> Error {
    match status {
      401 => Error::Unauthorized,
      422 if !self.errors.is_empty() => Error::ValidationFailed {
        field_errors: self.errors,
      },
      _ => Error::RequestFailed {
        status,
        message: self
          .message
          .filter(|m| !m.is_empty())
          .or_else(|| reason.map(String::from))
          .unwrap_or_else(|| "request failed".to_string()),
      },
    }
  }
}

// ============================================================================
// Tickets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiTicket {
  pub id: u64,
  #[serde(default)]
  pub ticket_id: Option<String>,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  pub status: Option<TicketStatus>,
  pub priority: TicketPriority,
  #[serde(default)]
  pub created_at: String,
}

impl ApiTicket {
  /// Tickets without a status are new, so they are `open`.
  pub fn into_ticket(self) -> Ticket {
    Ticket {
      ticket_id: self.ticket_id.unwrap_or_else(|| format!("#{}", self.id)),
      id: self.id,
      title: self.title,
      description: self.description.unwrap_or_default(),
      status: self.status.unwrap_or_default(),
      priority: self.priority,
      created_at: self.created_at,
    }
  }
}

// ============================================================================
// Auth / profile
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiLoginResponse {
  pub user: User,
  /// Bearer token, when the backend issues one
  #[serde(default)]
  pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiProfileResponse {
  #[serde(default)]
  pub message: String,
  pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChannelAuth {
  pub auth: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_maybe_wrapped_accepts_both_shapes() {
    let wrapped: MaybeWrapped<Vec<u32>> = serde_json::from_str(r#"{"data": [1, 2]}"#).unwrap();
    assert_eq!(wrapped.into_inner(), vec![1, 2]);

    let bare: MaybeWrapped<Vec<u32>> = serde_json::from_str("[3]").unwrap();
    assert_eq!(bare.into_inner(), vec![3]);
  }

  #[test]
  fn test_ticket_without_status_is_open() {
    let api: ApiTicket =
      serde_json::from_str(r#"{"id": 7, "title": "Printer on fire", "priority": "high"}"#).unwrap();
    let ticket = api.into_ticket();
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.ticket_id, "#7");
    assert_eq!(ticket.description, "");
  }

  #[test]
  fn test_error_body_mapping() {
    let body: ApiErrorBody = serde_json::from_str(
      r#"{"message": "The given data was invalid.", "errors": {"title": ["The title field is required."]}}"#,
    )
    .unwrap();
    match body.into_error(422, None) {
      Error::ValidationFailed { field_errors } => {
        assert_eq!(field_errors["title"], vec!["The title field is required."]);
      }
      other => panic!("unexpected error: {other:?}"),
    }

    let body = ApiErrorBody::default();
    assert!(matches!(body.into_error(401, None), Error::Unauthorized));

    let body = ApiErrorBody::default();
    match body.into_error(503, Some("Service Unavailable")) {
      Error::RequestFailed { status, message } => {
        assert_eq!(status, 503);
        assert_eq!(message, "Service Unavailable");
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }
}
