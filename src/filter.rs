//! Ticket list filtering.

use crate::api::types::{Ticket, TicketPriority, TicketStatus};

/// Shown when a filter leaves nothing.
pub const NO_MATCHES: &str = "No tickets found matching your filters.";

/// Status, priority and free-text filter over a ticket list. `None` fields
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
  pub status: Option<TicketStatus>,
  pub priority: Option<TicketPriority>,
  /// Case-insensitive substring of the title or description
  pub search: Option<String>,
}

impl TicketFilter {
  pub fn is_empty(&self) -> bool {
    self.status.is_none() && self.priority.is_none() && self.search_term().is_none()
  }

  pub fn matches(&self, ticket: &Ticket) -> bool {
    if self.status.is_some_and(|s| s != ticket.status) {
      return false;
    }
    if self.priority.is_some_and(|p| p != ticket.priority) {
      return false;
    }
    match self.search_term() {
      Some(term) => {
        ticket.title.to_lowercase().contains(&term) || ticket.description.to_lowercase().contains(&term)
      }
      None => true,
    }
  }

  pub fn apply<'a>(&self, tickets: &'a [Ticket]) -> Vec<&'a Ticket> {
    tickets.iter().filter(|t| self.matches(t)).collect()
  }

  /// The message to show for a filtered list, if any.
  pub fn message(matched: usize) -> Option<&'static str> {
    (matched == 0).then_some(NO_MATCHES)
  }

  fn search_term(&self) -> Option<String> {
    self
      .search
      .as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(str::to_lowercase)
  }
}
