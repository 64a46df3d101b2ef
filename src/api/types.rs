use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Tickets
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
  #[default]
  Open,
  InProgress,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
  Low,
  Medium,
  High,
}

/// A support ticket as listed and cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
  pub id: u64,
  /// Human-facing reference (e.g. "TCK-0012")
  pub ticket_id: String,
  pub title: String,
  pub description: String,
  pub status: TicketStatus,
  pub priority: TicketPriority,
  pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateTicketPayload {
  pub title: String,
  pub description: String,
  pub priority: Option<TicketPriority>,
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
  #[default]
  User,
  Support,
  Admin,
}

impl UserRole {
  /// Landing area a role is sent to after login.
  pub fn home(&self) -> &'static str {
    match self {
      UserRole::Admin => "/admin/dashboard",
      UserRole::Support => "/support/dashboard",
      UserRole::User => "/user",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
  #[default]
  Active,
  Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub name: String,
  pub email: String,
  #[serde(default)]
  pub role: UserRole,
  #[serde(default)]
  pub status: UserStatus,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateUserPayload {
  pub name: String,
  pub email: String,
  pub role: Option<UserRole>,
  pub status: UserStatus,
  pub password: String,
  #[serde(skip)]
  pub password_confirmation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateUserPayload {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub role: Option<UserRole>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<UserStatus>,
}

// ============================================================================
// Profile
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateProfilePayload {
  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangePasswordPayload {
  pub current_password: String,
  pub new_password: String,
  pub new_password_confirmation: String,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  pub message: String,
  #[serde(default)]
  pub role: UserRole,
  #[serde(default)]
  pub read: bool,
  #[serde(default)]
  pub created_at: String,
  /// Server-rendered relative time ("2m ago"), when provided
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time: Option<String>,
}

/// Notification ids arrive as integers from the REST API and as strings from
/// some broadcasters; both are kept as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Str(String),
    Num(i64),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Str(s) => s,
    Id::Num(n) => n.to_string(),
  })
}

// ============================================================================
// Dashboard
// ============================================================================

/// Aggregate counters shown on the dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dashboard {
  pub total_users: u64,
  pub total_support: u64,
  pub total_tickets: u64,
  pub new_tickets_today: u64,
  pub active_tickets_today: u64,
  pub resolved_tickets_today: u64,
  pub users_change: f64,
  pub tickets_change: f64,
  pub support_change: f64,
  pub new_change: f64,
  pub active_change: f64,
  pub resolved_change: f64,
  pub pending: u64,
  pub in_progress: u64,
  pub resolved: u64,
  pub active: u64,
  pub completed: u64,
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for TicketStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      TicketStatus::Open => "open",
      TicketStatus::InProgress => "in_progress",
      TicketStatus::Closed => "closed",
    })
  }
}

impl fmt::Display for TicketPriority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      TicketPriority::Low => "low",
      TicketPriority::Medium => "medium",
      TicketPriority::High => "high",
    })
  }
}

impl fmt::Display for UserRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      UserRole::User => "user",
      UserRole::Support => "support",
      UserRole::Admin => "admin",
    })
  }
}

impl fmt::Display for UserStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      UserStatus::Active => "active",
      UserStatus::Inactive => "inactive",
    })
  }
}

// ============================================================================
// Parsing (command-line values)
// ============================================================================

impl FromStr for TicketStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().replace('-', "_").as_str() {
      "open" => Ok(TicketStatus::Open),
      "in_progress" => Ok(TicketStatus::InProgress),
      "closed" => Ok(TicketStatus::Closed),
      other => Err(format!("unknown status '{}' (open, in_progress, closed)", other)),
    }
  }
}

impl FromStr for TicketPriority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "low" => Ok(TicketPriority::Low),
      "medium" => Ok(TicketPriority::Medium),
      "high" => Ok(TicketPriority::High),
      other => Err(format!("unknown priority '{}' (low, medium, high)", other)),
    }
  }
}

impl FromStr for UserRole {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "user" => Ok(UserRole::User),
      "support" => Ok(UserRole::Support),
      "admin" => Ok(UserRole::Admin),
      other => Err(format!("unknown role '{}' (user, support, admin)", other)),
    }
  }
}

impl FromStr for UserStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "active" => Ok(UserStatus::Active),
      "inactive" => Ok(UserStatus::Inactive),
      other => Err(format!("unknown status '{}' (active, inactive)", other)),
    }
  }
}
