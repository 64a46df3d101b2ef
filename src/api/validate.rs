//! Client-side payload checks, run before anything is sent.
//!
//! Failures use the same `ValidationFailed` shape as a server 422 so callers
//! render both the same way.

use regex::Regex;
use std::sync::LazyLock;

use super::error::{Error, Result};
use super::types::{ChangePasswordPayload, CreateTicketPayload, CreateUserPayload, UpdateProfilePayload};

const MIN_TITLE_LEN: usize = 5;
const MIN_NAME_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 8;

/// Collects `(field, message)` pairs and turns them into a result.
#[derive(Default)]
struct Checks(Vec<(&'static str, &'static str)>);

impl Checks {
  fn fail(&mut self, field: &'static str, message: &'static str) {
    self.0.push((field, message));
  }

  fn finish(self) -> Result<()> {
    if self.0.is_empty() {
      Ok(())
    } else {
      Err(Error::validation(self.0))
    }
  }

  fn name(&mut self, name: &str) {
    let name = name.trim();
    if name.is_empty() {
      self.fail("name", "Name is required.");
    } else if name.chars().count() < MIN_NAME_LEN {
      self.fail("name", "Name must be at least 2 characters long.");
    }
  }

  fn email(&mut self, email: &str) {
    if email.is_empty() {
      self.fail("email", "Email is required.");
    } else if !is_valid_email(email) {
      self.fail("email", "Enter a valid email address.");
    }
  }

  fn password(&mut self, field: &'static str, password: &str) {
    if password.is_empty() {
      self.fail(field, "Password is required.");
    } else if password.chars().count() < MIN_PASSWORD_LEN {
      self.fail(field, "Password must be at least 8 characters long.");
    }
  }

  fn confirmation(&mut self, field: &'static str, password: &str, confirmation: &str) {
    if confirmation.is_empty() {
      self.fail(field, "Please confirm your password.");
    } else if confirmation != password {
      self.fail(field, "Passwords do not match.");
    }
  }
}

/// Loose `something@something.something` with no whitespace anywhere.
static EMAIL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").ok());

pub fn is_valid_email(email: &str) -> bool {
  EMAIL.as_ref().is_some_and(|re| re.is_match(email))
}

impl CreateTicketPayload {
  pub fn validate(&self) -> Result<()> {
    let mut checks = Checks::default();

    let title = self.title.trim();
    if title.is_empty() {
      checks.fail("title", "Title is required.");
    } else if title.chars().count() < MIN_TITLE_LEN {
      checks.fail("title", "Title must be at least 5 characters.");
    }

    if self.description.trim().is_empty() {
      checks.fail("description", "Description is required.");
    }

    if self.priority.is_none() {
      checks.fail("priority", "Priority is required.");
    }

    checks.finish()
  }
}

impl CreateUserPayload {
  pub fn validate(&self) -> Result<()> {
    let mut checks = Checks::default();
    checks.name(&self.name);
    checks.email(&self.email);
    if self.role.is_none() {
      checks.fail("role", "Role is required.");
    }
    checks.password("password", &self.password);
    checks.confirmation("password_confirmation", &self.password, &self.password_confirmation);
    checks.finish()
  }
}

impl UpdateProfilePayload {
  pub fn validate(&self) -> Result<()> {
    let mut checks = Checks::default();
    checks.name(&self.name);
    checks.finish()
  }
}

impl ChangePasswordPayload {
  pub fn validate(&self) -> Result<()> {
    let mut checks = Checks::default();
    checks.password("current_password", &self.current_password);
    checks.password("new_password", &self.new_password);
    if !self.new_password.is_empty() && self.new_password == self.current_password {
      checks.fail(
        "new_password",
        "New password must be different from current password.",
      );
    }
    checks.confirmation(
      "new_password_confirmation",
      &self.new_password,
      &self.new_password_confirmation,
    );
    checks.finish()
  }
}

/// Checks for the login form.
pub fn validate_login(email: &str, password: &str) -> Result<()> {
  let mut checks = Checks::default();
  checks.email(email);
  checks.password("password", password);
  checks.finish()
}

/// Checks for the registration form.
pub fn validate_registration(name: &str, email: &str, password: &str, confirmation: &str) -> Result<()> {
  let mut checks = Checks::default();
  checks.name(name);
  checks.email(email);
  checks.password("password", password);
  checks.confirmation("password_confirmation", password, confirmation);
  checks.finish()
}
