//! Authenticated identity.
//!
//! The session is the single source of the current user. Everything scoped
//! per identity (caches, the realtime channel) observes it through
//! [`Session::identity`] instead of reading storage directly.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::types::{ChangePasswordPayload, UpdateProfilePayload, User};
use crate::api::validate::{validate_login, validate_registration};
use crate::api::{Error, HelpdeskClient, Result};
use crate::cache::SessionStorage;

pub struct Session {
  client: HelpdeskClient,
  storage: Arc<dyn SessionStorage>,
  user: watch::Sender<Option<User>>,
}

impl Session {
  pub fn new(client: HelpdeskClient, storage: Arc<dyn SessionStorage>) -> Self {
    let (user, _) = watch::channel(None);
    Self { client, storage, user }
  }

  pub fn client(&self) -> &HelpdeskClient {
    &self.client
  }

  /// The logged-in user, if known.
  pub fn current(&self) -> Option<User> {
    self.user.borrow().clone()
  }

  pub fn user_id(&self) -> Option<u64> {
    self.user.borrow().as_ref().map(|u| u.id)
  }

  /// Observe identity changes.
  pub fn identity(&self) -> watch::Receiver<Option<User>> {
    self.user.subscribe()
  }

  /// Load the identity persisted by a previous run.
  pub fn restore(&self) -> Result<Option<User>> {
    let Some(persisted) = self.storage.load()? else {
      debug!("no persisted session");
      return Ok(None);
    };
    debug!(user_id = persisted.user.id, saved_at = %persisted.saved_at, "restored session");
    self.client.set_token(persisted.token);
    self.set_user(Some(persisted.user.clone()));
    Ok(Some(persisted.user))
  }

  pub async fn login(&self, email: &str, password: &str, remember: bool) -> Result<User> {
    validate_login(email, password)?;
    let response = self.client.login(email, password, remember).await?;
    info!(user_id = response.user.id, role = %response.user.role, "logged in");
    self.establish(response.user, response.token)
  }

  pub async fn register(&self, name: &str, email: &str, password: &str, confirmation: &str) -> Result<User> {
    validate_registration(name, email, password, confirmation)?;
    let response = self.client.register(name.trim(), email, password).await?;
    info!(user_id = response.user.id, "registered");
    self.establish(response.user, response.token)
  }

  /// End the session on the server and forget it locally.
  ///
  /// A 401 means the server already considers us logged out; any other
  /// failure leaves the session in place.
  pub async fn logout(&self) -> Result<()> {
    match self.client.logout().await {
      Ok(()) => {}
      Err(Error::Unauthorized) => debug!("server session already gone"),
      Err(e) => {
        warn!(error = %e, "logout failed");
        return Err(e);
      }
    }
    self.forget()?;
    info!("logged out");
    Ok(())
  }

  /// Ask the server who we are. A 401 resolves to `None` and drops the
  /// persisted session.
  pub async fn fetch_user(&self) -> Result<Option<User>> {
    match self.client.current_user().await {
      Ok(user) => {
        self.storage.save(&user, self.client.token().as_deref())?;
        self.set_user(Some(user.clone()));
        Ok(Some(user))
      }
      Err(Error::Unauthorized) => {
        debug!("not authenticated");
        self.forget()?;
        Ok(None)
      }
      Err(e) => {
        self.set_user(None);
        Err(e)
      }
    }
  }

  /// True when a user is known locally or the server confirms one.
  pub async fn check_auth(&self) -> bool {
    if self.user.borrow().is_some() {
      return true;
    }
    match self.fetch_user().await {
      Ok(user) => user.is_some(),
      Err(e) => {
        debug!(error = %e, "auth check failed");
        false
      }
    }
  }

  pub async fn update_profile(&self, payload: &UpdateProfilePayload) -> Result<User> {
    payload.validate()?;
    let response = self.client.update_profile(payload).await?;

    let user = match (response.user, self.current()) {
      (Some(user), _) => user,
      (None, Some(mut current)) => {
        current.name = payload.name.trim().to_string();
        current
      }
      (None, None) => return Err(Error::Unauthorized),
    };
    self.storage.save(&user, self.client.token().as_deref())?;
    self.set_user(Some(user.clone()));
    Ok(user)
  }

  pub async fn change_password(&self, payload: &ChangePasswordPayload) -> Result<()> {
    payload.validate()?;
    self.client.change_password(payload).await
  }

  /// Delete the account on the server; the session ends with it.
  pub async fn delete_account(&self) -> Result<()> {
    self.client.delete_account().await?;
    self.forget()?;
    info!("account deleted");
    Ok(())
  }

  fn establish(&self, user: User, token: Option<String>) -> Result<User> {
    if token.is_some() {
      self.client.set_token(token);
    }
    self.storage.save(&user, self.client.token().as_deref())?;
    self.set_user(Some(user.clone()));
    Ok(user)
  }

  fn forget(&self) -> Result<()> {
    self.client.set_token(None);
    self.set_user(None);
    self.storage.clear()
  }

  fn set_user(&self, user: Option<User>) {
    // Only notify observers when the identity actually changes
    self.user.send_if_modified(|current| {
      let changed = current.as_ref().map(|u| u.id) != user.as_ref().map(|u| u.id);
      *current = user;
      changed
    });
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::api::client::tests::{client_for, mount_csrf};
  use crate::api::types::UserRole;
  use crate::cache::SqliteStorage;
  use serde_json::{json, Value};
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  pub(crate) fn user_json(id: u64, role: &str) -> Value {
    json!({
      "id": id,
      "name": format!("User {}", id),
      "email": format!("user{}@example.com", id),
      "role": role,
      "status": "active",
    })
  }

  pub(crate) async fn mount_login(server: &MockServer, id: u64, role: &str) {
    Mock::given(method("POST"))
      .and(path("/api/login"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": user_json(id, role), "token": "t0k" })))
      .mount(server)
      .await;
  }

  fn session(server: &MockServer) -> (Session, Arc<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let session = Session::new(client_for(server), Arc::clone(&storage) as Arc<dyn SessionStorage>);
    (session, storage)
  }

  #[tokio::test]
  async fn test_login_persists_identity() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_login(&server, 4, "support").await;
    let (session, storage) = session(&server);
    let mut identity = session.identity();

    let user = session.login("support@example.com", "secret-pass", false).await.unwrap();

    assert_eq!(user.role, UserRole::Support);
    assert_eq!(session.user_id(), Some(4));
    assert!(identity.has_changed().unwrap());
    assert_eq!(identity.borrow_and_update().as_ref().map(|u| u.id), Some(4));
    assert_eq!(session.client().token().as_deref(), Some("t0k"));

    let persisted = storage.load().unwrap().unwrap();
    assert_eq!(persisted.user.id, 4);
    assert_eq!(persisted.token.as_deref(), Some("t0k"));
  }

  #[tokio::test]
  async fn test_invalid_login_never_reaches_server() {
    let server = MockServer::start().await;
    let (session, _) = session(&server);

    let err = session.login("not-an-email", "short", false).await.unwrap_err();
    let fields = err.field_errors().unwrap();
    assert!(fields.contains_key("email"));
    assert!(fields.contains_key("password"));
    assert!(server.received_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_user_unauthorized_resolves_to_none() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    Mock::given(method("GET"))
      .and(path("/api/user"))
      .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Unauthenticated." })))
      .mount(&server)
      .await;
    let (session, storage) = session(&server);
    storage.save(&serde_json::from_value(user_json(1, "user")).unwrap(), None).unwrap();
    session.restore().unwrap();

    assert_eq!(session.fetch_user().await.unwrap(), None);
    assert_eq!(session.current(), None);
    assert!(storage.load().unwrap().is_none());
    assert!(!session.check_auth().await);
  }

  #[tokio::test]
  async fn test_fetch_user_other_failure_propagates() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    Mock::given(method("GET"))
      .and(path("/api/user"))
      .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "Server Error" })))
      .mount(&server)
      .await;
    let (session, _) = session(&server);

    let err = session.fetch_user().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(session.current(), None);
  }

  #[tokio::test]
  async fn test_check_auth_uses_known_user_without_request() {
    let server = MockServer::start().await;
    let (session, storage) = session(&server);
    storage.save(&serde_json::from_value(user_json(9, "admin")).unwrap(), Some("abc")).unwrap();

    assert_eq!(session.restore().unwrap().map(|u| u.id), Some(9));
    assert!(session.check_auth().await);
    assert_eq!(session.client().token().as_deref(), Some("abc"));
    assert!(server.received_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_login(&server, 2, "user").await;
    Mock::given(method("POST"))
      .and(path("/api/logout"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    let (session, storage) = session(&server);

    session.login("user@example.com", "secret-pass", true).await.unwrap();
    session.logout().await.unwrap();

    assert_eq!(session.current(), None);
    assert_eq!(session.client().token(), None);
    assert!(storage.load().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_logout_keeps_session() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_login(&server, 2, "user").await;
    Mock::given(method("POST"))
      .and(path("/api/logout"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    let (session, storage) = session(&server);

    session.login("user@example.com", "secret-pass", false).await.unwrap();
    assert!(session.logout().await.is_err());
    assert_eq!(session.user_id(), Some(2));
    assert!(storage.load().unwrap().is_some());
  }

  #[tokio::test]
  async fn test_update_profile_keeps_identity() {
    let server = MockServer::start().await;
    mount_csrf(&server).await;
    mount_login(&server, 3, "user").await;
    Mock::given(method("PUT"))
      .and(path("/api/user/profile"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "Profile updated" })))
      .mount(&server)
      .await;
    let (session, storage) = session(&server);
    session.login("user@example.com", "secret-pass", false).await.unwrap();
    let mut identity = session.identity();
    identity.borrow_and_update();

    let user = session
      .update_profile(&UpdateProfilePayload {
        name: "  Renamed  ".to_string(),
      })
      .await
      .unwrap();

    assert_eq!(user.name, "Renamed");
    assert_eq!(session.current().unwrap().name, "Renamed");
    assert_eq!(storage.load().unwrap().unwrap().user.name, "Renamed");
    // Same id, so identity observers are not woken
    assert!(!identity.has_changed().unwrap());
  }
}
