use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::config::ApiConfig;

use super::api_types::{
  ApiChannelAuth, ApiErrorBody, ApiLoginResponse, ApiProfileResponse, ApiTicket, MaybeWrapped,
};
use super::error::Result;
use super::types::{
  ChangePasswordPayload, CreateTicketPayload, CreateUserPayload, Dashboard, Notification, Ticket,
  TicketStatus, UpdateProfilePayload, UpdateUserPayload, User, UserStatus,
};

const CSRF_ENDPOINT: &str = "sanctum/csrf-cookie";
const CSRF_COOKIE: &str = "XSRF-TOKEN";
const CSRF_HEADER: &str = "X-XSRF-TOKEN";

/// Support desk API client.
///
/// Cookies (session and CSRF) live in a shared jar, so clones of the client
/// share one session. A bearer token, when known, is attached to every call.
#[derive(Clone)]
pub struct HelpdeskClient {
  http: reqwest::Client,
  base_url: Url,
  jar: Arc<Jar>,
  token: Arc<RwLock<Option<String>>>,
}

impl HelpdeskClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    // Relative joins keep any path prefix of the base url
    let mut base = config.url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url = Url::parse(&base)?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

    let jar = Arc::new(Jar::default());
    let mut builder = reqwest::Client::builder()
      .cookie_provider(Arc::clone(&jar))
      .default_headers(headers);
    if let Some(timeout) = config.timeout() {
      builder = builder.timeout(timeout);
    }

    Ok(Self {
      http: builder.build()?,
      base_url,
      jar,
      token: Arc::new(RwLock::new(None)),
    })
  }

  pub fn set_token(&self, token: Option<String>) {
    *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
  }

  pub fn token(&self) -> Option<String> {
    self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  // ==========================================================================
  // Tickets
  // ==========================================================================

  /// Tickets owned by the logged-in user
  pub async fn list_own_tickets(&self) -> Result<Vec<Ticket>> {
    self.get_tickets("api/tickets").await
  }

  /// Every ticket (support and admin)
  pub async fn list_all_tickets(&self) -> Result<Vec<Ticket>> {
    self.get_tickets("api/tickets/all").await
  }

  /// Tickets assigned to a support user
  pub async fn list_assigned_tickets(&self, support_id: u64) -> Result<Vec<Ticket>> {
    self
      .get_tickets(&format!("api/tickets/assigned/{}", support_id))
      .await
  }

  pub async fn get_ticket(&self, id: u64) -> Result<Ticket> {
    let ticket: MaybeWrapped<ApiTicket> = self.get(&format!("api/tickets/{}", id)).await?;
    Ok(ticket.into_inner().into_ticket())
  }

  pub async fn create_ticket(&self, payload: &CreateTicketPayload) -> Result<Ticket> {
    let ticket: MaybeWrapped<ApiTicket> = self.send(Method::POST, "api/tickets", payload).await?;
    Ok(ticket.into_inner().into_ticket())
  }

  pub async fn update_ticket_status(&self, id: u64, status: TicketStatus) -> Result<Ticket> {
    let ticket: MaybeWrapped<ApiTicket> = self
      .send(
        Method::PUT,
        &format!("api/tickets/{}/status", id),
        &json!({ "status": status }),
      )
      .await?;
    Ok(ticket.into_inner().into_ticket())
  }

  pub async fn delete_ticket(&self, id: u64) -> Result<()> {
    self
      .send_empty(Method::DELETE, &format!("api/tickets/{}", id), None)
      .await
  }

  async fn get_tickets(&self, path: &str) -> Result<Vec<Ticket>> {
    let tickets: MaybeWrapped<Vec<ApiTicket>> = self.get(path).await?;
    Ok(
      tickets
        .into_inner()
        .into_iter()
        .map(ApiTicket::into_ticket)
        .collect(),
    )
  }

  // ==========================================================================
  // Users
  // ==========================================================================

  pub async fn list_users(&self) -> Result<Vec<User>> {
    let users: MaybeWrapped<Vec<User>> = self.get("api/users").await?;
    Ok(users.into_inner())
  }

  pub async fn get_user(&self, id: u64) -> Result<User> {
    let user: MaybeWrapped<User> = self.get(&format!("api/users/{}", id)).await?;
    Ok(user.into_inner())
  }

  pub async fn create_user(&self, payload: &CreateUserPayload) -> Result<User> {
    let user: MaybeWrapped<User> = self.send(Method::POST, "api/users", payload).await?;
    Ok(user.into_inner())
  }

  pub async fn update_user(&self, id: u64, payload: &UpdateUserPayload) -> Result<User> {
    let user: MaybeWrapped<User> = self
      .send(Method::PUT, &format!("api/users/{}", id), payload)
      .await?;
    Ok(user.into_inner())
  }

  pub async fn update_user_status(&self, id: u64, status: UserStatus) -> Result<User> {
    let user: MaybeWrapped<User> = self
      .send(
        Method::PUT,
        &format!("api/users/{}/status", id),
        &json!({ "status": status }),
      )
      .await?;
    Ok(user.into_inner())
  }

  pub async fn delete_user(&self, id: u64) -> Result<()> {
    self
      .send_empty(Method::DELETE, &format!("api/users/{}", id), None)
      .await
  }

  // ==========================================================================
  // Notifications & dashboard
  // ==========================================================================

  pub async fn list_notifications(&self) -> Result<Vec<Notification>> {
    let notifications: MaybeWrapped<Vec<Notification>> = self.get("api/notifications").await?;
    Ok(notifications.into_inner())
  }

  pub async fn mark_notification_read(&self, id: &str) -> Result<()> {
    self
      .send_empty(
        Method::PATCH,
        &format!("api/notifications/{}/read", urlencoding::encode(id)),
        None,
      )
      .await
  }

  pub async fn mark_all_notifications_read(&self) -> Result<()> {
    self
      .send_empty(Method::PATCH, "api/notifications/read-all", None)
      .await
  }

  pub async fn dashboard(&self) -> Result<Dashboard> {
    let dashboard: MaybeWrapped<Dashboard> = self.get("api/dashboard").await?;
    Ok(dashboard.into_inner())
  }

  // ==========================================================================
  // Auth & profile
  // ==========================================================================

  pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<ApiLoginResponse> {
    let body = json!({
      "name": name,
      "email": email,
      "password": password,
      "password_confirmation": password,
    });
    self.send(Method::POST, "api/register", &body).await
  }

  pub async fn login(&self, email: &str, password: &str, remember: bool) -> Result<ApiLoginResponse> {
    let body = json!({ "email": email, "password": password, "remember": remember });
    self.send(Method::POST, "api/login", &body).await
  }

  pub async fn logout(&self) -> Result<()> {
    self.send_empty(Method::POST, "api/logout", None).await
  }

  /// The authenticated user. A 401 comes back as `Error::Unauthorized`.
  pub async fn current_user(&self) -> Result<User> {
    self.ensure_csrf().await?;
    let user: MaybeWrapped<User> = self.get("api/user").await?;
    Ok(user.into_inner())
  }

  pub async fn update_profile(&self, payload: &UpdateProfilePayload) -> Result<ApiProfileResponse> {
    self.send(Method::PUT, "api/user/profile", payload).await
  }

  pub async fn change_password(&self, payload: &ChangePasswordPayload) -> Result<()> {
    let body = serde_json::to_value(payload)?;
    self
      .send_empty(Method::PUT, "api/user/change-password", Some(&body))
      .await
  }

  pub async fn delete_account(&self) -> Result<()> {
    self
      .send_empty(Method::DELETE, "api/user/delete", None)
      .await
  }

  /// Authorize a private realtime channel for a websocket connection.
  pub async fn authorize_channel(&self, endpoint: &str, socket_id: &str, channel: &str) -> Result<String> {
    self.ensure_csrf().await?;
    let request = self
      .request(Method::POST, endpoint)?
      .form(&[("socket_id", socket_id), ("channel_name", channel)]);
    let auth: ApiChannelAuth = self.execute(request).await?;
    Ok(auth.auth)
  }

  // ==========================================================================
  // Transport
  // ==========================================================================

  /// Current CSRF token from the cookie jar, percent-decoded.
  fn xsrf_token(&self) -> Option<String> {
    let cookies = self.jar.cookies(&self.base_url)?;
    let cookies = cookies.to_str().ok()?;
    cookies
      .split(';')
      .map(str::trim)
      .find_map(|c| c.strip_prefix(CSRF_COOKIE)?.strip_prefix('='))
      .map(|raw| {
        urlencoding::decode(raw)
          .map(|v| v.into_owned())
          .unwrap_or_else(|_| raw.to_string())
      })
  }

  /// Fetch the CSRF cookie unless the jar already holds one.
  async fn ensure_csrf(&self) -> Result<()> {
    if self.xsrf_token().is_some() {
      return Ok(());
    }
    debug!("fetching csrf cookie");
    let request = self.request(Method::GET, CSRF_ENDPOINT)?;
    self.execute_raw(request).await.map(|_| ())
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
    let url = self.base_url.join(path.trim_start_matches('/'))?;
    let state_changing = !matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);

    let mut request = self.http.request(method, url);
    if let Some(token) = self.token() {
      request = request.bearer_auth(token);
    }
    if state_changing {
      if let Some(xsrf) = self.xsrf_token() {
        request = request.header(CSRF_HEADER, xsrf);
      }
    }
    Ok(request)
  }

  async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let request = self.request(Method::GET, path)?;
    self.execute(request).await
  }

  async fn send<T, B>(&self, method: Method, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.ensure_csrf().await?;
    let request = self.request(method, path)?.json(body);
    self.execute(request).await
  }

  async fn send_empty(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<()> {
    self.ensure_csrf().await?;
    let mut request = self.request(method, path)?;
    if let Some(body) = body {
      request = request.json(body);
    }
    self.execute_raw(request).await.map(|_| ())
  }

  async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
    let body = self.execute_raw(request).await?;
    Ok(serde_json::from_str(&body)?)
  }

  /// Send a request; non-2xx responses become typed errors carrying the
  /// server's message.
  async fn execute_raw(&self, request: RequestBuilder) -> Result<String> {
    let response = request.send().await?;
    let status = response.status();
    let path = response.url().path().to_string();
    let body = response.text().await?;

    if status.is_success() {
      debug!(status = status.as_u16(), path = %path, "request ok");
      return Ok(body);
    }

    let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let err = parsed.into_error(status.as_u16(), status.canonical_reason());
    warn!(status = status.as_u16(), path = %path, error = %err, "request failed");
    Err(err)
  }
}
