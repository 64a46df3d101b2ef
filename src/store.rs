//! Cached view of the helpdesk resources.
//!
//! The [`Store`] is created once at startup and handed to whatever needs it.
//! It owns one cache container per resource, the invalidation bus and the
//! realtime subscription, and it follows the session's identity: when the
//! logged-in user changes, every container is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::types::{
  CreateTicketPayload, CreateUserPayload, Dashboard, Notification, Ticket, TicketStatus,
  UpdateUserPayload, User, UserRole, UserStatus,
};
use crate::api::{HelpdeskClient, Result};
use crate::cache::{CacheContainer, Cacheable, FetchKind, FreshnessPolicy, Generation, ScopeKey};
use crate::config::Config;
use crate::event::{Invalidation, InvalidationBus, Registration};
use crate::realtime::{RealtimeTransport, SubscriptionManager};
use crate::session::Session;

pub struct Store {
  client: HelpdeskClient,
  session: Arc<Session>,
  bus: InvalidationBus,
  own_tickets: CacheContainer<Ticket>,
  all_tickets: CacheContainer<Ticket>,
  assigned_tickets: CacheContainer<Ticket>,
  users: CacheContainer<User>,
  notifications: CacheContainer<Notification>,
  dashboard: CacheContainer<Dashboard>,
  realtime: SubscriptionManager,
  /// Whether the realtime channel should follow the identity
  live: AtomicBool,
  watcher: JoinHandle<()>,
}

impl Store {
  /// Build the store and start following the session's identity.
  pub fn new(config: &Config, session: Arc<Session>, transport: Arc<dyn RealtimeTransport>) -> Arc<Self> {
    let ttl = FreshnessPolicy::TimeToLive(config.cache.ticket_ttl());
    let notifications = CacheContainer::new("notifications", FreshnessPolicy::NoExpiry)
      .with_capacity(config.cache.notification_limit);

    Arc::new_cyclic(|weak: &Weak<Store>| {
      let watcher = tokio::spawn(follow_identity(weak.clone(), session.identity()));

      Store {
        client: session.client().clone(),
        bus: InvalidationBus::new(config.cache.debounce()),
        own_tickets: CacheContainer::new("tickets", ttl),
        all_tickets: CacheContainer::new("all_tickets", ttl),
        assigned_tickets: CacheContainer::new("assigned_tickets", FreshnessPolicy::NoExpiry),
        users: CacheContainer::new("users", FreshnessPolicy::NoExpiry),
        realtime: SubscriptionManager::new(transport, config.realtime.clone(), notifications.clone()),
        notifications,
        dashboard: CacheContainer::new("dashboard", FreshnessPolicy::NoExpiry),
        live: AtomicBool::new(false),
        session,
        watcher,
      }
    })
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn bus(&self) -> &InvalidationBus {
    &self.bus
  }

  pub fn own_tickets(&self) -> &CacheContainer<Ticket> {
    &self.own_tickets
  }

  pub fn all_tickets(&self) -> &CacheContainer<Ticket> {
    &self.all_tickets
  }

  pub fn assigned_tickets(&self) -> &CacheContainer<Ticket> {
    &self.assigned_tickets
  }

  pub fn users(&self) -> &CacheContainer<User> {
    &self.users
  }

  pub fn notifications(&self) -> &CacheContainer<Notification> {
    &self.notifications
  }

  pub fn realtime(&self) -> &SubscriptionManager {
    &self.realtime
  }

  fn scope(&self, kind: FetchKind) -> ScopeKey {
    ScopeKey::new(self.session.user_id(), kind)
  }

  // ==========================================================================
  // Tickets
  // ==========================================================================

  /// Tickets of the current user, served from cache while fresh.
  pub async fn fetch_tickets(&self) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .own_tickets
      .fetch(self.scope(FetchKind::Own), move || async move { client.list_own_tickets().await })
      .await?;
    Ok(result.data)
  }

  pub async fn refresh_tickets(&self) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .own_tickets
      .refresh(self.scope(FetchKind::Own), move || async move { client.list_own_tickets().await })
      .await?;
    Ok(result.data)
  }

  pub fn clear_tickets(&self) {
    self.own_tickets.clear();
  }

  /// Every ticket visible to staff.
  pub async fn fetch_all_tickets(&self) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .all_tickets
      .fetch(self.scope(FetchKind::All), move || async move { client.list_all_tickets().await })
      .await?;
    Ok(result.data)
  }

  pub async fn refresh_all_tickets(&self) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .all_tickets
      .refresh(self.scope(FetchKind::All), move || async move { client.list_all_tickets().await })
      .await?;
    Ok(result.data)
  }

  pub fn clear_all_tickets(&self) {
    self.all_tickets.clear();
  }

  /// Tickets assigned to one support user.
  pub async fn fetch_assigned_tickets(&self, support_id: u64) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .assigned_tickets
      .fetch(self.scope(FetchKind::Assigned(support_id)), move || async move {
        client.list_assigned_tickets(support_id).await
      })
      .await?;
    Ok(result.data)
  }

  pub async fn refresh_assigned_tickets(&self, support_id: u64) -> Result<Vec<Ticket>> {
    let client = self.client.clone();
    let result = self
      .assigned_tickets
      .refresh(self.scope(FetchKind::Assigned(support_id)), move || async move {
        client.list_assigned_tickets(support_id).await
      })
      .await?;
    Ok(result.data)
  }

  /// A single ticket, from any ticket cache when present.
  pub async fn ticket(&self, id: u64) -> Result<Ticket> {
    let key = id.to_string();
    let cached = [&self.own_tickets, &self.all_tickets, &self.assigned_tickets]
      .into_iter()
      .find_map(|cache| cache.find(&key));
    match cached {
      Some(ticket) => Ok(ticket),
      None => self.client.get_ticket(id).await,
    }
  }

  pub async fn create_ticket(&self, payload: &CreateTicketPayload) -> Result<Ticket> {
    payload.validate()?;
    let own = self.own_tickets.generation();
    let all = self.all_tickets.generation();

    let ticket = self.client.create_ticket(payload).await.map_err(|e| {
      warn!(error = %e, "failed to create ticket");
      e
    })?;
    info!(id = ticket.id, ticket_id = %ticket.ticket_id, "ticket created");

    apply_if_loaded(&self.own_tickets, |c| c.prepend(own, ticket.clone()));
    apply_if_loaded(&self.all_tickets, |c| c.prepend(all, ticket.clone()));
    self.bus.trigger_all_tickets_refresh();
    self.bus.trigger(Invalidation::Dashboard);
    Ok(ticket)
  }

  pub async fn update_ticket_status(&self, id: u64, status: TicketStatus) -> Result<Ticket> {
    let generations = self.ticket_generations();

    let ticket = self.client.update_ticket_status(id, status).await.map_err(|e| {
      warn!(id, error = %e, "failed to update ticket status");
      e
    })?;
    info!(id, status = %status, "ticket status updated");

    for (cache, at) in self.ticket_caches().into_iter().zip(generations) {
      cache.replace(at, ticket.clone());
    }
    self.trigger_ticket_refresh();
    Ok(ticket)
  }

  pub async fn delete_ticket(&self, id: u64) -> Result<()> {
    let generations = self.ticket_generations();

    self.client.delete_ticket(id).await.map_err(|e| {
      warn!(id, error = %e, "failed to delete ticket");
      e
    })?;
    info!(id, "ticket deleted");

    let key = id.to_string();
    for (cache, at) in self.ticket_caches().into_iter().zip(generations) {
      cache.remove(at, &key);
    }
    self.trigger_ticket_refresh();
    Ok(())
  }

  fn trigger_ticket_refresh(&self) {
    self.bus.trigger_user_tickets_refresh();
    self.bus.trigger_all_tickets_refresh();
    self.bus.trigger(Invalidation::AssignedTickets);
    self.bus.trigger(Invalidation::Dashboard);
  }

  fn ticket_caches(&self) -> [&CacheContainer<Ticket>; 3] {
    [&self.own_tickets, &self.all_tickets, &self.assigned_tickets]
  }

  fn ticket_generations(&self) -> Vec<Generation> {
    self.ticket_caches().iter().map(|c| c.generation()).collect()
  }

  // ==========================================================================
  // Users
  // ==========================================================================

  pub async fn fetch_users(&self) -> Result<Vec<User>> {
    let client = self.client.clone();
    let result = self
      .users
      .fetch(self.scope(FetchKind::All), move || async move { client.list_users().await })
      .await?;
    Ok(result.data)
  }

  pub async fn refresh_users(&self) -> Result<Vec<User>> {
    let client = self.client.clone();
    let result = self
      .users
      .refresh(self.scope(FetchKind::All), move || async move { client.list_users().await })
      .await?;
    Ok(result.data)
  }

  pub fn clear_users(&self) {
    self.users.clear();
  }

  /// A single user, from the cache when present.
  pub async fn user(&self, id: u64) -> Result<User> {
    match self.users.find(&id.to_string()) {
      Some(user) => Ok(user),
      None => self.client.get_user(id).await,
    }
  }

  pub async fn add_user(&self, payload: &CreateUserPayload) -> Result<User> {
    payload.validate()?;
    let at = self.users.generation();
    let user = self.client.create_user(payload).await.map_err(|e| {
      warn!(error = %e, "failed to create user");
      e
    })?;
    info!(id = user.id, role = %user.role, "user created");
    apply_if_loaded(&self.users, |c| c.append(at, user.clone()));
    self.bus.trigger(Invalidation::Users);
    self.bus.trigger(Invalidation::Dashboard);
    Ok(user)
  }

  pub async fn edit_user(&self, id: u64, payload: &UpdateUserPayload) -> Result<User> {
    let at = self.users.generation();
    let user = self.client.update_user(id, payload).await.map_err(|e| {
      warn!(id, error = %e, "failed to update user");
      e
    })?;
    self.users.replace(at, user.clone());
    self.bus.trigger(Invalidation::Users);
    Ok(user)
  }

  pub async fn set_user_status(&self, id: u64, status: UserStatus) -> Result<User> {
    let at = self.users.generation();
    let user = self.client.update_user_status(id, status).await.map_err(|e| {
      warn!(id, error = %e, "failed to update user status");
      e
    })?;
    self.users.replace(at, user.clone());
    self.bus.trigger(Invalidation::Users);
    self.bus.trigger(Invalidation::Dashboard);
    Ok(user)
  }

  pub async fn remove_user(&self, id: u64) -> Result<()> {
    let at = self.users.generation();
    self.client.delete_user(id).await.map_err(|e| {
      warn!(id, error = %e, "failed to delete user");
      e
    })?;
    self.users.remove(at, &id.to_string());
    self.bus.trigger(Invalidation::Users);
    self.bus.trigger(Invalidation::Dashboard);
    Ok(())
  }

  // ==========================================================================
  // Notifications
  // ==========================================================================

  pub async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
    let client = self.client.clone();
    let result = self
      .notifications
      .fetch(self.scope(FetchKind::Own), move || async move { client.list_notifications().await })
      .await?;
    Ok(result.data)
  }

  pub async fn refresh_notifications(&self) -> Result<Vec<Notification>> {
    let client = self.client.clone();
    let result = self
      .notifications
      .refresh(self.scope(FetchKind::Own), move || async move { client.list_notifications().await })
      .await?;
    Ok(result.data)
  }

  /// Empty the list. A live channel stops feeding it until the next
  /// `go_live`.
  pub fn clear_notifications(&self) {
    self.notifications.clear();
  }

  /// Cached notifications visible to `role`. Admins see everything.
  pub fn notifications_for(&self, role: UserRole) -> Vec<Notification> {
    filter_by_role(self.notifications.items(), role)
  }

  pub fn unread_count(&self) -> usize {
    self.notifications.items().iter().filter(|n| !n.read).count()
  }

  pub async fn mark_read(&self, id: &str) -> Result<()> {
    let at = self.notifications.generation();
    self.client.mark_notification_read(id).await?;
    if let Some(mut notification) = self.notifications.find(id) {
      notification.read = true;
      self.notifications.replace(at, notification);
    }
    Ok(())
  }

  pub async fn mark_all_read(&self) -> Result<()> {
    let at = self.notifications.generation();
    self.client.mark_all_notifications_read().await?;
    self.notifications.update_all(at, |n| n.read = true);
    Ok(())
  }

  // ==========================================================================
  // Dashboard
  // ==========================================================================

  pub async fn fetch_dashboard(&self) -> Result<Dashboard> {
    let client = self.client.clone();
    let result = self
      .dashboard
      .fetch(self.scope(FetchKind::All), move || async move { client.dashboard().await.map(|d| vec![d]) })
      .await?;
    Ok(result.data.into_iter().next().unwrap_or_default())
  }

  pub async fn refresh_dashboard(&self) -> Result<Dashboard> {
    let client = self.client.clone();
    let result = self
      .dashboard
      .refresh(self.scope(FetchKind::All), move || async move { client.dashboard().await.map(|d| vec![d]) })
      .await?;
    Ok(result.data.into_iter().next().unwrap_or_default())
  }

  pub fn clear_dashboard(&self) {
    self.dashboard.clear();
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Refresh the container behind `event` each time it is dispatched, for
  /// as long as the registration lives.
  pub fn register_refresh(self: &Arc<Self>, event: Invalidation) -> Registration {
    let store = Arc::downgrade(self);
    self.bus.listen(event, move || {
      let store = store.clone();
      async move {
        let Some(store) = store.upgrade() else {
          return;
        };
        if let Err(e) = store.refresh_for(event).await {
          warn!(?event, error = %e, "refresh after invalidation failed");
        }
      }
    })
  }

  async fn refresh_for(&self, event: Invalidation) -> Result<()> {
    debug!(?event, "refreshing after invalidation");
    match event {
      Invalidation::UserTickets => self.refresh_tickets().await.map(drop),
      Invalidation::AllTickets => self.refresh_all_tickets().await.map(drop),
      Invalidation::AssignedTickets => match self.assigned_tickets.scope().map(|s| s.kind) {
        Some(FetchKind::Assigned(support_id)) => self.refresh_assigned_tickets(support_id).await.map(drop),
        _ => Ok(()),
      },
      Invalidation::Users => self.refresh_users().await.map(drop),
      Invalidation::Notifications => self.refresh_notifications().await.map(drop),
      Invalidation::Dashboard => self.refresh_dashboard().await.map(drop),
    }
  }

  /// Keep the realtime channel bound to the logged-in user.
  pub async fn go_live(&self) -> Result<()> {
    self.live.store(true, Ordering::SeqCst);
    match self.session.user_id() {
      Some(user_id) => self.realtime.start_listening(user_id).await,
      None => Ok(()),
    }
  }

  /// Empty every container and close the realtime channel.
  pub async fn reset(&self) {
    self.clear_all();
    self.realtime.stop_listening().await;
  }

  /// End the session and drop everything cached for it.
  pub async fn logout(&self) -> Result<()> {
    self.session.logout().await?;
    self.reset().await;
    Ok(())
  }

  fn clear_all(&self) {
    self.clear_tickets();
    self.clear_all_tickets();
    self.assigned_tickets.clear();
    self.clear_users();
    self.clear_notifications();
    self.clear_dashboard();
  }

  /// Drop whatever does not belong to `user_id`. Containers already
  /// holding or fetching that user's data are kept, so a read started right
  /// after login is not thrown away. Notifications are always cleared:
  /// the previous user's channel may still be delivering into them.
  fn clear_for(&self, user_id: Option<u64>) {
    let Some(user_id) = user_id else {
      self.clear_all();
      return;
    };
    self.own_tickets.clear_unless_owned_by(user_id);
    self.all_tickets.clear_unless_owned_by(user_id);
    self.assigned_tickets.clear_unless_owned_by(user_id);
    self.users.clear_unless_owned_by(user_id);
    self.dashboard.clear_unless_owned_by(user_id);
    self.clear_notifications();
  }

  async fn on_identity_change(&self, user_id: Option<u64>) {
    info!(?user_id, "identity changed, clearing caches");
    self.clear_for(user_id);

    if !self.live.load(Ordering::SeqCst) {
      return;
    }
    match user_id {
      Some(user_id) => {
        if let Err(e) = self.realtime.start_listening(user_id).await {
          warn!(user_id, error = %e, "could not follow identity change");
        }
      }
      None => self.realtime.stop_listening().await,
    }
  }
}

impl Drop for Store {
  fn drop(&mut self) {
    self.watcher.abort();
  }
}

async fn follow_identity(store: Weak<Store>, mut identity: tokio::sync::watch::Receiver<Option<User>>) {
  let mut previous = identity.borrow_and_update().as_ref().map(|u| u.id);

  while identity.changed().await.is_ok() {
    let current = identity.borrow_and_update().as_ref().map(|u| u.id);
    if current == previous {
      continue;
    }
    previous = current;

    let Some(store) = store.upgrade() else {
      break;
    };
    store.on_identity_change(current).await;
  }
}

/// Only patch a container that holds a fetched collection; an empty,
/// never-fetched one is filled by its next fetch.
fn apply_if_loaded<T: Cacheable>(cache: &CacheContainer<T>, op: impl FnOnce(&CacheContainer<T>) -> bool) {
  if cache.scope().is_some() {
    op(cache);
  }
}

fn filter_by_role(notifications: Vec<Notification>, role: UserRole) -> Vec<Notification> {
  match role {
    UserRole::Admin => notifications,
    role => notifications.into_iter().filter(|n| n.role == role).collect(),
  }
}
