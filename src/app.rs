use crate::api::types::{
  ChangePasswordPayload, CreateTicketPayload, CreateUserPayload, Dashboard, Notification, Ticket,
  TicketPriority, TicketStatus, UpdateProfilePayload, UpdateUserPayload, User, UserRole, UserStatus,
};
use crate::api::{self, HelpdeskClient};
use crate::cache::SqliteStorage;
use crate::commands;
use crate::config::Config;
use crate::event::{Invalidation, Registration};
use crate::filter::TicketFilter;
use crate::realtime::PusherTransport;
use crate::session::Session;
use crate::store::Store;
use clap::Subcommand;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// How often the console checks for pushed notifications
const TICK_RATE: Duration = Duration::from_millis(250);

#[derive(Subcommand, Debug)]
pub enum Cli {
  /// Log in (falls back to TKT_EMAIL / TKT_PASSWORD)
  Login {
    #[arg(short, long)]
    email: Option<String>,
    #[arg(short, long)]
    password: Option<String>,
    /// Keep the server session alive longer
    #[arg(long)]
    remember: bool,
  },
  /// Create an account and log in
  Register {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Defaults to the password
    #[arg(long)]
    password_confirmation: Option<String>,
  },
  Logout,
  /// Show the logged-in user
  Whoami,
  /// List tickets
  #[command(visible_alias = "t")]
  Tickets {
    /// Every ticket instead of your own (support and admin)
    #[arg(long)]
    all: bool,
    /// Bypass the cache
    #[arg(long)]
    refresh: bool,
    #[arg(long)]
    status: Option<TicketStatus>,
    #[arg(long)]
    priority: Option<TicketPriority>,
    /// Case-insensitive text in title or description
    #[arg(short, long)]
    search: Option<String>,
  },
  /// Work with a single ticket
  Ticket {
    #[command(subcommand)]
    action: TicketAction,
  },
  /// Tickets assigned to a support user
  Assigned {
    support_id: u64,
    #[arg(long)]
    refresh: bool,
  },
  /// Manage user accounts (admin)
  #[command(visible_alias = "u")]
  Users {
    #[command(subcommand)]
    action: UsersAction,
  },
  /// List notifications, or mark them read
  #[command(visible_alias = "n")]
  Notifications {
    #[command(subcommand)]
    action: Option<NotificationsAction>,
    /// Only unread ones
    #[arg(long)]
    unread: bool,
  },
  #[command(visible_alias = "d")]
  Dashboard {
    #[arg(long)]
    refresh: bool,
  },
  /// Your own account
  Profile {
    #[command(subcommand)]
    action: ProfileAction,
  },
  /// Interactive console with live notifications
  #[command(visible_alias = "w")]
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum TicketAction {
  Show {
    id: u64,
  },
  Create {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    priority: Option<TicketPriority>,
  },
  /// Change the status of a ticket
  Status {
    id: u64,
    status: TicketStatus,
  },
  Delete {
    id: u64,
  },
}

#[derive(Subcommand, Debug)]
pub enum UsersAction {
  List {
    #[arg(long)]
    refresh: bool,
  },
  Show {
    id: u64,
  },
  Add {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    role: UserRole,
    #[arg(long)]
    password: String,
    #[arg(long)]
    password_confirmation: Option<String>,
    /// Create the account disabled
    #[arg(long)]
    inactive: bool,
  },
  Edit {
    id: u64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    role: Option<UserRole>,
  },
  /// Activate or deactivate an account
  Status {
    id: u64,
    status: UserStatus,
  },
  Remove {
    id: u64,
  },
}

#[derive(Subcommand, Debug)]
pub enum NotificationsAction {
  /// Mark one notification as read
  Read { id: String },
  /// Mark every notification as read
  ReadAll,
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
  /// Change your display name
  Update {
    #[arg(long)]
    name: String,
  },
  Password {
    #[arg(long)]
    current: String,
    #[arg(long)]
    new: String,
    #[arg(long)]
    confirmation: Option<String>,
  },
  /// Delete your account
  Delete {
    /// Required; there is no undo
    #[arg(long)]
    yes: bool,
  },
}

/// Application state shared by every command
pub struct App {
  session: Arc<Session>,
  store: Arc<Store>,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let client = HelpdeskClient::new(&config.api)?;
    let storage = Arc::new(SqliteStorage::open()?);
    let session = Arc::new(Session::new(client.clone(), storage));
    session.restore()?;

    let transport = Arc::new(PusherTransport::new(client, config.realtime.clone()));
    let store = Store::new(&config, Arc::clone(&session), transport);

    Ok(Self { session, store })
  }

  pub async fn run(&self, command: Cli) -> Result<()> {
    match command {
      Cli::Login {
        email,
        password,
        remember,
      } => {
        let email = email.map_or_else(Config::get_email, Ok)?;
        let password = password.map_or_else(Config::get_password, Ok)?;
        let user = self.session.login(&email, &password, remember).await.map_err(report)?;
        println!("Logged in as {} ({}). Home: {}", user.name, user.role, user.role.home());
      }
      Cli::Register {
        name,
        email,
        password,
        password_confirmation,
      } => {
        let confirmation = password_confirmation.unwrap_or_else(|| password.clone());
        let user = self
          .session
          .register(&name, &email, &password, &confirmation)
          .await
          .map_err(report)?;
        println!("Account created for {}. Welcome aboard!", user.name);
      }
      Cli::Logout => {
        if self.session.current().is_none() {
          println!("Not logged in.");
          return Ok(());
        }
        self.store.logout().await.map_err(report)?;
        println!("Logged out.");
      }
      Cli::Whoami => match self.session.fetch_user().await.map_err(report)? {
        Some(user) => println!("{} <{}> role={} status={}", user.name, user.email, user.role, user.status),
        None => println!("Not logged in."),
      },
      Cli::Tickets {
        all,
        refresh,
        status,
        priority,
        search,
      } => {
        self.require_user().await?;
        let tickets = match (all, refresh) {
          (false, false) => self.store.fetch_tickets().await,
          (false, true) => self.store.refresh_tickets().await,
          (true, false) => self.store.fetch_all_tickets().await,
          (true, true) => self.store.refresh_all_tickets().await,
        }
        .map_err(report)?;
        let filter = TicketFilter {
          status,
          priority,
          search,
        };
        print_filtered(&tickets, &filter);
      }
      Cli::Ticket { action } => {
        self.require_user().await?;
        self.ticket(action).await?;
      }
      Cli::Assigned { support_id, refresh } => {
        self.require_user().await?;
        let tickets = if refresh {
          self.store.refresh_assigned_tickets(support_id).await
        } else {
          self.store.fetch_assigned_tickets(support_id).await
        }
        .map_err(report)?;
        print_tickets(&tickets.iter().collect::<Vec<_>>());
      }
      Cli::Users { action } => {
        self.require_user().await?;
        self.users(action).await?;
      }
      Cli::Notifications { action, unread } => {
        let user = self.require_user().await?;
        match action {
          Some(NotificationsAction::Read { id }) => {
            self.store.fetch_notifications().await.map_err(report)?;
            self.store.mark_read(&id).await.map_err(report)?;
            println!("Marked {} as read.", id);
          }
          Some(NotificationsAction::ReadAll) => {
            self.store.fetch_notifications().await.map_err(report)?;
            self.store.mark_all_read().await.map_err(report)?;
            println!("All notifications marked as read.");
          }
          None => {
            self.store.fetch_notifications().await.map_err(report)?;
            let notifications: Vec<Notification> = self
              .store
              .notifications_for(user.role)
              .into_iter()
              .filter(|n| !unread || !n.read)
              .collect();
            print_notifications(&notifications);
            println!("{} unread", self.store.unread_count());
          }
        }
      }
      Cli::Dashboard { refresh } => {
        self.require_user().await?;
        let dashboard = if refresh {
          self.store.refresh_dashboard().await
        } else {
          self.store.fetch_dashboard().await
        }
        .map_err(report)?;
        print_dashboard(&dashboard);
      }
      Cli::Profile { action } => {
        self.require_user().await?;
        self.profile(action).await?;
      }
      Cli::Watch => {
        let user = self.require_user().await?;
        self.watch(user).await?;
      }
    }
    Ok(())
  }

  async fn ticket(&self, action: TicketAction) -> Result<()> {
    match action {
      TicketAction::Show { id } => {
        let ticket = self.store.ticket(id).await.map_err(report)?;
        print_ticket(&ticket);
      }
      TicketAction::Create {
        title,
        description,
        priority,
      } => {
        let payload = CreateTicketPayload {
          title,
          description,
          priority,
        };
        let ticket = self.store.create_ticket(&payload).await.map_err(report)?;
        println!("Created {} ({})", ticket.ticket_id, ticket.title);
      }
      TicketAction::Status { id, status } => {
        let ticket = self.store.update_ticket_status(id, status).await.map_err(report)?;
        println!("{} is now {}", ticket.ticket_id, ticket.status);
      }
      TicketAction::Delete { id } => {
        self.store.delete_ticket(id).await.map_err(report)?;
        println!("Deleted ticket {}", id);
      }
    }
    Ok(())
  }

  async fn users(&self, action: UsersAction) -> Result<()> {
    match action {
      UsersAction::List { refresh } => {
        let users = if refresh {
          self.store.refresh_users().await
        } else {
          self.store.fetch_users().await
        }
        .map_err(report)?;
        print_users(&users);
      }
      UsersAction::Show { id } => {
        let user = self.store.user(id).await.map_err(report)?;
        print_users(std::slice::from_ref(&user));
      }
      UsersAction::Add {
        name,
        email,
        role,
        password,
        password_confirmation,
        inactive,
      } => {
        let payload = CreateUserPayload {
          name,
          email,
          role: Some(role),
          status: if inactive { UserStatus::Inactive } else { UserStatus::Active },
          password_confirmation: password_confirmation.unwrap_or_else(|| password.clone()),
          password,
        };
        let user = self.store.add_user(&payload).await.map_err(report)?;
        println!("Created user {} ({})", user.id, user.email);
      }
      UsersAction::Edit { id, name, email, role } => {
        let payload = UpdateUserPayload {
          name,
          email,
          role,
          ..Default::default()
        };
        let user = self.store.edit_user(id, &payload).await.map_err(report)?;
        println!("Updated user {} ({}, {})", user.id, user.name, user.role);
      }
      UsersAction::Status { id, status } => {
        let user = self.store.set_user_status(id, status).await.map_err(report)?;
        println!("User {} is now {}", user.id, user.status);
      }
      UsersAction::Remove { id } => {
        self.store.remove_user(id).await.map_err(report)?;
        println!("Removed user {}", id);
      }
    }
    Ok(())
  }

  async fn profile(&self, action: ProfileAction) -> Result<()> {
    match action {
      ProfileAction::Update { name } => {
        let user = self
          .session
          .update_profile(&UpdateProfilePayload { name })
          .await
          .map_err(report)?;
        println!("Profile updated. Name: {}", user.name);
      }
      ProfileAction::Password {
        current,
        new,
        confirmation,
      } => {
        let payload = ChangePasswordPayload {
          current_password: current,
          new_password_confirmation: confirmation.unwrap_or_else(|| new.clone()),
          new_password: new,
        };
        self.session.change_password(&payload).await.map_err(report)?;
        println!("Password changed.");
      }
      ProfileAction::Delete { yes } => {
        if !yes {
          return Err(eyre!("Refusing to delete the account without --yes"));
        }
        self.session.delete_account().await.map_err(report)?;
        self.store.reset().await;
        println!("Account deleted.");
      }
    }
    Ok(())
  }

  /// The logged-in user, confirmed with the server when not known locally.
  async fn require_user(&self) -> Result<User> {
    if let Some(user) = self.session.current() {
      return Ok(user);
    }
    match self.session.fetch_user().await {
      Ok(Some(user)) => Ok(user),
      Ok(None) => Err(eyre!("Not logged in. Run `tkt login` first.")),
      Err(e) => Err(report(e)),
    }
  }

  // ==========================================================================
  // Watch console
  // ==========================================================================

  async fn watch(&self, user: User) -> Result<()> {
    if let Err(e) = self.store.go_live().await {
      warn!(error = %e, "realtime unavailable");
      println!("Live notifications unavailable ({}). Use `refresh` to poll.", e);
    }

    let staff = user.role != UserRole::User;
    let mut registrations: Vec<Registration> = [
      Invalidation::UserTickets,
      Invalidation::Notifications,
      Invalidation::Dashboard,
    ]
    .into_iter()
    .map(|event| self.store.register_refresh(event))
    .collect();
    if staff {
      registrations.push(self.store.register_refresh(Invalidation::AllTickets));
    }
    if user.role == UserRole::Support {
      registrations.push(self.store.register_refresh(Invalidation::AssignedTickets));
    }
    if user.role == UserRole::Admin {
      registrations.push(self.store.register_refresh(Invalidation::Users));
    }

    let mut seen: HashSet<String> = match self.store.fetch_notifications().await {
      Ok(notifications) => notifications.into_iter().map(|n| n.id).collect(),
      Err(e) => {
        println!("{}", report(e));
        HashSet::new()
      }
    };

    println!("Watching as {} ({}). Type `help` for commands.", user.name, user.role);
    info!(user_id = user.id, "watch console started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(TICK_RATE);

    loop {
      tokio::select! {
        line = lines.next_line() => {
          let Some(input) = line? else {
            break;
          };
          if !self.console_command(&user, &input).await {
            break;
          }
        }
        _ = tick.tick() => {
          for notification in self.store.notifications_for(user.role).iter().rev() {
            if seen.insert(notification.id.clone()) {
              println!("* {}", notification.message);
            }
          }
        }
        _ = tokio::signal::ctrl_c() => break,
      }
    }

    drop(registrations);
    self.store.realtime().stop_listening().await;
    info!("watch console stopped");
    Ok(())
  }

  /// Run one console line. Returns false when the console should close.
  async fn console_command(&self, user: &User, input: &str) -> bool {
    if input.trim().is_empty() {
      return true;
    }
    let Some(command) = commands::resolve(input) else {
      println!("Unknown command '{}'. Type `help`.", input.trim());
      return true;
    };

    let outcome: api::Result<()> = match command.name {
      "tickets" => self.store.fetch_tickets().await.map(|t| print_tickets(&t.iter().collect::<Vec<_>>())),
      "all" => self.store.fetch_all_tickets().await.map(|t| print_tickets(&t.iter().collect::<Vec<_>>())),
      "assigned" => self
        .store
        .fetch_assigned_tickets(user.id)
        .await
        .map(|t| print_tickets(&t.iter().collect::<Vec<_>>())),
      "notifications" => self
        .store
        .fetch_notifications()
        .await
        .map(|_| print_notifications(&self.store.notifications_for(user.role))),
      "read-all" => self.store.mark_all_read().await.map(|_| println!("All notifications marked as read.")),
      "dashboard" => self.store.fetch_dashboard().await.map(|d| print_dashboard(&d)),
      "users" => self.store.fetch_users().await.map(|u| print_users(&u)),
      "refresh" => {
        let bus = self.store.bus();
        bus.trigger_user_tickets_refresh();
        bus.trigger(Invalidation::Notifications);
        bus.trigger(Invalidation::Dashboard);
        if user.role != UserRole::User {
          bus.trigger_all_tickets_refresh();
        }
        if user.role == UserRole::Support {
          bus.trigger(Invalidation::AssignedTickets);
        }
        if user.role == UserRole::Admin {
          bus.trigger(Invalidation::Users);
        }
        println!("Refreshing...");
        Ok(())
      }
      "help" => {
        for cmd in commands::COMMANDS {
          println!("  {:<14} {:<20} {}", cmd.name, cmd.aliases.join(", "), cmd.description);
        }
        Ok(())
      }
      "quit" => return false,
      _ => Ok(()),
    };

    if let Err(e) = outcome {
      println!("{}", report(e));
    }
    true
  }
}

// ============================================================================
// Output
// ============================================================================

/// Turn an API error into a report, spelling out field errors.
fn report(err: api::Error) -> color_eyre::Report {
  if let Some(fields) = err.field_errors() {
    let lines: Vec<String> = fields
      .iter()
      .flat_map(|(field, messages)| messages.iter().map(move |m| format!("  {}: {}", field, m)))
      .collect();
    return eyre!("Please fix the following:\n{}", lines.join("\n"));
  }
  match err {
    api::Error::Unauthorized => eyre!("Session expired. Run `tkt login` again."),
    other => eyre!(other),
  }
}

fn print_filtered(tickets: &[Ticket], filter: &TicketFilter) {
  let matched = filter.apply(tickets);
  match TicketFilter::message(matched.len()) {
    Some(message) if !filter.is_empty() => println!("{}", message),
    _ => print_tickets(&matched),
  }
}

fn print_tickets(tickets: &[&Ticket]) {
  if tickets.is_empty() {
    println!("No tickets.");
    return;
  }
  println!("{:<6} {:<10} {:<12} {:<8} TITLE", "ID", "REF", "STATUS", "PRIORITY");
  for t in tickets {
    println!(
      "{:<6} {:<10} {:<12} {:<8} {}",
      t.id,
      t.ticket_id,
      t.status.to_string(),
      t.priority.to_string(),
      t.title
    );
  }
}

fn print_ticket(ticket: &Ticket) {
  println!("{}  {}", ticket.ticket_id, ticket.title);
  println!("status: {}  priority: {}  created: {}", ticket.status, ticket.priority, ticket.created_at);
  println!();
  println!("{}", ticket.description);
}

fn print_users(users: &[User]) {
  if users.is_empty() {
    println!("No users.");
    return;
  }
  println!("{:<6} {:<24} {:<32} {:<8} STATUS", "ID", "NAME", "EMAIL", "ROLE");
  for u in users {
    println!(
      "{:<6} {:<24} {:<32} {:<8} {}",
      u.id,
      u.name,
      u.email,
      u.role.to_string(),
      u.status
    );
  }
}

fn print_notifications(notifications: &[Notification]) {
  if notifications.is_empty() {
    println!("No notifications.");
    return;
  }
  for n in notifications {
    let marker = if n.read { " " } else { "*" };
    let when = n.time.as_deref().unwrap_or(&n.created_at);
    println!("{} [{}] {}  {}", marker, n.id, n.message, when);
  }
}

fn print_dashboard(d: &Dashboard) {
  println!("Users        {:>6}  ({:+.1}%)", d.total_users, d.users_change);
  println!("Support      {:>6}  ({:+.1}%)", d.total_support, d.support_change);
  println!("Tickets      {:>6}  ({:+.1}%)", d.total_tickets, d.tickets_change);
  println!("New today    {:>6}  ({:+.1}%)", d.new_tickets_today, d.new_change);
  println!("Active today {:>6}  ({:+.1}%)", d.active_tickets_today, d.active_change);
  println!("Resolved     {:>6}  ({:+.1}%)", d.resolved_tickets_today, d.resolved_change);
  println!();
  println!(
    "pending {}  in progress {}  resolved {}  active {}  completed {}",
    d.pending, d.in_progress, d.resolved, d.active, d.completed
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_report_lists_field_errors() {
    let err = api::Error::validation([("title", "Title is required."), ("priority", "Priority is required.")]);
    let message = report(err).to_string();
    assert!(message.starts_with("Please fix the following:"));
    assert!(message.contains("  title: Title is required."));
    assert!(message.contains("  priority: Priority is required."));
  }

  #[test]
  fn test_report_unauthorized() {
    let message = report(api::Error::Unauthorized).to_string();
    assert!(message.contains("tkt login"));
  }
}
