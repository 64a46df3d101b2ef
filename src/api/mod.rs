//! Typed access to the support desk REST API.

pub mod api_types;
pub mod client;
pub mod error;
pub mod types;
pub mod validate;

pub use client::HelpdeskClient;
pub use error::{Error, Result};
