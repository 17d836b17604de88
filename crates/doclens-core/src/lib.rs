//! Client library for the doclens document-intelligence service.
//!
//! - [`auth::SessionStore`]: who is signed in, and the login/logout lifecycle
//! - [`api::ApiClient`]: authenticated requests, error normalization, uploads
//! - [`models`]: wire types for users, folders, usage, knowledge bases and chat
//! - [`config::Config`]: backend location and token storage selection

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError};
pub use auth::{Credentials, Registration, Route, SessionEvent, SessionStatus, SessionStore};
pub use config::Config;
