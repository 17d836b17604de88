//! REST API client module for the document-intelligence backend.
//!
//! This module provides the `ApiClient` for registering, signing in and
//! fetching folder, usage, knowledge-base and chat data.
//!
//! The API uses bearer token authentication obtained from the
//! `/auth/token` endpoint (OAuth2 password flow).

pub mod client;
pub mod error;
pub mod upload;

pub use client::{bearer_headers, ApiClient, ListenerId, RequestOptions, UnauthorizedListener};
pub use error::{ApiError, FieldError};
pub use upload::{ProgressFn, UploadFile, UploadProgress};
