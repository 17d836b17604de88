//! Authentication module for managing the user session and its token.
//!
//! This module provides:
//! - `SessionStore`: the single source of truth for who is signed in
//! - `TokenStore`: durable storage for the one persisted bearer token
//! - `Credentials` / `Registration`: per-call credential envelopes
//!
//! The token is read from storage once at startup, written on login and
//! cleared on logout or when the backend rejects it.

pub mod credentials;
pub mod session;
pub mod token_store;

pub use credentials::{Credentials, Registration};
pub use session::{Route, Session, SessionEvent, SessionStatus, SessionStore};
pub use token_store::{
    FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore, TokenStoreError, TOKEN_KEY,
};
