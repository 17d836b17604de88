//! Client-side session lifecycle.
//!
//! `SessionStore` is an explicitly owned handle: create one at startup,
//! clone it into whatever needs to read or change who is signed in. Its
//! state moves `Initializing -> Authenticated | Anonymous` via
//! [`SessionStore::initialize`], and afterwards only through `login` and
//! `logout`. A rejected token reported by the API client forces a logout
//! through a listener registered at construction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{bearer_headers, ApiClient, ApiError, ListenerId};
use crate::models::{CreatedUser, UsageMetrics, UsagePeriod, User};

use super::{Credentials, Registration, TokenStore};

/// Capacity of the event channel. Slow subscribers skip old events.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Authenticated,
    Anonymous,
}

/// Where the front end should go after a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Dashboard,
    VerifyEmail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    Navigate(Route),
}

/// Snapshot of the session.
///
/// `user` is set only while authenticated; `token` only while
/// initializing or authenticated.
#[derive(Clone, PartialEq)]
pub struct Session {
    pub status: SessionStatus,
    pub token: Option<String>,
    pub user: Option<User>,
    /// Bumped on every sign-in and sign-out.
    pub epoch: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            status: SessionStatus::Initializing,
            token: None,
            user: None,
            epoch: 0,
        }
    }

    fn sign_in(&mut self, token: String, user: User) {
        self.status = SessionStatus::Authenticated;
        self.token = Some(token);
        self.user = Some(user);
        self.epoch += 1;
    }

    fn sign_out(&mut self) {
        self.status = SessionStatus::Anonymous;
        self.token = None;
        self.user = None;
        self.epoch += 1;
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("epoch", &self.epoch)
            .finish()
    }
}

struct SessionInner {
    api: ApiClient,
    tokens: Arc<dyn TokenStore>,
    state: RwLock<Session>,
    initialized: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    listener: RwLock<Option<ListenerId>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let id = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.api.remove_unauthorized_listener(id);
        }
    }
}

/// Single source of truth for who is signed in.
/// Clone is cheap - clones share the same session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("session", &*self.read_state())
            .finish()
    }
}

impl SessionStore {
    /// Create a store in the `Initializing` state and subscribe it to the
    /// client's authorization failures.
    pub fn new(api: ApiClient, tokens: Arc<dyn TokenStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            api,
            tokens,
            state: RwLock::new(Session::new()),
            initialized: AtomicBool::new(false),
            events,
            listener: RwLock::new(None),
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        let id = inner.api.on_unauthorized(move || {
            if let Some(inner) = weak.upgrade() {
                info!("Signing out after authorization failure");
                SessionStore { inner }.logout();
            }
        });
        *inner.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(id);

        Self { inner }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Session> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Session> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn status(&self) -> SessionStatus {
        self.read_state().status
    }

    pub fn user(&self) -> Option<User> {
        self.read_state().user.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.read_state().token.clone()
    }

    pub fn snapshot(&self) -> Session {
        self.read_state().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    pub fn epoch(&self) -> u64 {
        self.read_state().epoch
    }

    /// True if no sign-in or sign-out happened since `epoch` was read.
    /// Check before committing the result of a long call.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Headers for an authenticated request: the bearer token when one is
    /// held, nothing otherwise.
    pub fn auth_headers(&self) -> HeaderMap {
        let token = self.token();
        bearer_headers(token.as_deref()).unwrap_or_else(|e| {
            warn!(error = %e, "Session token is not a valid header value");
            HeaderMap::new()
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Resolve the session from the persisted token. Runs once; later calls
    /// return the current status without any I/O.
    pub async fn initialize(&self) -> SessionStatus {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return self.status();
        }

        let token = match self.inner.tokens.load() {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted token, starting signed out");
                self.clear_persisted();
                None
            }
        };

        let Some(token) = token else {
            debug!("No persisted token");
            self.settle_anonymous();
            return SessionStatus::Anonymous;
        };

        let epoch = {
            let mut state = self.write_state();
            state.token = Some(token.clone());
            state.epoch
        };

        match self.inner.api.current_user_with(&token).await {
            Ok(user) => {
                let committed = {
                    let mut state = self.write_state();
                    if state.status == SessionStatus::Initializing && state.epoch == epoch {
                        state.sign_in(token.clone(), user.clone());
                        true
                    } else {
                        false
                    }
                };
                if committed {
                    self.inner.api.set_token(token);
                    info!(username = %user.username, "Session restored");
                    self.emit(SessionEvent::StatusChanged(SessionStatus::Authenticated));
                } else {
                    debug!("Session changed while restoring, discarding result");
                }
            }
            Err(e) => {
                // Storage is only touched while still initializing; a login
                // that committed in the meantime owns it now.
                let settled = {
                    let mut state = self.write_state();
                    if state.status == SessionStatus::Initializing && state.epoch == epoch {
                        if e.is_unauthorized() {
                            warn!(error = %e, "Persisted token was not accepted, clearing it");
                            self.clear_persisted();
                        } else {
                            warn!(error = %e, "Could not verify persisted token, starting signed out");
                        }
                        state.sign_out();
                        true
                    } else {
                        false
                    }
                };
                if settled {
                    self.emit(SessionEvent::StatusChanged(SessionStatus::Anonymous));
                } else {
                    debug!("Session changed while restoring, keeping it");
                }
            }
        }

        self.status()
    }

    /// Move from `Initializing` to `Anonymous`. No-op from any other state.
    fn settle_anonymous(&self) {
        let changed = {
            let mut state = self.write_state();
            if state.status == SessionStatus::Initializing {
                state.sign_out();
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(SessionEvent::StatusChanged(SessionStatus::Anonymous));
        }
    }

    fn clear_persisted(&self) {
        if let Err(e) = self.inner.tokens.clear() {
            warn!(error = %e, "Failed to clear persisted token");
        }
    }

    /// Sign in. On failure the session is left exactly as it was and the
    /// error's `Display` is the message to show.
    pub async fn login(&self, credentials: Credentials) -> Result<User, ApiError> {
        let username = credentials.username.clone();
        let result = async {
            let issued = self.inner.api.login(&credentials).await?;
            let user = self.inner.api.current_user_with(&issued.access_token).await?;
            Ok::<_, ApiError>((issued.access_token, user))
        }
        .await;

        let (token, user) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(username = %username, error = %e, "Login failed");
                return Err(e);
            }
        };

        {
            let mut state = self.write_state();
            if let Err(e) = self.inner.tokens.save(&token) {
                warn!(error = %e, "Failed to persist token, session will not survive restart");
            }
            self.inner.api.set_token(token.clone());
            state.sign_in(token, user.clone());
        }
        self.inner.initialized.store(true, Ordering::SeqCst);

        info!(username = %user.username, "Login successful");
        self.emit(SessionEvent::StatusChanged(SessionStatus::Authenticated));
        self.emit(SessionEvent::Navigate(Route::Dashboard));
        Ok(user)
    }

    /// Create an account. Does not sign in; the next stop is email verification.
    pub async fn register(&self, details: Registration) -> Result<CreatedUser, ApiError> {
        match self.inner.api.register(&details).await {
            Ok(created) => {
                info!(username = %created.username, "Account registered");
                self.emit(SessionEvent::Navigate(Route::VerifyEmail));
                Ok(created)
            }
            Err(e) => {
                warn!(username = %details.username, error = %e, "Registration failed");
                Err(e)
            }
        }
    }

    /// Sign out: forget the token everywhere and reset the session.
    /// Synchronous, makes no request, and does nothing when already signed out.
    pub fn logout(&self) {
        {
            let mut state = self.write_state();
            if state.status == SessionStatus::Anonymous {
                debug!("Logout while signed out, nothing to do");
                return;
            }
            state.sign_out();
        }
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.api.clear_token();
        self.clear_persisted();

        info!("Signed out");
        self.emit(SessionEvent::StatusChanged(SessionStatus::Anonymous));
        self.emit(SessionEvent::Navigate(Route::Login));
    }

    /// Re-read the identity, e.g. to pick up a changed credit balance.
    pub async fn refresh_user(&self) -> Result<User, ApiError> {
        let epoch = self.epoch();
        let user = self.inner.api.current_user().await?;
        let mut state = self.write_state();
        if state.is_authenticated() && state.epoch == epoch {
            state.user = Some(user.clone());
        }
        Ok(user)
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        self.inner.api.request_password_reset(email).await
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), ApiError> {
        self.inner.api.reset_password(token, new_password).await
    }

    /// Usage for `period`. An account with no usage yet gets zeroes and its
    /// current credit balance instead of an error.
    pub async fn usage(&self, period: UsagePeriod) -> Result<UsageMetrics, ApiError> {
        let credits = self.user().map(|u| u.credits).unwrap_or_default();
        self.inner.api.usage_or_zeroed(period, credits).await
    }
}
