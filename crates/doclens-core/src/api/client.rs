//! API client for the document-intelligence backend.
//!
//! This module provides the `ApiClient` struct, the single choke point for
//! outbound requests: it owns the base URL, attaches the bearer token,
//! normalizes error bodies into `ApiError`, and reports authorization
//! failures to registered listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::multipart::Form;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::{Credentials, Registration};
use crate::config::Config;
use crate::models::{
    ChatReply, ChatRequest, CreatedUser, FileEntry, FolderNode, FolderTree, KnowledgeBase,
    NewFolder, NewKnowledgeBase, TokenResponse, UsageMetrics, UsagePeriod, User,
};

use super::upload::{ProgressFn, UploadFile};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) GET requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Callback run when the backend rejects the held token.
pub type UnauthorizedListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`ApiClient::on_unauthorized`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-call switches for [`ApiClient::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Send without the held bearer token.
    pub anonymous: bool,
    /// Send this token instead of the held one. A 401 for an override token
    /// is returned to the caller but does not discard the held token.
    pub bearer: Option<String>,
}

impl RequestOptions {
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            bearer: None,
        }
    }

    pub fn with_bearer(token: impl Into<String>) -> Self {
        Self {
            anonymous: false,
            bearer: Some(token.into()),
        }
    }
}

/// Build the header set for an authenticated request.
/// Returns an empty map when there is no token.
pub fn bearer_headers(token: Option<&str>) -> Result<header::HeaderMap, ApiError> {
    let mut headers = header::HeaderMap::new();
    if let Some(token) = token {
        let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::InvalidRequest("token contains invalid characters".into()))?;
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

struct ClientInner {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
    listeners: RwLock<Vec<(ListenerId, UnauthorizedListener)>>,
    next_listener: AtomicU64,
}

/// API client for the backend.
/// Clone is cheap - clones share the connection pool, the held token and the listeners.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("has_token", &self.token().is_some())
            .finish()
    }
}

impl ApiClient {
    /// Create a client for `base_url` (origin plus version prefix) with no timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::build(base_url.into(), None)
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::build(
            config.base_url(),
            config.request_timeout_secs.map(Duration::from_secs),
        )
    }

    fn build(base_url: String, timeout: Option<Duration>) -> Result<Self, ApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                token: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.inner.base_url, path)
        } else {
            format!("{}/{}", self.inner.base_url, path)
        }
    }

    // ===== Token =====

    /// Set the bearer token for authenticated requests
    pub fn set_token(&self, token: String) {
        *self.inner.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn clear_token(&self) {
        self.inner
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ===== Unauthorized listeners =====

    /// Register a callback for when the backend rejects the held token.
    /// Runs once per discarded token, on the task that saw the 401.
    pub fn on_unauthorized<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_unauthorized_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Discard the held token if it is the one that was rejected, then notify.
    /// The compare-and-take under the write lock makes concurrent 401s for
    /// the same token produce a single notification.
    fn handle_unauthorized(&self, rejected: &str) {
        let discarded = {
            let mut held = self.inner.token.write().unwrap_or_else(PoisonError::into_inner);
            if held.as_deref() == Some(rejected) {
                held.take().is_some()
            } else {
                false
            }
        };
        if !discarded {
            debug!("401 for a token that is no longer held, ignoring");
            return;
        }

        warn!("Backend rejected the session token, discarding it");
        let listeners: Vec<UnauthorizedListener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    // ===== Request plumbing =====

    /// Resolve which token a request carries and the headers for it.
    fn auth_for(&self, options: &RequestOptions) -> Result<(header::HeaderMap, Option<String>), ApiError> {
        let token = if options.anonymous {
            None
        } else if let Some(ref bearer) = options.bearer {
            Some(bearer.clone())
        } else {
            self.token()
        };
        let headers = bearer_headers(token.as_deref())?;
        let held = if options.bearer.is_some() { None } else { token };
        Ok((headers, held))
    }

    /// Send a request and turn a non-2xx response into an `ApiError`.
    /// `held_token` is the held token the request carried, if any.
    async fn execute(&self, builder: RequestBuilder, held_token: Option<String>) -> Result<Response, ApiError> {
        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Request did not reach the server");
            ApiError::Network(e)
        })?;
        self.check_response(response, held_token.as_deref()).await
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(&self, response: Response, held_token: Option<&str>) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status, &body);
        debug!(%status, path = %url, error = %error, "Request failed");

        if status == StatusCode::UNAUTHORIZED {
            if let Some(token) = held_token {
                self.handle_unauthorized(token);
            }
        }
        Err(error)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let path = response.url().path().to_string();
        let raw = response.text().await?;
        let text = if raw.trim().is_empty() { "null" } else { raw.as_str() };
        serde_json::from_str(text).map_err(|e| {
            warn!(path = %path, error = %e, "Failed to parse response");
            ApiError::InvalidResponse(format!("{} from {}: {}", e, path, ApiError::truncate_body(text)))
        })
    }

    /// Issue a JSON request and parse the JSON response.
    ///
    /// `Content-Type: application/json` is attached when a body is present and
    /// the bearer token per `options`. GETs that are rate limited are retried
    /// with exponential backoff.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let (mut headers, held_token) = self.auth_for(&options)?;
            if body.is_some() {
                headers.insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("application/json"),
                );
            }

            let mut builder = self.inner.http.request(method.clone(), &url).headers(headers);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            debug!(%method, path = path, "Sending request");
            match self.execute(builder, held_token).await {
                Err(ApiError::RateLimited) if method == Method::GET && retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    warn!(path = path, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
                Err(e) => return Err(e),
                Ok(response) => return Self::decode(response).await,
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::GET, path, None, RequestOptions::default())
            .await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request::<IgnoredAny, ()>(Method::DELETE, path, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    // ===== Authentication =====

    /// Create an account. Does not sign in.
    pub async fn register(&self, details: &Registration) -> Result<CreatedUser, ApiError> {
        self.request(
            Method::POST,
            "/auth/register",
            Some(details),
            RequestOptions::anonymous(),
        )
        .await
    }

    /// Exchange credentials for a bearer token (form-encoded, OAuth2 password flow).
    pub async fn login(&self, credentials: &Credentials) -> Result<TokenResponse, ApiError> {
        let builder = self
            .inner
            .http
            .post(self.url("/auth/token"))
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password()),
            ]);

        debug!(username = %credentials.username, "Requesting token");
        let response = self.execute(builder, None).await?;
        let token: TokenResponse = Self::decode(response).await?;
        info!(username = %credentials.username, "Token issued");
        Ok(token)
    }

    /// Identity for the held token
    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.get("/auth/users/me").await
    }

    /// Identity for a specific token, without touching the held one.
    pub async fn current_user_with(&self, token: &str) -> Result<User, ApiError> {
        self.request::<User, ()>(
            Method::GET,
            "/auth/users/me",
            None,
            RequestOptions::with_bearer(token),
        )
        .await
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "email": email });
        self.request::<IgnoredAny, _>(
            Method::POST,
            "/auth/forgot-password",
            Some(&body),
            RequestOptions::anonymous(),
        )
        .await?;
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "token": token, "new_password": new_password });
        self.request::<IgnoredAny, _>(
            Method::POST,
            "/auth/reset-password",
            Some(&body),
            RequestOptions::anonymous(),
        )
        .await?;
        Ok(())
    }

    // ===== Folders and files =====

    pub async fn folder_tree(&self) -> Result<FolderTree, ApiError> {
        self.get("/folders/tree").await
    }

    pub async fn create_folder(&self, folder: &NewFolder) -> Result<FolderNode, ApiError> {
        self.post("/folders", folder).await
    }

    /// Upload a file into `folder_id`, or the root when `None`.
    /// `progress` is called as chunks are handed to the transport.
    pub async fn upload_file(
        &self,
        folder_id: Option<i64>,
        file: UploadFile,
        progress: Option<ProgressFn>,
    ) -> Result<FileEntry, ApiError> {
        let path = match folder_id {
            Some(id) => format!("/folders/{}/upload", id),
            None => "/folders/upload".to_string(),
        };
        let filename = file.filename().to_string();
        let total = file.total();
        let form = Form::new().part("file", file.into_part(progress)?);

        // No Content-Type here: reqwest sets the multipart boundary itself
        let (headers, held_token) = self.auth_for(&RequestOptions::default())?;
        let builder = self
            .inner
            .http
            .post(self.url(&path))
            .headers(headers)
            .multipart(form);

        debug!(path = %path, filename = %filename, ?total, "Uploading file");
        let response = self.execute(builder, held_token).await?;
        let entry: FileEntry = Self::decode(response).await?;
        info!(file_id = entry.id, filename = %entry.filename, "Upload complete");
        Ok(entry)
    }

    pub async fn delete_folder(&self, folder_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/folders/{}", folder_id)).await
    }

    pub async fn delete_file(&self, file_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/folders/file/{}", file_id)).await
    }

    // ===== Usage =====

    pub async fn usage(&self, period: UsagePeriod) -> Result<UsageMetrics, ApiError> {
        self.get(&format!("/usage/{}", period)).await
    }

    /// Usage for `period`, treating 404 ("no data yet") as zero usage.
    pub async fn usage_or_zeroed(
        &self,
        period: UsagePeriod,
        remaining_credits: f64,
    ) -> Result<UsageMetrics, ApiError> {
        match self.usage(period).await {
            Err(e) if e.is_not_found() => {
                debug!(%period, "No usage recorded yet");
                Ok(UsageMetrics::zeroed(remaining_credits))
            }
            other => other,
        }
    }

    // ===== Knowledge bases =====

    pub async fn knowledge_bases(&self) -> Result<Vec<KnowledgeBase>, ApiError> {
        self.get("/knowledge-bases").await
    }

    pub async fn create_knowledge_base(&self, kb: &NewKnowledgeBase) -> Result<KnowledgeBase, ApiError> {
        self.post("/knowledge-bases", kb).await
    }

    pub async fn delete_knowledge_base(&self, id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/knowledge-bases/{}", id)).await
    }

    // ===== Chat =====

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, ApiError> {
        self.post("/chat", request).await
    }
}
