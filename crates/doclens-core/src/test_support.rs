//! In-process mock of the backend for tests.
//!
//! Serves the `/api/v1` surface on an ephemeral localhost port with axum.
//! One user exists: `alice` / `secret`, whose token is [`VALID_TOKEN`].

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::ApiClient;
use crate::models::UsageMetrics;

pub const VALID_TOKEN: &str = "tok-alice-1";

/// Rejected like any unknown token, but only after [`SLOW_REJECTION`].
pub const SLOW_REJECTED_TOKEN: &str = "slow-expired";

const SLOW_REJECTION: std::time::Duration = std::time::Duration::from_millis(300);

type Shared = Arc<MockState>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockState {
    requests: AtomicUsize,
    last_authorization: Mutex<Option<String>>,
    last_path: Mutex<Option<String>>,
    last_content_type: Mutex<Option<String>>,
    uploaded_bytes: AtomicUsize,
    revoked: AtomicBool,
    rate_limited: AtomicUsize,
    credits: Mutex<f64>,
    usage: Mutex<Option<UsageMetrics>>,
    knowledge_bases: Mutex<Vec<Value>>,
    next_id: AtomicI64,
}

impl MockState {
    fn new() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            last_authorization: Mutex::new(None),
            last_path: Mutex::new(None),
            last_content_type: Mutex::new(None),
            uploaded_bytes: AtomicUsize::new(0),
            revoked: AtomicBool::new(false),
            rate_limited: AtomicUsize::new(0),
            credits: Mutex::new(100.0),
            usage: Mutex::new(None),
            knowledge_bases: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_authorization(&self) -> Option<String> {
        lock(&self.last_authorization).clone()
    }

    pub fn last_path(&self) -> Option<String> {
        lock(&self.last_path).clone()
    }

    pub fn last_content_type(&self) -> Option<String> {
        lock(&self.last_content_type).clone()
    }

    pub fn uploaded_bytes(&self) -> usize {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// Reject every token from now on.
    pub fn revoke_tokens(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Answer the next `n` requests with 429.
    pub fn rate_limit_next(&self, n: usize) {
        self.rate_limited.store(n, Ordering::SeqCst);
    }

    pub fn set_credits(&self, credits: f64) {
        *lock(&self.credits) = credits;
    }

    pub fn set_usage(&self, usage: UsageMetrics) {
        *lock(&self.usage) = Some(usage);
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Shared,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::new());
        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{}/api/v1", addr),
            state,
        }
    }

    pub fn client(&self) -> ApiClient {
        ApiClient::new(self.base_url.clone()).expect("client for mock backend")
    }
}

fn router(state: Shared) -> Router {
    let api = Router::new()
        .route("/auth/token", post(token))
        .route("/auth/register", post(register))
        .route("/auth/users/me", get(me))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/folders", post(create_folder))
        .route("/folders/tree", get(tree))
        .route("/folders/upload", post(upload_root))
        .route("/folders/{id}/upload", post(upload_into))
        .route("/folders/{id}", delete(delete_folder))
        .route("/folders/file/{id}", delete(delete_file))
        .route("/usage/{period}", get(usage))
        .route("/knowledge-bases", get(list_kbs).post(create_kb))
        .route("/knowledge-bases/{id}", delete(delete_kb))
        .route("/chat", post(chat))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state, record))
}

async fn record(State(state): State<Shared>, request: Request, next: Next) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    {
        // Borrows of the request must end before `next.run`
        let header_text = |name: header::HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        *lock(&state.last_authorization) = header_text(header::AUTHORIZATION);
        *lock(&state.last_content_type) = header_text(header::CONTENT_TYPE);
        *lock(&state.last_path) = Some(request.uri().path().to_string());
    }

    let limited = state
        .rate_limited
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if limited {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }
    next.run(request).await
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn authorize(state: &MockState, headers: &HeaderMap) -> Result<(), Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if token == Some(VALID_TOKEN) && !state.revoked.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(detail(StatusCode::UNAUTHORIZED, "Could not validate credentials"))
    }
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn token(Form(form): Form<LoginForm>) -> Response {
    if form.username == "alice" && form.password == "secret" {
        Json(json!({ "access_token": VALID_TOKEN, "token_type": "bearer" })).into_response()
    } else {
        detail(StatusCode::UNAUTHORIZED, "Incorrect username or password")
    }
}

async fn register(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    if body["email"] == "taken@example.com" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": [{
                "loc": ["body", "email"],
                "msg": "Email already registered",
                "type": "value_error"
            }]})),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "id": state.next_id(),
            "username": body["username"],
            "email": body["email"],
            "is_verified": false
        })),
    )
        .into_response()
}

async fn me(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let slow = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", SLOW_REJECTED_TOKEN));
    if slow {
        tokio::time::sleep(SLOW_REJECTION).await;
    }
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let credits = *lock(&state.credits);
    Json(json!({
        "id": 1,
        "username": "alice",
        "email": "alice@example.com",
        "credits": credits
    }))
    .into_response()
}

async fn forgot_password(Json(_body): Json<Value>) -> Response {
    Json(json!({ "message": "If the account exists, a reset email was sent" })).into_response()
}

async fn reset_password(Json(body): Json<Value>) -> Response {
    if body["token"] == "reset-ok" {
        StatusCode::OK.into_response()
    } else {
        detail(StatusCode::BAD_REQUEST, "Invalid or expired reset token")
    }
}

async fn tree(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(json!([
        {"id": 1, "name": "Contracts", "parent_id": null, "children": [],
         "files": [{"id": 10, "filename": "nda.pdf", "size": 1024, "folder_id": 1}]},
        {"id": 2, "name": "Invoices", "parent_id": null, "children": [],
         "files": [{"id": 11, "filename": "march.pdf", "size": 2048, "folder_id": 2}]}
    ]))
    .into_response()
}

async fn create_folder(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(json!({
        "id": state.next_id(),
        "name": body["name"],
        "parent_id": body.get("parent_id").cloned().unwrap_or(Value::Null)
    }))
    .into_response()
}

fn multipart_filename(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.split("filename=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap_or("unnamed")
        .to_string()
}

fn store_upload(state: &MockState, headers: &HeaderMap, folder_id: Option<i64>, body: &[u8]) -> Response {
    if let Err(rejection) = authorize(state, headers) {
        return rejection;
    }
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    if !is_multipart {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "Expected multipart form data");
    }
    state.uploaded_bytes.fetch_add(body.len(), Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({
            "id": state.next_id(),
            "filename": multipart_filename(body),
            "size": body.len(),
            "folder_id": folder_id
        })),
    )
        .into_response()
}

async fn upload_root(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    store_upload(&state, &headers, None, &body)
}

async fn upload_into(
    State(state): State<Shared>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store_upload(&state, &headers, Some(id), &body)
}

async fn delete_folder(State(state): State<Shared>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match id {
        1 | 2 => StatusCode::NO_CONTENT.into_response(),
        _ => detail(StatusCode::NOT_FOUND, "Folder not found"),
    }
}

async fn delete_file(State(state): State<Shared>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match id {
        10 | 11 => Json(json!({ "message": "File deleted" })).into_response(),
        _ => detail(StatusCode::NOT_FOUND, "File not found"),
    }
}

async fn usage(State(state): State<Shared>, Path(_period): Path<String>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match lock(&state.usage).clone() {
        Some(usage) => Json(json!({
            "total_calls": usage.total_calls,
            "total_credits_used": usage.total_credits_used,
            "remaining_credits": usage.remaining_credits,
            "most_used_endpoint": usage.most_used_endpoint
        }))
        .into_response(),
        None => detail(StatusCode::NOT_FOUND, "No usage data for this period"),
    }
}

async fn list_kbs(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(Value::Array(lock(&state.knowledge_bases).clone())).into_response()
}

async fn create_kb(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let kb = json!({
        "id": state.next_id(),
        "name": body["name"],
        "description": body.get("description").cloned().unwrap_or(Value::Null),
        "file_ids": body["file_ids"],
        "created_at": "2024-03-05T10:00:00"
    });
    lock(&state.knowledge_bases).push(kb.clone());
    (StatusCode::CREATED, Json(kb)).into_response()
}

async fn delete_kb(State(state): State<Shared>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let mut kbs = lock(&state.knowledge_bases);
    let before = kbs.len();
    kbs.retain(|kb| kb["id"] != id);
    if kbs.len() == before {
        detail(StatusCode::NOT_FOUND, "Knowledge base not found")
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn chat(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let message = body["message"].as_str().unwrap_or_default();
    Json(json!({ "response": format!("You asked: {}", message), "credits_used": 1.0 })).into_response()
}
