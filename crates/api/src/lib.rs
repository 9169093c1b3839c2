pub mod openai;

use std::collections::HashMap;
use std::convert::Infallible;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Json, Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Body, Router};
use futures::stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;
use wayfarer_agents::{
    AccessError, AgentConfig, BookingAgent, IdentityProvider, LanguageModel, ModelError,
    ModelRequest, ModelResponse, ScriptedModel, SessionGate, StreamComposer, SyntheticInventory,
    TurnInput,
};
use wayfarer_core::{ConsentDecision, ConversationMessage, Identity, StreamEvent, ToolError, ToolErrorKind};
use wayfarer_observability::{AppMetrics, TracingEventSink};
use wayfarer_storage::Store;

use crate::openai::{OpenAiChatModel, OpenAiRuntimeConfig};

const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;
const MAX_SESSION_ID_LEN: usize = 128;
const STREAM_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_COOKIE_NAME: &str = "wayfarer_session";
const DEFAULT_PURGE_INTERVAL_SECONDS: u64 = 300;

pub type Agent = BookingAgent<ModelBackend, SyntheticInventory, Store>;

/// Which language model answers chat turns.
pub enum ModelBackend {
    OpenAi(OpenAiChatModel),
    Scripted(Arc<ScriptedModel>),
    Offline,
}

impl ModelBackend {
    pub fn from_env() -> Result<Self> {
        match OpenAiRuntimeConfig::from_env() {
            Some(runtime) => Ok(Self::OpenAi(
                OpenAiChatModel::new(runtime).context("failed to build OpenAI client")?,
            )),
            None => Ok(Self::Offline),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::OpenAi(model) => model.model_name(),
            Self::Scripted(_) => "scripted",
            Self::Offline => "offline",
        }
    }
}

impl LanguageModel for ModelBackend {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        match self {
            Self::OpenAi(model) => model.respond(request).await,
            Self::Scripted(model) => model.respond(request).await,
            Self::Offline => Err(ModelError::Unconfigured(
                "no language model configured; set OPENAI_API_KEY".to_string(),
            )),
        }
    }
}

/// Issued session tokens and the users they belong to.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds tokens from `WAYFARER_DEV_SESSIONS`, a comma-separated list of
    /// `token:user_id[:display name]` entries.
    pub fn from_env() -> Self {
        let directory = Self::new();
        if let Ok(raw) = env::var("WAYFARER_DEV_SESSIONS") {
            for entry in raw.split(',') {
                let mut parts = entry.trim().splitn(3, ':');
                let (Some(token), Some(user_id)) = (parts.next(), parts.next()) else {
                    continue;
                };
                if token.is_empty() || user_id.is_empty() {
                    continue;
                }
                let display_name = parts
                    .next()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty());
                directory.insert(
                    token,
                    Identity {
                        user_id: user_id.to_string(),
                        display_name,
                    },
                );
            }
        }
        directory
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.write().insert(token.into(), identity);
    }

    pub fn issue(&self, identity: Identity) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.insert(token.clone(), identity);
        token
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }
}

impl IdentityProvider for SessionDirectory {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        self.tokens.read().get(credential).cloned()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
    pub metrics: Arc<AppMetrics>,
    pub identities: Arc<SessionDirectory>,
    pub api_key: String,
    pub allowed_origins: Arc<Vec<String>>,
    pub cookie_name: String,
}

impl ApiState {
    pub fn new(
        model: ModelBackend,
        store: Store,
        identities: Arc<SessionDirectory>,
        config: AgentConfig,
        api_key: impl Into<String>,
    ) -> Self {
        let metrics = AppMetrics::shared();
        let agent = Arc::new(BookingAgent::new(
            Arc::new(model),
            Arc::new(SyntheticInventory::new()),
            Arc::new(store),
            Arc::new(TracingEventSink),
            metrics.clone(),
            config,
        ));

        Self {
            agent,
            metrics,
            identities,
            api_key: api_key.into(),
            allowed_origins: Arc::new(parse_allowed_origins()),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }

    fn gate_for(&self, headers: &HeaderMap) -> SessionGate {
        let provider: Arc<dyn IdentityProvider> = self.identities.clone();
        SessionGate::new(provider, request_credentials(headers, &self.cookie_name))
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp_utc: String,
    model: String,
    metrics: wayfarer_observability::MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    session_id: Option<String>,
    messages: Vec<ConversationMessage>,
}

#[derive(Debug, Deserialize)]
struct ConsentRequest {
    session_id: String,
    offer_id: String,
    approved: bool,
}

pub async fn build_state() -> Result<ApiState> {
    let store = if let Ok(database_url) = env::var("WAYFARER_DATABASE_URL") {
        Store::sqlite(&database_url)
            .await
            .with_context(|| format!("failed to open store at {database_url}"))?
    } else {
        Store::memory()
    };

    let model = ModelBackend::from_env()?;
    let api_key = env::var("WAYFARER_API_KEY").unwrap_or_else(|_| "dev-wayfarer-key".to_string());
    let mut state = ApiState::new(
        model,
        store,
        Arc::new(SessionDirectory::from_env()),
        AgentConfig::from_env(),
        api_key,
    );
    if let Ok(cookie_name) = env::var("WAYFARER_SESSION_COOKIE_NAME") {
        if !cookie_name.trim().is_empty() {
            state.cookie_name = cookie_name.trim().to_string();
        }
    }

    info!(model = %state.agent.model().label(), "wayfarer state ready");
    Ok(state)
}

pub async fn build_app() -> Result<Router> {
    let state = build_state().await?;
    spawn_session_janitor(state.agent.clone(), purge_interval_from_env());
    Ok(build_router(state))
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tools", get(tools))
        .route("/v1/chat", post(chat))
        .route("/v1/payments/consent", post(payment_consent))
        .route("/v1/sessions/:session_id/workflow", get(session_workflow))
        .route("/v1/bookings/past", get(past_bookings))
        .layer(build_cors_layer(&state.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .with_state(state)
}

/// Periodically drops expired sessions from the store and their workflow
/// state from the sequencer.
pub fn spawn_session_janitor(agent: Arc<Agent>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match agent.purge_expired_sessions(chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired sessions purged"),
                Err(error) => warn!(error = %error, "session purge failed"),
            }
        }
    })
}

fn purge_interval_from_env() -> Duration {
    Duration::from_secs(
        env::var("WAYFARER_PURGE_INTERVAL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PURGE_INTERVAL_SECONDS),
    )
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let payload = HealthResponse {
        status: "ok",
        timestamp_utc: chrono::Utc::now().to_rfc3339(),
        model: state.agent.model().label().to_string(),
        metrics: state.metrics.snapshot(),
    };
    (StatusCode::OK, Json(payload))
}

async fn tools(State(state): State<ApiState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.agent.catalog().definitions()))
}

async fn chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "messages must not be empty",
        );
    }

    let session_id = match request.session_id.map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => value,
        _ => Uuid::new_v4().to_string(),
    };
    let Some(session_header) = valid_session_id(&session_id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_session_id",
            "session_id must be at most 128 visible ASCII characters",
        );
    };

    let input = TurnInput {
        session_id: session_id.clone(),
        messages: request.messages,
        gate: state.gate_for(&headers),
    };
    let (mut composer, receiver) = StreamComposer::channel(STREAM_CHANNEL_CAPACITY);
    let agent = state.agent.clone();
    tokio::spawn(async move {
        if let Err(error) = agent.run_turn(input, &mut composer).await {
            warn!(session_id = %session_id, error = %error, "chat turn rejected");
        }
    });

    let events = stream::unfold(receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        Some((Ok::<Event, Infallible>(sse_event(&event)), receiver))
    });

    (
        [(HeaderName::from_static("x-session-id"), session_header)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

fn sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|error| {
        serde_json::json!({
            "seq": event.seq,
            "type": "error",
            "message": format!("failed to encode event: {error}")
        })
        .to_string()
    });
    Event::default()
        .event(event.kind.name())
        .id(event.seq.to_string())
        .data(data)
}

async fn payment_consent(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ConsentRequest>,
) -> Response {
    let gate = state.gate_for(&headers);
    match state
        .agent
        .apply_consent(
            &request.session_id,
            &request.offer_id,
            ConsentDecision::from(request.approved),
            &gate,
        )
        .await
    {
        Ok(authorization) => (StatusCode::OK, Json(authorization)).into_response(),
        Err(error) => (
            status_for(&error),
            Json(serde_json::json!({ "error": error.to_failure() })),
        )
            .into_response(),
    }
}

async fn session_workflow(
    State(state): State<ApiState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let gate = state.gate_for(&headers);
    match state.agent.workflow_for(&session_id, &gate).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(AccessError::SignedOut) => error_response(
            StatusCode::UNAUTHORIZED,
            "not_authenticated",
            "sign in first to see this session",
        ),
        Err(error @ AccessError::Forbidden(_)) => {
            error_response(StatusCode::FORBIDDEN, "forbidden", &error.to_string())
        }
        Err(AccessError::Storage(error)) => {
            warn!(session_id = %session_id, error = %error, "workflow lookup failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_unavailable",
                "session could not be loaded",
            )
        }
    }
}

async fn past_bookings(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let gate = state.gate_for(&headers);
    match state.agent.past_bookings(&gate).await {
        Ok(Some(bookings)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "bookings": bookings })),
        )
            .into_response(),
        Ok(None) => error_response(
            StatusCode::UNAUTHORIZED,
            "not_authenticated",
            "sign in first to see past bookings",
        ),
        Err(error) => {
            warn!(error = %error, "past bookings lookup failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_unavailable",
                "past bookings could not be loaded",
            )
        }
    }
}

fn status_for(error: &ToolError) -> StatusCode {
    match error.kind() {
        ToolErrorKind::Sequence => StatusCode::CONFLICT,
        ToolErrorKind::Authorization => StatusCode::FORBIDDEN,
        ToolErrorKind::Validation => StatusCode::BAD_REQUEST,
        ToolErrorKind::UnknownTool => StatusCode::NOT_FOUND,
        ToolErrorKind::Upstream => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message
        })),
    )
        .into_response()
}

async fn api_key_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if header_key == state.api_key {
        return next.run(request).await;
    }

    error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "missing or invalid x-api-key",
    )
}

fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/health")
}

fn valid_session_id(session_id: &str) -> Option<HeaderValue> {
    if session_id.len() > MAX_SESSION_ID_LEN || !session_id.bytes().all(|byte| byte.is_ascii_graphic()) {
        return None;
    }
    HeaderValue::from_str(session_id).ok()
}

/// Bearer token first, then the session cookie.
fn request_credentials(headers: &HeaderMap, cookie_name: &str) -> Vec<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    bearer
        .into_iter()
        .chain(read_cookie_value(headers, cookie_name))
        .filter(|credential| !credential.is_empty())
        .collect()
}

fn read_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw_cookie = headers.get(header::COOKIE)?.to_str().ok()?;
    raw_cookie.split(';').find_map(|part| {
        let mut split = part.trim().splitn(2, '=');
        let key = split.next()?.trim();
        let value = split.next()?.trim();
        if key == cookie_name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn parse_allowed_origins() -> Vec<String> {
    let default_origins = ["http://localhost:3000", "http://127.0.0.1:3000"];

    env::var("WAYFARER_ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|| default_origins.iter().map(|value| value.to_string()).collect())
}

fn build_cors_layer(allowed_origins: &Arc<Vec<String>>) -> CorsLayer {
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    let origins = if origins.is_empty() {
        vec![HeaderValue::from_static("http://localhost:3000")]
    } else {
        origins
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ])
        .expose_headers([HeaderName::from_static("x-session-id")])
        .allow_credentials(true)
}
