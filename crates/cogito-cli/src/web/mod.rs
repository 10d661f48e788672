//! HTTP proxy in front of the pipeline (`cogito serve`).

mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use cogito_client::{CacheStatsReport, HttpTransport, Orchestrator};
use cogito_core::{CogitoError, CogitoResult, Contract, ContractKind, RequestState};
use cogito_store::CacheStats;

use crate::config::ServerConfig;
use rate_limit::{Limited, RateLimiter};

const REQUIRED_STATE_FIELDS: [&str; 6] = [
    "currentLocation",
    "guardPosition",
    "inventory",
    "selfAwareness",
    "guardAlertness",
    "escapeAttempts",
];

const CACHE_STATS_HEADER: &str = "x-cache-stats";

type Client = Orchestrator<HttpTransport>;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Client>,
    api_limiter: Arc<RateLimiter>,
    decide_limiter: Arc<RateLimiter>,
    reflect_limiter: Arc<RateLimiter>,
}

impl AppState {
    fn new(orchestrator: Client, config: &ServerConfig) -> Self {
        let window = Duration::from_millis(config.rate_limit_window_ms);
        Self {
            orchestrator: Arc::new(orchestrator),
            api_limiter: Arc::new(RateLimiter::new(window, config.rate_limit_max)),
            decide_limiter: Arc::new(RateLimiter::new(window, config.endpoint_limit_max)),
            reflect_limiter: Arc::new(RateLimiter::new(window, config.endpoint_limit_max)),
        }
    }
}

pub async fn serve(addr: &str, orchestrator: Client, config: &ServerConfig) -> Result<()> {
    let state = AppState::new(orchestrator, config);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "proxy listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serving HTTP")?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/messages", post(proxy_messages))
        .route(
            "/claude/decide",
            post(decide).route_layer(middleware::from_fn_with_state(
                state.clone(),
                limit_decide,
            )),
        )
        .route(
            "/claude/reflect",
            post(reflect).route_layer(middleware::from_fn_with_state(
                state.clone(),
                limit_reflect,
            )),
        )
        .route("/cache/clear", post(clear_cache))
        .route("/cache/stats", get(cache_stats))
        .layer(middleware::from_fn_with_state(state.clone(), limit_api));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Rate limiting ---

async fn limit_api(State(state): State<AppState>, request: Request, next: Next) -> Response {
    enforce(
        &state.api_limiter,
        "Too many requests, please try again later",
        request,
        next,
    )
    .await
}

async fn limit_decide(State(state): State<AppState>, request: Request, next: Next) -> Response {
    enforce(
        &state.decide_limiter,
        "Decision rate limit exceeded",
        request,
        next,
    )
    .await
}

async fn limit_reflect(State(state): State<AppState>, request: Request, next: Next) -> Response {
    enforce(
        &state.reflect_limiter,
        "Reflection rate limit exceeded",
        request,
        next,
    )
    .await
}

async fn enforce(
    limiter: &RateLimiter,
    message: &'static str,
    request: Request,
    next: Next,
) -> Response {
    let key = format!("{}-{}", client_ip(&request), request.uri().path());
    match limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(limited) => {
            warn!(%key, "rate limit exceeded");
            rate_limited(message, limited)
        }
    }
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn rate_limited(message: &str, limited: Limited) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Rate limit exceeded",
            "message": message,
            "retryAfter": limited.retry_after_secs(),
        })),
    )
        .into_response()
}

// --- Handlers ---

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn proxy_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let orchestrator = Arc::clone(&state.orchestrator);
    let joined =
        tokio::task::spawn_blocking(move || orchestrator.transport().forward(&body)).await;
    match joined {
        Ok(Ok((status, body))) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            if !status.is_success() {
                warn!(%status, "vendor returned an error");
            }
            (status, Json(body)).into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "proxy request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "Model API Error", "message": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn decide(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    run_pipeline(state, body, "Failed to get a decision", |o, s| {
        o.request_decision(s)
    })
    .await
}

async fn reflect(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    run_pipeline(state, body, "Failed to get a reflection", |o, s| {
        o.request_reflection(s)
    })
    .await
}

async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    state.orchestrator.clear_caches();
    Json(json!({ "message": "Caches cleared successfully" }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsReport> {
    Json(state.orchestrator.cache_stats())
}

/// Validate the request body, run one pipeline call off the async
/// runtime and attach that kind's cache stats.
async fn run_pipeline<C, F>(state: AppState, body: Value, details: &'static str, call: F) -> Response
where
    C: Contract,
    F: FnOnce(&Client, &RequestState) -> CogitoResult<C> + Send + 'static,
{
    let request_state = match parse_request_state(&body) {
        Ok(s) => s,
        Err((status, body)) => return (status, Json(body)).into_response(),
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    let joined = tokio::task::spawn_blocking(move || {
        let result = call(&orchestrator, &request_state);
        (result, orchestrator.cache_stats())
    })
    .await;

    match joined {
        Ok((Ok(value), stats)) => {
            let header = serde_json::to_string(&kind_stats(&stats, C::KIND))
                .ok()
                .and_then(|s| HeaderValue::from_str(&s).ok());
            match header {
                Some(h) => (
                    [(HeaderName::from_static(CACHE_STATS_HEADER), h)],
                    Json(value),
                )
                    .into_response(),
                None => Json(value).into_response(),
            }
        }
        Ok((Err(e), _)) => {
            error!(kind = %C::KIND, error = %e, "pipeline failed");
            (
                error_status(&e),
                Json(json!({
                    "error": "Model API Error",
                    "message": e.to_string(),
                    "details": details,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

fn parse_request_state(body: &Value) -> Result<RequestState, (StatusCode, Value)> {
    let Some(state) = body.get("state").filter(|s| s.is_object()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            json!({
                "error": "State object is required",
                "message": "Please provide a valid state object",
            }),
        ));
    };

    let missing: Vec<&str> = REQUIRED_STATE_FIELDS
        .iter()
        .copied()
        .filter(|field| state.get(field).is_none())
        .collect();
    if !missing.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Invalid state object",
                "message": format!("Missing required fields: {}", missing.join(", ")),
            }),
        ));
    }

    serde_json::from_value(state.clone()).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            json!({ "error": "Invalid state object", "message": e.to_string() }),
        )
    })
}

fn error_status(err: &CogitoError) -> StatusCode {
    match err {
        CogitoError::Credential { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_stats(report: &CacheStatsReport, kind: ContractKind) -> CacheStats {
    match kind {
        ContractKind::Decision => report.decisions,
        ContractKind::Reflection => report.reflections,
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "handler task failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal Server Error", "message": e.to_string() })),
    )
        .into_response()
}
