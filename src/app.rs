use crate::auth::AuthState;
use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::invoker::KeyRotatingInvoker;
use crate::keys::KeyRotation;
use crate::model_registry::ModelRegistry;
use crate::tokens::{TiktokenCounter, TokenCounter};
use crate::upstream::{ClientFactory, ReplicateConnector};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub invoker: KeyRotatingInvoker,
    pub tokens: Arc<dyn TokenCounter>,
    pub model_registry: ModelRegistry,
    pub metrics: PrometheusHandle,
    pub proxy_model_name: Arc<str>,
    pub stream_pacing: Duration,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const CORS_HEADERS: &[(&str, &str)] = &[
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "POST, OPTIONS, GET"),
    ("access-control-allow-headers", "Content-Type, Authorization"),
    ("access-control-max-age", "86400"),
];

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub max_body_bytes: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("REPLIGATE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let metrics_path = std::env::var("REPLIGATE_METRICS_PATH")
            .ok()
            .filter(|v| v.starts_with('/'))
            .unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    let gateway = GatewayConfig::from_env().map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "config_invalid", err.to_string())
    })?;
    let http = reqwest::Client::builder()
        .user_agent("repligate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let connector = ReplicateConnector::new(
        http,
        gateway.base_url.clone(),
        gateway.poll_interval,
        gateway.upstream_timeout,
    );
    let tokens = TiktokenCounter::o200k()
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "tokenizer_init_failed", err))?;
    load_state_with(
        RuntimeConfig::from_env(),
        gateway,
        Arc::new(connector),
        Arc::new(tokens),
    )
}

/// Assembles state around an explicit provider connector and token counter.
pub fn load_state_with(
    runtime: RuntimeConfig,
    gateway: GatewayConfig,
    factory: Arc<dyn ClientFactory>,
    tokens: Arc<dyn TokenCounter>,
) -> AppResult<AppState> {
    let key_count = gateway.credentials.len();
    let rotation = KeyRotation::new(gateway.credentials).ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_invalid",
            "at least one upstream credential is required",
        )
    })?;
    let invoker = KeyRotatingInvoker::new(factory, rotation, gateway.model_id);
    let metrics = init_metrics()?;

    tracing::info!(
        keys = key_count,
        model = invoker.model_id(),
        max_retries = invoker.max_retries(),
        "gateway state loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth: AuthState::new(gateway.auth_key),
        invoker,
        tokens,
        model_registry: ModelRegistry::default(),
        metrics,
        proxy_model_name: gateway.proxy_model_name.into(),
        stream_pacing: gateway.stream_pacing,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let max_body_bytes = state.runtime.max_body_bytes;
    let mut router = Router::<AppState>::new()
        .route(
            "/v1/models",
            get(crate::handlers::list_models).fallback(crate::handlers::not_found),
        )
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions).fallback(crate::handlers::not_found),
        )
        .route(
            &metrics_path,
            get(crate::handlers::metrics).fallback(crate::handlers::not_found),
        )
        .fallback(crate::handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(axum::middleware::from_fn(preflight));
    for (name, value) in CORS_HEADERS {
        router = router.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(*name),
            HeaderValue::from_static(*value),
        ));
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
}

/// Answers every `OPTIONS` request, whatever the path, with an empty 204.
async fn preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(req).await
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("unhandled error in handler: {detail}");
    AppError::internal().into_response()
}
