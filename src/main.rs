use axum::http::StatusCode;
use repligate::app::AppState;
use repligate::error::AppError;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,repligate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, "startup failed: {}", err.message);
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &str, err: impl std::fmt::Display) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, code, err.to_string())
}

fn listen_addr(state: &AppState) -> Result<SocketAddr, AppError> {
    state
        .runtime
        .listen
        .parse()
        .map_err(|err| startup_error("listen_invalid", err))
}

async fn run() -> Result<(), AppError> {
    let state = repligate::app::load_state().await?;
    let addr = listen_addr(&state)?;
    let model = state.invoker.model_id().to_string();
    let app = repligate::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err))?;
    tracing::info!(%addr, upstream_model = %model, "repligate listening");
    axum::serve(listener, app)
        .await
        .map_err(|err| startup_error("serve_failed", err))
}
