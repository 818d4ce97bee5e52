use crate::app::AppState;
use crate::completions::{self, CompletionMeta, Frame};
use crate::error::{
    AppError, AppResult, CODE_INVALID_JSON, CODE_INVALID_MESSAGES, CODE_REQUEST_TOO_LARGE,
};
use crate::messages;
use crate::model_input;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Served without authentication.
pub async fn list_models(State(state): State<AppState>) -> Response {
    metrics::counter!("repligate_requests_total", "endpoint" => "models").increment(1);
    Json(state.model_registry.list()).into_response()
}

pub async fn not_found() -> AppError {
    AppError::not_found()
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    metrics::counter!("repligate_requests_total", "endpoint" => "chat_completions").increment(1);
    state.auth.authenticate(&headers)?;

    let body = body.map_err(body_rejection)?;
    let body: Value = serde_json::from_slice(&body).map_err(|err| {
        tracing::warn!("failed to parse request JSON: {err}");
        AppError::new(
            StatusCode::BAD_REQUEST,
            CODE_INVALID_JSON,
            "Invalid JSON in request body",
        )
    })?;

    let is_stream = body.get("stream").and_then(Value::as_bool) == Some(true);
    let flat = messages::flatten_value(body.get("messages"));
    let Some(conversation) = flat.conversation_text.as_deref() else {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            CODE_INVALID_MESSAGES,
            "Request body must contain a non-empty 'messages' array.",
        ));
    };

    let input = model_input::build(conversation, &flat.system_prompt, &flat.image_urls);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.proxy_model_name.to_string());
    let meta = CompletionMeta::new(model);
    tracing::debug!(
        completion_id = %meta.id,
        model = %meta.model,
        stream = is_stream,
        has_image = input.image.is_some(),
        "chat completion request"
    );

    if is_stream {
        let frames = completions::stream(
            &state.invoker,
            state.tokens.clone(),
            &input,
            meta,
            state.stream_pacing,
        )
        .await?;
        let events = frames.map(|item| item.map(Frame::into_sse_event));
        let mut resp = Sse::new(events).into_response();
        let resp_headers = resp.headers_mut();
        resp_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        resp_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        return Ok(resp);
    }

    let completion =
        completions::complete(&state.invoker, state.tokens.as_ref(), &input, meta).await?;
    Ok(Json(completion).into_response())
}

fn body_rejection(rejection: BytesRejection) -> AppError {
    tracing::warn!("failed to read request body: {}", rejection.body_text());
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            CODE_REQUEST_TOO_LARGE,
            "Request body exceeds the size limit",
        );
    }
    AppError::new(
        StatusCode::BAD_REQUEST,
        CODE_INVALID_JSON,
        "Invalid JSON in request body",
    )
}
