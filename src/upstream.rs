use crate::model_input::ModelInput;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Prediction,
    Stream,
}

impl UpstreamErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamErrorKind::Network => "network",
            UpstreamErrorKind::Http => "http",
            UpstreamErrorKind::Prediction => "prediction",
            UpstreamErrorKind::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

/// One server-sent event from a streaming prediction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<String>,
}

impl ProviderEvent {
    pub fn output(data: impl Into<String>) -> Self {
        Self {
            event: "output".to_string(),
            data: Some(data.into()),
        }
    }

    pub fn done() -> Self {
        Self {
            event: "done".to_string(),
            data: None,
        }
    }
}

/// Forward-only sequence of provider events. Dropping it, or calling
/// [`EventStream::close`], releases the upstream connection.
pub struct EventStream {
    inner: BoxStream<'static, Result<ProviderEvent, UpstreamCallError>>,
}

impl EventStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<ProviderEvent, UpstreamCallError>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub async fn next_event(&mut self) -> Option<Result<ProviderEvent, UpstreamCallError>> {
        self.inner.next().await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Stream for EventStream {
    type Item = Result<ProviderEvent, UpstreamCallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// A provider client bound to one credential.
#[async_trait::async_trait]
pub trait PredictionClient: Send + Sync {
    /// Runs a prediction to completion and returns its raw output.
    async fn run(&self, model_id: &str, input: &ModelInput) -> Result<Value, UpstreamCallError>;

    /// Starts a streaming prediction.
    async fn stream(
        &self,
        model_id: &str,
        input: &ModelInput,
    ) -> Result<EventStream, UpstreamCallError>;
}

/// Builds a fresh client for a credential.
pub trait ClientFactory: Send + Sync {
    fn client(&self, credential: &str) -> Box<dyn PredictionClient>;
}

#[derive(Clone)]
pub struct ReplicateConnector {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl ReplicateConnector {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            poll_interval,
            timeout,
        }
    }
}

impl ClientFactory for ReplicateConnector {
    fn client(&self, credential: &str) -> Box<dyn PredictionClient> {
        Box::new(ReplicateClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: credential.to_string(),
            poll_interval: self.poll_interval,
            timeout: self.timeout,
        })
    }
}

pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    urls: PredictionUrls,
}

#[derive(Debug, Default, Deserialize)]
struct PredictionUrls {
    #[serde(default)]
    get: Option<String>,
    #[serde(default)]
    stream: Option<String>,
}

impl ReplicateClient {
    async fn create_prediction(
        &self,
        model_id: &str,
        input: &ModelInput,
        stream: bool,
    ) -> Result<Prediction, UpstreamCallError> {
        let (path, mut body) = prediction_route(model_id);
        body["input"] = json!(input);
        if stream {
            body["stream"] = Value::Bool(true);
        }
        let mut req = self
            .http
            .post(join_url(&self.base_url, &path))
            .bearer_auth(&self.token)
            .json(&body);
        if !stream {
            req = req.header("Prefer", "wait");
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let resp = send_checked(req).await?;
        decode_prediction(resp).await
    }

    async fn fetch_prediction(&self, url: &str) -> Result<Prediction, UpstreamCallError> {
        let mut req = self.http.get(url).bearer_auth(&self.token);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let resp = send_checked(req).await?;
        decode_prediction(resp).await
    }
}

#[async_trait::async_trait]
impl PredictionClient for ReplicateClient {
    async fn run(&self, model_id: &str, input: &ModelInput) -> Result<Value, UpstreamCallError> {
        let mut prediction = self.create_prediction(model_id, input, false).await?;
        loop {
            match prediction.status.as_str() {
                "succeeded" => return Ok(prediction.output.unwrap_or(Value::Null)),
                "failed" | "canceled" | "aborted" => {
                    let detail = match prediction.error {
                        Some(Value::String(s)) => s,
                        Some(Value::Null) | None => format!("prediction {}", prediction.status),
                        Some(other) => other.to_string(),
                    };
                    return Err(UpstreamCallError::new(
                        UpstreamErrorKind::Prediction,
                        None,
                        format!("prediction {} {}: {}", prediction.id, prediction.status, detail),
                    ));
                }
                _ => {}
            }
            let url = prediction.urls.get.clone().ok_or_else(|| {
                UpstreamCallError::new(
                    UpstreamErrorKind::Http,
                    None,
                    "prediction response has no urls.get".to_string(),
                )
            })?;
            tokio::time::sleep(self.poll_interval).await;
            prediction = self.fetch_prediction(&url).await?;
        }
    }

    async fn stream(
        &self,
        model_id: &str,
        input: &ModelInput,
    ) -> Result<EventStream, UpstreamCallError> {
        let prediction = self.create_prediction(model_id, input, true).await?;
        let url = prediction.urls.stream.ok_or_else(|| {
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                None,
                "model does not support streaming (no urls.stream)".to_string(),
            )
        })?;
        tracing::debug!(prediction_id = %prediction.id, "opening prediction stream");
        let req = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-store");
        let resp = send_checked(req).await?;
        let events = resp
            .bytes_stream()
            .eventsource()
            .map(|item| match item {
                Ok(ev) if ev.event == "error" => Err(UpstreamCallError::new(
                    UpstreamErrorKind::Stream,
                    None,
                    format!("prediction stream error: {}", ev.data),
                )),
                Ok(ev) => Ok(ProviderEvent {
                    event: ev.event,
                    data: Some(ev.data),
                }),
                Err(err) => Err(UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    None,
                    err.to_string(),
                )),
            });
        Ok(EventStream::new(events))
    }
}

/// Official models use the model-scoped endpoint; pinned versions go through
/// the generic predictions endpoint.
fn prediction_route(model_id: &str) -> (String, Value) {
    match model_id.split_once(':') {
        Some((_, version)) => ("/v1/predictions".to_string(), json!({ "version": version })),
        None => (format!("/v1/models/{model_id}/predictions"), json!({})),
    }
}

async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            StatusCode::from_u16(status.as_u16()).ok(),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

async fn decode_prediction(resp: reqwest::Response) -> Result<Prediction, UpstreamCallError> {
    let status = StatusCode::from_u16(resp.status().as_u16()).ok();
    let text = resp
        .text()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, status, err.to_string()))?;
    serde_json::from_str(&text)
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Http, status, err.to_string()))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    format!("{}/{}", base, path)
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .or_else(|| value.get("title"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
