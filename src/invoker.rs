use crate::config::mask_credential;
use crate::keys::KeyRotation;
use crate::model_input::ModelInput;
use crate::upstream::{ClientFactory, EventStream, UpstreamCallError, UpstreamErrorKind};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on retries, independent of how many credentials exist.
pub const MAX_RETRIES: usize = 3;

/// Calls the upstream model, rotating to the next credential on each failed
/// attempt.
///
/// A call makes at most `min(credentials, 3) + 1` attempts. Every attempt
/// takes the next credential from the shared rotation and builds a fresh
/// client for it.
#[derive(Clone)]
pub struct KeyRotatingInvoker {
    factory: Arc<dyn ClientFactory>,
    rotation: KeyRotation,
    model_id: Arc<str>,
}

impl KeyRotatingInvoker {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        rotation: KeyRotation,
        model_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            factory,
            rotation,
            model_id: model_id.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn max_retries(&self) -> usize {
        self.rotation.len().min(MAX_RETRIES)
    }

    pub async fn invoke_blocking(&self, input: &ModelInput) -> Result<String, UpstreamCallError> {
        let max_attempts = self.max_retries() + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let credential = self.rotation.next();
            let client = self.factory.client(credential);
            tracing::debug!(
                attempt,
                max_attempts,
                model = %self.model_id,
                key = %mask_credential(credential),
                "blocking upstream call"
            );
            metrics::counter!("repligate_upstream_attempts_total", "mode" => "blocking")
                .increment(1);

            match client.run(&self.model_id, input).await {
                Ok(output) => return Ok(output_to_text(output)),
                Err(err) => {
                    record_failure("blocking", attempt, max_attempts, credential, &err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(all_keys_failed))
    }

    /// Opens a streaming prediction.
    ///
    /// An attempt counts as failed when opening the stream fails or the stream
    /// fails before yielding its first event. Once an event has been yielded
    /// the stream is handed to the caller and later failures surface through
    /// it, never through a retry.
    pub async fn invoke_streaming(
        &self,
        input: &ModelInput,
    ) -> Result<EventStream, UpstreamCallError> {
        let max_attempts = self.max_retries() + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let credential = self.rotation.next();
            let client = self.factory.client(credential);
            tracing::debug!(
                attempt,
                max_attempts,
                model = %self.model_id,
                key = %mask_credential(credential),
                "streaming upstream call"
            );
            metrics::counter!("repligate_upstream_attempts_total", "mode" => "stream")
                .increment(1);

            let failure = match client.stream(&self.model_id, input).await {
                Ok(mut events) => match events.next_event().await {
                    Some(Ok(first)) => {
                        let rest = futures_util::stream::once(async move { Ok(first) })
                            .chain(events);
                        return Ok(EventStream::new(rest));
                    }
                    Some(Err(err)) => err,
                    None => return Ok(EventStream::new(futures_util::stream::empty())),
                },
                Err(err) => err,
            };

            record_failure("stream", attempt, max_attempts, credential, &failure);
            last_error = Some(failure);
        }

        Err(last_error.unwrap_or_else(all_keys_failed))
    }
}

fn record_failure(
    mode: &'static str,
    attempt: usize,
    max_attempts: usize,
    credential: &str,
    err: &UpstreamCallError,
) {
    metrics::counter!(
        "repligate_upstream_failures_total",
        "mode" => mode,
        "kind" => err.kind.as_str()
    )
    .increment(1);
    tracing::warn!(
        mode,
        attempt,
        max_attempts,
        key = %mask_credential(credential),
        kind = err.kind.as_str(),
        status = err.status.map(|s| s.as_u16()),
        code = err.code.as_deref(),
        "upstream call failed: {err}"
    );
}

/// Array outputs are token fragments and are concatenated as-is.
pub fn output_to_text(output: Value) -> String {
    match output {
        Value::String(s) => s,
        Value::Array(items) => items.into_iter().map(fragment_to_text).collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn fragment_to_text(item: Value) -> String {
    match item {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn all_keys_failed() -> UpstreamCallError {
    UpstreamCallError::new(
        UpstreamErrorKind::Network,
        None,
        "all api keys failed".to_string(),
    )
}
