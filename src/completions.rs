//! Translates upstream predictions into OpenAI chat completion objects and
//! `chat.completion.chunk` SSE streams.

use crate::error::{AppError, AppResult};
use crate::invoker::KeyRotatingInvoker;
use crate::model_input::ModelInput;
use crate::tokens::TokenCounter;
use crate::upstream::{EventStream, ProviderEvent, UpstreamCallError};
use axum::response::sse::Event;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
    pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
    pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Identity shared by every object produced for one request.
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub id: String,
    pub model: String,
}

impl CompletionMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.into(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>, usage: Option<Usage>) -> OutboundChunk {
        OutboundChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: now_ts(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
                logprobs: None,
            }],
            usage,
        }
    }
}

pub fn prompt_tokens(counter: &dyn TokenCounter, input: &ModelInput) -> u64 {
    counter.count(&input.prompt) + counter.count(&input.system_prompt)
}

/// Runs a blocking prediction and wraps the text in a completion object.
pub async fn complete(
    invoker: &KeyRotatingInvoker,
    counter: &dyn TokenCounter,
    input: &ModelInput,
    meta: CompletionMeta,
) -> AppResult<OutboundCompletion> {
    let content = invoker.invoke_blocking(input).await.map_err(|err| {
        tracing::error!(completion_id = %meta.id, "upstream call failed: {err}");
        AppError::upstream(&err)
    })?;

    let usage = Usage::new(prompt_tokens(counter, input), counter.count(&content));
    tracing::debug!(
        completion_id = %meta.id,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "completion finished"
    );

    Ok(OutboundCompletion {
        id: meta.id,
        object: "chat.completion",
        created: now_ts(),
        model: meta.model,
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
            },
            finish_reason: "stop",
            logprobs: None,
        }],
        usage,
    })
}

/// One unit written to the SSE body.
#[derive(Debug, Clone)]
pub enum Frame {
    Chunk(OutboundChunk),
    Done,
}

impl Frame {
    pub fn to_payload(&self) -> String {
        match self {
            Frame::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string()),
            Frame::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn into_sse_event(self) -> Event {
        Event::default().data(self.to_payload())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Streaming,
    Done,
}

/// Converts provider events into chunk frames.
///
/// The first event of any kind opens the stream with a role chunk. `output`
/// events become content chunks (an empty payload leaves `content` out of the
/// delta), `done` emits the usage chunk followed by the
/// terminator, and anything after that is ignored.
pub struct ChunkTranslator {
    meta: CompletionMeta,
    counter: Arc<dyn TokenCounter>,
    prompt_tokens: u64,
    state: StreamState,
    content: String,
}

impl ChunkTranslator {
    pub fn new(meta: CompletionMeta, counter: Arc<dyn TokenCounter>, prompt_tokens: u64) -> Self {
        Self {
            meta,
            counter,
            prompt_tokens,
            state: StreamState::Init,
            content: String::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn on_event(&mut self, event: ProviderEvent) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.state == StreamState::Done {
            return frames;
        }
        if self.state == StreamState::Init {
            frames.push(Frame::Chunk(self.meta.chunk(
                Delta {
                    role: Some("assistant"),
                    content: None,
                },
                None,
                None,
            )));
            self.state = StreamState::Streaming;
        }

        match (event.event.as_str(), event.data) {
            ("output", Some(data)) => {
                self.content.push_str(&data);
                frames.push(Frame::Chunk(self.meta.chunk(
                    Delta {
                        role: None,
                        content: (!data.is_empty()).then_some(data),
                    },
                    None,
                    None,
                )));
            }
            ("done", _) => {
                let usage = Usage::new(self.prompt_tokens, self.counter.count(&self.content));
                tracing::debug!(
                    completion_id = %self.meta.id,
                    content_len = self.content.len(),
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "stream completed"
                );
                frames.push(Frame::Chunk(self.meta.chunk(
                    Delta::default(),
                    Some("stop"),
                    Some(usage),
                )));
                frames.push(Frame::Done);
                self.state = StreamState::Done;
            }
            _ => {}
        }
        frames
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamAbort {
    #[error("upstream stream failed: {0}")]
    Upstream(#[from] UpstreamCallError),
    #[error("upstream stream ended without a done event")]
    Incomplete,
}

/// Opens the upstream stream and spawns the task that feeds frames to the
/// returned receiver.
///
/// Failing to open the stream at all is reported as an `api_error`; failures
/// after that surface as an `Err` item and end the stream.
pub async fn stream(
    invoker: &KeyRotatingInvoker,
    counter: Arc<dyn TokenCounter>,
    input: &ModelInput,
    meta: CompletionMeta,
    pacing: Duration,
) -> AppResult<ReceiverStream<Result<Frame, StreamAbort>>> {
    let prompt_tokens = prompt_tokens(counter.as_ref(), input);
    let events = invoker.invoke_streaming(input).await.map_err(|err| {
        tracing::error!(completion_id = %meta.id, "upstream stream failed to open: {err}");
        AppError::upstream(&err)
    })?;
    let translator = ChunkTranslator::new(meta, counter, prompt_tokens);
    Ok(spawn_frames(events, translator, pacing))
}

/// Drives `translator` over `events` on a background task.
///
/// The task stops pulling from upstream as soon as the receiver is dropped,
/// which releases the upstream connection.
pub fn spawn_frames(
    mut events: EventStream,
    mut translator: ChunkTranslator,
    pacing: Duration,
) -> ReceiverStream<Result<Frame, StreamAbort>> {
    let (tx, rx) = mpsc::channel::<Result<Frame, StreamAbort>>(64);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(completion_id = %translator.meta.id, "client disconnected, closing upstream stream");
                    events.close();
                    return;
                }
                next = events.next_event() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    tracing::error!(completion_id = %translator.meta.id, "upstream stream failed: {err}");
                    let _ = tx.send(Err(StreamAbort::Upstream(err))).await;
                    return;
                }
                None => {
                    tracing::error!(completion_id = %translator.meta.id, "upstream stream ended without done");
                    let _ = tx.send(Err(StreamAbort::Incomplete)).await;
                    return;
                }
            };

            let paced = event.event == "output" && event.data.is_some();
            for frame in translator.on_event(event) {
                if matches!(frame, Frame::Chunk(_)) {
                    metrics::counter!("repligate_stream_chunks_total").increment(1);
                }
                if tx.send(Ok(frame)).await.is_err() {
                    tracing::debug!(completion_id = %translator.meta.id, "client disconnected, closing upstream stream");
                    events.close();
                    return;
                }
            }
            if translator.state() == StreamState::Done {
                return;
            }
            if paced {
                tokio::time::sleep(pacing).await;
            }
        }
    });
    ReceiverStream::new(rx)
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamErrorKind;
    use futures_util::StreamExt;
    use serde_json::json;

    /// One token per character keeps the arithmetic obvious.
    struct CharCounter;

    impl TokenCounter for CharCounter {
        fn count(&self, text: &str) -> u64 {
            text.chars().count() as u64
        }
    }

    fn translator() -> ChunkTranslator {
        ChunkTranslator::new(
            CompletionMeta {
                id: "chatcmpl-test".to_string(),
                model: "m".to_string(),
            },
            Arc::new(CharCounter),
            7,
        )
    }

    fn payloads(frames: &[Frame]) -> Vec<Value> {
        frames
            .iter()
            .map(|frame| match frame {
                Frame::Chunk(chunk) => serde_json::to_value(chunk).unwrap(),
                Frame::Done => Value::String(DONE_SENTINEL.to_string()),
            })
            .collect()
    }

    fn events(items: Vec<Result<ProviderEvent, UpstreamCallError>>) -> EventStream {
        EventStream::new(futures_util::stream::iter(items))
    }

    #[test]
    fn output_output_done_sequence() {
        let mut t = translator();
        let mut frames = Vec::new();
        frames.extend(t.on_event(ProviderEvent::output("A")));
        frames.extend(t.on_event(ProviderEvent::output("B")));
        frames.extend(t.on_event(ProviderEvent::done()));
        assert_eq!(t.state(), StreamState::Done);

        let out = payloads(&frames);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0]["choices"][0]["delta"], json!({ "role": "assistant" }));
        assert!(out[0]["choices"][0]["finish_reason"].is_null());
        assert!(out[0].get("usage").is_none());
        assert_eq!(out[1]["choices"][0]["delta"], json!({ "content": "A" }));
        assert_eq!(out[2]["choices"][0]["delta"], json!({ "content": "B" }));
        assert_eq!(out[3]["choices"][0]["delta"], json!({}));
        assert_eq!(out[3]["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            out[3]["usage"],
            json!({ "prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9 })
        );
        assert_eq!(out[4], json!("[DONE]"));

        for chunk in &out[..4] {
            assert_eq!(chunk["id"], "chatcmpl-test");
            assert_eq!(chunk["object"], "chat.completion.chunk");
            assert_eq!(chunk["model"], "m");
            assert_eq!(chunk["choices"][0]["index"], 0);
            assert!(chunk["choices"][0]["logprobs"].is_null());
        }
    }

    #[test]
    fn nothing_is_emitted_after_done() {
        let mut t = translator();
        t.on_event(ProviderEvent::done());
        assert!(t.on_event(ProviderEvent::output("late")).is_empty());
        assert!(t.on_event(ProviderEvent::done()).is_empty());
        assert_eq!(t.content(), "");
    }

    #[test]
    fn unknown_events_open_the_stream_but_emit_nothing_else() {
        let mut t = translator();
        let frames = t.on_event(ProviderEvent {
            event: "logs".to_string(),
            data: Some("loading weights".to_string()),
        });
        let out = payloads(&frames);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(t.state(), StreamState::Streaming);
        assert!(t
            .on_event(ProviderEvent {
                event: "logs".to_string(),
                data: None,
            })
            .is_empty());
    }

    #[test]
    fn output_without_data_is_ignored() {
        let mut t = translator();
        t.on_event(ProviderEvent::output("x"));
        let frames = t.on_event(ProviderEvent {
            event: "output".to_string(),
            data: None,
        });
        assert!(frames.is_empty());
        assert_eq!(t.content(), "x");
    }

    #[test]
    fn empty_output_omits_content() {
        let mut t = translator();
        let frames = t.on_event(ProviderEvent::output(""));
        let out = payloads(&frames);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["choices"][0]["delta"], json!({}));
        assert!(out[1]["choices"][0]["finish_reason"].is_null());
        assert_eq!(t.content(), "");
    }

    #[test]
    fn done_frame_renders_terminator() {
        assert_eq!(Frame::Done.to_payload(), "[DONE]");
    }

    #[tokio::test]
    async fn spawned_stream_delivers_frames_in_order() {
        let frames: Vec<_> = spawn_frames(
            events(vec![
                Ok(ProviderEvent::output("A")),
                Ok(ProviderEvent::output("B")),
                Ok(ProviderEvent::done()),
            ]),
            translator(),
            Duration::from_millis(1),
        )
        .collect()
        .await;
        let frames: Vec<Frame> = frames.into_iter().map(|f| f.unwrap()).collect();
        let out = payloads(&frames);
        assert_eq!(out.len(), 5);
        assert_eq!(out[1]["choices"][0]["delta"]["content"], "A");
        assert_eq!(out[2]["choices"][0]["delta"]["content"], "B");
        assert_eq!(out[3]["usage"]["completion_tokens"], 2);
        assert_eq!(out[4], json!("[DONE]"));
    }

    #[tokio::test(start_paused = true)]
    async fn content_chunks_are_paced() {
        let pacing = Duration::from_millis(5);
        let start = tokio::time::Instant::now();
        let mut rx = spawn_frames(
            events(vec![
                Ok(ProviderEvent {
                    event: "logs".to_string(),
                    data: Some("booting".to_string()),
                }),
                Ok(ProviderEvent::output("A")),
                Ok(ProviderEvent {
                    event: "output".to_string(),
                    data: None,
                }),
                Ok(ProviderEvent::output("B")),
                Ok(ProviderEvent::done()),
            ]),
            translator(),
            pacing,
        );

        let mut arrivals = Vec::new();
        while let Some(item) = rx.next().await {
            arrivals.push((item.unwrap().to_payload(), start.elapsed()));
        }
        let at: Vec<Duration> = arrivals.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            at,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                pacing,
                pacing * 2,
                pacing * 2,
            ]
        );
        assert_eq!(arrivals[4].0, "[DONE]");
        assert_eq!(start.elapsed(), pacing * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_output_events_are_not_paced() {
        let start = tokio::time::Instant::now();
        let items: Vec<_> = spawn_frames(
            events(vec![
                Ok(ProviderEvent {
                    event: "logs".to_string(),
                    data: Some("x".to_string()),
                }),
                Ok(ProviderEvent::done()),
            ]),
            translator(),
            Duration::from_millis(5),
        )
        .collect()
        .await;
        assert_eq!(items.len(), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn stream_without_done_ends_in_error() {
        let items: Vec<_> = spawn_frames(
            events(vec![Ok(ProviderEvent::output("A"))]),
            translator(),
            Duration::ZERO,
        )
        .collect()
        .await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(StreamAbort::Incomplete)));
    }

    #[tokio::test]
    async fn upstream_error_mid_stream_is_propagated() {
        let items: Vec<_> = spawn_frames(
            events(vec![
                Ok(ProviderEvent::output("A")),
                Err(UpstreamCallError::new(
                    UpstreamErrorKind::Stream,
                    None,
                    "boom".to_string(),
                )),
                Ok(ProviderEvent::done()),
            ]),
            translator(),
            Duration::ZERO,
        )
        .collect()
        .await;
        assert_eq!(items.len(), 3);
        match &items[2] {
            Err(StreamAbort::Upstream(err)) => assert_eq!(err.message, "boom"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_stops_pulling_upstream() {
        let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = futures_util::stream::iter(0..1000).map(move |i| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ProviderEvent::output(format!("t{i}")))
        });
        let mut rx = spawn_frames(EventStream::new(upstream), translator(), Duration::from_millis(5));
        let first = rx.next().await.unwrap().unwrap();
        assert!(matches!(first, Frame::Chunk(_)));
        drop(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = pulled.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), seen);
        assert!(seen < 1000);
    }
}
