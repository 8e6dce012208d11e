//! Analysis session controller
//!
//! `StreamConsumer` owns at most one in-flight session. Each session runs as a
//! task that opens the stream, decodes frames, applies events to the shared
//! `SessionState`, and falls back to the non-streaming endpoint on a 404.
//!
//! ## State publication
//! Observers receive `SessionState` snapshots over a `watch` channel. Every
//! write from a session task is checked against the session id and the
//! cancellation token while holding the channel lock, so a cancelled or
//! superseded session can never write again.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::SessionCancellation;
use crate::config::{AnalysisKind, Config};
use crate::error::ConfigError;
use crate::events::{AnalysisResult, EventParser, StreamEvent};
use crate::fallback;
use crate::request::AnalysisRequest;
use crate::sse::FrameDecoder;
use crate::stages::{StageDefinition, StageTracker};
use crate::transport::{AnalysisTransport, ByteStream, HttpTransport, StreamOpen};

/// Error shown when the stream closes before `complete` or `error`
pub const STREAM_ENDED_EARLY: &str = "Stream ended without a complete response";

/// Observable state of the current (or last) session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    /// `None` until the first session starts
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub stages: StageTracker,
    /// Streamed text so far; cleared once the final result arrives
    pub live_text: String,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub is_streaming: bool,
    pub is_active: bool,
    /// The result (or error) came from the non-streaming endpoint
    pub via_fallback: bool,
}

impl SessionState {
    /// State before any session: every stage pending
    pub fn idle(definitions: &[StageDefinition]) -> Self {
        Self {
            session_id: None,
            started_at: None,
            stages: StageTracker::new(definitions),
            live_text: String::new(),
            result: None,
            error: None,
            is_streaming: false,
            is_active: false,
            via_fallback: false,
        }
    }

    fn started(session_id: Uuid, definitions: &[StageDefinition]) -> Self {
        let mut state = Self::idle(definitions);
        state.session_id = Some(session_id);
        state.started_at = Some(Utc::now());
        state.stages.start();
        state.is_active = true;
        state
    }

    /// A result or an error has been set
    pub fn is_settled(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    pub fn any_non_pending(&self) -> bool {
        self.stages.any_non_pending()
    }
}

/// How a session ended, from the caller's point of view
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(AnalysisResult),
    Failed(String),
    /// Cancelled explicitly, superseded by a newer session, or torn down
    Cancelled,
}

/// Options that do not change per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Show every stage completed after a successful fallback
    pub fallback_completes_stages: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            fallback_completes_stages: true,
        }
    }
}

impl From<&Config> for ConsumerOptions {
    fn from(config: &Config) -> Self {
        Self {
            fallback_completes_stages: config.fallback_completes_stages,
        }
    }
}

/// Caller's handle on one started session
#[derive(Debug)]
pub struct SessionHandle {
    cancellation: SessionCancellation,
    state_rx: watch::Receiver<SessionState>,
    settled: Arc<OnceCell<SessionOutcome>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.cancellation.session_id()
    }

    /// Cancel this session; a no-op once it has settled or been superseded
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation(&self) -> SessionCancellation {
        self.cancellation.clone()
    }

    /// Latest published state
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until this session settles, is cancelled, or is replaced
    ///
    /// A session that settled before being replaced still reports its result.
    pub async fn wait(&mut self) -> SessionOutcome {
        let id = self.id();
        let settled = &self.settled;
        let state = self
            .state_rx
            .wait_for(|s| s.session_id != Some(id) || !s.is_active || settled.initialized())
            .await
            .map(|state| state.clone());

        if let Some(outcome) = self.settled.get() {
            return outcome.clone();
        }
        match state {
            Ok(state) if state.session_id == Some(id) => match (state.result, state.error) {
                (Some(result), _) => SessionOutcome::Completed(result),
                (None, Some(error)) => SessionOutcome::Failed(error),
                (None, None) => SessionOutcome::Cancelled,
            },
            _ => SessionOutcome::Cancelled,
        }
    }
}

struct ActiveSession {
    cancellation: SessionCancellation,
    task: JoinHandle<()>,
}

/// Runs analysis sessions against one pair of endpoints
///
/// At most one session is in flight: `start` cancels the previous one, and
/// dropping the consumer cancels whatever is running.
pub struct StreamConsumer {
    transport: Arc<dyn AnalysisTransport>,
    stages: &'static [StageDefinition],
    options: ConsumerOptions,
    state: Arc<watch::Sender<SessionState>>,
    active: Option<ActiveSession>,
}

impl StreamConsumer {
    pub fn new(
        transport: Arc<dyn AnalysisTransport>,
        stages: &'static [StageDefinition],
        options: ConsumerOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::idle(stages));
        Self {
            transport,
            stages,
            options,
            state: Arc::new(state),
            active: None,
        }
    }

    /// HTTP consumer for one analysis kind
    pub fn from_config(config: &Config, kind: AnalysisKind) -> Result<Self, ConfigError> {
        let transport = HttpTransport::from_config(config, kind)?;
        Ok(Self::new(
            Arc::new(transport),
            kind.stages(),
            ConsumerOptions::from(config),
        ))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Start a new session, cancelling any previous one first
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, request: AnalysisRequest) -> SessionHandle {
        self.cancel();

        let session_id = Uuid::new_v4();
        self.state
            .send_replace(SessionState::started(session_id, self.stages));

        let cancellation = SessionCancellation::new(session_id, self.state.clone());
        let settled = Arc::new(OnceCell::new());
        let writer = SessionWriter {
            cancellation: cancellation.clone(),
            state: self.state.clone(),
            settled: settled.clone(),
        };
        let task = tokio::spawn(run_session(SessionTask {
            writer,
            transport: self.transport.clone(),
            request,
            options: self.options,
        }));

        self.active = Some(ActiveSession {
            cancellation: cancellation.clone(),
            task,
        });

        SessionHandle {
            cancellation,
            state_rx: self.state.subscribe(),
            settled,
        }
    }

    /// Cancel the current session, if any. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancellation.cancel();
            active.task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Control flow after applying one event
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Settled,
    EndOfStream,
}

/// The only path by which a session task mutates shared state
#[derive(Clone)]
struct SessionWriter {
    cancellation: SessionCancellation,
    state: Arc<watch::Sender<SessionState>>,
    /// Set in the same write that publishes the result or error
    settled: Arc<OnceCell<SessionOutcome>>,
}

impl SessionWriter {
    fn id(&self) -> Uuid {
        self.cancellation.session_id()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Apply `f` if this session is still current; `f` returns whether it changed anything
    fn update(&self, f: impl FnOnce(&mut SessionState) -> bool) -> bool {
        let id = self.id();
        let cancellation = &self.cancellation;
        self.state.send_if_modified(|state| {
            if cancellation.is_cancelled() || state.session_id != Some(id) {
                return false;
            }
            f(state)
        })
    }

    fn apply(&self, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::Stage { stage_id, status } => {
                self.update(|s| s.stages.apply(&stage_id, status));
                Flow::Continue
            }
            StreamEvent::Chunk { text } => {
                self.update(|s| {
                    s.live_text.push_str(&text);
                    !text.is_empty()
                });
                Flow::Continue
            }
            StreamEvent::Complete { result } => {
                self.complete(result, false);
                Flow::Settled
            }
            StreamEvent::Error { message } => {
                self.fail(message);
                Flow::Settled
            }
            StreamEvent::End => Flow::EndOfStream,
        }
    }

    fn complete(&self, result: AnalysisResult, complete_stages: bool) {
        let chars = result.text.len();
        let settled = &self.settled;
        let applied = self.update(|s| {
            let _ = settled.set(SessionOutcome::Completed(result.clone()));
            s.result = Some(result);
            s.live_text.clear();
            if complete_stages {
                s.stages.complete_all();
            }
            s.is_streaming = false;
            s.is_active = false;
            true
        });
        if applied {
            info!(session = %self.id(), "Analysis completed: {} chars", chars);
        }
    }

    fn fail(&self, message: String) {
        let mut failed_stage = None;
        let settled = &self.settled;
        let applied = self.update(|s| {
            failed_stage = s.stages.mark_active_as_error();
            let _ = settled.set(SessionOutcome::Failed(message.clone()));
            s.error = Some(message);
            s.is_streaming = false;
            s.is_active = false;
            true
        });
        if applied {
            warn!(
                session = %self.id(),
                stage = failed_stage.unwrap_or("-"),
                "Analysis failed"
            );
        }
    }
}

struct SessionTask {
    writer: SessionWriter,
    transport: Arc<dyn AnalysisTransport>,
    request: AnalysisRequest,
    options: ConsumerOptions,
}

async fn run_session(task: SessionTask) {
    let writer = task.writer.clone();
    let session_id = writer.id();
    let started = Instant::now();
    info!(session = %session_id, "Analysis session started");

    // Every exit path, including panics, leaves the session inactive
    scopeguard::defer! {
        writer.update(|s| {
            let was_running = s.is_active || s.is_streaming;
            s.is_active = false;
            s.is_streaming = false;
            was_running
        });
        debug!(session = %session_id, "Session task finished after {:?}", started.elapsed());
    }

    tokio::select! {
        biased;
        _ = task.writer.cancellation.token().cancelled() => {
            debug!(session = %session_id, "Session task stopped by cancellation");
        }
        _ = drive(&task) => {}
    }
}

async fn drive(task: &SessionTask) {
    match task.transport.open_stream(&task.request).await {
        Ok(StreamOpen::Body(stream)) => read_stream(&task.writer, stream).await,
        Ok(StreamOpen::NotFound) => {
            info!(session = %task.writer.id(), "Streaming not supported, using fallback endpoint");
            run_fallback(task).await;
        }
        Err(e) => {
            warn!(session = %task.writer.id(), "Failed to open analysis stream: {}", e);
            task.writer.fail(e.to_string());
        }
    }
}

async fn read_stream(writer: &SessionWriter, mut stream: ByteStream) {
    writer.update(|s| {
        s.is_streaming = true;
        true
    });

    let mut decoder = FrameDecoder::new();
    let mut parser = EventParser::new();

    'read: while let Some(chunk) = stream.next().await {
        if writer.is_cancelled() {
            decoder.discard();
            return;
        }

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session = %writer.id(), "Analysis stream broke: {}", e);
                writer.fail(e.to_string());
                return;
            }
        };

        for frame in decoder.push(&chunk) {
            let Some(event) = parser.parse(&frame) else {
                continue;
            };
            match writer.apply(event) {
                Flow::Continue => {}
                Flow::Settled => return,
                Flow::EndOfStream => break 'read,
            }
        }
    }

    info!(
        session = %writer.id(),
        "Analysis stream closed: {} bytes, {} frames, {} events ({} dropped)",
        decoder.bytes_received(),
        decoder.frame_count(),
        parser.parsed(),
        parser.dropped()
    );
    if !decoder.buffered().trim().is_empty() {
        debug!("Discarding incomplete trailing frame");
        decoder.discard();
    }

    let settled = writer.state.borrow().is_settled();
    if !settled {
        writer.fail(STREAM_ENDED_EARLY.to_string());
    }
}

async fn run_fallback(task: &SessionTask) {
    task.writer.update(|s| {
        s.via_fallback = true;
        true
    });

    match fallback::fetch_result(task.transport.as_ref(), &task.request).await {
        Ok(result) => task
            .writer
            .complete(result, task.options.fallback_completes_stages),
        Err(message) => task.writer.fail(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::fallback::FallbackResponse;
    use crate::stages::{StageStatus, METADATA_STAGES};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type ChunkSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

    enum ScriptedOpen {
        Body(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
        NotFound,
        Fail(TransportError),
        /// Response headers not yet received; answers 404 once released
        Held(oneshot::Receiver<()>),
    }

    /// In-memory transport: each `open_stream` pops the next scripted response
    #[derive(Default)]
    struct ScriptedTransport {
        opens: Mutex<VecDeque<ScriptedOpen>>,
        fallback: Mutex<Option<Result<FallbackResponse, TransportError>>>,
        requests: Mutex<Vec<serde_json::Value>>,
        fallback_calls: Mutex<usize>,
        /// When set, `fetch_fallback` waits for the response on this channel
        held_fallback: Mutex<Option<oneshot::Receiver<FallbackResponse>>>,
    }

    impl ScriptedTransport {
        /// Script a streaming response and return the sender that feeds it
        fn push_stream(&self) -> ChunkSender {
            let (tx, rx) = mpsc::unbounded_channel();
            self.opens.lock().unwrap().push_back(ScriptedOpen::Body(rx));
            tx
        }

        fn push_open(&self, open: ScriptedOpen) {
            self.opens.lock().unwrap().push_back(open);
        }

        fn set_fallback(&self, response: Result<FallbackResponse, TransportError>) {
            *self.fallback.lock().unwrap() = Some(response);
        }

        fn hold_fallback(&self) -> oneshot::Sender<FallbackResponse> {
            let (tx, rx) = oneshot::channel();
            *self.held_fallback.lock().unwrap() = Some(rx);
            tx
        }
    }

    #[async_trait]
    impl AnalysisTransport for ScriptedTransport {
        async fn open_stream(
            &self,
            request: &AnalysisRequest,
        ) -> Result<StreamOpen, TransportError> {
            self.requests.lock().unwrap().push(request.body().clone());
            let next = self.opens.lock().unwrap().pop_front();
            match next {
                Some(ScriptedOpen::Body(rx)) => {
                    Ok(StreamOpen::Body(UnboundedReceiverStream::new(rx).boxed()))
                }
                Some(ScriptedOpen::NotFound) => Ok(StreamOpen::NotFound),
                Some(ScriptedOpen::Fail(e)) => Err(e),
                Some(ScriptedOpen::Held(gate)) => {
                    let _ = gate.await;
                    Ok(StreamOpen::NotFound)
                }
                None => Err(TransportError::MissingBody),
            }
        }

        async fn fetch_fallback(
            &self,
            request: &AnalysisRequest,
        ) -> Result<FallbackResponse, TransportError> {
            self.requests.lock().unwrap().push(request.body().clone());
            *self.fallback_calls.lock().unwrap() += 1;
            let held = self.held_fallback.lock().unwrap().take();
            if let Some(rx) = held {
                return rx.await.map_err(|_| TransportError::MissingBody);
            }
            self.fallback
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(TransportError::MissingBody))
        }
    }

    fn consumer(transport: &Arc<ScriptedTransport>) -> StreamConsumer {
        StreamConsumer::new(
            transport.clone(),
            METADATA_STAGES,
            ConsumerOptions::default(),
        )
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::from_value(json!({"videos": ["abc123"], "modelType": "m1"}))
    }

    fn send(tx: &ChunkSender, text: &str) {
        let _ = tx.send(Ok(Bytes::copy_from_slice(text.as_bytes())));
    }

    fn frame(event: &str, data: &str) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    async fn wait_for_state(
        handle: &SessionHandle,
        predicate: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = handle.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
        state.clone()
    }

    async fn assert_released(tx: &ChunkSender) {
        tokio::time::timeout(Duration::from_secs(2), tx.closed())
            .await
            .expect("stream reader was not released");
    }

    fn statuses(state: &SessionState) -> Vec<StageStatus> {
        state.stages.stages().iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        let stream = [
            "event: stage\ndata: {\"id\":\"prepare\",\"status\":\"completed\"}\n\n".to_string(),
            "event: stage\ndata:{\"id\":\"request\",\"status\":\"active\"}\n\n".to_string(),
            frame("chunk", r#"{"text":"Hello"}"#),
            frame("chunk", r#"{"text":" "}"#),
            frame("chunk", r#"{"text":"World"}"#),
            "event: complete\ndata:{\"text\":\"Hello World\",\"metadata\":{\"model\":\"m1\"}}\n\n"
                .to_string(),
            "event: end\ndata:{}\n\n".to_string(),
        ]
        .concat();
        send(&tx, &stream);

        let expected = AnalysisResult {
            text: "Hello World".to_string(),
            metadata: Some(json!({"model": "m1"})),
        };
        assert_eq!(handle.wait().await, SessionOutcome::Completed(expected.clone()));

        let state = consumer.snapshot();
        assert_eq!(state.live_text, "");
        assert_eq!(state.result, Some(expected));
        assert_eq!(state.error, None);
        assert!(!state.is_streaming);
        assert!(!state.is_active);
        assert!(!state.via_fallback);
        assert_eq!(
            statuses(&state),
            vec![StageStatus::Completed, StageStatus::Active, StageStatus::Pending]
        );
        assert_released(&tx).await;
        assert_eq!(
            transport.requests.lock().unwrap()[0],
            json!({"videos": ["abc123"], "modelType": "m1"})
        );
    }

    #[tokio::test]
    async fn test_live_text_accumulates_before_complete() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("chunk", r#"{"text":"Hel"}"#));
        // Frame split mid-line across two chunks
        send(&tx, "event: chunk\ndata: {\"text\":");
        send(&tx, "\"lo\"}\n\n");
        let state = wait_for_state(&handle, |s| s.live_text == "Hello").await;
        assert!(state.is_streaming);
        assert!(state.is_active);
        assert!(!state.is_settled());

        send(&tx, &frame("complete", r#"{"text":"Hello!"}"#));
        assert!(matches!(handle.wait().await, SessionOutcome::Completed(r) if r.text == "Hello!"));
        assert_eq!(consumer.snapshot().live_text, "");
    }

    #[tokio::test]
    async fn test_happy_path_all_stages_completed() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        for id in ["prepare", "request", "render"] {
            send(&tx, &frame("stage", &format!(r#"{{"id":"{}","status":"active"}}"#, id)));
            let state = wait_for_state(&handle, |s| {
                s.stages.get(id).map(|st| st.status) == Some(StageStatus::Active)
            })
            .await;
            assert_eq!(state.stages.count(StageStatus::Active), 1);
            send(&tx, &frame("stage", &format!(r#"{{"id":"{}","status":"completed"}}"#, id)));
        }
        send(&tx, &frame("complete", r#"{"text":"done"}"#));

        assert!(matches!(handle.wait().await, SessionOutcome::Completed(_)));
        let state = consumer.snapshot();
        assert_eq!(state.stages.count(StageStatus::Completed), 3);
        assert_eq!(state.stages.count(StageStatus::Pending), 0);
        assert_eq!(state.stages.count(StageStatus::Error), 0);
    }

    #[tokio::test]
    async fn test_single_active_stage_after_start() {
        let transport = Arc::new(ScriptedTransport::default());
        let _tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let handle = consumer.start(request());

        let state = handle.state();
        assert_eq!(state.session_id, Some(handle.id()));
        assert_eq!(state.stages.count(StageStatus::Active), 1);
        assert_eq!(state.stages.active_stage().map(|s| s.definition.id), Some("prepare"));
        assert!(state.any_non_pending());
        assert!(state.started_at.is_some());
    }

    #[tokio::test]
    async fn test_server_error_marks_active_stage() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("stage", r#"{"id":"prepare","status":"completed"}"#));
        send(&tx, &frame("stage", r#"{"id":"request","status":"active"}"#));
        send(&tx, &frame("chunk", r#"{"text":"partial"}"#));
        send(&tx, &frame("error", r#"{"message":"Quota exceeded for model m1"}"#));

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Failed("Quota exceeded for model m1".to_string())
        );
        let state = consumer.snapshot();
        assert_eq!(
            statuses(&state),
            vec![StageStatus::Completed, StageStatus::Error, StageStatus::Pending]
        );
        assert_eq!(state.result, None);
        assert!(!state.is_streaming);
        assert_released(&tx).await;
    }

    #[tokio::test]
    async fn test_stream_closed_without_complete() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("chunk", r#"{"text":"cut off"}"#));
        // Trailing frame without a separator is never applied
        send(&tx, "event: complete\ndata: {\"text\":\"never\"}");
        drop(tx);

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Failed(STREAM_ENDED_EARLY.to_string())
        );
        let state = consumer.snapshot();
        assert_eq!(state.stages.get("prepare").map(|s| s.status), Some(StageStatus::Error));
        assert_eq!(state.live_text, "cut off");
    }

    #[tokio::test]
    async fn test_end_event_without_complete_fails() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("end", "{}"));
        assert_eq!(
            handle.wait().await,
            SessionOutcome::Failed(STREAM_ENDED_EARLY.to_string())
        );
        // The reader is released even though the sender is still open
        assert_released(&tx).await;
    }

    #[tokio::test]
    async fn test_malformed_frame_between_valid_frames() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(
            &tx,
            &[
                frame("chunk", r#"{"text":"Hello"}"#),
                frame("chunk", r#"{"text": "broken"#),
                frame("chunk", r#"{"text":" World"}"#),
                frame("heartbeat", "{}"),
            ]
            .concat(),
        );
        let state = wait_for_state(&handle, |s| s.live_text == "Hello World").await;
        assert_eq!(state.error, None);

        send(&tx, &frame("complete", r#"{"text":"Hello World"}"#));
        assert!(matches!(handle.wait().await, SessionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_silent() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("chunk", r#"{"text":"Hello"}"#));
        wait_for_state(&handle, |s| s.live_text == "Hello").await;

        handle.cancel();
        send(&tx, &frame("chunk", r#"{"text":" late"}"#));
        send(&tx, &frame("complete", r#"{"text":"late result"}"#));

        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        assert_released(&tx).await;
        tokio::task::yield_now().await;

        let state = consumer.snapshot();
        assert_eq!(state.error, None);
        assert_eq!(state.result, None);
        assert_eq!(state.live_text, "Hello");
        assert!(!state.is_active);
        assert!(!state.is_streaming);

        // Idempotent, also through the consumer
        handle.cancel();
        consumer.cancel();
        assert_eq!(consumer.snapshot(), state);
    }

    #[tokio::test]
    async fn test_cancel_after_settlement_is_noop() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("complete", r#"{"text":"ok"}"#));
        assert!(matches!(handle.wait().await, SessionOutcome::Completed(_)));
        let settled = consumer.snapshot();

        handle.cancel();
        assert_eq!(consumer.snapshot(), settled);
        assert!(matches!(handle.wait().await, SessionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_new_session_supersedes_previous() {
        let transport = Arc::new(ScriptedTransport::default());
        let first_tx = transport.push_stream();
        let second_tx = transport.push_stream();
        let mut consumer = consumer(&transport);

        let mut first = consumer.start(request());
        send(&first_tx, &frame("chunk", r#"{"text":"first"}"#));
        wait_for_state(&first, |s| s.live_text == "first").await;

        let mut second = consumer.start(request());
        assert_ne!(first.id(), second.id());
        assert_eq!(first.wait().await, SessionOutcome::Cancelled);
        assert_released(&first_tx).await;

        // Late frames for the first session go nowhere
        send(&first_tx, &frame("complete", r#"{"text":"stale"}"#));

        let state = consumer.snapshot();
        assert_eq!(state.session_id, Some(second.id()));
        assert_eq!(state.live_text, "");
        assert_eq!(state.stages.count(StageStatus::Active), 1);

        send(&second_tx, &frame("complete", r#"{"text":"fresh"}"#));
        assert!(matches!(second.wait().await, SessionOutcome::Completed(r) if r.text == "fresh"));
    }

    #[tokio::test]
    async fn test_drop_consumer_cancels_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("chunk", r#"{"text":"Hi"}"#));
        wait_for_state(&handle, |s| s.live_text == "Hi").await;

        drop(consumer);
        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        assert_released(&tx).await;
        assert_eq!(handle.state().error, None);
    }

    #[tokio::test]
    async fn test_not_found_uses_fallback() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_open(ScriptedOpen::NotFound);
        transport.set_fallback(Ok(FallbackResponse {
            success: true,
            analysis: Some("Hello World".to_string()),
            metadata: Some(json!({"model": "m1"})),
            error: None,
        }));
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            SessionOutcome::Completed(AnalysisResult {
                text: "Hello World".to_string(),
                metadata: Some(json!({"model": "m1"})),
            })
        );

        let state = consumer.snapshot();
        assert!(state.via_fallback);
        assert_eq!(state.error, None);
        assert_eq!(state.stages.count(StageStatus::Completed), 3);
        assert_eq!(*transport.fallback_calls.lock().unwrap(), 1);

        // Same body sent to both endpoints
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn test_fallback_matches_streaming_result() {
        let streamed = {
            let transport = Arc::new(ScriptedTransport::default());
            let tx = transport.push_stream();
            let mut consumer = consumer(&transport);
            let mut handle = consumer.start(request());
            send(&tx, &frame("complete", r#"{"text":"Same","metadata":{"tags":["a"]}}"#));
            handle.wait().await
        };

        let fallback = {
            let transport = Arc::new(ScriptedTransport::default());
            transport.push_open(ScriptedOpen::NotFound);
            transport.set_fallback(Ok(serde_json::from_value(json!({
                "success": true,
                "analysis": "Same",
                "metadata": {"tags": ["a"]}
            }))
            .unwrap()));
            let mut consumer = consumer(&transport);
            let mut handle = consumer.start(request());
            handle.wait().await
        };

        assert!(matches!(streamed, SessionOutcome::Completed(_)));
        assert_eq!(streamed, fallback);
    }

    #[tokio::test]
    async fn test_fallback_without_static_stages() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_open(ScriptedOpen::NotFound);
        transport.set_fallback(Ok(FallbackResponse {
            success: true,
            analysis: Some("x".to_string()),
            metadata: None,
            error: None,
        }));
        let mut consumer = StreamConsumer::new(
            transport.clone(),
            METADATA_STAGES,
            ConsumerOptions {
                fallback_completes_stages: false,
            },
        );
        let mut handle = consumer.start(request());

        assert!(matches!(handle.wait().await, SessionOutcome::Completed(_)));
        assert_eq!(consumer.snapshot().stages.count(StageStatus::Completed), 0);
    }

    #[tokio::test]
    async fn test_fallback_failure_marks_stage() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_open(ScriptedOpen::NotFound);
        transport.set_fallback(Ok(FallbackResponse {
            success: false,
            analysis: None,
            metadata: None,
            error: Some("Model unavailable".to_string()),
        }));
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Failed("Model unavailable".to_string())
        );
        let state = consumer.snapshot();
        assert!(state.via_fallback);
        assert_eq!(state.stages.get("prepare").map(|s| s.status), Some(StageStatus::Error));
        assert_eq!(*transport.fallback_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_fallback() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_open(ScriptedOpen::Fail(TransportError::Status { status: 500 }));
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Failed("Request failed with status 500".to_string())
        );
        let state = consumer.snapshot();
        assert!(!state.via_fallback);
        assert_eq!(state.stages.get("prepare").map(|s| s.status), Some(StageStatus::Error));
        assert_eq!(*transport.fallback_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_network_error_mid_stream() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, &frame("stage", r#"{"id":"prepare","status":"completed"}"#));
        send(&tx, &frame("stage", r#"{"id":"request","status":"active"}"#));
        let _ = tx.send(Err(TransportError::MissingBody));

        assert!(matches!(handle.wait().await, SessionOutcome::Failed(_)));
        let state = consumer.snapshot();
        assert_eq!(state.stages.get("request").map(|s| s.status), Some(StageStatus::Error));
    }

    #[tokio::test]
    async fn test_cr_terminated_complete_then_eof() {
        let transport = Arc::new(ScriptedTransport::default());
        let tx = transport.push_stream();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        send(&tx, "event: complete\rdata: {\"text\":\"done\"}\r\r");
        drop(tx);

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Completed(AnalysisResult {
                text: "done".to_string(),
                metadata: None,
            })
        );
        assert_eq!(consumer.snapshot().error, None);
    }

    #[tokio::test]
    async fn test_settled_outcome_survives_next_start() {
        let transport = Arc::new(ScriptedTransport::default());
        let first_tx = transport.push_stream();
        let second_tx = transport.push_stream();
        let mut consumer = consumer(&transport);

        let mut first = consumer.start(request());
        send(&first_tx, &frame("complete", r#"{"text":"first"}"#));
        wait_for_state(&first, |s| s.is_settled()).await;

        let mut second = consumer.start(request());
        assert!(matches!(first.wait().await, SessionOutcome::Completed(r) if r.text == "first"));

        send(&second_tx, &frame("error", r#"{"message":"second failed"}"#));
        wait_for_state(&second, |s| s.is_settled()).await;
        let _third = consumer.start(request());
        assert_eq!(
            second.wait().await,
            SessionOutcome::Failed("second failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_while_stream_is_opening() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut gate, held) = oneshot::channel();
        transport.push_open(ScriptedOpen::Held(held));
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.requests.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream was never opened");

        handle.cancel();
        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        tokio::time::timeout(Duration::from_secs(2), gate.closed())
            .await
            .expect("pending open was not dropped");

        let state = consumer.snapshot();
        assert_eq!(state.error, None);
        assert_eq!(state.result, None);
        assert!(!state.is_active);
        assert!(!state.via_fallback);
        assert_eq!(*transport.fallback_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_fallback_is_pending() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_open(ScriptedOpen::NotFound);
        let mut reply = transport.hold_fallback();
        let mut consumer = consumer(&transport);
        let mut handle = consumer.start(request());

        wait_for_state(&handle, |s| s.via_fallback).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while *transport.fallback_calls.lock().unwrap() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fallback was never requested");

        handle.cancel();
        assert_eq!(handle.wait().await, SessionOutcome::Cancelled);
        tokio::time::timeout(Duration::from_secs(2), reply.closed())
            .await
            .expect("pending fallback was not dropped");

        let late = reply.send(FallbackResponse {
            success: true,
            analysis: Some("late".to_string()),
            metadata: None,
            error: None,
        });
        assert!(late.is_err());

        let state = consumer.snapshot();
        assert_eq!(state.error, None);
        assert_eq!(state.result, None);
        assert!(!state.is_active);
        assert_eq!(
            state.stages.get("prepare").map(|s| s.status),
            Some(StageStatus::Active)
        );
    }
}
