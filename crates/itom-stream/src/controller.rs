use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use itom_core::{Artifact, SuggestedAction};
use itom_protocol::{ClarificationRequest, EventStreamDecoder, StreamEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{StreamError, StreamErrorCode};
use crate::state::StreamingState;
use crate::transport::{ByteStream, ChatTransport, StreamRequest};

/// Upper bound on an error body read to extract a message.
const MAX_ERROR_BODY: usize = 64 * 1024;
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Finalized assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub content: String,
    pub artifacts: Vec<Artifact>,
    pub suggested_actions: Vec<SuggestedAction>,
}

/// What the presentation layer is told after an update is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Started {
        message_id: Option<String>,
        agent_id: Option<String>,
    },
    Token(String),
    Completed(Completion),
    Clarification(ClarificationRequest),
    Failed(StreamError),
}

/// Raw signal from a reader task, tagged with the request that produced it.
#[derive(Debug)]
struct Update {
    request_id: u64,
    kind: UpdateKind,
}

#[derive(Debug)]
enum UpdateKind {
    Event(StreamEvent),
    HttpError(String),
    NoBody,
    Network(String),
    BodyEnded,
}

/// Single-flight controller for the streaming chat endpoint.
///
/// Each `start` bumps the request id and spawns one reader task; updates
/// from any other request id are discarded when applied, so a superseded or
/// cancelled request never mutates state.
pub struct StreamController {
    transport: Arc<dyn ChatTransport>,
    idle_timeout: Option<Duration>,
    state: StreamingState,
    next_id: u64,
    live: Option<u64>,
    cancel: Option<CancellationToken>,
    tx: mpsc::Sender<Update>,
    rx: mpsc::Receiver<Update>,
}

impl StreamController {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            transport,
            idle_timeout: None,
            state: StreamingState::Idle,
            next_id: 0,
            live: None,
            cancel: None,
            tx,
            rx,
        }
    }

    /// Fail a stream that yields no bytes for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    /// True while a request may still produce updates.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Begin a request, cancelling any in-flight one. Returns the request id.
    pub fn start(&mut self, request: StreamRequest) -> u64 {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }

        self.next_id += 1;
        let request_id = self.next_id;
        let token = CancellationToken::new();
        self.live = Some(request_id);
        self.cancel = Some(token.clone());
        self.state = StreamingState::Connecting;

        info!(
            request_id,
            conversation_id = request.conversation_id(),
            path = request.path(),
            "starting chat stream"
        );

        let reader = Reader {
            request_id,
            token,
            tx: self.tx.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            reader.run(transport, request, idle_timeout).await;
        });

        request_id
    }

    /// Abort the in-flight request. Returns true if a connecting or
    /// streaming state was turned into `STREAM_ABORTED`.
    pub fn cancel(&mut self) -> bool {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.live = None;

        if !self.state.is_active() {
            return false;
        }
        let partial = self
            .state
            .partial_content()
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        debug!("chat stream cancelled");
        self.state = StreamingState::Error {
            error: StreamError::aborted(),
            partial_content: partial,
        };
        true
    }

    /// Cancel if needed and return to `Idle`.
    pub fn reset(&mut self) {
        self.cancel();
        self.state = StreamingState::Idle;
    }

    /// Wait for the next update from the live request and apply it.
    ///
    /// Pends forever while nothing is in flight. Cancel safe: an update is
    /// only taken off the channel when it is applied in the same poll.
    pub async fn next_outcome(&mut self) -> StreamOutcome {
        loop {
            let Some(update) = self.rx.recv().await else {
                // The controller holds a sender, so the channel never closes.
                std::future::pending::<()>().await;
                continue;
            };
            if self.live != Some(update.request_id) {
                trace!(request_id = update.request_id, "dropping stale stream update");
                continue;
            }
            if let Some(outcome) = self.apply(update.kind) {
                return outcome;
            }
        }
    }

    fn apply(&mut self, kind: UpdateKind) -> Option<StreamOutcome> {
        match kind {
            UpdateKind::Event(event) => self.apply_event(event),
            UpdateKind::HttpError(message) => {
                Some(self.fail(StreamError::new(StreamErrorCode::HttpError, message)))
            }
            UpdateKind::NoBody => Some(self.fail(StreamError::new(
                StreamErrorCode::NoResponseBody,
                "No response body",
            ))),
            UpdateKind::Network(message) => {
                if self.state.is_active() {
                    Some(self.fail(StreamError::new(StreamErrorCode::NetworkError, message)))
                } else {
                    self.live = None;
                    None
                }
            }
            UpdateKind::BodyEnded => {
                self.live = None;
                match std::mem::take(&mut self.state) {
                    StreamingState::Streaming {
                        message_id,
                        agent_id,
                        partial_content,
                        ..
                    } => Some(self.complete(Completion {
                        message_id,
                        agent_id,
                        agent_name: None,
                        content: partial_content,
                        artifacts: Vec::new(),
                        suggested_actions: Vec::new(),
                    })),
                    StreamingState::Connecting => Some(self.fail(StreamError::new(
                        StreamErrorCode::NetworkError,
                        "Stream ended before any response",
                    ))),
                    other => {
                        self.state = other;
                        None
                    }
                }
            }
        }
    }

    fn apply_event(&mut self, event: StreamEvent) -> Option<StreamOutcome> {
        match event {
            StreamEvent::Start(start) => {
                if !matches!(self.state, StreamingState::Connecting) {
                    debug!(state = self.state.name(), "ignoring stream_start");
                    return None;
                }
                self.state = StreamingState::Streaming {
                    message_id: start.message_id.clone(),
                    agent_id: start.agent_id.clone(),
                    partial_content: String::new(),
                    has_received_first_token: false,
                };
                Some(StreamOutcome::Started {
                    message_id: start.message_id,
                    agent_id: start.agent_id,
                })
            }
            StreamEvent::Token { token, .. } => {
                if matches!(self.state, StreamingState::Connecting) {
                    self.state = StreamingState::Streaming {
                        message_id: None,
                        agent_id: None,
                        partial_content: String::new(),
                        has_received_first_token: false,
                    };
                }
                match &mut self.state {
                    StreamingState::Streaming {
                        partial_content,
                        has_received_first_token,
                        ..
                    } => {
                        partial_content.push_str(&token);
                        *has_received_first_token = true;
                        Some(StreamOutcome::Token(token))
                    }
                    other => {
                        debug!(state = other.name(), "ignoring token");
                        None
                    }
                }
            }
            StreamEvent::End(end) => {
                let (message_id, agent_id, partial) = match std::mem::take(&mut self.state) {
                    StreamingState::Connecting => (None, None, String::new()),
                    StreamingState::Streaming {
                        message_id,
                        agent_id,
                        partial_content,
                        ..
                    } => (message_id, agent_id, partial_content),
                    other => {
                        debug!(state = other.name(), "ignoring stream_end");
                        self.state = other;
                        return None;
                    }
                };
                self.live = None;
                let content = end
                    .full_content
                    .filter(|c| !c.is_empty())
                    .unwrap_or(partial);
                Some(self.complete(Completion {
                    message_id: end.message_id.or(message_id),
                    agent_id: end.agent_id.or(agent_id),
                    agent_name: end.agent_name,
                    content,
                    artifacts: end.artifacts,
                    suggested_actions: end.suggested_actions,
                }))
            }
            StreamEvent::Error { code, message } => {
                if !self.state.is_active() {
                    debug!(state = self.state.name(), "ignoring error event");
                    return None;
                }
                let code = code
                    .map(StreamErrorCode::Server)
                    .unwrap_or(StreamErrorCode::UnknownError);
                Some(self.fail(StreamError::new(code, message)))
            }
            StreamEvent::Clarification(request) => match self.state {
                StreamingState::Connecting
                | StreamingState::Streaming { .. }
                | StreamingState::Clarification { .. } => {
                    info!(
                        options = request.options.len(),
                        "orchestrator requested clarification"
                    );
                    self.state = StreamingState::Clarification {
                        clarification: request.clone(),
                        message_id: request.message_id.clone(),
                    };
                    Some(StreamOutcome::Clarification(request))
                }
                _ => None,
            },
        }
    }

    fn complete(&mut self, completion: Completion) -> StreamOutcome {
        self.live = None;
        self.cancel = None;
        info!(
            message_id = completion.message_id.as_deref().unwrap_or_default(),
            agent_id = completion.agent_id.as_deref().unwrap_or_default(),
            chars = completion.content.len(),
            "chat stream complete"
        );
        self.state = StreamingState::Complete {
            message_id: completion.message_id.clone(),
            agent_id: completion.agent_id.clone(),
            full_content: completion.content.clone(),
        };
        StreamOutcome::Completed(completion)
    }

    fn fail(&mut self, error: StreamError) -> StreamOutcome {
        self.live = None;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        warn!(code = %error.code, message = %error.message, "chat stream failed");
        let partial = self
            .state
            .partial_content()
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self.state = StreamingState::Error {
            error: error.clone(),
            partial_content: partial,
        };
        StreamOutcome::Failed(error)
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

/// One request's reader task: open, read, decode, forward.
struct Reader {
    request_id: u64,
    token: CancellationToken,
    tx: mpsc::Sender<Update>,
}

enum Chunk {
    Data(bytes::Bytes),
    End,
    Failed(String),
    Stalled,
}

impl Reader {
    async fn run(
        self,
        transport: Arc<dyn ChatTransport>,
        request: StreamRequest,
        idle_timeout: Option<Duration>,
    ) {
        let opened = tokio::select! {
            _ = self.token.cancelled() => return,
            r = transport.open(&request) => r,
        };
        let response = match opened {
            Ok(r) => r,
            Err(e) => {
                self.send(UpdateKind::Network(e.to_string())).await;
                return;
            }
        };

        if !response.is_success() {
            let body = match response.body {
                Some(body) => self.collect(body).await,
                None => Vec::new(),
            };
            let message = extract_error_message(&body)
                .unwrap_or_else(|| format!("HTTP {}: {}", response.status, response.reason));
            self.send(UpdateKind::HttpError(message)).await;
            return;
        }

        let Some(mut body) = response.body else {
            self.send(UpdateKind::NoBody).await;
            return;
        };

        let mut decoder = EventStreamDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => return,
                c = next_chunk(&mut body, idle_timeout) => c,
            };
            match chunk {
                Chunk::Data(bytes) => {
                    for raw in decoder.feed(&bytes) {
                        if let Some(event) = StreamEvent::from_raw(raw) {
                            if !self.send(UpdateKind::Event(event)).await {
                                return;
                            }
                        }
                    }
                }
                Chunk::End => {
                    for raw in decoder.finish() {
                        if let Some(event) = StreamEvent::from_raw(raw) {
                            if !self.send(UpdateKind::Event(event)).await {
                                return;
                            }
                        }
                    }
                    self.send(UpdateKind::BodyEnded).await;
                    return;
                }
                Chunk::Failed(message) => {
                    self.send(UpdateKind::Network(message)).await;
                    return;
                }
                Chunk::Stalled => {
                    self.send(UpdateKind::Network("stream stalled".to_string()))
                        .await;
                    return;
                }
            }
        }
    }

    /// Forward an update; false once the request is cancelled or the
    /// controller is gone.
    async fn send(&self, kind: UpdateKind) -> bool {
        let update = Update {
            request_id: self.request_id,
            kind,
        };
        tokio::select! {
            _ = self.token.cancelled() => false,
            r = self.tx.send(update) => r.is_ok(),
        }
    }

    async fn collect(&self, mut body: ByteStream) -> Vec<u8> {
        let mut buf = Vec::new();
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                n = body.next() => n,
            };
            match next {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    if buf.len() >= MAX_ERROR_BODY {
                        break;
                    }
                }
                _ => break,
            }
        }
        buf
    }
}

async fn next_chunk(body: &mut ByteStream, idle_timeout: Option<Duration>) -> Chunk {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, body.next()).await {
            Ok(next) => next,
            Err(_) => return Chunk::Stalled,
        },
        None => body.next().await,
    };
    match next {
        Some(Ok(bytes)) => Chunk::Data(bytes),
        Some(Err(e)) => Chunk::Failed(e.to_string()),
        None => Chunk::End,
    }
}

/// Pull a human-readable message out of a JSON error body.
///
/// Checks `message`, `detail`, `error.message`, then a string `error`.
fn extract_error_message(body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    let as_text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

    as_text(json.get("message"))
        .or_else(|| as_text(json.get("detail")))
        .or_else(|| as_text(json.get("error").and_then(|e| e.get("message"))))
        .or_else(|| as_text(json.get("error")))
        .filter(|m| !m.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportResponse;

    type BodyTx = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

    /// Hands out scripted responses in order and records every request.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<crate::error::Result<TransportResponse>>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl ScriptedTransport {
        /// Queue a 200 response whose body chunks are pushed through the returned sender.
        fn push_stream(&self) -> BodyTx {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push(Ok(TransportResponse {
                status: 200,
                reason: "OK".into(),
                body: Some(Box::pin(UnboundedReceiverStream::new(rx)) as ByteStream),
            }));
            tx
        }

        fn push_status(&self, status: u16, reason: &str, body: Option<&str>) {
            let body = body.map(|text| {
                let chunks: Vec<crate::error::Result<Bytes>> =
                    vec![Ok(Bytes::from(text.to_string()))];
                Box::pin(futures_util::stream::iter(chunks)) as ByteStream
            });
            self.push(Ok(TransportResponse {
                status,
                reason: reason.into(),
                body,
            }));
        }

        fn push(&self, response: crate::error::Result<TransportResponse>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open(&self, request: &StreamRequest) -> crate::error::Result<TransportResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Body("no scripted response".into())))
        }
    }

    fn frame(event: &str, data: Value) -> Bytes {
        let json = serde_json::json!({ "event": event, "data": data });
        Bytes::from(format!("data: {json}\n\n"))
    }

    fn token(text: &str) -> Bytes {
        frame("token", serde_json::json!({ "token": text, "message_id": "M1" }))
    }

    fn setup() -> (Arc<ScriptedTransport>, StreamController) {
        let transport = Arc::new(ScriptedTransport::default());
        let controller = StreamController::new(transport.clone());
        (transport, controller)
    }

    #[tokio::test]
    async fn tokens_accumulate_into_full_content() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("What servers?", "C1", None));

        body.send(Ok(frame(
            "stream_start",
            serde_json::json!({"message_id": "M1", "agent_id": "cmdb-agent"}),
        )))
        .unwrap();
        for t in ["Found ", "42 ", "servers"] {
            body.send(Ok(token(t))).unwrap();
        }

        assert_eq!(
            controller.next_outcome().await,
            StreamOutcome::Started {
                message_id: Some("M1".into()),
                agent_id: Some("cmdb-agent".into()),
            }
        );
        for _ in 0..3 {
            assert!(matches!(controller.next_outcome().await, StreamOutcome::Token(_)));
        }
        assert_eq!(controller.state().partial_content(), Some("Found 42 servers"));

        body.send(Ok(frame("stream_end", serde_json::json!({"message_id": "M1"}))))
            .unwrap();
        let StreamOutcome::Completed(done) = controller.next_outcome().await else {
            panic!("expected completion");
        };
        assert_eq!(done.content, "Found 42 servers");
        assert_eq!(done.agent_id.as_deref(), Some("cmdb-agent"));
        assert!(!controller.is_live());
        assert!(matches!(
            controller.state(),
            StreamingState::Complete { full_content, .. } if full_content == "Found 42 servers"
        ));
    }

    #[tokio::test]
    async fn server_full_content_overrides_accumulated_text() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        body.send(Ok(token("draft"))).unwrap();
        body.send(Ok(frame(
            "stream_end",
            serde_json::json!({"message_id": "M1", "full_content": "final answer"}),
        )))
        .unwrap();

        assert_eq!(controller.next_outcome().await, StreamOutcome::Token("draft".into()));
        let StreamOutcome::Completed(done) = controller.next_outcome().await else {
            panic!("expected completion");
        };
        assert_eq!(done.content, "final answer");
        assert_eq!(done.message_id.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn second_start_discards_first_request() {
        let (transport, mut controller) = setup();
        let first = transport.push_stream();
        let second = transport.push_stream();

        controller.start(StreamRequest::chat("one", "C1", None));
        first.send(Ok(token("old"))).unwrap();
        assert_eq!(controller.next_outcome().await, StreamOutcome::Token("old".into()));

        controller.start(StreamRequest::chat("two", "C1", None));
        let _ = first.send(Ok(token(" stale")));
        second.send(Ok(token("fresh"))).unwrap();

        assert_eq!(controller.next_outcome().await, StreamOutcome::Token("fresh".into()));
        assert_eq!(controller.state().partial_content(), Some("fresh"));
        assert_eq!(transport.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_while_streaming_is_aborted() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        body.send(Ok(token("partial"))).unwrap();
        controller.next_outcome().await;

        assert!(controller.cancel());
        let error = controller.state().error().unwrap();
        assert_eq!(error.code, StreamErrorCode::StreamAborted);
        assert_eq!(controller.state().partial_content(), Some("partial"));

        // Late data from the cancelled reader changes nothing.
        let _ = body.send(Ok(token(" more")));
        let _ = body.send(Ok(frame("stream_end", serde_json::json!({}))));
        let waited = tokio::time::timeout(Duration::from_millis(50), controller.next_outcome()).await;
        assert!(waited.is_err());
        assert_eq!(controller.state().error().unwrap().code, StreamErrorCode::StreamAborted);
    }

    #[tokio::test]
    async fn cancel_when_idle_is_noop() {
        let (_transport, mut controller) = setup();
        assert!(!controller.cancel());
        assert_eq!(controller.state(), &StreamingState::Idle);
    }

    #[tokio::test]
    async fn transport_failure_mid_stream_is_network_error() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        body.send(Ok(token("Found"))).unwrap();
        body.send(Err(TransportError::Body("connection reset".into())))
            .unwrap();

        controller.next_outcome().await;
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::NetworkError);
        assert_eq!(controller.state().partial_content(), Some("Found"));
    }

    #[tokio::test]
    async fn failed_open_is_network_error() {
        let (_transport, mut controller) = setup();
        controller.start(StreamRequest::chat("hi", "C1", None));
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn http_error_uses_json_detail() {
        let (transport, mut controller) = setup();
        transport.push_status(
            503,
            "Service Unavailable",
            Some(r#"{"detail": "Orchestrator offline"}"#),
        );
        controller.start(StreamRequest::chat("hi", "C1", None));
        assert_eq!(
            controller.next_outcome().await,
            StreamOutcome::Failed(StreamError::new(
                StreamErrorCode::HttpError,
                "Orchestrator offline"
            ))
        );
    }

    #[tokio::test]
    async fn http_error_without_json_uses_status_line() {
        let (transport, mut controller) = setup();
        transport.push_status(502, "Bad Gateway", Some("<html>oops</html>"));
        controller.start(StreamRequest::chat("hi", "C1", None));
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.message, "HTTP 502: Bad Gateway");
    }

    #[tokio::test]
    async fn missing_body_is_reported() {
        let (transport, mut controller) = setup();
        transport.push_status(200, "OK", None);
        controller.start(StreamRequest::chat("hi", "C1", None));
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::NoResponseBody);
    }

    #[tokio::test]
    async fn body_end_without_stream_end_completes_with_accumulated_text() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        body.send(Ok(token("Found 42"))).unwrap();
        drop(body);

        controller.next_outcome().await;
        let StreamOutcome::Completed(done) = controller.next_outcome().await else {
            panic!("expected completion");
        };
        assert_eq!(done.content, "Found 42");
    }

    #[tokio::test]
    async fn empty_body_is_network_error() {
        let (transport, mut controller) = setup();
        drop(transport.push_stream());
        controller.start(StreamRequest::chat("hi", "C1", None));
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn server_error_event_carries_code() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        body.send(Ok(frame(
            "error",
            serde_json::json!({"code": "ORCHESTRATOR_UNREACHABLE", "message": "down"}),
        )))
        .unwrap();
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code.as_str(), "ORCHESTRATOR_UNREACHABLE");

        let body = transport.push_stream();
        controller.start(StreamRequest::chat("again", "C1", None));
        body.send(Ok(frame("error", serde_json::json!({"message": "?"}))))
            .unwrap();
        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::UnknownError);
    }

    #[tokio::test]
    async fn second_clarification_overwrites_first() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("show servers", "C1", None));
        for (question, tok) in [("Which environment?", "t1"), ("Which region?", "t2")] {
            body.send(Ok(frame(
                "clarification",
                serde_json::json!({
                    "question": question,
                    "options": ["a", "b"],
                    "pending_message_token": tok
                }),
            )))
            .unwrap();
        }
        controller.next_outcome().await;
        let StreamOutcome::Clarification(req) = controller.next_outcome().await else {
            panic!("expected clarification");
        };
        assert_eq!(req.pending_token, "t2");
        assert!(matches!(
            controller.state(),
            StreamingState::Clarification { clarification, .. } if clarification.question == "Which region?"
        ));
    }

    #[tokio::test]
    async fn events_split_across_chunks_decode() {
        let (transport, mut controller) = setup();
        let body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));
        let bytes = token("split ✓");
        let (a, b) = bytes.split_at(bytes.len() - 5);
        body.send(Ok(Bytes::copy_from_slice(a))).unwrap();
        body.send(Ok(Bytes::copy_from_slice(b))).unwrap();
        assert_eq!(controller.next_outcome().await, StreamOutcome::Token("split ✓".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fails_stalled_stream() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut controller = StreamController::new(transport.clone())
            .with_idle_timeout(Some(Duration::from_secs(30)));
        let _body = transport.push_stream();
        controller.start(StreamRequest::chat("hi", "C1", None));

        let StreamOutcome::Failed(error) = controller.next_outcome().await else {
            panic!("expected failure");
        };
        assert_eq!(error.code, StreamErrorCode::NetworkError);
        assert_eq!(error.message, "stream stalled");
    }

    #[test]
    fn error_message_extraction_order() {
        assert_eq!(
            extract_error_message(br#"{"error": {"message": "nested"}}"#).as_deref(),
            Some("nested")
        );
        assert_eq!(
            extract_error_message(br#"{"error": "flat"}"#).as_deref(),
            Some("flat")
        );
        assert_eq!(
            extract_error_message(br#"{"message": "m", "detail": "d"}"#).as_deref(),
            Some("m")
        );
        assert!(extract_error_message(br#"{"detail": [{"loc": []}]}"#).is_none());
        assert!(extract_error_message(b"not json").is_none());
    }
}
