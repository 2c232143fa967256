use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use itom_core::config::{RealtimeConfig, NORMAL_CLOSURE};
use itom_core::ClientId;
use itom_protocol::{Envelope, EnvelopeType};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::connector::{Connector, Frame, Socket};
use crate::error::{RealtimeError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Waiting out a backoff delay after an abnormal close.
    Reconnecting,
}

/// Notifications from the channel actor.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    StateChanged(ConnectionState),
    Message(Envelope),
    Error(String),
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(Envelope),
    Reconnect,
    Shutdown,
}

/// Cheap handle to the realtime channel actor.
///
/// Every method enqueues a command and returns immediately; the actor owns
/// the socket, heartbeat and reconnect timer.
#[derive(Debug, Clone)]
pub struct RealtimeHandle {
    client_id: ClientId,
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl RealtimeHandle {
    /// Spawn the channel actor. Nothing connects until [`connect`](Self::connect).
    pub fn spawn(
        config: &RealtimeConfig,
        client_id: ClientId,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let url = format!("{}/{}", config.url.trim_end_matches('/'), client_id);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let actor = Actor {
            url: url.clone(),
            connector,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            heartbeat_period: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            backoff: Backoff::from_config(config),
            state: ConnectionState::Disconnected,
            state_tx,
            events: events_tx,
            commands: commands_rx,
            socket: None,
            heartbeat: None,
            retry_at: None,
        };
        tokio::spawn(actor.run());

        let handle = Self {
            client_id,
            url,
            commands: commands_tx,
            state: state_rx,
        };
        (handle, events_rx)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the socket; a no-op while connecting, connected or reconnecting.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Send an envelope. Silently dropped unless connected.
    pub fn send(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Drop the current socket and connect again with a fresh backoff budget.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Close with a normal closure code and stop the actor.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("realtime actor stopped; command ignored");
        }
    }
}

struct Actor {
    url: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    heartbeat_period: Duration,
    backoff: Backoff,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<RealtimeEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    socket: Option<Socket>,
    heartbeat: Option<Interval>,
    retry_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            self.close_normally().await;
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                frame = next_frame(&mut self.socket) => self.handle_frame(frame).await,

                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.open().await;
                }

                _ = tick(&mut self.heartbeat), if self.state == ConnectionState::Connected => {
                    trace!("sending heartbeat");
                    if let Err(e) = self.write(Frame::Text(Envelope::heartbeat().encode())).await {
                        self.abnormal(e).await;
                    }
                }
            }
        }
        debug!(url = %self.url, "realtime actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                // A fresh connect gets the full retry budget, even after a
                // previous run exhausted it.
                if self.state == ConnectionState::Disconnected {
                    self.backoff.reset();
                    self.open().await;
                }
            }
            Command::Send(envelope) => {
                if self.state != ConnectionState::Connected {
                    debug!(kind = ?envelope.kind, "not connected; dropping envelope");
                    return;
                }
                if let Err(e) = self.write(Frame::Text(envelope.encode())).await {
                    self.abnormal(e).await;
                }
            }
            Command::Reconnect => {
                info!(url = %self.url, "manual realtime reconnect");
                self.close_normally().await;
                self.backoff.reset();
                self.open().await;
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Frame>>) {
        match frame {
            Some(Ok(Frame::Text(text))) => match Envelope::decode(&text) {
                Some(envelope) if envelope.kind == EnvelopeType::Heartbeat => {
                    trace!("heartbeat from server");
                }
                Some(envelope) => self.emit(RealtimeEvent::Message(envelope)),
                None => debug!(len = text.len(), "dropping malformed realtime frame"),
            },
            Some(Ok(Frame::Close(code))) => {
                self.socket = None;
                self.heartbeat = None;
                if code == Some(NORMAL_CLOSURE) {
                    info!(url = %self.url, "realtime channel closed normally");
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    let code = code.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
                    self.abnormal(RealtimeError::Connect(format!("closed with code {code}")))
                        .await;
                }
            }
            Some(Ok(Frame::Other)) => {}
            Some(Err(e)) => self.abnormal(e).await,
            None => self.abnormal(RealtimeError::Closed).await,
        }
    }

    async fn open(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let attempt = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url));
        match attempt.await {
            Ok(Ok(socket)) => {
                self.socket = Some(socket);
                self.backoff.reset();
                let mut interval = tokio::time::interval_at(
                    Instant::now() + self.heartbeat_period,
                    self.heartbeat_period,
                );
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.heartbeat = Some(interval);
                info!(url = %self.url, "realtime channel connected");
                self.set_state(ConnectionState::Connected);
            }
            Ok(Err(e)) => self.abnormal(e).await,
            Err(_) => {
                self.abnormal(RealtimeError::Timeout(self.connect_timeout.as_secs()))
                    .await
            }
        }
    }

    /// Drop the socket and schedule a retry, or give up once the budget is spent.
    async fn abnormal(&mut self, error: RealtimeError) {
        self.socket = None;
        self.heartbeat = None;
        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    url = %self.url,
                    code = error.code(),
                    error = %error,
                    attempt = self.backoff.attempts(),
                    max = self.backoff.max_attempts(),
                    retry_after_ms = delay.as_millis() as u64,
                    "realtime connection lost, retrying with backoff"
                );
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting);
            }
            None => {
                warn!(
                    url = %self.url,
                    error = %error,
                    "realtime reconnect attempts exhausted"
                );
                self.retry_at = None;
                self.set_state(ConnectionState::Disconnected);
                self.emit(RealtimeEvent::Error(
                    "Max reconnection attempts reached".to_string(),
                ));
            }
        }
    }

    /// Cancel timers and close with 1000 so no reconnect is scheduled.
    async fn close_normally(&mut self) {
        self.retry_at = None;
        self.heartbeat = None;
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.sink.send(Frame::Close(Some(NORMAL_CLOSURE))).await {
                debug!(error = %e, "close frame not delivered");
            }
            let _ = socket.sink.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        match self.socket.as_mut() {
            Some(socket) => socket.sink.send(frame).await,
            None => Err(RealtimeError::Closed),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "realtime state change");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(RealtimeEvent::StateChanged(state));
    }

    fn emit(&self, event: RealtimeEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(?event, "realtime event queue full, dropping event");
        }
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Frame>> {
    match socket {
        Some(socket) => socket.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use itom_protocol::ChatPayload;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_util::sync::PollSender;

    use super::*;

    /// The server side of one accepted mock connection.
    struct ServerEnd {
        received: mpsc::Receiver<Frame>,
        outbound: mpsc::UnboundedSender<Result<Frame>>,
    }

    #[derive(Default)]
    struct MockConnector {
        /// `true` accepts the attempt, `false` refuses it; empty refuses.
        script: Mutex<VecDeque<bool>>,
        accepted: Mutex<Option<mpsc::UnboundedSender<ServerEnd>>>,
        attempts: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    impl MockConnector {
        fn new(script: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Self {
                script: Mutex::new(script.iter().copied().collect()),
                accepted: Mutex::new(Some(tx)),
                ..Default::default()
            };
            (Arc::new(connector), rx)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, url: &str) -> Result<Socket> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            let accept = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if !accept {
                return Err(RealtimeError::Connect("refused".into()));
            }

            let (client_tx, server_rx) = mpsc::channel(64);
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            if let Some(accepted) = self.accepted.lock().unwrap().as_ref() {
                let _ = accepted.send(ServerEnd {
                    received: server_rx,
                    outbound: server_tx,
                });
            }
            Ok(Socket {
                sink: Box::pin(PollSender::new(client_tx).sink_map_err(|_| RealtimeError::Closed)),
                stream: Box::pin(UnboundedReceiverStream::new(client_rx)),
            })
        }
    }

    fn test_config(max_attempts: u32) -> RealtimeConfig {
        RealtimeConfig {
            url: "ws://chat.local/ws/".into(),
            max_reconnect_attempts: max_attempts,
            ..RealtimeConfig::default()
        }
    }

    async fn wait_for_state(events: &mut mpsc::Receiver<RealtimeEvent>, want: ConnectionState) {
        loop {
            match events.recv().await {
                Some(RealtimeEvent::StateChanged(state)) if state == want => return,
                Some(_) => continue,
                None => panic!("event channel closed before {want:?}"),
            }
        }
    }

    fn chat_envelope(content: &str) -> Envelope {
        Envelope::chat(ChatPayload {
            conversation_id: "C1".into(),
            content: content.into(),
            role: "user".into(),
            agent_id: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn connects_to_client_specific_url() {
        let (connector, mut servers) = MockConnector::new(&[true]);
        let client_id = ClientId::from("client-abc");
        let (handle, mut events) = RealtimeHandle::spawn(&test_config(3), client_id, connector.clone());
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert!(servers.recv().await.is_some());
        assert_eq!(connector.urls.lock().unwrap()[0], "ws://chat.local/ws/client-abc");
        assert_eq!(handle.state(), ConnectionState::Connected);

        // Idempotent while connected.
        handle.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sent_every_interval_while_connected() {
        let (connector, mut servers) = MockConnector::new(&[true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector);
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let mut server = servers.recv().await.unwrap();

        let started = Instant::now();
        let Some(Frame::Text(text)) = server.received.recv().await else {
            panic!("expected heartbeat frame");
        };
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(Envelope::decode(&text).unwrap().kind, EnvelopeType::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_dropped() {
        let (connector, mut servers) = MockConnector::new(&[true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector);
        handle.send(chat_envelope("lost"));
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let mut server = servers.recv().await.unwrap();

        handle.send(chat_envelope("delivered"));
        let Some(Frame::Text(text)) = server.received.recv().await else {
            panic!("expected chat frame");
        };
        assert_eq!(Envelope::decode(&text).unwrap().as_chat().unwrap().content, "delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_envelopes_are_forwarded_and_junk_dropped() {
        let (connector, mut servers) = MockConnector::new(&[true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector);
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let server = servers.recv().await.unwrap();

        server.outbound.send(Ok(Frame::Text("{not json".into()))).unwrap();
        server
            .outbound
            .send(Ok(Frame::Text(chat_envelope("from another tab").encode())))
            .unwrap();

        match events.recv().await {
            Some(RealtimeEvent::Message(env)) => {
                assert_eq!(env.as_chat().unwrap().content, "from another tab");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_backoff() {
        let (connector, mut servers) = MockConnector::new(&[true, true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector.clone());
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let server = servers.recv().await.unwrap();

        server.outbound.send(Ok(Frame::Close(Some(1006)))).unwrap();
        wait_for_state(&mut events, ConnectionState::Reconnecting).await;
        let lost_at = Instant::now();

        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert!(lost_at.elapsed() >= Duration::from_secs(1));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_does_not_reconnect() {
        let (connector, mut servers) = MockConnector::new(&[true, true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector.clone());
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let server = servers.recv().await.unwrap();

        server.outbound.send(Ok(Frame::Close(Some(1000)))).unwrap();
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (connector, _servers) = MockConnector::new(&[]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector.clone());
        handle.connect();

        let started = Instant::now();
        loop {
            match events.recv().await {
                Some(RealtimeEvent::Error(message)) => {
                    assert_eq!(message, "Max reconnection attempts reached");
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        // Initial attempt plus three retries after 1s, 2s and 4s.
        assert_eq!(connector.attempts(), 4);
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_giving_up_retries_again() {
        let (connector, _servers) = MockConnector::new(&[]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(2), ClientId::new(), connector.clone());

        for round in 1..=2 {
            handle.connect();
            loop {
                match events.recv().await {
                    Some(RealtimeEvent::Error(_)) => break,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
            // Each connect() makes one attempt plus two retries.
            assert_eq!(connector.attempts(), 3 * round);
        }
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempts() {
        // fail, succeed, drop, fail, succeed. Without the reset the second
        // failure would exhaust a budget of two.
        let (connector, mut servers) = MockConnector::new(&[false, true, false, true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(2), ClientId::new(), connector.clone());
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let server = servers.recv().await.unwrap();

        server.outbound.send(Err(RealtimeError::Closed)).unwrap();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_with_normal_code() {
        let (connector, mut servers) = MockConnector::new(&[true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector);
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let mut server = servers.recv().await.unwrap();

        handle.shutdown();
        assert_eq!(server.received.recv().await, Some(Frame::Close(Some(1000))));
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_replaces_socket() {
        let (connector, mut servers) = MockConnector::new(&[true, true]);
        let (handle, mut events) =
            RealtimeHandle::spawn(&test_config(3), ClientId::new(), connector.clone());
        handle.connect();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let mut first = servers.recv().await.unwrap();

        handle.reconnect();
        assert_eq!(first.received.recv().await, Some(Frame::Close(Some(1000))));
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert!(servers.recv().await.is_some());
        assert_eq!(connector.attempts(), 2);
    }
}
