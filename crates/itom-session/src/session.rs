use std::sync::Arc;

use chrono::Utc;
use itom_commands::{help_text, resolve, LocalCommand, ResolvedCommand};
use itom_core::config::SessionConfig;
use itom_core::{ConversationId, Message, Role, SuggestedAction};
use itom_protocol::realtime::StatusPayload;
use itom_protocol::{ChatPayload, ClarificationRequest, Envelope, EnvelopeType};
use itom_realtime::{ConnectionState, RealtimeEvent, RealtimeHandle};
use itom_stream::{StreamController, StreamError, StreamOutcome, StreamRequest, StreamingState};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::export::{self, ExportFormat, Transcript};
use crate::history::History;
use crate::persist::{Adopted, Persister};
use crate::store::{ConversationStore, NewMessage};

const CLARIFICATION_FAILED: &str = "Failed to resolve clarification. Please try again.";
const DEFAULT_TITLE: &str = "Untitled Conversation";

/// Outbound side of the realtime channel, as seen by the session.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, envelope: Envelope);
}

impl Broadcaster for RealtimeHandle {
    fn broadcast(&self, envelope: Envelope) {
        self.send(envelope);
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A message was appended to history (local, streamed or mirrored).
    MessageAppended(Message),
    StreamStarted { agent_id: Option<String> },
    Token(String),
    Clarification(ClarificationRequest),
    Error(StreamError),
    Exported { format: ExportFormat, content: String },
    HistoryCleared,
    ConversationChanged(ConversationId),
    RealtimeState(ConnectionState),
    AgentStatus(StatusPayload),
    RealtimeError(String),
}

/// Chat session orchestrator and the only writer of conversation state.
///
/// Slash commands, clarification routing, realtime dedup and persistence are
/// all decided here; the stream controller and realtime channel only report.
pub struct ChatSession {
    config: SessionConfig,
    conversation_id: ConversationId,
    title: String,
    history: History,
    is_loading: bool,
    error: Option<StreamError>,
    clarification: Option<ClarificationRequest>,
    /// The in-flight request answers a clarification.
    resolving_clarification: bool,
    controller: StreamController,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    inbound: Option<mpsc::Receiver<RealtimeEvent>>,
    store: Option<Arc<dyn ConversationStore>>,
    /// Started on the first persisted message.
    persister: Option<Persister>,
    adopted: Option<mpsc::UnboundedReceiver<Adopted>>,
}

impl ChatSession {
    pub fn new(controller: StreamController, config: SessionConfig) -> Self {
        Self {
            config,
            conversation_id: ConversationId::new(),
            title: DEFAULT_TITLE.to_string(),
            history: History::new(),
            is_loading: false,
            error: None,
            clarification: None,
            resolving_clarification: false,
            controller,
            broadcaster: None,
            inbound: None,
            store: None,
            persister: None,
            adopted: None,
        }
    }

    pub fn with_realtime(
        mut self,
        broadcaster: Arc<dyn Broadcaster>,
        events: mpsc::Receiver<RealtimeEvent>,
    ) -> Self {
        self.broadcaster = Some(broadcaster);
        self.inbound = Some(events);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self.persister = None;
        self.adopted = None;
        self
    }

    pub fn with_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = id;
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Loading, or a stream is still connecting or streaming.
    pub fn is_busy(&self) -> bool {
        self.is_loading || self.controller.state().is_active()
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn clarification(&self) -> Option<&ClarificationRequest> {
        self.clarification.as_ref()
    }

    pub fn streaming_state(&self) -> &StreamingState {
        self.controller.state()
    }

    pub fn store(&self) -> Option<&Arc<dyn ConversationStore>> {
        self.store.as_ref()
    }

    /// Dispatch one line of user input.
    pub fn submit(&mut self, input: &str) -> Vec<SessionEvent> {
        self.submit_with_agent(input, None)
    }

    /// Dispatch user input with an explicit agent override for plain text.
    /// An agent-routed slash command's own target wins over `agent`.
    pub fn submit_with_agent(&mut self, input: &str, agent: Option<String>) -> Vec<SessionEvent> {
        let text = input.trim();
        if text.is_empty() {
            return Vec::new();
        }

        match resolve(text) {
            Some(ResolvedCommand::Local { command, args }) => self.run_local(command, &args),
            Some(ResolvedCommand::Agent {
                name,
                prompt,
                agent_target,
            }) => {
                debug!(command = name, agent = agent_target, "agent command");
                self.send_message(prompt, Some(agent_target.to_string()))
            }
            None if self.clarification.is_some() => self.answer_clarification(text),
            None => self.send_message(text.to_string(), agent),
        }
    }

    /// Send a suggested follow-up exactly as offered, bypassing slash parsing.
    pub fn run_suggested_action(&mut self, action: &SuggestedAction) -> Vec<SessionEvent> {
        self.send_message(action.prompt.clone(), action.agent_target.clone())
    }

    /// Answer the active clarification. Without one, the answer is sent as a
    /// normal message.
    pub fn answer_clarification(&mut self, answer: &str) -> Vec<SessionEvent> {
        let Some(pending) = self.clarification.take() else {
            return self.send_message(answer.to_string(), None);
        };
        info!(conversation_id = %self.conversation_id, "answering clarification");

        let events = self.append_user(answer);
        self.controller.start(StreamRequest::clarify(
            pending.pending_token,
            answer,
            self.conversation_id.as_str(),
        ));
        self.resolving_clarification = true;
        events
    }

    /// Abort the in-flight stream. History is untouched and the abort is not
    /// reported as an error.
    pub fn cancel(&mut self) -> bool {
        let aborted = self.controller.cancel();
        self.is_loading = false;
        self.resolving_clarification = false;
        if aborted {
            info!(conversation_id = %self.conversation_id, "stream cancelled by user");
        }
        aborted
    }

    /// Start a fresh conversation with a new id.
    pub fn new_conversation(&mut self) -> Vec<SessionEvent> {
        self.switch_conversation(ConversationId::new())
    }

    /// Make `id` the active conversation with an empty history.
    pub fn switch_conversation(&mut self, id: ConversationId) -> Vec<SessionEvent> {
        self.controller.reset();
        self.conversation_id = id;
        self.title = DEFAULT_TITLE.to_string();
        self.history.clear();
        self.is_loading = false;
        self.error = None;
        self.clarification = None;
        self.resolving_clarification = false;
        info!(conversation_id = %self.conversation_id, "conversation switched");
        vec![SessionEvent::ConversationChanged(self.conversation_id.clone())]
    }

    /// Switch to a stored conversation and load its history.
    pub async fn load_conversation(&mut self, id: &str) -> Result<Vec<SessionEvent>> {
        let store = self.store.clone().ok_or(SessionError::NoStore)?;
        let record = store.get(id).await?;

        let mut events = self.switch_conversation(ConversationId::from(record.id.as_str()));
        if !record.title.is_empty() {
            self.title = record.title;
        }
        let messages: Vec<Message> = record
            .messages
            .into_iter()
            .filter_map(|m| m.into_message())
            .collect();
        info!(
            conversation_id = %self.conversation_id,
            messages = messages.len(),
            "conversation loaded"
        );
        self.history = History::from_messages(messages);
        events.extend(
            self.history
                .messages()
                .iter()
                .cloned()
                .map(SessionEvent::MessageAppended),
        );
        Ok(events)
    }

    /// Render the active history without touching the network.
    pub fn export(&self, format: ExportFormat) -> String {
        export::render(
            &Transcript {
                conversation_id: self.conversation_id.as_str(),
                title: &self.title,
                messages: self.history.messages(),
            },
            format,
        )
    }

    /// Wait for the next stream outcome, realtime event or backend id
    /// adoption and apply it.
    ///
    /// Realtime events that change nothing (duplicates, other
    /// conversations, malformed payloads) are absorbed without returning.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            tokio::select! {
                outcome = self.controller.next_outcome() => {
                    return self.apply_outcome(outcome);
                }
                Some(adopted) = recv_adopted(&mut self.adopted) => {
                    if let Some(out) = self.apply_adopted(adopted) {
                        return out;
                    }
                }
                event = recv_inbound(&mut self.inbound) => {
                    match event {
                        Some(event) => {
                            if let Some(out) = self.apply_realtime(event) {
                                return out;
                            }
                        }
                        None => {
                            debug!("realtime event channel closed");
                            self.inbound = None;
                        }
                    }
                }
            }
        }
    }

    fn apply_outcome(&mut self, outcome: StreamOutcome) -> SessionEvent {
        match outcome {
            StreamOutcome::Started { agent_id, .. } => SessionEvent::StreamStarted { agent_id },
            StreamOutcome::Token(token) => SessionEvent::Token(token),
            StreamOutcome::Completed(done) => {
                self.is_loading = false;
                self.resolving_clarification = false;
                let mut message = Message::assistant(done.content).with_agent(done.agent_id);
                if let Some(id) = done.message_id.filter(|id| !id.is_empty()) {
                    message = message.with_id(id);
                }
                message.artifacts = done.artifacts;
                message.suggested_actions = done.suggested_actions;
                self.history.push(message.clone());
                self.persist(&message);
                SessionEvent::MessageAppended(message)
            }
            StreamOutcome::Clarification(request) => {
                self.is_loading = false;
                self.resolving_clarification = false;
                self.clarification = Some(request.clone());
                SessionEvent::Clarification(request)
            }
            StreamOutcome::Failed(error) => {
                self.is_loading = false;
                let error = if std::mem::take(&mut self.resolving_clarification) {
                    StreamError::new(error.code, CLARIFICATION_FAILED)
                } else {
                    error
                };
                self.error = Some(error.clone());
                SessionEvent::Error(error)
            }
        }
    }

    /// The backend created the active conversation under its own id; follow it.
    fn apply_adopted(&mut self, adopted: Adopted) -> Option<SessionEvent> {
        if self.conversation_id != adopted.local {
            return None;
        }
        info!(
            local = %adopted.local,
            remote = %adopted.remote,
            "adopting backend conversation id"
        );
        self.conversation_id = adopted.remote;
        Some(SessionEvent::ConversationChanged(self.conversation_id.clone()))
    }

    fn apply_realtime(&mut self, event: RealtimeEvent) -> Option<SessionEvent> {
        match event {
            RealtimeEvent::StateChanged(state) => Some(SessionEvent::RealtimeState(state)),
            RealtimeEvent::Error(message) => Some(SessionEvent::RealtimeError(message)),
            RealtimeEvent::Message(envelope) => match envelope.kind {
                EnvelopeType::Chat => {
                    let payload = envelope.as_chat()?;
                    self.apply_remote_chat(payload)
                }
                EnvelopeType::Status => envelope.as_status().map(SessionEvent::AgentStatus),
                EnvelopeType::Error => envelope
                    .as_error()
                    .map(|e| SessionEvent::RealtimeError(format!("{}: {}", e.code, e.message))),
                EnvelopeType::Heartbeat => None,
            },
        }
    }

    /// Mirror a message from another client unless it is an echo of ours.
    fn apply_remote_chat(&mut self, payload: ChatPayload) -> Option<SessionEvent> {
        if payload.conversation_id != self.conversation_id.as_str() {
            return None;
        }
        let role: Role = match payload.role.parse() {
            Ok(role) => role,
            Err(e) => {
                debug!(error = %e, "dropping realtime chat with unknown role");
                return None;
            }
        };
        if self
            .history
            .has_recent(role, &payload.content, Utc::now(), self.config.dedup_window_ms)
        {
            debug!(role = %role, "dropping duplicate realtime message");
            return None;
        }
        let message = Message::new(role, payload.content).with_agent(payload.agent_id);
        self.history.push(message.clone());
        Some(SessionEvent::MessageAppended(message))
    }

    fn run_local(&mut self, command: LocalCommand, args: &str) -> Vec<SessionEvent> {
        match command {
            LocalCommand::Help => {
                let message = Message::system(help_text());
                self.history.push(message.clone());
                vec![SessionEvent::MessageAppended(message)]
            }
            LocalCommand::Clear => {
                self.history.clear();
                vec![SessionEvent::HistoryCleared]
            }
            LocalCommand::New => self.new_conversation(),
            LocalCommand::Export => {
                let format = if args.is_empty() {
                    Ok(ExportFormat::default())
                } else {
                    args.parse::<ExportFormat>()
                };
                match format {
                    Ok(format) => {
                        let content = self.export(format);
                        let message = Message::system(format!(
                            "Exported {} messages as {format}.\n\n{content}",
                            self.history.messages().len()
                        ));
                        self.history.push(message.clone());
                        vec![
                            SessionEvent::Exported { format, content },
                            SessionEvent::MessageAppended(message),
                        ]
                    }
                    Err(reason) => {
                        let message = Message::system(reason);
                        self.history.push(message.clone());
                        vec![SessionEvent::MessageAppended(message)]
                    }
                }
            }
        }
    }

    fn send_message(&mut self, content: String, agent: Option<String>) -> Vec<SessionEvent> {
        // A new request supersedes any unanswered question.
        self.clarification = None;
        let events = self.append_user(&content);
        self.controller.start(StreamRequest::chat(
            content,
            self.conversation_id.as_str(),
            agent,
        ));
        self.resolving_clarification = false;
        events
    }

    /// Optimistic user message: append, mark loading, broadcast, persist.
    fn append_user(&mut self, content: &str) -> Vec<SessionEvent> {
        let message = Message::user(content);
        self.history.push(message.clone());
        self.is_loading = true;
        self.error = None;

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast(
                Envelope::chat(ChatPayload {
                    conversation_id: self.conversation_id.to_string(),
                    content: message.content.clone(),
                    role: Role::User.as_str().to_string(),
                    agent_id: None,
                })
                .with_correlation(message.id.to_string()),
            );
        }
        self.persist(&message);
        vec![SessionEvent::MessageAppended(message)]
    }

    /// Best-effort write-through to the conversation store, in order.
    fn persist(&mut self, message: &Message) {
        if !self.config.persist_messages {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let persister = self.persister.get_or_insert_with(|| {
            let (persister, adopted) = Persister::spawn(store);
            self.adopted = Some(adopted);
            persister
        });
        persister.enqueue(self.conversation_id.clone(), NewMessage::from(message));
    }
}

async fn recv_adopted(rx: &mut Option<mpsc::UnboundedReceiver<Adopted>>) -> Option<Adopted> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_inbound(rx: &mut Option<mpsc::Receiver<RealtimeEvent>>) -> Option<RealtimeEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
