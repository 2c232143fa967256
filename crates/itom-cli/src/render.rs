use std::io::{self, Write};

use itom_core::{Message, Role};
use itom_session::SessionEvent;
use tracing::{info, warn};

/// Prints session events as a plain-text transcript on stdout.
#[derive(Debug, Default)]
pub struct Renderer {
    /// Tokens of an assistant reply are being printed on the current line.
    mid_stream: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render events produced synchronously by `submit`. The user's own
    /// line is already on screen.
    pub fn local(&mut self, events: &[SessionEvent]) {
        for event in events {
            match event {
                SessionEvent::MessageAppended(m) if m.role == Role::User => {}
                other => self.event(other),
            }
        }
    }

    pub fn event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::MessageAppended(message) => self.message(message),
            SessionEvent::StreamStarted { agent_id } => {
                self.begin_reply(agent_id.as_deref());
            }
            SessionEvent::Token(token) => {
                if !self.mid_stream {
                    self.begin_reply(None);
                }
                print!("{token}");
                let _ = io::stdout().flush();
            }
            SessionEvent::Clarification(request) => {
                self.end_line();
                println!("? {}", request.question);
                for (i, option) in request.options.iter().enumerate() {
                    println!("  {}. {}", i + 1, option);
                }
            }
            SessionEvent::Error(error) => {
                self.end_line();
                eprintln!("error [{}]: {}", error.code, error.message);
            }
            // The accompanying system message carries the rendered text.
            SessionEvent::Exported { format, content } => {
                info!(%format, bytes = content.len(), "conversation exported");
            }
            SessionEvent::HistoryCleared => println!("(history cleared)"),
            SessionEvent::ConversationChanged(id) => println!("(conversation {id})"),
            SessionEvent::RealtimeState(state) => info!(?state, "realtime channel"),
            SessionEvent::AgentStatus(status) => {
                println!("(agent {} is {})", status.agent_id, status.status);
            }
            SessionEvent::RealtimeError(message) => warn!(%message, "realtime channel error"),
        }
    }

    fn message(&mut self, message: &Message) {
        match message.role {
            Role::Assistant if self.mid_stream => self.end_line(),
            Role::Assistant => {
                println!("{}> {}", agent_label(message.agent_id.as_deref()), message.content);
            }
            Role::System => {
                self.end_line();
                println!("{}", message.content);
            }
            // Only mirrored messages reach here.
            Role::User => {
                self.end_line();
                println!("[synced] you> {}", message.content);
                return;
            }
        }
        for artifact in &message.artifacts {
            println!("  [{:?}] {}", artifact.artifact_type, artifact.title);
        }
        for action in &message.suggested_actions {
            println!("  * {} ({})", action.label, action.prompt);
        }
    }

    fn begin_reply(&mut self, agent_id: Option<&str>) {
        self.end_line();
        print!("{}> ", agent_label(agent_id));
        let _ = io::stdout().flush();
        self.mid_stream = true;
    }

    fn end_line(&mut self) {
        if self.mid_stream {
            println!();
            self.mid_stream = false;
        }
    }
}

fn agent_label(agent_id: Option<&str>) -> &str {
    agent_id.filter(|a| !a.is_empty()).unwrap_or("assistant")
}
