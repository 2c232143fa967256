//! Chat session orchestration: the single owner of conversation state.
//!
//! [`ChatSession`] turns user input into local commands or streamed chat
//! requests, folds stream outcomes and realtime events into history, and
//! talks to the conversation store for loading and persistence.

pub mod agents;
pub mod error;
pub mod export;
pub mod history;
mod persist;
pub mod session;
pub mod store;

pub use agents::{AgentInfo, BackendDirectory, HealthReport};
pub use error::{Result, SessionError, StoreError};
pub use export::ExportFormat;
pub use history::History;
pub use session::{Broadcaster, ChatSession, SessionEvent};
pub use store::{
    ConversationRecord, ConversationStore, ConversationSummary, ExportedConversation,
    HttpConversationStore, NewConversation, NewMessage, StoredMessage,
};
