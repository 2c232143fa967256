pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{CoreError, Result};
pub use types::{
    Artifact, ArtifactType, ClientId, ConversationId, Message, MessageId, Role, SuggestedAction,
};
