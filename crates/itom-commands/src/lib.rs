//! Slash command registry, intercepted before anything reaches the network.
//!
//! Client-side commands (`/help`, `/clear`, `/new`, `/export`) are handled by
//! the chat session locally. Agent-routed commands expand into a natural
//! language prompt and carry an explicit agent target that overrides the
//! orchestrator's automatic routing.

pub mod registry;

pub use registry::{
    expand_prompt, find, help_text, resolve, suggestions, CommandCategory, LocalCommand,
    ResolvedCommand, SlashCommand, COMMANDS,
};
