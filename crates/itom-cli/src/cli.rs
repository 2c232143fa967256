use clap::{Parser, Subcommand};
use itom_session::ExportFormat;

/// Terminal client for the ITOM chat backend.
#[derive(Debug, Parser)]
#[command(name = "itom-chat", version, about)]
pub struct Cli {
    /// Config file (defaults to $ITOM_CHAT_CONFIG, then ~/.itom-chat/config.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive chat (the default).
    Chat {
        /// Resume a stored conversation.
        #[arg(long)]
        conversation: Option<String>,
        /// Skip the realtime sync channel.
        #[arg(long)]
        no_realtime: bool,
    },
    /// List stored conversations.
    List,
    /// Search conversations by title and content.
    Search { query: String },
    /// Export a stored conversation.
    Export {
        id: String,
        #[arg(long, default_value = "markdown", value_parser = parse_format)]
        format: ExportFormat,
    },
    /// Delete a stored conversation.
    Delete { id: String },
    /// List backend agents and their status.
    Agents,
    /// Check that the backend is up.
    Health,
}

fn parse_format(raw: &str) -> Result<ExportFormat, String> {
    raw.parse()
}
