mod cli;
mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use itom_core::{ClientConfig, ClientId, ConversationId, Role, SuggestedAction};
use itom_realtime::{RealtimeHandle, TungsteniteConnector};
use itom_session::{BackendDirectory, ChatSession, ConversationStore, HttpConversationStore};
use itom_stream::{HttpTransport, StreamController};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::{Cli, Command};
use crate::render::Renderer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the transcript on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "itom_chat=info,itom_session=info,itom_realtime=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = ClientConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ClientConfig::default()
    });
    info!(base_url = %config.server.base_url, "itom-chat starting");

    match cli.command.unwrap_or(Command::Chat {
        conversation: None,
        no_realtime: false,
    }) {
        Command::Chat {
            conversation,
            no_realtime,
        } => run_chat(config, conversation, no_realtime).await,
        Command::List => {
            let store = HttpConversationStore::new(&config.server.base_url);
            for c in store.list().await.context("listing conversations")? {
                println!("{}  {}  {}", c.id, c.updated_at, c.title);
            }
            Ok(())
        }
        Command::Search { query } => {
            let store = HttpConversationStore::new(&config.server.base_url);
            for c in store.search(&query).await.context("searching conversations")? {
                println!("{}  {}", c.id, c.title);
            }
            Ok(())
        }
        Command::Export { id, format } => {
            let store = HttpConversationStore::new(&config.server.base_url);
            let exported = store
                .export(&id, format)
                .await
                .with_context(|| format!("exporting conversation {id}"))?;
            println!("{}", exported.content);
            Ok(())
        }
        Command::Delete { id } => {
            let store = HttpConversationStore::new(&config.server.base_url);
            store
                .delete(&id)
                .await
                .with_context(|| format!("deleting conversation {id}"))?;
            println!("Deleted {id}");
            Ok(())
        }
        Command::Agents => {
            let directory = BackendDirectory::new(&config.server.base_url);
            for agent in directory.agents().await.context("listing agents")? {
                println!("{:<14} {:<8} {}", agent.id, agent.status, agent.name);
            }
            Ok(())
        }
        Command::Health => {
            let directory = BackendDirectory::new(&config.server.base_url);
            let health = directory.health().await.context("checking backend health")?;
            println!("{} (version {}, {})", health.status, health.version, health.timestamp);
            Ok(())
        }
    }
}

async fn run_chat(
    config: ClientConfig,
    conversation: Option<String>,
    no_realtime: bool,
) -> anyhow::Result<()> {
    let transport = Arc::new(HttpTransport::new(&config.server.base_url));
    let controller = StreamController::new(transport)
        .with_idle_timeout(config.stream.idle_timeout_secs.map(Duration::from_secs));
    let store = Arc::new(HttpConversationStore::new(&config.server.base_url));
    let mut session = ChatSession::new(controller, config.session.clone()).with_store(store);

    let realtime = if config.realtime.enabled && !no_realtime {
        let (handle, events) =
            RealtimeHandle::spawn(&config.realtime, ClientId::new(), Arc::new(TungsteniteConnector));
        info!(url = %handle.url(), "realtime channel enabled");
        handle.connect();
        session = session.with_realtime(Arc::new(handle.clone()), events);
        Some(handle)
    } else {
        None
    };

    let mut renderer = Renderer::new();

    if let Some(id) = conversation {
        match session.load_conversation(&id).await {
            Ok(events) => events.iter().for_each(|e| renderer.event(e)),
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "could not load conversation, starting it empty");
                renderer.local(&session.switch_conversation(ConversationId::from(id)));
            }
        }
    }

    println!(
        "Conversation {}. Type /help for commands, /quit to leave.",
        session.conversation_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if matches!(line, "/quit" | "/exit") {
                    break;
                }
                interrupted = false;
                if let Some(action) = suggested_action(&session, line) {
                    renderer.local(&session.run_suggested_action(&action));
                } else {
                    let input = clarification_choice(&session, line);
                    renderer.local(&session.submit(&input));
                }
            }
            event = session.next_event() => renderer.event(&event),
            _ = tokio::signal::ctrl_c() => {
                // First Ctrl-C aborts a running reply; a second one, or one
                // while idle, exits.
                if session.is_busy() && !interrupted {
                    session.cancel();
                    println!();
                    println!("(cancelled)");
                    interrupted = true;
                } else {
                    break;
                }
            }
        }
    }

    if let Some(handle) = realtime {
        handle.shutdown();
    }
    info!("itom-chat exiting");
    Ok(())
}

/// `!N` runs the N-th suggested action of the latest assistant message.
fn suggested_action(session: &ChatSession, line: &str) -> Option<SuggestedAction> {
    let index: usize = line.strip_prefix('!')?.parse().ok()?;
    let last = session
        .messages()
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)?;
    last.suggested_actions.get(index.checked_sub(1)?).cloned()
}

/// A bare number picks the matching option of a pending clarification.
fn clarification_choice(session: &ChatSession, line: &str) -> String {
    session
        .clarification()
        .and_then(|c| {
            let index: usize = line.parse().ok()?;
            c.options.get(index.checked_sub(1)?).cloned()
        })
        .unwrap_or_else(|| line.to_string())
}
