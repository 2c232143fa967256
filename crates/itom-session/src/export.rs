use std::fmt;
use std::str::FromStr;

use itom_core::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;

const RULE_WIDTH: usize = 60;
const DEFAULT_AGENT_LABEL: &str = "ITOM Agent";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Markdown,
    Text,
    Json,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "markdown",
            ExportFormat::Text => "text",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "text/markdown",
            ExportFormat::Text => "text/plain",
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "text" | "txt" => Ok(ExportFormat::Text),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!(
                "Unknown export format '{other}'. Use markdown, text or json."
            )),
        }
    }
}

/// What gets rendered: a title plus the message list.
pub struct Transcript<'a> {
    pub conversation_id: &'a str,
    pub title: &'a str,
    pub messages: &'a [Message],
}

pub fn render(transcript: &Transcript<'_>, format: ExportFormat) -> String {
    match format {
        ExportFormat::Markdown => render_markdown(transcript),
        ExportFormat::Text => render_text(transcript),
        ExportFormat::Json => render_json(transcript),
    }
}

fn started(transcript: &Transcript<'_>) -> String {
    transcript
        .messages
        .first()
        .map(|m| m.created_at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn updated(transcript: &Transcript<'_>) -> String {
    transcript
        .messages
        .last()
        .map(|m| m.created_at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn render_text(transcript: &Transcript<'_>) -> String {
    let mut lines = vec![
        format!("Conversation: {}", transcript.title),
        format!("Created: {}", started(transcript)),
        format!("Updated: {}", updated(transcript)),
        String::new(),
        "-".repeat(RULE_WIDTH),
    ];
    for msg in transcript.messages {
        let role = msg.role.as_str().to_ascii_uppercase();
        let label = match &msg.agent_id {
            Some(agent) if !agent.is_empty() => format!("{role} ({agent})"),
            _ => role,
        };
        lines.push(format!("[{}] {}:", msg.created_at.to_rfc3339(), label));
        lines.push(msg.content.clone());
        lines.push(String::new());
    }
    lines.join("\n")
}

fn render_markdown(transcript: &Transcript<'_>) -> String {
    let mut lines = vec![
        format!("# {}", transcript.title),
        String::new(),
        format!("**Created:** {}", started(transcript)),
        format!("**Updated:** {}", updated(transcript)),
        String::new(),
        "---".to_string(),
        String::new(),
    ];
    for msg in transcript.messages {
        let ts = msg.created_at.to_rfc3339();
        let heading = match msg.role {
            Role::User => format!("### User ({ts})"),
            Role::Assistant => {
                let agent = msg
                    .agent_id
                    .as_deref()
                    .filter(|a| !a.is_empty())
                    .unwrap_or(DEFAULT_AGENT_LABEL);
                format!("### {agent} ({ts})")
            }
            Role::System => format!("### System ({ts})"),
        };
        lines.push(heading);
        lines.push(String::new());
        lines.push(msg.content.clone());
        lines.push(String::new());
    }
    lines.join("\n")
}

fn render_json(transcript: &Transcript<'_>) -> String {
    let doc = json!({
        "id": transcript.conversation_id,
        "title": transcript.title,
        "created_at": started(transcript),
        "updated_at": updated(transcript),
        "messages": transcript.messages,
    });
    serde_json::to_string_pretty(&doc).unwrap_or_default()
}
