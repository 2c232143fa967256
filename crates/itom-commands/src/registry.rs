use serde::Serialize;
use tracing::debug;

/// Placeholder substituted with the command's argument text.
const ARGS_PLACEHOLDER: &str = "{args}";

/// Literal rewrites applied, in order, when an agent command is used without
/// arguments. The first pattern found in the template wins; the result is
/// trimmed. These are the whole contract: no general grammar is inferred.
const NO_ARGS_REWRITES: &[(&str, &str)] = &[
    (" for {args}", ""),
    (" on {args}", ""),
    (" of {args}", ""),
    (" to {args}", ""),
    (" in {args}", ""),
    ("{args}", ""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandCategory {
    General,
    Conversation,
    Cmdb,
    Discovery,
    Asset,
    Audit,
    Documentation,
}

/// Static registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlashCommand {
    pub name: &'static str,
    pub description: &'static str,
    pub category: CommandCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_hint: Option<&'static str>,
    /// `None` marks a client-side command that never reaches the network.
    pub agent_target: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<&'static str>,
}

impl SlashCommand {
    pub fn is_local(&self) -> bool {
        self.agent_target.is_none()
    }
}

pub const COMMANDS: &[SlashCommand] = &[
    // Client-side
    SlashCommand {
        name: "/help",
        description: "Show available commands",
        category: CommandCategory::General,
        param_hint: None,
        agent_target: None,
        prompt_template: None,
    },
    SlashCommand {
        name: "/clear",
        description: "Clear the messages in this conversation",
        category: CommandCategory::Conversation,
        param_hint: None,
        agent_target: None,
        prompt_template: None,
    },
    SlashCommand {
        name: "/new",
        description: "Start a new conversation",
        category: CommandCategory::Conversation,
        param_hint: None,
        agent_target: None,
        prompt_template: None,
    },
    SlashCommand {
        name: "/export",
        description: "Export this conversation",
        category: CommandCategory::Conversation,
        param_hint: Some("[markdown|text|json]"),
        agent_target: None,
        prompt_template: None,
    },
    // CMDB
    SlashCommand {
        name: "/ci-search",
        description: "Search configuration items",
        category: CommandCategory::Cmdb,
        param_hint: Some("<query>"),
        agent_target: Some("cmdb-agent"),
        prompt_template: Some("Search for configuration items matching: {args}"),
    },
    SlashCommand {
        name: "/ci-details",
        description: "Show details for a configuration item",
        category: CommandCategory::Cmdb,
        param_hint: Some("<ci name>"),
        agent_target: Some("cmdb-agent"),
        prompt_template: Some("Show full details for configuration item {args}"),
    },
    SlashCommand {
        name: "/relationships",
        description: "Show CI relationships and dependencies",
        category: CommandCategory::Cmdb,
        param_hint: Some("<ci name>"),
        agent_target: Some("cmdb-agent"),
        prompt_template: Some("Show relationships and dependencies for {args}"),
    },
    SlashCommand {
        name: "/impact",
        description: "Analyze change impact",
        category: CommandCategory::Cmdb,
        param_hint: Some("<ci name>"),
        agent_target: Some("cmdb-agent"),
        prompt_template: Some("Analyze the impact of changes to {args}"),
    },
    SlashCommand {
        name: "/health",
        description: "Show CMDB data quality metrics",
        category: CommandCategory::Cmdb,
        param_hint: Some("[class]"),
        agent_target: Some("cmdb-agent"),
        prompt_template: Some("Show CMDB data quality and health metrics for {args}"),
    },
    // Discovery
    SlashCommand {
        name: "/discover",
        description: "Run a discovery scan",
        category: CommandCategory::Discovery,
        param_hint: Some("<ip range or host>"),
        agent_target: Some("discovery-agent"),
        prompt_template: Some("Run a discovery scan on {args}"),
    },
    SlashCommand {
        name: "/discovery-status",
        description: "Show recent discovery runs",
        category: CommandCategory::Discovery,
        param_hint: None,
        agent_target: Some("discovery-agent"),
        prompt_template: Some("Show the status of recent discovery runs"),
    },
    // Asset
    SlashCommand {
        name: "/assets",
        description: "Show asset inventory",
        category: CommandCategory::Asset,
        param_hint: Some("[filter]"),
        agent_target: Some("asset-agent"),
        prompt_template: Some("Show the asset inventory for {args}"),
    },
    SlashCommand {
        name: "/licenses",
        description: "Summarize software license usage",
        category: CommandCategory::Asset,
        param_hint: Some("[vendor]"),
        agent_target: Some("asset-agent"),
        prompt_template: Some("Summarize software license usage and compliance for {args}"),
    },
    // Audit
    SlashCommand {
        name: "/audit",
        description: "Run a compliance audit",
        category: CommandCategory::Audit,
        param_hint: Some("<scope>"),
        agent_target: Some("audit-agent"),
        prompt_template: Some("Run a compliance audit for {args}"),
    },
    SlashCommand {
        name: "/drift",
        description: "Detect configuration drift",
        category: CommandCategory::Audit,
        param_hint: Some("<ci name>"),
        agent_target: Some("audit-agent"),
        prompt_template: Some("Detect configuration drift on {args}"),
    },
    // Documentation
    SlashCommand {
        name: "/document",
        description: "Generate documentation",
        category: CommandCategory::Documentation,
        param_hint: Some("<topic>"),
        agent_target: Some("documentation-agent"),
        prompt_template: Some("Generate documentation for {args}"),
    },
    SlashCommand {
        name: "/runbook",
        description: "Draft an operational runbook",
        category: CommandCategory::Documentation,
        param_hint: Some("<service>"),
        agent_target: Some("documentation-agent"),
        prompt_template: Some("Draft an operational runbook for {args}"),
    },
];

/// Client-side commands, handled without touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    Help,
    Clear,
    New,
    Export,
}

impl LocalCommand {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "/help" => Some(Self::Help),
            "/clear" => Some(Self::Clear),
            "/new" => Some(Self::New),
            "/export" => Some(Self::Export),
            _ => None,
        }
    }
}

/// Outcome of matching user input against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCommand {
    Local {
        command: LocalCommand,
        args: String,
    },
    Agent {
        name: &'static str,
        prompt: String,
        agent_target: &'static str,
    },
}

/// Look up a command by name (leading `/` optional, case-insensitive).
pub fn find(name: &str) -> Option<&'static SlashCommand> {
    let name = name.trim().to_ascii_lowercase();
    let name = if name.starts_with('/') {
        name
    } else {
        format!("/{name}")
    };
    COMMANDS.iter().find(|cmd| cmd.name == name)
}

/// Match raw user input against the registry.
///
/// Returns `None` for plain text and for unknown `/words`, both of which are
/// sent to the orchestrator unchanged.
pub fn resolve(input: &str) -> Option<ResolvedCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (name, args) = match trimmed.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (trimmed, ""),
    };
    let command = find(name)?;

    match command.agent_target {
        None => {
            let local = LocalCommand::from_name(command.name)?;
            Some(ResolvedCommand::Local {
                command: local,
                args: args.to_string(),
            })
        }
        Some(agent_target) => {
            let prompt = expand_prompt(command, args);
            debug!(command = command.name, agent = agent_target, "expanded slash command");
            Some(ResolvedCommand::Agent {
                name: command.name,
                prompt,
                agent_target,
            })
        }
    }
}

/// Expand a command's template with the raw argument text.
///
/// With arguments the placeholder is substituted verbatim (or the arguments
/// are appended when the template has none). Without arguments the literal
/// rewrites in [`NO_ARGS_REWRITES`] remove the placeholder phrase.
pub fn expand_prompt(command: &SlashCommand, args: &str) -> String {
    let args = args.trim();
    let Some(template) = command.prompt_template else {
        return if args.is_empty() {
            command.description.to_string()
        } else {
            args.to_string()
        };
    };

    if !args.is_empty() {
        return if template.contains(ARGS_PLACEHOLDER) {
            template.replace(ARGS_PLACEHOLDER, args)
        } else {
            format!("{template} {args}")
        };
    }

    for (pattern, replacement) in NO_ARGS_REWRITES {
        if template.contains(pattern) {
            return template.replacen(pattern, replacement, 1).trim().to_string();
        }
    }
    template.trim().to_string()
}

/// Commands whose name starts with `prefix`, for autocomplete.
pub fn suggestions(prefix: &str) -> Vec<&'static SlashCommand> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if !prefix.starts_with('/') {
        return Vec::new();
    }
    COMMANDS
        .iter()
        .filter(|cmd| cmd.name.starts_with(prefix.as_str()))
        .collect()
}

/// Markdown listing of every command, used for the `/help` system message.
pub fn help_text() -> String {
    let mut out = String::from("**Available Commands**\n");
    let mut current: Option<CommandCategory> = None;
    for cmd in COMMANDS {
        if current != Some(cmd.category) {
            current = Some(cmd.category);
            out.push_str(&format!("\n**{}**\n", category_label(cmd.category)));
        }
        let usage = match cmd.param_hint {
            Some(hint) => format!("{} {}", cmd.name, hint),
            None => cmd.name.to_string(),
        };
        match cmd.agent_target {
            Some(agent) => out.push_str(&format!(
                "- `{}` - {} ({})\n",
                usage, cmd.description, agent
            )),
            None => out.push_str(&format!("- `{}` - {}\n", usage, cmd.description)),
        }
    }
    out
}

fn category_label(category: CommandCategory) -> &'static str {
    match category {
        CommandCategory::General => "General",
        CommandCategory::Conversation => "Conversation",
        CommandCategory::Cmdb => "CMDB",
        CommandCategory::Discovery => "Discovery",
        CommandCategory::Asset => "Assets",
        CommandCategory::Audit => "Audit",
        CommandCategory::Documentation => "Documentation",
    }
}
