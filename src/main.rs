//! CLI entry point for `desk-agent`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};

use desk_agent::client::AnthropicClient;
use desk_agent::config::Config;
use desk_agent::core::{
    APPROVE_ALWAYS, Agent, AgentUi, ApprovalResponse, ApprovalUi, AutoApprove, LocalTaskContext, LogLevel,
    ResponseMessage, StopReason, TaskContext, ToolMessage,
};
use desk_agent::llm_client::ProviderRegistry;
use desk_agent::logging;
use desk_agent::mcp::{McpConfig, McpManager};
use desk_agent::pricing::format_cost;

#[derive(Parser, Debug)]
#[command(
    name = "desk-agent",
    author,
    version,
    about = "Tool-calling coding agent with MCP server support",
    after_help = "Examples:\
    \n   desk-agent run \"add a test for the parser\"\
    \n   desk-agent run --profile review --file src/lib.rs \"review this file\"\
    \n   desk-agent mcp tools filesystem"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a prompt to completion
    Run(RunArgs),
    /// Inspect and reload MCP servers
    Mcp(McpCliCommand),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Prompt for the agent
    prompt: String,

    /// Agent profile to use (defaults to `default_profile`)
    #[arg(short, long)]
    profile: Option<String>,

    /// Task directory (defaults to the current directory)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Add an editable file to the context
    #[arg(short, long = "file", value_name = "PATH")]
    files: Vec<String>,

    /// Add a read-only file to the context
    #[arg(long = "read-only", value_name = "PATH")]
    read_only: Vec<String>,

    /// Approve every tool call without asking
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct McpCliCommand {
    #[command(subcommand)]
    command: McpSubcommand,
}

#[derive(Subcommand, Debug)]
enum McpSubcommand {
    /// List configured MCP servers
    List,
    /// List tools discovered from MCP servers
    Tools {
        /// Optional server name to list tools for
        #[arg(value_name = "SERVER")]
        server: Option<String>,
    },
    /// Drop cached tool listings and reconnect
    Reload {
        /// Optional server name to reload
        #[arg(value_name = "SERVER")]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
        Commands::Run(args) => {
            let config = Config::load(cli.config)?;
            run_prompt(&config, args).await
        }
        Commands::Mcp(cmd) => {
            let config = Config::load(cli.config)?;
            run_mcp_command(&config, cmd).await
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

// === Run ===

async fn run_prompt(config: &Config, args: RunArgs) -> Result<()> {
    let profile = config.profile(args.profile.as_deref())?;
    let mcp_config = McpConfig::load(&config.mcp_config_path())?;
    let mcp = Arc::new(McpManager::with_defaults(
        mcp_config.timeouts.clone(),
        config.tools_cache_path(),
    ));

    let providers = ProviderRegistry::new().with(Arc::new(AnthropicClient::new(config)?));
    let approval_ui: Arc<dyn ApprovalUi> = if args.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinApprovalUi)
    };
    let agent = Agent::new(providers, mcp.clone(), Arc::new(ConsoleUi), approval_ui)
        .with_mcp_servers(mcp_config.enabled_servers())
        .with_profiles(config.profiles.clone())
        .with_retry_policy(config.retry_policy());

    let task_dir = match args.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let task = Arc::new(LocalTaskContext::new(task_dir.clone()));
    for path in &args.read_only {
        task.add_context_file(path, true).await;
    }
    for path in &args.files {
        task.add_context_file(path, false).await;
    }

    let interrupter = agent.clone();
    let interrupt_dir = task_dir.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupter.interrupt(&interrupt_dir);
        }
    });

    logging::info(format!(
        "Running profile '{}' ({}/{}) in {}",
        profile.id,
        profile.provider,
        profile.model,
        task_dir.display()
    ));
    let outcome = agent.run(&profile, &args.prompt, task, None).await;
    ctrl_c.abort();
    mcp.close().await;

    println!();
    eprintln!(
        "{} {} tool calls, {} sent / {} received tokens, {}",
        "·".dimmed(),
        outcome.tool_calls.len(),
        outcome.usage.input_tokens,
        outcome.usage.output_tokens,
        format_cost(outcome.total_cost)
    );

    match outcome.stop_reason {
        StopReason::Completed => Ok(()),
        StopReason::MaxIterations => {
            eprintln!("{} Stopped after reaching the iteration limit", "!".yellow());
            Ok(())
        }
        StopReason::Cancelled => {
            eprintln!("{} Interrupted", "!".yellow());
            Ok(())
        }
        StopReason::Length => {
            eprintln!("{} Response hit the output token limit", "!".yellow());
            Ok(())
        }
        StopReason::ContentFilter => bail!("Response was blocked by the provider's content filter"),
        StopReason::Error(message) => bail!(message),
    }
}

/// Streams answer text to stdout and everything else to stderr.
struct ConsoleUi;

impl AgentUi for ConsoleUi {
    fn process_response_message(&self, message: ResponseMessage) {
        if message.content.is_empty() {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "{}", message.content);
        let _ = stdout.flush();
    }

    fn add_tool_message(&self, message: ToolMessage) {
        match message.result {
            None => eprintln!(
                "\n{} {} {}",
                "→".cyan(),
                format!("{}/{}", message.server_name, message.tool_name).bold(),
                compact_args(&message.args).dimmed()
            ),
            Some(result) => eprintln!("{} {}", "✓".green(), first_line(&result).dimmed()),
        }
    }

    fn add_log_message(&self, level: LogLevel, text: Option<String>) {
        let Some(text) = text else {
            return;
        };
        match level {
            LogLevel::Error => eprintln!("{} {text}", "✗".red()),
            LogLevel::Warning => eprintln!("{} {text}", "!".yellow()),
            LogLevel::Info => eprintln!("{} {text}", "·".dimmed()),
            LogLevel::Loading => logging::info(text),
        }
    }
}

fn compact_args(args: &serde_json::Value) -> String {
    let text = args.to_string();
    if text.chars().count() > 120 {
        let head: String = text.chars().take(117).collect();
        format!("{head}...")
    } else {
        text
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if text.lines().nth(1).is_some() {
        format!("{line} ...")
    } else {
        line.to_string()
    }
}

/// Asks on the terminal. `a` approves and remembers the tool for the run;
/// any other text that is not `y` denies with that text as the reason.
struct StdinApprovalUi;

#[async_trait]
impl ApprovalUi for StdinApprovalUi {
    async fn request_approval(&self, _tool_id: &str, text: &str, subject: &str) -> ApprovalResponse {
        eprintln!("\n{} {text}", "?".yellow().bold());
        eprintln!("{}", subject.dimmed());
        eprint!("[y]es / [n]o / [a]lways, or type a reason to deny: ");
        let _ = io::stderr().flush();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let answer = match lines.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => return ApprovalResponse::deny(None),
        };
        match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => ApprovalResponse::approve(),
            "a" | "always" => ApprovalResponse {
                approved: true,
                user_input: Some(APPROVE_ALWAYS.to_string()),
            },
            "" | "n" | "no" => ApprovalResponse::deny(None),
            _ => ApprovalResponse::deny(Some(answer.as_str())),
        }
    }
}

// === MCP subcommands ===

async fn run_mcp_command(config: &Config, cmd: McpCliCommand) -> Result<()> {
    let mcp_path = config.mcp_config_path();
    let mcp_config = McpConfig::load(&mcp_path)?;

    if let McpSubcommand::List = cmd.command {
        println!("{}", "MCP Servers".blue().bold());
        println!("{}", "===========".blue());
        if mcp_config.servers.is_empty() {
            println!("  (no servers configured in {})", mcp_path.display());
        }
        let mut names: Vec<&String> = mcp_config.servers.keys().collect();
        names.sort();
        for name in names {
            let server = &mcp_config.servers[name];
            let status = if server.disabled {
                "disabled".dimmed()
            } else {
                "enabled".green()
            };
            println!("  • {name} ({status})");
            println!("    {}", server.display_target());
        }
        return Ok(());
    }

    let manager = McpManager::with_defaults(mcp_config.timeouts.clone(), config.tools_cache_path());
    let servers = mcp_config.enabled_servers();
    let result = match cmd.command {
        McpSubcommand::List => Ok(()),
        McpSubcommand::Tools { server } => {
            println!("{}", "MCP Tools".blue().bold());
            let mut names: Vec<&String> = servers
                .keys()
                .filter(|name| server.as_ref().is_none_or(|s| s == *name))
                .collect();
            names.sort();
            if names.is_empty() {
                println!("  (no matching enabled servers)");
            }
            for name in names {
                match manager.get_server_tools(name, servers.get(name)).await {
                    Some(tools) => {
                        println!("  {} ({} tools)", name.bold(), tools.len());
                        for tool in tools {
                            println!(
                                "    {} - {}",
                                tool.name,
                                tool.description.as_deref().unwrap_or("")
                            );
                        }
                    }
                    None => println!("  {} {name}: failed to connect", "✗".red()),
                }
            }
            Ok(())
        }
        McpSubcommand::Reload { server } => match server {
            Some(name) => match servers.get(&name) {
                Some(server_config) => {
                    match manager.reload_single_server(&name, server_config, None, None).await {
                        Some(connector) => {
                            println!("{} {name}: {} tools", "✓".green(), connector.tools().len());
                            Ok(())
                        }
                        None => Err(anyhow::anyhow!("Failed to reload MCP server '{name}'")),
                    }
                }
                None => Err(anyhow::anyhow!("MCP server '{name}' is not configured or disabled")),
            },
            None => {
                let connectors = manager.reload_all_servers(&servers, None, None).await;
                for connector in &connectors {
                    println!("{} {}: {} tools", "✓".green(), connector.name(), connector.tools().len());
                }
                let failed = servers.len().saturating_sub(connectors.len());
                if failed > 0 {
                    println!("{} {failed} server(s) failed to connect", "✗".red());
                }
                Ok(())
            }
        },
    };
    manager.close().await;
    result
}
