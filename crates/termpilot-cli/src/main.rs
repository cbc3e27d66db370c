//! termpilot - AI agent embedded in your terminal session

mod config;
mod decorator;
mod host;
mod process;
mod prompt;
mod tools;
mod usage;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use termpilot_agent::{AgentConfig, ProviderTransport};
use termpilot_ai::{Message, OpenAiClient};
use termpilot_term::Theme;
use termpilot_term::context::DEFAULT_CAPACITY;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::decorator::DecoratorOptions;
use crate::process::ProcessRunner;
use crate::usage::UsageStore;

/// termpilot - type `@ ` at the start of a shell line to ask the agent
#[derive(Parser, Debug)]
#[command(name = "termpilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Provider (openai, azure, deepseek, groq, mistral, openrouter, together, xai, ollama, custom)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (defaults to the provider's preset)
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint
    #[arg(long)]
    base_url: Option<String>,

    /// Shell to run (default: $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Working directory
    #[arg(short, long)]
    working_dir: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable colors
    #[arg(long)]
    no_color: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Send one request to verify the provider settings
    #[arg(long)]
    check: bool,

    /// Show recorded token usage per provider
    #[arg(long)]
    usage: bool,
}

impl Args {
    /// Flags win over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(provider) = &self.provider {
            config.provider = Some(provider.clone());
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if let Some(shell) = &self.shell {
            config.shell = Some(shell.clone());
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termpilot")
}

/// Logs go to a file; the terminal belongs to the shell.
fn init_logging(verbose: bool) -> anyhow::Result<PathBuf> {
    let dir = data_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("termpilot.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let default = if verbose { "termpilot=debug" } else { "termpilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize config and exit
    if args.init_config {
        match Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let log_path = init_logging(args.verbose)?;
    let mut config = Config::load();
    args.apply(&mut config);

    if args.usage {
        return print_usage();
    }
    if args.check {
        return check(&config).await;
    }

    let cwd = match &args.working_dir {
        Some(dir) => std::fs::canonicalize(dir)
            .with_context(|| format!("cannot use working directory {}", dir))?,
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    let settings = config.to_provider_settings();
    if let Err(e) = settings.resolve() {
        eprintln!("Warning: {}", e);
        eprintln!("Agent requests will fail until this is fixed (see termpilot --init-config).");
    }

    let runner = ProcessRunner::new(config.shell.clone()).with_timeout(config.command_timeout());
    let shell = runner.shell().to_string();
    let theme = if args.no_color || std::env::var_os("NO_COLOR").is_some() {
        Theme::plain()
    } else {
        Theme::dark()
    };

    let options = DecoratorOptions {
        cwd,
        shell,
        runner,
        context_lines: config.max_context_lines.unwrap_or(DEFAULT_CAPACITY),
        theme,
        agent: AgentConfig::default(),
        usage: Some(UsageStore::new(UsageStore::default_path())),
        provider_id: settings.provider.id().to_string(),
    };
    let transport = Arc::new(ProviderTransport::new(OpenAiClient::new(), settings));

    eprintln!(
        "termpilot: type `@ ` at the start of a line to ask the agent (log: {})",
        log_path.display()
    );
    let code = host::run(transport, options).await?;
    tracing::info!(code, "shell exited");
    std::process::exit(code as i32);
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let settings = config.to_provider_settings();
    let endpoint = settings.resolve().context("invalid provider settings")?;
    println!("{} · {} · {}", settings.provider.name(), endpoint.model, endpoint.url);

    let completion = OpenAiClient::new()
        .complete(
            &settings,
            vec![Message::user("Reply with the single word: ok")],
            CancellationToken::new(),
        )
        .await
        .context("request failed")?;
    println!("reply: {}", completion.message.text().trim());
    if !completion.usage.is_empty() {
        println!(
            "tokens: {} in / {} out",
            completion.usage.prompt_tokens, completion.usage.completion_tokens
        );
    }
    Ok(())
}

fn print_usage() -> anyhow::Result<()> {
    let store = UsageStore::new(UsageStore::default_path());
    let records = store.load()?;
    if records.is_empty() {
        println!("No usage recorded yet.");
        return Ok(());
    }

    println!(
        "{:<12} {:>6} {:>12} {:>12} {:>12} {:>12}  updated",
        "provider", "runs", "prompt", "completion", "cached", "total"
    );
    for (provider, record) in &records {
        println!(
            "{:<12} {:>6} {:>12} {:>12} {:>12} {:>12}  {}",
            provider,
            record.runs,
            record.tokens.prompt_tokens,
            record.tokens.completion_tokens,
            record.tokens.cached_tokens,
            record.tokens.total_tokens,
            record.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{}", store.path().display());
    Ok(())
}
