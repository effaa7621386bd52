//! thinkloop CLI.
//!
//! Commands:
//! - `config show|init|path`  Inspect or create the configuration file
//! - `plan <goal>`            Preview the strategy and step plan for a goal
//! - `trim <messages.json>`   Run a message list through the context window

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thinkloop_config::{AppConfig, LoggingSection};

mod commands;

#[derive(Parser)]
#[command(
    name = "thinkloop",
    about = "thinkloop: ReAct agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.thinkloop/config.toml
    #[arg(short, long, global = true, env = "THINKLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the strategy and step plan chosen for a goal
    Plan {
        /// The goal to plan for
        goal: String,

        /// Treat NAME as a registered tool (repeatable)
        #[arg(long = "tool", value_name = "NAME")]
        tools: Vec<String>,
    },

    /// Fit a JSON message list into the context window
    Trim {
        /// Path to a JSON array of messages
        file: PathBuf,

        /// Override the configured token limit
        #[arg(long)]
        max_tokens: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration if no file exists yet
    Init,
    /// Print the configuration file path
    Path,
}

fn init_tracing(logging: &LoggingSection, verbose: bool) {
    let directive = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(directive))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(AppConfig::config_path);

    // A broken config must not stop `config init` or `config path`.
    let loaded = commands::config_cmd::load(&path);
    let logging = loaded.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
    init_tracing(&logging, cli.verbose);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(loaded?)?,
            ConfigAction::Init => commands::config_cmd::init(&path)?,
            ConfigAction::Path => commands::config_cmd::path(&path),
        },
        Commands::Plan { goal, tools } => commands::plan::run(&goal, &tools)?,
        Commands::Trim { file, max_tokens } => commands::trim::run(&loaded?, &file, max_tokens)?,
    }

    Ok(())
}
