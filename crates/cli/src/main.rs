//! Routewise CLI, the main entry point.
//!
//! Commands:
//! - `init`           Write the default config file
//! - `ask`            Run one query through the orchestrator
//! - `chat`           Interactive session (`/end` closes it into an episode)
//! - `stats`          Learning summary
//! - `episodes`       Search past episodes
//! - `violations`     Policy violation log
//! - `policies`       Active policy rules
//! - `reset-learning` Forget learned routing statistics

use clap::{Parser, Subcommand};

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "routewise",
    about = "Routewise: autonomous task routing with memory, policies and reflection",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init,

    /// Ask a single question
    Ask {
        /// The query
        query: String,

        /// Session to continue
        #[arg(short, long, default_value = "default")]
        session: String,

        /// User the request is made on behalf of
        #[arg(short, long)]
        user: Option<String>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat session
    Chat {
        /// Session id (a fresh one is generated when omitted)
        #[arg(short, long)]
        session: Option<String>,

        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show what the agent has learned
    Stats,

    /// Search finalized conversations
    Episodes {
        /// Keywords to search for; lists recent episodes when omitted
        query: Option<String>,

        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Show recorded policy violations
    Violations {
        /// Only this session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// List active policy rules
    Policies,

    /// Reset learned routing statistics
    ResetLearning {
        /// Required to actually reset
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Ask { query, session, user, json } => {
            commands::ask::run(&query, &session, user, json).await?
        }
        Commands::Chat { session, user } => commands::chat::run(session, user).await?,
        Commands::Stats => commands::stats::run().await?,
        Commands::Episodes { query, limit } => commands::episodes::run(query, limit).await?,
        Commands::Violations { session } => commands::policy::violations(session).await?,
        Commands::Policies => commands::policy::rules().await?,
        Commands::ResetLearning { confirm } => commands::stats::reset(confirm).await?,
    }

    Ok(())
}
