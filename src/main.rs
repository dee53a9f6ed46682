use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;

use tandem_core::ids::UserId;
use tandem_settings::{expand_home, load_settings, load_settings_from_path, TandemSettings};
use tandem_store::agents::AgentRepo;
use tandem_store::tokens::UserTokenRepo;
use tandem_store::Database;
use tandem_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "tandem", version, about = "Real-time relay and session runtime")]
struct Cli {
    /// Settings file (defaults to ~/.tandem/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage registered agents.
    Agent {
        #[command(subcommand)]
        action: AgentCommand,
    },
    /// Manage user tokens.
    Token {
        #[command(subcommand)]
        action: TokenCommand,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Register an agent and print its bot token.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
    },
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Issue a bearer token for a user.
    Issue {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("loading settings")?;

    let db_path = expand_home(&settings.store.database_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;

    match cli.command {
        Command::Serve { port } => serve(settings, db, port).await,
        Command::Agent {
            action: AgentCommand::Create { name, owner },
        } => {
            let (agent, token) = AgentRepo::new(db).create(&name, &UserId::from_raw(owner))?;
            println!("agent id:     {}", agent.id);
            println!("pairing code: {}", agent.pairing_code);
            println!("bot token:    {token}");
            Ok(())
        }
        Command::Token {
            action: TokenCommand::Issue { user },
        } => {
            let token = UserTokenRepo::new(db).issue(&UserId::from_raw(user))?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(mut settings: TandemSettings, db: Database, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::from_str(&settings.logging.level).unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: expand_home(&settings.logging.log_db_path),
    });

    let broker = tandem_server::broker::from_settings(&settings.broker);
    let handle = tandem_server::start(&settings, db, broker)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "tandem ready");

    tandem_server::wait_for_signal(handle.shutdown_coordinator().token()).await;
    tracing::info!("shutting down");
    handle
        .shutdown(Duration::from_secs(settings.server.shutdown_timeout_secs))
        .await;
    Ok(())
}
