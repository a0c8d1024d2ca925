mod data_commands;
mod token_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "duet", about = "duet: realtime two-party messaging gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./duet.toml, then ~/.config/duet/duet.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Development session tokens.
    Token {
        #[command(subcommand)]
        action: token_commands::TokenAction,
    },
    /// User directory management.
    Users {
        #[command(subcommand)]
        action: data_commands::UsersAction,
    },
    /// Print a page of conversation history.
    History {
        #[arg(long)]
        conversation_id: String,
        /// 1-based, newest page first.
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Print the chat list for a user.
    Chats {
        #[arg(long)]
        user_id: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = duet_config::discover_and_load(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "duet starting");
            duet_gateway::start_gateway(config).await
        },
        Commands::Token { action } => token_commands::handle_token(action, &config),
        Commands::Users { action } => data_commands::handle_users(action, &config).await,
        Commands::History {
            conversation_id,
            page,
            page_size,
        } => data_commands::history(&config, &conversation_id, page, page_size).await,
        Commands::Chats { user_id } => data_commands::chats(&config, &user_id).await,
    }
}
