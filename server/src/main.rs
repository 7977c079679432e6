//! Hearth Server binary

use clap::{Parser, Subcommand};
use hearth_server::{config::Config, crypto, router, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hearth Server CLI
#[derive(Parser)]
#[command(name = "hearth-server")]
#[command(about = "Signaling relay for Hearth calls and chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a relay token for a user
    IssueToken {
        /// User ID the token is bound to
        #[arg(long)]
        user_id: String,

        /// Validity in hours (defaults to auth.token_ttl_hours)
        #[arg(long)]
        ttl_hours: Option<u64>,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hearth_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::IssueToken { user_id, ttl_hours } => {
            issue_token(&config, &user_id, ttl_hours)?;
        }
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

fn issue_token(config: &Config, user_id: &str, ttl_hours: Option<u64>) -> anyhow::Result<()> {
    let Some(secret) = config.auth.shared_secret.as_deref() else {
        anyhow::bail!("auth.shared_secret is not set; relay tokens are disabled");
    };

    let ttl = ttl_hours.unwrap_or(config.auth.token_ttl_hours);
    let token = crypto::issue_token(user_id, secret, ttl);

    println!("=== Relay Token ===");
    println!("User ID: {}", user_id);
    println!("Valid for: {} hours", ttl);
    println!("Token: {}", token);
    println!("===================");

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Hearth Server v{}", env!("CARGO_PKG_VERSION"));
    if config.auth.shared_secret.is_none() {
        tracing::warn!("auth.shared_secret is not set; connections are not authenticated");
    }

    let addr = config.bind_address();
    let app = router(AppState::new(config));

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
