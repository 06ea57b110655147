use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

mod app;
mod auth;
mod http;
mod net;
mod ws;

#[derive(Parser)]
#[command(name = "convoai-gateway", about = "ConvoAI conversation-plane gateway")]
struct Cli {
    /// Path to convoai.toml (default: ~/.convoai/convoai.toml)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Sign a bearer token with the configured verification key.
    MintToken {
        /// Subject the token identifies.
        #[arg(long)]
        subject: String,
        /// Role to embed (repeatable), e.g. --role admin
        #[arg(long = "role", default_values_t = vec!["user".to_string()])]
        roles: Vec<String>,
        /// Token lifetime in seconds.
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoai_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // config path: explicit flag > CONVOAI_CONFIG env > ~/.convoai/convoai.toml
    let config_path = cli
        .config
        .or_else(|| std::env::var("CONVOAI_CONFIG").ok());
    let config = convoai_core::config::ConvoConfig::load(config_path.as_deref())?;

    // Fatal startup check: an empty verification key means every component
    // would accept forged tokens. Refuse to start.
    let verifier = convoai_identity::Verifier::new(&config.auth.verification_key)?;

    if let Some(Command::MintToken {
        subject,
        roles,
        ttl_secs,
    }) = cli.command
    {
        let exp = chrono::Utc::now().timestamp() + ttl_secs;
        let token = verifier.sign(&convoai_identity::Claims::new(subject, roles, exp))?;
        println!("{}", token);
        return Ok(());
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let state = Arc::new(app::AppState::new(config, verifier)?);
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("ConvoAI gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
