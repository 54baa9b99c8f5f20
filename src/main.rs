use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

use research_chat::db::{self, ChatStorage};
use research_chat::{config::Config, utils::init_logger, AppState};

#[derive(Parser, Debug)]
#[command(name = "research-chat", version, about = "Streaming research chat server")]
struct Args {
    /// Address to bind, overrides HOST
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overrides PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Path of the UI settings file, overrides SETTINGS_FILE
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Also write daily-rolling logs to this directory
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so RUST_LOG and LOG_DIR from it reach the logger
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _log_guard = init_logger(args.log_dir.as_deref());

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(settings) = args.settings {
        config.settings_file = settings;
    }
    info!(
        host = %config.server.host,
        port = config.server.port,
        backend = ?config.database.backend,
        provider = %config.llm.default_provider,
        "Configuration loaded"
    );

    // Connect to database and create the schema
    let storage = db::create_storage(&config.database).await?;
    storage.initialize().await?;
    info!(backend = storage.backend_name(), "Chat storage ready");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = AppState::new(config, storage.clone());
    let app = research_chat::create_router(state);

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    storage.close().await;
    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(anyhow::anyhow!("Server error: {}", e));
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
