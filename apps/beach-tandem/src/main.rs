mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use beach_tandem::access::{AccessControl, RemoteAccess, TokenAccess};
use beach_tandem::bus::RedisBus;
use beach_tandem::config::Config;
use beach_tandem::node::Node;
use beach_tandem::store::{MemoryStore, RedisStore, RoomStateStore};
use beach_tandem::telemetry::Telemetry;
use transport_bus::{Bus, LocalBus};

use crate::cli::{Cli, Commands, DebugOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Debug {
            url,
            token,
            collection,
            item,
            version,
            focus,
            value,
        } => {
            cli::run_debug_client(DebugOptions {
                url,
                token,
                collection,
                item,
                version,
                focus,
                value,
            })
            .await
        }
        Commands::Serve => serve(telemetry).await,
    }
}

async fn serve(telemetry: Telemetry) -> Result<()> {
    let config = Config::from_env();
    info!("Starting beach-tandem on port {}", config.port);

    let (store, bus): (Arc<dyn RoomStateStore>, Arc<dyn Bus>) = match &config.redis_url {
        Some(url) => {
            let store: Arc<dyn RoomStateStore> = Arc::new(
                RedisStore::connect(url)
                    .await
                    .context("failed to connect room store to Redis")?,
            );
            let bus: Arc<dyn Bus> = Arc::new(
                RedisBus::connect(url)
                    .await
                    .context("failed to connect bus to Redis")?,
            );
            (store, bus)
        }
        None => {
            warn!("REDIS_URL not set, running a single node with in-process state");
            let store: Arc<dyn RoomStateStore> = Arc::new(MemoryStore::new());
            let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
            (store, bus)
        }
    };

    let access: Arc<dyn AccessControl> = Arc::new(TokenAccess::new(
        config.token_secret.as_deref(),
        config.access_url.clone().map(RemoteAccess::new),
    ));

    let port = config.port;
    let node = Arc::new(Node::start(config, store, bus, access, telemetry.metrics_handle()).await?);
    let app = node.router();

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(node = %node.id(), "beach-tandem listening on {}", addr);

    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}
