use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use portkey::server::{self, Gateway};
use portkey::telemetry::{LogFormat, init_tracing};
use portkey::transport;
use portkey::{FederationManager, GatewayConfig, SchemaRegistry};

#[derive(Parser, Debug)]
#[command(name = "portkey", version, about = "GraphQL federation gateway")]
struct Args {
    /// Gateway configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => {
            warn!("no --config given, starting without subgraphs");
            GatewayConfig::default()
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    // No external message broker is wired into the binary, so broker mode is refused.
    let (fetcher, transport) = transport::from_config(&config, None)?;

    let registry = Arc::new(SchemaRegistry::new(fetcher, config.registry.poll_interval));
    for subgraph in &config.federation.subgraphs {
        match &subgraph.schema_file {
            Some(path) => {
                let sdl = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| format!("failed to read schema for '{}' from {}: {}", subgraph.name, path.display(), e))?;
                registry.register_schema(&subgraph.url, &subgraph.name, &sdl).await?;
            }
            None => registry.add_subgraph(&subgraph.name, &subgraph.url).await?,
        }
    }

    let manager = Arc::new(FederationManager::new(
        transport,
        config.executor.clone(),
        config.providers.clone(),
    ));
    registry.register(manager.clone()).await;

    let shutdown = CancellationToken::new();
    let discovery = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { registry.start(shutdown).await })
    };

    let gateway = Arc::new(Gateway::new(
        manager.clone(),
        config.websocket.clone(),
        config.federation.playground,
        shutdown.clone(),
    ));

    let listener = TcpListener::bind(config.listen).await?;
    if config.federation.playground {
        info!("GraphiQL UI available at http://{}/graphiql", config.listen);
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    server::serve(listener, gateway, shutdown.clone()).await?;

    let _ = discovery.await;
    if let Err(e) = manager.stop().await {
        warn!(error = %e, "providers did not shut down cleanly");
    }
    info!("gateway stopped");
    Ok(())
}
