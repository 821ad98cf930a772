use tracing_subscriber::EnvFilter;
use validation_cluster::api;
use validation_cluster::config::ClusterConfig;
use validation_cluster::pipeline::context::Pipeline;
use validation_cluster::pipeline::routes::dispatcher_for;
use validation_cluster::pipeline::validators::ValidatorRegistry;
use validation_cluster::queue::executor::JobExecutor;
use validation_cluster::storage::blob::{BlobStore, FileBlobStore, MemoryBlobStore};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut bind_addr: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--config <file.toml>] [--bind <addr:port>]", args[0]);
                eprintln!("Example: {} --config node.toml --bind 0.0.0.0:8080", args[0]);
                return Ok(());
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    // 1. Configuration:
    let mut config = match &config_path {
        Some(path) => ClusterConfig::from_file(path)?,
        None => {
            tracing::info!("No --config given, using defaults");
            ClusterConfig::default()
        }
    };
    if let Some(bind_addr) = bind_addr {
        config.server.bind = bind_addr;
    }

    // 2. Blob store:
    let blobs: Arc<dyn BlobStore> = match &config.storage.blob_root {
        Some(root) => {
            tracing::info!("Blob store at {}", root.display());
            Arc::new(FileBlobStore::new(root.clone()))
        }
        None => {
            tracing::info!("Blob store in memory");
            Arc::new(MemoryBlobStore::new())
        }
    };

    // 3. Pipeline:
    let pipeline = Pipeline::new(config, blobs, ValidatorRegistry::builtin())?;

    match pipeline.refresh_stop_places().await {
        Ok(true) => tracing::info!(
            "Stop place registry loaded: {} stop places, {} quays",
            pipeline.registry.snapshot().stop_places.len(),
            pipeline.registry.snapshot().quays.len()
        ),
        Ok(false) => tracing::warn!("No stop place source configured, registry is empty"),
        Err(e) => tracing::warn!("Initial stop place refresh failed: {:#}", e),
    }

    // 4. Worker pool:
    let executor = JobExecutor::new(
        pipeline.queue.clone(),
        dispatcher_for(&pipeline),
        pipeline.config.queue.workers_per_topic,
        pipeline.config.queue.lease_renewal(),
        pipeline.config.queue.poll_interval(),
    );
    executor.start();

    // 5. Housekeeping:
    let sweeper = pipeline.clone();
    let housekeeping = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper.config.storage.housekeeping_interval());
        loop {
            interval.tick().await;
            sweeper.housekeeping();
        }
    });

    // 6. HTTP server:
    let http_addr = pipeline.config.server.bind;
    let app = api::router(pipeline.clone());

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    housekeeping.abort();
    executor.shutdown();
    Ok(())
}
