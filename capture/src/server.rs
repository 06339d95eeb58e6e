use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::health::HealthRegistry;
use crate::pipeline::Pipeline;
use crate::router;
use crate::store::{KvBackend, MemoryBackend, SqliteBackend};
use crate::time::SystemTime;

/// Opens the configured backend and builds a stopped pipeline over it.
pub async fn build_pipeline(
    config: &Config,
    liveness: Option<HealthRegistry>,
) -> anyhow::Result<Arc<Pipeline>> {
    let backend: Arc<dyn KvBackend> = if config.memory_store {
        info!("using in-memory store, events won't survive a restart");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(
            SqliteBackend::open(&config.store_path)
                .await
                .with_context(|| format!("failed to open store at {}", config.store_path))?,
        )
    };

    let pipeline = Pipeline::new(
        backend,
        Arc::from(config.store_codec.build()),
        Arc::new(SystemTime {}),
        &config.pipeline,
        liveness,
    )
    .await;
    Ok(Arc::new(pipeline))
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let pipeline = build_pipeline(&config, Some(liveness.clone())).await?;
    pipeline.start().await.context("failed to start pipeline")?;

    let app = router::router(pipeline.clone(), liveness, config.export_prometheus);

    info!("listening on {:?}", listener.local_addr()?);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    // No more requests, commit whatever is still pending
    match pipeline.stop().await {
        Ok(receipt) => info!(
            committed = receipt.map_or(0, |receipt| receipt.keys.len()),
            "pipeline drained"
        ),
        Err(err) => error!("failed to drain pipeline: {}", err),
    }

    served.context("http server failed")
}
