use anyhow::{Context, Result};
use celebclass_core::{ArtifactStore, ClassificationService, FaceEyeDetector};
use celebclassd::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!(bind = %config.bind_addr, "celebclassd starting");

    let cascades = config.cascade_paths();
    let detector = FaceEyeDetector::load(&cascades, config.detector_config())
        .with_context(|| format!("loading Haar cascades from {}", config.cascade_dir.display()))?;

    let artifacts = Arc::new(ArtifactStore::load(&config.artifact_paths()));
    let service = ClassificationService::new(detector, artifacts).with_wavelet(config.wavelet_config());
    if !service.is_ready() {
        tracing::warn!("artifacts not loaded; /classify_image will answer with empty results");
    }

    let app = celebclassd::router(Arc::new(service));
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "celebclassd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("celebclassd shutting down");
    Ok(())
}
