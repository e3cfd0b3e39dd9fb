use anyhow::{Context, Result};
use facemirror_core::{BlobStore, EmbeddingMatcher, FsBlobStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod scratch;
mod service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facemirrord starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        bucket = %config.bucket,
        store_dir = %config.store_dir.display(),
        mirror_root = %config.mirror_root.display(),
        models = ?config.models,
        metric = %config.metric,
        threshold = config.threshold,
        "configuration loaded"
    );

    let store: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::create(&config.store_dir, &config.bucket)
            .context("failed to open blob store")?,
    );
    std::fs::create_dir_all(&config.mirror_root)
        .with_context(|| format!("failed to create {}", config.mirror_root.display()))?;
    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("failed to create {}", config.scratch_dir.display()))?;

    let matcher = EmbeddingMatcher::with_builtin();
    let known = matcher.model_ids();
    let unknown: Vec<&String> = config
        .models
        .iter()
        .filter(|m| !known.contains(&m.as_str()))
        .collect();
    if !unknown.is_empty() {
        anyhow::bail!("unknown model(s) {unknown:?}; available: {known:?}");
    }

    let listen_addr = config.listen_addr;
    let service = Arc::new(
        service::FaceService::new(config, store, Arc::new(matcher))
            .context("failed to start match engine")?,
    );

    // Bring the mirror up to date before accepting traffic.
    match service.sync_now().await {
        Ok(report) => tracing::info!(
            downloaded = report.downloaded,
            deleted = report.deleted,
            failed = report.failures.len(),
            "initial sync done"
        ),
        Err(e) => tracing::warn!(error = %e, "initial sync failed; serving the existing mirror"),
    }

    let app = http::router(service);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "facemirrord ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("facemirrord shutting down");
        })
        .await?;

    Ok(())
}
