use anyhow::{Context, Result};
use axum::Router;
use file_drop::{
    config::{AppConfig, DatabaseConfig, StorageConfig},
    registry::{FileRegistry, PostgresRegistry, SqliteRegistry},
    routes,
    services::{
        file_service::{FileService, ServiceSettings},
        sync_service::MetadataSynchronizer,
    },
    storage::{BlobStore, LocalBlobStore, S3BlobStore},
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = match AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("Configuration error: {}", err);
            return Err(err.into());
        }
    };

    tracing::info!("Starting file-drop with config: {:?}", cfg);

    // --- Initialize registry ---
    let registry: Arc<dyn FileRegistry> = match &cfg.database {
        DatabaseConfig::Postgres(pg) => Arc::new(
            PostgresRegistry::connect(pg, cfg.op_timeout)
                .await
                .context("connecting to postgres")?,
        ),
        DatabaseConfig::Sqlite { url } => Arc::new(
            SqliteRegistry::connect(url)
                .await
                .with_context(|| format!("opening sqlite database {url}"))?,
        ),
    };

    registry
        .ping()
        .await
        .context("registry connectivity check")?;
    tracing::info!("Successfully connected to the database");

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize blob store ---
    let store: Arc<dyn BlobStore> = match &cfg.storage {
        StorageConfig::S3(s3) => Arc::new(S3BlobStore::new(s3.clone())),
        StorageConfig::Local { root, bucket } => {
            let store = LocalBlobStore::open(root, bucket.clone())
                .await
                .with_context(|| format!("opening storage directory {root}"))?;
            tracing::info!("Using local storage at {}/{}", root, bucket);
            Arc::new(store)
        }
    };

    // --- Initialize core services ---
    let sync = MetadataSynchronizer::new(store.clone(), registry.clone(), cfg.sync.clone());
    let service = FileService::new(
        store,
        registry,
        sync,
        ServiceSettings {
            op_timeout: cfg.op_timeout,
            unpack_archives: cfg.unpack_archives,
            max_unpacked_bytes: cfg.max_unpacked_bytes,
            ..ServiceSettings::default()
        },
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("HTTP server closed");

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received: closing HTTP server");
}
