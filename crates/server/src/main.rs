use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use terrapipe_core::{
    config_path, load_config, registry_from_config, validate_config, ConfigProvider, Orchestrator,
    PersistenceStore, SqlitePersistenceStore,
};
use terrapipe_server::api::{create_router, WsBroadcaster};
use terrapipe_server::state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_path();

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);
    info!(
        plugins = config.plugins.len(),
        projects = config.projects.len(),
        "Pipeline definitions loaded"
    );

    let store: Arc<dyn PersistenceStore> = Arc::new(
        SqlitePersistenceStore::new(&config.database.path)
            .context("Failed to open persistence store")?,
    );
    let registry = registry_from_config(&config).context("Failed to build plugin registry")?;

    let orchestrator = Orchestrator::new(config.orchestrator.clone(), store, Arc::new(registry));
    orchestrator.start().context("Failed to start orchestrator")?;

    let ws_broadcaster = WsBroadcaster::default();
    orchestrator.register_ui_observer(Arc::new(ws_broadcaster.clone()));

    // Seed schedulers for the projects declared in the config file
    for descriptor in config.project_descriptors() {
        let name = descriptor.name.clone();
        if let Err(e) = orchestrator.request_new_scheduler(descriptor, false) {
            warn!(project = %name, "Failed to queue scheduler: {}", e);
        }
    }
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::task::spawn_blocking(move || orchestrator.update_state())
            .await
            .context("Initial processing pass failed")?;
    }
    info!(
        schedulers = orchestrator.number_of_schedulers(),
        "Orchestrator started"
    );

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&orchestrator),
        ws_broadcaster,
    ));
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    let closing = Arc::clone(&orchestrator);
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .context("Failed to close orchestrator")?;
    info!("Orchestrator closed");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
