use anyhow::Context;
use nodepool_orchestrator::admin_api::{self, AppState};
use nodepool_orchestrator::config::OrchestratorSettings;
use nodepool_orchestrator::instance_launcher::InstanceLauncher;
use nodepool_orchestrator::instance_registry::InstanceRegistry;
use nodepool_orchestrator::provider_manager::ProviderManager;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = OrchestratorSettings::from_env().context("invalid orchestrator settings")?;
    let provider = ProviderManager::get_provider(&settings)
        .with_context(|| format!("unsupported provider '{}'", settings.provider))?;
    info!(
        provider = provider.name(),
        max_concurrent_requests = settings.launcher.max_concurrent_requests(),
        max_nodes_per_request = settings.launcher.max_nodes_per_request(),
        "Starting nodepool orchestrator"
    );

    let registry = Arc::new(InstanceRegistry::new());
    let launcher = InstanceLauncher::start(registry.clone(), provider.clone(), settings.launcher);

    let state = Arc::new(AppState {
        registry,
        provider_name: provider.name().to_string(),
        launcher: settings.launcher,
    });
    let app = admin_api::router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "Orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    if let Err(e) = launcher.shutdown().await {
        error!(error = %e, "Launcher shutdown failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
