use roomforge::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RoomforgeError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roomforge=info,tower_http=info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let catalog = match &config.templates_path {
        Some(path) => TemplateCatalog::load(path)?,
        None => {
            tracing::warn!("ROOMFORGE_TEMPLATES is not set, starting without templates");
            TemplateCatalog::new()
        }
    };
    tracing::info!(
        backend = %config.backend,
        templates = catalog.len(),
        orphan_policy = %config.manager.orphan_policy,
        "configuration loaded"
    );

    let backend = select_backend(&config.backend, config.docker.clone())?;
    let server = RoomforgeServer::builder()
        .bind(config.bind)
        .manager_config(config.manager)
        .gateway_config(config.gateway)
        .backend(backend)
        .catalog(catalog)
        .build()
        .await?;
    tracing::info!(addr = %server.local_addr()?, "roomforged listening");

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await
}
