use crate::{
    config::Config, image_store::ImageStore, inference_service::InferenceService,
    model_host::ModelHost, server::HttpServer,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let images = match ImageStore::open(&config.storage) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open upload directory: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let models_config = config.models.clone();
    let models = tokio::task::spawn_blocking(move || ModelHost::initialize(&models_config)).await?;

    let inference_service = InferenceService::new(Arc::new(models), images);
    let server = HttpServer::new(inference_service, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
