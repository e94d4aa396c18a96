use crate::camera::HttpCamera;
use crate::config::Config;
use crate::server::{Detector, HttpServer};
use crate::sink::JsonFileSink;
use crate::telemetry::Metrics;
use crate::transport::WsConnector;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let camera = match HttpCamera::new(&config.camera) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::error!("Failed to initialize camera client: {:?}", e);
            return Err(Box::new(e));
        }
    };

    if config.inference.api_key.is_empty() {
        tracing::warn!("No inference API key configured, set OD_INFERENCE__API_KEY");
    }

    let connector = WsConnector::new(
        config.inference.get_address(),
        config.inference.connect_retries,
        config.inference.get_handshake_timeout(),
    );
    let sink = JsonFileSink::new(&config.results.directory);
    let metrics = Arc::new(Metrics::new()?);

    let detector: Arc<Detector> = Arc::new(
        Detector::new(
            connector,
            camera,
            sink,
            &config.inference,
            config.acquisition.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    tracing::info!("Detector configured: {:?}", config.acquisition);

    let server = HttpServer::new(detector, metrics, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with an error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
