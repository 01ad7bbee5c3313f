use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::media::orchestrator::MediaOrchestrator;

pub(crate) fn start_api_server(
    listen: &str,
    orchestrator: Arc<MediaOrchestrator>,
    cancel: CancellationToken,
) {
    let listen = listen.to_string();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/", get(index))
            .nest("/signal", crate::handler::signal::signal_router())
            .nest("/media", crate::handler::media::media_router())
            .with_state(orchestrator);

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server cannot bind {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error running API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "open video chat"
}
