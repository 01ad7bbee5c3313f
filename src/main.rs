use std::sync::Arc;

use media_bus::backend::{Backend, sim::SimBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::BackendKind,
    media::orchestrator::{MediaOrchestrator, OrchestratorOptions},
    signal::HttpSignaling,
};

mod api;
mod config;
mod handler;
mod media;
mod signal;
mod ui;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("media_bus", log::LevelFilter::Debug)
        .filter_module("open_video_chat", log::LevelFilter::Debug)
        .init();
}

fn create_backend(kind: BackendKind) -> anyhow::Result<Arc<dyn Backend>> {
    match kind {
        BackendKind::Sim => Ok(Arc::new(SimBackend::new())),
        #[cfg(feature = "gstreamer")]
        BackendKind::Gstreamer => Ok(Arc::new(media_bus::backend::gst::GstBackend::new())),
        #[cfg(not(feature = "gstreamer"))]
        BackendKind::Gstreamer => Err(anyhow::anyhow!("gstreamer backend not compiled in")),
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::load().unwrap_or_else(|e| {
        eprintln!("Error loading config: {:#}", e);
        std::process::exit(1);
    });
    let backend = media_bus::init()
        .and_then(|_| create_backend(config.backend()))
        .unwrap_or_else(|e| {
            eprintln!("Error initializing media backend: {:#}", e);
            std::process::exit(1);
        });

    let cancel = CancellationToken::new();

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    ui::start_console_ui(ui_rx, cancel.clone());

    let orchestrator = Arc::new(MediaOrchestrator::new(
        backend,
        Arc::new(HttpSignaling::new(config.peer_api())),
        ui_tx,
        OrchestratorOptions {
            nick: config.nick().to_string(),
            shared: config.shared(),
            settle_timeout: config.settle_timeout(),
            profile: config.wire().clone(),
            local_address: signal::address_resolver(config.local_ip()),
        },
    ));

    // Receive side is up before anyone learns our address.
    if let Err(e) = orchestrator.build_incoming().await {
        log::error!("incoming pipeline: {:#}", e);
    } else if let Err(e) = orchestrator.start_incoming().await {
        log::error!("incoming pipeline: {:#}", e);
    }

    api::start_api_server(config.api_listen(), orchestrator.clone(), cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    if let Err(e) = orchestrator.shutdown().await {
        log::warn!("shutdown: {:#}", e);
    }
    std::process::exit(0);
}
