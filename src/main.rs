use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use hieasy_bridge::config::BridgeConfig;
use hieasy_bridge::services::manager::{self, BridgeState};
use hieasy_bridge::services::{ingest::IngestManager, recorder, rtsp, upload};
use hieasy_bridge::web::{self, AppState, ConfigFetcher};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("DVR_LOG_LEVEL")
                    .unwrap_or_else(|_| "info".to_string())
                    .parse()
                    .unwrap_or_default()
            }),
        )
        .init();

    let cfg = BridgeConfig::from_env()?;
    info!(
        "hieasy-bridge v{} starting (dvr={}, channels={}, rtsp=:{}, web=:{})",
        env!("CARGO_PKG_VERSION"),
        if cfg.dvr_host.is_empty() {
            "<discover>"
        } else {
            cfg.dvr_host.as_str()
        },
        cfg.channels,
        cfg.rtsp_port,
        cfg.web_port
    );
    if cfg.dvr_host.is_empty() {
        warn!("DVR_HOST not set, relying on subnet discovery");
    }

    let state = Arc::new(BridgeState::new(&cfg));
    let (shutdown_tx, _) = watch::channel(false);

    // RTSP server child (mediamtx) with its on-demand hooks.
    tokio::spawn(rtsp::supervise(cfg.clone(), shutdown_tx.subscribe()));

    // Per-path ingest supervisors, idle until a hook demands them.
    let ingest = IngestManager::new(&cfg, state.clone());

    // Recorder + upload worker.
    let (recorder_tx, recorder_rx) = mpsc::channel(8);
    let upload_tx = if cfg.record.upload_command.is_some() {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(upload::run(cfg.record.clone(), state.clone(), rx));
        Some(tx)
    } else {
        None
    };
    tokio::spawn(recorder::run(
        cfg.clone(),
        state.clone(),
        recorder_rx,
        upload_tx,
        shutdown_tx.subscribe(),
    ));

    // DVR reachability + auto-discovery.
    tokio::spawn(manager::discovery_monitor(
        cfg.clone(),
        state.clone(),
        shutdown_tx.subscribe(),
    ));

    // HTTP API + dashboard.
    let app = Arc::new(AppState {
        config_client: ConfigFetcher::new(cfg.clone(), state.clone()),
        cfg,
        bridge: state,
        ingest,
        recorder_tx,
    });
    let web_task = tokio::spawn(web::serve(app, shutdown_tx.subscribe()));

    shutdown_signal().await;
    info!("shutting down");
    shutdown_tx.send_replace(true);

    // Give the services a moment to stop their children cleanly; any
    // stragglers die with the process via kill_on_drop.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(6), web_task).await;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
