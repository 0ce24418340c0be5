use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_subscriber::EnvFilter;
use vigil_core::OnnxFaceAnalyzer;
use vigil_hw::{FfmpegOpener, V4l2Opener};

mod config;
mod dbus_interface;
mod http;
mod live;
mod outcome;
mod overlay;
mod pipeline;
mod recorder;
mod registry;
mod service;
mod store;

use config::Config;
use dbus_interface::{WatchService, BUS_NAME, OBJECT_PATH};
use registry::Registry;
use service::Service;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigild starting");

    let config = Config::load().context("failed to load configuration")?;
    config
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let db_path = config.db_path();
    let store = Arc::new(
        Store::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database opened");

    let analyzer = OnnxFaceAnalyzer::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.detection_confidence,
    )
    .context("failed to load face models")?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");
    let analyzer = registry::share_analyzer(Box::new(analyzer));

    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        Arc::clone(&analyzer),
        config.known_faces_dir(),
        config.face_size_threshold as f32,
    ));
    let known = registry.load().context("failed to load known persons")?;
    tracing::info!(count = known, "known persons loaded");

    let sources = Arc::new(V4l2Opener {
        device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        fps: config.camera_fps,
    });
    let sinks = Arc::new(FfmpegOpener {
        ffmpeg: config.ffmpeg_path.clone(),
        codec: config.video_codec.clone(),
    });

    let listen = config.http_listen;
    let service = Arc::new(Service::new(
        config,
        Arc::clone(&store),
        registry,
        analyzer,
        sources,
        sinks,
    ));
    store::log_failure(
        "log startup",
        store.log_system_event("INFO", "Daemon started", Some(env!("CARGO_PKG_VERSION"))),
    );

    let system_bus = std::env::var("VIGIL_DBUS_SYSTEM").is_ok_and(|v| v == "1");
    let builder = if system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _dbus = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, WatchService::new(Arc::clone(&service)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(name = BUS_NAME, system_bus, "D-Bus interface registered");

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(addr = %listen, "HTTP server listening");
    let app = http::router(Arc::clone(&service));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    tracing::info!("vigild ready");

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    wait_for_shutdown(&mut terminate).await?;
    tracing::info!("vigild shutting down");

    // Closes any open recording before the process exits
    service.shutdown().await;
    server.abort();
    store::log_failure("log shutdown", store.log_system_event("INFO", "Daemon stopped", None));

    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn wait_for_shutdown(terminate: &mut Signal) -> Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}
