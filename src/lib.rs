pub mod api;
pub mod app_state;
pub mod config;
pub mod filters;
pub mod media;
pub mod motion;
pub mod naming;
pub mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

//
// Re-export
//
pub use app_state::AppState;
pub use config::Config;
pub use media::{Input, InputHandle, MediaError, OutputFile, OutputSettings, SourceDescriptor};
pub use motion::{MotionData, MotionSnapshot};
pub use naming::{DateFolderFactory, FileNameFactory};
pub use worker::{FrameSource, MotionDataWorker, OnSourceFailure, Recorder, RecordingPolicy};

/// Opens the source, starts the motion worker and serves the HTTP API until
/// ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    media::init_with_log_level(config.ffmpeg_log_level());

    let source = config.source_descriptor();
    let settings = config.output_settings();
    let url = source.url.clone();
    let input = tokio::task::spawn_blocking(move || Input::open(&source, settings))
        .await?
        .with_context(|| format!("Failed to open video source {url}"))?;
    info!(%url, fps = input.fps(), streams = input.streams().len(), "Video source opened");

    let recorder = input.handle();
    let naming = Arc::new(DateFolderFactory::new(
        &config.output_files.prefix,
        config.output_files.extension.clone(),
    ));
    let mut worker = MotionDataWorker::new(
        input,
        recorder,
        naming,
        config.background_subtractor.clone(),
        config.preprocess.clone(),
        RecordingPolicy::from(&config.segmentation),
    );
    let mut worker = tokio::task::spawn_blocking(move || worker.start().map(|()| worker))
        .await?
        .context("Failed to start motion worker")?;

    let state = AppState::new(worker.motion_data(), worker.recorder());
    let app = api::router(state);

    let addr = &config.http_server.host_and_port;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    tokio::task::spawn_blocking(move || worker.stop()).await?;
    Ok(())
}
