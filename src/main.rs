use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod buffer;
mod camera;
mod config;
mod controller;
mod storage;
#[cfg(test)]
mod testing;
mod videos;

use analytics::{
    annotate, Detector, ObjectDetector, PipelineContext, SharedDetector, WorkerSettings,
};
use api::{start_server, AppState, MetricsBroadcaster, StreamSettings};
use buffer::LiveOutputs;
use camera::DefaultOpener;
use config::Config;
use controller::{ControllerSettings, PipelineController};
use storage::{spawn_history_writer, CameraRegistry, MetricsHistory};
use videos::VideoLibrary;

const PLACEHOLDER_WIDTH: i32 = 640;
const PLACEHOLDER_HEIGHT: i32 = 480;
const HISTORY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trafcam=debug".parse()?))
        .init();

    let config = Config::load()?;
    tracing::info!(
        database = %config.storage.database_path.display(),
        videos = %config.videos.directory.display(),
        "configuration loaded"
    );

    let registry = Arc::new(CameraRegistry::open(&config.storage.database_path)?);
    let history = Arc::new(MetricsHistory::open(&config.storage.database_path)?);
    let (history_tx, mut history_writer) = spawn_history_writer(Arc::clone(&history));

    let detector: Box<dyn Detector> = Box::new(ObjectDetector::new(&config.detector)?);
    let detector: SharedDetector = Arc::new(Mutex::new(detector));
    tracing::info!(model = %config.detector.model_path, "detector ready");

    let outputs = LiveOutputs::new();
    let context = PipelineContext {
        detector,
        outputs: outputs.clone(),
        history: Some(history_tx),
        settings: WorkerSettings::from(&config),
    };
    let controller = PipelineController::new(
        ControllerSettings::from(&config),
        Arc::new(DefaultOpener::new(config.source.open_timeout())),
        context,
    );

    let broadcaster = Arc::new(MetricsBroadcaster::new(config.broadcast.subscriber_queue));
    let forwarder = broadcaster.spawn_forwarder(outputs.subscribe_feed());

    let videos = Arc::new(VideoLibrary::new(&config.videos));
    let placeholder =
        annotate::placeholder_jpeg(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, config.stream.jpeg_quality)?;

    if let Some(name) = config.videos.startup.clone() {
        let controller = controller.clone();
        let registry = Arc::clone(&registry);
        let videos = Arc::clone(&videos);
        tokio::spawn(async move {
            let path = match videos.resolve(&name) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(video = %name, error = %e, "startup video not found");
                    return;
                }
            };
            match controller.select_video(&registry, &path).await {
                Ok(source) => tracing::info!(video = %source.label, "startup video active"),
                Err(e) => tracing::warn!(video = %name, error = %e, "startup video failed"),
            }
        });
    }

    let state = AppState {
        registry,
        controller: controller.clone(),
        broadcaster,
        history,
        videos,
        stream: StreamSettings {
            boundary: Arc::from(config.stream.boundary.as_str()),
            placeholder: Bytes::from(placeholder),
        },
    };

    let http = config.http.clone();
    let mut server = tokio::spawn(async move { start_server(state, &http).await });

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => tracing::info!("HTTP server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
                Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            server.abort();
            let _ = server.await;
        }
    }

    controller.stop().await;
    forwarder.abort();
    // The controller holds the last history sender; the writer ends once it is gone.
    drop(controller);
    match tokio::time::timeout(HISTORY_DRAIN_TIMEOUT, &mut history_writer).await {
        Ok(Ok(())) => tracing::debug!("history writer drained"),
        Ok(Err(e)) => tracing::warn!(error = %e, "history writer task failed"),
        Err(_) => {
            tracing::warn!("history writer still busy, aborting");
            history_writer.abort();
        }
    }
    tracing::info!("shutdown complete");

    Ok(())
}
