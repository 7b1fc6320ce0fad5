//! Lifecycle of the single active pipeline.
//!
//! All transitions (start, switch, stop, and the registry updates that go
//! with them) run under one async mutex, so concurrent requests queue up and
//! apply in arrival order. A replacement pipeline is opened and must produce
//! its first frame before the live outputs are handed over to it; the old
//! pipeline keeps publishing until that moment and is torn down right after.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::analytics::{
    spawn_pipeline, FirstOutput, PipelineContext, PipelineSpec, Polygon, WorkerHandle,
};
use crate::buffer::LiveOutputs;
use crate::camera::{ReconnectPolicy, ResilientSource, SourceError, SourceOpener};
use crate::config::Config;
use crate::storage::{Camera, CameraRegistry, RegistryError};

/// Extra time allowed on top of the opener's own timeout.
const OPEN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("pipeline startup failed: {0}")]
    StartupFailure(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Switching,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSource {
    pub pipeline_id: u64,
    pub label: String,
    pub source_url: String,
    pub camera_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub source: Option<ActiveSource>,
}

/// What to run: a source URL plus the camera context that goes with it.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub url: String,
    pub label: String,
    pub camera_id: Option<i64>,
    pub roi: Option<Polygon>,
}

impl SourceRequest {
    pub fn camera(camera: &Camera) -> Self {
        Self {
            url: camera.source_url.clone(),
            label: camera.name.clone(),
            camera_id: Some(camera.id),
            roi: camera.roi_polygon.clone(),
        }
    }

    pub fn video(path: &Path) -> Self {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            url: path.to_string_lossy().into_owned(),
            label,
            camera_id: None,
            roi: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub open_timeout: Duration,
    pub first_frame_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            open_timeout: config.source.open_timeout(),
            first_frame_timeout: config.source.first_frame_timeout(),
            reconnect: ReconnectPolicy::from(&config.source),
        }
    }
}

struct ActivePipeline {
    source: ActiveSource,
    worker: WorkerHandle,
}

struct Shared {
    active: Mutex<Option<ActivePipeline>>,
    status: RwLock<PipelineStatus>,
    opener: Arc<dyn SourceOpener>,
    context: PipelineContext,
    settings: ControllerSettings,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Shared>,
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        opener: Arc<dyn SourceOpener>,
        context: PipelineContext,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                status: RwLock::new(PipelineStatus {
                    state: PipelineState::Idle,
                    source: None,
                }),
                opener,
                context,
                settings,
                // 0 is the "no owner" id in the live outputs.
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared
            .status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn outputs(&self) -> &LiveOutputs {
        &self.shared.context.outputs
    }

    fn set_status(&self, state: PipelineState, source: Option<ActiveSource>) {
        let mut status = self.shared.status.write().unwrap_or_else(|p| p.into_inner());
        status.state = state;
        status.source = source;
    }

    /// Starts `request`, replacing the running pipeline if there is one.
    pub async fn start(&self, request: SourceRequest) -> Result<ActiveSource, ControlError> {
        self.switch(request).await
    }

    /// Replaces the running pipeline with one for `request`. On failure the
    /// previous pipeline (if any) is left running and its outputs untouched.
    pub async fn switch(&self, request: SourceRequest) -> Result<ActiveSource, ControlError> {
        let mut active = self.shared.active.lock().await;
        self.activate(&mut active, request).await
    }

    /// Stops the running pipeline and empties the live outputs. Idempotent.
    pub async fn stop(&self) {
        let mut active = self.shared.active.lock().await;
        self.teardown(&mut active).await;
    }

    /// Activates a registered camera and records it as the active camera.
    pub async fn select_camera(
        &self,
        registry: &CameraRegistry,
        id: i64,
    ) -> Result<Camera, ControlError> {
        let mut active = self.shared.active.lock().await;
        let camera = registry.get(id)?;
        self.activate(&mut active, SourceRequest::camera(&camera)).await?;
        registry.select(id)?;
        Ok(camera)
    }

    /// Activates a local video file; no camera is active afterwards.
    pub async fn select_video(
        &self,
        registry: &CameraRegistry,
        path: &Path,
    ) -> Result<ActiveSource, ControlError> {
        let mut active = self.shared.active.lock().await;
        let source = self.activate(&mut active, SourceRequest::video(path)).await?;
        registry.deselect()?;
        Ok(source)
    }

    /// Deletes a camera; stops the pipeline when that camera was running.
    pub async fn delete_camera(
        &self,
        registry: &CameraRegistry,
        id: i64,
    ) -> Result<(), ControlError> {
        let mut active = self.shared.active.lock().await;
        let was_active = registry.delete(id)?;
        let running = active
            .as_ref()
            .is_some_and(|p| p.source.camera_id == Some(id));
        if was_active || running {
            tracing::info!(camera = id, "active camera deleted, stopping pipeline");
            self.teardown(&mut active).await;
        }
        Ok(())
    }

    /// Stops the pipeline and clears the active camera.
    pub async fn deactivate(&self, registry: &CameraRegistry) -> Result<(), ControlError> {
        let mut active = self.shared.active.lock().await;
        self.teardown(&mut active).await;
        registry.deselect()?;
        Ok(())
    }

    async fn activate(
        &self,
        active: &mut Option<ActivePipeline>,
        request: SourceRequest,
    ) -> Result<ActiveSource, ControlError> {
        let previous = self.status();
        let transitional = if active.is_some() {
            PipelineState::Switching
        } else {
            PipelineState::Starting
        };
        self.set_status(transitional, previous.source.clone());

        let (source, mut worker, first) = match self.launch(request).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(error = %e, "keeping previous pipeline");
                self.set_status(previous.state, previous.source);
                return Err(e);
            }
        };

        let id = source.pipeline_id;
        self.shared
            .context
            .outputs
            .hand_over(id, first.frame, first.metrics);
        self.supervise(id, worker.take_failure());

        let replaced = active.replace(ActivePipeline {
            source: source.clone(),
            worker,
        });
        if let Some(old) = replaced {
            tracing::info!(
                from = old.source.pipeline_id,
                to = id,
                source = %source.label,
                "switched pipeline"
            );
            old.worker.stop().await;
        } else {
            tracing::info!(pipeline = id, source = %source.label, "pipeline started");
        }

        self.set_status(PipelineState::Running, Some(source.clone()));
        Ok(source)
    }

    /// Opens the source and waits for the first processed frame.
    async fn launch(
        &self,
        request: SourceRequest,
    ) -> Result<(ActiveSource, WorkerHandle, FirstOutput), ControlError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let settings = &self.shared.settings;

        tracing::debug!(pipeline = id, url = %request.url, "opening source");
        let opener = Arc::clone(&self.shared.opener);
        let url = request.url.clone();
        let opening = tokio::task::spawn_blocking(move || opener.open(&url));
        let initial = match tokio::time::timeout(settings.open_timeout + OPEN_GRACE, opening).await
        {
            Ok(Ok(Ok(source))) => source,
            Ok(Ok(Err(e))) => return Err(ControlError::StartupFailure(e.to_string())),
            Ok(Err(e)) => {
                return Err(ControlError::StartupFailure(format!("open task failed: {e}")))
            }
            Err(_) => {
                return Err(ControlError::StartupFailure(format!(
                    "{}: open timed out",
                    request.url
                )))
            }
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let source = ResilientSource::new(
            Arc::clone(&self.shared.opener),
            &request.url,
            initial,
            settings.reconnect,
            Arc::clone(&shutdown),
        );
        let mut worker = spawn_pipeline(
            PipelineSpec {
                id,
                label: request.label.clone(),
                source,
                roi: request.roi,
                shutdown,
            },
            &self.shared.context,
        );

        let Some(first_rx) = worker.take_first_output() else {
            worker.stop().await;
            return Err(ControlError::StartupFailure(
                "worker has no first-frame channel".to_string(),
            ));
        };
        let first = tokio::time::timeout(settings.first_frame_timeout, first_rx).await;

        match first {
            Ok(Ok(first)) => Ok((
                ActiveSource {
                    pipeline_id: id,
                    label: request.label,
                    source_url: request.url,
                    camera_id: request.camera_id,
                },
                worker,
                first,
            )),
            Ok(Err(_)) => {
                let mut failure = worker.take_failure();
                worker.stop().await;
                let reason = failure
                    .as_mut()
                    .and_then(|rx| rx.try_recv().ok())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "source ended before the first frame".to_string());
                Err(ControlError::StartupFailure(reason))
            }
            Err(_) => {
                worker.stop().await;
                Err(ControlError::StartupFailure(format!(
                    "no frame within {:?}",
                    settings.first_frame_timeout
                )))
            }
        }
    }

    async fn teardown(&self, active: &mut Option<ActivePipeline>) {
        if let Some(pipeline) = active.take() {
            self.set_status(PipelineState::Stopping, Some(pipeline.source.clone()));
            pipeline.worker.stop().await;
            tracing::info!(pipeline = pipeline.source.pipeline_id, "pipeline stopped");
        }
        self.shared.context.outputs.clear();
        self.set_status(PipelineState::Idle, None);
    }

    /// Returns the controller to Idle if pipeline `id` dies while current.
    fn supervise(&self, id: u64, failure: Option<oneshot::Receiver<SourceError>>) {
        let Some(failure) = failure else {
            return;
        };
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            // Dropped without a value on a requested stop.
            let Ok(error) = failure.await else {
                return;
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let controller = PipelineController { shared };
            let mut active = controller.shared.active.lock().await;
            if active.as_ref().map(|p| p.source.pipeline_id) != Some(id) {
                return;
            }
            tracing::error!(pipeline = id, error = %error, "active pipeline failed, returning to idle");
            controller.teardown(&mut active).await;
        });
    }
}
