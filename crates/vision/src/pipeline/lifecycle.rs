//! Ties the camera stream and the classification worker to the
//! foreground/background lifecycle.
//!
//! Activation starts the worker before the camera so no frame arrives without
//! a consumer. Deactivation runs in the opposite order: the camera stops first,
//! then the worker is quiesced and joined within a bounded timeout. A worker
//! that misses the timeout is parked and must be reaped before the next
//! activation, so two workers never run at once.

use std::{sync::Arc, time::Duration};

use ml_core::DeviceConfig;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CameraProvider, CaptureError, FrameSink, LensPosition, RawFrame};

use crate::pipeline::{
    engine::{ConfigureError, EngineId, EngineManager},
    ingest::FrameIngest,
    publisher::ResultPublisher,
    scheduler::{ClassificationScheduler, SchedulerStats, StatsSnapshot, ThreadLifecycleError},
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Thread(#[from] ThreadLifecycleError),
    #[error("camera: {0}")]
    Camera(#[from] CaptureError),
}

pub struct LifecycleBinder {
    camera: Box<dyn CameraProvider>,
    engines: Arc<EngineManager>,
    publisher: Arc<ResultPublisher>,
    ingest: Arc<FrameIngest>,
    teardown_timeout: Duration,
    stats: Arc<SchedulerStats>,
    active: Option<ClassificationScheduler>,
    /// Worker that missed its teardown timeout; reaped on the next activation
    /// or on shutdown.
    stale: Option<ClassificationScheduler>,
}

impl LifecycleBinder {
    pub fn new(
        camera: Box<dyn CameraProvider>,
        engines: Arc<EngineManager>,
        publisher: Arc<ResultPublisher>,
        ingest: FrameIngest,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            camera,
            engines,
            publisher,
            ingest: Arc::new(ingest),
            teardown_timeout,
            stats: Arc::default(),
            active: None,
            stale: None,
        }
    }

    /// Start the worker, then the camera. No-op when already active.
    pub fn activate(&mut self) -> Result<(), LifecycleError> {
        let span = info_span!("lifecycle.activate");
        let _entered = span.enter();

        if self.active.is_some() {
            debug!("Already active");
            return Ok(());
        }
        self.reap_stale()?;

        let mut scheduler = ClassificationScheduler::start_with_stats(
            self.engines.clone(),
            self.publisher.clone(),
            self.stats.clone(),
        )?;

        let submitter = scheduler.submitter();
        let ingest = self.ingest.clone();
        let sink: FrameSink = Arc::new(move |frame: RawFrame| {
            let timestamp_ms = frame.timestamp_ms;
            match ingest.preprocess(frame) {
                Ok(image) => {
                    let outcome = submitter.submit(image, timestamp_ms);
                    debug!("Frame at {timestamp_ms}: {outcome:?}");
                }
                Err(err) => {
                    metrics::counter!("classify_preprocess_errors_total").increment(1);
                    warn!("Dropping frame at {timestamp_ms}: {err}");
                }
            }
        });

        if let Err(err) = self.camera.start(sink) {
            error!("Failed to start {} camera: {err}", self.camera.lens());
            scheduler.quiesce();
            if let Err(join_err) = scheduler.join(self.teardown_timeout) {
                warn!("Worker teardown after camera failure: {join_err}");
                self.stale = Some(scheduler);
            }
            return Err(err.into());
        }

        self.active = Some(scheduler);
        info!("Classification active on {} lens", self.camera.lens());
        Ok(())
    }

    /// Stop the camera, then quiesce and join the worker within the timeout.
    ///
    /// On `TeardownTimeout` the worker is abandoned to the stale slot; no
    /// result it produces is published.
    pub fn deactivate(&mut self) -> Result<(), LifecycleError> {
        let span = info_span!("lifecycle.deactivate");
        let _entered = span.enter();

        let Some(mut scheduler) = self.active.take() else {
            return Ok(());
        };

        let camera_result = self.camera.stop();
        if let Err(err) = &camera_result {
            warn!("Failed to stop camera cleanly: {err}");
        }

        scheduler.quiesce();
        match scheduler.join(self.teardown_timeout) {
            Ok(()) => {}
            Err(err @ ThreadLifecycleError::TeardownTimeout { .. }) => {
                error!("{err}; abandoning it until the next activation");
                self.stale = Some(scheduler);
                return Err(err.into());
            }
            Err(err) => {
                error!("Classification worker teardown failed: {err}");
                return Err(err.into());
            }
        }

        camera_result?;
        info!("Classification paused");
        Ok(())
    }

    /// Wait once more for a worker abandoned by an earlier deactivation.
    fn reap_stale(&mut self) -> Result<(), LifecycleError> {
        let Some(mut stale) = self.stale.take() else {
            return Ok(());
        };

        match stale.join(self.teardown_timeout) {
            Ok(()) => {
                info!("Reaped previous classification worker");
                Ok(())
            }
            Err(ThreadLifecycleError::WorkerPanicked) => {
                warn!("Previous classification worker had panicked");
                Ok(())
            }
            Err(err) => {
                error!("Previous classification worker still running: {err}");
                self.stale = Some(stale);
                Err(ThreadLifecycleError::StaleWorker.into())
            }
        }
    }

    pub fn switch_lens(&mut self) -> Result<LensPosition, LifecycleError> {
        Ok(self.camera.switch_lens()?)
    }

    pub fn lens(&self) -> LensPosition {
        self.camera.lens()
    }

    /// Reconfigure the engine; classification continues on the old engine on error.
    pub fn configure(&self, config: DeviceConfig) -> Result<EngineId, ConfigureError> {
        self.engines.configure(config)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_stale_worker(&self) -> bool {
        self.stale.is_some()
    }

    /// Counters accumulated across every activation.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn engines(&self) -> &Arc<EngineManager> {
        &self.engines
    }

    /// Deactivate, reap any parked worker and release the engine. Used on final exit.
    ///
    /// Returns `StaleWorker` and keeps the engine open while a worker is still
    /// running; the call can be retried.
    pub fn shutdown(&mut self) -> Result<(), LifecycleError> {
        let deactivated = match self.deactivate() {
            // The parked worker gets one more wait below.
            Err(LifecycleError::Thread(ThreadLifecycleError::TeardownTimeout { .. })) => Ok(()),
            other => other,
        };
        if let Err(err) = self.reap_stale() {
            error!("Keeping the classifier open until the worker exits");
            return Err(err);
        }

        if self.engines.close() {
            info!("Classifier released");
        }
        deactivated
    }
}

impl Drop for LifecycleBinder {
    fn drop(&mut self) {
        if let Err(err) = self.deactivate() {
            warn!("Deactivation on drop failed: {err}");
        }
        if let Err(err) = self.reap_stale() {
            error!("Abandoning classification worker on drop: {err}");
        }
    }
}
