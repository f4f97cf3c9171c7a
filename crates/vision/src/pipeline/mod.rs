//! Live classification pipeline: camera frames in, gated labels out.
//!
//! The module is split into focused submodules:
//! - `ingest`: Raw frame validation, colour conversion, crop and resize.
//! - `scheduler`: Keep-latest slot and the single classification worker.
//! - `engine`: Engine validation, hot swap and disposal.
//! - `publisher`: Confidence gate and ordered delivery to the presentation side.
//! - `lifecycle`: Activate/deactivate of camera and worker together.
//! - `config`: CLI configuration parsing.
//! - `telemetry`: Tracing subscriber, metrics recorder, thread helpers.

pub mod config;
pub mod engine;
pub mod ingest;
pub mod lifecycle;
pub mod publisher;
pub mod scheduler;
pub mod telemetry;

pub use config::{ClassifyCliArgs, ClassifyConfig, FrameSource, TelemetryOptions};
pub use engine::{
    ConfigurationError, ConfigureError, EngineHandle, EngineId, EngineLease, EngineManager,
    EngineState,
};
pub use ingest::{FrameIngest, PreprocessError, ResizeFilter};
pub use lifecycle::{LifecycleBinder, LifecycleError};
pub use publisher::{
    CONFIDENCE_THRESHOLD, PresentationEvent, PresentationReceiver, PublishOutcome,
    PublishedResult, ResultPublisher,
};
pub use scheduler::{
    ClassificationScheduler, SchedulerStats, StatsSnapshot, SubmitOutcome, Submitter,
    ThreadLifecycleError,
};
