//! Inference engine boundary: the traits a backend implements and the errors
//! it reports.

use std::{io, path::PathBuf};

use anyhow::Error;
use thiserror::Error;

use crate::{
    config::{DeviceConfig, ExecutionDevice},
    input::PreprocessedImage,
    recognition::ClassificationResult,
};

/// Engine construction failed; the caller keeps whatever engine it had.
#[derive(Debug, Error)]
pub enum EngineInitError {
    #[error("model asset {path:?} is missing or unreadable")]
    MissingAsset {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("labels asset {path:?} is empty")]
    EmptyLabels { path: PathBuf },
    #[error("{device} backend could not be initialised: {reason}")]
    Backend {
        device: ExecutionDevice,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] Error),
}

/// A single inference call failed. The frame is dropped; the engine stays usable.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("input is {width}x{height} but the engine expects {expected}x{expected}")]
    InputSize {
        width: u32,
        height: u32,
        expected: u32,
    },
    #[error("unexpected model output shape {0:?}")]
    OutputShape(Vec<i64>),
    #[error(transparent)]
    Other(#[from] Error),
}

/// A loaded classifier bound to one [`DeviceConfig`].
///
/// `recognize_image` may block for a long time and is only ever called from
/// one thread at a time. `close` releases backend resources and is called
/// exactly once, after the last `recognize_image` call has returned.
pub trait InferenceEngine: Send {
    fn recognize_image(
        &mut self,
        image: &PreprocessedImage,
    ) -> Result<ClassificationResult, InferenceError>;

    fn close(&mut self) {}
}

/// Builds engines and reports what the current platform can run.
pub trait EngineFactory: Send + Sync {
    /// Whether GPU execution can be requested at all on this machine.
    fn gpu_available(&self) -> bool;

    fn create(&self, config: &DeviceConfig) -> Result<Box<dyn InferenceEngine>, EngineInitError>;
}
