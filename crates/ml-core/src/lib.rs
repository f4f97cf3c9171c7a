//! Inference-engine side of the live classifier: model input, results, the
//! engine/factory traits every backend implements, and (with the `with-tch`
//! feature) a TorchScript backend.

mod config;
mod engine;
mod input;
mod labels;
mod recognition;

#[cfg(feature = "with-tch")]
mod classifier;

#[cfg(feature = "with-tch")]
pub use classifier::{TorchClassifier, TorchEngineFactory};
pub use config::{DeviceConfig, ExecutionDevice, ModelVariant};
pub use engine::{EngineFactory, EngineInitError, InferenceEngine, InferenceError};
pub use input::{INPUT_SIZE, PreprocessedImage};
pub use labels::load_labels;
pub use recognition::{ClassificationResult, Recognition};

#[cfg(feature = "with-tch")]
pub use tch;
