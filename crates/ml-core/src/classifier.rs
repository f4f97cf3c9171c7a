//! TorchScript-backed image classifier.

use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use tch::{self, Cuda, Device, Kind, Tensor};
use tracing::{debug, info};

use crate::{
    config::{DeviceConfig, ExecutionDevice, ModelVariant},
    engine::{EngineFactory, EngineInitError, InferenceEngine, InferenceError},
    input::{INPUT_SIZE, PreprocessedImage},
    labels::load_labels,
    recognition::ClassificationResult,
};

/// Number of recognitions kept per classification.
const MAX_RESULTS: usize = 3;
/// Scores at or below this are not reported at all.
const MIN_CONFIDENCE: f32 = 0.1;
/// Float models expect pixels mapped into [-1, 1].
const IMAGE_MEAN: f32 = 127.5;
const IMAGE_STD: f32 = 127.5;

/// TorchScript classifier wrapper.
pub struct TorchClassifier {
    module: tch::CModule,
    device: Device,
    variant: ModelVariant,
    labels: Arc<Vec<String>>,
}

impl TorchClassifier {
    /// Load a TorchScript module on the device selected by `config`.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        labels: Arc<Vec<String>>,
        config: &DeviceConfig,
    ) -> Result<Self, EngineInitError> {
        let model_path = model_path.as_ref();
        std::fs::metadata(model_path).map_err(|source| EngineInitError::MissingAsset {
            path: model_path.to_path_buf(),
            source,
        })?;

        let device = match config.device {
            ExecutionDevice::Cpu => Device::Cpu,
            ExecutionDevice::Gpu => Device::Cuda(0),
        };
        let threads = i32::try_from(config.num_threads).unwrap_or(i32::MAX);
        tch::set_num_threads(threads);

        let mut module =
            tch::CModule::load_on_device(model_path, device).map_err(|err| EngineInitError::Backend {
                device: config.device,
                reason: err.to_string(),
            })?;
        module.set_eval();

        info!(
            "Loaded {} on {:?} ({} labels)",
            model_path.display(),
            device,
            labels.len()
        );

        Ok(Self {
            module,
            device,
            variant: config.model,
            labels,
        })
    }

    /// Converts the preprocessed RGB image into a normalized NCHW tensor.
    fn image_to_tensor(&self, image: &PreprocessedImage) -> Result<Tensor, InferenceError> {
        if image.width() != INPUT_SIZE || image.height() != INPUT_SIZE {
            return Err(InferenceError::InputSize {
                width: image.width(),
                height: image.height(),
                expected: INPUT_SIZE,
            });
        }

        let side = i64::from(INPUT_SIZE);
        let tensor = match self.variant {
            ModelVariant::Float => {
                let chw = image.normalized_chw(IMAGE_MEAN, IMAGE_STD);
                Tensor::from_slice(&chw).view([1, 3, side, side])
            }
            ModelVariant::Quantized => Tensor::from_slice(image.pixels().as_raw())
                .view([1, side, side, 3])
                .permute([0, 3, 1, 2])
                .contiguous(),
        };
        Ok(tensor.to_device(self.device))
    }
}

impl InferenceEngine for TorchClassifier {
    fn recognize_image(
        &mut self,
        image: &PreprocessedImage,
    ) -> Result<ClassificationResult, InferenceError> {
        let input = self.image_to_tensor(image)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| InferenceError::Other(err.into()))?;

        let shape = output.size();
        if shape.len() != 2 || shape[0] != 1 {
            return Err(InferenceError::OutputShape(shape));
        }

        let probabilities = match self.variant {
            ModelVariant::Float => output.softmax(-1, Kind::Float),
            ModelVariant::Quantized => output.to_kind(Kind::Float) / 255.0,
        };
        let flat = probabilities.to_device(Device::Cpu).view([-1]);
        let scores = Vec::<f32>::try_from(&flat).map_err(|err| InferenceError::Other(err.into()))?;

        Ok(ClassificationResult::from_scores(
            &self.labels,
            &scores,
            MAX_RESULTS,
            MIN_CONFIDENCE,
        ))
    }

    fn close(&mut self) {
        debug!("Releasing {} classifier on {:?}", self.variant, self.device);
    }
}

/// Creates [`TorchClassifier`]s from a model directory and a shared label file.
pub struct TorchEngineFactory {
    model_dir: PathBuf,
    labels_path: PathBuf,
}

impl TorchEngineFactory {
    pub fn new(model_dir: impl Into<PathBuf>, labels_path: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            labels_path: labels_path.into(),
        }
    }
}

impl EngineFactory for TorchEngineFactory {
    fn gpu_available(&self) -> bool {
        Cuda::is_available()
    }

    fn create(&self, config: &DeviceConfig) -> Result<Box<dyn InferenceEngine>, EngineInitError> {
        let labels = Arc::new(load_labels(&self.labels_path)?);
        let model_path = self.model_dir.join(config.model.asset_name());
        let classifier = TorchClassifier::load(model_path, labels, config)?;
        Ok(Box::new(classifier))
    }
}
