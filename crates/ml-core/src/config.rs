use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Weight format of the classification model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Float,
    Quantized,
}

impl ModelVariant {
    /// File name of the model asset for this variant inside the model directory.
    pub fn asset_name(self) -> &'static str {
        match self {
            ModelVariant::Float => "mobilenet_v1_1.0_224.pt",
            ModelVariant::Quantized => "mobilenet_v1_1.0_224_quant.pt",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelVariant::Float => "float",
            ModelVariant::Quantized => "quantized",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "float" => Ok(ModelVariant::Float),
            "quantized" | "quant" => Ok(ModelVariant::Quantized),
            other => Err(format!("unknown model variant {other:?} (expected float|quantized)")),
        }
    }
}

/// Hardware the engine executes on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDevice {
    Cpu,
    Gpu,
}

impl ExecutionDevice {
    pub fn label(self) -> &'static str {
        match self {
            ExecutionDevice::Cpu => "cpu",
            ExecutionDevice::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExecutionDevice {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ExecutionDevice::Cpu),
            "gpu" | "cuda" => Ok(ExecutionDevice::Gpu),
            other => Err(format!("unknown device {other:?} (expected cpu|gpu)")),
        }
    }
}

/// Immutable engine configuration. A new request replaces the active value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub model: ModelVariant,
    pub device: ExecutionDevice,
    pub num_threads: usize,
}

impl DeviceConfig {
    pub fn new(model: ModelVariant, device: ExecutionDevice, num_threads: usize) -> Self {
        Self {
            model,
            device,
            num_threads,
        }
    }

    pub fn with_model(self, model: ModelVariant) -> Self {
        Self { model, ..self }
    }

    pub fn with_device(self, device: ExecutionDevice) -> Self {
        Self { device, ..self }
    }

    pub fn with_threads(self, num_threads: usize) -> Self {
        Self {
            num_threads,
            ..self
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(ModelVariant::Float, ExecutionDevice::Cpu, 2)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model={}, device={}, threads={}",
            self.model, self.device, self.num_threads
        )
    }
}
