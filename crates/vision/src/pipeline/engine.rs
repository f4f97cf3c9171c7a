//! Inference engine lifecycle: validation, construction, hot swap and disposal.
//!
//! The active engine lives in a single `RwLock` slot. A classification takes an
//! [`EngineLease`], which holds the shared side of a separate inference lock for
//! the whole call. `configure` and `close` take the exclusive side, so they wait
//! for the in-flight classification to return, then build, swap and dispose
//! while the worker is held off. At most one engine is ever live.

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::anyhow;
use ml_core::{
    ClassificationResult, DeviceConfig, EngineFactory, EngineInitError, ExecutionDevice,
    InferenceEngine, InferenceError, ModelVariant, PreprocessedImage,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Identity of one constructed engine. Never reused within a manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl EngineId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requested configuration cannot run on this platform.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Thread count must be at least 1.")]
    InvalidThreadCount,
    #[error("GPU acceleration unavailable.")]
    GpuUnavailable,
    #[error("GPU does not yet support quantized models.")]
    QuantizedOnGpu,
}

/// Why `configure` left the previous engine in place.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to create classifier: {0}")]
    Init(#[from] EngineInitError),
}

/// Lifecycle state exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    Ready(EngineId),
}

/// A constructed engine bound to the configuration it was built from.
///
/// The engine is closed exactly once, when the handle is dropped.
pub struct EngineHandle {
    id: EngineId,
    config: DeviceConfig,
    engine: Mutex<Box<dyn InferenceEngine>>,
}

impl EngineHandle {
    fn new(id: EngineId, config: DeviceConfig, engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            id,
            config,
            engine: Mutex::new(engine),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    /// Run one blocking classification on this engine.
    pub fn recognize_image(
        &self,
        image: &PreprocessedImage,
    ) -> Result<ClassificationResult, InferenceError> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| InferenceError::Other(anyhow!("engine {} is poisoned", self.id)))?;
        engine.recognize_image(image)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let engine = self.engine.get_mut().unwrap_or_else(PoisonError::into_inner);
        engine.close();
        debug!("Disposed engine {} ({})", self.id, self.config);
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The active engine, borrowed for one classification.
///
/// While any lease is alive the engine cannot be replaced or closed.
pub struct EngineLease<'a> {
    handle: Arc<EngineHandle>,
    _running: RwLockReadGuard<'a, ()>,
}

impl Deref for EngineLease<'_> {
    type Target = EngineHandle;

    fn deref(&self) -> &EngineHandle {
        &self.handle
    }
}

/// Owns the active [`EngineHandle`] and every transition between handles.
pub struct EngineManager {
    factory: Arc<dyn EngineFactory>,
    active: RwLock<Option<Arc<EngineHandle>>>,
    /// Shared while classifying, exclusive while swapping or closing.
    inference: RwLock<()>,
    reconfigure: Mutex<()>,
    next_id: AtomicU64,
}

impl EngineManager {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            active: RwLock::new(None),
            inference: RwLock::new(()),
            reconfigure: Mutex::new(()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Check `config` against what the platform supports, without building anything.
    pub fn validate(&self, config: &DeviceConfig) -> Result<(), ConfigurationError> {
        if config.num_threads == 0 {
            return Err(ConfigurationError::InvalidThreadCount);
        }
        if config.device == ExecutionDevice::Gpu {
            if !self.factory.gpu_available() {
                return Err(ConfigurationError::GpuUnavailable);
            }
            if config.model == ModelVariant::Quantized {
                return Err(ConfigurationError::QuantizedOnGpu);
            }
        }
        Ok(())
    }

    /// Build an engine for `config` and make it the active one.
    ///
    /// All-or-nothing: on any error the previously active handle stays active
    /// and usable. Concurrent calls are serialized. Blocks until an in-flight
    /// classification returns; the previous engine is disposed before this
    /// returns.
    pub fn configure(&self, config: DeviceConfig) -> Result<EngineId, ConfigureError> {
        let _serial = self
            .reconfigure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Err(err) = self.validate(&config) {
            warn!("Not creating classifier ({config}): {err}");
            metrics::counter!("classify_engine_rejected_total", "reason" => "configuration")
                .increment(1);
            return Err(err.into());
        }

        let _exclusive = self.hold_inference();
        info!("Creating classifier ({config})");
        let engine = match self.factory.create(&config) {
            Ok(engine) => engine,
            Err(err) => {
                error!("Failed to create classifier ({config}): {err}");
                metrics::counter!("classify_engine_rejected_total", "reason" => "init")
                    .increment(1);
                return Err(err.into());
            }
        };

        let id = EngineId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = Arc::new(EngineHandle::new(id, config, engine));
        let retired = self.write_slot().replace(handle);
        metrics::counter!("classify_engine_swaps_total").increment(1);
        if let Some(previous) = retired {
            debug!("Engine {} retired", previous.id());
        }
        info!("Classifier {id} active ({config})");
        Ok(id)
    }

    /// Borrow the active engine for one classification. `None` when unconfigured.
    pub fn lease(&self) -> Option<EngineLease<'_>> {
        let running = self.inference.read().unwrap_or_else(PoisonError::into_inner);
        let handle = self.read_slot().clone()?;
        Some(EngineLease {
            handle,
            _running: running,
        })
    }

    pub fn state(&self) -> EngineState {
        match self.read_slot().as_ref() {
            Some(handle) => EngineState::Ready(handle.id()),
            None => EngineState::Unconfigured,
        }
    }

    pub fn active_config(&self) -> Option<DeviceConfig> {
        self.read_slot().as_ref().map(|handle| handle.config())
    }

    pub fn gpu_available(&self) -> bool {
        self.factory.gpu_available()
    }

    /// Dispose the active handle once no classification is using it.
    /// Returns whether there was one.
    pub fn close(&self) -> bool {
        let _serial = self
            .reconfigure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _exclusive = self.hold_inference();
        match self.write_slot().take() {
            Some(handle) => {
                info!("Closing classifier {}", handle.id());
                true
            }
            None => false,
        }
    }

    fn hold_inference(&self) -> RwLockWriteGuard<'_, ()> {
        self.inference.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<Arc<EngineHandle>>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<Arc<EngineHandle>>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io, path::PathBuf, thread, time::Duration};

    use ml_core::Recognition;

    use super::*;

    #[derive(Default)]
    struct Ledger {
        created: Vec<u64>,
        closed: HashMap<u64, usize>,
    }

    struct CountingEngine {
        serial: u64,
        ledger: Arc<Mutex<Ledger>>,
    }

    impl InferenceEngine for CountingEngine {
        fn recognize_image(
            &mut self,
            _image: &PreprocessedImage,
        ) -> Result<ClassificationResult, InferenceError> {
            Ok(ClassificationResult::new(vec![Recognition::new(
                self.serial.to_string(),
                "engine",
                0.9,
            )]))
        }

        fn close(&mut self) {
            *self
                .ledger
                .lock()
                .unwrap()
                .closed
                .entry(self.serial)
                .or_default() += 1;
        }
    }

    struct CountingFactory {
        gpu: bool,
        fail_next: Mutex<bool>,
        ledger: Arc<Mutex<Ledger>>,
    }

    impl CountingFactory {
        fn new(gpu: bool) -> Arc<Self> {
            Arc::new(Self {
                gpu,
                fail_next: Mutex::new(false),
                ledger: Arc::default(),
            })
        }
    }

    impl EngineFactory for CountingFactory {
        fn gpu_available(&self) -> bool {
            self.gpu
        }

        fn create(
            &self,
            _config: &DeviceConfig,
        ) -> Result<Box<dyn InferenceEngine>, EngineInitError> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(EngineInitError::MissingAsset {
                    path: PathBuf::from("missing.pt"),
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            let mut ledger = self.ledger.lock().unwrap();
            let serial = ledger.created.len() as u64 + 1;
            ledger.created.push(serial);
            Ok(Box::new(CountingEngine {
                serial,
                ledger: self.ledger.clone(),
            }))
        }
    }

    fn image() -> PreprocessedImage {
        PreprocessedImage::new(image::RgbImage::new(4, 4))
    }

    #[test]
    fn unconfigured_until_first_success() {
        let factory = CountingFactory::new(false);
        let manager = EngineManager::new(factory.clone());
        assert_eq!(manager.state(), EngineState::Unconfigured);
        assert!(manager.lease().is_none());

        let id = manager.configure(DeviceConfig::default()).unwrap();
        assert_eq!(manager.state(), EngineState::Ready(id));
        assert_eq!(manager.active_config(), Some(DeviceConfig::default()));
    }

    #[test]
    fn rejected_configurations_keep_the_active_handle() {
        let factory = CountingFactory::new(false);
        let manager = EngineManager::new(factory.clone());
        let first = manager.configure(DeviceConfig::default()).unwrap();

        let gpu = DeviceConfig::new(ModelVariant::Float, ExecutionDevice::Gpu, 2);
        assert!(matches!(
            manager.configure(gpu),
            Err(ConfigureError::Configuration(ConfigurationError::GpuUnavailable))
        ));
        assert!(matches!(
            manager.configure(DeviceConfig::default().with_threads(0)),
            Err(ConfigureError::Configuration(
                ConfigurationError::InvalidThreadCount
            ))
        ));

        *factory.fail_next.lock().unwrap() = true;
        assert!(matches!(
            manager.configure(DeviceConfig::default().with_threads(4)),
            Err(ConfigureError::Init(_))
        ));

        assert_eq!(manager.state(), EngineState::Ready(first));
        let lease = manager.lease().unwrap();
        assert!(lease.recognize_image(&image()).is_ok());
        assert!(factory.ledger.lock().unwrap().closed.is_empty());
    }

    #[test]
    fn quantized_gpu_is_rejected_even_with_gpu_support() {
        let manager = EngineManager::new(CountingFactory::new(true));
        let first = manager.configure(DeviceConfig::default()).unwrap();

        let quantized_gpu = DeviceConfig::new(ModelVariant::Quantized, ExecutionDevice::Gpu, 2);
        let err = manager.configure(quantized_gpu).unwrap_err();
        assert!(matches!(
            err,
            ConfigureError::Configuration(ConfigurationError::QuantizedOnGpu)
        ));
        assert_eq!(err.to_string(), "GPU does not yet support quantized models.");
        assert_eq!(manager.state(), EngineState::Ready(first));

        let float_gpu = DeviceConfig::new(ModelVariant::Float, ExecutionDevice::Gpu, 2);
        assert!(manager.configure(float_gpu).is_ok());
    }

    #[test]
    fn every_handle_is_disposed_exactly_once() {
        let factory = CountingFactory::new(false);
        let manager = EngineManager::new(factory.clone());
        for threads in 1..=4 {
            manager
                .configure(DeviceConfig::default().with_threads(threads))
                .unwrap();
        }
        {
            let ledger = factory.ledger.lock().unwrap();
            assert_eq!(ledger.created.len(), 4);
            assert_eq!(ledger.closed.len(), 3);
            assert!(ledger.closed.values().all(|count| *count == 1));
        }

        assert!(manager.close());
        assert!(!manager.close());
        assert_eq!(manager.state(), EngineState::Unconfigured);
        let ledger = factory.ledger.lock().unwrap();
        assert_eq!(ledger.closed.len(), 4);
        assert!(ledger.closed.values().all(|count| *count == 1));
    }

    #[test]
    fn configure_waits_for_the_leased_engine() {
        let factory = CountingFactory::new(false);
        let manager = EngineManager::new(factory.clone());
        manager.configure(DeviceConfig::default()).unwrap();

        let lease = manager.lease().unwrap();
        thread::scope(|scope| {
            let swap = scope.spawn(|| manager.configure(DeviceConfig::default().with_threads(3)));
            thread::sleep(Duration::from_millis(50));
            assert!(!swap.is_finished());
            assert_eq!(factory.ledger.lock().unwrap().created, [1]);

            let result = lease.recognize_image(&image()).unwrap();
            assert_eq!(result.top().unwrap().id, "1");
            drop(lease);

            let second = swap.join().unwrap().unwrap();
            assert_eq!(manager.state(), EngineState::Ready(second));
        });

        let ledger = factory.ledger.lock().unwrap();
        assert_eq!(ledger.created, [1, 2]);
        assert_eq!(ledger.closed.get(&1), Some(&1));
        assert!(!ledger.closed.contains_key(&2));
    }
}
