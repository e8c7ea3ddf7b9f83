use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use devport_core::{
    Backend, BufferDescriptor, DevportError, DevportResult, ModelConfig, ModelFormat,
    PerformanceMode, Priority,
};
use tracing::{debug, info};

use crate::cache::CacheExporter;
use crate::config::ServiceConfig;
use crate::execution::ExecutionCoordinator;
use crate::prepared::PreparedModel;
use crate::shm::{Access, BufferBinder, SharedMemoryBinder, SharedRegion};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceType {
    #[default]
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Available,
    Busy,
    Offline,
    Unknown,
}

/// Device metadata, model preparation and standalone buffer allocation.
pub struct DeviceService<B: Backend> {
    backend: B,
    config: ServiceConfig,
    binder: Arc<dyn BufferBinder>,
    allocations: Mutex<HashMap<RawFd, SharedRegion>>,
}

impl<B: Backend> DeviceService<B> {
    pub fn new(backend: B, config: ServiceConfig) -> Self {
        Self::with_binder(backend, config, Arc::new(SharedMemoryBinder::new()))
    }

    pub fn with_binder(backend: B, config: ServiceConfig, binder: Arc<dyn BufferBinder>) -> Self {
        info!(
            device = %config.device_name,
            backend = backend.name(),
            version = ?config.interface_version,
            "device service ready"
        );
        Self {
            backend,
            config,
            binder,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    pub fn vendor_name(&self) -> &str {
        &self.config.vendor_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.config.device_type
    }

    pub fn device_status(&self) -> DeviceStatus {
        DeviceStatus::Available
    }

    /// `(major, minor)` of the driver interface this service speaks.
    pub fn version(&self) -> (u32, u32) {
        self.config.interface_version.numbers()
    }

    pub fn is_float16_precision_supported(&self) -> bool {
        self.backend.capabilities().supports_float16
    }

    pub fn is_performance_mode_supported(&self) -> bool {
        self.backend.capabilities().supports_performance_mode
    }

    pub fn is_priority_supported(&self) -> bool {
        self.backend.capabilities().supports_priority
    }

    pub fn is_dynamic_input_supported(&self) -> bool {
        self.backend.capabilities().supports_dynamic_shapes
    }

    pub fn is_model_cache_supported(&self) -> bool {
        self.backend.capabilities().supports_model_cache
    }

    pub fn supported_operations(
        &self,
        model: &[u8],
        format: ModelFormat,
    ) -> DevportResult<Vec<bool>> {
        if model.is_empty() {
            return Err(DevportError::InvalidParameter("model is empty".to_string()));
        }
        self.backend
            .supported_operations(model, format)
            .map_err(|e| DevportError::engine("failed to inspect model operations", e))
    }

    /// Creates a shared buffer of `length` bytes and tracks it until
    /// [`DeviceService::release_buffer`].
    pub fn allocate_buffer(&self, length: u32) -> DevportResult<BufferDescriptor> {
        let region = SharedRegion::create(length, &self.config.shm_dir())?;
        let desc = region.descriptor();
        let key = desc
            .handle
            .raw()
            .ok_or_else(|| DevportError::Failed("allocated buffer has no handle".to_string()))?;

        self.lock_allocations()?.insert(key, region);
        info!(handle = key, length, "allocated shared buffer");
        Ok(desc)
    }

    pub fn release_buffer(&self, desc: &BufferDescriptor) -> DevportResult<()> {
        let key = desc.handle.raw().ok_or_else(|| {
            DevportError::InvalidParameter("cannot release a NONE handle".to_string())
        })?;
        match self.lock_allocations()?.remove(&key) {
            Some(region) => {
                debug!(handle = key, len = region.len(), "released shared buffer");
                Ok(())
            }
            None => Err(DevportError::InvalidParameter(format!(
                "handle {key} was not allocated by this device"
            ))),
        }
    }

    /// Buffers allocated and not yet released.
    pub fn allocated_buffers(&self) -> usize {
        self.allocations.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn prepare_model(
        &self,
        model: &[u8],
        format: ModelFormat,
        config: &ModelConfig,
    ) -> DevportResult<PreparedModel> {
        if model.is_empty() {
            return Err(DevportError::InvalidParameter("model is empty".to_string()));
        }
        self.validate_config(config)?;
        let compiled = self
            .backend
            .build(model, format, config)
            .map_err(|e| DevportError::engine("failed to build model", e))?;
        info!(backend = self.backend.name(), ?format, "prepared model");
        Ok(self.wrap(Box::new(compiled)))
    }

    pub fn prepare_model_from_cache(
        &self,
        cache: &[BufferDescriptor],
        config: &ModelConfig,
    ) -> DevportResult<PreparedModel> {
        let [desc] = cache else {
            return Err(DevportError::InvalidParameter(format!(
                "expected exactly one model cache buffer, got {}",
                cache.len()
            )));
        };
        if !self.is_model_cache_supported() {
            return Err(DevportError::Unsupported(format!(
                "backend {} has no model cache",
                self.backend.name()
            )));
        }
        self.validate_config(config)?;

        let bytes = {
            let mapping = self.binder.bind(desc, Access::ReadOnly)?;
            let bytes = mapping.as_slice().to_vec();
            mapping.unbind();
            bytes
        };
        let format = self.backend.cache_format();
        let compiled = self
            .backend
            .build(&bytes, format, config)
            .map_err(|e| DevportError::engine("failed to restore model from cache", e))?;
        info!(backend = self.backend.name(), len = bytes.len(), "prepared model from cache");
        Ok(self.wrap(Box::new(compiled)))
    }

    fn wrap(&self, compiled: Box<dyn devport_core::CompiledModel>) -> PreparedModel {
        let coordinator = ExecutionCoordinator::new(
            compiled,
            Arc::clone(&self.binder),
            self.config.dynamic_dim_range,
        );
        PreparedModel::new(coordinator, CacheExporter::new(self.config.shm_dir()))
    }

    fn validate_config(&self, config: &ModelConfig) -> DevportResult<()> {
        let caps = self.backend.capabilities();
        if config.enable_float16 && !caps.supports_float16 {
            return Err(DevportError::InvalidParameter(
                "float16 precision is not supported".to_string(),
            ));
        }
        if config.performance_mode != PerformanceMode::None && !caps.supports_performance_mode {
            return Err(DevportError::InvalidParameter(
                "performance mode is not supported".to_string(),
            ));
        }
        if config.priority != Priority::None && !caps.supports_priority {
            return Err(DevportError::InvalidParameter(
                "priority is not supported".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_allocations(&self) -> DevportResult<MutexGuard<'_, HashMap<RawFd, SharedRegion>>> {
        self.allocations
            .lock()
            .map_err(|_| DevportError::Failed("allocation table lock poisoned".to_string()))
    }
}
