use devport_core::{BufferDescriptor, DevportResult, ModelSpec, TensorDescriptor};

use crate::cache::CacheExporter;
use crate::execution::{DimRanges, ExecutionContext, ExecutionCoordinator, RunOutput};

/// A compiled model ready to serve inference calls.
///
/// Only exists once a model has been built, so every query below has a model
/// to answer from.
pub struct PreparedModel {
    coordinator: ExecutionCoordinator,
    cache: CacheExporter,
}

impl PreparedModel {
    pub fn new(coordinator: ExecutionCoordinator, cache: CacheExporter) -> Self {
        Self { coordinator, cache }
    }

    pub fn spec(&self) -> &ModelSpec {
        self.coordinator.declared_spec()
    }

    pub fn is_dynamic(&self) -> bool {
        self.coordinator.is_dynamic()
    }

    pub fn run(
        &self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> DevportResult<RunOutput> {
        self.coordinator.run(inputs, outputs)
    }

    /// A fresh per-call context for [`PreparedModel::run_in`].
    pub fn context(&self) -> ExecutionContext<'_> {
        ExecutionContext::new(self.coordinator.binder())
    }

    pub fn run_in(
        &self,
        ctx: &mut ExecutionContext<'_>,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> DevportResult<RunOutput> {
        self.coordinator.run_in(ctx, inputs, outputs)
    }

    pub fn export_model_cache(&self, out: &mut Vec<BufferDescriptor>) -> DevportResult<()> {
        self.cache.export(&self.coordinator, out)
    }

    pub fn input_dim_ranges(&self) -> DimRanges {
        self.coordinator.input_dim_ranges()
    }
}
