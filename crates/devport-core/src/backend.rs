use anyhow::Result;

use crate::{ModelConfig, ModelFormat, ModelSpec, OutputTensor, Shape, TensorSpec, TensorView};

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub supports_dynamic_shapes: bool,
    pub supports_float16: bool,
    pub supports_performance_mode: bool,
    pub supports_priority: bool,
    pub supports_model_cache: bool,
}

pub trait Backend: Send + Sync + 'static {
    type Model: CompiledModel;

    fn name(&self) -> &'static str;
    fn build(&self, bytes: &[u8], format: ModelFormat, config: &ModelConfig)
        -> Result<Self::Model>;
    /// Format of the bytes produced by [`CompiledModel::serialize`].
    fn cache_format(&self) -> ModelFormat;
    fn capabilities(&self) -> BackendCapabilities;
    /// One flag per operation in the model, in graph order.
    fn supported_operations(&self, bytes: &[u8], format: ModelFormat) -> Result<Vec<bool>>;
}

pub trait CompiledModel: Send + 'static {
    fn spec(&self) -> &ModelSpec;

    fn inputs(&self) -> &[TensorSpec] {
        &self.spec().inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.spec().outputs
    }

    /// Fixes every input to a concrete shape. Output specs may change.
    fn resize(&mut self, shapes: &[Shape]) -> Result<()>;

    /// Runs one inference.
    ///
    /// `outputs` has one slot per model output. A `Some` slot is caller memory
    /// the engine should write that output into, reporting
    /// [`crate::OutputData::InPlace`]; otherwise the engine returns owned bytes.
    /// Slots are only borrowed for the duration of the call.
    fn predict(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [Option<&mut [u8]>],
    ) -> Result<Vec<OutputTensor>>;

    fn serialize(&self) -> Result<Vec<u8>>;
}
