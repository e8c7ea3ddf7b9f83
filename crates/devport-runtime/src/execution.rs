use std::sync::{Arc, Mutex, MutexGuard};

use devport_core::{
    CompiledModel, DevportError, DevportResult, ModelSpec, OutputData, OutputTensor,
    TensorDescriptor,
};
use tracing::{debug, trace, warn};

use crate::binding::{Bindings, DimRange, TensorBinder};
use crate::shm::BufferBinder;

/// Progress of one `run` call. Any failure jumps straight to `Reset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Start,
    InputsBound,
    OutputsBound,
    Predicted,
    Materialized,
    Reset,
}

/// Binding state for one call.
///
/// Contexts are independent of each other, so several can be in flight
/// against the same coordinator. Dropping a context releases its mappings.
pub struct ExecutionContext<'b> {
    binder: &'b dyn BufferBinder,
    bindings: Bindings,
    state: RunState,
}

impl<'b> ExecutionContext<'b> {
    pub fn new(binder: &'b dyn BufferBinder) -> Self {
        Self {
            binder,
            bindings: Bindings::default(),
            state: RunState::Start,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Mappings currently held by this context.
    pub fn live_mappings(&self) -> usize {
        self.bindings.live()
    }

    fn advance(&mut self, next: RunState) {
        trace!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    /// Unbinds every mapping acquired by this context.
    pub fn reset(&mut self) {
        if self.state == RunState::Reset && self.bindings.live() == 0 {
            return;
        }
        self.bindings.unbind_all();
        self.advance(RunState::Reset);
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub output_dims: Vec<Vec<i32>>,
    /// One flag per output: the caller's buffer was too small and nothing was
    /// written to it.
    pub insufficient: Vec<bool>,
}

impl RunOutput {
    pub fn any_insufficient(&self) -> bool {
        self.insufficient.iter().any(|&flag| flag)
    }
}

/// Per-input `[min, max]` bounds for every dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DimRanges {
    pub min: Vec<Vec<u32>>,
    pub max: Vec<Vec<u32>>,
}

/// Drives inference calls against one compiled model.
pub struct ExecutionCoordinator {
    model: Mutex<Box<dyn CompiledModel>>,
    declared: ModelSpec,
    dynamic: bool,
    binder: Arc<dyn BufferBinder>,
    dim_range: DimRange,
}

impl ExecutionCoordinator {
    pub fn new(
        model: Box<dyn CompiledModel>,
        binder: Arc<dyn BufferBinder>,
        dim_range: DimRange,
    ) -> Self {
        let declared = model.spec().clone();
        let dynamic = declared.is_dynamic();
        Self {
            model: Mutex::new(model),
            declared,
            dynamic,
            binder,
            dim_range,
        }
    }

    /// Specs as declared when the model was compiled, before any resize.
    pub fn declared_spec(&self) -> &ModelSpec {
        &self.declared
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn binder(&self) -> &dyn BufferBinder {
        self.binder.as_ref()
    }

    /// Runs one inference in a fresh context. Mappings are released on every
    /// path before this returns.
    pub fn run(
        &self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> DevportResult<RunOutput> {
        let mut ctx = ExecutionContext::new(self.binder.as_ref());
        let result = self.run_in(&mut ctx, inputs, outputs);
        ctx.reset();
        if let Err(err) = &result {
            warn!(error = %err, status = ?err.status(), "run failed");
        }
        result
    }

    /// Runs one inference in a caller-supplied context. The context is left
    /// holding its mappings; call [`ExecutionContext::reset`] afterwards.
    pub fn run_in(
        &self,
        ctx: &mut ExecutionContext<'_>,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> DevportResult<RunOutput> {
        if outputs.len() != self.declared.outputs.len() {
            return Err(DevportError::InvalidParameter(format!(
                "expected {} outputs, got {}",
                self.declared.outputs.len(),
                outputs.len()
            )));
        }

        // Output mappings from an earlier call on this context must never be
        // handed to the engine as slots for this one.
        ctx.bindings.unbind_outputs();

        let mut model = self.lock_model()?;
        let tensors = TensorBinder::new(ctx.binder, self.dim_range);

        tensors.set_inputs(
            &mut ctx.bindings,
            &mut **model,
            &self.declared.inputs,
            self.dynamic,
            inputs,
        )?;
        ctx.advance(RunState::InputsBound);

        // Static shapes are known up front, so the engine can write results
        // straight into the caller's buffers.
        if !self.dynamic {
            tensors.set_outputs(&mut ctx.bindings, outputs)?;
            ctx.advance(RunState::OutputsBound);
        }

        let produced = {
            let (views, mut slots) = ctx.bindings.engine_io(outputs.len())?;
            model
                .predict(&views, &mut slots)
                .map_err(|e| DevportError::engine("predict failed", e))?
        };
        drop(model);
        ctx.advance(RunState::Predicted);

        if produced.len() != outputs.len() {
            return Err(DevportError::Failed(format!(
                "engine produced {} outputs, expected {}",
                produced.len(),
                outputs.len()
            )));
        }

        let result = self.materialize(ctx, &produced, outputs)?;
        ctx.advance(RunState::Materialized);
        debug!(
            dims = ?result.output_dims,
            insufficient = ?result.insufficient,
            dynamic = self.dynamic,
            "run complete"
        );
        Ok(result)
    }

    fn materialize(
        &self,
        ctx: &mut ExecutionContext<'_>,
        produced: &[OutputTensor],
        outputs: &[TensorDescriptor],
    ) -> DevportResult<RunOutput> {
        let mut result = RunOutput {
            output_dims: Vec::with_capacity(produced.len()),
            insufficient: vec![false; produced.len()],
        };

        for (index, (out, tensor)) in produced.iter().zip(outputs).enumerate() {
            result.output_dims.push(out.shape.to_wire());

            let produced_len = match &out.data {
                OutputData::InPlace => out.byte_len(),
                OutputData::Owned(bytes) => bytes.len(),
            };
            if produced_len > tensor.data.length as usize {
                warn!(
                    index,
                    produced = produced_len,
                    length = tensor.data.length,
                    "output buffer insufficient"
                );
                result.insufficient[index] = true;
                continue;
            }

            if let OutputData::Owned(bytes) = &out.data {
                let buffer = ctx.bindings.output_buffer(index, tensor, ctx.binder)?;
                buffer[..bytes.len()].copy_from_slice(bytes);
            }
        }

        Ok(result)
    }

    /// `[d, d]` for fixed dims and the dynamic range for dynamic ones, always
    /// from the declared specs.
    pub fn input_dim_ranges(&self) -> DimRanges {
        let mut ranges = DimRanges::default();
        for spec in &self.declared.inputs {
            let (min, max): (Vec<u32>, Vec<u32>) = spec
                .dims
                .iter()
                .map(|dim| match dim {
                    Some(d) => {
                        let d = u32::try_from(*d).unwrap_or(u32::MAX);
                        (d, d)
                    }
                    None => (self.dim_range.min, self.dim_range.max),
                })
                .unzip();
            ranges.min.push(min);
            ranges.max.push(max);
        }
        ranges
    }

    /// Runs `f` with exclusive access to the compiled model.
    pub fn with_model<R>(&self, f: impl FnOnce(&mut dyn CompiledModel) -> R) -> DevportResult<R> {
        let mut model = self.lock_model()?;
        Ok(f(&mut **model))
    }

    fn lock_model(&self) -> DevportResult<MutexGuard<'_, Box<dyn CompiledModel>>> {
        self.model
            .lock()
            .map_err(|_| DevportError::Failed("compiled model lock poisoned".to_string()))
    }
}
