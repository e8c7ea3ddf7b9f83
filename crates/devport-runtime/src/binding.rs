//! Tensor binding: checks caller tensor descriptors against a compiled
//! model's specs and wires their shared buffers to model slots.

use devport_core::{
    CompiledModel, DType, DevportError, DevportResult, Shape, TensorDescriptor, TensorSpec,
    TensorView, DYNAMIC_DIM,
};
use tracing::debug;

use crate::shm::{Access, BufferBinder, MappedBuffer};

/// Closed interval accepted for a declared dynamic dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimRange {
    pub min: u32,
    pub max: u32,
}

impl DimRange {
    pub const DEFAULT: DimRange = DimRange { min: 1, max: 10 };

    pub fn contains(&self, value: i32) -> bool {
        u32::try_from(value).map_or(false, |v| v >= self.min && v <= self.max)
    }
}

impl Default for DimRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug)]
struct BoundInput {
    dtype: DType,
    shape: Shape,
    byte_len: usize,
    buffer: MappedBuffer,
}

/// Mappings held for the caller's tensors during one call.
///
/// At most one mapping exists per slot; rebinding a slot unbinds the old one
/// first.
#[derive(Debug, Default)]
pub struct Bindings {
    inputs: Vec<BoundInput>,
    outputs: Vec<Option<MappedBuffer>>,
    output_specs: Vec<TensorSpec>,
}

impl Bindings {
    /// Number of mappings currently held.
    pub fn live(&self) -> usize {
        self.inputs.len() + self.outputs.iter().flatten().count()
    }

    /// Output specs as last read from the model.
    pub fn output_specs(&self) -> &[TensorSpec] {
        &self.output_specs
    }

    pub fn unbind_inputs(&mut self) {
        for input in self.inputs.drain(..) {
            input.buffer.unbind();
        }
    }

    pub fn unbind_outputs(&mut self) {
        for output in self.outputs.drain(..).flatten() {
            output.unbind();
        }
    }

    pub fn unbind_all(&mut self) {
        self.unbind_inputs();
        self.unbind_outputs();
    }

    /// Input views and output slots for one `predict` call.
    pub fn engine_io(
        &mut self,
        output_count: usize,
    ) -> DevportResult<(Vec<TensorView<'_>>, Vec<Option<&mut [u8]>>)> {
        let views: Vec<TensorView<'_>> = self
            .inputs
            .iter()
            .map(|input| TensorView {
                dtype: input.dtype,
                shape: &input.shape,
                data: &input.buffer.as_slice()[..input.byte_len],
            })
            .collect();

        if self.outputs.len() < output_count {
            self.outputs.resize_with(output_count, || None);
        }
        let slots = self
            .outputs
            .iter_mut()
            .map(|slot| match slot {
                Some(buffer) => buffer.as_mut_slice().map(Some),
                None => Ok(None),
            })
            .collect::<DevportResult<Vec<_>>>()?;

        Ok((views, slots))
    }

    /// The caller's buffer for output `index`, binding it read-write first if
    /// no mapping exists yet.
    pub fn output_buffer(
        &mut self,
        index: usize,
        tensor: &TensorDescriptor,
        binder: &dyn BufferBinder,
    ) -> DevportResult<&mut [u8]> {
        if self.outputs.len() <= index {
            self.outputs.resize_with(index + 1, || None);
        }
        let slot = &mut self.outputs[index];
        if slot.is_none() {
            *slot = Some(binder.bind(&tensor.data, Access::ReadWrite)?);
        }
        match slot {
            Some(buffer) => buffer.as_mut_slice(),
            None => Err(DevportError::Failed(format!(
                "output {index} has no bound buffer"
            ))),
        }
    }
}

pub struct TensorBinder<'a> {
    binder: &'a dyn BufferBinder,
    dim_range: DimRange,
}

impl<'a> TensorBinder<'a> {
    pub fn new(binder: &'a dyn BufferBinder, dim_range: DimRange) -> Self {
        Self { binder, dim_range }
    }

    /// Validates `tensors` against the declared input specs and binds them.
    ///
    /// Nothing is mapped unless every tensor validates. For a dynamic model
    /// the compiled model is resized to the concrete shapes and its specs are
    /// re-read.
    pub fn set_inputs(
        &self,
        bindings: &mut Bindings,
        model: &mut dyn CompiledModel,
        declared: &[TensorSpec],
        dynamic: bool,
        tensors: &[TensorDescriptor],
    ) -> DevportResult<()> {
        if tensors.len() != declared.len() {
            return Err(DevportError::InvalidParameter(format!(
                "expected {} inputs, got {}",
                declared.len(),
                tensors.len()
            )));
        }

        let shapes = tensors
            .iter()
            .zip(declared)
            .enumerate()
            .map(|(index, (tensor, spec))| {
                self.validate(Direction::Input, index, spec, tensor, true)
            })
            .collect::<DevportResult<Vec<_>>>()?;

        bindings.unbind_inputs();
        for (tensor, shape) in tensors.iter().zip(&shapes) {
            let buffer = self.binder.bind(&tensor.data, Access::ReadOnly)?;
            bindings.inputs.push(BoundInput {
                dtype: tensor.dtype,
                byte_len: shape.byte_len(tensor.dtype),
                shape: shape.clone(),
                buffer,
            });
        }

        if dynamic {
            model
                .resize(&shapes)
                .map_err(|e| DevportError::engine("failed to resize model inputs", e))?;
            debug!(?shapes, "resized dynamic model");
        }
        bindings.output_specs = model.outputs().to_vec();
        Ok(())
    }

    /// Validates `tensors` against the model's output specs and binds the
    /// ones large enough to receive their output in place.
    ///
    /// Only meaningful for static models; smaller buffers stay unbound and are
    /// reported insufficient after `predict`.
    pub fn set_outputs(
        &self,
        bindings: &mut Bindings,
        tensors: &[TensorDescriptor],
    ) -> DevportResult<()> {
        let specs = bindings.output_specs.clone();
        if tensors.len() != specs.len() {
            return Err(DevportError::InvalidParameter(format!(
                "expected {} outputs, got {}",
                specs.len(),
                tensors.len()
            )));
        }

        let required = tensors
            .iter()
            .zip(&specs)
            .enumerate()
            .map(|(index, (tensor, spec))| {
                self.validate(Direction::Output, index, spec, tensor, false)
                    .map(|shape| shape.byte_len(spec.dtype))
            })
            .collect::<DevportResult<Vec<_>>>()?;

        bindings.unbind_outputs();
        for (index, (tensor, needed)) in tensors.iter().zip(required).enumerate() {
            let slot = if tensor.data.length as usize >= needed {
                Some(self.binder.bind(&tensor.data, Access::ReadWrite)?)
            } else {
                debug!(
                    index,
                    needed,
                    length = tensor.data.length,
                    "output buffer too small for in-place binding"
                );
                None
            };
            bindings.outputs.push(slot);
        }
        Ok(())
    }

    fn validate(
        &self,
        direction: Direction,
        index: usize,
        spec: &TensorSpec,
        tensor: &TensorDescriptor,
        check_length: bool,
    ) -> DevportResult<Shape> {
        if tensor.dtype != spec.dtype {
            return Err(DevportError::InvalidParameter(format!(
                "{direction} {index}: element type {:?} does not match {:?}",
                tensor.dtype, spec.dtype
            )));
        }
        if tensor.layout != spec.layout {
            return Err(DevportError::InvalidParameter(format!(
                "{direction} {index}: layout {:?} does not match {:?}",
                tensor.layout, spec.layout
            )));
        }
        if tensor.dims.len() != spec.rank() {
            return Err(DevportError::InvalidShape(format!(
                "{direction} {index}: rank {} does not match {}",
                tensor.dims.len(),
                spec.rank()
            )));
        }

        let mut dims = Vec::with_capacity(tensor.dims.len());
        for (position, (&value, want)) in tensor.dims.iter().zip(&spec.dims).enumerate() {
            match want {
                None if value == DYNAMIC_DIM => {
                    return Err(DevportError::InvalidShape(format!(
                        "{direction} {index}: dimension {position} must be concrete"
                    )));
                }
                None if self.dim_range.contains(value) => {}
                None if direction == Direction::Input => {
                    return Err(DevportError::OutOfDimensionRange {
                        index,
                        position,
                        value,
                        min: self.dim_range.min,
                        max: self.dim_range.max,
                    });
                }
                None => {
                    return Err(DevportError::InvalidShape(format!(
                        "{direction} {index}: dimension {position} = {value} is not resolvable"
                    )));
                }
                Some(fixed) if value != DYNAMIC_DIM && value as usize == *fixed => {}
                Some(fixed) => {
                    return Err(DevportError::InvalidShape(format!(
                        "{direction} {index}: dimension {position} = {value}, expected {fixed}"
                    )));
                }
            }
            dims.push(value as usize);
        }
        let shape = Shape::from_slice(&dims);

        if check_length {
            let needed = shape.byte_len(tensor.dtype);
            if (tensor.data.length as usize) < needed {
                return Err(DevportError::InvalidParameter(format!(
                    "{direction} {index}: buffer holds {} bytes, tensor needs {needed}",
                    tensor.data.length
                )));
            }
        }
        Ok(shape)
    }
}
