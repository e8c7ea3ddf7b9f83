use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use devport_core::{
    Backend, BackendCapabilities, CompiledModel, DType, IOName, Layout, ModelConfig, ModelFormat,
    ModelSpec, OutputTensor, PerformanceMode, Shape, TensorSpec, TensorView,
};
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

pub struct OrtModel {
    spec: ModelSpec,
    session: Session,
    input_names: Vec<String>,
    /// Original ONNX bytes; ORT has no compiled-session export.
    source: Vec<u8>,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn build(&self, bytes: &[u8], format: ModelFormat, config: &ModelConfig) -> Result<OrtModel> {
        ensure!(
            format == ModelFormat::Onnx,
            "onnxruntime backend expects ONNX bytes, got {format:?}"
        );

        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(optimization_level(config.performance_mode))
            .context("failed to configure ORT session builder")?;

        let session = builder
            .commit_from_memory(bytes)
            .context("failed to load ONNX model")?;

        let input_names = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        let spec = build_model_spec(&session)?;
        debug!(
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            "built ORT session"
        );

        Ok(OrtModel {
            spec,
            session,
            input_names,
            source: bytes.to_vec(),
        })
    }

    fn cache_format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_dynamic_shapes: true,
            supports_float16: false,
            supports_performance_mode: true,
            supports_priority: false,
            supports_model_cache: true,
        }
    }

    fn supported_operations(&self, _bytes: &[u8], _format: ModelFormat) -> Result<Vec<bool>> {
        bail!("onnxruntime does not expose per-node operator support")
    }
}

impl CompiledModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn resize(&mut self, shapes: &[Shape]) -> Result<()> {
        ensure!(
            shapes.len() == self.spec.inputs.len(),
            "expected {} input shapes, got {}",
            self.spec.inputs.len(),
            shapes.len()
        );
        // ORT resolves shapes per run; pin the input specs so callers see them.
        for (spec, shape) in self.spec.inputs.iter_mut().zip(shapes) {
            ensure!(
                spec.rank() == shape.rank(),
                "input {} expects rank {}, got {shape}",
                spec.name.0,
                spec.rank()
            );
            spec.dims = shape.dims().iter().map(|&d| Some(d)).collect();
        }
        Ok(())
    }

    fn predict(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [Option<&mut [u8]>],
    ) -> Result<Vec<OutputTensor>> {
        ensure!(
            inputs.len() == self.input_names.len(),
            "expected {} inputs, got {}",
            self.input_names.len(),
            inputs.len()
        );
        ensure!(
            outputs.len() == self.spec.outputs.len(),
            "expected {} output slots, got {}",
            self.spec.outputs.len(),
            outputs.len()
        );

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for (name, input) in self.input_names.iter().zip(inputs) {
            let value = tensor_to_ort_value(input)?;
            ort_inputs.push((name.clone(), SessionInputValue::from(value)));
        }

        // Outputs always come back in ORT-owned storage and are copied out.
        let results = self.session.run(ort_inputs)?;
        let mut out_tensors = Vec::with_capacity(results.len());
        for (_, value) in results.iter() {
            out_tensors.push(ort_value_to_tensor(&value)?);
        }

        Ok(out_tensors)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.source.clone())
    }
}

fn optimization_level(mode: PerformanceMode) -> GraphOptimizationLevel {
    match mode {
        PerformanceMode::None | PerformanceMode::Low => GraphOptimizationLevel::Level1,
        PerformanceMode::Medium => GraphOptimizationLevel::Level2,
        PerformanceMode::High | PerformanceMode::Extreme => GraphOptimizationLevel::Level3,
    }
}

fn build_model_spec(session: &Session) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelSpec { inputs, outputs })
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type");
    };

    let dtype = ort_tensor_element_to_dtype(*ty)?;
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype,
        layout: Layout::None,
        dims,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float16 => Ok(DType::F16),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Int8 => Ok(DType::I8),
        TensorElementType::Uint8 => Ok(DType::U8),
        TensorElementType::Bool => Ok(DType::Bool),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

fn tensor_to_ort_value(tensor: &TensorView<'_>) -> Result<DynValue> {
    let bytes = tensor.data;
    let shape: Vec<usize> = tensor.shape.dims().to_vec();
    let expected_bytes = tensor.shape.byte_len(tensor.dtype);
    ensure!(
        bytes.len() == expected_bytes,
        "input byte size mismatch: got {}, expected {}",
        bytes.len(),
        expected_bytes
    );

    let value = match tensor.dtype {
        DType::F32 => {
            let data = bytes_to_f32(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I64 => {
            let data = bytes_to_i64(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I32 => {
            let data = bytes_to_i32(bytes)?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => {
            let data = bytes.to_vec();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        other => bail!("{other:?} inputs are not supported yet"),
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<OutputTensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let out_shape = Shape::from_slice(&dims);

    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(OutputTensor::owned(
                DType::F32,
                out_shape,
                bytes_from_slice(slice),
            ))
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(OutputTensor::owned(
                DType::I64,
                out_shape,
                bytes_from_slice(slice),
            ))
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(OutputTensor::owned(
                DType::I32,
                out_shape,
                bytes_from_slice(slice),
            ))
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Ok(OutputTensor::owned(
                DType::U8,
                out_shape,
                Bytes::copy_from_slice(slice),
            ))
        }
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}

#[allow(clippy::manual_is_multiple_of)]
fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 4 == 0, "f32 input has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[allow(clippy::manual_is_multiple_of)]
fn bytes_to_i64(bytes: &[u8]) -> Result<Vec<i64>> {
    ensure!(bytes.len() % 8 == 0, "i64 input has invalid byte length");
    Ok(bytes
        .chunks_exact(8)
        .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

#[allow(clippy::manual_is_multiple_of)]
fn bytes_to_i32(bytes: &[u8]) -> Result<Vec<i32>> {
    ensure!(bytes.len() % 4 == 0, "i32 input has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn bytes_from_slice<T>(slice: &[T]) -> Bytes {
    let byte_len = std::mem::size_of_val(slice);
    let ptr = slice.as_ptr().cast::<u8>();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, byte_len) };
    Bytes::copy_from_slice(bytes)
}
