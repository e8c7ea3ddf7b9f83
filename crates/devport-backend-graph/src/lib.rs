//! Reference engine for small f32 graphs.
//!
//! Supports element-wise, reduction and matmul operators over declared inputs
//! with optionally dynamic (`-1`) dimensions. It exists so the driver protocol
//! can be exercised end to end without a native runtime.

pub mod graph;
pub mod ops;

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use devport_core::{
    Backend, BackendCapabilities, CompiledModel, DType, IOName, Layout, ModelConfig, ModelFormat,
    ModelSpec, OutputData, OutputTensor, Shape, TensorSpec, TensorView,
};
use tracing::debug;

pub use graph::GraphDef;
use ops::{Dims, Op};

pub struct GraphBackend;

impl GraphBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct Node {
    op: Op,
    inputs: Vec<String>,
    output: String,
}

pub struct GraphModel {
    def: GraphDef,
    nodes: Vec<Node>,
    spec: ModelSpec,
}

impl Backend for GraphBackend {
    type Model = GraphModel;

    fn name(&self) -> &'static str {
        "graph"
    }

    fn build(&self, bytes: &[u8], format: ModelFormat, config: &ModelConfig) -> Result<GraphModel> {
        let def = decode(bytes, format)?;
        debug!(
            nodes = def.nodes.len(),
            ?format,
            performance = ?config.performance_mode,
            "building graph model"
        );
        GraphModel::compile(def)
    }

    fn cache_format(&self) -> ModelFormat {
        ModelFormat::GraphCache
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_dynamic_shapes: true,
            supports_float16: false,
            supports_performance_mode: true,
            supports_priority: true,
            supports_model_cache: true,
        }
    }

    fn supported_operations(&self, bytes: &[u8], format: ModelFormat) -> Result<Vec<bool>> {
        let def = decode(bytes, format)?;
        Ok(def
            .nodes
            .iter()
            .map(|node| matches!(Op::parse(node), Some(Ok(_))))
            .collect())
    }
}

fn decode(bytes: &[u8], format: ModelFormat) -> Result<GraphDef> {
    match format {
        ModelFormat::Graph => GraphDef::from_json(bytes),
        ModelFormat::GraphCache => GraphDef::from_cache(bytes),
        ModelFormat::Onnx => bail!("graph backend cannot build ONNX models"),
    }
}

impl GraphModel {
    pub fn compile(def: GraphDef) -> Result<Self> {
        ensure!(!def.inputs.is_empty(), "graph declares no inputs");
        ensure!(!def.outputs.is_empty(), "graph declares no outputs");

        let mut inputs = Vec::with_capacity(def.inputs.len());
        for input in &def.inputs {
            let dtype = graph::parse_dtype(&input.dtype)?;
            ensure!(
                dtype == DType::F32,
                "input {} has dtype {dtype:?}; only f32 is supported",
                input.name
            );
            inputs.push(TensorSpec {
                name: IOName(input.name.clone()),
                dtype,
                layout: graph::parse_layout(&input.layout)?,
                dims: graph::parse_dims(&input.dims)
                    .with_context(|| format!("input {}", input.name))?,
            });
        }

        let mut nodes = Vec::with_capacity(def.nodes.len());
        for (idx, node) in def.nodes.iter().enumerate() {
            let op = match Op::parse(node) {
                Some(op) => op.with_context(|| format!("node {idx}"))?,
                None => bail!("node {idx}: unsupported operator `{}`", node.op),
            };
            ensure!(
                node.inputs.len() == op.arity(),
                "node {idx}: `{}` takes {} inputs, got {}",
                node.op,
                op.arity(),
                node.inputs.len()
            );
            nodes.push(Node {
                op,
                inputs: node.inputs.clone(),
                output: node.output.clone(),
            });
        }

        let mut model = Self {
            def,
            nodes,
            spec: ModelSpec {
                inputs,
                outputs: Vec::new(),
            },
        };
        model.infer_outputs()?;
        Ok(model)
    }

    pub fn definition(&self) -> &GraphDef {
        &self.def
    }

    /// Propagates the current input dims through the graph.
    fn infer_outputs(&mut self) -> Result<()> {
        let mut dims: HashMap<&str, Dims> = HashMap::new();
        for input in &self.spec.inputs {
            ensure!(
                dims.insert(input.name.0.as_str(), input.dims.clone()).is_none(),
                "duplicate tensor name {}",
                input.name.0
            );
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            let operands = node
                .inputs
                .iter()
                .map(|name| {
                    dims.get(name.as_str())
                        .with_context(|| format!("node {idx}: unknown tensor {name}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let out = node
                .op
                .infer(&operands)
                .with_context(|| format!("node {idx}"))?;
            ensure!(
                dims.insert(node.output.as_str(), out).is_none(),
                "node {idx}: tensor {} is defined twice",
                node.output
            );
        }

        let outputs = self
            .def
            .outputs
            .iter()
            .map(|name| {
                let d = dims
                    .get(name.as_str())
                    .with_context(|| format!("unknown output tensor {name}"))?;
                Ok(TensorSpec {
                    name: IOName(name.clone()),
                    dtype: DType::F32,
                    layout: Layout::None,
                    dims: d.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.spec.outputs = outputs;
        Ok(())
    }
}

impl CompiledModel for GraphModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn resize(&mut self, shapes: &[Shape]) -> Result<()> {
        ensure!(
            shapes.len() == self.def.inputs.len(),
            "expected {} input shapes, got {}",
            self.def.inputs.len(),
            shapes.len()
        );

        let mut resized = Vec::with_capacity(shapes.len());
        for (input, shape) in self.def.inputs.iter().zip(shapes) {
            let declared = graph::parse_dims(&input.dims)?;
            ensure!(
                declared.len() == shape.rank(),
                "input {} has rank {}, got {shape}",
                input.name,
                declared.len()
            );
            for (pos, (want, got)) in declared.iter().zip(shape.dims()).enumerate() {
                if let Some(want) = want {
                    ensure!(
                        want == got,
                        "input {} dim {pos} is fixed at {want}, got {got}",
                        input.name
                    );
                }
            }
            resized.push(shape.dims().iter().map(|&d| Some(d)).collect::<Dims>());
        }

        let previous = std::mem::take(&mut self.spec.outputs);
        for (spec, dims) in self.spec.inputs.iter_mut().zip(resized) {
            spec.dims = dims;
        }
        if let Err(err) = self.infer_outputs() {
            self.spec.outputs = previous;
            return Err(err);
        }
        debug!(?shapes, "resized graph model");
        Ok(())
    }

    fn predict(
        &mut self,
        inputs: &[TensorView<'_>],
        outputs: &mut [Option<&mut [u8]>],
    ) -> Result<Vec<OutputTensor>> {
        ensure!(
            inputs.len() == self.spec.inputs.len(),
            "expected {} inputs, got {}",
            self.spec.inputs.len(),
            inputs.len()
        );
        ensure!(
            outputs.len() == self.spec.outputs.len(),
            "expected {} output slots, got {}",
            self.spec.outputs.len(),
            outputs.len()
        );

        let mut values: HashMap<&str, (Shape, Vec<f32>)> = HashMap::new();
        for (spec, view) in self.spec.inputs.iter().zip(inputs) {
            ensure!(view.dtype == DType::F32, "input {} must be f32", spec.name.0);
            ensure!(
                view.shape.rank() == spec.rank()
                    && spec
                        .dims
                        .iter()
                        .zip(view.shape.dims())
                        .all(|(want, got)| want.map_or(true, |w| w == *got)),
                "input {} shape {} does not match {:?}",
                spec.name.0,
                view.shape,
                spec.dims
            );
            let data = bytes_to_f32(view.data)?;
            ensure!(
                data.len() == view.shape.numel(),
                "input {} has {} elements, expected {}",
                spec.name.0,
                data.len(),
                view.shape.numel()
            );
            values.insert(spec.name.0.as_str(), (view.shape.clone(), data));
        }

        for node in &self.nodes {
            let operands = node
                .inputs
                .iter()
                .map(|name| {
                    values
                        .get(name.as_str())
                        .map(|(s, d)| (s, d.as_slice()))
                        .with_context(|| format!("tensor {name} was not computed"))
                })
                .collect::<Result<Vec<_>>>()?;
            let result = node.op.eval(&operands)?;
            values.insert(node.output.as_str(), result);
        }

        let mut produced = Vec::with_capacity(self.def.outputs.len());
        for (name, slot) in self.def.outputs.iter().zip(outputs.iter_mut()) {
            let (shape, data) = values
                .get(name.as_str())
                .with_context(|| format!("output {name} was not computed"))?;
            let bytes = f32_to_bytes(data);
            let out = match slot {
                Some(buf) if buf.len() >= bytes.len() => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    OutputTensor {
                        dtype: DType::F32,
                        shape: shape.clone(),
                        data: OutputData::InPlace,
                    }
                }
                _ => OutputTensor::owned(DType::F32, shape.clone(), Bytes::from(bytes)),
            };
            produced.push(out);
        }

        Ok(produced)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        self.def.to_cache()
    }
}

fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 4 == 0, "f32 input has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn f32_to_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}
