#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use devport_backend_graph::GraphBackend;
use devport_core::{
    BufferDescriptor, DType, DevportError, DevportResult, Layout, ModelConfig, ModelFormat,
    TensorDescriptor,
};
use devport_runtime::{
    Access, BufferBinder, DeviceService, MappedBuffer, PreparedModel, ServiceConfig,
    SharedMemoryBinder, SharedRegion,
};

/// x[2,3] -> y = relu(x) [2,3], s = sum(x, axis 1) [2]
pub const STATIC_GRAPH: &str = r#"{
    "inputs": [{ "name": "x", "dtype": "f32", "dims": [2, 3] }],
    "nodes": [
        { "op": "relu", "inputs": ["x"], "output": "y" },
        { "op": "reduce_sum", "inputs": ["x"], "output": "s", "axis": 1 }
    ],
    "outputs": ["y", "s"]
}"#;

/// x[-1,3] -> y = 2x [-1,3], s = sum(x, axis 1) [-1]
pub const DYNAMIC_GRAPH: &str = r#"{
    "inputs": [{ "name": "x", "dtype": "f32", "dims": [-1, 3] }],
    "nodes": [
        { "op": "scale", "inputs": ["x"], "output": "y", "factor": 2.0 },
        { "op": "reduce_sum", "inputs": ["x"], "output": "s", "axis": 1 }
    ],
    "outputs": ["y", "s"]
}"#;

/// a[2,2] + b[2,2]
pub const TWO_INPUT_GRAPH: &str = r#"{
    "inputs": [
        { "name": "a", "dims": [2, 2] },
        { "name": "b", "dims": [2, 2] }
    ],
    "nodes": [{ "op": "add", "inputs": ["a", "b"], "output": "c" }],
    "outputs": ["c"]
}"#;

pub fn config() -> ServiceConfig {
    ServiceConfig {
        shm_dir: Some(std::env::temp_dir()),
        ..ServiceConfig::default()
    }
}

pub fn device_with(binder: Arc<dyn BufferBinder>) -> DeviceService<GraphBackend> {
    DeviceService::with_binder(GraphBackend::new(), config(), binder)
}

/// Prepares `graph` on a device whose binder can be probed.
pub fn prepare(graph: &str) -> Result<(PreparedModel, SharedMemoryBinder)> {
    let binder = SharedMemoryBinder::new();
    let device = device_with(Arc::new(binder.clone()));
    let model = device.prepare_model(graph.as_bytes(), ModelFormat::Graph, &ModelConfig::default())?;
    Ok((model, binder))
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// A client-side shared region holding `values`.
pub fn region_with(values: &[f32]) -> Result<SharedRegion> {
    let bytes = f32_bytes(values);
    let mut region = SharedRegion::create(bytes.len() as u32, &std::env::temp_dir())?;
    region.as_mut_slice().copy_from_slice(&bytes);
    Ok(region)
}

/// A zeroed client-side region of `len` bytes.
pub fn empty_region(len: u32) -> Result<SharedRegion> {
    Ok(SharedRegion::create(len, &std::env::temp_dir())?)
}

pub fn f32_tensor(dims: &[i32], data: BufferDescriptor) -> TensorDescriptor {
    TensorDescriptor::new(DType::F32, Layout::None, dims.to_vec(), data)
}

/// Wraps the real binder, counting binds and optionally failing the n-th one
/// (1-based).
pub struct CountingBinder {
    pub inner: SharedMemoryBinder,
    binds: AtomicUsize,
    fail_on: Option<usize>,
}

impl CountingBinder {
    pub fn new() -> Self {
        Self {
            inner: SharedMemoryBinder::new(),
            binds: AtomicUsize::new(0),
            fail_on: None,
        }
    }

    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::new()
        }
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.inner.live_mappings()
    }
}

impl BufferBinder for CountingBinder {
    fn bind(&self, desc: &BufferDescriptor, access: Access) -> DevportResult<MappedBuffer> {
        let n = self.binds.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(n) {
            return Err(DevportError::InvalidBuffer(format!("injected failure on bind {n}")));
        }
        self.inner.bind(desc, access)
    }
}
