//! Graph documents and their cache encoding.
//!
//! A graph is authored as JSON:
//!
//! ```json
//! {
//!   "inputs": [{ "name": "x", "dtype": "f32", "dims": [-1, 3] }],
//!   "nodes": [{ "op": "relu", "inputs": ["x"], "output": "y" }],
//!   "outputs": ["y"]
//! }
//! ```
//!
//! The cache form is `CACHE_MAGIC`, a little-endian `u32` version, then the
//! bincode encoding of the same [`GraphDef`].

use anyhow::{bail, ensure, Context, Result};
use devport_core::{DType, Layout};
use serde::{Deserialize, Serialize};

pub const CACHE_MAGIC: &[u8; 4] = b"DPGC";
pub const CACHE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub inputs: Vec<InputDef>,
    pub nodes: Vec<NodeDef>,
    pub outputs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default = "default_layout")]
    pub layout: String,
    pub dims: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub op: String,
    pub inputs: Vec<String>,
    pub output: String,
    #[serde(default)]
    pub factor: Option<f32>,
    #[serde(default)]
    pub axis: Option<usize>,
    #[serde(default)]
    pub keep_dims: Option<bool>,
}

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_layout() -> String {
    "none".to_string()
}

impl GraphDef {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("failed to parse graph document")
    }

    pub fn from_cache(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 8, "graph cache is truncated");
        ensure!(&bytes[..4] == CACHE_MAGIC, "invalid graph cache magic");
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != CACHE_VERSION {
            bail!("unsupported graph cache version {version}");
        }
        bincode::deserialize(&bytes[8..]).context("failed to decode graph cache")
    }

    pub fn to_cache(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).context("failed to encode graph cache")?;
        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(CACHE_MAGIC);
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

pub(crate) fn parse_dtype(raw: &str) -> Result<DType> {
    Ok(match raw.to_ascii_lowercase().as_str() {
        "f32" | "float32" => DType::F32,
        "f16" | "float16" => DType::F16,
        "i64" | "int64" => DType::I64,
        "i32" | "int32" => DType::I32,
        "i8" | "int8" => DType::I8,
        "u8" | "uint8" => DType::U8,
        "bool" => DType::Bool,
        other => bail!("unknown dtype: {other}"),
    })
}

pub(crate) fn parse_layout(raw: &str) -> Result<Layout> {
    Ok(match raw.to_ascii_lowercase().as_str() {
        "none" | "" => Layout::None,
        "nchw" => Layout::Nchw,
        "nhwc" => Layout::Nhwc,
        other => bail!("unknown layout: {other}"),
    })
}

pub(crate) fn parse_dims(dims: &[i64]) -> Result<Vec<Option<usize>>> {
    dims.iter()
        .map(|&d| match d {
            -1 => Ok(None),
            d if d > 0 => Ok(Some(d as usize)),
            d => bail!("invalid dimension {d}"),
        })
        .collect()
}
