use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{ensure, Context};
use clap::{Parser, Subcommand, ValueEnum};
use devport_core::{ModelConfig, PerformanceMode, Priority};
use devport_runtime::{DimRange, InterfaceVersion, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "devport", version, about = "Shared-memory tensor driver service")]
pub struct Cli {
    /// Engine used to build models
    #[arg(long, value_enum, default_value_t = BackendKind::Graph, global = true)]
    pub backend: BackendKind,

    /// Directory shared-memory objects are created in
    #[arg(long, env = "DEVPORT_SHM_DIR", global = true)]
    pub shm_dir: Option<PathBuf>,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, env = "DEVPORT_LOG", default_value = "warn", global = true)]
    pub log: String,

    /// Driver interface revision (1.0 or 2.0)
    #[arg(long, default_value = "2.0", global = true)]
    pub interface_version: InterfaceVersion,

    /// Smallest accepted value for a dynamic input dimension
    #[arg(long, default_value_t = DimRange::DEFAULT.min, global = true)]
    pub dim_min: u32,

    /// Largest accepted value for a dynamic input dimension
    #[arg(long, default_value_t = DimRange::DEFAULT.max, global = true)]
    pub dim_max: u32,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        ensure!(
            self.dim_min >= 1 && self.dim_min <= self.dim_max,
            "invalid dynamic dimension range [{}, {}]",
            self.dim_min,
            self.dim_max
        );
        Ok(ServiceConfig {
            shm_dir: self.shm_dir.clone(),
            dynamic_dim_range: DimRange {
                min: self.dim_min,
                max: self.dim_max,
            },
            interface_version: self.interface_version,
            ..ServiceConfig::default()
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// JSON graph reference engine
    Graph,
    /// ONNX Runtime (requires the `onnx` feature)
    Onnx,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print device metadata and capabilities
    Info,

    /// Print a model's tensor specs and dynamic dimension ranges
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run one inference through shared buffers
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Raw little-endian input, as FILE:D0,D1,... (repeat per input)
        #[arg(long = "input", required = true)]
        inputs: Vec<InputArg>,

        /// Bytes allocated per output (default: exact size for static
        /// outputs, 1 MiB for dynamic ones)
        #[arg(long)]
        output_capacity: Option<u32>,

        /// Write each output to DIR/<name>.bin
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Export the compiled model cache to a file
    ExportCache {
        #[command(flatten)]
        model: ModelArgs,

        /// Destination file
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct ModelArgs {
    /// Model file
    #[arg(long)]
    pub model: PathBuf,

    /// Treat the model file as an exported cache artifact
    #[arg(long)]
    pub from_cache: bool,

    /// Request float16 execution
    #[arg(long)]
    pub fp16: bool,

    #[arg(long, value_enum, default_value_t = PerformanceArg::None)]
    pub performance: PerformanceArg,

    #[arg(long, value_enum, default_value_t = PriorityArg::None)]
    pub priority: PriorityArg,
}

impl ModelArgs {
    pub fn config(&self) -> ModelConfig {
        ModelConfig {
            enable_float16: self.fp16,
            performance_mode: self.performance.into(),
            priority: self.priority.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PerformanceArg {
    None,
    Low,
    Medium,
    High,
    Extreme,
}

impl From<PerformanceArg> for PerformanceMode {
    fn from(arg: PerformanceArg) -> Self {
        match arg {
            PerformanceArg::None => PerformanceMode::None,
            PerformanceArg::Low => PerformanceMode::Low,
            PerformanceArg::Medium => PerformanceMode::Medium,
            PerformanceArg::High => PerformanceMode::High,
            PerformanceArg::Extreme => PerformanceMode::Extreme,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    None,
    Low,
    Medium,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::None => Priority::None,
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
        }
    }
}

/// `FILE:D0,D1,...`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputArg {
    pub path: PathBuf,
    pub dims: Vec<i32>,
}

impl FromStr for InputArg {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let (path, dims) = raw
            .rsplit_once(':')
            .with_context(|| format!("expected FILE:D0,D1,..., got {raw}"))?;
        ensure!(!path.is_empty(), "input file is empty in {raw}");
        let dims = dims
            .split(',')
            .map(|d| {
                d.trim()
                    .parse::<i32>()
                    .with_context(|| format!("invalid dimension `{d}` in {raw}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            path: PathBuf::from(path),
            dims,
        })
    }
}
