mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{BackendKind, Cli, Command};
use devport_backend_graph::GraphBackend;
use devport_core::ModelFormat;
use devport_runtime::ServiceConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.service_config()?;
    match cli.backend {
        BackendKind::Graph => {
            commands::execute(GraphBackend::new(), ModelFormat::Graph, config, cli.command)
        }
        BackendKind::Onnx => run_onnx(config, cli.command),
    }
}

#[cfg(feature = "onnx")]
fn run_onnx(config: ServiceConfig, command: Command) -> Result<()> {
    commands::execute(
        devport_backend_ort::OrtBackend::new(),
        ModelFormat::Onnx,
        config,
        command,
    )
}

#[cfg(not(feature = "onnx"))]
fn run_onnx(_config: ServiceConfig, _command: Command) -> Result<()> {
    anyhow::bail!("devport was built without the `onnx` feature")
}
