use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use devport_core::{
    Backend, BufferDescriptor, ModelFormat, Shape, Status, TensorDescriptor, TensorSpec,
    DYNAMIC_DIM,
};
use devport_runtime::{
    Access, BufferBinder, BufferInsufficiency, DeviceService, DriverDevice, DriverModel,
    ServiceConfig, SharedMemoryBinder,
};
use tracing::{debug, info};

use crate::cli::{Command, InputArg, ModelArgs};

/// Capacity given to a dynamic output when none is requested.
const DEFAULT_DYNAMIC_OUTPUT: u32 = 1 << 20;

pub fn execute<B: Backend>(
    backend: B,
    format: ModelFormat,
    config: ServiceConfig,
    command: Command,
) -> Result<()> {
    let driver = DriverDevice::new(DeviceService::new(backend, config));
    let binder = SharedMemoryBinder::new();

    match command {
        Command::Info => info_cmd(&driver),
        Command::Inspect { model } => inspect(&driver, &binder, format, &model),
        Command::Run {
            model,
            inputs,
            output_capacity,
            out_dir,
        } => run(
            &driver,
            &binder,
            format,
            &model,
            &inputs,
            output_capacity,
            out_dir.as_deref(),
        ),
        Command::ExportCache { model, out } => export_cache(&driver, &binder, format, &model, &out),
    }
}

fn info_cmd<B: Backend>(driver: &DriverDevice<B>) -> Result<()> {
    let service = driver.service();
    let (major, minor) = service.version();
    println!("device:        {}", service.device_name());
    println!("vendor:        {}", service.vendor_name());
    println!("type:          {:?}", service.device_type());
    println!("status:        {:?}", service.device_status());
    println!("backend:       {}", service.backend().name());
    println!("interface:     {major}.{minor}");
    println!("float16:       {}", service.is_float16_precision_supported());
    println!("performance:   {}", service.is_performance_mode_supported());
    println!("priority:      {}", service.is_priority_supported());
    println!("dynamic input: {}", service.is_dynamic_input_supported());
    println!("model cache:   {}", service.is_model_cache_supported());
    Ok(())
}

fn inspect<B: Backend>(
    driver: &DriverDevice<B>,
    binder: &SharedMemoryBinder,
    format: ModelFormat,
    args: &ModelArgs,
) -> Result<()> {
    if !args.from_cache {
        let bytes = read_model(&args.model)?;
        let (flags, status) = driver.get_supported_operation(&bytes, format);
        if status.is_success() {
            let supported = flags.iter().filter(|&&ok| ok).count();
            println!("operations: {supported}/{} supported", flags.len());
        } else {
            println!("operations: unknown ({status})");
        }
    }

    let model = prepare(driver, binder, format, args)?;
    let spec = model.prepared().spec();
    println!("dynamic: {}", model.prepared().is_dynamic());
    for (index, input) in spec.inputs.iter().enumerate() {
        println!("input  {index}: {}", describe(input));
    }
    for (index, output) in spec.outputs.iter().enumerate() {
        println!("output {index}: {}", describe(output));
    }

    let (min, max, status) = model.get_input_dim_ranges();
    match status {
        Status::Success => {
            for (index, (min, max)) in min.iter().zip(&max).enumerate() {
                println!("range  {index}: min {min:?} max {max:?}");
            }
        }
        Status::Unsupported => println!("ranges: not available on interface {:?}", driver.version()),
        other => bail!("dimension range query failed: {other}"),
    }
    Ok(())
}

fn run<B: Backend>(
    driver: &DriverDevice<B>,
    binder: &SharedMemoryBinder,
    format: ModelFormat,
    args: &ModelArgs,
    inputs: &[InputArg],
    output_capacity: Option<u32>,
    out_dir: Option<&Path>,
) -> Result<()> {
    let model = prepare(driver, binder, format, args)?;
    let spec = model.prepared().spec().clone();
    ensure!(
        inputs.len() == spec.inputs.len(),
        "model takes {} inputs, got {}",
        spec.inputs.len(),
        inputs.len()
    );

    let mut buffers = Allocations::new(driver);

    let mut input_tensors = Vec::with_capacity(inputs.len());
    for (arg, input) in inputs.iter().zip(&spec.inputs) {
        let bytes = fs::read(&arg.path)
            .with_context(|| format!("failed to read input {}", arg.path.display()))?;
        let desc = buffers.allocate(buffer_len(bytes.len())?)?;
        fill(binder, &desc, &bytes)?;
        input_tensors.push(TensorDescriptor::new(
            input.dtype,
            input.layout,
            arg.dims.clone(),
            desc,
        ));
    }

    let mut output_tensors = Vec::with_capacity(spec.outputs.len());
    for output in &spec.outputs {
        let len = match (output_capacity, output.byte_len()) {
            (Some(len), _) => len,
            (None, Some(len)) => buffer_len(len)?,
            (None, None) => DEFAULT_DYNAMIC_OUTPUT,
        };
        let dims = output
            .dims
            .iter()
            .map(|d| d.map_or(Ok(DYNAMIC_DIM), i32::try_from))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("output dimension does not fit the wire format")?;
        output_tensors.push(TensorDescriptor::new(
            output.dtype,
            output.layout,
            dims,
            buffers.allocate(len)?,
        ));
    }

    let reply = model.run(&input_tensors, &output_tensors);
    debug!(status = ?reply.status, "run reply");
    if !matches!(reply.status, Status::Success | Status::InsufficientBuffer) {
        bail!("run failed: {}", reply.status);
    }
    println!("status: {}", reply.status);

    if let Some(dir) = out_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    for (index, ((output, tensor), dims)) in spec
        .outputs
        .iter()
        .zip(&output_tensors)
        .zip(&reply.output_dims)
        .enumerate()
    {
        let flagged = match &reply.buffer_insufficient {
            BufferInsufficiency::PerOutput(flags) => flags.get(index).copied().unwrap_or(false),
            BufferInsufficiency::Whole(_) => false,
        };
        let needed = produced_len(output, dims);
        let fits = needed.map_or(false, |n| n <= tensor.data.length as usize);
        println!(
            "output {index} {}: {:?} {dims:?}{}",
            output.name.0,
            output.dtype,
            if flagged || !fits { " (buffer insufficient)" } else { "" }
        );

        if let (Some(dir), Some(needed), true) = (out_dir, needed, fits) {
            let path = dir.join(format!("{}.bin", output.name.0));
            let mapping = binder.bind(&tensor.data.with_length(buffer_len(needed)?), Access::ReadOnly)?;
            fs::write(&path, mapping.as_slice())
                .with_context(|| format!("failed to write {}", path.display()))?;
            mapping.unbind();
            info!(path = %path.display(), len = needed, "wrote output");
        }
    }
    Ok(())
}

fn export_cache<B: Backend>(
    driver: &DriverDevice<B>,
    binder: &SharedMemoryBinder,
    format: ModelFormat,
    args: &ModelArgs,
    out: &Path,
) -> Result<()> {
    let model = prepare(driver, binder, format, args)?;
    let mut cache = Vec::new();
    let status = model.export_model_cache(&mut cache);
    ensure!(status.is_success(), "model cache export failed: {status}");
    let desc = cache.first().context("model cache export returned no buffer")?;

    let mapping = binder.bind(desc, Access::ReadOnly)?;
    fs::write(out, mapping.as_slice())
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("wrote {} bytes to {}", mapping.len(), out.display());
    mapping.unbind();
    Ok(())
}

fn prepare<B: Backend>(
    driver: &DriverDevice<B>,
    binder: &SharedMemoryBinder,
    format: ModelFormat,
    args: &ModelArgs,
) -> Result<DriverModel> {
    let bytes = read_model(&args.model)?;
    let config = args.config();

    let (model, status) = if args.from_cache {
        let mut buffers = Allocations::new(driver);
        let desc = buffers.allocate(buffer_len(bytes.len())?)?;
        fill(binder, &desc, &bytes)?;
        driver.prepare_model_from_cache(&[desc], &config)
    } else {
        driver.prepare_model(&bytes, format, &config)
    };

    model.with_context(|| format!("failed to prepare {}: {status}", args.model.display()))
}

fn read_model(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read model {}", path.display()))
}

fn fill(binder: &SharedMemoryBinder, desc: &BufferDescriptor, bytes: &[u8]) -> Result<()> {
    let mut mapping = binder.bind(desc, Access::ReadWrite)?;
    mapping.as_mut_slice()?.copy_from_slice(bytes);
    mapping.unbind();
    Ok(())
}

fn buffer_len(len: usize) -> Result<u32> {
    u32::try_from(len).with_context(|| format!("{len} bytes does not fit a shared buffer"))
}

fn produced_len(spec: &TensorSpec, dims: &[i32]) -> Option<usize> {
    let dims = dims
        .iter()
        .map(|&d| usize::try_from(d).ok())
        .collect::<Option<Vec<_>>>()?;
    Some(Shape::from_slice(&dims).byte_len(spec.dtype))
}

fn describe(spec: &TensorSpec) -> String {
    let dims = spec
        .dims
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} {:?} {:?} [{dims}]", spec.name.0, spec.dtype, spec.layout)
}

/// Buffers allocated through the driver for one command, released on drop.
struct Allocations<'a, B: Backend> {
    driver: &'a DriverDevice<B>,
    held: Vec<BufferDescriptor>,
}

impl<'a, B: Backend> Allocations<'a, B> {
    fn new(driver: &'a DriverDevice<B>) -> Self {
        Self {
            driver,
            held: Vec::new(),
        }
    }

    fn allocate(&mut self, len: u32) -> Result<BufferDescriptor> {
        let (desc, status) = self.driver.allocate_buffer(len);
        ensure!(status.is_success(), "failed to allocate {len} bytes: {status}");
        self.held.push(desc.clone());
        Ok(desc)
    }
}

impl<B: Backend> Drop for Allocations<'_, B> {
    fn drop(&mut self) {
        for desc in self.held.drain(..) {
            let status = self.driver.release_buffer(&desc);
            if !status.is_success() {
                tracing::warn!(%status, "failed to release buffer");
            }
        }
    }
}
