mod common;

use anyhow::{bail, Result};
use common::*;
use devport_backend_graph::GraphBackend;
use devport_core::{
    BufferDescriptor, DevportError, ModelConfig, ModelFormat, SharedMemoryHandle, Status,
};
use devport_runtime::{
    BufferInsufficiency, DeviceService, DriverDevice, DriverModel, InterfaceVersion,
};

fn driver(version: InterfaceVersion) -> DriverDevice<GraphBackend> {
    let cfg = devport_runtime::ServiceConfig {
        interface_version: version,
        ..config()
    };
    DriverDevice::new(DeviceService::new(GraphBackend::new(), cfg))
}

fn prepared(device: &DriverDevice<GraphBackend>, graph: &str) -> Result<DriverModel> {
    let (model, status) =
        device.prepare_model(graph.as_bytes(), ModelFormat::Graph, &ModelConfig::default());
    match model {
        Some(model) if status == Status::Success => Ok(model),
        _ => bail!("prepare failed with {status}"),
    }
}

#[test]
fn parse_versions() -> Result<()> {
    for (raw, want) in [
        ("1", InterfaceVersion::V1_0),
        ("1.0", InterfaceVersion::V1_0),
        ("v1", InterfaceVersion::V1_0),
        ("2", InterfaceVersion::V2_0),
        ("V2.0", InterfaceVersion::V2_0),
    ] {
        assert_eq!(raw.parse::<InterfaceVersion>()?, want, "{raw}");
    }
    assert!("3.0".parse::<InterfaceVersion>().is_err());
    assert_eq!(InterfaceVersion::default(), InterfaceVersion::V2_0);
    Ok(())
}

#[test]
fn v1_collapses_fine_grained_statuses() {
    let caps = InterfaceVersion::V1_0.capabilities();
    let cases = [
        (DevportError::InvalidShape("rank".into()), Status::InvalidParameter),
        (
            DevportError::OutOfDimensionRange {
                index: 0,
                position: 0,
                value: 11,
                min: 1,
                max: 10,
            },
            Status::InvalidParameter,
        ),
        (DevportError::InvalidBuffer("none".into()), Status::InvalidParameter),
        (DevportError::OutOfMemory("shm".into()), Status::OutOfMemory),
        (DevportError::Failed("engine".into()), Status::Failed),
    ];
    for (err, want) in &cases {
        assert_eq!(caps.status_of(err), *want, "{err}");
    }

    let caps = InterfaceVersion::V2_0.capabilities();
    for (err, _) in &cases {
        assert_eq!(caps.status_of(err), err.status(), "{err}");
    }
}

#[test]
fn v2_reports_insufficient_buffer_status() -> Result<()> {
    let device = driver(InterfaceVersion::V2_0);
    let model = prepared(&device, STATIC_GRAPH)?;
    let x = region_with(&[1.0; 6])?;
    let y = empty_region(24)?;
    let s = empty_region(4)?;

    let reply = model.run(
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor()),
        ],
    );
    assert_eq!(reply.status, Status::InsufficientBuffer);
    assert_eq!(reply.buffer_insufficient, BufferInsufficiency::Whole(true));
    assert_eq!(reply.output_dims, vec![vec![2, 3], vec![2]]);

    let s = empty_region(8)?;
    let reply = model.run(
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor()),
        ],
    );
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.buffer_insufficient, BufferInsufficiency::Whole(false));
    Ok(())
}

#[test]
fn v1_reports_insufficiency_per_output() -> Result<()> {
    let device = driver(InterfaceVersion::V1_0);
    let model = prepared(&device, STATIC_GRAPH)?;
    let x = region_with(&[1.0; 6])?;
    let y = empty_region(24)?;
    let s = empty_region(4)?;

    let reply = model.run(
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor()),
        ],
    );
    assert_eq!(reply.status, Status::Success);
    assert_eq!(
        reply.buffer_insufficient,
        BufferInsufficiency::PerOutput(vec![false, true])
    );
    assert_eq!(read_f32(y.as_slice()), vec![1.0; 6]);
    Ok(())
}

#[test]
fn run_errors_map_through_the_version() -> Result<()> {
    let none = BufferDescriptor::new(SharedMemoryHandle::NONE, 24, 0, 24);
    for (version, want) in [
        (InterfaceVersion::V1_0, Status::InvalidParameter),
        (InterfaceVersion::V2_0, Status::InvalidBuffer),
    ] {
        let device = driver(version);
        let model = prepared(&device, STATIC_GRAPH)?;
        let y = empty_region(24)?;
        let s = empty_region(8)?;
        let reply = model.run(
            &[f32_tensor(&[2, 3], none.clone())],
            &[
                f32_tensor(&[2, 3], y.descriptor()),
                f32_tensor(&[2], s.descriptor()),
            ],
        );
        assert_eq!(reply.status, want, "{version:?}");
        assert!(reply.output_dims.is_empty());
    }
    Ok(())
}

#[test]
fn dim_range_query_is_v2_only() -> Result<()> {
    let v1 = driver(InterfaceVersion::V1_0);
    let (min, max, status) = prepared(&v1, DYNAMIC_GRAPH)?.get_input_dim_ranges();
    assert_eq!(status, Status::Unsupported);
    assert!(min.is_empty() && max.is_empty());

    let v2 = driver(InterfaceVersion::V2_0);
    let (min, max, status) = prepared(&v2, DYNAMIC_GRAPH)?.get_input_dim_ranges();
    assert_eq!(status, Status::Success);
    assert_eq!(min, vec![vec![1, 3]]);
    assert_eq!(max, vec![vec![10, 3]]);
    Ok(())
}

#[test]
fn driver_device_statuses() -> Result<()> {
    let device = driver(InterfaceVersion::V2_0);
    assert_eq!(device.version(), InterfaceVersion::V2_0);

    let (desc, status) = device.allocate_buffer(256);
    assert_eq!(status, Status::Success);
    assert_eq!(desc.length, 256);
    assert_eq!(device.release_buffer(&desc), Status::Success);
    assert_eq!(device.release_buffer(&desc), Status::InvalidParameter);

    let (desc, status) = device.allocate_buffer(0);
    assert_eq!(status, Status::InvalidParameter);
    assert!(desc.handle.is_none());

    let (flags, status) = device.get_supported_operation(STATIC_GRAPH.as_bytes(), ModelFormat::Graph);
    assert_eq!(status, Status::Success);
    assert_eq!(flags, vec![true, true]);

    let (model, status) =
        device.prepare_model(b"{}", ModelFormat::Graph, &ModelConfig::default());
    assert!(model.is_none());
    assert_eq!(status, Status::Failed);
    Ok(())
}

#[test]
fn driver_cache_round_trip() -> Result<()> {
    let device = driver(InterfaceVersion::V2_0);
    let model = prepared(&device, TWO_INPUT_GRAPH)?;

    let mut cache = Vec::new();
    assert_eq!(model.export_model_cache(&mut cache), Status::Success);
    assert_eq!(model.export_model_cache(&mut cache), Status::InvalidParameter);

    let (restored, status) = device.prepare_model_from_cache(&cache, &ModelConfig::default());
    assert_eq!(status, Status::Success);
    let Some(restored) = restored else {
        bail!("restore returned no model");
    };
    assert_eq!(restored.prepared().spec(), model.prepared().spec());

    let (none, status) = device.prepare_model_from_cache(&[], &ModelConfig::default());
    assert!(none.is_none());
    assert_eq!(status, Status::InvalidParameter);
    Ok(())
}
