mod common;

use std::sync::Arc;

use anyhow::{bail, Result};
use common::*;
use devport_core::{BufferDescriptor, ModelConfig, ModelFormat, Status};
use devport_runtime::{Access, BufferBinder, SharedMemoryBinder};

fn cache_bytes(binder: &SharedMemoryBinder, desc: &BufferDescriptor) -> Result<Vec<u8>> {
    let mapping = binder.bind(desc, Access::ReadOnly)?;
    let bytes = mapping.as_slice().to_vec();
    mapping.unbind();
    Ok(bytes)
}

#[test]
fn export_is_idempotent() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;

    let mut first = Vec::new();
    model.export_model_cache(&mut first)?;
    let mut second = Vec::new();
    model.export_model_cache(&mut second)?;

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].handle.raw(), second[0].handle.raw());
    assert_eq!(first[0].length, second[0].length);
    assert!(first[0].length > 0);
    assert_eq!(cache_bytes(&binder, &first[0])?, cache_bytes(&binder, &second[0])?);
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn export_into_non_empty_list_is_rejected() -> Result<()> {
    let (model, _binder) = prepare(STATIC_GRAPH)?;
    let mut out = vec![BufferDescriptor::default()];
    let err = model.export_model_cache(&mut out).err();
    assert_eq!(err.map(|e| e.status()), Some(Status::InvalidParameter));
    assert_eq!(out.len(), 1);
    Ok(())
}

#[test]
fn restored_model_matches_the_original() -> Result<()> {
    let binder = SharedMemoryBinder::new();
    let device = device_with(Arc::new(binder.clone()));
    let original = device.prepare_model(
        DYNAMIC_GRAPH.as_bytes(),
        ModelFormat::Graph,
        &ModelConfig::default(),
    )?;

    let mut cache = Vec::new();
    original.export_model_cache(&mut cache)?;
    let restored = device.prepare_model_from_cache(&cache, &ModelConfig::default())?;

    assert_eq!(restored.spec(), original.spec());
    assert!(restored.is_dynamic());
    assert_eq!(restored.input_dim_ranges(), original.input_dim_ranges());

    let x = region_with(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0])?;
    let mut results = Vec::new();
    for model in [&original, &restored] {
        let y = empty_region(36)?;
        let s = empty_region(12)?;
        let out = model.run(
            &[f32_tensor(&[3, 3], x.descriptor())],
            &[
                f32_tensor(&[-1, 3], y.descriptor()),
                f32_tensor(&[-1], s.descriptor()),
            ],
        )?;
        results.push((out, read_f32(y.as_slice()), read_f32(s.as_slice())));
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1].2, vec![6.0, 15.0, 24.0]);
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn cache_must_be_exactly_one_buffer() -> Result<()> {
    let device = device_with(Arc::new(SharedMemoryBinder::new()));
    let (model, _binder) = prepare(STATIC_GRAPH)?;
    let mut cache = Vec::new();
    model.export_model_cache(&mut cache)?;

    let two = vec![cache[0].clone(), cache[0].clone()];
    for descriptors in [&[][..], &two[..]] {
        match device.prepare_model_from_cache(descriptors, &ModelConfig::default()) {
            Ok(_) => bail!("{} cache buffers should be rejected", descriptors.len()),
            Err(err) => assert_eq!(err.status(), Status::InvalidParameter),
        }
    }
    Ok(())
}

#[test]
fn corrupt_cache_fails_to_build() -> Result<()> {
    let device = device_with(Arc::new(SharedMemoryBinder::new()));
    let junk = region_with(&[1.0, 2.0, 3.0, 4.0])?;
    match device.prepare_model_from_cache(&[junk.descriptor()], &ModelConfig::default()) {
        Ok(_) => bail!("junk cache should not build"),
        Err(err) => assert_eq!(err.status(), Status::Failed),
    }
    Ok(())
}
