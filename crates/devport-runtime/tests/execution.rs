mod common;

use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use common::*;
use devport_core::{
    BufferDescriptor, DType, Layout, ModelConfig, ModelFormat, SharedMemoryHandle, Status,
    TensorDescriptor,
};
use devport_runtime::{DimRange, ExecutionCoordinator, RunState, SharedMemoryBinder};
use doubles::FailingModel;

const INPUT: [f32; 6] = [-1.0, 2.0, -3.0, 4.0, -5.0, 6.0];

#[test]
fn static_run_writes_outputs_in_place() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    ensure!(!model.is_dynamic(), "graph should be static");

    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;
    let s = empty_region(8)?;

    let out = model.run(
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor()),
        ],
    )?;

    assert_eq!(out.output_dims, vec![vec![2, 3], vec![2]]);
    assert_eq!(out.insufficient, vec![false, false]);
    assert_eq!(read_f32(y.as_slice()), vec![0.0, 2.0, 0.0, 4.0, 0.0, 6.0]);
    assert_eq!(read_f32(s.as_slice()), vec![-2.0, 5.0]);
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn output_dims_match_declared_static_shapes() -> Result<()> {
    let (model, _binder) = prepare(TWO_INPUT_GRAPH)?;
    let a = region_with(&[1.0, 2.0, 3.0, 4.0])?;
    let b = region_with(&[10.0, 20.0, 30.0, 40.0])?;
    let c = empty_region(16)?;

    let out = model.run(
        &[
            f32_tensor(&[2, 2], a.descriptor()),
            f32_tensor(&[2, 2], b.descriptor()),
        ],
        &[f32_tensor(&[2, 2], c.descriptor())],
    )?;

    let declared: Vec<Vec<i32>> = model
        .spec()
        .outputs
        .iter()
        .map(|spec| spec.dims.iter().map(|d| d.unwrap_or(0) as i32).collect())
        .collect();
    assert_eq!(out.output_dims, declared);
    assert_eq!(read_f32(c.as_slice()), vec![11.0, 22.0, 33.0, 44.0]);
    Ok(())
}

#[test]
fn exact_fit_is_accepted_and_one_byte_short_is_flagged() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;
    let s = empty_region(8)?;

    let out = model.run(
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor().with_length(7)),
        ],
    )?;

    assert_eq!(out.insufficient, vec![false, true]);
    assert!(out.any_insufficient());
    assert_eq!(out.output_dims, vec![vec![2, 3], vec![2]]);
    assert_eq!(read_f32(y.as_slice()), vec![0.0, 2.0, 0.0, 4.0, 0.0, 6.0]);
    assert_eq!(s.as_slice(), &[0u8; 8]);
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn input_count_mismatch_binds_nothing() -> Result<()> {
    let binder = Arc::new(CountingBinder::new());
    let device = device_with(binder.clone());
    let model = device.prepare_model(
        TWO_INPUT_GRAPH.as_bytes(),
        ModelFormat::Graph,
        &ModelConfig::default(),
    )?;
    let a = region_with(&[1.0, 2.0, 3.0, 4.0])?;
    let c = empty_region(16)?;

    for inputs in [
        vec![],
        vec![f32_tensor(&[2, 2], a.descriptor())],
        vec![
            f32_tensor(&[2, 2], a.descriptor()),
            f32_tensor(&[2, 2], a.descriptor()),
            f32_tensor(&[2, 2], a.descriptor()),
        ],
    ] {
        let err = match model.run(&inputs, &[f32_tensor(&[2, 2], c.descriptor())]) {
            Ok(_) => bail!("run with {} inputs should fail", inputs.len()),
            Err(err) => err,
        };
        assert_eq!(err.status(), Status::InvalidParameter);
    }

    assert_eq!(binder.binds(), 0);
    assert_eq!(binder.live(), 0);
    Ok(())
}

#[test]
fn output_count_mismatch_is_invalid_parameter() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;

    let err = model
        .run(
            &[f32_tensor(&[2, 3], x.descriptor())],
            &[f32_tensor(&[2, 3], y.descriptor())],
        )
        .err();
    assert_eq!(err.map(|e| e.status()), Some(Status::InvalidParameter));
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn descriptor_validation_errors() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;
    let s = empty_region(8)?;
    let outputs = [
        f32_tensor(&[2, 3], y.descriptor()),
        f32_tensor(&[2], s.descriptor()),
    ];

    let cases: Vec<(&str, TensorDescriptor, Status)> = vec![
        (
            "element type",
            TensorDescriptor::new(DType::I32, Layout::None, vec![2, 3], x.descriptor()),
            Status::InvalidParameter,
        ),
        (
            "layout",
            TensorDescriptor::new(DType::F32, Layout::Nchw, vec![2, 3], x.descriptor()),
            Status::InvalidParameter,
        ),
        ("rank", f32_tensor(&[6], x.descriptor()), Status::InvalidShape),
        ("fixed dim", f32_tensor(&[3, 2], x.descriptor()), Status::InvalidShape),
        (
            "short buffer",
            f32_tensor(&[2, 3], x.descriptor().with_length(20)),
            Status::InvalidParameter,
        ),
        (
            "none handle",
            f32_tensor(&[2, 3], BufferDescriptor::new(SharedMemoryHandle::NONE, 24, 0, 24)),
            Status::InvalidBuffer,
        ),
        (
            "window past capacity",
            f32_tensor(
                &[2, 3],
                BufferDescriptor::new(x.handle().clone(), 24, 8, 24),
            ),
            Status::InvalidBuffer,
        ),
        (
            "capacity past object",
            f32_tensor(
                &[2, 3],
                BufferDescriptor::new(x.handle().clone(), 4096, 0, 4096),
            ),
            Status::InvalidBuffer,
        ),
    ];

    for (name, input, expected) in cases {
        match model.run(&[input], &outputs) {
            Ok(_) => bail!("{name}: run should fail"),
            Err(err) => assert_eq!(err.status(), expected, "{name}: {err}"),
        }
        assert_eq!(binder.live_mappings(), 0, "{name}: mapping leaked");
    }
    Ok(())
}

#[test]
fn failed_bind_mid_call_releases_earlier_mappings() -> Result<()> {
    let binder = Arc::new(CountingBinder::failing_on(2));
    let device = device_with(binder.clone());
    let model = device.prepare_model(
        TWO_INPUT_GRAPH.as_bytes(),
        ModelFormat::Graph,
        &ModelConfig::default(),
    )?;
    let a = region_with(&[1.0, 2.0, 3.0, 4.0])?;
    let b = region_with(&[1.0, 2.0, 3.0, 4.0])?;
    let c = empty_region(16)?;

    let err = model
        .run(
            &[
                f32_tensor(&[2, 2], a.descriptor()),
                f32_tensor(&[2, 2], b.descriptor()),
            ],
            &[f32_tensor(&[2, 2], c.descriptor())],
        )
        .err();

    assert_eq!(err.map(|e| e.status()), Some(Status::InvalidBuffer));
    assert_eq!(binder.binds(), 2);
    assert_eq!(binder.live(), 0);
    assert_eq!(c.as_slice(), &[0u8; 16]);
    Ok(())
}

#[test]
fn predict_failure_is_failed_and_releases_mappings() -> Result<()> {
    let binder = SharedMemoryBinder::new();
    let coordinator = ExecutionCoordinator::new(
        Box::new(FailingModel::new()),
        Arc::new(binder.clone()),
        DimRange::DEFAULT,
    );
    let x = region_with(&[1.0, 2.0])?;
    let y = empty_region(8)?;

    let err = coordinator
        .run(
            &[f32_tensor(&[2], x.descriptor())],
            &[f32_tensor(&[2], y.descriptor())],
        )
        .err();

    assert_eq!(err.map(|e| e.status()), Some(Status::Failed));
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn context_walks_the_run_states() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;
    let s = empty_region(8)?;

    let mut ctx = model.context();
    assert_eq!(ctx.state(), RunState::Start);
    model.run_in(
        &mut ctx,
        &[f32_tensor(&[2, 3], x.descriptor())],
        &[
            f32_tensor(&[2, 3], y.descriptor()),
            f32_tensor(&[2], s.descriptor()),
        ],
    )?;
    assert_eq!(ctx.state(), RunState::Materialized);
    assert_eq!(ctx.live_mappings(), 3);
    assert_eq!(binder.live_mappings(), 3);

    ctx.reset();
    assert_eq!(ctx.state(), RunState::Reset);
    assert_eq!(ctx.live_mappings(), 0);
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn dropped_context_releases_mappings() -> Result<()> {
    let (model, binder) = prepare(STATIC_GRAPH)?;
    let x = region_with(&INPUT)?;
    let y = empty_region(24)?;
    let s = empty_region(8)?;

    {
        let mut ctx = model.context();
        model.run_in(
            &mut ctx,
            &[f32_tensor(&[2, 3], x.descriptor())],
            &[
                f32_tensor(&[2, 3], y.descriptor()),
                f32_tensor(&[2], s.descriptor()),
            ],
        )?;
        assert_eq!(binder.live_mappings(), 3);
    }
    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

#[test]
fn contexts_on_one_model_run_concurrently() -> Result<()> {
    let (model, binder) = prepare(TWO_INPUT_GRAPH)?;

    std::thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let model = &model;
                scope.spawn(move || -> Result<Vec<f32>> {
                    let base = i as f32;
                    let a = region_with(&[base, base, base, base])?;
                    let b = region_with(&[1.0, 2.0, 3.0, 4.0])?;
                    let c = empty_region(16)?;
                    for _ in 0..8 {
                        model.run(
                            &[
                                f32_tensor(&[2, 2], a.descriptor()),
                                f32_tensor(&[2, 2], b.descriptor()),
                            ],
                            &[f32_tensor(&[2, 2], c.descriptor())],
                        )?;
                    }
                    Ok(read_f32(c.as_slice()))
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let values = match handle.join() {
                Ok(values) => values?,
                Err(_) => bail!("worker {i} panicked"),
            };
            let base = i as f32;
            assert_eq!(values, vec![base + 1.0, base + 2.0, base + 3.0, base + 4.0]);
        }
        Ok(())
    })?;

    assert_eq!(binder.live_mappings(), 0);
    Ok(())
}

mod doubles {
    use anyhow::{bail, Result};
    use devport_core::{
        CompiledModel, DType, IOName, Layout, ModelSpec, OutputTensor, Shape, TensorSpec,
        TensorView,
    };

    /// Static `[2] -> [2]` model whose `predict` always fails.
    pub struct FailingModel {
        spec: ModelSpec,
    }

    impl FailingModel {
        pub fn new() -> Self {
            let spec = |name: &str| TensorSpec {
                name: IOName(name.to_string()),
                dtype: DType::F32,
                layout: Layout::None,
                dims: vec![Some(2)],
            };
            Self {
                spec: ModelSpec {
                    inputs: vec![spec("x")],
                    outputs: vec![spec("y")],
                },
            }
        }
    }

    impl CompiledModel for FailingModel {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        fn resize(&mut self, _shapes: &[Shape]) -> Result<()> {
            bail!("static model")
        }

        fn predict(
            &mut self,
            _inputs: &[TensorView<'_>],
            _outputs: &mut [Option<&mut [u8]>],
        ) -> Result<Vec<OutputTensor>> {
            bail!("device fault")
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            bail!("not serializable")
        }
    }
}
