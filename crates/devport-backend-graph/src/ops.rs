use anyhow::{bail, ensure, Context, Result};
use devport_core::Shape;

use crate::graph::NodeDef;

pub type Dims = Vec<Option<usize>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    Identity,
    Relu,
    Scale(f32),
    Add,
    Mul,
    ReduceSum { axis: usize, keep_dims: bool },
    MatMul,
}

impl Op {
    /// `None` when the operator name is unknown to this engine.
    pub fn parse(node: &NodeDef) -> Option<Result<Self>> {
        let op = match node.op.as_str() {
            "identity" => Ok(Op::Identity),
            "relu" => Ok(Op::Relu),
            "scale" => node
                .factor
                .map(Op::Scale)
                .context("scale requires a `factor` attribute"),
            "add" => Ok(Op::Add),
            "mul" => Ok(Op::Mul),
            "reduce_sum" => node
                .axis
                .map(|axis| Op::ReduceSum {
                    axis,
                    keep_dims: node.keep_dims.unwrap_or(false),
                })
                .context("reduce_sum requires an `axis` attribute"),
            "matmul" => Ok(Op::MatMul),
            _ => return None,
        };
        Some(op)
    }

    pub fn arity(self) -> usize {
        match self {
            Op::Identity | Op::Relu | Op::Scale(_) | Op::ReduceSum { .. } => 1,
            Op::Add | Op::Mul | Op::MatMul => 2,
        }
    }

    /// Output dims from (possibly partially known) input dims.
    pub fn infer(self, inputs: &[&Dims]) -> Result<Dims> {
        match self {
            Op::Identity | Op::Relu | Op::Scale(_) => Ok(inputs[0].clone()),
            Op::Add | Op::Mul => {
                let (a, b) = (inputs[0], inputs[1]);
                ensure!(
                    a.len() == b.len(),
                    "element-wise rank mismatch: {} vs {}",
                    a.len(),
                    b.len()
                );
                a.iter()
                    .zip(b)
                    .map(|(x, y)| merge_dim(*x, *y))
                    .collect()
            }
            Op::ReduceSum { axis, keep_dims } => {
                let a = inputs[0];
                ensure!(axis < a.len(), "reduce axis {axis} out of range for rank {}", a.len());
                let mut out = a.clone();
                if keep_dims {
                    out[axis] = Some(1);
                } else {
                    out.remove(axis);
                }
                Ok(out)
            }
            Op::MatMul => {
                let (a, b) = (inputs[0], inputs[1]);
                ensure!(a.len() == 2 && b.len() == 2, "matmul expects rank-2 operands");
                merge_dim(a[1], b[0])?;
                Ok(vec![a[0], b[1]])
            }
        }
    }

    pub fn eval(self, inputs: &[(&Shape, &[f32])]) -> Result<(Shape, Vec<f32>)> {
        match self {
            Op::Identity => Ok((inputs[0].0.clone(), inputs[0].1.to_vec())),
            Op::Relu => Ok(unary(inputs[0], |x| x.max(0.0))),
            Op::Scale(factor) => Ok(unary(inputs[0], |x| x * factor)),
            Op::Add => binary(inputs[0], inputs[1], |x, y| x + y),
            Op::Mul => binary(inputs[0], inputs[1], |x, y| x * y),
            Op::ReduceSum { axis, keep_dims } => reduce_sum(inputs[0], axis, keep_dims),
            Op::MatMul => matmul(inputs[0], inputs[1]),
        }
    }
}

fn merge_dim(a: Option<usize>, b: Option<usize>) -> Result<Option<usize>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => bail!("dimension mismatch: {x} vs {y}"),
        (Some(x), _) | (_, Some(x)) => Ok(Some(x)),
        (None, None) => Ok(None),
    }
}

fn unary((shape, data): (&Shape, &[f32]), f: impl Fn(f32) -> f32) -> (Shape, Vec<f32>) {
    (shape.clone(), data.iter().map(|&x| f(x)).collect())
}

fn binary(
    (sa, a): (&Shape, &[f32]),
    (sb, b): (&Shape, &[f32]),
    f: impl Fn(f32, f32) -> f32,
) -> Result<(Shape, Vec<f32>)> {
    ensure!(sa == sb, "element-wise shape mismatch: {sa} vs {sb}");
    Ok((sa.clone(), a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()))
}

fn reduce_sum(
    (shape, data): (&Shape, &[f32]),
    axis: usize,
    keep_dims: bool,
) -> Result<(Shape, Vec<f32>)> {
    let dims = shape.dims();
    ensure!(axis < dims.len(), "reduce axis {axis} out of range for rank {}", dims.len());
    let outer: usize = dims[..axis].iter().product();
    let len = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();

    let mut out = vec![0.0f32; outer * inner];
    for o in 0..outer {
        for k in 0..len {
            let base = (o * len + k) * inner;
            for i in 0..inner {
                out[o * inner + i] += data[base + i];
            }
        }
    }

    let mut out_dims = dims.to_vec();
    if keep_dims {
        out_dims[axis] = 1;
    } else {
        out_dims.remove(axis);
    }
    Ok((Shape::from_slice(&out_dims), out))
}

fn matmul((sa, a): (&Shape, &[f32]), (sb, b): (&Shape, &[f32])) -> Result<(Shape, Vec<f32>)> {
    ensure!(sa.rank() == 2 && sb.rank() == 2, "matmul expects rank-2 operands");
    let (m, k) = (sa.dims()[0], sa.dims()[1]);
    let (k2, n) = (sb.dims()[0], sb.dims()[1]);
    ensure!(k == k2, "matmul inner dimension mismatch: {k} vs {k2}");

    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let lhs = a[i * k + p];
            for j in 0..n {
                out[i * n + j] += lhs * b[p * n + j];
            }
        }
    }
    Ok((Shape::from_slice(&[m, n]), out))
}
