use crate::{DType, Layout, Shape};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IOName(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub layout: Layout,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(Option::is_none)
    }

    /// The fully resolved shape, if no dimension is dynamic.
    pub fn concrete_shape(&self) -> Option<Shape> {
        self.dims
            .iter()
            .copied()
            .collect::<Option<Vec<_>>>()
            .map(|dims| Shape::from_slice(&dims))
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.concrete_shape().map(|s| s.byte_len(self.dtype))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    /// A model is dynamic when any declared input dimension is unresolved.
    pub fn is_dynamic(&self) -> bool {
        self.inputs.iter().any(TensorSpec::is_dynamic)
    }
}
