use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    I8,
    U8,
    Bool,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }
}

/// Memory layout tag carried on the wire next to the element type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Layout {
    #[default]
    None,
    Nchw,
    Nhwc,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
    pub fn byte_len(&self, dtype: DType) -> usize {
        self.numel() * dtype.byte_size()
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Dimensions as they travel on the wire.
    pub fn to_wire(&self) -> Vec<i32> {
        self.0
            .iter()
            .map(|&d| i32::try_from(d).unwrap_or(i32::MAX))
            .collect()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// Read-only input handed to an engine for one `predict` call.
///
/// `data` borrows caller memory (usually a shared mapping), so the engine
/// cannot keep it past the call.
#[derive(Clone, Copy, Debug)]
pub struct TensorView<'a> {
    pub dtype: DType,
    pub shape: &'a Shape,
    pub data: &'a [u8],
}

/// Where the engine put an output's bytes.
#[derive(Clone, Debug)]
pub enum OutputData {
    /// Written straight into the output slot supplied to `predict`.
    InPlace,
    /// Engine-owned storage; the caller copies it out.
    Owned(Bytes),
}

#[derive(Clone, Debug)]
pub struct OutputTensor {
    pub dtype: DType,
    pub shape: Shape,
    pub data: OutputData,
}

impl OutputTensor {
    pub fn owned(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            dtype,
            shape,
            data: OutputData::Owned(bytes),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.shape.byte_len(self.dtype)
    }
}
