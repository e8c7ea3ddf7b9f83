use thiserror::Error;

/// Status codes reported across the driver boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Failed = 1,
    InvalidParameter = 2,
    OutOfMemory = 3,
    InvalidShape = 4,
    OutOfDimensionRange = 5,
    InvalidBuffer = 6,
    InsufficientBuffer = 7,
    Unsupported = 8,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum DevportError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("dimension {value} at position {position} of input {index} is outside [{min}, {max}]")]
    OutOfDimensionRange {
        index: usize,
        position: usize,
        value: i32,
        min: u32,
        max: u32,
    },
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

impl DevportError {
    pub fn status(&self) -> Status {
        match self {
            DevportError::InvalidParameter(_) => Status::InvalidParameter,
            DevportError::OutOfMemory(_) => Status::OutOfMemory,
            DevportError::InvalidShape(_) => Status::InvalidShape,
            DevportError::OutOfDimensionRange { .. } => Status::OutOfDimensionRange,
            DevportError::InvalidBuffer(_) => Status::InvalidBuffer,
            DevportError::Unsupported(_) => Status::Unsupported,
            DevportError::Failed(_) => Status::Failed,
        }
    }

    /// Wraps an engine error, keeping its whole context chain.
    pub fn engine(context: &str, err: anyhow::Error) -> Self {
        DevportError::Failed(format!("{context}: {err:#}"))
    }
}

pub type DevportResult<T> = std::result::Result<T, DevportError>;
