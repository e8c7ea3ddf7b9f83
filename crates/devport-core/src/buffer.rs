//! Wire-level buffer and tensor descriptors.
//!
//! Memory crosses the driver boundary as a shared-memory handle plus a byte
//! window into it. Nothing here maps memory; that is the runtime binder's job.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::{DType, Layout};

/// Dimension value marking "resolved at call time".
pub const DYNAMIC_DIM: i32 = -1;

/// A shared-memory handle received from, or handed to, the other side of the
/// driver boundary.
///
/// The descriptor is reference counted: clones refer to the same open file
/// description and it closes when the last clone is dropped. `borrow` yields a
/// `BorrowedFd` tied to `&self`, so a mapping can never be created from a
/// handle that has already been released. [`SharedMemoryHandle::NONE`] is the
/// "no buffer" sentinel.
#[derive(Clone, Debug, Default)]
pub struct SharedMemoryHandle(Option<Arc<OwnedFd>>);

impl SharedMemoryHandle {
    pub const NONE: Self = Self(None);

    pub fn from_owned(fd: OwnedFd) -> Self {
        Self(Some(Arc::new(fd)))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn borrow(&self) -> Option<BorrowedFd<'_>> {
        self.0.as_deref().map(AsFd::as_fd)
    }

    /// Moves the handle out, leaving the sentinel behind.
    pub fn take(&mut self) -> Self {
        Self(self.0.take())
    }

    /// Numeric handle value, used as a lookup key. Not a capability.
    pub fn raw(&self) -> Option<RawFd> {
        self.0.as_deref().map(AsRawFd::as_raw_fd)
    }

    /// Drops this reference; the OS handle closes once no clone remains.
    pub fn release(self) {}
}

impl From<OwnedFd> for SharedMemoryHandle {
    fn from(fd: OwnedFd) -> Self {
        Self::from_owned(fd)
    }
}

/// `{handle, capacity, offset, length}`: a window of `length` bytes starting
/// at `offset` inside a shared object of `capacity` bytes.
#[derive(Clone, Debug, Default)]
pub struct BufferDescriptor {
    pub handle: SharedMemoryHandle,
    pub capacity: u32,
    pub offset: u32,
    pub length: u32,
}

impl BufferDescriptor {
    pub fn new(handle: SharedMemoryHandle, capacity: u32, offset: u32, length: u32) -> Self {
        Self {
            handle,
            capacity,
            offset,
            length,
        }
    }

    /// A descriptor covering a whole object.
    pub fn whole(handle: SharedMemoryHandle, capacity: u32) -> Self {
        Self::new(handle, capacity, 0, capacity)
    }

    /// One past the last byte of the window, computed without overflow.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }

    pub fn in_bounds(&self) -> bool {
        self.end() <= u64::from(self.capacity)
    }

    /// Same window, but over `length` bytes instead.
    pub fn with_length(&self, length: u32) -> Self {
        Self {
            length,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
pub struct TensorDescriptor {
    pub dtype: DType,
    pub layout: Layout,
    pub dims: Vec<i32>,
    pub data: BufferDescriptor,
}

impl TensorDescriptor {
    pub fn new(dtype: DType, layout: Layout, dims: Vec<i32>, data: BufferDescriptor) -> Self {
        Self {
            dtype,
            layout,
            dims,
            data,
        }
    }
}
