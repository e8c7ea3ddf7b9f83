//! Shared-buffer binding.
//!
//! This module is the only place that maps or unmaps shared memory. A
//! [`MappedBuffer`] owns its mapping; `unbind` consumes it, so a mapping is
//! released exactly once and cannot be touched afterwards.

use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use devport_core::{BufferDescriptor, DevportError, DevportResult, SharedMemoryHandle};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A process-local view of `[offset, offset + length)` of a shared object.
pub struct MappedBuffer {
    mapping: Mapping,
    handle: Option<RawFd>,
    live: Option<Arc<AtomicUsize>>,
}

impl MappedBuffer {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> Access {
        match self.mapping {
            Mapping::ReadOnly(_) => Access::ReadOnly,
            Mapping::ReadWrite(_) => Access::ReadWrite,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::ReadOnly(map) => &map[..],
            Mapping::ReadWrite(map) => &map[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> DevportResult<&mut [u8]> {
        match &mut self.mapping {
            Mapping::ReadWrite(map) => Ok(&mut map[..]),
            Mapping::ReadOnly(_) => Err(DevportError::InvalidBuffer(
                "buffer was bound read-only".to_string(),
            )),
        }
    }

    /// Unmaps the region. The caller's handle is left untouched.
    pub fn unbind(self) {}
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::AcqRel);
        }
        trace!(handle = ?self.handle, len = self.as_slice().len(), "unbound shared buffer");
    }
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("handle", &self.handle)
            .field("len", &self.len())
            .field("access", &self.access())
            .finish()
    }
}

/// Maps wire descriptors into this process.
pub trait BufferBinder: Send + Sync {
    fn bind(&self, desc: &BufferDescriptor, access: Access) -> DevportResult<MappedBuffer>;
}

/// Binder over real shared-memory handles.
#[derive(Clone, Debug, Default)]
pub struct SharedMemoryBinder {
    live: Arc<AtomicUsize>,
}

impl SharedMemoryBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings created by this binder that are still bound.
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl BufferBinder for SharedMemoryBinder {
    fn bind(&self, desc: &BufferDescriptor, access: Access) -> DevportResult<MappedBuffer> {
        if desc.length == 0 {
            return Err(DevportError::InvalidParameter(
                "buffer length is zero".to_string(),
            ));
        }
        let fd = desc
            .handle
            .borrow()
            .ok_or_else(|| DevportError::InvalidBuffer("buffer handle is NONE".to_string()))?;
        if !desc.in_bounds() {
            return Err(DevportError::InvalidBuffer(format!(
                "window {}+{} exceeds capacity {}",
                desc.offset, desc.length, desc.capacity
            )));
        }

        let size = object_size(fd)?;
        if u64::from(desc.capacity) > size {
            return Err(DevportError::InvalidBuffer(format!(
                "capacity {} exceeds shared object size {size}",
                desc.capacity
            )));
        }

        let mut opts = MmapOptions::new();
        opts.offset(u64::from(desc.offset)).len(desc.length as usize);
        // SAFETY: the window lies inside the object (checked above). The peer
        // may write concurrently; contents are only ever copied through slices.
        let mapping = match access {
            Access::ReadOnly => unsafe { opts.map(&fd) }.map(Mapping::ReadOnly),
            Access::ReadWrite => unsafe { opts.map_mut(&fd) }.map(Mapping::ReadWrite),
        }
        .map_err(|e| DevportError::InvalidBuffer(format!("failed to map shared buffer: {e}")))?;

        self.live.fetch_add(1, Ordering::AcqRel);
        let handle = desc.handle.raw();
        trace!(?handle, offset = desc.offset, len = desc.length, ?access, "bound shared buffer");

        Ok(MappedBuffer {
            mapping,
            handle,
            live: Some(Arc::clone(&self.live)),
        })
    }
}

fn object_size(fd: BorrowedFd<'_>) -> DevportResult<u64> {
    let file = fd
        .try_clone_to_owned()
        .map(File::from)
        .map_err(|e| DevportError::InvalidBuffer(format!("unusable buffer handle: {e}")))?;
    let meta = file
        .metadata()
        .map_err(|e| DevportError::InvalidBuffer(format!("failed to stat buffer handle: {e}")))?;
    Ok(meta.len())
}

/// A shared-memory object created by this process, mapped read-write for its
/// whole lifetime.
pub struct SharedRegion {
    handle: SharedMemoryHandle,
    map: MmapMut,
    len: u32,
}

impl SharedRegion {
    /// Creates an anonymous object of `len` bytes under `dir`.
    pub fn create(len: u32, dir: &Path) -> DevportResult<Self> {
        if len == 0 {
            return Err(DevportError::InvalidParameter(
                "cannot allocate a zero-length buffer".to_string(),
            ));
        }
        let file = tempfile::tempfile_in(dir).map_err(|e| {
            DevportError::OutOfMemory(format!("failed to create shared object in {dir:?}: {e}"))
        })?;
        file.set_len(u64::from(len)).map_err(|e| {
            DevportError::OutOfMemory(format!("failed to size shared object to {len}: {e}"))
        })?;
        // SAFETY: the file was just created and is only shared through `handle`.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| DevportError::Failed(format!("failed to map shared object: {e}")))?;

        Ok(Self {
            handle: SharedMemoryHandle::from_owned(OwnedFd::from(file)),
            map,
            len,
        })
    }

    pub fn handle(&self) -> &SharedMemoryHandle {
        &self.handle
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descriptor over the whole object, sharing this region's handle.
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor::whole(self.handle.clone(), self.len)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("handle", &self.handle.raw())
            .field("len", &self.len)
            .finish()
    }
}
