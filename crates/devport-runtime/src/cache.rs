use std::path::PathBuf;
use std::sync::Mutex;

use devport_core::{BufferDescriptor, DevportError, DevportResult};
use tracing::{debug, info};

use crate::execution::ExecutionCoordinator;
use crate::shm::SharedRegion;

/// Exports a compiled model's cache artifact into shared memory.
///
/// The artifact is built on first export and then handed out unchanged.
pub struct CacheExporter {
    artifact: Mutex<Option<SharedRegion>>,
    shm_dir: PathBuf,
}

impl CacheExporter {
    pub fn new(shm_dir: PathBuf) -> Self {
        Self {
            artifact: Mutex::new(None),
            shm_dir,
        }
    }

    /// Pushes exactly one descriptor over the artifact onto `out`, which must
    /// be empty.
    pub fn export(
        &self,
        coordinator: &ExecutionCoordinator,
        out: &mut Vec<BufferDescriptor>,
    ) -> DevportResult<()> {
        if !out.is_empty() {
            return Err(DevportError::InvalidParameter(format!(
                "model cache output must be empty, got {} descriptors",
                out.len()
            )));
        }

        let mut artifact = self
            .artifact
            .lock()
            .map_err(|_| DevportError::Failed("model cache lock poisoned".to_string()))?;

        if let Some(region) = artifact.as_ref() {
            debug!(len = region.len(), "reusing exported model cache");
            out.push(region.descriptor());
            return Ok(());
        }

        let bytes = coordinator
            .with_model(|model| model.serialize())?
            .map_err(|e| DevportError::engine("failed to serialize compiled model", e))?;
        if bytes.is_empty() {
            return Err(DevportError::Failed(
                "compiled model serialized to zero bytes".to_string(),
            ));
        }
        let len = u32::try_from(bytes.len()).map_err(|_| {
            DevportError::Failed(format!("model cache of {} bytes is too large", bytes.len()))
        })?;

        let mut region = SharedRegion::create(len, &self.shm_dir)?;
        region.as_mut_slice().copy_from_slice(&bytes);
        info!(len, "exported model cache");

        out.push(region.descriptor());
        *artifact = Some(region);
        Ok(())
    }
}
