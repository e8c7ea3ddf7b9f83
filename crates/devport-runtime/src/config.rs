use std::path::{Path, PathBuf};

use crate::binding::DimRange;
use crate::device::DeviceType;
use crate::version::InterfaceVersion;

const DEFAULT_SHM_DIR: &str = "/dev/shm";

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub device_name: String,
    pub vendor_name: String,
    pub device_type: DeviceType,
    /// Where shared objects are created. `None` picks `/dev/shm` when present,
    /// else the OS temp dir.
    pub shm_dir: Option<PathBuf>,
    /// Accepted values for a declared dynamic dimension.
    pub dynamic_dim_range: DimRange,
    pub interface_version: InterfaceVersion,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            device_name: "devport-cpu".to_string(),
            vendor_name: "devport".to_string(),
            device_type: DeviceType::Cpu,
            shm_dir: None,
            dynamic_dim_range: DimRange::DEFAULT,
            interface_version: InterfaceVersion::default(),
        }
    }
}

impl ServiceConfig {
    pub fn shm_dir(&self) -> PathBuf {
        match &self.shm_dir {
            Some(dir) => dir.clone(),
            None if Path::new(DEFAULT_SHM_DIR).is_dir() => PathBuf::from(DEFAULT_SHM_DIR),
            None => std::env::temp_dir(),
        }
    }
}
