pub mod binding;
pub mod cache;
pub mod config;
pub mod device;
pub mod execution;
pub mod prepared;
pub mod shm;
pub mod version;

pub use binding::*;
pub use cache::*;
pub use config::*;
pub use device::*;
pub use execution::*;
pub use prepared::*;
pub use shm::*;
pub use version::*;
