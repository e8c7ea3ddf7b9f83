//! Status-coded driver interface, shared by both protocol revisions.
//!
//! The revisions differ in how insufficient output buffers are reported, in
//! status granularity, and in whether the dimension-range query exists.
//! Those differences live in one capability table instead of two copies of
//! the interface.

use std::str::FromStr;

use anyhow::bail;
use devport_core::{
    Backend, BufferDescriptor, DevportError, DevportResult, ModelConfig, ModelFormat, Status,
    TensorDescriptor,
};

use tracing::warn;

use crate::device::DeviceService;
use crate::prepared::PreparedModel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterfaceVersion {
    V1_0,
    #[default]
    V2_0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceCapabilities {
    /// `run` reports one insufficiency flag per output instead of one flag
    /// plus `InsufficientBuffer`.
    pub per_output_insufficiency: bool,
    /// Shape, dimension-range and buffer errors keep their own status codes.
    pub fine_grained_status: bool,
    pub dim_range_query: bool,
}

const VERSION_TABLE: [(InterfaceVersion, InterfaceCapabilities); 2] = [
    (
        InterfaceVersion::V1_0,
        InterfaceCapabilities {
            per_output_insufficiency: true,
            fine_grained_status: false,
            dim_range_query: false,
        },
    ),
    (
        InterfaceVersion::V2_0,
        InterfaceCapabilities {
            per_output_insufficiency: false,
            fine_grained_status: true,
            dim_range_query: true,
        },
    ),
];

impl InterfaceVersion {
    pub fn numbers(self) -> (u32, u32) {
        match self {
            InterfaceVersion::V1_0 => (1, 0),
            InterfaceVersion::V2_0 => (2, 0),
        }
    }

    pub fn capabilities(self) -> InterfaceCapabilities {
        VERSION_TABLE
            .iter()
            .find(|(version, _)| *version == self)
            .map(|(_, caps)| *caps)
            .unwrap_or(VERSION_TABLE[VERSION_TABLE.len() - 1].1)
    }
}

impl FromStr for InterfaceVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim_start_matches(['v', 'V']) {
            "1" | "1.0" => Ok(InterfaceVersion::V1_0),
            "2" | "2.0" => Ok(InterfaceVersion::V2_0),
            other => bail!("unknown interface version: {other} (expected 1.0 or 2.0)"),
        }
    }
}

impl InterfaceCapabilities {
    pub fn status_of(&self, err: &DevportError) -> Status {
        let status = err.status();
        if self.fine_grained_status {
            return status;
        }
        match status {
            Status::InvalidShape | Status::OutOfDimensionRange | Status::InvalidBuffer => {
                Status::InvalidParameter
            }
            other => other,
        }
    }

    fn reply<T: Default>(&self, result: DevportResult<T>) -> (T, Status) {
        match result {
            Ok(value) => (value, Status::Success),
            Err(err) => (T::default(), self.failure(&err)),
        }
    }

    fn failure(&self, err: &DevportError) -> Status {
        let status = self.status_of(err);
        warn!(error = %err, %status, "driver call failed");
        status
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufferInsufficiency {
    PerOutput(Vec<bool>),
    Whole(bool),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReply {
    pub output_dims: Vec<Vec<i32>>,
    pub buffer_insufficient: BufferInsufficiency,
    pub status: Status,
}

pub struct DriverDevice<B: Backend> {
    service: DeviceService<B>,
    version: InterfaceVersion,
}

impl<B: Backend> DriverDevice<B> {
    pub fn new(service: DeviceService<B>) -> Self {
        let version = service.config().interface_version;
        Self { service, version }
    }

    pub fn version(&self) -> InterfaceVersion {
        self.version
    }

    pub fn service(&self) -> &DeviceService<B> {
        &self.service
    }

    fn caps(&self) -> InterfaceCapabilities {
        self.version.capabilities()
    }

    pub fn allocate_buffer(&self, length: u32) -> (BufferDescriptor, Status) {
        self.caps().reply(self.service.allocate_buffer(length))
    }

    pub fn release_buffer(&self, desc: &BufferDescriptor) -> Status {
        self.caps().reply(self.service.release_buffer(desc)).1
    }

    pub fn get_supported_operation(&self, model: &[u8], format: ModelFormat) -> (Vec<bool>, Status) {
        self.caps().reply(self.service.supported_operations(model, format))
    }

    pub fn prepare_model(
        &self,
        model: &[u8],
        format: ModelFormat,
        config: &ModelConfig,
    ) -> (Option<DriverModel>, Status) {
        self.wrap(self.service.prepare_model(model, format, config))
    }

    pub fn prepare_model_from_cache(
        &self,
        cache: &[BufferDescriptor],
        config: &ModelConfig,
    ) -> (Option<DriverModel>, Status) {
        self.wrap(self.service.prepare_model_from_cache(cache, config))
    }

    fn wrap(&self, result: DevportResult<PreparedModel>) -> (Option<DriverModel>, Status) {
        match result {
            Ok(model) => (
                Some(DriverModel {
                    model,
                    caps: self.caps(),
                }),
                Status::Success,
            ),
            Err(err) => (None, self.caps().failure(&err)),
        }
    }
}

pub struct DriverModel {
    model: PreparedModel,
    caps: InterfaceCapabilities,
}

impl DriverModel {
    pub fn prepared(&self) -> &PreparedModel {
        &self.model
    }

    pub fn run(&self, inputs: &[TensorDescriptor], outputs: &[TensorDescriptor]) -> RunReply {
        match self.model.run(inputs, outputs) {
            Ok(out) if self.caps.per_output_insufficiency => RunReply {
                output_dims: out.output_dims,
                buffer_insufficient: BufferInsufficiency::PerOutput(out.insufficient),
                status: Status::Success,
            },
            Ok(out) => {
                let insufficient = out.any_insufficient();
                RunReply {
                    output_dims: out.output_dims,
                    buffer_insufficient: BufferInsufficiency::Whole(insufficient),
                    status: if insufficient {
                        Status::InsufficientBuffer
                    } else {
                        Status::Success
                    },
                }
            }
            Err(err) => RunReply {
                output_dims: Vec::new(),
                buffer_insufficient: if self.caps.per_output_insufficiency {
                    BufferInsufficiency::PerOutput(Vec::new())
                } else {
                    BufferInsufficiency::Whole(false)
                },
                status: self.caps.status_of(&err),
            },
        }
    }

    pub fn export_model_cache(&self, out: &mut Vec<BufferDescriptor>) -> Status {
        self.caps.reply(self.model.export_model_cache(out)).1
    }

    pub fn get_input_dim_ranges(&self) -> (Vec<Vec<u32>>, Vec<Vec<u32>>, Status) {
        if !self.caps.dim_range_query {
            return (Vec::new(), Vec::new(), Status::Unsupported);
        }
        let ranges = self.model.input_dim_ranges();
        (ranges.min, ranges.max, Status::Success)
    }
}
