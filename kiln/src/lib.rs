mod accel;
mod binding;
mod color_space;
mod config;
mod denoise;
mod device;
mod environment;
mod error;
mod frame;
mod global_buffers;
mod maths;
mod renderer;
mod resource;
mod sbt;
mod scene;
mod shader;
mod usage;

pub mod host;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use error::{Error, Result, Severity};

pub mod prelude {
    pub use crate::accel::*;
    pub use crate::binding::*;
    pub use crate::color_space::*;
    pub use crate::config::*;
    pub use crate::denoise::*;
    pub use crate::device::*;
    pub use crate::environment::*;
    pub use crate::error::*;
    pub use crate::frame::*;
    pub use crate::global_buffers::*;
    pub use crate::maths::*;
    pub use crate::renderer::*;
    pub use crate::resource::*;
    pub use crate::sbt::*;
    pub use crate::scene::*;
    pub use crate::shader::*;
    pub use crate::usage::*;

    pub use crate::host::{HostCommand, HostDevice, HostDeviceParams, MemoryUsage};
    #[cfg(feature = "vulkan")]
    pub use crate::vulkan::{ContextParams, VulkanDevice};
}
