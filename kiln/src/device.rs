use crate::{binding::*, error::*, sbt::*, shader::*, usage::*};

/// Lifetime class of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Host writable, device readable, written once before a copy.
    Upload,
    /// Device local, only written by device commands.
    Device,
    /// Device writable, host readable after a completed copy.
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: usize,
    pub memory: MemoryClass,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn new(size: usize, memory: MemoryClass, usage: BufferUsage) -> Self {
        Self { size, memory, usage }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba32Float,
    R32Uint,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8Srgb | TextureFormat::R32Uint => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
        }
    }

    pub fn row_bytes(&self) -> usize {
        (self.width as usize) * self.format.bytes_per_pixel()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.row_bytes() * (self.height as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub size: usize,
}

impl BufferCopyRegion {
    pub fn whole(size: usize) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    /// Alignment of buffer row pitch when copying to or from textures.
    pub texture_row_pitch_alignment: u32,
    /// Element stride of 3-component data in global scene buffers, 12 or 16.
    pub vec3_stride: u32,
}

/// Identity of a device object, stable for the lifetime of the handle.
pub trait DeviceResource {
    fn uid(&self) -> u64;
}

pub trait DeviceBuffer: DeviceResource {
    fn desc(&self) -> &BufferDesc;
}

pub trait DeviceTexture: DeviceResource {
    fn desc(&self) -> &TextureDesc;
}

pub trait DeviceAccel: DeviceResource {
    /// Bytes of device memory owned by this structure.
    fn size(&self) -> u64;

    /// Value written into instance records to reference this structure.
    fn device_address(&self) -> u64;
}

/// Triangle input to a bottom level build, indices are `u32` triples.
pub struct TriangleGeometryInput<'a, B> {
    pub vertices: &'a B,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub indices: &'a B,
    pub triangle_count: u32,
}

/// Result of a build, the scratch buffer is only needed until the build has completed.
pub struct AccelBuild<A, B> {
    pub accel: A,
    pub scratch: B,
}

/// One graphics API able to run the ray tracing pipeline.
///
/// Every command-submitting method blocks until the device has finished the work, so
/// resources may be read or released as soon as the call returns.
pub trait Device {
    type Buffer: DeviceBuffer;
    type Texture: DeviceTexture;
    type Accel: DeviceAccel;
    type BindingTable;
    type Pipeline;

    fn name(&self) -> &str;

    fn limits(&self) -> &DeviceLimits;

    fn create_buffer(&self, desc: &BufferDesc, what: &'static str) -> Result<Self::Buffer>;

    /// Writes into an upload buffer.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: usize, data: &[u8]) -> Result<()>;

    /// Reads from a readback buffer.
    fn read_buffer(&self, buffer: &Self::Buffer, offset: usize, data: &mut [u8]) -> Result<()>;

    fn copy_buffer(&self, src: &Self::Buffer, dst: &Self::Buffer, regions: &[BufferCopyRegion]) -> Result<()>;

    fn create_texture(&self, desc: &TextureDesc, what: &'static str) -> Result<Self::Texture>;

    fn copy_buffer_to_texture(&self, src: &Self::Buffer, row_pitch: usize, dst: &Self::Texture) -> Result<()>;

    fn copy_texture_to_buffer(&self, src: &Self::Texture, dst: &Self::Buffer, row_pitch: usize) -> Result<()>;

    /// Builds with compaction allowed, the result must be compacted before use.
    fn build_bottom_level(
        &self,
        geometries: &[TriangleGeometryInput<'_, Self::Buffer>],
    ) -> Result<AccelBuild<Self::Accel, Self::Buffer>>;

    fn query_compacted_size(&self, accel: &Self::Accel) -> Result<u64>;

    fn compact(&self, accel: &Self::Accel, compacted_size: u64) -> Result<Self::Accel>;

    /// Builds over `instance_count` records of `AccelerationStructureInstance`.
    fn build_top_level(
        &self,
        instances: &Self::Buffer,
        instance_count: u32,
    ) -> Result<AccelBuild<Self::Accel, Self::Buffer>>;

    /// Ray tracing pipeline plus the tonemap pass, both using `layout`.
    fn create_pipeline(&self, layout: &BindingLayout, shaders: &dyn ShaderLibrary) -> Result<Self::Pipeline>;

    /// Handles for every `ShaderGroup` in order, `shader_group_handle_size` bytes each.
    fn shader_group_handles(&self, pipeline: &Self::Pipeline) -> Result<Vec<u8>>;

    fn create_binding_table(
        &self,
        pipeline: &Self::Pipeline,
        desc: &BindingTableDesc<'_, Self>,
    ) -> Result<Self::BindingTable>;

    /// Traces one ray generation invocation per pixel, bracketed by timestamps.
    fn dispatch_rays(
        &self,
        pipeline: &Self::Pipeline,
        bindings: &Self::BindingTable,
        shader_binding_table: &Self::Buffer,
        sbt_layout: &ShaderBindingLayout,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Converts the denoised output to the display format of the render target.
    fn dispatch_tonemap(
        &self,
        pipeline: &Self::Pipeline,
        bindings: &Self::BindingTable,
        width: u32,
        height: u32,
    ) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;

    /// Milliseconds between the timestamps of the last dispatch, if the device has them.
    fn resolve_timestamps(&self) -> Result<Option<f64>>;
}
