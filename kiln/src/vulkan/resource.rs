use super::context::*;
use crate::{device::*, error::*, usage::*};
use spark::vk;
use std::ptr;

fn is_out_of_memory(err: vk::Result) -> bool {
    matches!(
        err,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
    )
}

fn memory_property_flags(memory: MemoryClass) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    match memory {
        MemoryClass::Upload => (host, host),
        MemoryClass::Device => (vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::empty()),
        MemoryClass::Readback => (host | vk::MemoryPropertyFlags::HOST_CACHED, host),
    }
}

/// Destroys a freshly created handle if construction fails before ownership moves elsewhere.
struct HandleGuard<C: Copy, T: Copy> {
    context: C,
    handle: T,
    destroy: fn(C, T),
    armed: bool,
}

impl<C: Copy, T: Copy> HandleGuard<C, T> {
    fn new(context: C, handle: T, destroy: fn(C, T)) -> Self {
        Self {
            context,
            handle,
            destroy,
            armed: true,
        }
    }

    fn handle(&self) -> T {
        self.handle
    }

    fn disarm(mut self) -> T {
        self.armed = false;
        self.handle
    }
}

impl<C: Copy, T: Copy> Drop for HandleGuard<C, T> {
    fn drop(&mut self) {
        if self.armed {
            (self.destroy)(self.context, self.handle);
        }
    }
}

/// Dedicated allocation of memory for a single resource.
pub(crate) struct MemoryBlock {
    context: SharedContext,
    mem: vk::DeviceMemory,
}

impl MemoryBlock {
    fn new(
        context: &SharedContext,
        mem_req: &vk::MemoryRequirements,
        memory: MemoryClass,
        what: &'static str,
    ) -> Result<Self> {
        let (preferred, required) = memory_property_flags(memory);
        let memory_type_index = context
            .get_memory_type_index(mem_req.memory_type_bits, preferred)
            .or_else(|| context.get_memory_type_index(mem_req.memory_type_bits, required))
            .ok_or(Error::OutOfMemory {
                what,
                size: mem_req.size as usize,
            })?;

        let mut flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlagsKHR::DEVICE_ADDRESS_KHR,
            ..Default::default()
        };
        let memory_allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_req.size)
            .memory_type_index(memory_type_index)
            .insert_next(&mut flags_info);
        let mem = unsafe { context.device.allocate_memory(&memory_allocate_info, None) }.map_err(|err| {
            if is_out_of_memory(err) {
                Error::OutOfMemory {
                    what,
                    size: mem_req.size as usize,
                }
            } else {
                Error::ResourceAccess(format!("{}: {}", what, err))
            }
        })?;
        Ok(Self {
            context: SharedContext::clone(context),
            mem,
        })
    }

    fn map(&self, offset: usize, size: usize) -> Result<*mut u8> {
        unsafe {
            self.context.device.map_memory(
                self.mem,
                offset as vk::DeviceSize,
                size as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map(|p| p as *mut u8)
        .map_err(|err| Error::ResourceAccess(format!("map failed: {}", err)))
    }

    fn unmap(&self) {
        unsafe { self.context.device.unmap_memory(self.mem) };
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        unsafe { self.context.device.free_memory(Some(self.mem), None) };
    }
}

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    for bit in usage.iter_set_bits() {
        flags |= match bit {
            BufferUsageBit::TRANSFER_SRC => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsageBit::TRANSFER_DST => vk::BufferUsageFlags::TRANSFER_DST,
            BufferUsageBit::UNIFORM => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsageBit::STORAGE => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferUsageBit::ACCELERATION_STRUCTURE_BUILD_INPUT => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            BufferUsageBit::ACCELERATION_STRUCTURE_STORAGE => vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            BufferUsageBit::SHADER_BINDING_TABLE => vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        };
    }
    flags
}

fn image_usage_flags(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    for bit in usage.iter_set_bits() {
        flags |= match bit {
            TextureUsageBit::TRANSFER_SRC => vk::ImageUsageFlags::TRANSFER_SRC,
            TextureUsageBit::TRANSFER_DST => vk::ImageUsageFlags::TRANSFER_DST,
            TextureUsageBit::SAMPLED => vk::ImageUsageFlags::SAMPLED,
            TextureUsageBit::STORAGE => vk::ImageUsageFlags::STORAGE,
        };
    }
    flags
}

pub(crate) fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
    }
}

pub struct VulkanBuffer {
    context: SharedContext,
    desc: BufferDesc,
    buffer: UniqueBuffer,
    device_address: vk::DeviceAddress,
    block: MemoryBlock,
}

impl VulkanBuffer {
    pub(crate) fn new(context: &SharedContext, desc: &BufferDesc, what: &'static str) -> Result<Self> {
        let device = &context.device;
        let buffer_create_info = vk::BufferCreateInfo {
            size: desc.size.max(1) as vk::DeviceSize,
            usage: buffer_usage_flags(desc.usage),
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&buffer_create_info, None) }
            .map_err(|err| Error::ResourceAccess(format!("{}: {}", what, err)))?;
        let buffer = HandleGuard::new(device, buffer, |device: &spark::Device, buffer| unsafe {
            device.destroy_buffer(Some(buffer), None)
        });
        let mem_req = unsafe { device.get_buffer_memory_requirements(buffer.handle()) };
        let block = MemoryBlock::new(context, &mem_req, desc.memory, what)?;
        unsafe { device.bind_buffer_memory(buffer.handle(), block.mem, 0) }
            .map_err(|err| Error::ResourceAccess(format!("{}: {}", what, err)))?;
        let device_address = unsafe { device.get_buffer_device_address_helper(buffer.handle()) };
        Ok(Self {
            context: SharedContext::clone(context),
            desc: *desc,
            buffer: Unique::new(buffer.disarm(), context.allocate_handle_uid()),
            device_address,
            block,
        })
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.buffer.0
    }

    pub(crate) fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.desc.size {
            return Err(Error::ResourceAccess(format!(
                "range {}..{} outside buffer of {} bytes",
                offset,
                offset + len,
                self.desc.size
            )));
        }
        Ok(())
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.desc.memory != MemoryClass::Upload {
            return Err(Error::ResourceAccess("only upload buffers are host writable".into()));
        }
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mapping = self.block.map(offset, data.len())?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), mapping, data.len()) };
        self.block.unmap();
        Ok(())
    }

    pub(crate) fn read(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        if self.desc.memory != MemoryClass::Readback {
            return Err(Error::ResourceAccess("only readback buffers are host readable".into()));
        }
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mapping = self.block.map(offset, data.len())?;
        unsafe { ptr::copy_nonoverlapping(mapping as *const u8, data.as_mut_ptr(), data.len()) };
        self.block.unmap();
        Ok(())
    }
}

impl DeviceResource for VulkanBuffer {
    fn uid(&self) -> u64 {
        self.buffer.uid()
    }
}

impl DeviceBuffer for VulkanBuffer {
    fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(Some(self.buffer.0), None) };
    }
}

/// Image plus a full view, kept in `GENERAL` layout for its whole life.
pub struct VulkanTexture {
    context: SharedContext,
    desc: TextureDesc,
    image: UniqueImage,
    view: vk::ImageView,
    _block: MemoryBlock,
}

impl VulkanTexture {
    pub(crate) fn new(context: &SharedContext, desc: &TextureDesc, what: &'static str) -> Result<Self> {
        let device = &context.device;
        let format = vk_format(desc.format);
        let image_create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::N2D,
            format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::N1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: image_usage_flags(desc.usage),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { device.create_image(&image_create_info, None) }
            .map_err(|err| Error::ResourceAccess(format!("{}: {}", what, err)))?;
        let image = HandleGuard::new(device, image, |device: &spark::Device, image| unsafe {
            device.destroy_image(Some(image), None)
        });
        let mem_req = unsafe { device.get_image_memory_requirements(image.handle()) };
        let block = MemoryBlock::new(context, &mem_req, MemoryClass::Device, what)?;
        unsafe { device.bind_image_memory(image.handle(), block.mem, 0) }
            .map_err(|err| Error::ResourceAccess(format!("{}: {}", what, err)))?;

        let image_view_create_info = vk::ImageViewCreateInfo {
            image: Some(image.handle()),
            view_type: vk::ImageViewType::N2D,
            format,
            subresource_range: color_subresource_range(),
            ..Default::default()
        };
        let view = unsafe { device.create_image_view(&image_view_create_info, None) }
            .map_err(|err| Error::ResourceAccess(format!("{}: {}", what, err)))?;
        Ok(Self {
            context: SharedContext::clone(context),
            desc: *desc,
            image: Unique::new(image.disarm(), context.allocate_handle_uid()),
            view,
            _block: block,
        })
    }

    pub(crate) fn image(&self) -> vk::Image {
        self.image.0
    }

    pub(crate) fn view(&self) -> vk::ImageView {
        self.view
    }
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl DeviceResource for VulkanTexture {
    fn uid(&self) -> u64 {
        self.image.uid()
    }
}

impl DeviceTexture for VulkanTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_image_view(Some(self.view), None);
            device.destroy_image(Some(self.image.0), None);
        }
    }
}

pub struct VulkanAccel {
    context: SharedContext,
    accel: UniqueAccel,
    device_address: vk::DeviceAddress,
    size: u64,
    _buffer: VulkanBuffer,
}

impl VulkanAccel {
    pub(crate) fn new(
        context: &SharedContext,
        accel_type: vk::AccelerationStructureTypeKHR,
        size: u64,
        what: &'static str,
    ) -> Result<Self> {
        let buffer = VulkanBuffer::new(
            context,
            &BufferDesc::new(
                size as usize,
                MemoryClass::Device,
                BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            ),
            what,
        )?;
        let device = &context.device;
        let create_info = vk::AccelerationStructureCreateInfoKHR {
            buffer: Some(buffer.handle()),
            size,
            ty: accel_type,
            ..Default::default()
        };
        let accel = unsafe { device.create_acceleration_structure_khr(&create_info, None) }
            .map_err(|err| Error::AccelBuild(format!("{}: {}", what, err)))?;
        let device_address = {
            let info = vk::AccelerationStructureDeviceAddressInfoKHR {
                acceleration_structure: Some(accel),
                ..Default::default()
            };
            unsafe { device.get_acceleration_structure_device_address_khr(&info) }
        };
        Ok(Self {
            context: SharedContext::clone(context),
            accel: Unique::new(accel, context.allocate_handle_uid()),
            device_address,
            size,
            _buffer: buffer,
        })
    }

    pub(crate) fn handle(&self) -> vk::AccelerationStructureKHR {
        self.accel.0
    }
}

impl DeviceResource for VulkanAccel {
    fn uid(&self) -> u64 {
        self.accel.uid()
    }
}

impl DeviceAccel for VulkanAccel {
    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }
}

impl Drop for VulkanAccel {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_acceleration_structure_khr(Some(self.accel.0), None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn record(destroyed: &RefCell<Vec<u32>>, handle: u32) {
        destroyed.borrow_mut().push(handle);
    }

    fn bind_fails(destroyed: &RefCell<Vec<u32>>) -> Result<u32> {
        let guard = HandleGuard::new(destroyed, 7u32, record);
        Err(Error::ResourceAccess(format!("bind failed for {}", guard.handle())))
    }

    #[test]
    fn guard_destroys_on_early_return() {
        let destroyed = RefCell::new(Vec::new());
        assert!(bind_fails(&destroyed).is_err());
        assert_eq!(*destroyed.borrow(), vec![7]);
    }

    #[test]
    fn disarmed_guard_keeps_handle() {
        let destroyed = RefCell::new(Vec::new());
        let guard = HandleGuard::new(&destroyed, 3u32, record);
        assert_eq!(guard.disarm(), 3);
        assert!(destroyed.borrow().is_empty());
    }
}
