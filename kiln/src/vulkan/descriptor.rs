use super::{context::*, resource::*, VulkanDevice};
use crate::{binding::*, error::*};
use spark::{vk, Builder};
use std::slice;

fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub(crate) fn create_descriptor_set_layout(
    context: &SharedContext,
    layout: &BindingLayout,
) -> Result<vk::DescriptorSetLayout> {
    let bindings_vk: Vec<_> = layout
        .entries()
        .iter()
        .map(|entry| vk::DescriptorSetLayoutBinding {
            binding: entry.slot,
            descriptor_type: descriptor_type(entry.kind),
            descriptor_count: entry.count,
            stage_flags: vk::ShaderStageFlags::ALL,
            ..Default::default()
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().p_bindings(&bindings_vk);
    unsafe { context.device.create_descriptor_set_layout(&create_info, None) }
        .map_err(|err| Error::Pipeline(format!("descriptor set layout: {}", err)))
}

/// Descriptor set allocated from its own pool, written once.
pub struct VulkanBindingTable {
    context: SharedContext,
    pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_uid: u64,
}

impl VulkanBindingTable {
    pub(crate) fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub(crate) fn pipeline_uid(&self) -> u64 {
        self.pipeline_uid
    }
}

impl Drop for VulkanBindingTable {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_descriptor_pool(Some(self.pool), None) };
    }
}

pub(crate) struct NullResources<'a> {
    pub buffer: &'a VulkanBuffer,
    pub sampler: vk::Sampler,
}

pub(crate) fn create_binding_table(
    context: &SharedContext,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_uid: u64,
    layout: &BindingLayout,
    desc: &BindingTableDesc<'_, VulkanDevice>,
    null: &NullResources,
) -> Result<VulkanBindingTable> {
    let device = &context.device;
    let binding_error = |err: vk::Result| Error::Binding(err.to_string());

    let pool = {
        let pool_sizes: Vec<_> = layout
            .entries()
            .iter()
            .map(|entry| vk::DescriptorPoolSize {
                ty: descriptor_type(entry.kind),
                descriptor_count: entry.count,
            })
            .collect();
        let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .p_pool_sizes(&pool_sizes);
        unsafe { device.create_descriptor_pool(&descriptor_pool_create_info, None) }.map_err(binding_error)?
    };
    let descriptor_set = {
        let descriptor_set_allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .p_set_layouts(slice::from_ref(&descriptor_set_layout));
        match unsafe { device.allocate_descriptor_sets_single(&descriptor_set_allocate_info) } {
            Ok(descriptor_set) => descriptor_set,
            Err(err) => {
                unsafe { device.destroy_descriptor_pool(Some(pool), None) };
                return Err(binding_error(err));
            }
        }
    };
    let table = VulkanBindingTable {
        context: SharedContext::clone(context),
        pool,
        descriptor_set,
        pipeline_uid,
    };

    // reserve up front so element pointers stay valid until the update
    let descriptor_count = layout.descriptor_count();
    let mut buffer_info = Vec::with_capacity(descriptor_count);
    let mut image_info = Vec::with_capacity(descriptor_count);
    let mut accels = Vec::with_capacity(descriptor_count);
    let mut acceleration_structure_writes = Vec::with_capacity(descriptor_count);
    let mut writes = Vec::with_capacity(layout.entries().len());

    for write in desc.writes() {
        let mut descriptor_write = vk::WriteDescriptorSet {
            dst_set: Some(descriptor_set),
            dst_binding: write.slot,
            descriptor_count: write.descriptors.len() as u32,
            descriptor_type: descriptor_type(write.kind),
            ..Default::default()
        };
        match write.kind {
            DescriptorKind::AccelerationStructure => {
                let first = accels.len();
                for descriptor in write.descriptors.iter() {
                    match descriptor {
                        Descriptor::Accel(accel) => accels.push(accel.handle()),
                        _ => return Err(Error::Binding(format!("slot {} expects an accel", write.slot))),
                    }
                }
                let index = acceleration_structure_writes.len();
                acceleration_structure_writes.push(vk::WriteDescriptorSetAccelerationStructureKHR {
                    acceleration_structure_count: write.descriptors.len() as u32,
                    p_acceleration_structures: &accels[first],
                    ..Default::default()
                });
                descriptor_write.p_next = &acceleration_structure_writes[index] as *const _ as *const _;
            }
            DescriptorKind::StorageBuffer | DescriptorKind::UniformBuffer => {
                let first = buffer_info.len();
                for descriptor in write.descriptors.iter() {
                    let buffer = match descriptor {
                        Descriptor::Buffer(buffer) => *buffer,
                        Descriptor::Null => null.buffer,
                        _ => return Err(Error::Binding(format!("slot {} expects a buffer", write.slot))),
                    };
                    buffer_info.push(vk::DescriptorBufferInfo {
                        buffer: Some(buffer.handle()),
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                }
                descriptor_write.p_buffer_info = &buffer_info[first];
            }
            DescriptorKind::StorageImage | DescriptorKind::SampledImage => {
                let sampler = if write.kind == DescriptorKind::SampledImage {
                    Some(null.sampler)
                } else {
                    None
                };
                let first = image_info.len();
                for descriptor in write.descriptors.iter() {
                    let texture = match descriptor {
                        Descriptor::Texture(texture) => *texture,
                        _ => return Err(Error::Binding(format!("slot {} expects a texture", write.slot))),
                    };
                    image_info.push(vk::DescriptorImageInfo {
                        sampler,
                        image_view: Some(texture.view()),
                        image_layout: vk::ImageLayout::GENERAL,
                    });
                }
                descriptor_write.p_image_info = &image_info[first];
            }
        }
        writes.push(descriptor_write);
    }

    unsafe { device.update_descriptor_sets(&writes, &[]) };

    Ok(table)
}
