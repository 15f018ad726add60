//! Hardware ray tracing through Vulkan, enabled with the `vulkan` feature.

mod command;
mod context;
mod descriptor;
mod pipeline;
mod query;
mod resource;

pub use context::ContextParams;
pub use descriptor::VulkanBindingTable;
pub use pipeline::VulkanPipeline;
pub use resource::{VulkanAccel, VulkanBuffer, VulkanTexture};

use crate::{binding::*, device::*, error::*, maths::*, sbt::*, shader::*, usage::*};
use command::CommandContext;
use context::*;
use descriptor::NullResources;
use log::info;
use query::TimestampQueries;
use spark::vk;
use std::{ffi::CStr, slice, sync::Mutex};

const TONEMAP_GROUP_SIZE: u32 = 8;

fn region_address(region: &ShaderBindingRegion, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: base + region.offset as vk::DeviceSize,
        stride: region.stride as vk::DeviceSize,
        size: region.size as vk::DeviceSize,
    }
}

fn accel_error(what: &'static str) -> impl Fn(vk::Result) -> Error {
    move |err| Error::AccelBuild(format!("{}: {}", what, err))
}

pub struct VulkanDevice {
    context: SharedContext,
    name: String,
    limits: DeviceLimits,
    commands: Mutex<CommandContext>,
    timestamps: Mutex<TimestampQueries>,
    null_buffer: VulkanBuffer,
    sampler: vk::Sampler,
}

impl VulkanDevice {
    pub fn new(params: &ContextParams) -> Result<Self> {
        let context = SharedContext::new(Context::new(params)?);
        let name = unsafe { CStr::from_ptr(context.physical_device_properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        info!("using device {}", name);

        let rtp = &context.ray_tracing_properties;
        let limits = DeviceLimits {
            shader_group_handle_size: rtp.shader_group_handle_size,
            shader_group_handle_alignment: rtp.shader_group_handle_alignment,
            shader_group_base_alignment: rtp.shader_group_base_alignment,
            texture_row_pitch_alignment: 4,
            vec3_stride: 12,
        };

        let commands = Mutex::new(CommandContext::new(&context)?);
        let timestamps = Mutex::new(TimestampQueries::new(&context)?);
        let null_buffer = VulkanBuffer::new(
            &context,
            &BufferDesc::new(16, MemoryClass::Device, BufferUsage::STORAGE),
            "null buffer",
        )?;
        let sampler = {
            let create_info = vk::SamplerCreateInfo {
                mag_filter: vk::Filter::LINEAR,
                min_filter: vk::Filter::LINEAR,
                address_mode_u: vk::SamplerAddressMode::REPEAT,
                address_mode_v: vk::SamplerAddressMode::REPEAT,
                address_mode_w: vk::SamplerAddressMode::REPEAT,
                ..Default::default()
            };
            unsafe { context.device.create_sampler(&create_info, None) }
                .map_err(|err| Error::DeviceCreation(format!("sampler: {}", err)))?
        };

        Ok(Self {
            context,
            name,
            limits,
            commands,
            timestamps,
            null_buffer,
            sampler,
        })
    }

    fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        self.commands.lock().unwrap().submit(f)
    }

    fn transition_to_general(&self, texture: &VulkanTexture) -> Result<()> {
        let image_memory_barrier = vk::ImageMemoryBarrier {
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: Some(texture.image()),
            subresource_range: resource::color_subresource_range(),
            ..Default::default()
        };
        self.submit(|cmd| unsafe {
            self.context.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                slice::from_ref(&image_memory_barrier),
            )
        })
    }

    fn image_copy(texture: &VulkanTexture, row_pitch: usize) -> Result<vk::BufferImageCopy> {
        let desc = texture.desc();
        let bytes_per_pixel = desc.format.bytes_per_pixel();
        if row_pitch < desc.row_bytes() || row_pitch % bytes_per_pixel != 0 {
            return Err(Error::ResourceAccess(format!(
                "row pitch {} invalid for {}x{} {:?}",
                row_pitch, desc.width, desc.height, desc.format
            )));
        }
        Ok(vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: (row_pitch / bytes_per_pixel) as u32,
            buffer_image_height: desc.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
        })
    }

    fn check_copy_size(buffer: &VulkanBuffer, texture: &VulkanTexture, row_pitch: usize) -> Result<()> {
        let required = row_pitch * (texture.desc().height as usize);
        if buffer.desc().size < required {
            return Err(Error::ResourceAccess(format!(
                "buffer of {} bytes cannot hold {} bytes of texels",
                buffer.desc().size,
                required
            )));
        }
        Ok(())
    }

    fn scratch_buffer(&self, size: vk::DeviceSize, what: &'static str) -> Result<VulkanBuffer> {
        VulkanBuffer::new(
            &self.context,
            &BufferDesc::new(size as usize, MemoryClass::Device, BufferUsage::STORAGE),
            what,
        )
    }

    fn build(
        &self,
        accel_type: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR],
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
        what: &'static str,
    ) -> Result<AccelBuild<VulkanAccel, VulkanBuffer>> {
        let device = &self.context.device;
        let first_range = ranges
            .first()
            .ok_or_else(|| Error::AccelBuild(format!("{} has no geometry", what)))?;
        let max_primitive_counts: Vec<u32> = ranges.iter().map(|range| range.primitive_count).collect();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: accel_type,
            flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: geometries.len() as u32,
            p_geometries: geometries.as_ptr(),
            ..Default::default()
        };
        let sizes = {
            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                device.get_acceleration_structure_build_sizes_khr(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    Some(max_primitive_counts.as_slice()),
                    &mut sizes,
                )
            };
            sizes
        };

        let accel = VulkanAccel::new(&self.context, accel_type, sizes.acceleration_structure_size, what)?;
        let scratch = self.scratch_buffer(sizes.build_scratch_size, "acceleration structure scratch")?;

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            dst_acceleration_structure: Some(accel.handle()),
            scratch_data: vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(),
            },
            ..build_info
        };
        // ranges are contiguous, one per geometry
        self.submit(|cmd| unsafe {
            device.cmd_build_acceleration_structures_khr(cmd, slice::from_ref(&build_info), &[first_range])
        })?;
        Ok(AccelBuild { accel, scratch })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.context.device.device_wait_idle();
            self.context.device.destroy_sampler(Some(self.sampler), None);
        }
    }
}

impl Device for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type Accel = VulkanAccel;
    type BindingTable = VulkanBindingTable;
    type Pipeline = VulkanPipeline;

    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc, what: &'static str) -> Result<VulkanBuffer> {
        VulkanBuffer::new(&self.context, desc, what)
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: usize, data: &[u8]) -> Result<()> {
        buffer.write(offset, data)
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: usize, data: &mut [u8]) -> Result<()> {
        buffer.read(offset, data)
    }

    fn copy_buffer(&self, src: &VulkanBuffer, dst: &VulkanBuffer, regions: &[BufferCopyRegion]) -> Result<()> {
        let mut copies = Vec::with_capacity(regions.len());
        for region in regions.iter() {
            if region.src_offset + region.size > src.desc().size || region.dst_offset + region.size > dst.desc().size {
                return Err(Error::ResourceAccess(format!(
                    "copy of {} bytes out of range",
                    region.size
                )));
            }
            copies.push(vk::BufferCopy {
                src_offset: region.src_offset as vk::DeviceSize,
                dst_offset: region.dst_offset as vk::DeviceSize,
                size: region.size as vk::DeviceSize,
            });
        }
        if copies.is_empty() {
            return Ok(());
        }
        self.submit(|cmd| unsafe {
            self.context
                .device
                .cmd_copy_buffer(cmd, src.handle(), dst.handle(), &copies)
        })
    }

    fn create_texture(&self, desc: &TextureDesc, what: &'static str) -> Result<VulkanTexture> {
        let texture = VulkanTexture::new(&self.context, desc, what)?;
        self.transition_to_general(&texture)?;
        Ok(texture)
    }

    fn copy_buffer_to_texture(&self, src: &VulkanBuffer, row_pitch: usize, dst: &VulkanTexture) -> Result<()> {
        let region = Self::image_copy(dst, row_pitch)?;
        Self::check_copy_size(src, dst, row_pitch)?;
        self.submit(|cmd| unsafe {
            self.context.device.cmd_copy_buffer_to_image(
                cmd,
                src.handle(),
                dst.image(),
                vk::ImageLayout::GENERAL,
                slice::from_ref(&region),
            )
        })
    }

    fn copy_texture_to_buffer(&self, src: &VulkanTexture, dst: &VulkanBuffer, row_pitch: usize) -> Result<()> {
        let region = Self::image_copy(src, row_pitch)?;
        Self::check_copy_size(dst, src, row_pitch)?;
        self.submit(|cmd| unsafe {
            self.context.device.cmd_copy_image_to_buffer(
                cmd,
                src.image(),
                vk::ImageLayout::GENERAL,
                dst.handle(),
                slice::from_ref(&region),
            )
        })
    }

    fn build_bottom_level(
        &self,
        geometries: &[TriangleGeometryInput<'_, VulkanBuffer>],
    ) -> Result<AccelBuild<VulkanAccel, VulkanBuffer>> {
        let geometries_vk: Vec<_> = geometries
            .iter()
            .map(|geometry| vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                        vertex_format: vk::Format::R32G32B32_SFLOAT,
                        vertex_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: geometry.vertices.device_address(),
                        },
                        vertex_stride: geometry.vertex_stride as vk::DeviceSize,
                        max_vertex: geometry.vertex_count.saturating_sub(1),
                        index_type: vk::IndexType::UINT32,
                        index_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: geometry.indices.device_address(),
                        },
                        ..Default::default()
                    },
                },
                flags: vk::GeometryFlagsKHR::OPAQUE,
                ..Default::default()
            })
            .collect();
        let ranges: Vec<_> = geometries
            .iter()
            .map(|geometry| vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: geometry.triangle_count,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            })
            .collect();
        self.build(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            &geometries_vk,
            &ranges,
            "bottom level acceleration structure",
        )
    }

    fn query_compacted_size(&self, accel: &VulkanAccel) -> Result<u64> {
        let device = &self.context.device;
        let query_pool = {
            let create_info = vk::QueryPoolCreateInfo {
                query_type: vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query_count: 1,
                ..Default::default()
            };
            unsafe { device.create_query_pool(&create_info, None) }.map_err(accel_error("compaction query"))?
        };
        let handle = accel.handle();
        let mut compacted_size = [0u64; 1];
        let result = self
            .submit(|cmd| unsafe {
                device.cmd_reset_query_pool(cmd, query_pool, 0, 1);
                device.cmd_write_acceleration_structures_properties_khr(
                    cmd,
                    slice::from_ref(&handle),
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool,
                    0,
                );
            })
            .and_then(|_| {
                unsafe {
                    device.get_query_pool_results(
                        query_pool,
                        0,
                        1,
                        &mut compacted_size,
                        std::mem::size_of::<u64>() as vk::DeviceSize,
                        vk::QueryResultFlags::N64 | vk::QueryResultFlags::WAIT,
                    )
                }
                .map(|_| ())
                .map_err(accel_error("compaction query"))
            });
        unsafe { device.destroy_query_pool(Some(query_pool), None) };
        result.map(|_| compacted_size[0])
    }

    fn compact(&self, accel: &VulkanAccel, compacted_size: u64) -> Result<VulkanAccel> {
        let compacted = VulkanAccel::new(
            &self.context,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            compacted_size,
            "compacted acceleration structure",
        )?;
        let copy_info = vk::CopyAccelerationStructureInfoKHR {
            src: Some(accel.handle()),
            dst: Some(compacted.handle()),
            mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
            ..Default::default()
        };
        self.submit(|cmd| unsafe {
            self.context
                .device
                .cmd_copy_acceleration_structure_khr(cmd, &copy_info)
        })?;
        Ok(compacted)
    }

    fn build_top_level(
        &self,
        instances: &VulkanBuffer,
        instance_count: u32,
    ) -> Result<AccelBuild<VulkanAccel, VulkanBuffer>> {
        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: instances.device_address(),
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        self.build(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            slice::from_ref(&geometry),
            slice::from_ref(&range),
            "top level acceleration structure",
        )
    }

    fn create_pipeline(&self, layout: &BindingLayout, shaders: &dyn ShaderLibrary) -> Result<VulkanPipeline> {
        VulkanPipeline::new(&self.context, layout, shaders)
    }

    fn shader_group_handles(&self, pipeline: &VulkanPipeline) -> Result<Vec<u8>> {
        pipeline.shader_group_handles()
    }

    fn create_binding_table(
        &self,
        pipeline: &VulkanPipeline,
        desc: &BindingTableDesc<'_, Self>,
    ) -> Result<VulkanBindingTable> {
        descriptor::create_binding_table(
            &self.context,
            pipeline.descriptor_set_layout(),
            pipeline.uid(),
            pipeline.layout(),
            desc,
            &NullResources {
                buffer: &self.null_buffer,
                sampler: self.sampler,
            },
        )
    }

    fn dispatch_rays(
        &self,
        pipeline: &VulkanPipeline,
        bindings: &VulkanBindingTable,
        shader_binding_table: &VulkanBuffer,
        sbt_layout: &ShaderBindingLayout,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if bindings.pipeline_uid() != pipeline.uid() {
            return Err(Error::Binding("binding table was built for another pipeline".into()));
        }
        if (shader_binding_table.desc().size as u32) < sbt_layout.total_size {
            return Err(Error::Submit(format!(
                "shader binding table buffer holds {} bytes, layout needs {}",
                shader_binding_table.desc().size,
                sbt_layout.total_size
            )));
        }
        let device = &self.context.device;
        let base = shader_binding_table.device_address();
        let raygen = region_address(&sbt_layout.raygen_region, base);
        let miss = region_address(&sbt_layout.miss_region, base);
        let hit = region_address(&sbt_layout.hit_region, base);
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        let descriptor_set = bindings.descriptor_set();

        let mut timestamps = self.timestamps.lock().unwrap();
        self.submit(|cmd| unsafe {
            timestamps.begin(cmd);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.ray_tracing());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.pipeline_layout(),
                0,
                slice::from_ref(&descriptor_set),
                &[],
            );
            device.cmd_trace_rays_khr(cmd, &raygen, &miss, &hit, &callable, width, height, 1);
            timestamps.end(cmd);
        })
    }

    fn dispatch_tonemap(
        &self,
        pipeline: &VulkanPipeline,
        bindings: &VulkanBindingTable,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if bindings.pipeline_uid() != pipeline.uid() {
            return Err(Error::Binding("binding table was built for another pipeline".into()));
        }
        let device = &self.context.device;
        let descriptor_set = bindings.descriptor_set();
        self.submit(|cmd| unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.tonemap());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline_layout(),
                0,
                slice::from_ref(&descriptor_set),
                &[],
            );
            device.cmd_dispatch(
                cmd,
                width.div_round_up(TONEMAP_GROUP_SIZE),
                height.div_round_up(TONEMAP_GROUP_SIZE),
                1,
            );
        })
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.context.device.device_wait_idle() }.map_err(|err| Error::Fence(err.to_string()))
    }

    fn resolve_timestamps(&self) -> Result<Option<f64>> {
        self.timestamps.lock().unwrap().resolve()
    }
}
