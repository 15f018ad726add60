use super::{context::*, descriptor::*};
use crate::{binding::*, error::*, sbt::*, shader::*};
use arrayvec::ArrayVec;
use bytemuck::Contiguous;
use log::debug;
use spark::{vk, Builder};
use std::{ffi::CStr, mem};

fn shader_entry_name() -> &'static CStr {
    // every module is compiled with a plain "main" entry
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

struct ShaderModules {
    context: SharedContext,
    modules: ArrayVec<vk::ShaderModule, { PIPELINE_ENTRY_POINTS.len() }>,
}

impl ShaderModules {
    fn load(context: &SharedContext, shaders: &dyn ShaderLibrary) -> Result<Self> {
        if shaders.format() != ShaderFormat::Spirv {
            return Err(Error::Pipeline(format!(
                "Vulkan needs SPIR-V shaders, library provides {:?}",
                shaders.format()
            )));
        }
        let mut result = Self {
            context: SharedContext::clone(context),
            modules: ArrayVec::new(),
        };
        for entry_point in PIPELINE_ENTRY_POINTS.iter() {
            let words = shaders.load(entry_point)?.spirv_words()?;
            let shader_module_create_info = vk::ShaderModuleCreateInfo {
                code_size: words.len() * mem::size_of::<u32>(),
                p_code: words.as_ptr(),
                ..Default::default()
            };
            let module = unsafe { context.device.create_shader_module(&shader_module_create_info, None) }
                .map_err(|err| Error::Pipeline(format!("{}: {}", entry_point, err)))?;
            debug!("loaded shader module {}", entry_point);
            result.modules.push(module);
        }
        Ok(result)
    }

    fn get(&self, entry_point: &str) -> vk::ShaderModule {
        let index = PIPELINE_ENTRY_POINTS
            .iter()
            .position(|&name| name == entry_point)
            .unwrap_or(0);
        self.modules[index]
    }
}

impl Drop for ShaderModules {
    fn drop(&mut self) {
        for module in self.modules.iter() {
            unsafe { self.context.device.destroy_shader_module(Some(*module), None) };
        }
    }
}

/// Ray tracing pipeline and tonemap compute pipeline sharing one descriptor set layout.
pub struct VulkanPipeline {
    context: SharedContext,
    uid: u64,
    layout: BindingLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    ray_tracing: vk::Pipeline,
    tonemap: vk::Pipeline,
}

fn create_pipelines(
    context: &SharedContext,
    modules: &ShaderModules,
    pipeline_layout: vk::PipelineLayout,
) -> Result<(vk::Pipeline, vk::Pipeline)> {
    let device = &context.device;
    let pipeline_error = |err: vk::Result| Error::Pipeline(err.to_string());

    let stage = |stage, entry_point| vk::PipelineShaderStageCreateInfo {
        stage,
        module: Some(modules.get(entry_point)),
        p_name: shader_entry_name().as_ptr(),
        ..Default::default()
    };
    let shader_stage_create_info = [
        stage(vk::ShaderStageFlags::RAYGEN_KHR, RAYGEN_ENTRY),
        stage(vk::ShaderStageFlags::MISS_KHR, MISS_ENTRY),
        stage(vk::ShaderStageFlags::MISS_KHR, OCCLUSION_MISS_ENTRY),
        stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, CLOSEST_HIT_ENTRY),
    ];

    // stage index matches the group index
    let shader_group_create_info: ArrayVec<_, { ShaderGroup::COUNT }> = (0..ShaderGroup::COUNT)
        .filter_map(ShaderGroup::from_integer)
        .map(|group| {
            let index = group.into_integer() as u32;
            match group {
                ShaderGroup::RayGenerator | ShaderGroup::Miss | ShaderGroup::OcclusionMiss => {
                    vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        general_shader: index,
                        closest_hit_shader: vk::SHADER_UNUSED_KHR,
                        any_hit_shader: vk::SHADER_UNUSED_KHR,
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    }
                }
                ShaderGroup::ClosestHit => vk::RayTracingShaderGroupCreateInfoKHR {
                    ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                    general_shader: vk::SHADER_UNUSED_KHR,
                    closest_hit_shader: index,
                    any_hit_shader: vk::SHADER_UNUSED_KHR,
                    intersection_shader: vk::SHADER_UNUSED_KHR,
                    ..Default::default()
                },
            }
        })
        .collect();

    // closest hit traces occlusion rays
    let pipeline_create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .p_stages(&shader_stage_create_info)
        .p_groups(&shader_group_create_info)
        .layout(pipeline_layout)
        .max_pipeline_ray_recursion_depth(2);
    let ray_tracing =
        unsafe { device.create_ray_tracing_pipelines_khr_single(None, None, &pipeline_create_info, None) }
            .map_err(pipeline_error)?;

    let pipeline_create_info = vk::ComputePipelineCreateInfo {
        stage: stage(vk::ShaderStageFlags::COMPUTE, TONEMAP_ENTRY),
        layout: Some(pipeline_layout),
        ..Default::default()
    };
    match unsafe { device.create_compute_pipelines_single(None, &pipeline_create_info, None) } {
        Ok(tonemap) => Ok((ray_tracing, tonemap)),
        Err(err) => {
            unsafe { device.destroy_pipeline(Some(ray_tracing), None) };
            Err(pipeline_error(err))
        }
    }
}

impl VulkanPipeline {
    pub(crate) fn new(context: &SharedContext, layout: &BindingLayout, shaders: &dyn ShaderLibrary) -> Result<Self> {
        let modules = ShaderModules::load(context, shaders)?;
        let device = &context.device;

        let descriptor_set_layout = create_descriptor_set_layout(context, layout)?;
        let pipeline_layout = match unsafe { device.create_pipeline_layout_from_ref(&descriptor_set_layout) } {
            Ok(pipeline_layout) => pipeline_layout,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(Some(descriptor_set_layout), None) };
                return Err(Error::Pipeline(err.to_string()));
            }
        };
        let (ray_tracing, tonemap) = match create_pipelines(context, &modules, pipeline_layout) {
            Ok(pipelines) => pipelines,
            Err(err) => {
                unsafe {
                    device.destroy_pipeline_layout(Some(pipeline_layout), None);
                    device.destroy_descriptor_set_layout(Some(descriptor_set_layout), None);
                }
                return Err(err);
            }
        };

        Ok(Self {
            context: SharedContext::clone(context),
            uid: context.allocate_handle_uid(),
            layout: layout.clone(),
            descriptor_set_layout,
            pipeline_layout,
            ray_tracing,
            tonemap,
        })
    }

    pub(crate) fn uid(&self) -> u64 {
        self.uid
    }

    pub(crate) fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    pub(crate) fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub(crate) fn ray_tracing(&self) -> vk::Pipeline {
        self.ray_tracing
    }

    pub(crate) fn tonemap(&self) -> vk::Pipeline {
        self.tonemap
    }

    pub(crate) fn shader_group_handles(&self) -> Result<Vec<u8>> {
        let handle_size = self.context.ray_tracing_properties.shader_group_handle_size as usize;
        let mut handle_data = vec![0u8; ShaderGroup::COUNT * handle_size];
        unsafe {
            self.context.device.get_ray_tracing_shader_group_handles_khr(
                self.ray_tracing,
                0,
                ShaderGroup::COUNT as u32,
                &mut handle_data,
            )
        }
        .map_err(|err| Error::Pipeline(format!("shader group handles: {}", err)))?;
        Ok(handle_data)
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_pipeline(Some(self.tonemap), None);
            device.destroy_pipeline(Some(self.ray_tracing), None);
            device.destroy_pipeline_layout(Some(self.pipeline_layout), None);
            device.destroy_descriptor_set_layout(Some(self.descriptor_set_layout), None);
        }
    }
}
