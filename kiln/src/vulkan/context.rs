use crate::error::*;
use log::{debug, info, warn};
use spark::{vk, Builder, Device, DeviceExtensions, Instance, InstanceExtensions, Loader};
use std::{
    ffi::CStr,
    os::raw::c_void,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

unsafe extern "system" fn debug_messenger(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if let Some(data) = p_callback_data.as_ref() {
        let message = CStr::from_ptr(data.p_message);
        warn!("{}, {}: {:?}", message_severity, message_types, message);
    }
    vk::FALSE
}

pub(crate) trait DeviceExt {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    unsafe fn create_pipeline_layout_from_ref(
        &self,
        descriptor_set_layout: &vk::DescriptorSetLayout,
    ) -> spark::Result<vk::PipelineLayout>;
}

impl DeviceExt for Device {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo {
            buffer: Some(buffer),
            ..Default::default()
        };
        self.get_buffer_device_address(&info)
    }

    unsafe fn create_pipeline_layout_from_ref(
        &self,
        descriptor_set_layout: &vk::DescriptorSetLayout,
    ) -> spark::Result<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder().p_set_layouts(slice::from_ref(descriptor_set_layout));
        self.create_pipeline_layout(&create_info, None)
    }
}

trait PhysicalDeviceMemoryPropertiesExt {
    fn types(&self) -> &[vk::MemoryType];
    fn heaps(&self) -> &[vk::MemoryHeap];
}

impl PhysicalDeviceMemoryPropertiesExt for vk::PhysicalDeviceMemoryProperties {
    fn types(&self) -> &[vk::MemoryType] {
        &self.memory_types[..self.memory_type_count as usize]
    }
    fn heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_heaps[..self.memory_heap_count as usize]
    }
}

/// Handle paired with an id that is never reused, so stale handles never compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unique<T>(pub T, u64);

impl<T> Unique<T> {
    pub fn new(obj: T, uid: u64) -> Self {
        Self(obj, uid)
    }

    pub fn uid(&self) -> u64 {
        self.1
    }
}

pub type UniqueBuffer = Unique<vk::Buffer>;
pub type UniqueImage = Unique<vk::Image>;
pub type UniqueAccel = Unique<vk::AccelerationStructureKHR>;

#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    pub version: vk::Version,
    pub is_debug: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            version: vk::Version::from_raw_parts(1, 2, 0),
            is_debug: false,
        }
    }
}

pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
}

/// Headless instance and device with ray tracing enabled.
pub struct Context {
    pub instance: Instance,
    pub debug_utils_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub ray_tracing_properties: RayTracingProperties,
    pub queue_family_index: u32,
    pub queue_family_properties: vk::QueueFamilyProperties,
    pub queue: vk::Queue,
    pub device: Device,
    pub next_handle_uid: AtomicU64,
}

pub type SharedContext = Arc<Context>;

fn creation_error(what: &str) -> impl Fn(vk::Result) -> Error + '_ {
    move |err| Error::DeviceCreation(format!("{}: {}", what, err))
}

fn supports_ray_tracing(extensions: &DeviceExtensions) -> bool {
    extensions.supports_khr_acceleration_structure()
        && extensions.supports_khr_ray_tracing_pipeline()
        && extensions.supports_khr_deferred_host_operations()
}

impl Context {
    pub fn new(params: &ContextParams) -> Result<Self> {
        let instance = {
            let loader = Loader::new().map_err(|err| Error::DeviceCreation(format!("no Vulkan loader: {:?}", err)))?;
            let instance_version =
                unsafe { loader.enumerate_instance_version() }.map_err(creation_error("instance version"))?;
            info!(
                "loading instance version {} ({} supported)",
                params.version, instance_version
            );
            if instance_version < params.version {
                return Err(Error::DeviceCreation(format!(
                    "requested instance version {} is greater than the available version {}",
                    params.version, instance_version
                )));
            }

            let mut extensions = InstanceExtensions::new(params.version);
            if params.is_debug {
                extensions.enable_ext_debug_utils();
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                debug!("loading instance extension {:?}", name);
            }

            let app_info = vk::ApplicationInfo::builder()
                .p_application_name(Some(CStr::from_bytes_with_nul(b"kiln\0").map_err(|_| {
                    Error::DeviceCreation("bad application name".into())
                })?))
                .api_version(params.version);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let instance_create_info = vk::InstanceCreateInfo::builder()
                .p_application_info(Some(&app_info))
                .pp_enabled_extension_names(&extension_name_ptrs);
            unsafe { loader.create_instance(&instance_create_info, None) }.map_err(creation_error("instance"))?
        };

        let debug_utils_messenger = if params.is_debug {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_messenger),
                ..Default::default()
            };
            Some(
                unsafe { instance.create_debug_utils_messenger_ext(&create_info, None) }
                    .map_err(creation_error("debug messenger"))?,
            )
        } else {
            None
        };

        // first device exposing the ray tracing extensions
        let (physical_device, available_extensions) = {
            let physical_devices = unsafe { instance.enumerate_physical_devices_to_vec() }
                .map_err(creation_error("physical devices"))?;
            let mut selected = None;
            for &physical_device in physical_devices.iter() {
                let props = unsafe { instance.get_physical_device_properties(physical_device) };
                info!("physical device ({}): {:?}", props.device_type, unsafe {
                    CStr::from_ptr(props.device_name.as_ptr())
                });
                let extension_properties =
                    unsafe { instance.enumerate_device_extension_properties_to_vec(physical_device, None) }
                        .map_err(creation_error("device extensions"))?;
                let available = DeviceExtensions::from_properties(params.version, &extension_properties);
                if selected.is_none() && supports_ray_tracing(&available) {
                    selected = Some((physical_device, available));
                }
            }
            selected.ok_or_else(|| Error::DeviceCreation("no device supports ray tracing pipelines".into()))?
        };
        let physical_device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_version = physical_device_properties.api_version;
        if device_version < params.version {
            return Err(Error::DeviceCreation(format!(
                "requested device version {} is greater than the available version {}",
                params.version, device_version
            )));
        }

        let ray_tracing_properties = {
            let mut rtpp = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().insert_next(&mut rtpp);
            unsafe { instance.get_physical_device_properties2(physical_device, properties2.as_mut()) };
            RayTracingProperties {
                shader_group_handle_size: rtpp.shader_group_handle_size,
                shader_group_base_alignment: rtpp.shader_group_base_alignment,
                shader_group_handle_alignment: rtpp.shader_group_handle_alignment,
            }
        };

        let physical_device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        for (i, mt) in physical_device_memory_properties.types().iter().enumerate() {
            debug!("memory type {}: {}, heap {}", i, mt.property_flags, mt.heap_index);
        }
        for (i, mh) in physical_device_memory_properties.heaps().iter().enumerate() {
            debug!("heap {}: {} bytes {}", i, mh.size, mh.flags);
        }

        let (queue_family_index, queue_family_properties) =
            unsafe { instance.get_physical_device_queue_family_properties_to_vec(physical_device) }
                .iter()
                .enumerate()
                .find_map(|(index, info)| {
                    if info.queue_flags.contains(vk::QueueFlags::COMPUTE) {
                        Some((index as u32, *info))
                    } else {
                        None
                    }
                })
                .ok_or_else(|| Error::DeviceCreation("no compute queue".into()))?;

        let device = {
            let queue_priorities = [1.0];
            let device_queue_create_info = vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .p_queue_priorities(&queue_priorities);

            let enabled_features = vk::PhysicalDeviceFeatures::default();

            let mut extensions = DeviceExtensions::new(params.version);
            extensions.enable_ext_scalar_block_layout();
            extensions.enable_khr_acceleration_structure();
            extensions.enable_khr_ray_tracing_pipeline();
            if !available_extensions.supports_ext_scalar_block_layout() {
                return Err(Error::DeviceCreation("scalar block layout not supported".into()));
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                debug!("loading device extension {:?}", name);
            }

            let mut scalar_block_layout_features =
                vk::PhysicalDeviceScalarBlockLayoutFeaturesEXT::builder().scalar_block_layout(true);
            let mut buffer_device_address_features =
                vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::builder().buffer_device_address(true);
            let mut acceleration_structure_features =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
            let mut ray_tracing_pipeline_features =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let device_create_info = vk::DeviceCreateInfo::builder()
                .p_queue_create_infos(slice::from_ref(&device_queue_create_info))
                .pp_enabled_extension_names(&extension_name_ptrs)
                .p_enabled_features(Some(&enabled_features))
                .insert_next(&mut scalar_block_layout_features)
                .insert_next(&mut buffer_device_address_features)
                .insert_next(&mut acceleration_structure_features)
                .insert_next(&mut ray_tracing_pipeline_features);

            unsafe { instance.create_device(physical_device, &device_create_info, None, params.version) }
                .map_err(creation_error("device"))?
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        Ok(Self {
            instance,
            debug_utils_messenger,
            physical_device,
            physical_device_properties,
            physical_device_memory_properties,
            ray_tracing_properties,
            queue_family_index,
            queue_family_properties,
            queue,
            device,
            next_handle_uid: AtomicU64::new(1),
        })
    }

    pub fn allocate_handle_uid(&self) -> u64 {
        self.next_handle_uid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_memory_type_index(&self, type_filter: u32, property_flags: vk::MemoryPropertyFlags) -> Option<u32> {
        for (i, mt) in self.physical_device_memory_properties.types().iter().enumerate() {
            let i = i as u32;
            if (type_filter & (1 << i)) != 0 && mt.property_flags.contains(property_flags) {
                return Some(i);
            }
        }
        None
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if self.debug_utils_messenger.is_some() {
                self.instance
                    .destroy_debug_utils_messenger_ext(self.debug_utils_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
