use super::context::*;
use crate::error::*;
use log::warn;
use spark::vk;
use std::slice;

/// Single command buffer that is recorded, submitted and waited on per call.
pub(crate) struct CommandContext {
    context: SharedContext,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl CommandContext {
    pub fn new(context: &SharedContext) -> Result<Self> {
        let device = &context.device;
        let pool = {
            let command_pool_create_info = vk::CommandPoolCreateInfo {
                queue_family_index: context.queue_family_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&command_pool_create_info, None) }
                .map_err(|err| Error::DeviceCreation(format!("command pool: {}", err)))?
        };
        let cmd = {
            let command_buffer_allocate_info = vk::CommandBufferAllocateInfo {
                command_pool: Some(pool),
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            unsafe { device.allocate_command_buffers_single(&command_buffer_allocate_info) }
                .map_err(|err| Error::DeviceCreation(format!("command buffer: {}", err)))?
        };
        let fence = {
            let fence_create_info = vk::FenceCreateInfo::default();
            unsafe { device.create_fence(&fence_create_info, None) }
                .map_err(|err| Error::DeviceCreation(format!("fence: {}", err)))?
        };
        Ok(Self {
            context: SharedContext::clone(context),
            pool,
            cmd,
            fence,
        })
    }

    /// Records commands with `f`, submits them and blocks until they complete.
    pub fn submit<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let device = &self.context.device;
        let submit_error = |err: vk::Result| Error::Submit(err.to_string());
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) }.map_err(submit_error)?;

        let command_buffer_begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { device.begin_command_buffer(self.cmd, &command_buffer_begin_info) }.map_err(submit_error)?;

        f(self.cmd);

        // make every write visible to whatever comes next, including host reads
        let memory_barrier = vk::MemoryBarrier {
            src_access_mask: vk::AccessFlags::MEMORY_WRITE,
            dst_access_mask: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::HOST_READ,
            ..Default::default()
        };
        unsafe {
            device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                slice::from_ref(&memory_barrier),
                &[],
                &[],
            )
        };

        unsafe { device.end_command_buffer(self.cmd) }.map_err(submit_error)?;

        let submit_info = vk::SubmitInfo::builder().p_command_buffers(slice::from_ref(&self.cmd));
        unsafe { device.queue_submit(self.context.queue, slice::from_ref(&submit_info), Some(self.fence)) }
            .map_err(submit_error)?;

        let timeout_ns = 1000 * 1000 * 1000;
        loop {
            let res = unsafe { device.wait_for_fences(slice::from_ref(&self.fence), true, timeout_ns) };
            match res {
                Ok(vk::Result::SUCCESS) => break,
                Ok(vk::Result::TIMEOUT) => warn!("fence timeout, still waiting"),
                Ok(res) => return Err(Error::Fence(res.to_string())),
                Err(err) => return Err(Error::Fence(err.to_string())),
            }
        }
        unsafe { device.reset_fences(slice::from_ref(&self.fence)) }.map_err(|err| Error::Fence(err.to_string()))
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_fence(Some(self.fence), None);
            device.destroy_command_pool(Some(self.pool), None);
        }
    }
}
