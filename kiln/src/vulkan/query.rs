use super::context::*;
use crate::error::*;
use spark::vk;
use std::mem;

const TIMESTAMP_COUNT: u32 = 2;

/// Pair of timestamps written around the last dispatch.
pub(crate) struct TimestampQueries {
    context: SharedContext,
    query_pool: vk::QueryPool,
    timestamp_valid_mask: u64,
    timestamp_period_ms: f64,
    written: bool,
}

impl TimestampQueries {
    pub fn new(context: &SharedContext) -> Result<Self> {
        let query_pool = {
            let create_info = vk::QueryPoolCreateInfo {
                query_type: vk::QueryType::TIMESTAMP,
                query_count: TIMESTAMP_COUNT,
                ..Default::default()
            };
            unsafe { context.device.create_query_pool(&create_info, None) }
                .map_err(|err| Error::DeviceCreation(format!("query pool: {}", err)))?
        };
        let timestamp_valid_mask = {
            let valid_bits = context.queue_family_properties.timestamp_valid_bits;
            if valid_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << valid_bits) - 1
            }
        };
        let timestamp_period_ms = (context.physical_device_properties.limits.timestamp_period as f64) / 1_000_000.0;
        Ok(Self {
            context: SharedContext::clone(context),
            query_pool,
            timestamp_valid_mask,
            timestamp_period_ms,
            written: false,
        })
    }

    pub fn begin(&mut self, cmd: vk::CommandBuffer) {
        let device = &self.context.device;
        unsafe {
            device.cmd_reset_query_pool(cmd, self.query_pool, 0, TIMESTAMP_COUNT);
            device.cmd_write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, self.query_pool, 0);
        }
    }

    pub fn end(&mut self, cmd: vk::CommandBuffer) {
        unsafe {
            self.context
                .device
                .cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, self.query_pool, 1)
        };
        self.written = true;
    }

    pub fn resolve(&self) -> Result<Option<f64>> {
        if !self.written || self.timestamp_valid_mask == 0 {
            return Ok(None);
        }
        let mut query_results = [0u64; TIMESTAMP_COUNT as usize];
        unsafe {
            self.context.device.get_query_pool_results(
                self.query_pool,
                0,
                TIMESTAMP_COUNT,
                &mut query_results,
                mem::size_of::<u64>() as vk::DeviceSize,
                vk::QueryResultFlags::N64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(|err| Error::Readback(format!("timestamps: {}", err)))?;
        let begin = query_results[0] & self.timestamp_valid_mask;
        let end = query_results[1] & self.timestamp_valid_mask;
        let ticks = end.wrapping_sub(begin) & self.timestamp_valid_mask;
        Ok(Some((ticks as f64) * self.timestamp_period_ms))
    }
}

impl Drop for TimestampQueries {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_query_pool(Some(self.query_pool), None) };
    }
}
