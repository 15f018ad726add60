use crate::{device::*, error::*};

/// Bytes of one accumulated pixel when denoising: color, albedo and normal as float4.
pub const DENOISE_INPUT_PIXEL_SIZE: usize = 48;

/// Bytes of one denoised pixel, a float4 color.
pub const DENOISE_OUTPUT_PIXEL_SIZE: usize = 16;

/// Filters the accumulation buffer into the denoise output buffer, synchronously.
pub trait Denoiser<D: Device> {
    fn name(&self) -> &str;

    fn denoise(&mut self, device: &D, input: &D::Buffer, output: &D::Buffer, width: u32, height: u32) -> Result<()>;
}

/// Copies accumulated color through unfiltered, in one device copy.
#[derive(Debug, Default)]
pub struct PassthroughDenoiser;

impl<D: Device> Denoiser<D> for PassthroughDenoiser {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn denoise(&mut self, device: &D, input: &D::Buffer, output: &D::Buffer, width: u32, height: u32) -> Result<()> {
        let pixel_count = (width as usize) * (height as usize);
        if input.desc().size < pixel_count * DENOISE_INPUT_PIXEL_SIZE
            || output.desc().size < pixel_count * DENOISE_OUTPUT_PIXEL_SIZE
        {
            return Err(Error::Denoise(format!(
                "buffers too small for a {}x{} frame",
                width, height
            )));
        }
        let regions: Vec<_> = (0..pixel_count)
            .map(|i| BufferCopyRegion {
                src_offset: i * DENOISE_INPUT_PIXEL_SIZE,
                dst_offset: i * DENOISE_OUTPUT_PIXEL_SIZE,
                size: DENOISE_OUTPUT_PIXEL_SIZE,
            })
            .collect();
        device.copy_buffer(input, output, &regions)
    }
}
