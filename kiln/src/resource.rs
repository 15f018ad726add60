use crate::{device::*, error::*, maths::*, usage::*};
use bytemuck::Pod;

pub trait AsBytes {
    fn as_bytes(&self) -> &[u8];
}

impl<T: Pod> AsBytes for T {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl<T: Pod> AsBytes for [T] {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

pub trait StagingWriter {
    fn write<T: AsBytes + ?Sized>(&mut self, pod: &T);
    fn written(&self) -> usize;
    fn write_zeros(&mut self, len: usize);
}

/// Host-side contents of a buffer, uploaded in one copy when finished.
#[derive(Default)]
pub struct BufferWriter {
    data: Vec<u8>,
}

impl BufferWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn finish<D: Device>(self, device: &D, usage: BufferUsage, what: &'static str) -> Result<D::Buffer> {
        upload_buffer(device, &self.data, usage, what)
    }
}

impl StagingWriter for BufferWriter {
    fn write<T: AsBytes + ?Sized>(&mut self, pod: &T) {
        self.data.extend_from_slice(pod.as_bytes());
    }

    fn written(&self) -> usize {
        self.data.len()
    }

    fn write_zeros(&mut self, len: usize) {
        self.data.resize(self.data.len() + len, 0);
    }
}

/// Copies `data` into a new device local buffer through a transient upload buffer.
pub fn upload_buffer<D: Device>(device: &D, data: &[u8], usage: BufferUsage, what: &'static str) -> Result<D::Buffer> {
    let staging = device.create_buffer(
        &BufferDesc::new(data.len(), MemoryClass::Upload, BufferUsage::TRANSFER_SRC),
        "staging",
    )?;
    device.write_buffer(&staging, 0, data)?;

    let usage = usage | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST;
    let buffer = device.create_buffer(&BufferDesc::new(data.len(), MemoryClass::Device, usage), what)?;
    device.copy_buffer(&staging, &buffer, &[BufferCopyRegion::whole(data.len())])?;
    Ok(buffer)
}

pub fn upload_slice<D: Device, T: Pod>(
    device: &D,
    data: &[T],
    usage: BufferUsage,
    what: &'static str,
) -> Result<D::Buffer> {
    upload_buffer(device, bytemuck::cast_slice(data), usage, what)
}

/// Creates a sampled texture from tightly packed pixels, padding rows to the device pitch.
pub fn upload_texture<D: Device>(
    device: &D,
    desc: &TextureDesc,
    pixels: &[u8],
    what: &'static str,
) -> Result<D::Texture> {
    let row_bytes = desc.row_bytes();
    let height = desc.height as usize;
    if pixels.len() != row_bytes * height {
        return Err(Error::ResourceAccess(format!(
            "{}: {} bytes of pixel data for a {}x{} {:?} texture",
            what,
            pixels.len(),
            desc.width,
            desc.height,
            desc.format
        )));
    }
    let row_pitch = align_up_usize(row_bytes, device.limits().texture_row_pitch_alignment as usize);

    let mut staging_data = vec![0u8; row_pitch * height];
    copy_rows(pixels, row_bytes, &mut staging_data, row_pitch, row_bytes, height);

    let staging = device.create_buffer(
        &BufferDesc::new(staging_data.len(), MemoryClass::Upload, BufferUsage::TRANSFER_SRC),
        "staging",
    )?;
    device.write_buffer(&staging, 0, &staging_data)?;

    let texture = device.create_texture(
        &TextureDesc {
            usage: desc.usage | TextureUsage::TRANSFER_DST,
            ..*desc
        },
        what,
    )?;
    device.copy_buffer_to_texture(&staging, row_pitch, &texture)?;
    Ok(texture)
}

/// Reads back the full contents of a device buffer.
pub fn download_buffer<D: Device>(device: &D, buffer: &D::Buffer) -> Result<Vec<u8>> {
    let size = buffer.desc().size;
    let readback = device.create_buffer(
        &BufferDesc::new(size, MemoryClass::Readback, BufferUsage::TRANSFER_DST),
        "readback",
    )?;
    device.copy_buffer(buffer, &readback, &[BufferCopyRegion::whole(size)])?;
    let mut data = vec![0u8; size];
    device.read_buffer(&readback, 0, &mut data)?;
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCopy {
    Bulk,
    RowByRow,
}

/// Copies `rows` rows of `row_bytes` between buffers with possibly different row pitch.
pub fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    row_bytes: usize,
    rows: usize,
) -> RowCopy {
    if src_pitch == row_bytes && dst_pitch == row_bytes {
        let size = row_bytes * rows;
        dst[..size].copy_from_slice(&src[..size]);
        RowCopy::Bulk
    } else {
        for row in 0..rows {
            let src_offset = row * src_pitch;
            let dst_offset = row * dst_pitch;
            dst[dst_offset..dst_offset + row_bytes].copy_from_slice(&src[src_offset..src_offset + row_bytes]);
        }
        RowCopy::RowByRow
    }
}

/// Host readable copy of a texture, rows padded to the device pitch.
pub struct TextureReadback<D: Device> {
    buffer: D::Buffer,
    desc: TextureDesc,
    row_pitch: usize,
}

impl<D: Device> TextureReadback<D> {
    pub fn new(device: &D, desc: &TextureDesc, what: &'static str) -> Result<Self> {
        let row_pitch = align_up_usize(desc.row_bytes(), device.limits().texture_row_pitch_alignment as usize);
        let buffer = device.create_buffer(
            &BufferDesc::new(
                row_pitch * (desc.height as usize),
                MemoryClass::Readback,
                BufferUsage::TRANSFER_DST,
            ),
            what,
        )?;
        Ok(Self {
            buffer,
            desc: *desc,
            row_pitch,
        })
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn copy_from(&self, device: &D, texture: &D::Texture) -> Result<()> {
        device.copy_texture_to_buffer(texture, &self.buffer, self.row_pitch)
    }

    /// Copies into tightly packed rows, valid once the copy from the texture has completed.
    pub fn read_into(&self, device: &D, dst: &mut [u8]) -> Result<RowCopy> {
        let row_bytes = self.desc.row_bytes();
        let rows = self.desc.height as usize;
        if dst.len() < row_bytes * rows {
            return Err(Error::Readback(format!(
                "destination holds {} bytes, image needs {}",
                dst.len(),
                row_bytes * rows
            )));
        }
        let mut mapped = vec![0u8; self.row_pitch * rows];
        device.read_buffer(&self.buffer, 0, &mut mapped)?;
        Ok(copy_rows(&mapped, self.row_pitch, dst, row_bytes, row_bytes, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitched_rows_copy_row_by_row() {
        // 2 rows of 3 bytes in an 8 byte pitch
        let src = [1, 2, 3, 0xff, 0xff, 0xff, 0xff, 0xff, 4, 5, 6, 0xff, 0xff, 0xff, 0xff, 0xff];
        let mut dst = [0u8; 6];
        assert_eq!(copy_rows(&src, 8, &mut dst, 3, 3, 2), RowCopy::RowByRow);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn tight_rows_copy_in_bulk() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 6];
        assert_eq!(copy_rows(&src, 3, &mut dst, 3, 3, 2), RowCopy::Bulk);
        assert_eq!(dst, src);
    }

    #[test]
    fn writer_pads_with_zeros() {
        let mut writer = BufferWriter::default();
        writer.write(&7u32);
        writer.write_zeros(4);
        writer.write(&[1u16, 2u16][..]);
        assert_eq!(writer.written(), 12);
        assert_eq!(writer.into_inner(), vec![7, 0, 0, 0, 0, 0, 0, 0, 1, 0, 2, 0]);
    }
}
