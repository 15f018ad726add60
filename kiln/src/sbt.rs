use crate::{device::*, error::*, maths::*, resource::*, scene::*, usage::*};
use bytemuck::{Contiguous, Pod, Zeroable};
use log::debug;
use std::mem;

/// Order of groups in the pipeline, and of their handles.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Contiguous)]
pub enum ShaderGroup {
    RayGenerator,
    Miss,
    OcclusionMiss,
    ClosestHit,
}

impl ShaderGroup {
    pub const COUNT: usize = 1 + Self::MAX_VALUE;
}

/// Primary miss then occlusion miss.
pub const MISS_ENTRY_COUNT: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub struct RaygenRecord {
    pub num_lights: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub struct HitGroupRecord {
    pub mesh_desc_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingRegion {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

impl ShaderBindingRegion {
    pub fn record_count(&self) -> u32 {
        self.size / self.stride
    }

    pub fn record_offset(&self, index: u32) -> usize {
        (self.offset + index * self.stride) as usize
    }
}

/// Byte layout of a shader binding table for one scene on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingLayout {
    pub handle_size: u32,
    pub raygen_region: ShaderBindingRegion,
    pub miss_region: ShaderBindingRegion,
    pub hit_region: ShaderBindingRegion,
    pub total_size: u32,
}

impl ShaderBindingLayout {
    pub fn new(limits: &DeviceLimits, hit_group_count: u32) -> Self {
        let mut next_offset = 0;

        let raygen_record_size = mem::size_of::<RaygenRecord>() as u32;
        let raygen_stride = align_up(
            limits.shader_group_handle_size + raygen_record_size,
            limits.shader_group_handle_alignment,
        );
        let raygen_region = ShaderBindingRegion {
            offset: next_offset,
            stride: raygen_stride,
            size: raygen_stride,
        };
        next_offset += align_up(raygen_region.size, limits.shader_group_base_alignment);

        let miss_stride = align_up(limits.shader_group_handle_size, limits.shader_group_handle_alignment);
        let miss_region = ShaderBindingRegion {
            offset: next_offset,
            stride: miss_stride,
            size: miss_stride * MISS_ENTRY_COUNT,
        };
        next_offset += align_up(miss_region.size, limits.shader_group_base_alignment);

        let hit_record_size = mem::size_of::<HitGroupRecord>() as u32;
        let hit_stride = align_up(
            limits.shader_group_handle_size + hit_record_size,
            limits.shader_group_handle_alignment,
        );
        let hit_region = ShaderBindingRegion {
            offset: next_offset,
            stride: hit_stride,
            size: hit_stride * hit_group_count,
        };
        next_offset += align_up(hit_region.size, limits.shader_group_base_alignment);

        Self {
            handle_size: limits.shader_group_handle_size,
            raygen_region,
            miss_region,
            hit_region,
            total_size: next_offset,
        }
    }

    pub fn record_count(&self) -> usize {
        (1 + MISS_ENTRY_COUNT + self.hit_region.record_count()) as usize
    }

    /// Handle and parameters of a hit record within table contents.
    pub fn hit_group_record<'a>(&self, data: &'a [u8], index: u32) -> Option<(&'a [u8], HitGroupRecord)> {
        if index >= self.hit_region.record_count() {
            return None;
        }
        let offset = self.hit_region.record_offset(index);
        let handle_size = self.handle_size as usize;
        let handle = data.get(offset..offset + handle_size)?;
        let record_start = offset + handle_size;
        let record = data.get(record_start..record_start + mem::size_of::<HitGroupRecord>())?;
        Some((handle, bytemuck::pod_read_unaligned(record)))
    }

    pub fn raygen_record(&self, data: &[u8]) -> Option<RaygenRecord> {
        let start = self.raygen_region.offset as usize + self.handle_size as usize;
        let record = data.get(start..start + mem::size_of::<RaygenRecord>())?;
        Some(bytemuck::pod_read_unaligned(record))
    }
}

/// Writes records in region order into host memory.
pub struct ShaderBindingTableWriter<'a> {
    layout: &'a ShaderBindingLayout,
    handles: Vec<&'a [u8]>,
    data: Vec<u8>,
    raygen_written: u32,
    miss_written: u32,
    hit_written: u32,
}

impl<'a> ShaderBindingTableWriter<'a> {
    pub fn new(layout: &'a ShaderBindingLayout, handle_data: &'a [u8]) -> Result<Self> {
        let handle_size = layout.handle_size as usize;
        if handle_data.len() != ShaderGroup::COUNT * handle_size {
            return Err(Error::Pipeline(format!(
                "expected {} shader group handles of {} bytes, got {} bytes",
                ShaderGroup::COUNT,
                handle_size,
                handle_data.len()
            )));
        }
        Ok(Self {
            layout,
            handles: handle_data.chunks(handle_size).collect(),
            data: vec![0u8; layout.total_size as usize],
            raygen_written: 0,
            miss_written: 0,
            hit_written: 0,
        })
    }

    fn write_record<T: AsBytes + ?Sized>(
        &mut self,
        region: ShaderBindingRegion,
        region_name: &'static str,
        index: u32,
        group: ShaderGroup,
        record: &T,
    ) -> Result<()> {
        if index >= region.record_count() {
            return Err(Error::ShaderBindingTableOverflow {
                region: region_name,
                capacity: region.record_count() as usize,
            });
        }
        let handle = self.handles[group.into_integer()];
        let offset = region.record_offset(index);
        let record = record.as_bytes();
        self.data[offset..offset + handle.len()].copy_from_slice(handle);
        let record_offset = offset + handle.len();
        self.data[record_offset..record_offset + record.len()].copy_from_slice(record);
        Ok(())
    }

    pub fn write_raygen(&mut self, record: &RaygenRecord) -> Result<()> {
        let region = self.layout.raygen_region;
        self.write_record(region, "raygen", self.raygen_written, ShaderGroup::RayGenerator, record)?;
        self.raygen_written += 1;
        Ok(())
    }

    pub fn write_miss(&mut self, group: ShaderGroup) -> Result<()> {
        let region = self.layout.miss_region;
        self.write_record(region, "miss", self.miss_written, group, &[0u8; 0][..])?;
        self.miss_written += 1;
        Ok(())
    }

    pub fn write_hit_group(&mut self, record: &HitGroupRecord) -> Result<()> {
        let region = self.layout.hit_region;
        self.write_record(region, "hit group", self.hit_written, ShaderGroup::ClosestHit, record)?;
        self.hit_written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        (self.raygen_written + self.miss_written + self.hit_written) as usize
    }

    /// Table contents, only once every record has been written.
    pub fn finish(self) -> Result<Vec<u8>> {
        let expected = self.layout.record_count();
        let written = self.written();
        if written != expected {
            return Err(Error::IncompleteShaderBindingTable { written, expected });
        }
        Ok(self.data)
    }
}

/// Writes the records for a scene, hit groups in instance offset order.
pub fn write_scene_records(writer: &mut ShaderBindingTableWriter, scene: &Scene) -> Result<u32> {
    writer.write_raygen(&RaygenRecord {
        num_lights: scene.lights.len() as u32,
    })?;
    writer.write_miss(ShaderGroup::Miss)?;
    writer.write_miss(ShaderGroup::OcclusionMiss)?;

    let mut mesh_desc_index = 0;
    for pm in scene.parameterized_meshes.iter() {
        for _ in scene.mesh(pm).geometries.iter() {
            writer.write_hit_group(&HitGroupRecord { mesh_desc_index })?;
            mesh_desc_index += 1;
        }
    }
    Ok(mesh_desc_index)
}

pub struct ShaderBindingTable<D: Device> {
    buffer: D::Buffer,
    layout: ShaderBindingLayout,
    mesh_desc_count: u32,
}

impl<D: Device> ShaderBindingTable<D> {
    pub fn new(device: &D, pipeline: &D::Pipeline, scene: &Scene) -> Result<Self> {
        let hit_group_count = scene.total_geometry_count() as u32;
        let layout = ShaderBindingLayout::new(device.limits(), hit_group_count);
        let handle_data = device.shader_group_handles(pipeline)?;

        let mut writer = ShaderBindingTableWriter::new(&layout, &handle_data)?;
        let mesh_desc_count = write_scene_records(&mut writer, scene)?;
        let data = writer.finish()?;

        debug!(
            "shader binding table: {} hit groups, {} bytes",
            hit_group_count, layout.total_size
        );
        let buffer = upload_buffer(device, &data, BufferUsage::SHADER_BINDING_TABLE, "shader binding table")?;
        Ok(Self {
            buffer,
            layout,
            mesh_desc_count,
        })
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn layout(&self) -> &ShaderBindingLayout {
        &self.layout
    }

    pub fn hit_group_count(&self) -> u32 {
        self.layout.hit_region.record_count()
    }

    /// Final value of the mesh desc counter, one past the last index written.
    pub fn mesh_desc_count(&self) -> u32 {
        self.mesh_desc_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            texture_row_pitch_alignment: 256,
            vec3_stride: 12,
        }
    }

    fn handles() -> Vec<u8> {
        (0..ShaderGroup::COUNT).flat_map(|i| vec![i as u8 + 1; 32]).collect()
    }

    #[test]
    fn region_alignment() {
        let layout = ShaderBindingLayout::new(&limits(), 3);
        assert_eq!(layout.raygen_region.offset, 0);
        assert_eq!(layout.raygen_region.stride, 64);
        assert_eq!(layout.miss_region.offset, 64);
        assert_eq!(layout.miss_region.stride, 32);
        assert_eq!(layout.hit_region.offset, 128);
        assert_eq!(layout.hit_region.stride, 64);
        assert_eq!(layout.hit_region.size, 192);
        assert_eq!(layout.total_size, 320);
        assert_eq!(layout.record_count(), 6);
    }

    #[test]
    fn incomplete_table_is_rejected() {
        let layout = ShaderBindingLayout::new(&limits(), 2);
        let handle_data = handles();
        let mut writer = ShaderBindingTableWriter::new(&layout, &handle_data).unwrap();
        writer.write_raygen(&RaygenRecord { num_lights: 0 }).unwrap();
        writer.write_miss(ShaderGroup::Miss).unwrap();
        writer.write_miss(ShaderGroup::OcclusionMiss).unwrap();
        writer.write_hit_group(&HitGroupRecord { mesh_desc_index: 0 }).unwrap();
        match writer.finish() {
            Err(Error::IncompleteShaderBindingTable { written, expected }) => {
                assert_eq!(written, 4);
                assert_eq!(expected, 5);
            }
            _ => panic!("expected an incomplete table error"),
        }
    }

    #[test]
    fn overflow_is_rejected() {
        let layout = ShaderBindingLayout::new(&limits(), 1);
        let handle_data = handles();
        let mut writer = ShaderBindingTableWriter::new(&layout, &handle_data).unwrap();
        writer.write_hit_group(&HitGroupRecord { mesh_desc_index: 0 }).unwrap();
        assert!(matches!(
            writer.write_hit_group(&HitGroupRecord { mesh_desc_index: 1 }),
            Err(Error::ShaderBindingTableOverflow { capacity: 1, .. })
        ));
        assert!(writer.write_miss(ShaderGroup::Miss).is_ok());
        assert!(writer.write_miss(ShaderGroup::OcclusionMiss).is_ok());
        assert!(writer.write_miss(ShaderGroup::Miss).is_err());
    }

    #[test]
    fn records_carry_handles() {
        let layout = ShaderBindingLayout::new(&limits(), 2);
        let handle_data = handles();
        let mut writer = ShaderBindingTableWriter::new(&layout, &handle_data).unwrap();
        writer.write_raygen(&RaygenRecord { num_lights: 7 }).unwrap();
        writer.write_miss(ShaderGroup::Miss).unwrap();
        writer.write_miss(ShaderGroup::OcclusionMiss).unwrap();
        writer.write_hit_group(&HitGroupRecord { mesh_desc_index: 0 }).unwrap();
        writer.write_hit_group(&HitGroupRecord { mesh_desc_index: 1 }).unwrap();
        let data = writer.finish().unwrap();

        assert_eq!(layout.raygen_record(&data), Some(RaygenRecord { num_lights: 7 }));
        assert_eq!(data[layout.miss_region.record_offset(1)], 3);
        let (handle, record) = layout.hit_group_record(&data, 1).unwrap();
        assert_eq!(handle, &[4u8; 32][..]);
        assert_eq!(record.mesh_desc_index, 1);
        assert!(layout.hit_group_record(&data, 2).is_none());
    }
}
