use crate::{device::*, error::*, maths::*, resource::*, scene::*, usage::*};
use bytemuck::{Pod, Zeroable};
use log::{debug, info};

pub const INSTANCE_MASK_ALL: u32 = 0xff;
pub const INSTANCE_FLAG_TRIANGLE_CULL_DISABLE: u32 = 0x1;

const INSTANCE_INDEX_MASK: u32 = 0x00ff_ffff;

// VkAccelerationStructureInstanceKHR with Pod trait
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct AccelerationStructureInstance {
    pub transform: Transform3x4,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelerationStructureInstance {
    pub fn new(transform: Transform3x4, custom_index: u32, sbt_offset: u32, reference: u64) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (custom_index & INSTANCE_INDEX_MASK) | (INSTANCE_MASK_ALL << 24),
            instance_shader_binding_table_record_offset_and_flags: (sbt_offset & INSTANCE_INDEX_MASK)
                | (INSTANCE_FLAG_TRIANGLE_CULL_DISABLE << 24),
            acceleration_structure_reference: reference,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & INSTANCE_INDEX_MASK
    }

    pub fn mask(&self) -> u32 {
        self.instance_custom_index_and_mask >> 24
    }

    pub fn shader_binding_table_record_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & INSTANCE_INDEX_MASK
    }

    pub fn flags(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags >> 24
    }
}

/// Compacted acceleration structure for one mesh.
///
/// Only constructed by `build`, which releases the uncompacted structure, build scratch
/// and input buffers before returning.
pub struct BottomLevelAccel<D: Device> {
    accel: D::Accel,
    geometry_count: u32,
    size_before_compaction: u64,
}

impl<D: Device> BottomLevelAccel<D> {
    pub fn build(device: &D, mesh: &Mesh) -> Result<Self> {
        let mut inputs = Vec::with_capacity(mesh.geometries.len());
        for geometry in mesh.geometries.iter() {
            let mut vertices = BufferWriter::with_capacity(geometry.positions.len() * 12);
            for p in geometry.positions.iter() {
                vertices.write(&[p.x, p.y, p.z]);
            }
            let mut indices = BufferWriter::with_capacity(geometry.indices.len() * 12);
            for tri in geometry.indices.iter() {
                indices.write(&[tri.x, tri.y, tri.z]);
            }
            let usage = BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT;
            inputs.push((
                vertices.finish(device, usage, "bottom level vertices")?,
                indices.finish(device, usage, "bottom level indices")?,
                geometry.vertex_count() as u32,
                geometry.triangle_count() as u32,
            ));
        }
        let geometries: Vec<_> = inputs
            .iter()
            .map(
                |(vertices, indices, vertex_count, triangle_count)| TriangleGeometryInput {
                    vertices,
                    vertex_count: *vertex_count,
                    vertex_stride: 12,
                    indices,
                    triangle_count: *triangle_count,
                },
            )
            .collect();

        let build = device.build_bottom_level(&geometries)?;
        let size_before_compaction = build.accel.size();
        let compacted_size = device.query_compacted_size(&build.accel)?;
        if compacted_size > size_before_compaction {
            return Err(Error::AccelBuild(format!(
                "compacted size {} exceeds built size {}",
                compacted_size, size_before_compaction
            )));
        }
        let accel = device.compact(&build.accel, compacted_size)?;

        debug!(
            "bottom level: {} geometries, {} -> {} bytes",
            mesh.geometries.len(),
            size_before_compaction,
            accel.size()
        );

        Ok(Self {
            accel,
            geometry_count: mesh.geometries.len() as u32,
            size_before_compaction,
        })
    }

    pub fn accel(&self) -> &D::Accel {
        &self.accel
    }

    pub fn geometry_count(&self) -> u32 {
        self.geometry_count
    }

    pub fn size_before_compaction(&self) -> u64 {
        self.size_before_compaction
    }

    pub fn size(&self) -> u64 {
        self.accel.size()
    }
}

/// Hit group offset of each parameterized mesh, a running sum of geometry counts.
pub fn shader_binding_table_offsets(scene: &Scene) -> Vec<u32> {
    let mut next_offset = 0;
    scene
        .parameterized_meshes
        .iter()
        .map(|pm| {
            let offset = next_offset;
            next_offset += scene.mesh(pm).geometries.len() as u32;
            offset
        })
        .collect()
}

pub fn instance_records<D: Device>(
    scene: &Scene,
    bottom_level: &[BottomLevelAccel<D>],
    sbt_offsets: &[u32],
) -> Vec<AccelerationStructureInstance> {
    scene
        .instances
        .iter()
        .enumerate()
        .map(|(index, instance)| {
            let pm_id = instance.parameterized_mesh_id as usize;
            let mesh_id = scene.parameterized_meshes[pm_id].mesh_id as usize;
            AccelerationStructureInstance::new(
                Transform3x4::from_mat4(&instance.transform),
                index as u32,
                sbt_offsets[pm_id],
                bottom_level[mesh_id].accel.device_address(),
            )
        })
        .collect()
}

pub struct TopLevelAccel<D: Device> {
    accel: D::Accel,
    instance_buffer: D::Buffer,
    instance_count: u32,
}

impl<D: Device> TopLevelAccel<D> {
    pub fn build(device: &D, instances: &[AccelerationStructureInstance]) -> Result<Self> {
        let instance_buffer = upload_slice(
            device,
            instances,
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
            "instances",
        )?;
        let instance_count = instances.len() as u32;
        let build = device.build_top_level(&instance_buffer, instance_count)?;
        debug!("top level: {} instances, {} bytes", instance_count, build.accel.size());
        Ok(Self {
            accel: build.accel,
            instance_buffer,
            instance_count,
        })
    }

    pub fn accel(&self) -> &D::Accel {
        &self.accel
    }

    pub fn instance_buffer(&self) -> &D::Buffer {
        &self.instance_buffer
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}

/// Two level hierarchy over a scene.
pub struct SceneAccel<D: Device> {
    bottom_level: Vec<BottomLevelAccel<D>>,
    top_level: TopLevelAccel<D>,
    sbt_offsets: Vec<u32>,
}

impl<D: Device> SceneAccel<D> {
    pub fn new(device: &D, scene: &Scene) -> Result<Self> {
        let mut bottom_level = Vec::with_capacity(scene.meshes.len());
        for mesh in scene.meshes.iter() {
            bottom_level.push(BottomLevelAccel::build(device, mesh)?);
        }
        let size_before: u64 = bottom_level.iter().map(|b| b.size_before_compaction()).sum();
        let size_after: u64 = bottom_level.iter().map(|b| b.size()).sum();
        info!(
            "built {} bottom level structures, compacted {} -> {} bytes",
            bottom_level.len(),
            size_before,
            size_after
        );

        let sbt_offsets = shader_binding_table_offsets(scene);
        let instances = instance_records(scene, &bottom_level, &sbt_offsets);
        let top_level = TopLevelAccel::build(device, &instances)?;

        Ok(Self {
            bottom_level,
            top_level,
            sbt_offsets,
        })
    }

    pub fn bottom_level(&self) -> &[BottomLevelAccel<D>] {
        &self.bottom_level
    }

    pub fn top_level(&self) -> &TopLevelAccel<D> {
        &self.top_level
    }

    pub fn sbt_offsets(&self) -> &[u32] {
        &self.sbt_offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_record_packing() {
        assert_eq!(std::mem::size_of::<AccelerationStructureInstance>(), 64);
        let record = AccelerationStructureInstance::new(Transform3x4::identity(), 5, 9, 0xdead);
        assert_eq!(record.custom_index(), 5);
        assert_eq!(record.mask(), 0xff);
        assert_eq!(record.shader_binding_table_record_offset(), 9);
        assert_eq!(record.flags(), INSTANCE_FLAG_TRIANGLE_CULL_DISABLE);
        assert_eq!(record.acceleration_structure_reference, 0xdead);
    }

    #[test]
    fn offsets_are_running_sum() {
        let mut scene = Scene::default();
        let tri = Geometry::new(
            vec![Vec3::zero(), Vec3::unit_x(), Vec3::unit_y()],
            vec![UVec3::new(0, 1, 2)],
        );
        let two = scene.add_mesh(Mesh::new(vec![tri.clone(), tri.clone()]));
        let three = scene.add_mesh(Mesh::new(vec![tri.clone(), tri.clone(), tri]));
        scene.add_parameterized_mesh(two, vec![0, 0]);
        scene.add_parameterized_mesh(three, vec![0, 0, 0]);
        scene.add_parameterized_mesh(two, vec![0, 0]);
        assert_eq!(shader_binding_table_offsets(&scene), vec![0, 2, 5]);
    }
}
