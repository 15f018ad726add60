use crate::{device::*, error::*, maths::*, resource::*, scene::*, usage::*};
use bytemuck::{Pod, Zeroable};
use log::debug;
use std::mem;

/// Where one (parameterized mesh, geometry) pair lives in the global buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub struct MeshDesc {
    pub vertex_offset: u32,
    pub index_offset: u32,
    /// -1 when the geometry has no normals.
    pub normal_offset: i32,
    /// -1 when the geometry has no uvs.
    pub uv_offset: i32,
    pub vertex_count: u32,
    /// Number of index triples.
    pub index_count: u32,
    pub material_id: u32,
    pub pad: u32,
}

impl MeshDesc {
    pub fn read_all(data: &[u8]) -> Vec<MeshDesc> {
        data.chunks_exact(mem::size_of::<MeshDesc>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GeometryOffsets {
    vertex_offset: u32,
    index_offset: u32,
    normal_offset: Option<u32>,
    uv_offset: Option<u32>,
}

fn write_vec3(writer: &mut BufferWriter, v: [f32; 3], stride: usize) {
    writer.write(&v);
    writer.write_zeros(stride - mem::size_of::<[f32; 3]>());
}

fn write_triple(writer: &mut BufferWriter, t: UVec3, stride: usize) {
    writer.write(&[t.x, t.y, t.z]);
    writer.write_zeros(stride - mem::size_of::<[u32; 3]>());
}

/// Flattened scene attributes, concatenated in mesh then geometry order.
#[derive(Debug, Clone, Default)]
pub struct PackedSceneData {
    pub vec3_stride: usize,
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
    pub normals: Vec<u8>,
    pub uvs: Vec<u8>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub normal_count: u32,
    pub uv_count: u32,
    pub mesh_descs: Vec<MeshDesc>,
}

impl PackedSceneData {
    pub fn pack(scene: &Scene, vec3_stride: u32) -> Self {
        let stride = vec3_stride as usize;
        let mut vertices = BufferWriter::default();
        let mut indices = BufferWriter::default();
        let mut normals = BufferWriter::default();
        let mut uvs = BufferWriter::default();

        let mut next = GeometryOffsets::default();
        let mut normal_count = 0;
        let mut uv_count = 0;
        let mesh_offsets: Vec<Vec<GeometryOffsets>> = scene
            .meshes
            .iter()
            .map(|mesh| {
                mesh.geometries
                    .iter()
                    .map(|geometry| {
                        let offsets = GeometryOffsets {
                            vertex_offset: next.vertex_offset,
                            index_offset: next.index_offset,
                            normal_offset: geometry.normals.as_ref().map(|_| normal_count),
                            uv_offset: geometry.uvs.as_ref().map(|_| uv_count),
                        };
                        for p in geometry.positions.iter() {
                            write_vec3(&mut vertices, [p.x, p.y, p.z], stride);
                        }
                        for &tri in geometry.indices.iter() {
                            write_triple(&mut indices, tri, stride);
                        }
                        if let Some(geometry_normals) = geometry.normals.as_ref() {
                            for n in geometry_normals.iter() {
                                write_vec3(&mut normals, [n.x, n.y, n.z], stride);
                            }
                            normal_count += geometry_normals.len() as u32;
                        }
                        if let Some(geometry_uvs) = geometry.uvs.as_ref() {
                            for uv in geometry_uvs.iter() {
                                uvs.write(&[uv.x, uv.y]);
                            }
                            uv_count += geometry_uvs.len() as u32;
                        }
                        next.vertex_offset += geometry.vertex_count() as u32;
                        next.index_offset += geometry.triangle_count() as u32;
                        offsets
                    })
                    .collect()
            })
            .collect();

        let mut mesh_descs = Vec::with_capacity(scene.total_geometry_count());
        for pm in scene.parameterized_meshes.iter() {
            let mesh = scene.mesh(pm);
            let offsets = &mesh_offsets[pm.mesh_id as usize];
            for ((geometry, offsets), &material_id) in mesh
                .geometries
                .iter()
                .zip(offsets.iter())
                .zip(pm.material_ids.iter())
            {
                mesh_descs.push(MeshDesc {
                    vertex_offset: offsets.vertex_offset,
                    index_offset: offsets.index_offset,
                    normal_offset: offsets.normal_offset.map_or(-1, |n| n as i32),
                    uv_offset: offsets.uv_offset.map_or(-1, |n| n as i32),
                    vertex_count: geometry.vertex_count() as u32,
                    index_count: geometry.triangle_count() as u32,
                    material_id,
                    pad: 0,
                });
            }
        }

        Self {
            vec3_stride: stride,
            vertices: vertices.into_inner(),
            indices: indices.into_inner(),
            normals: normals.into_inner(),
            uvs: uvs.into_inner(),
            vertex_count: next.vertex_offset,
            index_count: next.index_offset,
            normal_count,
            uv_count,
            mesh_descs,
        }
    }

    pub fn vertex(&self, index: u32) -> Vec3 {
        read_vec3(&self.vertices, self.vec3_stride, index)
    }

    pub fn normal(&self, index: u32) -> Vec3 {
        read_vec3(&self.normals, self.vec3_stride, index)
    }

    pub fn triangle(&self, index: u32) -> UVec3 {
        let start = (index as usize) * self.vec3_stride;
        let t: [u32; 3] = bytemuck::pod_read_unaligned(&self.indices[start..start + 12]);
        UVec3::new(t[0], t[1], t[2])
    }

    pub fn uv(&self, index: u32) -> Vec2 {
        let start = (index as usize) * 8;
        let t: [f32; 2] = bytemuck::pod_read_unaligned(&self.uvs[start..start + 8]);
        Vec2::new(t[0], t[1])
    }
}

pub(crate) fn read_vec3(data: &[u8], stride: usize, index: u32) -> Vec3 {
    let start = (index as usize) * stride;
    let v: [f32; 3] = bytemuck::pod_read_unaligned(&data[start..start + 12]);
    Vec3::new(v[0], v[1], v[2])
}

fn upload_if_any<D: Device>(device: &D, data: &[u8], what: &'static str) -> Result<Option<D::Buffer>> {
    if data.is_empty() {
        Ok(None)
    } else {
        upload_buffer(device, data, BufferUsage::STORAGE, what).map(Some)
    }
}

/// Device copies of the flattened scene, absent buffers bind as placeholders.
pub struct GlobalBuffers<D: Device> {
    pub vertices: Option<D::Buffer>,
    pub indices: Option<D::Buffer>,
    pub normals: Option<D::Buffer>,
    pub uvs: Option<D::Buffer>,
    pub mesh_descs: Option<D::Buffer>,
    pub materials: Option<D::Buffer>,
    pub lights: Option<D::Buffer>,
    mesh_desc_count: u32,
}

impl<D: Device> GlobalBuffers<D> {
    pub fn new(device: &D, scene: &Scene) -> Result<Self> {
        let packed = PackedSceneData::pack(scene, device.limits().vec3_stride);
        debug!(
            "global buffers: {} vertices, {} triangles, {} normals, {} uvs, {} mesh descs",
            packed.vertex_count,
            packed.index_count,
            packed.normal_count,
            packed.uv_count,
            packed.mesh_descs.len()
        );
        Ok(Self {
            vertices: upload_if_any(device, &packed.vertices, "global vertices")?,
            indices: upload_if_any(device, &packed.indices, "global indices")?,
            normals: upload_if_any(device, &packed.normals, "global normals")?,
            uvs: upload_if_any(device, &packed.uvs, "global uvs")?,
            mesh_descs: upload_if_any(device, bytemuck::cast_slice(&packed.mesh_descs), "mesh descs")?,
            materials: upload_if_any(device, bytemuck::cast_slice(&scene.materials), "materials")?,
            lights: upload_if_any(device, bytemuck::cast_slice(&scene.lights), "lights")?,
            mesh_desc_count: packed.mesh_descs.len() as u32,
        })
    }

    pub fn mesh_desc_count(&self) -> u32 {
        self.mesh_desc_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(offset: f32) -> Geometry {
        Geometry::new(
            vec![
                Vec3::new(offset, 0.0, 0.0),
                Vec3::new(offset + 1.0, 0.0, 0.0),
                Vec3::new(offset, 1.0, 0.0),
            ],
            vec![UVec3::new(0, 1, 2)],
        )
    }

    #[test]
    fn mesh_then_geometry_order() {
        let mut scene = Scene::default();
        let a = scene.add_mesh(Mesh::new(vec![tri(0.0), tri(10.0).with_normals(vec![Vec3::unit_z(); 3])]));
        let b = scene.add_mesh(Mesh::new(vec![tri(20.0)]));
        scene.add_parameterized_mesh(b, vec![4]);
        scene.add_parameterized_mesh(a, vec![1, 2]);

        let packed = PackedSceneData::pack(&scene, 16);
        assert_eq!(packed.vertex_count, 9);
        assert_eq!(packed.index_count, 3);
        assert_eq!(packed.vertices.len(), 9 * 16);
        assert_eq!(packed.normals.len(), 3 * 16);
        assert!(packed.uvs.is_empty());
        assert_eq!(packed.vertex(3), Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(packed.vertex(6), Vec3::new(20.0, 0.0, 0.0));
        assert_eq!(packed.triangle(2), UVec3::new(0, 1, 2));

        let descs = &packed.mesh_descs;
        assert_eq!(descs.len(), 3);
        assert_eq!((descs[0].vertex_offset, descs[0].index_offset, descs[0].material_id), (6, 2, 4));
        assert_eq!((descs[1].vertex_offset, descs[1].normal_offset, descs[1].material_id), (0, -1, 1));
        assert_eq!((descs[2].vertex_offset, descs[2].normal_offset, descs[2].material_id), (3, 0, 2));
        assert_eq!(descs[2].uv_offset, -1);
        assert_eq!(descs[2].index_count, 1);
    }

    #[test]
    fn tight_stride() {
        let mut scene = Scene::default();
        let mesh = scene.add_mesh(Mesh::new(vec![tri(1.0)]));
        scene.add_parameterized_mesh(mesh, vec![0]);
        let packed = PackedSceneData::pack(&scene, 12);
        assert_eq!(packed.vertices.len(), 36);
        assert_eq!(packed.indices.len(), 12);
        assert_eq!(packed.vertex(2), Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(std::mem::size_of::<MeshDesc>(), 32);
        let bytes: Vec<u8> = bytemuck::cast_slice(&packed.mesh_descs).to_vec();
        assert_eq!(MeshDesc::read_all(&bytes), packed.mesh_descs);
    }
}
