use crate::{error::*, maths::*};
use bytemuck::{Pod, Zeroable};
use std::path::PathBuf;

/// Triangles with optional per-vertex attributes.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    pub positions: Vec<Vec3>,
    pub normals: Option<Vec<Vec3>>,
    pub uvs: Option<Vec<Vec2>>,
    pub indices: Vec<UVec3>,
}

impl Geometry {
    pub fn new(positions: Vec<Vec3>, indices: Vec<UVec3>) -> Self {
        Self {
            positions,
            normals: None,
            uvs: None,
            indices,
        }
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn with_uvs(mut self, uvs: Vec<Vec2>) -> Self {
        self.uvs = Some(uvs);
        self
    }

    /// Two triangles spanning `corner + [0,1]*edge0 + [0,1]*edge1`.
    pub fn quad(corner: Vec3, edge0: Vec3, edge1: Vec3) -> Self {
        let normal = edge0.cross(edge1).normalized();
        Self::new(
            vec![corner, corner + edge0, corner + edge0 + edge1, corner + edge1],
            vec![UVec3::new(0, 1, 2), UVec3::new(2, 3, 0)],
        )
        .with_normals(vec![normal; 4])
        .with_uvs(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ])
    }

    /// Axis aligned box, 12 triangles with flat normals.
    pub fn cuboid(min: Vec3, max: Vec3) -> Self {
        let size = max - min;
        let dx = Vec3::new(size.x, 0.0, 0.0);
        let dy = Vec3::new(0.0, size.y, 0.0);
        let dz = Vec3::new(0.0, 0.0, size.z);
        let faces = [
            Self::quad(min, dy, dx),
            Self::quad(min + dz, dx, dy),
            Self::quad(min, dz, dy),
            Self::quad(min + dx, dy, dz),
            Self::quad(min, dx, dz),
            Self::quad(min + dy, dz, dx),
        ];
        let mut geometry = Self::new(Vec::new(), Vec::new())
            .with_normals(Vec::new())
            .with_uvs(Vec::new());
        for face in faces.iter() {
            geometry.append(face);
        }
        geometry
    }

    fn append(&mut self, other: &Geometry) {
        let base = self.positions.len() as u32;
        self.positions.extend_from_slice(&other.positions);
        self.indices
            .extend(other.indices.iter().map(|&tri| tri + UVec3::broadcast(base)));
        if let (Some(dst), Some(src)) = (self.normals.as_mut(), other.normals.as_ref()) {
            dst.extend_from_slice(src);
        }
        if let (Some(dst), Some(src)) = (self.uvs.as_mut(), other.uvs.as_ref()) {
            dst.extend_from_slice(src);
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    fn validate(&self, mesh_id: usize, geometry_index: usize) -> Result<()> {
        let fail = |reason: String| {
            Err(Error::InvalidScene(format!(
                "mesh {} geometry {}: {}",
                mesh_id, geometry_index, reason
            )))
        };
        if self.positions.is_empty() || self.indices.is_empty() {
            return fail("no triangles".into());
        }
        let vertex_count = self.positions.len() as u32;
        if let Some(tri) = self
            .indices
            .iter()
            .find(|tri| tri.x >= vertex_count || tri.y >= vertex_count || tri.z >= vertex_count)
        {
            return fail(format!("index {:?} out of range for {} vertices", tri, vertex_count));
        }
        if let Some(normals) = self.normals.as_ref() {
            if normals.len() != self.positions.len() {
                return fail(format!("{} normals for {} vertices", normals.len(), vertex_count));
            }
        }
        if let Some(uvs) = self.uvs.as_ref() {
            if uvs.len() != self.positions.len() {
                return fail(format!("{} uvs for {} vertices", uvs.len(), vertex_count));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub geometries: Vec<Geometry>,
}

impl Mesh {
    pub fn new(geometries: Vec<Geometry>) -> Self {
        Self { geometries }
    }
}

/// A mesh paired with one material per geometry.
#[derive(Debug, Clone)]
pub struct ParameterizedMesh {
    pub mesh_id: u32,
    pub material_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub transform: Mat4,
    pub parameterized_mesh_id: u32,
}

/// Set in the bit pattern of a material parameter to mark it as a texture index.
pub const TEXTURED_PARAM_MASK: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct DisneyMaterial {
    pub base_color: Vec3,
    pub metallic: f32,
    pub specular: f32,
    pub roughness: f32,
    pub specular_tint: f32,
    pub anisotropy: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_gloss: f32,
    pub ior: f32,
    pub specular_transmission: f32,
    pub pad: [f32; 2],
}

impl Default for DisneyMaterial {
    fn default() -> Self {
        Self {
            base_color: Vec3::new(0.9, 0.9, 0.9),
            metallic: 0.0,
            specular: 0.0,
            roughness: 1.0,
            specular_tint: 0.0,
            anisotropy: 0.0,
            sheen: 0.0,
            sheen_tint: 0.0,
            clearcoat: 0.0,
            clearcoat_gloss: 0.0,
            ior: 1.5,
            specular_transmission: 0.0,
            pad: [0.0; 2],
        }
    }
}

impl DisneyMaterial {
    pub fn diffuse(base_color: Vec3) -> Self {
        Self {
            base_color,
            ..Default::default()
        }
    }

    /// Encodes a texture index as a parameter value.
    pub fn textured_param(texture_id: u32) -> f32 {
        f32::from_bits(TEXTURED_PARAM_MASK | texture_id)
    }

    /// Texture index when the sign bit of `value` is set, parameters are otherwise non-negative.
    pub fn param_texture_id(value: f32) -> Option<u32> {
        let bits = value.to_bits();
        if bits & TEXTURED_PARAM_MASK != 0 {
            Some(bits & !TEXTURED_PARAM_MASK)
        } else {
            None
        }
    }

    /// A textured base color stores its texture index in the red channel.
    pub fn with_base_color_texture(mut self, texture_id: u32) -> Self {
        self.base_color.x = Self::textured_param(texture_id);
        self
    }

    fn referenced_textures(&self) -> impl Iterator<Item = u32> {
        let params = [
            self.base_color.x,
            self.metallic,
            self.specular,
            self.roughness,
            self.specular_tint,
            self.anisotropy,
            self.sheen,
            self.sheen_tint,
            self.clearcoat,
            self.clearcoat_gloss,
            self.ior,
            self.specular_transmission,
        ];
        let ids: Vec<u32> = params.iter().filter_map(|&p| Self::param_texture_id(p)).collect();
        ids.into_iter()
    }
}

/// Rectangular area light, w components of `v_x` and `v_y` hold the half extents.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct QuadLight {
    pub emission: Vec4,
    pub position: Vec4,
    pub normal: Vec4,
    pub v_x: Vec4,
    pub v_y: Vec4,
}

impl QuadLight {
    pub fn new(emission: Vec3, position: Vec3, v_x: Vec3, v_y: Vec3, half_width: f32, half_height: f32) -> Self {
        let v_x = v_x.normalized();
        let v_y = v_y.normalized();
        Self {
            emission: vec4_from_vec3(emission, 0.0),
            position: vec4_from_vec3(position, 1.0),
            normal: vec4_from_vec3(v_x.cross(v_y).normalized(), 0.0),
            v_x: vec4_from_vec3(v_x, half_width),
            v_y: vec4_from_vec3(v_y, half_height),
        }
    }

    pub fn area(&self) -> f32 {
        4.0 * self.v_x.w * self.v_y.w
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Linear,
    Srgb,
}

/// RGBA8 image with tightly packed rows.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn solid(name: &str, color: [u8; 4], color_space: ColorSpace) -> Self {
        Self {
            name: name.to_owned(),
            width: 1,
            height: 1,
            color_space,
            pixels: color.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub center: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub fov_y: f32,
}

impl Camera {
    pub fn direction(&self) -> Vec3 {
        (self.center - self.position).normalized()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            center: Vec3::zero(),
            up: Vec3::unit_y(),
            fov_y: 65.0,
        }
    }
}

/// Everything the renderer consumes, never mutated after hand-off.
#[derive(Debug, Clone)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub parameterized_meshes: Vec<ParameterizedMesh>,
    pub instances: Vec<Instance>,
    pub materials: Vec<DisneyMaterial>,
    pub textures: Vec<Image>,
    pub lights: Vec<QuadLight>,
    pub cameras: Vec<Camera>,
    pub samples_per_pixel: u32,
    pub environment_map: Option<PathBuf>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            meshes: Vec::new(),
            parameterized_meshes: Vec::new(),
            instances: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
            lights: Vec::new(),
            cameras: Vec::new(),
            samples_per_pixel: 1,
            environment_map: None,
        }
    }
}

impl Scene {
    pub fn add_mesh(&mut self, mesh: Mesh) -> u32 {
        self.meshes.push(mesh);
        (self.meshes.len() - 1) as u32
    }

    pub fn add_material(&mut self, material: DisneyMaterial) -> u32 {
        self.materials.push(material);
        (self.materials.len() - 1) as u32
    }

    pub fn add_texture(&mut self, image: Image) -> u32 {
        self.textures.push(image);
        (self.textures.len() - 1) as u32
    }

    pub fn add_parameterized_mesh(&mut self, mesh_id: u32, material_ids: Vec<u32>) -> u32 {
        self.parameterized_meshes.push(ParameterizedMesh { mesh_id, material_ids });
        (self.parameterized_meshes.len() - 1) as u32
    }

    pub fn add_instance(&mut self, transform: Mat4, parameterized_mesh_id: u32) -> u32 {
        self.instances.push(Instance {
            transform,
            parameterized_mesh_id,
        });
        (self.instances.len() - 1) as u32
    }

    pub fn mesh(&self, parameterized_mesh: &ParameterizedMesh) -> &Mesh {
        &self.meshes[parameterized_mesh.mesh_id as usize]
    }

    /// Geometry count summed over parameterized meshes, one hit group each.
    pub fn total_geometry_count(&self) -> usize {
        self.parameterized_meshes
            .iter()
            .map(|pm| self.mesh(pm).geometries.len())
            .sum()
    }

    pub fn default_camera(&self) -> Camera {
        self.cameras.first().copied().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::InvalidScene("scene has no instances".into()));
        }
        if self.samples_per_pixel == 0 {
            return Err(Error::InvalidScene("samples per pixel must be non-zero".into()));
        }
        for (mesh_id, mesh) in self.meshes.iter().enumerate() {
            if mesh.geometries.is_empty() {
                return Err(Error::InvalidScene(format!("mesh {} has no geometry", mesh_id)));
            }
            for (geometry_index, geometry) in mesh.geometries.iter().enumerate() {
                geometry.validate(mesh_id, geometry_index)?;
            }
        }
        for (pm_id, pm) in self.parameterized_meshes.iter().enumerate() {
            let mesh = self.meshes.get(pm.mesh_id as usize).ok_or_else(|| {
                Error::InvalidScene(format!("parameterized mesh {} references mesh {}", pm_id, pm.mesh_id))
            })?;
            if pm.material_ids.len() != mesh.geometries.len() {
                return Err(Error::InvalidScene(format!(
                    "parameterized mesh {} has {} materials for {} geometries",
                    pm_id,
                    pm.material_ids.len(),
                    mesh.geometries.len()
                )));
            }
            if let Some(id) = pm
                .material_ids
                .iter()
                .find(|&&id| id as usize >= self.materials.len())
            {
                return Err(Error::InvalidScene(format!(
                    "parameterized mesh {} references material {}",
                    pm_id, id
                )));
            }
        }
        for (instance_id, instance) in self.instances.iter().enumerate() {
            if instance.parameterized_mesh_id as usize >= self.parameterized_meshes.len() {
                return Err(Error::InvalidScene(format!(
                    "instance {} references parameterized mesh {}",
                    instance_id, instance.parameterized_mesh_id
                )));
            }
        }
        for (material_id, material) in self.materials.iter().enumerate() {
            if let Some(id) = material
                .referenced_textures()
                .find(|&id| id as usize >= self.textures.len())
            {
                return Err(Error::InvalidScene(format!(
                    "material {} references texture {}",
                    material_id, id
                )));
            }
        }
        for (texture_id, texture) in self.textures.iter().enumerate() {
            let byte_count = (texture.width as usize)
                .checked_mul(texture.height as usize)
                .and_then(|n| n.checked_mul(4));
            if texture.width == 0 || texture.height == 0 || byte_count != Some(texture.pixels.len()) {
                return Err(Error::InvalidScene(format!(
                    "texture {} ({}) has inconsistent size",
                    texture_id, texture.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn triangle() -> Geometry {
        Geometry::new(
            vec![Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)],
            vec![UVec3::new(0, 1, 2)],
        )
    }

    fn single_triangle_scene() -> Scene {
        let mut scene = Scene::default();
        let mesh = scene.add_mesh(Mesh::new(vec![triangle()]));
        let material = scene.add_material(DisneyMaterial::default());
        let pm = scene.add_parameterized_mesh(mesh, vec![material]);
        scene.add_instance(Mat4::identity(), pm);
        scene
    }

    #[test]
    fn valid_scene() {
        let scene = single_triangle_scene();
        scene.validate().unwrap();
        assert_eq!(scene.total_geometry_count(), 1);
    }

    #[test]
    fn rejects_bad_references() {
        let mut scene = single_triangle_scene();
        scene.parameterized_meshes[0].material_ids = vec![3];
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));

        let mut scene = single_triangle_scene();
        scene.meshes[0].geometries[0].indices.push(UVec3::new(0, 1, 7));
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));

        let mut scene = single_triangle_scene();
        scene.instances.clear();
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));

        let mut scene = single_triangle_scene();
        scene.materials[0] = DisneyMaterial::default().with_base_color_texture(0);
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));
    }

    #[test]
    fn rejects_oversized_textures() {
        let mut scene = single_triangle_scene();
        scene.add_texture(Image {
            name: "huge".into(),
            width: 65536,
            height: 65536,
            color_space: ColorSpace::Srgb,
            pixels: Vec::new(),
        });
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));

        let mut scene = single_triangle_scene();
        scene.add_texture(Image {
            name: "short".into(),
            width: 2,
            height: 2,
            color_space: ColorSpace::Linear,
            pixels: vec![0; 12],
        });
        assert!(matches!(scene.validate(), Err(Error::InvalidScene(_))));
    }

    #[test]
    fn textured_params() {
        let value = DisneyMaterial::textured_param(5);
        assert_eq!(DisneyMaterial::param_texture_id(value), Some(5));
        assert_eq!(DisneyMaterial::param_texture_id(0.5), None);
        assert_eq!(std::mem::size_of::<DisneyMaterial>(), 64);
        assert_eq!(std::mem::size_of::<QuadLight>(), 80);
    }

    #[test]
    fn cuboid_is_closed() {
        let geometry = Geometry::cuboid(Vec3::zero(), Vec3::one());
        assert_eq!(geometry.triangle_count(), 12);
        assert_eq!(geometry.vertex_count(), 24);
        geometry.validate(0, 0).unwrap();
    }
}
