use super::{
    bvh::intersect_triangle, AccelData, HostBindingTable, HostDescriptor, HostPipeline, SharedData, TopLevelData,
};
use crate::{
    binding::*, color_space::*, denoise::*, device::*, error::*, frame::ViewParameters, global_buffers::*, maths::*,
    sbt::*, scene::*,
};
use rayon::prelude::*;
use std::{f32::consts::PI, mem, sync::RwLockReadGuard};

const T_MIN: f32 = 1.0e-4;
const SHADOW_EPSILON: f32 = 1.0e-3;

fn submit_error(message: String) -> Error {
    Error::Submit(message)
}

fn buffer_data(bindings: &HostBindingTable, slot: u32) -> Result<Option<SharedData>> {
    match bindings.first(slot) {
        Some(HostDescriptor::Buffer(_, data)) => Ok(Some(SharedData::clone(data))),
        Some(HostDescriptor::Null) | None => Ok(None),
        Some(_) => Err(submit_error(format!("slot {} does not hold a buffer", slot))),
    }
}

fn required_buffer(bindings: &HostBindingTable, slot: u32) -> Result<SharedData> {
    buffer_data(bindings, slot)?.ok_or_else(|| submit_error(format!("slot {} is not bound", slot)))
}

fn texture_data(descriptor: Option<&HostDescriptor>, slot: u32) -> Result<Option<(TextureDesc, SharedData)>> {
    match descriptor {
        Some(HostDescriptor::Texture(desc, data)) => Ok(Some((*desc, SharedData::clone(data)))),
        None => Ok(None),
        Some(_) => Err(submit_error(format!("slot {} does not hold a texture", slot))),
    }
}

fn required_texture(bindings: &HostBindingTable, slot: u32) -> Result<(TextureDesc, SharedData)> {
    texture_data(bindings.first(slot), slot)?.ok_or_else(|| submit_error(format!("slot {} is not bound", slot)))
}

fn read_guard(data: &Option<SharedData>) -> Option<RwLockReadGuard<'_, Vec<u8>>> {
    data.as_ref().map(|data| data.read().unwrap())
}

fn bytes<'a>(guard: &'a Option<RwLockReadGuard<'_, Vec<u8>>>) -> &'a [u8] {
    guard.as_ref().map_or(&[], |data| data.as_slice())
}

#[derive(Clone, Copy)]
struct TextureView<'a> {
    desc: TextureDesc,
    data: &'a [u8],
}

impl<'a> TextureView<'a> {
    fn texel(&self, x: u32, y: u32) -> Vec3 {
        let offset = ((y * self.desc.width + x) as usize) * self.desc.format.bytes_per_pixel();
        match self.desc.format {
            TextureFormat::Rgba8Srgb => {
                let c: [u8; 4] = bytemuck::pod_read_unaligned(&self.data[offset..offset + 4]);
                linear_from_srgb8(c)
            }
            TextureFormat::Rgba8Unorm => {
                let c = &self.data[offset..offset + 4];
                Vec3::new(c[0] as f32, c[1] as f32, c[2] as f32) / 255.0
            }
            TextureFormat::Rgba32Float => {
                let c: [f32; 4] = bytemuck::pod_read_unaligned(&self.data[offset..offset + 16]);
                Vec3::new(c[0], c[1], c[2])
            }
            TextureFormat::R32Uint => Vec3::zero(),
        }
    }

    /// Nearest texel with repeat addressing.
    fn sample(&self, uv: Vec2) -> Vec3 {
        let wrap = |x: f32, size: u32| {
            let x = x - x.floor();
            ((x * size as f32) as u32).min(size - 1)
        };
        self.texel(wrap(uv.x, self.desc.width), wrap(uv.y, self.desc.height))
    }
}

// tiny encryption algorithm, used to decorrelate per pixel seeds
fn tea(v0: u32, v1: u32) -> u32 {
    let (mut v0, mut v1) = (v0, v1);
    let mut s0 = 0u32;
    for _ in 0..4 {
        s0 = s0.wrapping_add(0x9e37_79b9);
        v0 = v0.wrapping_add(
            (v1 << 4).wrapping_add(0xa341_316c) ^ v1.wrapping_add(s0) ^ (v1 >> 5).wrapping_add(0xc801_3ea4),
        );
        v1 = v1.wrapping_add(
            (v0 << 4).wrapping_add(0xad90_777d) ^ v0.wrapping_add(s0) ^ (v0 >> 5).wrapping_add(0x7e95_761e),
        );
    }
    v0
}

struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        ((self.0 & 0x00ff_ffff) as f32) / (0x0100_0000 as f32)
    }
}

struct Hit {
    t: f32,
    instance: usize,
    geometry: u32,
    prim: u32,
    u: f32,
    v: f32,
}

/// Normals go through the transpose of the inverse transform.
fn transform_normal(world_to_object: &Transform3x4, n: Vec3) -> Vec3 {
    let t = &world_to_object.0;
    Vec3::new(
        t[0] * n.x + t[4] * n.y + t[8] * n.z,
        t[1] * n.x + t[5] * n.y + t[9] * n.z,
        t[2] * n.x + t[6] * n.y + t[10] * n.z,
    )
}

struct SceneView<'a> {
    top_level: &'a TopLevelData,
    hit_records: Vec<u32>,
    mesh_descs: Vec<MeshDesc>,
    materials: &'a [u8],
    lights: Vec<QuadLight>,
    vertices: &'a [u8],
    indices: &'a [u8],
    normals: &'a [u8],
    uvs: &'a [u8],
    vec3_stride: usize,
    environment_map: TextureView<'a>,
    textures: Vec<TextureView<'a>>,
}

struct Shading {
    radiance: Vec3,
    albedo: Vec3,
    normal: Vec3,
    rays: u32,
}

impl<'a> SceneView<'a> {
    fn trace(&self, origin: Vec3, dir: Vec3, t_max: f32) -> Option<Hit> {
        let mut closest = None;
        self.top_level.bvh.traverse(origin, dir, T_MIN, t_max, |instance_index, t_max| {
            let instance = &self.top_level.instances[instance_index as usize];
            let bottom_level = &instance.bottom_level;
            let o = instance.world_to_object.transform_point(origin);
            let d = instance.world_to_object.transform_vector(dir);
            let mut best = None;
            bottom_level.bvh.traverse(o, d, T_MIN, t_max, |prim_ref, t_max| {
                let (geometry, prim, [v0, v1, v2]) = bottom_level.triangle(prim_ref);
                let (t, u, v) = intersect_triangle(o, d, v0, v1, v2, T_MIN, t_max)?;
                best = Some(Hit {
                    t,
                    instance: instance_index as usize,
                    geometry,
                    prim,
                    u,
                    v,
                });
                Some(t)
            });
            best.map(|hit| {
                let t = hit.t;
                closest = Some(hit);
                t
            })
        });
        closest
    }

    fn occluded(&self, origin: Vec3, dir: Vec3, t_max: f32) -> bool {
        self.trace(origin, dir, t_max).is_some()
    }

    fn material(&self, id: u32) -> DisneyMaterial {
        let size = mem::size_of::<DisneyMaterial>();
        let start = (id as usize) * size;
        match self.materials.get(start..start + size) {
            Some(data) => bytemuck::pod_read_unaligned(data),
            None => DisneyMaterial::default(),
        }
    }

    fn environment(&self, dir: Vec3) -> Vec3 {
        let u = (1.0 + dir.x.atan2(-dir.z) / PI) / 2.0;
        let v = dir.y.max(-1.0).min(1.0).acos() / PI;
        self.environment_map.sample(Vec2::new(u, v))
    }

    fn shade(&self, origin: Vec3, dir: Vec3, rng: &mut Lcg) -> Shading {
        let mut rays = 1;
        let hit = match self.trace(origin, dir, f32::MAX) {
            Some(hit) => hit,
            None => {
                let radiance = self.environment(dir.normalized());
                return Shading {
                    radiance,
                    albedo: radiance,
                    normal: Vec3::zero(),
                    rays,
                };
            }
        };

        let instance = &self.top_level.instances[hit.instance];
        let hit_group = instance.record.shader_binding_table_record_offset() + hit.geometry;
        let desc = &self.mesh_descs[self.hit_records[hit_group as usize] as usize];
        let index_start = ((desc.index_offset + hit.prim) as usize) * self.vec3_stride;
        let tri: [u32; 3] = bytemuck::pod_read_unaligned(&self.indices[index_start..index_start + 12]);
        let (w, u, v) = (1.0 - hit.u - hit.v, hit.u, hit.v);
        let vertex = |i: u32| read_vec3(self.vertices, self.vec3_stride, desc.vertex_offset + i);
        let (p0, p1, p2) = (vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
        let object_normal = if desc.normal_offset >= 0 {
            let normal = |i: u32| read_vec3(self.normals, self.vec3_stride, desc.normal_offset as u32 + i);
            w * normal(tri[0]) + u * normal(tri[1]) + v * normal(tri[2])
        } else {
            (p1 - p0).cross(p2 - p0)
        };
        let mut normal = transform_normal(&instance.world_to_object, object_normal).normalized();
        if normal.dot(dir) > 0.0 {
            normal = -normal;
        }
        let tex_coord = if desc.uv_offset >= 0 {
            let uv = |i: u32| {
                let start = ((desc.uv_offset as u32 + i) as usize) * 8;
                let c: [f32; 2] = bytemuck::pod_read_unaligned(&self.uvs[start..start + 8]);
                Vec2::new(c[0], c[1])
            };
            w * uv(tri[0]) + u * uv(tri[1]) + v * uv(tri[2])
        } else {
            Vec2::zero()
        };

        let material = self.material(desc.material_id);
        let base_color = match DisneyMaterial::param_texture_id(material.base_color.x) {
            Some(texture_id) => self
                .textures
                .get(texture_id as usize)
                .map_or(Vec3::zero(), |texture| texture.sample(tex_coord)),
            None => material.base_color,
        };

        let position = origin + hit.t * dir;
        let radiance = if self.lights.is_empty() {
            base_color * normal.dot(dir.normalized()).abs()
        } else {
            let mut radiance = Vec3::zero();
            for light in self.lights.iter() {
                let light_pos = vec3_from_vec4(light.position)
                    + (2.0 * rng.next() - 1.0) * light.v_x.w * vec3_from_vec4(light.v_x)
                    + (2.0 * rng.next() - 1.0) * light.v_y.w * vec3_from_vec4(light.v_y);
                let to_light = light_pos - position;
                let dist_sq = to_light.mag_sq();
                let dist = dist_sq.sqrt();
                let l = to_light / dist;
                let cos = normal.dot(l);
                if cos <= 0.0 {
                    continue;
                }
                rays += 1;
                if self.occluded(position + SHADOW_EPSILON * normal, l, dist - SHADOW_EPSILON) {
                    continue;
                }
                let cos_light = vec3_from_vec4(light.normal).dot(-l).abs();
                let emission = vec3_from_vec4(light.emission);
                radiance += base_color / PI * emission * (cos * cos_light * light.area() / dist_sq);
            }
            radiance
        };

        Shading {
            radiance,
            albedo: base_color,
            normal,
            rays,
        }
    }
}

fn check_handle(data: &[u8], offset: usize, expected: &[u8], what: &str) -> Result<()> {
    match data.get(offset..offset + expected.len()) {
        Some(handle) if handle == expected => Ok(()),
        _ => Err(submit_error(format!("{} record has no matching shader group handle", what))),
    }
}

/// Hit record parameters, after checking every record against the pipeline.
fn validate_shader_binding_table(
    pipeline: &HostPipeline,
    data: &[u8],
    layout: &ShaderBindingLayout,
) -> Result<(RaygenRecord, Vec<u32>)> {
    check_handle(
        data,
        layout.raygen_region.offset as usize,
        pipeline.handle(ShaderGroup::RayGenerator),
        "ray generation",
    )?;
    check_handle(data, layout.miss_region.record_offset(0), pipeline.handle(ShaderGroup::Miss), "miss")?;
    check_handle(
        data,
        layout.miss_region.record_offset(1),
        pipeline.handle(ShaderGroup::OcclusionMiss),
        "occlusion miss",
    )?;
    let raygen = layout
        .raygen_record(data)
        .ok_or_else(|| submit_error("ray generation record out of bounds".into()))?;
    let hit_count = layout.hit_region.record_count();
    let mut hit_records = Vec::with_capacity(hit_count as usize);
    for index in 0..hit_count {
        let (handle, record) = layout
            .hit_group_record(data, index)
            .ok_or_else(|| submit_error(format!("hit record {} out of bounds", index)))?;
        if handle != pipeline.handle(ShaderGroup::ClosestHit) {
            return Err(submit_error(format!("hit record {} has no matching shader group handle", index)));
        }
        hit_records.push(record.mesh_desc_index);
    }
    Ok((raygen, hit_records))
}

pub(super) fn trace_rays(
    pipeline: &HostPipeline,
    bindings: &HostBindingTable,
    sbt_data: &[u8],
    sbt_layout: &ShaderBindingLayout,
    width: u32,
    height: u32,
    vec3_stride: usize,
) -> Result<()> {
    let (raygen, hit_records) = validate_shader_binding_table(pipeline, sbt_data, sbt_layout)?;

    let top_level = match bindings.first(TLAS_SLOT) {
        Some(HostDescriptor::Accel(AccelData::Top(data))) => data.clone(),
        _ => return Err(submit_error("no top level structure bound".into())),
    };
    let (render_target_desc, render_target) = required_texture(bindings, RENDER_TARGET_SLOT)?;
    if (render_target_desc.width, render_target_desc.height) != (width, height) {
        return Err(submit_error(format!(
            "render target is {}x{}, dispatch is {}x{}",
            render_target_desc.width, render_target_desc.height, width, height
        )));
    }
    let accum_buffer = required_buffer(bindings, ACCUM_BUFFER_SLOT)?;
    let view_params: ViewParameters = {
        let data = required_buffer(bindings, VIEW_PARAMS_SLOT)?;
        let data = data.read().unwrap();
        bytemuck::pod_read_unaligned(&data[..mem::size_of::<ViewParameters>()])
    };
    let ray_stats = texture_data(bindings.first(RAY_STATS_SLOT), RAY_STATS_SLOT)?;
    let denoise = bindings.descriptors(DENOISE_OUTPUT_SLOT).is_some();

    let materials = buffer_data(bindings, MATERIALS_SLOT)?;
    let lights = buffer_data(bindings, LIGHTS_SLOT)?;
    let mesh_descs = buffer_data(bindings, MESH_DESCS_SLOT)?;
    let vertices = buffer_data(bindings, VERTICES_SLOT)?;
    let indices = buffer_data(bindings, INDICES_SLOT)?;
    let normals = buffer_data(bindings, NORMALS_SLOT)?;
    let uvs = buffer_data(bindings, UVS_SLOT)?;
    let (environment_desc, environment_data) = required_texture(bindings, ENVIRONMENT_MAP_SLOT)?;
    let textures = bindings
        .descriptors(TEXTURES_SLOT)
        .unwrap_or(&[])
        .iter()
        .map(|descriptor| texture_data(Some(descriptor), TEXTURES_SLOT))
        .collect::<Result<Vec<_>>>()?;

    let materials = read_guard(&materials);
    let lights = read_guard(&lights);
    let mesh_descs = read_guard(&mesh_descs);
    let vertices = read_guard(&vertices);
    let indices = read_guard(&indices);
    let normals = read_guard(&normals);
    let uvs = read_guard(&uvs);
    let environment_data = environment_data.read().unwrap();
    let texture_guards: Vec<_> = textures
        .iter()
        .flatten()
        .map(|(desc, data)| (*desc, data.read().unwrap()))
        .collect();

    let light_data = bytes(&lights);
    let light_count = (raygen.num_lights as usize).min(light_data.len() / mem::size_of::<QuadLight>());
    let scene = SceneView {
        top_level: &top_level,
        hit_records,
        mesh_descs: MeshDesc::read_all(bytes(&mesh_descs)),
        materials: bytes(&materials),
        lights: light_data
            .chunks_exact(mem::size_of::<QuadLight>())
            .take(light_count)
            .map(bytemuck::pod_read_unaligned)
            .collect(),
        vertices: bytes(&vertices),
        indices: bytes(&indices),
        normals: bytes(&normals),
        uvs: bytes(&uvs),
        vec3_stride,
        environment_map: TextureView {
            desc: environment_desc,
            data: &environment_data,
        },
        textures: texture_guards
            .iter()
            .map(|(desc, data)| TextureView { desc: *desc, data })
            .collect(),
    };

    for (index, mesh_desc_index) in scene.hit_records.iter().enumerate() {
        if *mesh_desc_index as usize >= scene.mesh_descs.len() {
            return Err(submit_error(format!(
                "hit record {} references mesh desc {} of {}",
                index,
                mesh_desc_index,
                scene.mesh_descs.len()
            )));
        }
    }
    for (index, instance) in top_level.instances.iter().enumerate() {
        let end = instance.record.shader_binding_table_record_offset() as usize
            + instance.bottom_level.geometries.len();
        if end > scene.hit_records.len() {
            return Err(submit_error(format!(
                "instance {} needs {} hit records, table has {}",
                index,
                end,
                scene.hit_records.len()
            )));
        }
    }

    let accum_pixel_size = if denoise { DENOISE_INPUT_PIXEL_SIZE } else { 16 };
    let pixel_count = (width as usize) * (height as usize);
    let mut accum = accum_buffer.write().unwrap();
    if accum.len() < pixel_count * accum_pixel_size {
        return Err(submit_error("accumulation buffer too small for the frame".into()));
    }

    let cam_pos = vec3_from_vec4(view_params.cam_pos);
    let cam_du = vec3_from_vec4(view_params.cam_du);
    let cam_dv = vec3_from_vec4(view_params.cam_dv);
    let cam_dir_top_left = vec3_from_vec4(view_params.cam_dir_top_left);
    let frame_id = view_params.frame_id;
    let samples_per_pixel = view_params.samples_per_pixel.max(1);

    let pixels: Vec<([Vec4; 3], u32)> = {
        let prev: &[u8] = &accum;
        (0..pixel_count)
            .into_par_iter()
            .map(|pixel| {
                let x = (pixel as u32) % width;
                let y = (pixel as u32) / width;
                let mut rng = Lcg(tea(pixel as u32, frame_id));
                let mut radiance = Vec3::zero();
                let mut albedo = Vec3::zero();
                let mut normal = Vec3::zero();
                let mut rays = 0;
                for _ in 0..samples_per_pixel {
                    let fx = (x as f32 + rng.next()) / (width as f32);
                    let fy = (y as f32 + rng.next()) / (height as f32);
                    let dir = (cam_dir_top_left + fx * cam_du + fy * cam_dv).normalized();
                    let shading = scene.shade(cam_pos, dir, &mut rng);
                    radiance += shading.radiance;
                    albedo += shading.albedo;
                    normal += shading.normal;
                    rays += shading.rays;
                }
                let scale = 1.0 / (samples_per_pixel as f32);
                let current = [radiance * scale, albedo * scale, normal * scale];

                let start = pixel * accum_pixel_size;
                let mut blended = [Vec4::zero(); 3];
                for (channel, (out, value)) in blended
                    .iter_mut()
                    .zip(current.iter())
                    .take(accum_pixel_size / 16)
                    .enumerate()
                {
                    let value = vec4_from_vec3(*value, 1.0);
                    *out = if frame_id == 0 {
                        value
                    } else {
                        let offset = start + 16 * channel;
                        let c: [f32; 4] = bytemuck::pod_read_unaligned(&prev[offset..offset + 16]);
                        let f = frame_id as f32;
                        (Vec4::new(c[0], c[1], c[2], c[3]) * f + value) / (f + 1.0)
                    };
                }
                (blended, rays)
            })
            .collect()
    };

    let mut render_target = render_target.write().unwrap();
    let mut ray_counts = ray_stats.as_ref().map(|(_, data)| data.write().unwrap());
    for (pixel, (blended, rays)) in pixels.iter().enumerate() {
        let start = pixel * accum_pixel_size;
        for (channel, value) in blended.iter().take(accum_pixel_size / 16).enumerate() {
            let offset = start + 16 * channel;
            accum[offset..offset + 16].copy_from_slice(bytemuck::bytes_of(value));
        }
        if !denoise {
            render_target[4 * pixel..4 * pixel + 4].copy_from_slice(&srgb8_from_linear(vec3_from_vec4(blended[0])));
        }
        if let Some(ray_counts) = ray_counts.as_mut() {
            ray_counts[4 * pixel..4 * pixel + 4].copy_from_slice(&rays.to_le_bytes());
        }
    }
    Ok(())
}

/// Writes denoised color, or accumulated color when no denoise output is bound, to the render target.
pub(super) fn tonemap(bindings: &HostBindingTable, width: u32, height: u32) -> Result<()> {
    let (render_target_desc, render_target) = required_texture(bindings, RENDER_TARGET_SLOT)?;
    if (render_target_desc.width, render_target_desc.height) != (width, height) {
        return Err(submit_error("tonemap size does not match the render target".into()));
    }
    let pixel_count = (width as usize) * (height as usize);
    let (source, stride) = match buffer_data(bindings, DENOISE_OUTPUT_SLOT)? {
        Some(data) => (data, DENOISE_OUTPUT_PIXEL_SIZE),
        None => {
            let data = required_buffer(bindings, ACCUM_BUFFER_SLOT)?;
            let stride = data.read().unwrap().len() / pixel_count.max(1);
            (data, stride)
        }
    };
    let source = source.read().unwrap();
    if stride < 16 || source.len() < pixel_count * stride {
        return Err(submit_error("tonemap source too small for the frame".into()));
    }
    let mut render_target = render_target.write().unwrap();
    for pixel in 0..pixel_count {
        let c: [f32; 4] = bytemuck::pod_read_unaligned(&source[pixel * stride..pixel * stride + 16]);
        render_target[4 * pixel..4 * pixel + 4].copy_from_slice(&srgb8_from_linear(Vec3::new(c[0], c[1], c[2])));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::TextureUsage;

    #[test]
    fn rng_in_unit_interval() {
        let mut rng = Lcg(tea(17, 3));
        for _ in 0..1000 {
            let x = rng.next();
            assert!((0.0..1.0).contains(&x));
        }
        assert_ne!(tea(0, 0), tea(1, 0));
    }

    #[test]
    fn normal_transform_under_scale() {
        let object_to_world = Transform3x4([2.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let world_to_object = object_to_world.inversed().unwrap();
        // plane x = y in object space
        let n = transform_normal(&world_to_object, Vec3::new(1.0, -1.0, 0.0)).normalized();
        let tangent = object_to_world.transform_vector(Vec3::new(1.0, 1.0, 0.0));
        assert!(n.dot(tangent).abs() < 1.0e-6);
    }

    #[test]
    fn nearest_sampling_wraps() {
        let data: Vec<u8> = vec![255, 0, 0, 255, 0, 255, 0, 255];
        let view = TextureView {
            desc: TextureDesc::new(2, 1, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED),
            data: &data,
        };
        assert_eq!(view.sample(Vec2::new(0.25, 0.5)), Vec3::unit_x());
        assert_eq!(view.sample(Vec2::new(1.75, 0.5)), Vec3::unit_y());
        assert_eq!(view.sample(Vec2::new(-0.25, 0.5)), Vec3::unit_y());
    }
}
