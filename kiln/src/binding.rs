use crate::{config::*, device::*, error::*, usage::*};
use bytemuck::{Pod, Zeroable};

pub const TLAS_SLOT: u32 = 0;
pub const RENDER_TARGET_SLOT: u32 = 1;
pub const ACCUM_BUFFER_SLOT: u32 = 2;
pub const VIEW_PARAMS_SLOT: u32 = 3;
pub const MATERIALS_SLOT: u32 = 4;
pub const LIGHTS_SLOT: u32 = 5;
pub const MESH_DESCS_SLOT: u32 = 6;
pub const VERTICES_SLOT: u32 = 7;
pub const INDICES_SLOT: u32 = 8;
pub const NORMALS_SLOT: u32 = 9;
pub const UVS_SLOT: u32 = 10;
pub const ENVIRONMENT_MAP_SLOT: u32 = 11;
pub const TEXTURES_SLOT: u32 = 12;
pub const RAY_STATS_SLOT: u32 = 13;
pub const DENOISE_OUTPUT_SLOT: u32 = 14;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    AccelerationStructure,
    StorageImage,
    StorageBuffer,
    UniformBuffer,
    SampledImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    pub slot: u32,
    pub kind: DescriptorKind,
    pub count: u32,
}

/// Slot shape shared by the shaders and every binding table built for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    entries: Vec<BindingLayoutEntry>,
}

impl BindingLayout {
    pub fn new(config: &RenderConfig, texture_count: usize) -> Self {
        let entry = |slot, kind, count| BindingLayoutEntry { slot, kind, count };
        let mut entries = vec![
            entry(TLAS_SLOT, DescriptorKind::AccelerationStructure, 1),
            entry(RENDER_TARGET_SLOT, DescriptorKind::StorageImage, 1),
            entry(ACCUM_BUFFER_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(VIEW_PARAMS_SLOT, DescriptorKind::UniformBuffer, 1),
            entry(MATERIALS_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(LIGHTS_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(MESH_DESCS_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(VERTICES_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(INDICES_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(NORMALS_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(UVS_SLOT, DescriptorKind::StorageBuffer, 1),
            entry(ENVIRONMENT_MAP_SLOT, DescriptorKind::SampledImage, 1),
            entry(TEXTURES_SLOT, DescriptorKind::SampledImage, texture_count.max(1) as u32),
        ];
        if config.report_ray_stats {
            entries.push(entry(RAY_STATS_SLOT, DescriptorKind::StorageImage, 1));
        }
        if config.denoise {
            entries.push(entry(DENOISE_OUTPUT_SLOT, DescriptorKind::StorageBuffer, 1));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[BindingLayoutEntry] {
        &self.entries
    }

    pub fn entry(&self, slot: u32) -> Option<&BindingLayoutEntry> {
        self.entries.iter().find(|entry| entry.slot == slot)
    }

    pub fn descriptor_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.count as usize).sum()
    }
}

/// One array element of a binding, `Null` for an optional resource that is absent.
pub enum Descriptor<'a, D: Device + ?Sized> {
    Accel(&'a D::Accel),
    Buffer(&'a D::Buffer),
    Texture(&'a D::Texture),
    Null,
}

impl<'a, D: Device + ?Sized> Clone for Descriptor<'a, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, D: Device + ?Sized> Copy for Descriptor<'a, D> {}

impl<'a, D: Device + ?Sized> Descriptor<'a, D> {
    pub fn uid(&self) -> u64 {
        match self {
            Descriptor::Accel(accel) => accel.uid(),
            Descriptor::Buffer(buffer) => buffer.uid(),
            Descriptor::Texture(texture) => texture.uid(),
            Descriptor::Null => 0,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Descriptor::Null)
    }
}

/// Everything the shaders read or write during a frame.
pub struct BindingResources<'a, D: Device + ?Sized> {
    pub tlas: &'a D::Accel,
    pub render_target: &'a D::Texture,
    pub accum_buffer: &'a D::Buffer,
    pub view_params: &'a D::Buffer,
    pub materials: Option<&'a D::Buffer>,
    pub lights: Option<&'a D::Buffer>,
    pub mesh_descs: Option<&'a D::Buffer>,
    pub vertices: Option<&'a D::Buffer>,
    pub indices: Option<&'a D::Buffer>,
    pub normals: Option<&'a D::Buffer>,
    pub uvs: Option<&'a D::Buffer>,
    pub environment_map: &'a D::Texture,
    pub textures: &'a [D::Texture],
    /// Bound in place of the texture array when the scene has no textures.
    pub texture_placeholder: &'a D::Texture,
    pub ray_stats: Option<&'a D::Texture>,
    pub denoise_output: Option<&'a D::Buffer>,
}

pub struct BindingWrite<'a, D: Device + ?Sized> {
    pub slot: u32,
    pub kind: DescriptorKind,
    pub descriptors: Vec<Descriptor<'a, D>>,
}

/// Encoded form of one descriptor, the unit a binding table is compared in.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub struct DescriptorRecord {
    pub slot: u32,
    /// Kind in the top 8 bits, array element below.
    pub kind_element: u32,
    pub resource_uid: u64,
}

/// Fully populated contents for every slot of a layout.
pub struct BindingTableDesc<'a, D: Device + ?Sized> {
    writes: Vec<BindingWrite<'a, D>>,
}

fn check_buffer<D: Device + ?Sized>(slot: u32, kind: DescriptorKind, buffer: &D::Buffer) -> Result<()> {
    let required = match kind {
        DescriptorKind::UniformBuffer => BufferUsage::UNIFORM,
        _ => BufferUsage::STORAGE,
    };
    if buffer.desc().usage.contains(required) {
        Ok(())
    } else {
        Err(Error::Binding(format!("slot {}: buffer lacks {:?} usage", slot, required)))
    }
}

fn check_texture<D: Device + ?Sized>(slot: u32, kind: DescriptorKind, texture: &D::Texture) -> Result<()> {
    let required = match kind {
        DescriptorKind::StorageImage => TextureUsage::STORAGE,
        _ => TextureUsage::SAMPLED,
    };
    if texture.desc().usage.contains(required) {
        Ok(())
    } else {
        Err(Error::Binding(format!("slot {}: texture lacks {:?} usage", slot, required)))
    }
}

impl<'a, D: Device + ?Sized> BindingTableDesc<'a, D> {
    pub fn new(layout: &BindingLayout, resources: &BindingResources<'a, D>) -> Result<Self> {
        let optional_present = [
            (RAY_STATS_SLOT, resources.ray_stats.is_some()),
            (DENOISE_OUTPUT_SLOT, resources.denoise_output.is_some()),
        ];
        for &(slot, present) in optional_present.iter() {
            if present && layout.entry(slot).is_none() {
                return Err(Error::Binding(format!("slot {} is not part of the layout", slot)));
            }
        }

        let buffer = |b: Option<&'a D::Buffer>| b.map_or(Descriptor::Null, Descriptor::Buffer);
        let mut writes = Vec::with_capacity(layout.entries().len());
        for entry in layout.entries() {
            let descriptors = match entry.slot {
                TLAS_SLOT => vec![Descriptor::Accel(resources.tlas)],
                RENDER_TARGET_SLOT => vec![Descriptor::Texture(resources.render_target)],
                ACCUM_BUFFER_SLOT => vec![Descriptor::Buffer(resources.accum_buffer)],
                VIEW_PARAMS_SLOT => vec![Descriptor::Buffer(resources.view_params)],
                MATERIALS_SLOT => vec![buffer(resources.materials)],
                LIGHTS_SLOT => vec![buffer(resources.lights)],
                MESH_DESCS_SLOT => vec![buffer(resources.mesh_descs)],
                VERTICES_SLOT => vec![buffer(resources.vertices)],
                INDICES_SLOT => vec![buffer(resources.indices)],
                NORMALS_SLOT => vec![buffer(resources.normals)],
                UVS_SLOT => vec![buffer(resources.uvs)],
                ENVIRONMENT_MAP_SLOT => vec![Descriptor::Texture(resources.environment_map)],
                TEXTURES_SLOT => {
                    if resources.textures.is_empty() {
                        vec![Descriptor::Texture(resources.texture_placeholder)]
                    } else {
                        resources.textures.iter().map(Descriptor::Texture).collect()
                    }
                }
                RAY_STATS_SLOT => vec![resources
                    .ray_stats
                    .map(Descriptor::Texture)
                    .ok_or_else(|| Error::Binding("ray statistics image missing".into()))?],
                DENOISE_OUTPUT_SLOT => vec![resources
                    .denoise_output
                    .map(Descriptor::Buffer)
                    .ok_or_else(|| Error::Binding("denoise output buffer missing".into()))?],
                slot => return Err(Error::Binding(format!("unknown slot {}", slot))),
            };
            if descriptors.len() != entry.count as usize {
                return Err(Error::Binding(format!(
                    "slot {} has {} descriptors, layout expects {}",
                    entry.slot,
                    descriptors.len(),
                    entry.count
                )));
            }
            for descriptor in descriptors.iter() {
                match (entry.kind, descriptor) {
                    (DescriptorKind::AccelerationStructure, Descriptor::Accel(_)) => {}
                    (DescriptorKind::StorageBuffer, Descriptor::Buffer(b))
                    | (DescriptorKind::UniformBuffer, Descriptor::Buffer(b)) => {
                        check_buffer::<D>(entry.slot, entry.kind, b)?
                    }
                    (DescriptorKind::StorageImage, Descriptor::Texture(t))
                    | (DescriptorKind::SampledImage, Descriptor::Texture(t)) => {
                        check_texture::<D>(entry.slot, entry.kind, t)?
                    }
                    (DescriptorKind::StorageBuffer, Descriptor::Null) => {}
                    (kind, _) => {
                        return Err(Error::Binding(format!(
                            "slot {} expects a {:?} descriptor",
                            entry.slot, kind
                        )))
                    }
                }
            }
            writes.push(BindingWrite {
                slot: entry.slot,
                kind: entry.kind,
                descriptors,
            });
        }
        Ok(Self { writes })
    }

    pub fn writes(&self) -> &[BindingWrite<'a, D>] {
        &self.writes
    }

    pub fn records(&self) -> Vec<DescriptorRecord> {
        self.writes
            .iter()
            .flat_map(|write| {
                write
                    .descriptors
                    .iter()
                    .enumerate()
                    .map(move |(element, descriptor)| DescriptorRecord {
                        slot: write.slot,
                        kind_element: ((write.kind as u32) << 24) | (element as u32),
                        resource_uid: descriptor.uid(),
                    })
            })
            .collect()
    }

    /// Byte image of the table, identical for identical inputs.
    pub fn encode(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.records()).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_slots_come_last() {
        let base = BindingLayout::new(&RenderConfig::default(), 0);
        let full = BindingLayout::new(
            &RenderConfig {
                report_ray_stats: true,
                denoise: true,
                display_surface: false,
            },
            3,
        );
        assert_eq!(base.entries().len(), 13);
        assert_eq!(full.entries().len(), 15);
        for (a, b) in base.entries().iter().zip(full.entries().iter()) {
            assert_eq!(a.slot, b.slot);
            assert_eq!(a.kind, b.kind);
        }
        assert_eq!(base.entry(TEXTURES_SLOT).map(|e| e.count), Some(1));
        assert_eq!(full.entry(TEXTURES_SLOT).map(|e| e.count), Some(3));
        assert_eq!(full.entries()[13].slot, RAY_STATS_SLOT);
        assert_eq!(full.entries()[14].slot, DENOISE_OUTPUT_SLOT);
        assert_eq!(base.descriptor_count(), 13);
    }

    #[test]
    fn record_size() {
        assert_eq!(std::mem::size_of::<DescriptorRecord>(), 16);
    }
}
