mod bvh;
mod kernels;

pub use bvh::{Aabb, Bvh};

use crate::{
    accel::AccelerationStructureInstance, binding::*, device::*, error::*, maths::*, resource::copy_rows, sbt::*,
    shader::*, usage::*,
};
use bvh::NODE_SIZE;
use bytemuck::Contiguous;
use log::{debug, info};
use slotmap::{new_key_type, Key, KeyData, SlotMap};
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

/// Bytes of device memory per stored triangle.
const TRIANGLE_SIZE: u64 = 36;

const INSTANCE_SIZE: u64 = mem::size_of::<AccelerationStructureInstance>() as u64;

new_key_type! {
    struct AccelKey;
}

#[derive(Debug, Clone, Copy)]
pub struct HostDeviceParams {
    pub vec3_stride: u32,
    pub texture_row_pitch_alignment: u32,
    /// Total bytes that may be allocated before allocation fails.
    pub memory_budget: Option<usize>,
}

impl Default for HostDeviceParams {
    fn default() -> Self {
        Self {
            vec3_stride: 12,
            texture_row_pitch_alignment: 256,
            memory_budget: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocation_count: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct MemoryTracker {
    usage: [MemoryUsage; 3],
}

impl MemoryTracker {
    fn index(class: MemoryClass) -> usize {
        match class {
            MemoryClass::Upload => 0,
            MemoryClass::Device => 1,
            MemoryClass::Readback => 2,
        }
    }

    fn total_bytes(&self) -> usize {
        self.usage.iter().map(|usage| usage.bytes).sum()
    }
}

/// Accounts for one allocation until dropped.
struct Allocation {
    tracker: Arc<Mutex<MemoryTracker>>,
    class: MemoryClass,
    size: usize,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let mut tracker = self.tracker.lock().unwrap();
        let usage = &mut tracker.usage[MemoryTracker::index(self.class)];
        usage.allocation_count -= 1;
        usage.bytes -= self.size;
    }
}

/// Work recorded by the device in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    CopyBuffer { src: u64, dst: u64 },
    CopyBufferToTexture { src: u64, dst: u64 },
    CopyTextureToBuffer { src: u64, dst: u64 },
    BuildBottomLevel { accel: u64, geometry_count: u32 },
    QueryCompactedSize { accel: u64 },
    Compact { src: u64, dst: u64 },
    BuildTopLevel { accel: u64, instance_count: u32 },
    DispatchRays { width: u32, height: u32 },
    DispatchTonemap { width: u32, height: u32 },
    WaitIdle,
}

type SharedData = Arc<RwLock<Vec<u8>>>;

pub struct HostBuffer {
    desc: BufferDesc,
    uid: u64,
    data: SharedData,
    _allocation: Allocation,
}

impl DeviceResource for HostBuffer {
    fn uid(&self) -> u64 {
        self.uid
    }
}

impl DeviceBuffer for HostBuffer {
    fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

/// Texture contents with tightly packed rows.
pub struct HostTexture {
    desc: TextureDesc,
    uid: u64,
    data: SharedData,
    _allocation: Allocation,
}

impl DeviceResource for HostTexture {
    fn uid(&self) -> u64 {
        self.uid
    }
}

impl DeviceTexture for HostTexture {
    fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

struct GeometryData {
    positions: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
}

struct BottomLevelData {
    geometries: Vec<GeometryData>,
    /// (geometry index, primitive index) for each hierarchy primitive.
    prim_refs: Vec<(u32, u32)>,
    bvh: Bvh,
}

impl BottomLevelData {
    fn compacted_size(&self) -> u64 {
        NODE_SIZE * (self.bvh.node_count() as u64) + TRIANGLE_SIZE * (self.prim_refs.len() as u64)
    }

    fn triangle(&self, prim_ref: u32) -> (u32, u32, [Vec3; 3]) {
        let (geometry_index, prim) = self.prim_refs[prim_ref as usize];
        let geometry = &self.geometries[geometry_index as usize];
        let [a, b, c] = geometry.triangles[prim as usize];
        (
            geometry_index,
            prim,
            [
                geometry.positions[a as usize],
                geometry.positions[b as usize],
                geometry.positions[c as usize],
            ],
        )
    }
}

struct InstanceData {
    record: AccelerationStructureInstance,
    world_to_object: Transform3x4,
    bottom_level: Arc<BottomLevelData>,
}

struct TopLevelData {
    instances: Vec<InstanceData>,
    bvh: Bvh,
}

#[derive(Clone)]
enum AccelData {
    Bottom(Arc<BottomLevelData>),
    Top(Arc<TopLevelData>),
}

type AccelRegistry = Arc<Mutex<SlotMap<AccelKey, AccelData>>>;

pub struct HostAccel {
    uid: u64,
    key: AccelKey,
    size: u64,
    data: AccelData,
    registry: AccelRegistry,
    _allocation: Allocation,
}

impl DeviceResource for HostAccel {
    fn uid(&self) -> u64 {
        self.uid
    }
}

impl DeviceAccel for HostAccel {
    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> u64 {
        self.key.data().as_ffi()
    }
}

impl Drop for HostAccel {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(self.key);
    }
}

pub struct HostPipeline {
    uid: u64,
    layout: BindingLayout,
    handles: Vec<u8>,
}

impl HostPipeline {
    const HANDLE_SIZE: usize = 32;

    fn handle(&self, group: ShaderGroup) -> &[u8] {
        let start = group.into_integer() * Self::HANDLE_SIZE;
        &self.handles[start..start + Self::HANDLE_SIZE]
    }
}

enum HostDescriptor {
    Accel(AccelData),
    Buffer(BufferDesc, SharedData),
    Texture(TextureDesc, SharedData),
    Null,
}

struct HostBinding {
    slot: u32,
    descriptors: Vec<HostDescriptor>,
}

pub struct HostBindingTable {
    pipeline_uid: u64,
    bindings: Vec<HostBinding>,
}

impl HostBindingTable {
    fn descriptors(&self, slot: u32) -> Option<&[HostDescriptor]> {
        self.bindings
            .iter()
            .find(|binding| binding.slot == slot)
            .map(|binding| binding.descriptors.as_slice())
    }

    fn first(&self, slot: u32) -> Option<&HostDescriptor> {
        self.descriptors(slot).and_then(|descriptors| descriptors.first())
    }
}

/// Reference device executing every command on the host as it is submitted.
pub struct HostDevice {
    params: HostDeviceParams,
    limits: DeviceLimits,
    next_uid: AtomicU64,
    memory: Arc<Mutex<MemoryTracker>>,
    accels: AccelRegistry,
    commands: Mutex<Vec<HostCommand>>,
    timestamps: Mutex<Option<(Instant, Instant)>>,
}

impl HostDevice {
    pub fn new(params: HostDeviceParams) -> Self {
        let limits = DeviceLimits {
            shader_group_handle_size: HostPipeline::HANDLE_SIZE as u32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            texture_row_pitch_alignment: params.texture_row_pitch_alignment,
            vec3_stride: params.vec3_stride,
        };
        info!(
            "host device: vec3 stride {}, row pitch alignment {}",
            limits.vec3_stride, limits.texture_row_pitch_alignment
        );
        Self {
            params,
            limits,
            next_uid: AtomicU64::new(1),
            memory: Arc::new(Mutex::new(MemoryTracker::default())),
            accels: Arc::new(Mutex::new(SlotMap::with_key())),
            commands: Mutex::new(Vec::new()),
            timestamps: Mutex::new(None),
        }
    }

    pub fn memory_usage(&self, class: MemoryClass) -> MemoryUsage {
        self.memory.lock().unwrap().usage[MemoryTracker::index(class)]
    }

    pub fn total_allocated_bytes(&self) -> usize {
        self.memory.lock().unwrap().total_bytes()
    }

    pub fn live_accel_count(&self) -> usize {
        self.accels.lock().unwrap().len()
    }

    pub fn command_log(&self) -> Vec<HostCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear_command_log(&self) {
        self.commands.lock().unwrap().clear();
    }

    fn record(&self, command: HostCommand) {
        self.commands.lock().unwrap().push(command);
    }

    fn allocate_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    fn allocate(&self, class: MemoryClass, size: usize, what: &'static str) -> Result<Allocation> {
        let mut tracker = self.memory.lock().unwrap();
        if let Some(budget) = self.params.memory_budget {
            if tracker.total_bytes() + size > budget {
                return Err(Error::OutOfMemory { what, size });
            }
        }
        let usage = &mut tracker.usage[MemoryTracker::index(class)];
        usage.allocation_count += 1;
        usage.bytes += size;
        Ok(Allocation {
            tracker: Arc::clone(&self.memory),
            class,
            size,
        })
    }

    fn create_accel(&self, data: AccelData, size: u64, what: &'static str) -> Result<HostAccel> {
        let allocation = self.allocate(MemoryClass::Device, size as usize, what)?;
        let key = self.accels.lock().unwrap().insert(data.clone());
        Ok(HostAccel {
            uid: self.allocate_uid(),
            key,
            size,
            data,
            registry: Arc::clone(&self.accels),
            _allocation: allocation,
        })
    }

    fn create_scratch(&self, size: u64) -> Result<HostBuffer> {
        self.create_buffer(
            &BufferDesc::new(size.max(16) as usize, MemoryClass::Device, BufferUsage::STORAGE),
            "build scratch",
        )
    }

    fn check_pitch(&self, desc: &TextureDesc, row_pitch: usize, buffer: &HostBuffer) -> Result<()> {
        let alignment = self.limits.texture_row_pitch_alignment as usize;
        if row_pitch < desc.row_bytes() || row_pitch % alignment != 0 {
            return Err(Error::ResourceAccess(format!(
                "row pitch {} invalid for {} byte rows",
                row_pitch,
                desc.row_bytes()
            )));
        }
        if buffer.desc.size < row_pitch * (desc.height as usize) {
            return Err(Error::ResourceAccess(format!(
                "buffer of {} bytes too small for {} rows of pitch {}",
                buffer.desc.size, desc.height, row_pitch
            )));
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(HostDeviceParams::default())
    }
}

fn require_buffer_usage(buffer: &HostBuffer, usage: BufferUsage) -> Result<()> {
    if buffer.desc.usage.contains(usage) {
        Ok(())
    } else {
        Err(Error::ResourceAccess(format!(
            "buffer {} lacks {:?} usage",
            buffer.uid, usage
        )))
    }
}

fn check_range(buffer_size: usize, offset: usize, len: usize) -> Result<()> {
    if offset + len > buffer_size {
        Err(Error::ResourceAccess(format!(
            "range {}..{} outside buffer of {} bytes",
            offset,
            offset + len,
            buffer_size
        )))
    } else {
        Ok(())
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type Texture = HostTexture;
    type Accel = HostAccel;
    type BindingTable = HostBindingTable;
    type Pipeline = HostPipeline;

    fn name(&self) -> &str {
        "host"
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc, what: &'static str) -> Result<HostBuffer> {
        if desc.size == 0 {
            return Err(Error::ResourceAccess(format!("{}: zero sized buffer", what)));
        }
        let allocation = self.allocate(desc.memory, desc.size, what)?;
        Ok(HostBuffer {
            desc: *desc,
            uid: self.allocate_uid(),
            data: Arc::new(RwLock::new(vec![0u8; desc.size])),
            _allocation: allocation,
        })
    }

    fn write_buffer(&self, buffer: &HostBuffer, offset: usize, data: &[u8]) -> Result<()> {
        if buffer.desc.memory != MemoryClass::Upload {
            return Err(Error::ResourceAccess(format!(
                "buffer {} is not host writable",
                buffer.uid
            )));
        }
        check_range(buffer.desc.size, offset, data.len())?;
        buffer.data.write().unwrap()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HostBuffer, offset: usize, data: &mut [u8]) -> Result<()> {
        if buffer.desc.memory != MemoryClass::Readback {
            return Err(Error::ResourceAccess(format!(
                "buffer {} is not host readable",
                buffer.uid
            )));
        }
        check_range(buffer.desc.size, offset, data.len())?;
        data.copy_from_slice(&buffer.data.read().unwrap()[offset..offset + data.len()]);
        Ok(())
    }

    fn copy_buffer(&self, src: &HostBuffer, dst: &HostBuffer, regions: &[BufferCopyRegion]) -> Result<()> {
        if src.uid == dst.uid {
            return Err(Error::ResourceAccess("copy within one buffer".into()));
        }
        require_buffer_usage(src, BufferUsage::TRANSFER_SRC)?;
        require_buffer_usage(dst, BufferUsage::TRANSFER_DST)?;
        for region in regions.iter() {
            check_range(src.desc.size, region.src_offset, region.size)?;
            check_range(dst.desc.size, region.dst_offset, region.size)?;
        }
        self.record(HostCommand::CopyBuffer {
            src: src.uid,
            dst: dst.uid,
        });
        let src_data = src.data.read().unwrap();
        let mut dst_data = dst.data.write().unwrap();
        for region in regions.iter() {
            dst_data[region.dst_offset..region.dst_offset + region.size]
                .copy_from_slice(&src_data[region.src_offset..region.src_offset + region.size]);
        }
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc, what: &'static str) -> Result<HostTexture> {
        let size = desc.size_in_bytes();
        if size == 0 {
            return Err(Error::ResourceAccess(format!("{}: zero sized texture", what)));
        }
        let allocation = self.allocate(MemoryClass::Device, size, what)?;
        Ok(HostTexture {
            desc: *desc,
            uid: self.allocate_uid(),
            data: Arc::new(RwLock::new(vec![0u8; size])),
            _allocation: allocation,
        })
    }

    fn copy_buffer_to_texture(&self, src: &HostBuffer, row_pitch: usize, dst: &HostTexture) -> Result<()> {
        require_buffer_usage(src, BufferUsage::TRANSFER_SRC)?;
        if !dst.desc.usage.contains(TextureUsage::TRANSFER_DST) {
            return Err(Error::ResourceAccess(format!("texture {} lacks transfer dst usage", dst.uid)));
        }
        self.check_pitch(&dst.desc, row_pitch, src)?;
        self.record(HostCommand::CopyBufferToTexture {
            src: src.uid,
            dst: dst.uid,
        });
        let row_bytes = dst.desc.row_bytes();
        copy_rows(
            &src.data.read().unwrap(),
            row_pitch,
            &mut dst.data.write().unwrap(),
            row_bytes,
            row_bytes,
            dst.desc.height as usize,
        );
        Ok(())
    }

    fn copy_texture_to_buffer(&self, src: &HostTexture, dst: &HostBuffer, row_pitch: usize) -> Result<()> {
        require_buffer_usage(dst, BufferUsage::TRANSFER_DST)?;
        if !src.desc.usage.contains(TextureUsage::TRANSFER_SRC) {
            return Err(Error::ResourceAccess(format!("texture {} lacks transfer src usage", src.uid)));
        }
        self.check_pitch(&src.desc, row_pitch, dst)?;
        self.record(HostCommand::CopyTextureToBuffer {
            src: src.uid,
            dst: dst.uid,
        });
        let row_bytes = src.desc.row_bytes();
        copy_rows(
            &src.data.read().unwrap(),
            row_bytes,
            &mut dst.data.write().unwrap(),
            row_pitch,
            row_bytes,
            src.desc.height as usize,
        );
        Ok(())
    }

    fn build_bottom_level(
        &self,
        geometries: &[TriangleGeometryInput<'_, HostBuffer>],
    ) -> Result<AccelBuild<HostAccel, HostBuffer>> {
        let mut geometry_data = Vec::with_capacity(geometries.len());
        let mut prim_refs = Vec::new();
        let mut prim_bounds = Vec::new();
        for (geometry_index, input) in geometries.iter().enumerate() {
            require_buffer_usage(input.vertices, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT)?;
            require_buffer_usage(input.indices, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT)?;
            let stride = input.vertex_stride as usize;
            let vertex_data = input.vertices.data.read().unwrap();
            let index_data = input.indices.data.read().unwrap();
            if vertex_data.len() < stride * (input.vertex_count as usize)
                || index_data.len() < 12 * (input.triangle_count as usize)
            {
                return Err(Error::AccelBuild(format!(
                    "geometry {} inputs smaller than declared counts",
                    geometry_index
                )));
            }
            let positions: Vec<Vec3> = (0..input.vertex_count as usize)
                .map(|i| {
                    let p: [f32; 3] = bytemuck::pod_read_unaligned(&vertex_data[i * stride..i * stride + 12]);
                    Vec3::new(p[0], p[1], p[2])
                })
                .collect();
            let triangles: Vec<[u32; 3]> = index_data[..12 * (input.triangle_count as usize)]
                .chunks_exact(12)
                .map(bytemuck::pod_read_unaligned)
                .collect();
            for (prim, tri) in triangles.iter().enumerate() {
                if tri.iter().any(|&i| i >= input.vertex_count) {
                    return Err(Error::AccelBuild(format!(
                        "geometry {} triangle {} indexes past {} vertices",
                        geometry_index, prim, input.vertex_count
                    )));
                }
                let corners = [
                    positions[tri[0] as usize],
                    positions[tri[1] as usize],
                    positions[tri[2] as usize],
                ];
                prim_bounds.push(Aabb::from_points(&corners));
                prim_refs.push((geometry_index as u32, prim as u32));
            }
            geometry_data.push(GeometryData { positions, triangles });
        }

        let bvh = Bvh::build(&prim_bounds);
        let prim_count = prim_refs.len() as u64;
        let size = NODE_SIZE * (Bvh::max_node_count(prim_bounds.len()) as u64) + TRIANGLE_SIZE * prim_count;
        let data = BottomLevelData {
            geometries: geometry_data,
            prim_refs,
            bvh,
        };
        let accel = self.create_accel(AccelData::Bottom(Arc::new(data)), size, "bottom level")?;
        let scratch = self.create_scratch(NODE_SIZE * prim_count)?;
        self.record(HostCommand::BuildBottomLevel {
            accel: accel.uid,
            geometry_count: geometries.len() as u32,
        });
        debug!("host bottom level: {} triangles, {} bytes", prim_count, size);
        Ok(AccelBuild { accel, scratch })
    }

    fn query_compacted_size(&self, accel: &HostAccel) -> Result<u64> {
        self.record(HostCommand::QueryCompactedSize { accel: accel.uid });
        match &accel.data {
            AccelData::Bottom(data) => Ok(data.compacted_size()),
            AccelData::Top(_) => Err(Error::AccelBuild("compaction is only queried for bottom levels".into())),
        }
    }

    fn compact(&self, accel: &HostAccel, compacted_size: u64) -> Result<HostAccel> {
        let required = match &accel.data {
            AccelData::Bottom(data) => data.compacted_size(),
            AccelData::Top(_) => accel.size,
        };
        if compacted_size < required {
            return Err(Error::AccelBuild(format!(
                "compacted size {} below required {}",
                compacted_size, required
            )));
        }
        let compacted = self.create_accel(accel.data.clone(), compacted_size, "compacted bottom level")?;
        self.record(HostCommand::Compact {
            src: accel.uid,
            dst: compacted.uid,
        });
        Ok(compacted)
    }

    fn build_top_level(
        &self,
        instances: &HostBuffer,
        instance_count: u32,
    ) -> Result<AccelBuild<HostAccel, HostBuffer>> {
        require_buffer_usage(instances, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT)?;
        let record_data = instances.data.read().unwrap();
        let record_size = INSTANCE_SIZE as usize;
        if record_data.len() < record_size * (instance_count as usize) {
            return Err(Error::AccelBuild(format!(
                "instance buffer holds fewer than {} records",
                instance_count
            )));
        }

        let registry = self.accels.lock().unwrap();
        let mut instance_data = Vec::with_capacity(instance_count as usize);
        let mut instance_bounds = Vec::with_capacity(instance_count as usize);
        for (index, chunk) in record_data
            .chunks_exact(record_size)
            .take(instance_count as usize)
            .enumerate()
        {
            let record: AccelerationStructureInstance = bytemuck::pod_read_unaligned(chunk);
            let key = AccelKey::from(KeyData::from_ffi(record.acceleration_structure_reference));
            let bottom_level = match registry.get(key) {
                Some(AccelData::Bottom(data)) => Arc::clone(data),
                _ => {
                    return Err(Error::AccelBuild(format!(
                        "instance {} references no live bottom level structure",
                        index
                    )))
                }
            };
            let world_to_object = record
                .transform
                .inversed()
                .ok_or_else(|| Error::AccelBuild(format!("instance {} has a singular transform", index)))?;
            instance_bounds.push(bottom_level.bvh.bounds().transformed(&record.transform));
            instance_data.push(InstanceData {
                record,
                world_to_object,
                bottom_level,
            });
        }
        drop(registry);

        let bvh = Bvh::build(&instance_bounds);
        let size = NODE_SIZE * (Bvh::max_node_count(instance_data.len()) as u64)
            + INSTANCE_SIZE * (instance_data.len() as u64);
        let data = TopLevelData {
            instances: instance_data,
            bvh,
        };
        let accel = self.create_accel(AccelData::Top(Arc::new(data)), size, "top level")?;
        let scratch = self.create_scratch(NODE_SIZE * u64::from(instance_count))?;
        self.record(HostCommand::BuildTopLevel {
            accel: accel.uid,
            instance_count,
        });
        Ok(AccelBuild { accel, scratch })
    }

    fn create_pipeline(&self, layout: &BindingLayout, shaders: &dyn ShaderLibrary) -> Result<HostPipeline> {
        if shaders.format() != ShaderFormat::Host {
            return Err(Error::Pipeline(format!(
                "host device cannot run {:?} shaders",
                shaders.format()
            )));
        }
        for entry_point in PIPELINE_ENTRY_POINTS.iter() {
            let bytecode = shaders.load(entry_point)?;
            if bytecode.format != ShaderFormat::Host || bytecode.code != entry_point.as_bytes() {
                return Err(Error::Pipeline(format!("{} is not a host kernel", entry_point)));
            }
        }
        let uid = self.allocate_uid();
        let mut handles = vec![0u8; ShaderGroup::COUNT * HostPipeline::HANDLE_SIZE];
        for (group, handle) in handles.chunks_mut(HostPipeline::HANDLE_SIZE).enumerate() {
            handle[0..4].copy_from_slice(&(group as u32 + 1).to_le_bytes());
            handle[4..8].copy_from_slice(&(uid as u32).to_le_bytes());
        }
        debug!("host pipeline {} with {} bindings", uid, layout.entries().len());
        Ok(HostPipeline {
            uid,
            layout: layout.clone(),
            handles,
        })
    }

    fn shader_group_handles(&self, pipeline: &HostPipeline) -> Result<Vec<u8>> {
        Ok(pipeline.handles.clone())
    }

    fn create_binding_table(
        &self,
        pipeline: &HostPipeline,
        desc: &BindingTableDesc<'_, Self>,
    ) -> Result<HostBindingTable> {
        let writes = desc.writes();
        if writes.len() != pipeline.layout.entries().len() {
            return Err(Error::Binding(format!(
                "{} slots written, pipeline layout has {}",
                writes.len(),
                pipeline.layout.entries().len()
            )));
        }
        let mut bindings = Vec::with_capacity(writes.len());
        for (write, entry) in writes.iter().zip(pipeline.layout.entries().iter()) {
            if write.slot != entry.slot || write.kind != entry.kind || write.descriptors.len() != entry.count as usize {
                return Err(Error::Binding(format!(
                    "slot {} does not match the pipeline layout",
                    write.slot
                )));
            }
            let descriptors = write
                .descriptors
                .iter()
                .map(|descriptor| match descriptor {
                    Descriptor::Accel(accel) => HostDescriptor::Accel(accel.data.clone()),
                    Descriptor::Buffer(buffer) => HostDescriptor::Buffer(buffer.desc, Arc::clone(&buffer.data)),
                    Descriptor::Texture(texture) => HostDescriptor::Texture(texture.desc, Arc::clone(&texture.data)),
                    Descriptor::Null => HostDescriptor::Null,
                })
                .collect();
            bindings.push(HostBinding {
                slot: write.slot,
                descriptors,
            });
        }
        Ok(HostBindingTable {
            pipeline_uid: pipeline.uid,
            bindings,
        })
    }

    fn dispatch_rays(
        &self,
        pipeline: &HostPipeline,
        bindings: &HostBindingTable,
        shader_binding_table: &HostBuffer,
        sbt_layout: &ShaderBindingLayout,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if bindings.pipeline_uid != pipeline.uid {
            return Err(Error::Submit("binding table was built for another pipeline".into()));
        }
        require_buffer_usage(shader_binding_table, BufferUsage::SHADER_BINDING_TABLE)
            .map_err(|err| Error::Submit(err.to_string()))?;
        self.record(HostCommand::DispatchRays { width, height });
        let start = Instant::now();
        kernels::trace_rays(
            pipeline,
            bindings,
            &shader_binding_table.data.read().unwrap(),
            sbt_layout,
            width,
            height,
            self.limits.vec3_stride as usize,
        )?;
        *self.timestamps.lock().unwrap() = Some((start, Instant::now()));
        Ok(())
    }

    fn dispatch_tonemap(
        &self,
        pipeline: &HostPipeline,
        bindings: &HostBindingTable,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if bindings.pipeline_uid != pipeline.uid {
            return Err(Error::Submit("binding table was built for another pipeline".into()));
        }
        self.record(HostCommand::DispatchTonemap { width, height });
        kernels::tonemap(bindings, width, height)
    }

    fn wait_idle(&self) -> Result<()> {
        self.record(HostCommand::WaitIdle);
        Ok(())
    }

    fn resolve_timestamps(&self) -> Result<Option<f64>> {
        Ok(self
            .timestamps
            .lock()
            .unwrap()
            .take()
            .map(|(start, end)| (end - start).as_secs_f64() * 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(device: &HostDevice, data: &[u8], usage: BufferUsage) -> HostBuffer {
        let buffer = device
            .create_buffer(&BufferDesc::new(data.len(), MemoryClass::Upload, usage), "test")
            .unwrap();
        device.write_buffer(&buffer, 0, data).unwrap();
        buffer
    }

    #[test]
    fn memory_is_tracked_per_class() {
        let device = HostDevice::default();
        {
            let _a = device
                .create_buffer(&BufferDesc::new(64, MemoryClass::Upload, BufferUsage::TRANSFER_SRC), "a")
                .unwrap();
            let _b = device
                .create_buffer(&BufferDesc::new(32, MemoryClass::Device, BufferUsage::STORAGE), "b")
                .unwrap();
            assert_eq!(
                device.memory_usage(MemoryClass::Upload),
                MemoryUsage {
                    allocation_count: 1,
                    bytes: 64
                }
            );
            assert_eq!(device.total_allocated_bytes(), 96);
        }
        assert_eq!(device.total_allocated_bytes(), 0);
    }

    #[test]
    fn budget_exhaustion() {
        let device = HostDevice::new(HostDeviceParams {
            memory_budget: Some(100),
            ..Default::default()
        });
        let _a = device
            .create_buffer(&BufferDesc::new(80, MemoryClass::Device, BufferUsage::STORAGE), "a")
            .unwrap();
        let result = device.create_buffer(&BufferDesc::new(40, MemoryClass::Device, BufferUsage::STORAGE), "b");
        assert!(matches!(result, Err(Error::OutOfMemory { what: "b", size: 40 })));
    }

    #[test]
    fn memory_classes_are_enforced() {
        let device = HostDevice::default();
        let buffer = device
            .create_buffer(&BufferDesc::new(16, MemoryClass::Device, BufferUsage::STORAGE), "device")
            .unwrap();
        assert!(device.write_buffer(&buffer, 0, &[0u8; 4]).is_err());
        let mut out = [0u8; 4];
        assert!(device.read_buffer(&buffer, 0, &mut out).is_err());
    }

    #[test]
    fn compacted_bottom_level_is_registered() {
        let device = HostDevice::default();
        let usage = BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT;
        let vertices: Vec<f32> = vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let indices: Vec<u32> = vec![0, 1, 2];
        let vertex_buffer = upload(&device, bytemuck::cast_slice(&vertices), usage);
        let index_buffer = upload(&device, bytemuck::cast_slice(&indices), usage);
        let build = device
            .build_bottom_level(&[TriangleGeometryInput {
                vertices: &vertex_buffer,
                vertex_count: 3,
                vertex_stride: 12,
                indices: &index_buffer,
                triangle_count: 1,
            }])
            .unwrap();
        let size = device.query_compacted_size(&build.accel).unwrap();
        assert!(size <= build.accel.size());
        assert!(device.compact(&build.accel, size - 1).is_err());
        let compacted = device.compact(&build.accel, size).unwrap();
        assert_eq!(device.live_accel_count(), 2);
        assert_ne!(compacted.device_address(), build.accel.device_address());
        drop(build);
        assert_eq!(device.live_accel_count(), 1);
    }
}
