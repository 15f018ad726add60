use crate::{config::*, denoise::*, device::*, error::*, maths::*, resource::*, sbt::*, scene::*, usage::*};
use bytemuck::{Pod, Zeroable};
use log::{debug, error};
use std::{mem, time::Instant};

/// Camera basis for the ray generation shader, one per frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct ViewParameters {
    pub cam_pos: Vec4,
    pub cam_du: Vec4,
    pub cam_dv: Vec4,
    pub cam_dir_top_left: Vec4,
    pub frame_id: u32,
    pub samples_per_pixel: u32,
    pub pad: [u32; 2],
}

impl ViewParameters {
    pub fn new(camera: &Camera, width: u32, height: u32, frame_id: u32, samples_per_pixel: u32) -> Self {
        let dir = camera.direction();
        let img_plane_y = 2.0 * (0.5 * camera.fov_y).to_radians().tan();
        let img_plane_x = img_plane_y * (width as f32) / (height as f32);

        let du = dir.cross(camera.up).normalized() * img_plane_x;
        let dv = -du.cross(dir).normalized() * img_plane_y;
        let dir_top_left = dir - 0.5 * du - 0.5 * dv;

        Self {
            cam_pos: vec4_from_vec3(camera.position, 1.0),
            cam_du: vec4_from_vec3(du, 0.0),
            cam_dv: vec4_from_vec3(dv, 0.0),
            cam_dir_top_left: vec4_from_vec3(dir_top_left, 0.0),
            frame_id,
            samples_per_pixel,
            pad: [0; 2],
        }
    }
}

/// Progressive accumulation counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    frame_id: u32,
}

impl FrameState {
    /// Frame index to render with, zero whenever the camera moved.
    pub fn begin_frame(&mut self, camera_changed: bool) -> u32 {
        if camera_changed {
            self.frame_id = 0;
        }
        self.frame_id
    }

    pub fn end_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }

    pub fn reset(&mut self) {
        self.frame_id = 0;
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderStats {
    pub frame_index: u32,
    pub render_time_ms: f64,
    pub rays_per_second: Option<f64>,
}

/// Per frame-size device resources.
pub struct FrameTargets<D: Device> {
    pub width: u32,
    pub height: u32,
    pub render_target: D::Texture,
    pub accum_buffer: D::Buffer,
    pub view_params: D::Buffer,
    view_params_upload: D::Buffer,
    pub ray_stats: Option<D::Texture>,
    pub denoise_output: Option<D::Buffer>,
    image_readback: TextureReadback<D>,
    ray_stats_readback: Option<TextureReadback<D>>,
}

impl<D: Device> FrameTargets<D> {
    pub fn new(device: &D, config: &RenderConfig, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::NotInitialized("frame size must be non-zero"));
        }
        let pixel_count = (width as usize) * (height as usize);

        let render_target_desc = TextureDesc::new(
            width,
            height,
            TextureFormat::Rgba8Unorm,
            TextureUsage::STORAGE | TextureUsage::TRANSFER_SRC,
        );
        let render_target = device.create_texture(&render_target_desc, "render target")?;
        let accum_buffer = device.create_buffer(
            &BufferDesc::new(
                pixel_count * config.accum_pixel_size(),
                MemoryClass::Device,
                BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC,
            ),
            "accumulation buffer",
        )?;

        let view_params_size = mem::size_of::<ViewParameters>();
        let view_params = device.create_buffer(
            &BufferDesc::new(
                view_params_size,
                MemoryClass::Device,
                BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
            ),
            "view parameters",
        )?;
        let view_params_upload = device.create_buffer(
            &BufferDesc::new(view_params_size, MemoryClass::Upload, BufferUsage::TRANSFER_SRC),
            "view parameters upload",
        )?;

        let (ray_stats, ray_stats_readback) = if config.report_ray_stats {
            let desc = TextureDesc::new(
                width,
                height,
                TextureFormat::R32Uint,
                TextureUsage::STORAGE | TextureUsage::TRANSFER_SRC,
            );
            (
                Some(device.create_texture(&desc, "ray statistics")?),
                Some(TextureReadback::new(device, &desc, "ray statistics readback")?),
            )
        } else {
            (None, None)
        };
        let denoise_output = if config.denoise {
            Some(device.create_buffer(
                &BufferDesc::new(
                    pixel_count * DENOISE_OUTPUT_PIXEL_SIZE,
                    MemoryClass::Device,
                    BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                ),
                "denoise output",
            )?)
        } else {
            None
        };
        let image_readback = TextureReadback::new(device, &render_target_desc, "render target readback")?;

        Ok(Self {
            width,
            height,
            render_target,
            accum_buffer,
            view_params,
            view_params_upload,
            ray_stats,
            denoise_output,
            image_readback,
            ray_stats_readback,
        })
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

/// Everything bound for one frame, built by the renderer.
pub struct FrameInputs<'a, D: Device> {
    pub pipeline: &'a D::Pipeline,
    pub bindings: &'a D::BindingTable,
    pub shader_binding_table: &'a ShaderBindingTable<D>,
    pub camera: &'a Camera,
    pub samples_per_pixel: u32,
}

/// Host side results of a frame.
pub struct FrameOutput<'a> {
    pub image: &'a mut [u8],
    pub ray_counts: &'a mut [u32],
}

/// Sequences one frame: view update, dispatch, denoise, tonemap and readback.
pub struct FrameOrchestrator {
    config: RenderConfig,
    state: FrameState,
}

impl FrameOrchestrator {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            state: FrameState::default(),
        }
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn render<D: Device>(
        &mut self,
        device: &D,
        targets: &FrameTargets<D>,
        inputs: &FrameInputs<D>,
        camera_changed: bool,
        readback: bool,
        denoiser: Option<&mut (dyn Denoiser<D> + '_)>,
        output: FrameOutput,
    ) -> Result<RenderStats> {
        let frame_id = self.state.begin_frame(camera_changed);

        let view_params = ViewParameters::new(
            inputs.camera,
            targets.width,
            targets.height,
            frame_id,
            inputs.samples_per_pixel,
        );
        device.write_buffer(&targets.view_params_upload, 0, bytemuck::bytes_of(&view_params))?;
        device.copy_buffer(
            &targets.view_params_upload,
            &targets.view_params,
            &[BufferCopyRegion::whole(mem::size_of::<ViewParameters>())],
        )?;

        let start = Instant::now();
        device.dispatch_rays(
            inputs.pipeline,
            inputs.bindings,
            inputs.shader_binding_table.buffer(),
            inputs.shader_binding_table.layout(),
            targets.width,
            targets.height,
        )?;

        if self.config.denoise {
            if let (Some(denoiser), Some(denoise_output)) = (denoiser, targets.denoise_output.as_ref()) {
                if let Err(err) = denoiser.denoise(
                    device,
                    &targets.accum_buffer,
                    denoise_output,
                    targets.width,
                    targets.height,
                ) {
                    error!("{} denoiser failed: {}", denoiser.name(), err);
                }
            }
            device.dispatch_tonemap(inputs.pipeline, inputs.bindings, targets.width, targets.height)?;
        }

        let readback = self.config.readback_required(readback);
        if readback {
            targets.image_readback.copy_from(device, &targets.render_target)?;
            if let (Some(ray_stats), Some(ray_stats_readback)) =
                (targets.ray_stats.as_ref(), targets.ray_stats_readback.as_ref())
            {
                ray_stats_readback.copy_from(device, ray_stats)?;
            }
        }

        device.wait_idle()?;
        let host_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        let render_time_ms = device.resolve_timestamps()?.unwrap_or(host_time_ms);

        let mut rays_per_second = None;
        if readback {
            let mode = targets.image_readback.read_into(device, output.image)?;
            debug!("frame {} readback: {:?}", frame_id, mode);
            if let Some(ray_stats_readback) = targets.ray_stats_readback.as_ref() {
                let ray_counts = bytemuck::cast_slice_mut::<u32, u8>(output.ray_counts);
                ray_stats_readback.read_into(device, ray_counts)?;
                let total_rays: u64 = output.ray_counts.iter().map(|&n| u64::from(n)).sum();
                rays_per_second = Some(total_rays as f64 / (render_time_ms / 1000.0).max(f64::EPSILON));
            }
        }

        self.state.end_frame();
        Ok(RenderStats {
            frame_index: frame_id,
            render_time_ms,
            rays_per_second,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_resets_only_on_camera_change() {
        let mut state = FrameState::default();
        assert_eq!(state.begin_frame(false), 0);
        state.end_frame();
        assert_eq!(state.begin_frame(false), 1);
        state.end_frame();
        assert_eq!(state.begin_frame(true), 0);
        state.end_frame();
        assert_eq!(state.frame_id(), 1);
    }

    #[test]
    fn counter_wraps() {
        let mut state = FrameState { frame_id: u32::MAX };
        assert_eq!(state.begin_frame(false), u32::MAX);
        state.end_frame();
        assert_eq!(state.frame_id(), 0);
    }

    #[test]
    fn view_basis() {
        let camera = Camera {
            position: Vec3::zero(),
            center: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::unit_y(),
            fov_y: 90.0,
        };
        let params = ViewParameters::new(&camera, 200, 100, 3, 4);
        assert!((params.cam_du.x - 4.0).abs() < 1.0e-5);
        assert!((params.cam_dv.y + 2.0).abs() < 1.0e-5);
        assert!((params.cam_dir_top_left.x + 2.0).abs() < 1.0e-5);
        assert!((params.cam_dir_top_left.y - 1.0).abs() < 1.0e-5);
        assert!((params.cam_dir_top_left.z + 1.0).abs() < 1.0e-5);
        assert_eq!(params.frame_id, 3);
        assert_eq!(mem::size_of::<ViewParameters>(), 80);
    }
}
