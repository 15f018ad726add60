use crate::{
    accel::*, binding::*, config::*, denoise::*, device::*, environment::*, error::*, frame::*, global_buffers::*,
    resource::*, sbt::*, scene::*, shader::*, usage::*,
};
use log::info;

/// One renderer over any device, selected at startup.
pub trait RenderBackend {
    fn name(&self) -> &str;

    /// Creates the frame size dependent targets, must be called before rendering.
    fn initialize(&mut self, width: u32, height: u32) -> Result<()>;

    /// Replaces all scene resources and rebuilds the pipeline and binding tables.
    fn set_scene(&mut self, scene: &Scene) -> Result<()>;

    fn render(&mut self, camera: &Camera, camera_changed: bool, readback: bool) -> Result<RenderStats>;

    /// RGBA8 pixels of the last frame that was read back.
    fn image(&self) -> &[u8];

    /// Rays traced per pixel in the last frame, empty unless ray statistics are enabled.
    fn ray_counts(&self) -> &[u32];

    fn frame_size(&self) -> (u32, u32);
}

struct Placeholders<D: Device> {
    environment_map: D::Texture,
    texture: D::Texture,
}

impl<D: Device> Placeholders<D> {
    fn new(device: &D) -> Result<Self> {
        let black = [0f32; 4];
        let environment_map = upload_texture(
            device,
            &TextureDesc::new(1, 1, TextureFormat::Rgba32Float, TextureUsage::SAMPLED),
            bytemuck::cast_slice(&black),
            "environment map placeholder",
        )?;
        let texture = upload_texture(
            device,
            &TextureDesc::new(1, 1, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED),
            &[0, 0, 0, 255],
            "texture placeholder",
        )?;
        Ok(Self {
            environment_map,
            texture,
        })
    }
}

struct SceneResources<D: Device> {
    accel: SceneAccel<D>,
    globals: GlobalBuffers<D>,
    textures: Vec<D::Texture>,
    environment_map: Option<D::Texture>,
    samples_per_pixel: u32,
}

impl<D: Device> SceneResources<D> {
    fn new(device: &D, scene: &Scene) -> Result<Self> {
        let accel = SceneAccel::new(device, scene)?;
        let globals = GlobalBuffers::new(device, scene)?;

        let mut textures = Vec::with_capacity(scene.textures.len());
        for image in scene.textures.iter() {
            let format = match image.color_space {
                ColorSpace::Srgb => TextureFormat::Rgba8Srgb,
                ColorSpace::Linear => TextureFormat::Rgba8Unorm,
            };
            let desc = TextureDesc::new(image.width, image.height, format, TextureUsage::SAMPLED);
            textures.push(upload_texture(device, &desc, &image.pixels, "scene texture")?);
        }

        let environment_map = match load_or_placeholder(scene.environment_map.as_deref()) {
            Some(map) => Some(map.upload(device)?),
            None => None,
        };

        Ok(Self {
            accel,
            globals,
            textures,
            environment_map,
            samples_per_pixel: scene.samples_per_pixel,
        })
    }
}

struct PipelineState<D: Device> {
    layout: BindingLayout,
    pipeline: D::Pipeline,
    shader_binding_table: ShaderBindingTable<D>,
}

/// Fields drop in declaration order, so binding tables go before the resources they reference.
pub struct Renderer<D: Device> {
    bindings: Option<D::BindingTable>,
    pipeline: Option<PipelineState<D>>,
    scene: Option<SceneResources<D>>,
    frame: Option<FrameTargets<D>>,
    placeholders: Placeholders<D>,
    denoiser: Option<Box<dyn Denoiser<D>>>,
    orchestrator: FrameOrchestrator,
    config: RenderConfig,
    shaders: Box<dyn ShaderLibrary>,
    image: Vec<u8>,
    ray_counts: Vec<u32>,
    device: D,
}

impl<D: Device> Renderer<D> {
    pub fn new(device: D, shaders: Box<dyn ShaderLibrary>, config: RenderConfig) -> Result<Self> {
        info!("{} renderer: {:?}", device.name(), config);
        let placeholders = Placeholders::new(&device)?;
        let denoiser: Option<Box<dyn Denoiser<D>>> = if config.denoise {
            Some(Box::new(PassthroughDenoiser))
        } else {
            None
        };
        Ok(Self {
            bindings: None,
            pipeline: None,
            scene: None,
            frame: None,
            placeholders,
            denoiser,
            orchestrator: FrameOrchestrator::new(config),
            config,
            shaders,
            image: Vec::new(),
            ray_counts: Vec::new(),
            device,
        })
    }

    pub fn with_denoiser(mut self, denoiser: Box<dyn Denoiser<D>>) -> Self {
        self.denoiser = Some(denoiser);
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn frame_state(&self) -> &FrameState {
        self.orchestrator.state()
    }

    pub fn scene_accel(&self) -> Option<&SceneAccel<D>> {
        self.scene.as_ref().map(|scene| &scene.accel)
    }

    pub fn global_buffers(&self) -> Option<&GlobalBuffers<D>> {
        self.scene.as_ref().map(|scene| &scene.globals)
    }

    pub fn binding_layout(&self) -> Option<&BindingLayout> {
        self.pipeline.as_ref().map(|state| &state.layout)
    }

    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable<D>> {
        self.pipeline.as_ref().map(|state| &state.shader_binding_table)
    }

    pub fn frame_targets(&self) -> Option<&FrameTargets<D>> {
        self.frame.as_ref()
    }

    /// Descriptor contents for the current scene and frame targets.
    pub fn binding_table_desc(&self) -> Result<BindingTableDesc<'_, D>> {
        let frame = self.frame.as_ref().ok_or(Error::NotInitialized("frame size not set"))?;
        let scene = self.scene.as_ref().ok_or(Error::NotInitialized("no scene"))?;
        let state = self.pipeline.as_ref().ok_or(Error::NotInitialized("no pipeline"))?;
        let resources = BindingResources {
            tlas: scene.accel.top_level().accel(),
            render_target: &frame.render_target,
            accum_buffer: &frame.accum_buffer,
            view_params: &frame.view_params,
            materials: scene.globals.materials.as_ref(),
            lights: scene.globals.lights.as_ref(),
            mesh_descs: scene.globals.mesh_descs.as_ref(),
            vertices: scene.globals.vertices.as_ref(),
            indices: scene.globals.indices.as_ref(),
            normals: scene.globals.normals.as_ref(),
            uvs: scene.globals.uvs.as_ref(),
            environment_map: scene
                .environment_map
                .as_ref()
                .unwrap_or(&self.placeholders.environment_map),
            textures: &scene.textures,
            texture_placeholder: &self.placeholders.texture,
            ray_stats: frame.ray_stats.as_ref(),
            denoise_output: frame.denoise_output.as_ref(),
        };
        BindingTableDesc::new(&state.layout, &resources)
    }

    fn rebuild_bindings(&mut self) -> Result<()> {
        self.bindings = None;
        if self.frame.is_none() || self.scene.is_none() || self.pipeline.is_none() {
            return Ok(());
        }
        let bindings = {
            let desc = self.binding_table_desc()?;
            let state = self.pipeline.as_ref().ok_or(Error::NotInitialized("no pipeline"))?;
            self.device.create_binding_table(&state.pipeline, &desc)?
        };
        self.bindings = Some(bindings);
        Ok(())
    }
}

impl<D: Device> RenderBackend for Renderer<D> {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        self.bindings = None;
        self.frame = None;
        let frame = FrameTargets::new(&self.device, &self.config, width, height)?;
        self.image = vec![0; frame.pixel_count() * 4];
        self.ray_counts = if self.config.report_ray_stats {
            vec![0; frame.pixel_count()]
        } else {
            Vec::new()
        };
        self.frame = Some(frame);
        self.orchestrator.reset();
        self.rebuild_bindings()
    }

    fn set_scene(&mut self, scene: &Scene) -> Result<()> {
        scene.validate()?;

        // release the previous scene before allocating its replacement
        self.bindings = None;
        self.pipeline = None;
        self.scene = None;

        let resources = SceneResources::new(&self.device, scene)?;
        let layout = BindingLayout::new(&self.config, resources.textures.len());
        let pipeline = self.device.create_pipeline(&layout, self.shaders.as_ref())?;
        let shader_binding_table = ShaderBindingTable::new(&self.device, &pipeline, scene)?;
        if shader_binding_table.mesh_desc_count() != resources.globals.mesh_desc_count() {
            return Err(Error::Binding(format!(
                "{} hit groups for {} mesh descs",
                shader_binding_table.mesh_desc_count(),
                resources.globals.mesh_desc_count()
            )));
        }
        info!(
            "scene ready: {} meshes, {} instances, {} hit groups, {} textures",
            scene.meshes.len(),
            scene.instances.len(),
            shader_binding_table.hit_group_count(),
            resources.textures.len()
        );

        self.scene = Some(resources);
        self.pipeline = Some(PipelineState {
            layout,
            pipeline,
            shader_binding_table,
        });
        self.orchestrator.reset();
        self.rebuild_bindings()
    }

    fn render(&mut self, camera: &Camera, camera_changed: bool, readback: bool) -> Result<RenderStats> {
        let frame = self.frame.as_ref().ok_or(Error::NotInitialized("frame size not set"))?;
        let scene = self.scene.as_ref().ok_or(Error::NotInitialized("no scene"))?;
        let state = self.pipeline.as_ref().ok_or(Error::NotInitialized("no pipeline"))?;
        let bindings = self.bindings.as_ref().ok_or(Error::NotInitialized("no binding table"))?;

        let inputs = FrameInputs {
            pipeline: &state.pipeline,
            bindings,
            shader_binding_table: &state.shader_binding_table,
            camera,
            samples_per_pixel: scene.samples_per_pixel,
        };
        let denoiser = match self.denoiser.as_mut() {
            Some(denoiser) => Some(&mut **denoiser as &mut dyn Denoiser<D>),
            None => None,
        };
        self.orchestrator.render(
            &self.device,
            frame,
            &inputs,
            camera_changed,
            readback,
            denoiser,
            FrameOutput {
                image: &mut self.image,
                ray_counts: &mut self.ray_counts,
            },
        )
    }

    fn image(&self) -> &[u8] {
        &self.image
    }

    fn ray_counts(&self) -> &[u32] {
        &self.ray_counts
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame
            .as_ref()
            .map_or((0, 0), |frame| (frame.width, frame.height))
    }
}
