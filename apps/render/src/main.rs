use kiln::prelude::*;
use log::{error, info, warn};
use std::{path::PathBuf, time::Instant};
use structopt::StructOpt;
use strum::{EnumString, EnumVariantNames, VariantNames};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumVariantNames)]
#[strum(serialize_all = "kebab_case")]
enum Backend {
    Host,
    Vulkan,
}

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// Device to render with
    #[structopt(short, long, possible_values=&Backend::VARIANTS, default_value="host")]
    backend: Backend,

    /// Directory of compiled SPIR-V kernels for the vulkan backend
    #[structopt(long, default_value = "spv/bin")]
    shader_dir: PathBuf,

    /// Load the Vulkan validation layers
    #[structopt(long)]
    debug: bool,

    #[structopt(long, default_value = "320")]
    width: u32,

    #[structopt(long, default_value = "240")]
    height: u32,

    /// Frames to accumulate before writing the image
    #[structopt(short, long, default_value = "16")]
    frames: u32,

    /// Samples per pixel within each frame
    #[structopt(long, default_value = "1")]
    samples: u32,

    /// Count rays per pixel and report rays per second
    #[structopt(long)]
    ray_stats: bool,

    /// Accumulate denoiser inputs and tonemap through the denoiser
    #[structopt(long)]
    denoise: bool,

    /// Lat-long environment map
    #[structopt(short, long)]
    environment: Option<PathBuf>,

    /// PNG file to write
    #[structopt(short, long, default_value = "render.png")]
    output: PathBuf,
}

fn create_scene(params: &AppParams) -> Scene {
    let mut scene = Scene::default();

    let floor = scene.add_mesh(Mesh::new(vec![Geometry::quad(
        Vec3::new(-5.0, 0.0, 5.0),
        Vec3::new(10.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, -10.0),
    )]));
    let boxes = scene.add_mesh(Mesh::new(vec![
        Geometry::cuboid(Vec3::new(-1.5, 0.0, -0.5), Vec3::new(-0.5, 2.0, 0.5)),
        Geometry::cuboid(Vec3::new(0.5, 0.0, -0.5), Vec3::new(1.5, 1.0, 0.5)),
    ]));

    let white = scene.add_material(DisneyMaterial::diffuse(Vec3::broadcast(0.8)));
    let red = scene.add_material(DisneyMaterial::diffuse(Vec3::new(0.8, 0.15, 0.1)));
    let checker = scene.add_texture(Image {
        name: "checker".into(),
        width: 2,
        height: 2,
        color_space: ColorSpace::Srgb,
        pixels: vec![200, 200, 200, 255, 60, 60, 60, 255, 60, 60, 60, 255, 200, 200, 200, 255],
    });
    let textured = scene.add_material(DisneyMaterial::diffuse(Vec3::one()).with_base_color_texture(checker));

    let floor = scene.add_parameterized_mesh(floor, vec![white]);
    let boxes = scene.add_parameterized_mesh(boxes, vec![red, textured]);
    scene.add_instance(Mat4::identity(), floor);
    scene.add_instance(Mat4::identity(), boxes);
    scene.add_instance(
        Mat4::from_translation(Vec3::new(0.0, 0.0, -2.5)) * Mat4::from_rotation_y(0.6),
        boxes,
    );

    scene.lights.push(QuadLight::new(
        Vec3::broadcast(12.0),
        Vec3::new(0.0, 4.0, 1.0),
        Vec3::unit_x(),
        Vec3::unit_z(),
        1.0,
        1.0,
    ));
    scene.cameras.push(Camera {
        position: Vec3::new(0.0, 2.5, 7.0),
        center: Vec3::new(0.0, 0.75, 0.0),
        up: Vec3::unit_y(),
        fov_y: 50.0,
    });
    scene.samples_per_pixel = params.samples;
    scene.environment_map = params.environment.clone();
    scene
}

fn render_frames(renderer: &mut dyn RenderBackend, scene: &Scene, params: &AppParams) -> kiln::Result<()> {
    renderer.initialize(params.width, params.height)?;
    renderer.set_scene(scene)?;

    let camera = scene.default_camera();
    let start = Instant::now();
    let mut total_ms = 0.0;
    for frame in 0..params.frames {
        let is_last = frame + 1 == params.frames;
        let stats = renderer.render(&camera, frame == 0, is_last)?;
        total_ms += stats.render_time_ms;
        match stats.rays_per_second {
            Some(rays_per_second) => info!(
                "frame {}: {:.2} ms, {:.1} Mrays/s",
                stats.frame_index,
                stats.render_time_ms,
                rays_per_second / 1.0e6
            ),
            None => info!("frame {}: {:.2} ms", stats.frame_index, stats.render_time_ms),
        }
    }
    info!(
        "{} frames on {}: {:.2} ms device, {:.2} s wall",
        params.frames,
        renderer.name(),
        total_ms,
        start.elapsed().as_secs_f64()
    );

    let (width, height) = renderer.frame_size();
    let luminance: f32 = renderer
        .image()
        .chunks_exact(4)
        .map(|c| linear_from_srgb8([c[0], c[1], c[2], c[3]]).luminance())
        .sum();
    info!(
        "mean luminance {:.4}",
        luminance / ((width as f32) * (height as f32)).max(1.0)
    );

    let image = image::RgbaImage::from_raw(width, height, renderer.image().to_vec())
        .ok_or_else(|| kiln::Error::Readback(format!("no {}x{} image was read back", width, height)))?;
    image
        .save(&params.output)
        .map_err(|err| kiln::Error::Readback(format!("{:?}: {}", params.output, err)))?;
    info!("wrote {:?}", params.output);
    Ok(())
}

fn create_renderer(params: &AppParams) -> kiln::Result<Box<dyn RenderBackend>> {
    let config = RenderConfig {
        report_ray_stats: params.ray_stats,
        denoise: params.denoise,
        display_surface: false,
    };
    match params.backend {
        Backend::Host => {
            let renderer = Renderer::new(HostDevice::default(), Box::new(HostShaderLibrary), config)?;
            Ok(Box::new(renderer))
        }
        #[cfg(feature = "vulkan")]
        Backend::Vulkan => {
            let device = VulkanDevice::new(&ContextParams {
                is_debug: params.debug,
                ..Default::default()
            })?;
            let shaders = DirectoryShaderLibrary::new(params.shader_dir.clone());
            Ok(Box::new(Renderer::new(device, Box::new(shaders), config)?))
        }
        #[cfg(not(feature = "vulkan"))]
        Backend::Vulkan => Err(kiln::Error::DeviceCreation(format!(
            "built without the vulkan feature, cannot load shaders from {:?} (debug {})",
            params.shader_dir, params.debug
        ))),
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let params = AppParams::from_args();
    if params.frames == 0 {
        warn!("no frames requested, nothing to write");
        return Ok(());
    }
    let scene = create_scene(&params);
    let result = create_renderer(&params).and_then(|mut renderer| render_frames(renderer.as_mut(), &scene, &params));
    if let Err(err) = result {
        error!("{:?} error: {}", err.severity(), err);
        return Err(err.into());
    }
    Ok(())
}
