use kiln::{host::HostBuffer, prelude::*};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

fn triangle() -> Geometry {
    Geometry::new(
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ],
        vec![UVec3::new(0, 1, 2)],
    )
}

fn single_triangle_scene() -> Scene {
    let mut scene = Scene::default();
    let mesh = scene.add_mesh(Mesh::new(vec![triangle()]));
    let material = scene.add_material(DisneyMaterial::diffuse(Vec3::broadcast(0.8)));
    let pm = scene.add_parameterized_mesh(mesh, vec![material]);
    scene.add_instance(Mat4::identity(), pm);
    scene
}

/// A two geometry cuboid pair plus a single quad, instanced three times.
fn two_mesh_scene() -> Scene {
    let mut scene = Scene::default();
    let pair = scene.add_mesh(Mesh::new(vec![
        Geometry::cuboid(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(0.0, 0.0, 0.0)),
        Geometry::cuboid(Vec3::new(0.5, 0.5, 0.5), Vec3::new(1.0, 1.0, 1.0)),
    ]));
    let quad = scene.add_mesh(Mesh::new(vec![Geometry::quad(
        Vec3::new(-2.0, -2.0, -2.0),
        Vec3::new(4.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, 4.0),
    )]));
    let red = scene.add_material(DisneyMaterial::diffuse(Vec3::new(0.8, 0.1, 0.1)));
    let grey = scene.add_material(DisneyMaterial::diffuse(Vec3::broadcast(0.5)));
    let pm_pair = scene.add_parameterized_mesh(pair, vec![red, grey]);
    let pm_quad = scene.add_parameterized_mesh(quad, vec![grey]);
    scene.add_instance(Mat4::identity(), pm_pair);
    scene.add_instance(Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)), pm_pair);
    scene.add_instance(Mat4::identity(), pm_quad);
    scene
}

/// A quad facing the default camera, smaller than the view so the corners miss.
fn facing_quad_scene() -> Scene {
    let mut scene = Scene::default();
    let mesh = scene.add_mesh(Mesh::new(vec![Geometry::quad(
        Vec3::new(-2.0, -2.0, 0.0),
        Vec3::new(4.0, 0.0, 0.0),
        Vec3::new(0.0, 4.0, 0.0),
    )]));
    let material = scene.add_material(DisneyMaterial::diffuse(Vec3::broadcast(0.8)));
    let pm = scene.add_parameterized_mesh(mesh, vec![material]);
    scene.add_instance(Mat4::identity(), pm);
    scene
}

fn renderer(device: HostDevice, config: RenderConfig) -> Renderer<HostDevice> {
    Renderer::new(device, Box::new(HostShaderLibrary), config).unwrap()
}

fn ready_renderer(scene: &Scene, config: RenderConfig) -> Renderer<HostDevice> {
    let mut renderer = renderer(HostDevice::default(), config);
    renderer.initialize(WIDTH, HEIGHT).unwrap();
    renderer.set_scene(scene).unwrap();
    renderer
}

fn pixel(renderer: &Renderer<HostDevice>, x: u32, y: u32) -> [u8; 4] {
    let (width, _) = renderer.frame_size();
    let offset = 4 * (y * width + x) as usize;
    let mut result = [0u8; 4];
    result.copy_from_slice(&renderer.image()[offset..offset + 4]);
    result
}

#[test]
fn hit_groups_match_mesh_descs() {
    let scene = two_mesh_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());

    let sbt = renderer.shader_binding_table().unwrap();
    let globals = renderer.global_buffers().unwrap();
    assert_eq!(scene.total_geometry_count(), 3);
    assert_eq!(sbt.hit_group_count(), 3);
    assert_eq!(sbt.mesh_desc_count(), globals.mesh_desc_count());
    assert_eq!(sbt.layout().record_count(), 6);
}

#[test]
fn single_triangle_table() {
    let scene = single_triangle_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());

    let accel = renderer.scene_accel().unwrap();
    assert_eq!(accel.sbt_offsets(), &[0]);
    assert_eq!(accel.bottom_level().len(), 1);
    assert_eq!(accel.top_level().instance_count(), 1);
    assert_eq!(renderer.device().live_accel_count(), 2);

    let sbt = renderer.shader_binding_table().unwrap();
    assert_eq!(sbt.layout().record_count(), 4);
    let data = download_buffer(renderer.device(), sbt.buffer()).unwrap();
    let (_, record) = sbt.layout().hit_group_record(&data, 0).unwrap();
    assert_eq!(record.mesh_desc_index, 0);

    let desc = renderer.binding_table_desc().unwrap();
    let slot = |slot| desc.writes().iter().find(|write| write.slot == slot).unwrap();
    assert_eq!(slot(TEXTURES_SLOT).descriptors.len(), 1);
    assert!(!slot(TEXTURES_SLOT).descriptors[0].is_null());
    assert!(slot(NORMALS_SLOT).descriptors[0].is_null());
    assert!(slot(UVS_SLOT).descriptors[0].is_null());
    assert!(!slot(ENVIRONMENT_MAP_SLOT).descriptors[0].is_null());
}

#[test]
fn two_and_three_geometry_meshes() {
    let quad = |y: f32| Geometry::quad(Vec3::new(0.0, y, 0.0), Vec3::unit_x(), Vec3::unit_z());
    let mut scene = Scene::default();
    let material = scene.add_material(DisneyMaterial::diffuse(Vec3::broadcast(0.5)));
    let two = scene.add_mesh(Mesh::new(vec![quad(0.0), quad(1.0)]));
    let three = scene.add_mesh(Mesh::new(vec![quad(2.0), quad(3.0), quad(4.0)]));
    let pm_two = scene.add_parameterized_mesh(two, vec![material; 2]);
    let pm_three = scene.add_parameterized_mesh(three, vec![material; 3]);
    scene.add_instance(Mat4::identity(), pm_two);
    scene.add_instance(Mat4::identity(), pm_three);

    let renderer = ready_renderer(&scene, RenderConfig::default());
    assert_eq!(renderer.scene_accel().unwrap().sbt_offsets(), &[0, 2]);

    let sbt = renderer.shader_binding_table().unwrap();
    assert_eq!(sbt.hit_group_count(), 5);
    let data = download_buffer(renderer.device(), sbt.buffer()).unwrap();
    let indices: Vec<_> = (0..5)
        .map(|index| sbt.layout().hit_group_record(&data, index).unwrap().1.mesh_desc_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[test]
fn instance_offsets_follow_parameterized_meshes() {
    let scene = two_mesh_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());

    let accel = renderer.scene_accel().unwrap();
    assert_eq!(accel.sbt_offsets(), &[0, 2]);
    assert_eq!(shader_binding_table_offsets(&scene), accel.sbt_offsets());

    let records = instance_records(&scene, accel.bottom_level(), accel.sbt_offsets());
    let offsets: Vec<_> = records
        .iter()
        .map(|record| record.shader_binding_table_record_offset())
        .collect();
    assert_eq!(offsets, vec![0, 0, 2]);
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.custom_index(), index as u32);
        assert_eq!(record.mask(), INSTANCE_MASK_ALL);
    }
}

#[test]
fn bottom_levels_are_compacted() {
    let scene = two_mesh_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());

    for bottom_level in renderer.scene_accel().unwrap().bottom_level() {
        assert!(bottom_level.size() > 0);
        assert!(bottom_level.size() <= bottom_level.size_before_compaction());
    }
    // compaction replaces each build, only the compacted copies stay alive
    let accel_count = renderer.device().live_accel_count();
    assert_eq!(accel_count, scene.meshes.len() + 1);
}

#[test]
fn binding_table_encoding_is_stable() {
    let scene = two_mesh_scene();
    let config = RenderConfig {
        report_ray_stats: true,
        denoise: true,
        display_surface: false,
    };
    let renderer = ready_renderer(&scene, config);

    let first = renderer.binding_table_desc().unwrap().encode();
    let second = renderer.binding_table_desc().unwrap().encode();
    assert!(!first.is_empty());
    assert_eq!(first, second);

    let layout = renderer.binding_layout().unwrap();
    let records = renderer.binding_table_desc().unwrap().records();
    assert_eq!(records.len(), layout.descriptor_count());
    assert_eq!(records.last().map(|record| record.slot), Some(DENOISE_OUTPUT_SLOT));
}

#[test]
fn mesh_descs_round_trip() {
    let scene = two_mesh_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());
    let device = renderer.device();

    let buffer = renderer.global_buffers().unwrap().mesh_descs.as_ref().unwrap();
    let downloaded = MeshDesc::read_all(&download_buffer(device, buffer).unwrap());
    let packed = PackedSceneData::pack(&scene, device.limits().vec3_stride);
    assert_eq!(downloaded, packed.mesh_descs);
    assert_eq!(downloaded.len(), 3);
    assert_eq!(downloaded[1].material_id, 1);
    assert_eq!(downloaded[1].vertex_offset, downloaded[0].vertex_count);
}

#[test]
fn frame_counter_resets_on_camera_change() {
    let scene = single_triangle_scene();
    let mut renderer = ready_renderer(&scene, RenderConfig::default());
    let camera = scene.default_camera();

    assert_eq!(renderer.render(&camera, false, true).unwrap().frame_index, 0);
    assert_eq!(renderer.render(&camera, false, true).unwrap().frame_index, 1);
    assert_eq!(renderer.render(&camera, false, true).unwrap().frame_index, 2);
    assert_eq!(renderer.render(&camera, true, true).unwrap().frame_index, 0);
    assert_eq!(renderer.frame_state().frame_id(), 1);

    renderer.set_scene(&scene).unwrap();
    assert_eq!(renderer.frame_state().frame_id(), 0);
}

#[test]
fn staging_buffers_are_released() {
    let scene = two_mesh_scene();
    let renderer = ready_renderer(&scene, RenderConfig::default());

    // only the persistent view parameter upload buffer remains
    let upload = renderer.device().memory_usage(MemoryClass::Upload);
    assert_eq!(upload.allocation_count, 1);
    assert_eq!(upload.bytes, std::mem::size_of::<ViewParameters>());
}

#[test]
fn frame_command_order() {
    let scene = single_triangle_scene();
    let config = RenderConfig {
        denoise: true,
        ..Default::default()
    };
    let mut renderer = ready_renderer(&scene, config);
    renderer.device().clear_command_log();

    renderer.render(&scene.default_camera(), false, true).unwrap();
    let log = renderer.device().command_log();

    let position = |f: &dyn Fn(&HostCommand) -> bool| log.iter().position(|c| f(c)).unwrap();
    let view_update = position(&|c| matches!(c, HostCommand::CopyBuffer { .. }));
    let dispatch = position(&|c| matches!(c, HostCommand::DispatchRays { .. }));
    let tonemap = position(&|c| matches!(c, HostCommand::DispatchTonemap { .. }));
    let readback = position(&|c| matches!(c, HostCommand::CopyTextureToBuffer { .. }));
    let idle = position(&|c| matches!(c, HostCommand::WaitIdle));
    assert!(view_update < dispatch);
    assert!(dispatch < tonemap);
    assert!(tonemap < readback);
    assert!(readback < idle);
    assert_eq!(idle, log.len() - 1);
    assert_eq!(
        log[dispatch],
        HostCommand::DispatchRays {
            width: WIDTH,
            height: HEIGHT
        }
    );
}

#[test]
fn display_surface_skips_readback() {
    let scene = single_triangle_scene();
    let config = RenderConfig {
        display_surface: true,
        ..Default::default()
    };
    let mut renderer = ready_renderer(&scene, config);
    renderer.device().clear_command_log();

    renderer.render(&scene.default_camera(), false, false).unwrap();
    let log = renderer.device().command_log();
    assert!(!log.iter().any(|c| matches!(c, HostCommand::CopyTextureToBuffer { .. })));
    assert!(!log.iter().any(|c| matches!(c, HostCommand::DispatchTonemap { .. })));

    renderer.device().clear_command_log();
    renderer.render(&scene.default_camera(), false, true).unwrap();
    let log = renderer.device().command_log();
    assert!(log.iter().any(|c| matches!(c, HostCommand::CopyTextureToBuffer { .. })));
}

struct FailingDenoiser;

impl Denoiser<HostDevice> for FailingDenoiser {
    fn name(&self) -> &str {
        "failing"
    }

    fn denoise(&mut self, _: &HostDevice, _: &HostBuffer, _: &HostBuffer, _: u32, _: u32) -> kiln::Result<()> {
        Err(Error::Denoise("no filter available".into()))
    }
}

#[test]
fn denoiser_failure_still_tonemaps() {
    let scene = single_triangle_scene();
    let config = RenderConfig {
        denoise: true,
        ..Default::default()
    };
    let mut renderer = renderer(HostDevice::default(), config).with_denoiser(Box::new(FailingDenoiser));
    renderer.initialize(WIDTH, HEIGHT).unwrap();
    renderer.set_scene(&scene).unwrap();
    renderer.device().clear_command_log();

    let stats = renderer.render(&scene.default_camera(), false, true).unwrap();
    assert_eq!(stats.frame_index, 0);
    assert!(renderer
        .device()
        .command_log()
        .iter()
        .any(|c| matches!(c, HostCommand::DispatchTonemap { .. })));
}

#[test]
fn out_of_memory_releases_partial_scene() {
    let scene = two_mesh_scene();

    // measure what the frame targets and placeholders need on their own
    let baseline = {
        let mut renderer = renderer(HostDevice::default(), RenderConfig::default());
        renderer.initialize(WIDTH, HEIGHT).unwrap();
        renderer.device().total_allocated_bytes()
    };

    let device = HostDevice::new(HostDeviceParams {
        memory_budget: Some(baseline + 64),
        ..Default::default()
    });
    let mut renderer = renderer(device, RenderConfig::default());
    renderer.initialize(WIDTH, HEIGHT).unwrap();
    assert_eq!(renderer.device().total_allocated_bytes(), baseline);

    let err = renderer.set_scene(&scene).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { .. }));
    assert_eq!(err.severity(), Severity::SetupFatal);
    assert_eq!(renderer.device().total_allocated_bytes(), baseline);
    assert_eq!(renderer.device().live_accel_count(), 0);
    assert!(renderer.scene_accel().is_none());
    assert!(matches!(
        renderer.render(&scene.default_camera(), false, true),
        Err(Error::NotInitialized(_))
    ));
}

#[test]
fn missing_environment_map_uses_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let mut scene = facing_quad_scene();
    scene.environment_map = Some(dir.path().join("missing.hdr"));

    let mut renderer = ready_renderer(&scene, RenderConfig::default());
    renderer.render(&scene.default_camera(), false, true).unwrap();
    assert_eq!(&pixel(&renderer, 0, 0)[..3], &[0, 0, 0]);
}

#[test]
fn render_before_initialize() {
    let scene = single_triangle_scene();
    let mut renderer = renderer(HostDevice::default(), RenderConfig::default());
    assert_eq!(renderer.frame_size(), (0, 0));
    assert!(matches!(
        renderer.render(&scene.default_camera(), false, true),
        Err(Error::NotInitialized(_))
    ));

    // a scene alone is not enough
    renderer.set_scene(&scene).unwrap();
    assert!(matches!(
        renderer.render(&scene.default_camera(), false, true),
        Err(Error::NotInitialized(_))
    ));
    assert!(renderer.binding_table_desc().is_err());

    renderer.initialize(WIDTH, HEIGHT).unwrap();
    assert!(renderer.render(&scene.default_camera(), false, true).is_ok());
    assert_eq!(renderer.frame_size(), (WIDTH, HEIGHT));
}

#[test]
fn invalid_scene_is_rejected() {
    let mut scene = single_triangle_scene();
    scene.parameterized_meshes[0].material_ids.push(0);
    let mut renderer = renderer(HostDevice::default(), RenderConfig::default());
    assert!(matches!(renderer.set_scene(&scene), Err(Error::InvalidScene(_))));
    assert!(matches!(
        renderer.set_scene(&Scene::default()),
        Err(Error::InvalidScene(_))
    ));
}

#[test]
fn facing_quad_is_lit_and_background_is_black() {
    let scene = facing_quad_scene();
    let mut renderer = ready_renderer(&scene, RenderConfig::default());
    renderer.render(&scene.default_camera(), false, true).unwrap();

    let center = pixel(&renderer, WIDTH / 2, HEIGHT / 2);
    assert!(center[0] > 180, "center pixel {:?}", center);
    assert_eq!(center[0], center[1]);
    assert_eq!(center[3], 255);

    for &(x, y) in [(0, 0), (WIDTH - 1, 0), (0, HEIGHT - 1), (WIDTH - 1, HEIGHT - 1)].iter() {
        assert_eq!(&pixel(&renderer, x, y)[..3], &[0, 0, 0], "corner {} {}", x, y);
    }
}

#[test]
fn accumulation_converges_for_static_camera() {
    let scene = facing_quad_scene();
    let mut renderer = ready_renderer(&scene, RenderConfig::default());
    let camera = scene.default_camera();

    renderer.render(&camera, false, true).unwrap();
    let first = pixel(&renderer, WIDTH / 2, HEIGHT / 2);
    for _ in 0..3 {
        renderer.render(&camera, false, true).unwrap();
    }
    let later = pixel(&renderer, WIDTH / 2, HEIGHT / 2);
    assert!((i32::from(first[0]) - i32::from(later[0])).abs() <= 2);
}

#[test]
fn ray_statistics_are_reported() {
    let scene = facing_quad_scene();
    let config = RenderConfig {
        report_ray_stats: true,
        ..Default::default()
    };
    let mut renderer = ready_renderer(&scene, config);
    let stats = renderer.render(&scene.default_camera(), false, true).unwrap();

    assert_eq!(renderer.ray_counts().len(), (WIDTH * HEIGHT) as usize);
    assert!(renderer.ray_counts().iter().all(|&count| count >= 1));
    assert!(stats.rays_per_second.unwrap() > 0.0);
}

#[test]
fn quad_light_shadows_reach_the_floor() {
    let mut scene = facing_quad_scene();
    scene.lights.push(QuadLight::new(
        Vec3::broadcast(20.0),
        Vec3::new(0.0, 0.0, 3.0),
        Vec3::unit_x(),
        Vec3::unit_y(),
        0.5,
        0.5,
    ));
    let config = RenderConfig {
        report_ray_stats: true,
        ..Default::default()
    };
    let mut renderer = ready_renderer(&scene, config);
    renderer.render(&scene.default_camera(), false, true).unwrap();

    // hits trace a shadow ray towards the light, misses do not
    let center = (HEIGHT / 2 * WIDTH + WIDTH / 2) as usize;
    assert_eq!(renderer.ray_counts()[center], 2);
    assert_eq!(renderer.ray_counts()[0], 1);
    assert!(pixel(&renderer, WIDTH / 2, HEIGHT / 2)[0] > 0);
}

#[test]
fn textured_quad_with_padded_vec3_stride() {
    let mut scene = facing_quad_scene();
    let texel = |name: &str, pixels: Vec<u8>| Image {
        name: name.into(),
        width: 1,
        height: 1,
        color_space: ColorSpace::Srgb,
        pixels,
    };
    scene.add_texture(texel("green", vec![0, 255, 0, 255]));
    let red = scene.add_texture(texel("red", vec![255, 0, 0, 255]));
    scene.materials[0] = DisneyMaterial::diffuse(Vec3::one()).with_base_color_texture(red);

    let device = HostDevice::new(HostDeviceParams {
        vec3_stride: 16,
        ..Default::default()
    });
    let mut renderer = renderer(device, RenderConfig::default());
    renderer.initialize(WIDTH, HEIGHT).unwrap();
    renderer.set_scene(&scene).unwrap();

    let desc = renderer.binding_table_desc().unwrap();
    let textures = desc.writes().iter().find(|write| write.slot == TEXTURES_SLOT).unwrap();
    assert_eq!(textures.descriptors.len(), 2);
    assert!(textures.descriptors.iter().all(|descriptor| !descriptor.is_null()));

    let globals = renderer.global_buffers().unwrap();
    let vertices = download_buffer(renderer.device(), globals.vertices.as_ref().unwrap()).unwrap();
    assert_eq!(vertices.len(), 4 * 16);
    let packed = PackedSceneData::pack(&scene, 16);
    assert_eq!(vertices, packed.vertices);

    renderer.render(&scene.default_camera(), false, true).unwrap();
    let center = pixel(&renderer, WIDTH / 2, HEIGHT / 2);
    assert!(center[0] > 180, "center pixel {:?}", center);
    assert_eq!(&center[1..], &[0, 0, 255]);
    assert_eq!(&pixel(&renderer, 0, 0)[..3], &[0, 0, 0]);
}
