//! End-to-end checks against a real device. Each test returns early when no adapter (or no
//! adapter with fragment storage writes) is available.

use std::sync::Arc;

use glam::Vec3;
use render_api::{ExtractedView, MeshData, SceneNode, TextureData, IDENTITY};
use voxelgi_renderer::encoding::decode_tolerance;
use voxelgi_renderer::reference::{ReferenceVolume, ReferenceVoxelizer};
use voxelgi_renderer::{
    Capabilities, DrawEntry, GiPrograms, OutputDensity, StorageKind, ViewTargets, VolumeSize, VoxelGiConfig,
    VoxelGiRenderer, VoxelizationPrograms,
};

async fn request_device() -> Option<(wgpu::Device, wgpu::Queue, Capabilities)> {
    let instance = wgpu::Instance::default();
    let adapter = instance.request_adapter(&wgpu::RequestAdapterOptions::default()).await?;
    let desc = wgpu::DeviceDescriptor { required_limits: adapter.limits(), ..Default::default() };
    let (device, queue) = adapter.request_device(&desc, None).await.ok()?;
    let caps = Capabilities::from_device(&adapter, &device);
    Some((device, queue, caps))
}

/// Device at the WebGPU default limits, the way most hosts create one.
async fn request_default_device() -> Option<(wgpu::Device, wgpu::Queue, Capabilities)> {
    let instance = wgpu::Instance::default();
    let adapter = instance.request_adapter(&wgpu::RequestAdapterOptions::default()).await?;
    let (device, queue) = adapter.request_device(&wgpu::DeviceDescriptor::default(), None).await.ok()?;
    let caps = Capabilities::from_device(&adapter, &device);
    Some((device, queue, caps))
}

fn renderer(config: VoxelGiConfig) -> Option<VoxelGiRenderer> {
    let Some((device, queue, caps)) = pollster::block_on(request_device()) else {
        eprintln!("no wgpu adapter, skipping");
        return None;
    };
    let mut r = VoxelGiRenderer::new(device, queue, caps, config);
    if let Err(e) = r.setup() {
        eprintln!("adapter cannot host the volume ({}), skipping", e);
        return None;
    }
    Some(r)
}

fn config(storage: StorageKind) -> VoxelGiConfig {
    VoxelGiConfig {
        volume_size: VolumeSize::V8,
        output_density: OutputDensity::X1,
        voxel_size: 1.0,
        storage,
        ..Default::default()
    }
}

fn quad(id: u64, x0: f32, y0: f32, x1: f32, y1: f32, z: f32) -> Arc<MeshData> {
    let corners = [[x0, y0], [x1, y0], [x1, y1], [x0, y1]];
    let vertex: Vec<u8> = corners
        .iter()
        .flat_map(|c| [c[0], c[1], z, 0.0, 0.0, -1.0, 0.5, 0.5])
        .flat_map(|f| f.to_le_bytes())
        .collect();
    let index: Vec<u8> = [0u32, 1, 2, 0, 2, 3].iter().flat_map(|i| i.to_le_bytes()).collect();
    Arc::new(MeshData::single(id, "quad", vertex, index))
}

fn run_frame(r: &mut VoxelGiRenderer) {
    let camera = ExtractedView::default();
    let cmd = r.render_frame(&camera, None).expect("frame");
    r.submit([cmd]);
}

#[test]
fn setup_and_dispose_toggle_readiness() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    assert!(r.volume().is_ready());
    assert_eq!(r.volume().generation(), 1);
    assert_eq!(r.volume().total_count(), Some(512));
    assert_eq!(r.volume().octree_count(), Some(64));
    assert_eq!(r.capture().target().map(|t| t.size), Some(8));
    let format = r.capture().target().map(|t| t.texture.format());
    assert_eq!(format, Some(voxelgi_renderer::placement::CAPTURE_FORMAT));
    assert!(format.is_some_and(|f| !f.has_depth_aspect()));
    r.dispose();
    assert!(!r.volume().is_ready());
    assert!(r.volume().resolved_buffer().is_none());
    r.dispose();
    run_frame(&mut r);
    assert!(r.read_resolved().is_err());
}

#[test]
fn default_limit_device_either_refuses_setup_or_runs_cleanly() {
    for storage in [StorageKind::Buffer, StorageKind::Texture3d] {
        let Some((device, queue, caps)) = pollster::block_on(request_default_device()) else {
            eprintln!("no wgpu adapter, skipping");
            return;
        };
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut cfg = config(storage);
        cfg.volume_size = VolumeSize::V64;
        let mut r = VoxelGiRenderer::new(device, queue, caps, cfg);
        match r.setup() {
            Err(e) => {
                assert!(!r.volume().is_ready());
                assert_eq!(r.volume().last_error(), Some(&e));
            }
            Ok(()) => {
                r.draws_mut().push(DrawEntry::new(
                    SceneNode::new(1, "q", IDENTITY),
                    quad(1, 0.0, 0.0, 4.0, 4.0, 0.5),
                    0,
                    None,
                    [0.5; 4],
                ));
                run_frame(&mut r);
                let report = r.frame_report().cloned().unwrap_or_default();
                assert!(report.cleared && report.resolved && report.hierarchy_built);
                assert_eq!(r.read_counts().expect("counts").iter().sum::<u32>(), 16);
            }
        }
        let error = pollster::block_on(r.device().pop_error_scope());
        assert!(error.is_none(), "{:?} storage raised {:?}", storage, error);
    }
}

#[test]
fn reconfigure_replaces_the_generation() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let mut bigger = config(StorageKind::Buffer);
    bigger.volume_size = VolumeSize::V16;
    bigger.output_density = OutputDensity::X10;
    r.reconfigure(bigger).expect("reconfigure");
    assert_eq!(r.volume().generation(), 2);
    assert_eq!(r.volume().total_count(), Some(4096));
    assert_eq!(r.capture().target().map(|t| t.size), Some(160));
    assert_eq!(r.read_counts().map(|c| c.len()), Ok(4096));
}

#[test]
fn empty_frame_resolves_to_zero() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    run_frame(&mut r);
    let report = r.frame_report().cloned().unwrap_or_default();
    assert!(report.cleared && report.resolved && report.hierarchy_built);
    assert!(r.read_resolved().expect("resolved").iter().all(|c| *c == [0.0; 4]));
    assert!(r.read_counts().expect("counts").iter().all(|&c| c == 0));
    assert_eq!(r.read_occupied_blocks(), Ok(0));
}

#[test]
fn repeated_draws_of_one_voxel_average_to_the_tint() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let tint = [0.8, 0.3, 0.1, 1.0];
    let mesh = quad(1, 0.0, 0.0, 1.0, 1.0, 0.5);
    let n = 6;
    for i in 0..n {
        r.draws_mut().push(DrawEntry::new(SceneNode::new(i, "q", IDENTITY), Arc::clone(&mesh), 0, None, tint));
    }
    run_frame(&mut r);
    assert_eq!(r.frame_report().map(|f| f.draws_issued), Some(n as usize));

    let layout = *r.volume().layout().expect("layout");
    let target = layout.index(4, 4, 4);
    let counts = r.read_counts().expect("counts");
    assert_eq!(counts[target], n as u32);
    assert_eq!(counts.iter().map(|&c| c as u64).sum::<u64>(), n);
    let resolved = r.read_resolved().expect("resolved");
    for k in 0..4 {
        assert!((resolved[target][k] - tint[k]).abs() <= decode_tolerance(), "channel {}", k);
    }
    assert_eq!(r.read_occupied_blocks(), Ok(1));
    let node = r.read_octree().expect("octree")[layout.block_index(4, 4, 4)];
    assert_eq!(node.child_count, 1);
}

#[test]
fn gpu_matches_cpu_reference() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let floor = quad(1, -3.0, -3.0, 2.0, 1.0, -1.5);
    let wall = quad(2, -1.0, 0.0, 3.0, 3.0, 2.5);
    r.draws_mut().push(DrawEntry::new(SceneNode::new(1, "floor", IDENTITY), floor, 0, None, [0.2, 0.6, 0.2, 1.0]));
    r.draws_mut().push(DrawEntry::new(SceneNode::new(2, "wall", IDENTITY), wall, 0, None, [0.9, 0.1, 0.1, 1.0]));
    run_frame(&mut r);

    let placement = *r.capture().placement().expect("placement");
    let mut cpu = ReferenceVolume::new(8);
    ReferenceVoxelizer::new(placement, 8).voxelize(r.draws(), &mut cpu);
    cpu.resolve();
    assert_eq!(r.read_counts().expect("counts"), cpu.counts());
    let gpu = r.read_resolved().expect("resolved");
    for (g, c) in gpu.iter().zip(cpu.resolved()) {
        for k in 0..4 {
            assert!((g[k] - c[k]).abs() <= 1e-5);
        }
    }
}

#[test]
fn each_draw_uses_its_own_transform() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let mesh = quad(1, 0.0, 0.0, 1.0, 1.0, 0.5);
    let offsets: Vec<(i32, i32)> = (0..20).map(|i| (i % 5 - 2, i / 5 - 2)).collect();
    for (i, &(dx, dy)) in offsets.iter().enumerate() {
        let transform = glam::Mat4::from_translation(Vec3::new(dx as f32, dy as f32, 0.0)).to_cols_array();
        r.draws_mut().push(DrawEntry::new(SceneNode::new(i as u64, "q", transform), Arc::clone(&mesh), 0, None, [1.0; 4]));
    }
    run_frame(&mut r);
    assert_eq!(r.frame_report().map(|f| f.draws_issued), Some(20));
    let layout = *r.volume().layout().expect("layout");
    let counts = r.read_counts().expect("counts");
    for &(dx, dy) in &offsets {
        assert_eq!(counts[layout.index((4 + dx) as u32, (4 + dy) as u32, 4)], 1, "offset ({}, {})", dx, dy);
    }
    assert_eq!(counts.iter().sum::<u32>(), 20);

    while r.draws().count() > 2 {
        r.draws_mut().remove(0);
    }
    run_frame(&mut r);
    let counts = r.read_counts().expect("counts");
    assert_eq!(counts.iter().sum::<u32>(), 2);
    assert_eq!(counts[layout.index(5, 5, 4)], 1);
    assert_eq!(counts[layout.index(6, 5, 4)], 1);
}

#[test]
fn material_follows_base_colour_upload() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let broken = Arc::new(TextureData { id: 7, data: Vec::new(), width: 1, height: 1 });
    r.draws_mut().push(DrawEntry::new(
        SceneNode::new(1, "q", IDENTITY),
        quad(1, 0.0, 0.0, 1.0, 1.0, 0.5),
        0,
        Some(broken),
        [1.0; 4],
    ));
    run_frame(&mut r);
    let layout = *r.volume().layout().expect("layout");
    let target = layout.index(4, 4, 4);
    assert!(r.draws().entry_at(0).and_then(|e| e.material()).is_some_and(|m| m.texture().is_none()));
    let white = r.read_resolved().expect("resolved")[target];
    assert!(white.iter().all(|c| (c - 1.0).abs() <= decode_tolerance()));

    let red = Arc::new(TextureData { id: 7, data: vec![255, 0, 0, 255], width: 1, height: 1 });
    if let Some(entry) = r.draws_mut().entry_at_mut(0) {
        entry.base_color = Some(red);
    }
    run_frame(&mut r);
    assert!(r.draws().entry_at(0).and_then(|e| e.material()).is_some_and(|m| m.texture().is_some_and(|t| t.id == 7)));
    let v = r.read_resolved().expect("resolved")[target];
    let expected = [1.0, 0.0, 0.0, 1.0];
    for k in 0..4 {
        assert!((v[k] - expected[k]).abs() <= decode_tolerance(), "channel {}", k);
    }
}

#[test]
fn inactive_entries_stop_contributing() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let node = SceneNode::new(1, "q", IDENTITY);
    r.draws_mut().push(DrawEntry::new(Arc::clone(&node), quad(1, 0.0, 0.0, 1.0, 1.0, 0.5), 0, None, [1.0; 4]));
    run_frame(&mut r);
    assert_eq!(r.read_counts().expect("counts").iter().sum::<u32>(), 1);

    node.set_active(false);
    run_frame(&mut r);
    assert_eq!(r.frame_report().map(|f| f.inactive_skipped), Some(1));
    assert_eq!(r.read_counts().expect("counts").iter().sum::<u32>(), 0);
    assert!(r.read_resolved().expect("resolved").iter().all(|c| *c == [0.0; 4]));
}

#[test]
fn absent_programs_degrade_to_noops() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    r.draws_mut().push(DrawEntry::new(SceneNode::new(1, "q", IDENTITY), quad(1, 0.0, 0.0, 1.0, 1.0, 0.5), 0, None, [1.0; 4]));
    r.set_voxelization_programs(VoxelizationPrograms::default());
    r.set_gi_programs(GiPrograms::default());
    run_frame(&mut r);
    let report = r.frame_report().cloned().unwrap_or_default();
    assert!(!report.cleared && !report.voxelized && !report.resolved && !report.hierarchy_built);
    assert_eq!(report.draws_issued, 0);
    assert!(!r.gi_drawn_last_frame());
}

#[test]
fn on_demand_capture_runs_once_per_request() {
    let mut cfg = config(StorageKind::Buffer);
    cfg.capture_mode = voxelgi_renderer::CaptureMode::OnDemand;
    let Some(mut r) = renderer(cfg) else { return };
    r.draws_mut().push(DrawEntry::new(SceneNode::new(1, "q", IDENTITY), quad(1, 0.0, 0.0, 1.0, 1.0, 0.5), 0, None, [1.0; 4]));
    run_frame(&mut r);
    assert!(!r.frame_report().is_some_and(|f| f.voxelized));
    r.request_capture();
    run_frame(&mut r);
    assert!(r.frame_report().is_some_and(|f| f.voxelized));
    run_frame(&mut r);
    assert!(!r.frame_report().is_some_and(|f| f.voxelized));
    assert_eq!(r.read_counts().expect("counts").iter().sum::<u32>(), 1);
}

#[test]
fn texture_storage_resolves_into_mip_zero_and_builds_mips() {
    let Some(mut r) = renderer(config(StorageKind::Texture3d)) else { return };
    assert!(r.volume().volume_texture().is_some());
    assert!(r.volume().resolved_buffer().is_none());
    let tint = [0.5, 0.25, 1.0, 1.0];
    r.draws_mut().push(DrawEntry::new(SceneNode::new(1, "q", IDENTITY), quad(1, 0.0, 0.0, 1.0, 1.0, 0.5), 0, None, tint));
    run_frame(&mut r);
    let layout = *r.volume().layout().expect("layout");
    let mip0 = r.read_resolved().expect("mip 0");
    let v = mip0[layout.index(4, 4, 4)];
    for k in 0..4 {
        assert!((v[k] - tint[k]).abs() < 2e-3, "channel {}", k);
    }
    let top = r.read_mip(layout.mip_count() - 1).expect("top mip");
    assert_eq!(top.len(), 1);
    assert!((top[0][0] - tint[0] / 512.0).abs() < 1e-3);
    assert!(r.read_octree().is_err());
}

#[test]
fn gi_pass_needs_depth_and_normals() {
    let Some(mut r) = renderer(config(StorageKind::Buffer)) else { return };
    let device = r.device();
    let target = |format: wgpu::TextureFormat, usage: wgpu::TextureUsages| {
        device
            .create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: wgpu::Extent3d { width: 64, height: 64, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
            .create_view(&Default::default())
    };
    let color = target(wgpu::TextureFormat::Rgba8Unorm, wgpu::TextureUsages::RENDER_ATTACHMENT);
    let depth = target(wgpu::TextureFormat::Depth32Float, wgpu::TextureUsages::TEXTURE_BINDING);
    let normals = target(wgpu::TextureFormat::Rgba16Float, wgpu::TextureUsages::TEXTURE_BINDING);
    let camera = ExtractedView { camera_position: Vec3::ZERO.to_array(), viewport_size: (64, 64), ..Default::default() };

    let views = |with_normals: bool| ViewTargets {
        color: &color,
        color_format: wgpu::TextureFormat::Rgba8Unorm,
        depth: Some(&depth),
        normals: with_normals.then_some(&normals),
        size: (64, 64),
    };
    let cmd = r.render_frame(&camera, Some(views(false))).expect("frame");
    r.submit([cmd]);
    assert!(r.schedule_report().skipped.iter().any(|n| n == "voxelgi_gi"));
    assert!(!r.gi_drawn_last_frame());

    let cmd = r.render_frame(&camera, Some(views(true))).expect("frame");
    r.submit([cmd]);
    assert!(r.schedule_report().executed.iter().any(|n| n == "voxelgi_gi"));
    assert!(r.gi_drawn_last_frame());
}
