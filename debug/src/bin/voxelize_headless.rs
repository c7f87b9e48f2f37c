//! Headless voxelization: build a scene (procedural, or an OBJ given as first argument), run one
//! frame through the plugin, read the volume back and write the Z slices as a PNG atlas.
//! Run from repo root: cargo run -p debug --bin voxelize_headless -- [model.obj] [out_dir]
//! Grid parameters can be overridden with VOXELGI_VOLUME_SIZE / VOXELGI_VOXEL_SIZE / VOXELGI_DENSITY / VOXELGI_STORAGE.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Mat4, Vec3};
use render_api::{
    ExtractedView, MaterialData, MeshData, MeshRenderer, RenderBackend, SceneGraph, SceneNode, SceneObject,
    TextureData, IDENTITY,
};
use voxelgi_bridge::{SharedRegistry, VoxelGiPlugin};
use voxelgi_renderer::{OutputDensity, SessionId, VolumeSize, VoxelGiConfig};

fn push_vertex(out: &mut Vec<u8>, p: [f32; 3], n: [f32; 3], uv: [f32; 2]) {
    out.extend_from_slice(bytemuck::cast_slice(&[p[0], p[1], p[2], n[0], n[1], n[2], uv[0], uv[1]]));
}

/// Axis-aligned box, 4 vertices per face.
fn cuboid(id: u64, name: &str, min: Vec3, max: Vec3) -> MeshData {
    let mut vertex = Vec::with_capacity(24 * 32);
    let mut index: Vec<u32> = Vec::with_capacity(36);
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];
    let center = (min + max) * 0.5;
    let half = (max - min) * 0.5;
    for (n, u, v) in faces {
        let base = (vertex.len() / 32) as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = center + (n + u * su + v * sv) * half;
            push_vertex(&mut vertex, p.to_array(), n.to_array(), [(su + 1.0) * 0.5, (sv + 1.0) * 0.5]);
        }
        index.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    MeshData::single(id, name, vertex, bytemuck::cast_slice(&index).to_vec())
}

fn object(id: u64, name: &str, mesh: MeshData, transform: Mat4, tint: [f32; 4]) -> SceneObject {
    SceneObject::new(SceneNode::new(id, name, transform.to_cols_array())).with_renderer(MeshRenderer {
        mesh: Some(Arc::new(mesh)),
        materials: vec![Some(MaterialData { base_color: None, tint })],
    })
}

fn procedural_scene() -> SceneGraph {
    let mut scene = SceneGraph::new();
    let backdrop = cuboid(1, "backdrop", Vec3::new(-6.0, -6.0, 3.0), Vec3::new(6.0, 6.0, 3.5));
    let pillar = cuboid(2, "pillar", Vec3::splat(-0.5), Vec3::splat(0.5));
    let slab = cuboid(3, "slab", Vec3::new(-2.0, -0.25, -0.5), Vec3::new(2.0, 0.25, 0.5));
    let mut root = object(1, "backdrop", backdrop, Mat4::IDENTITY, [0.8, 0.8, 0.8, 1.0]);
    root = root.with_child(object(2, "red_pillar", pillar, Mat4::from_translation(Vec3::new(-2.5, 1.0, 0.0)), [0.9, 0.1, 0.1, 1.0]));
    let green = cuboid(4, "pillar", Vec3::splat(-0.5), Vec3::splat(0.5));
    root = root.with_child(object(3, "green_pillar", green, Mat4::from_translation(Vec3::new(2.5, 1.0, -1.0)), [0.1, 0.9, 0.2, 1.0]));
    root = root.with_child(object(4, "slab", slab, Mat4::from_translation(Vec3::new(0.0, -2.0, 1.0)), [0.2, 0.3, 0.9, 1.0]));
    scene.roots.push(root);
    scene
}

fn load_texture(id: u64, path: &Path) -> Result<TextureData, String> {
    let img = image::open(path).map_err(|e| e.to_string())?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(TextureData { id, data: rgba.into_raw(), width, height })
}

fn obj_scene(obj_path: &Path) -> Result<SceneGraph, String> {
    let (models, materials) = tobj::load_obj(obj_path, &tobj::GPU_LOAD_OPTIONS).map_err(|e| format!("load_obj: {:?}", e))?;
    let materials = materials.unwrap_or_else(|e| {
        log::warn!("{}: materials not loaded: {:?}", obj_path.display(), e);
        Vec::new()
    });
    let dir = obj_path.parent().unwrap_or(Path::new("."));
    let mut scene = SceneGraph::new();
    for (i, model) in models.into_iter().enumerate() {
        let id = i as u64 + 1;
        let mesh = model.mesh;
        let n = mesh.positions.len() / 3;
        let mut vertex = Vec::with_capacity(n * 32);
        for v in 0..n {
            let p = [mesh.positions[v * 3], mesh.positions[v * 3 + 1], mesh.positions[v * 3 + 2]];
            let nrm = match mesh.normals.get(v * 3..v * 3 + 3) {
                Some(s) => [s[0], s[1], s[2]],
                None => [0.0; 3],
            };
            let uv = match mesh.texcoords.get(v * 2..v * 2 + 2) {
                Some(s) => [s[0], 1.0 - s[1]],
                None => [0.0; 2],
            };
            push_vertex(&mut vertex, p, nrm, uv);
        }
        let index = bytemuck::cast_slice(&mesh.indices).to_vec();
        let material = mesh.material_id.and_then(|m| materials.get(m)).map(|m| {
            let d = m.diffuse.unwrap_or([1.0; 3]);
            let base_color = m.diffuse_texture.as_ref().and_then(|t| match load_texture(id, &dir.join(t)) {
                Ok(tex) => Some(Arc::new(tex)),
                Err(e) => {
                    log::warn!("{}: {}", t, e);
                    None
                }
            });
            MaterialData { base_color, tint: [d[0], d[1], d[2], 1.0] }
        });
        let renderer = MeshRenderer {
            mesh: Some(Arc::new(MeshData::single(id, model.name.clone(), vertex, index))),
            materials: vec![Some(material.unwrap_or_default())],
        };
        scene.roots.push(SceneObject::new(SceneNode::new(id, model.name, IDENTITY)).with_renderer(renderer));
    }
    Ok(scene)
}

/// Z slices laid out left to right, top to bottom, `cols` per row.
fn write_atlas(resolved: &[[f32; 4]], edge: u32, path: &Path) -> Result<(), String> {
    let cols = (edge as f32).sqrt().ceil() as u32;
    let rows = edge.div_ceil(cols);
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let img = image::RgbaImage::from_fn(cols * edge, rows * edge, |px, py| {
        let z = (py / edge) * cols + px / edge;
        if z >= edge {
            return image::Rgba([0, 0, 0, 0]);
        }
        let (x, y) = (px % edge, edge - 1 - py % edge);
        let c = resolved[(x + edge * (y + edge * z)) as usize];
        image::Rgba([to_u8(c[0]), to_u8(c[1]), to_u8(c[2]), to_u8(c[3])])
    });
    img.save(path).map_err(|e| e.to_string())
}

fn main() -> Result<(), String> {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let obj = args.iter().find(|a| a.ends_with(".obj")).map(PathBuf::from);
    let out_dir = PathBuf::from(args.iter().find(|a| !a.ends_with(".obj")).map_or("voxelize_out", |a| a.as_str()));

    let mut config = VoxelGiConfig {
        volume_size: VolumeSize::V32,
        output_density: OutputDensity::X10,
        voxel_size: 0.5,
        ..Default::default()
    };
    config.apply_env_overrides();

    let registry = SharedRegistry::default();
    let mut plugin = VoxelGiPlugin::headless(config, SessionId::new(), registry)?;
    if !plugin.is_enabled() {
        return Err("voxel GI is not supported on this adapter".to_string());
    }
    let scene = match &obj {
        Some(path) => obj_scene(path)?,
        None => procedural_scene(),
    };
    plugin.collect_from_scene(&scene);
    plugin.render_frame(&ExtractedView::default())?;

    let renderer = plugin.renderer();
    let edge = renderer.volume().edge().ok_or("volume not ready")?;
    let resolved = renderer.read_resolved()?;
    let counts = renderer.read_counts()?;
    let filled = counts.iter().filter(|&&c| c > 0).count();
    let samples: u64 = counts.iter().map(|&c| c as u64).sum();
    println!(
        "voxelized {} draws: {} of {} voxels filled, {} samples",
        renderer.frame_report().map_or(0, |r| r.draws_issued),
        filled,
        counts.len(),
        samples
    );
    if let Ok(blocks) = renderer.read_occupied_blocks() {
        println!("occupied 2x2x2 blocks: {}", blocks);
    }

    std::fs::create_dir_all(&out_dir).map_err(|e| e.to_string())?;
    let atlas = out_dir.join("slices.png");
    write_atlas(&resolved, edge, &atlas)?;
    println!("wrote {}", atlas.display());
    Ok(())
}
