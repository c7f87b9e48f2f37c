//! GPU copies of the meshes and textures referenced by the draw list, uploaded once per id.

use std::collections::{HashMap, HashSet};

use render_api::{MeshData, SubMesh, TextureData};

use crate::draw_list::SceneDrawList;

/// Format of uploaded base-colour textures (values are read as stored, no sRGB decode).
pub const BASE_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub struct GpuMesh {
    pub vertex_buf: wgpu::Buffer,
    pub index_buf: wgpu::Buffer,
    pub submeshes: Vec<SubMesh>,
}

pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    /// Distinguishes re-uploads of the same id.
    pub generation: u64,
}

/// Identity of the GPU texture bound for a base colour; `None` stands for the white fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub id: u64,
    pub generation: u64,
}

pub struct GpuAssetCache {
    meshes: HashMap<u64, GpuMesh>,
    textures: HashMap<u64, GpuTexture>,
    white: GpuTexture,
    sampler: wgpu::Sampler,
    uploads: u64,
}

fn upload_texture(device: &wgpu::Device, queue: &wgpu::Queue, label: &str, data: &[u8], width: u32, height: u32) -> GpuTexture {
    let size = wgpu::Extent3d { width, height, depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: BASE_COLOR_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::ImageDataLayout { offset: 0, bytes_per_row: Some(width * 4), rows_per_image: Some(height) },
        size,
    );
    let view = texture.create_view(&Default::default());
    GpuTexture { texture, view, generation: 0 }
}

impl GpuAssetCache {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let white = upload_texture(device, queue, "voxelgi_white", &[255, 255, 255, 255], 1, 1);
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("voxelgi_base_color_sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self { meshes: HashMap::new(), textures: HashMap::new(), white, sampler, uploads: 0 }
    }

    /// Upload every mesh/texture the list references that is not cached yet, then drop the
    /// ones it no longer references.
    pub fn prepare(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, draws: &SceneDrawList) {
        for entry in draws.iter() {
            self.upload_mesh(device, queue, &entry.mesh);
            if let Some(tex) = &entry.base_color {
                self.upload_texture(device, queue, tex);
            }
        }
        self.retain_used(draws);
    }

    fn upload_mesh(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, mesh: &MeshData) {
        if self.meshes.contains_key(&mesh.id) || mesh.vertex_data.is_empty() || mesh.index_data.is_empty() {
            return;
        }
        let vertex_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxelgi_mesh_vertex"),
            size: mesh.vertex_data.len() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&vertex_buf, 0, &mesh.vertex_data);
        let index_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxelgi_mesh_index"),
            size: mesh.index_data.len() as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&index_buf, 0, &mesh.index_data);
        log::debug!("uploaded mesh {} '{}' ({} vertices)", mesh.id, mesh.name, mesh.vertex_count());
        self.meshes.insert(mesh.id, GpuMesh { vertex_buf, index_buf, submeshes: mesh.submeshes.clone() });
    }

    fn upload_texture(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, tex: &TextureData) {
        if self.textures.contains_key(&tex.id) {
            return;
        }
        let expected = tex.width as usize * tex.height as usize * 4;
        if tex.width == 0 || tex.height == 0 || tex.data.len() < expected {
            log::warn!("texture {} has {} bytes for {}x{}, using white", tex.id, tex.data.len(), tex.width, tex.height);
            return;
        }
        let mut gpu = upload_texture(device, queue, "voxelgi_base_color", &tex.data[..expected], tex.width, tex.height);
        self.uploads += 1;
        gpu.generation = self.uploads;
        self.textures.insert(tex.id, gpu);
    }

    /// Drop GPU assets the list no longer references.
    pub fn retain_used(&mut self, draws: &SceneDrawList) {
        let meshes: HashSet<u64> = draws.iter().map(|e| e.mesh.id).collect();
        let textures: HashSet<u64> = draws.iter().filter_map(|e| e.base_color.as_ref().map(|t| t.id)).collect();
        self.meshes.retain(|id, _| meshes.contains(id));
        self.textures.retain(|id, _| textures.contains(id));
    }

    pub fn mesh(&self, id: u64) -> Option<&GpuMesh> { self.meshes.get(&id) }

    /// View of texture `id`, or the 1x1 white texture.
    pub fn texture_view(&self, id: Option<u64>) -> &wgpu::TextureView {
        id.and_then(|id| self.textures.get(&id)).map(|t| &t.view).unwrap_or(&self.white.view)
    }

    /// Key of the texture `texture_view(id)` returns; `None` when that is the white fallback.
    pub fn texture_key(&self, id: Option<u64>) -> Option<TextureKey> {
        let id = id?;
        self.textures.get(&id).map(|t| TextureKey { id, generation: t.generation })
    }

    pub fn sampler(&self) -> &wgpu::Sampler { &self.sampler }
    pub fn mesh_count(&self) -> usize { self.meshes.len() }
    pub fn texture_count(&self) -> usize { self.textures.len() }

    pub fn clear(&mut self) {
        self.meshes.clear();
        self.textures.clear();
    }
}
