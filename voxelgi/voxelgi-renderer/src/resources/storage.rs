//! GPU storage for the voxel volume. Two interchangeable layouts behind `VolumeStorage`:
//! raw resolved buffer + one-level octree, or an Rgba16Float 3D texture with a mip chain.
//! Both share the accumulation and count buffers written by the voxelize program.

use crate::config::StorageKind;
use crate::resources::layout::VolumeLayout;

/// Compute stages of the frame sequence. Voxelize is a raster stage and has no entry here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComputeStage {
    Clear,
    Resolve,
    BuildHierarchy,
}

impl ComputeStage {
    pub const ALL: [ComputeStage; 3] = [ComputeStage::Clear, ComputeStage::Resolve, ComputeStage::BuildHierarchy];

    pub fn label(self) -> &'static str {
        match self {
            ComputeStage::Clear => "voxelgi_clear",
            ComputeStage::Resolve => "voxelgi_resolve",
            ComputeStage::BuildHierarchy => "voxelgi_build_hierarchy",
        }
    }
}

/// Element of the octree buffer: summary of one 2x2x2 block of resolved voxels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct OctreeNode {
    /// Mean colour of the occupied children.
    pub color: [f32; 4],
    /// Bit i set when child i (x + 2y + 4z inside the block) is non-zero.
    pub occupancy: u32,
    pub child_count: u32,
    pub _pad: [u32; 2],
}

/// GPU volume storage for one `Setup()` generation. Dropping it releases every buffer/texture.
pub trait VolumeStorage: Send + Sync {
    fn kind(&self) -> StorageKind;
    fn layout(&self) -> &VolumeLayout;

    fn accumulation_buffer(&self) -> &wgpu::Buffer;
    fn count_buffer(&self) -> &wgpu::Buffer;
    /// Fragment-visible accumulation + count bindings for the voxelize program.
    fn accumulation_bind_group_layout(&self) -> &wgpu::BindGroupLayout;
    fn accumulation_bind_group(&self) -> &wgpu::BindGroup;

    /// Layout of group 1 for the given compute stage's program.
    fn stage_bind_group_layout(&self, stage: ComputeStage) -> &wgpu::BindGroupLayout;
    /// Bind group 1 and dispatch the stage. Group 0 (volume globals) is bound by the caller.
    fn encode_stage(&self, pass: &mut wgpu::ComputePass<'_>, stage: ComputeStage, pipeline: &wgpu::ComputePipeline);

    /// Read-only bindings the GI program samples.
    fn sampling_bind_group_layout(&self) -> &wgpu::BindGroupLayout;
    fn sampling_bind_group(&self) -> &wgpu::BindGroup;

    fn resolved_buffer(&self) -> Option<&wgpu::Buffer> { None }
    fn octree_buffer(&self) -> Option<&wgpu::Buffer> { None }
    fn octree_index_buffer(&self) -> Option<&wgpu::Buffer> { None }
    fn volume_texture(&self) -> Option<&wgpu::Texture> { None }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn volume_buffer(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Layout of the voxelize program's accumulation group (group 1).
fn create_accumulation_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("voxelgi_accumulation_bgl"),
        entries: &[
            storage_entry(0, wgpu::ShaderStages::FRAGMENT, false),
            storage_entry(1, wgpu::ShaderStages::FRAGMENT, false),
        ],
    })
}

/// Accumulation and count buffers shared by both storages.
struct Accumulation {
    accumulation: wgpu::Buffer,
    counts: wgpu::Buffer,
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
}

impl Accumulation {
    fn new(device: &wgpu::Device, layout: &VolumeLayout) -> Self {
        let accumulation = volume_buffer(device, "voxelgi_accumulation", layout.accumulation_bytes());
        let counts = volume_buffer(device, "voxelgi_counts", layout.count_bytes());
        let layout = create_accumulation_layout(device);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_accumulation_bg"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: accumulation.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: counts.as_entire_binding() },
            ],
        });
        Self { accumulation, counts, layout, bind_group }
    }
}

/// Resolved colour buffer + one-level octree + occupied-block counter.
pub struct BufferStorage {
    layout: VolumeLayout,
    acc: Accumulation,
    resolved: wgpu::Buffer,
    octree: wgpu::Buffer,
    octree_index: wgpu::Buffer,
    compute_layout: wgpu::BindGroupLayout,
    compute_bind_group: wgpu::BindGroup,
    sampling_layout: wgpu::BindGroupLayout,
    sampling_bind_group: wgpu::BindGroup,
}

impl BufferStorage {
    pub fn new(device: &wgpu::Device, layout: VolumeLayout) -> Self {
        let acc = Accumulation::new(device, &layout);
        let resolved = volume_buffer(device, "voxelgi_resolved", layout.resolved_bytes());
        let octree = volume_buffer(device, "voxelgi_octree", layout.octree_bytes());
        let octree_index = volume_buffer(device, "voxelgi_octree_index", layout.index_bytes());
        let compute_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_buffer_compute_bgl"),
            entries: &[
                storage_entry(0, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(3, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(4, wgpu::ShaderStages::COMPUTE, false),
            ],
        });
        let compute_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_buffer_compute_bg"),
            layout: &compute_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: acc.accumulation.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: acc.counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: resolved.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: octree.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: octree_index.as_entire_binding() },
            ],
        });
        let sampling_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_buffer_sampling_bgl"),
            entries: &[
                storage_entry(0, wgpu::ShaderStages::FRAGMENT, true),
                storage_entry(1, wgpu::ShaderStages::FRAGMENT, true),
            ],
        });
        let sampling_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_buffer_sampling_bg"),
            layout: &sampling_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: resolved.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: octree.as_entire_binding() },
            ],
        });
        Self {
            layout,
            acc,
            resolved,
            octree,
            octree_index,
            compute_layout,
            compute_bind_group,
            sampling_layout,
            sampling_bind_group,
        }
    }
}

impl VolumeStorage for BufferStorage {
    fn kind(&self) -> StorageKind { StorageKind::Buffer }
    fn layout(&self) -> &VolumeLayout { &self.layout }
    fn accumulation_buffer(&self) -> &wgpu::Buffer { &self.acc.accumulation }
    fn count_buffer(&self) -> &wgpu::Buffer { &self.acc.counts }
    fn accumulation_bind_group_layout(&self) -> &wgpu::BindGroupLayout { &self.acc.layout }
    fn accumulation_bind_group(&self) -> &wgpu::BindGroup { &self.acc.bind_group }

    fn stage_bind_group_layout(&self, _stage: ComputeStage) -> &wgpu::BindGroupLayout {
        &self.compute_layout
    }

    fn encode_stage(&self, pass: &mut wgpu::ComputePass<'_>, stage: ComputeStage, pipeline: &wgpu::ComputePipeline) {
        let [x, y, z] = match stage {
            ComputeStage::Clear | ComputeStage::Resolve => self.layout.voxel_dispatch(),
            ComputeStage::BuildHierarchy => VolumeLayout::block_dispatch(self.layout.octree_edge()),
        };
        pass.set_pipeline(pipeline);
        pass.set_bind_group(1, &self.compute_bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
    }

    fn sampling_bind_group_layout(&self) -> &wgpu::BindGroupLayout { &self.sampling_layout }
    fn sampling_bind_group(&self) -> &wgpu::BindGroup { &self.sampling_bind_group }

    fn resolved_buffer(&self) -> Option<&wgpu::Buffer> { Some(&self.resolved) }
    fn octree_buffer(&self) -> Option<&wgpu::Buffer> { Some(&self.octree) }
    fn octree_index_buffer(&self) -> Option<&wgpu::Buffer> { Some(&self.octree_index) }
}

pub const VOLUME_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Rgba16Float 3D texture; resolve writes mip 0, the hierarchy stage downsamples each level.
pub struct TextureStorage {
    layout: VolumeLayout,
    acc: Accumulation,
    texture: wgpu::Texture,
    compute_layout: wgpu::BindGroupLayout,
    compute_bind_group: wgpu::BindGroup,
    mip_layout: wgpu::BindGroupLayout,
    /// Entry i downsamples mip i into mip i + 1.
    mip_bind_groups: Vec<wgpu::BindGroup>,
    sampling_layout: wgpu::BindGroupLayout,
    sampling_bind_group: wgpu::BindGroup,
    _sampler: wgpu::Sampler,
}

impl TextureStorage {
    pub fn new(device: &wgpu::Device, layout: VolumeLayout) -> Self {
        let acc = Accumulation::new(device, &layout);
        let edge = layout.edge();
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("voxelgi_volume_texture"),
            size: wgpu::Extent3d { width: edge, height: edge, depth_or_array_layers: edge },
            mip_level_count: layout.mip_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: VOLUME_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let mip_view = |level: u32| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some("voxelgi_volume_mip"),
                dimension: Some(wgpu::TextureViewDimension::D3),
                base_mip_level: level,
                mip_level_count: Some(1),
                ..Default::default()
            })
        };
        let storage_texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: VOLUME_TEXTURE_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D3,
            },
            count: None,
        };

        let compute_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_texture_compute_bgl"),
            entries: &[
                storage_entry(0, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, false),
                storage_texture_entry(2),
            ],
        });
        let mip0 = mip_view(0);
        let compute_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_texture_compute_bg"),
            layout: &compute_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: acc.accumulation.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: acc.counts.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(&mip0) },
            ],
        });

        let mip_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_texture_mip_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                storage_texture_entry(1),
            ],
        });
        let mip_bind_groups = (1..layout.mip_count())
            .map(|level| {
                let src = mip_view(level - 1);
                let dst = mip_view(level);
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("voxelgi_texture_mip_bg"),
                    layout: &mip_layout,
                    entries: &[
                        wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&src) },
                        wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&dst) },
                    ],
                })
            })
            .collect();

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("voxelgi_volume_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let sampling_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_texture_sampling_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("voxelgi_volume_full"),
            dimension: Some(wgpu::TextureViewDimension::D3),
            ..Default::default()
        });
        let sampling_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_texture_sampling_bg"),
            layout: &sampling_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&full_view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&sampler) },
            ],
        });
        Self {
            layout,
            acc,
            texture,
            compute_layout,
            compute_bind_group,
            mip_layout,
            mip_bind_groups,
            sampling_layout,
            sampling_bind_group,
            _sampler: sampler,
        }
    }
}

impl VolumeStorage for TextureStorage {
    fn kind(&self) -> StorageKind { StorageKind::Texture3d }
    fn layout(&self) -> &VolumeLayout { &self.layout }
    fn accumulation_buffer(&self) -> &wgpu::Buffer { &self.acc.accumulation }
    fn count_buffer(&self) -> &wgpu::Buffer { &self.acc.counts }
    fn accumulation_bind_group_layout(&self) -> &wgpu::BindGroupLayout { &self.acc.layout }
    fn accumulation_bind_group(&self) -> &wgpu::BindGroup { &self.acc.bind_group }

    fn stage_bind_group_layout(&self, stage: ComputeStage) -> &wgpu::BindGroupLayout {
        match stage {
            ComputeStage::Clear | ComputeStage::Resolve => &self.compute_layout,
            ComputeStage::BuildHierarchy => &self.mip_layout,
        }
    }

    fn encode_stage(&self, pass: &mut wgpu::ComputePass<'_>, stage: ComputeStage, pipeline: &wgpu::ComputePipeline) {
        pass.set_pipeline(pipeline);
        match stage {
            ComputeStage::Clear | ComputeStage::Resolve => {
                let [x, y, z] = self.layout.voxel_dispatch();
                pass.set_bind_group(1, &self.compute_bind_group, &[]);
                pass.dispatch_workgroups(x, y, z);
            }
            ComputeStage::BuildHierarchy => {
                for (i, bg) in self.mip_bind_groups.iter().enumerate() {
                    let dst_edge = self.layout.edge() >> (i + 1);
                    let [x, y, z] = VolumeLayout::block_dispatch(dst_edge);
                    pass.set_bind_group(1, bg, &[]);
                    pass.dispatch_workgroups(x, y, z);
                }
            }
        }
    }

    fn sampling_bind_group_layout(&self) -> &wgpu::BindGroupLayout { &self.sampling_layout }
    fn sampling_bind_group(&self) -> &wgpu::BindGroup { &self.sampling_bind_group }

    fn volume_texture(&self) -> Option<&wgpu::Texture> { Some(&self.texture) }
}

/// Allocate the storage selected by `kind`.
pub fn create_storage(device: &wgpu::Device, kind: StorageKind, layout: VolumeLayout) -> Box<dyn VolumeStorage> {
    match kind {
        StorageKind::Buffer => Box::new(BufferStorage::new(device, layout)),
        StorageKind::Texture3d => Box::new(TextureStorage::new(device, layout)),
    }
}
