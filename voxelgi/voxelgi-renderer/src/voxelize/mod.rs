//! Voxelization pass: clear -> voxelize -> resolve -> build hierarchy, once per frame.
//!
//! Each stage is recorded in its own wgpu pass, so every stage sees the completed writes of
//! the previous one. A stage whose program is absent is skipped and the later stages still
//! run against whatever the buffers hold. Volume globals are written and bound once per frame.

use std::any::Any;

use render_api::VERTEX_STRIDE;

use crate::graph::{FrameContext, FramePass, PassEvent};
use crate::placement::{VolumePlacement, CAPTURE_FORMAT};
use crate::programs::{ProgramId, ShaderProgram, VoxelizationPrograms};
use crate::resources::{ComputeStage, VolumeLayout, VolumeResources, VolumeStorage};

/// Group 0 of every volume program.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumeGlobals {
    pub capture_view_proj: [f32; 16],
    pub volume_center: [f32; 3],
    pub voxel_size: f32,
    pub volume_min: [f32; 3],
    pub volume_size: u32,
    pub capture_position: [f32; 3],
    pub mip_count: u32,
    pub octree_size: u32,
    pub _pad: [u32; 3],
}

impl VolumeGlobals {
    pub fn new(placement: &VolumePlacement, layout: &VolumeLayout) -> Self {
        Self {
            capture_view_proj: placement.capture_view_proj().to_cols_array(),
            volume_center: placement.center.to_array(),
            voxel_size: placement.voxel_size,
            volume_min: placement.volume_min().to_array(),
            volume_size: layout.edge(),
            capture_position: placement.capture_position.to_array(),
            mip_count: layout.mip_count(),
            octree_size: layout.octree_edge(),
            _pad: [0; 3],
        }
    }
}

/// What the last `execute` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub cleared: bool,
    pub voxelized: bool,
    pub resolved: bool,
    pub hierarchy_built: bool,
    pub draws_issued: usize,
    pub inactive_skipped: usize,
    /// Active entries whose mesh or submesh was not available on the GPU.
    pub missing_geometry: usize,
}

/// Bytes of one model matrix.
const MODEL_BYTES: u64 = 64;

/// Distance between model slots: one matrix rounded up to the device's uniform offset alignment.
fn model_slot_stride(offset_alignment: u32) -> u64 {
    MODEL_BYTES.next_multiple_of(offset_alignment.max(1) as u64)
}

/// Slot count to allocate for `needed` draws when `current` slots exist.
fn grown_capacity(current: u64, needed: u64) -> u64 {
    if current > 0 && needed <= current {
        current
    } else {
        needed.next_power_of_two().max(16)
    }
}

/// Model matrices of one frame's draws, one aligned slot per draw, bound with a dynamic offset.
/// Reused across frames and only reallocated when a frame draws more entries than it holds.
struct ModelSlots {
    stride: u64,
    capacity: u64,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl ModelSlots {
    fn new(device: &wgpu::Device, layout: &wgpu::BindGroupLayout, stride: u64, capacity: u64) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxelgi_model_slots"),
            size: stride * capacity,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_model_bg"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: std::num::NonZeroU64::new(MODEL_BYTES),
                }),
            }],
        });
        Self { stride, capacity, buffer, bind_group }
    }

    fn offset(&self, slot: u64) -> u32 {
        (slot * self.stride) as u32
    }

    /// Write `matrices` into consecutive slots, growing the buffer first when needed.
    fn upload(slots: &mut Option<Self>, device: &wgpu::Device, queue: &wgpu::Queue, layout: &wgpu::BindGroupLayout, matrices: &[[f32; 16]]) {
        let stride = model_slot_stride(device.limits().min_uniform_buffer_offset_alignment);
        let current = slots.as_ref().map_or(0, |s| s.capacity);
        let capacity = grown_capacity(current, matrices.len() as u64);
        if capacity != current || slots.is_none() {
            log::debug!("model slots grown to {}", capacity);
            *slots = Some(Self::new(device, layout, stride, capacity));
        }
        let Some(slots) = slots.as_ref() else { return };
        if matrices.is_empty() {
            return;
        }
        let mut staging = vec![0u8; (slots.stride * matrices.len() as u64) as usize];
        for (i, m) in matrices.iter().enumerate() {
            let at = i * slots.stride as usize;
            staging[at..at + MODEL_BYTES as usize].copy_from_slice(bytemuck::cast_slice(m));
        }
        queue.write_buffer(&slots.buffer, 0, &staging);
    }
}

struct ComputeStagePipeline {
    program: ProgramId,
    pipeline: wgpu::ComputePipeline,
}

struct VoxelizePipeline {
    program: ProgramId,
    pipeline: wgpu::RenderPipeline,
}

/// Pipelines and bind groups built against one volume generation.
struct Pipelines {
    generation: u64,
    globals_bg: wgpu::BindGroup,
    clear: Option<ComputeStagePipeline>,
    voxelize: Option<VoxelizePipeline>,
    resolve: Option<ComputeStagePipeline>,
    build_hierarchy: Option<ComputeStagePipeline>,
}

impl Pipelines {
    fn matches(&self, generation: u64, programs: &VoxelizationPrograms) -> bool {
        fn same(built: Option<ProgramId>, wanted: &Option<ShaderProgram>) -> bool {
            built == wanted.as_ref().map(|p| p.id())
        }
        self.generation == generation
            && same(self.clear.as_ref().map(|p| p.program), &programs.clear)
            && same(self.voxelize.as_ref().map(|p| p.program), &programs.voxelize)
            && same(self.resolve.as_ref().map(|p| p.program), &programs.resolve)
            && same(self.build_hierarchy.as_ref().map(|p| p.program), &programs.build_hierarchy)
    }

    fn stage(&self, stage: ComputeStage) -> Option<&ComputeStagePipeline> {
        match stage {
            ComputeStage::Clear => self.clear.as_ref(),
            ComputeStage::Resolve => self.resolve.as_ref(),
            ComputeStage::BuildHierarchy => self.build_hierarchy.as_ref(),
        }
    }
}

pub struct VoxelizationPass {
    programs: VoxelizationPrograms,
    globals_layout: wgpu::BindGroupLayout,
    model_layout: wgpu::BindGroupLayout,
    material_layout: wgpu::BindGroupLayout,
    globals_buf: wgpu::Buffer,
    model_slots: Option<ModelSlots>,
    pipelines: Option<Pipelines>,
    last_report: FrameReport,
}

impl VoxelizationPass {
    pub fn new(device: &wgpu::Device, programs: VoxelizationPrograms) -> Self {
        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_globals_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: std::num::NonZeroU64::new(std::mem::size_of::<VolumeGlobals>() as u64),
                },
                count: None,
            }],
        });
        let model_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_model_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: std::num::NonZeroU64::new(MODEL_BYTES),
                },
                count: None,
            }],
        });
        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_material_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: std::num::NonZeroU64::new(16),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let globals_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxelgi_globals"),
            size: std::mem::size_of::<VolumeGlobals>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            programs,
            globals_layout,
            model_layout,
            material_layout,
            globals_buf,
            model_slots: None,
            pipelines: None,
            last_report: FrameReport::default(),
        }
    }

    pub fn programs(&self) -> &VoxelizationPrograms { &self.programs }

    /// Replace the stage programs. Pipelines are rebuilt on the next frame.
    pub fn set_programs(&mut self, programs: VoxelizationPrograms) {
        self.programs = programs;
        self.pipelines = None;
    }

    pub fn last_report(&self) -> &FrameReport { &self.last_report }

    pub fn material_layout(&self) -> &wgpu::BindGroupLayout { &self.material_layout }

    fn build_compute(&self, device: &wgpu::Device, storage: &dyn VolumeStorage, stage: ComputeStage, program: &ShaderProgram) -> ComputeStagePipeline {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(stage.label()),
            bind_group_layouts: &[&self.globals_layout, storage.stage_bind_group_layout(stage)],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(stage.label()),
            layout: Some(&layout),
            module: program.module(),
            entry_point: Some(program.entry_point()),
            compilation_options: Default::default(),
            cache: None,
        });
        ComputeStagePipeline { program: program.id(), pipeline }
    }

    fn build_voxelize(&self, device: &wgpu::Device, storage: &dyn VolumeStorage, program: &ShaderProgram) -> VoxelizePipeline {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("voxelgi_voxelize_layout"),
            bind_group_layouts: &[
                &self.globals_layout,
                storage.accumulation_bind_group_layout(),
                &self.model_layout,
                &self.material_layout,
            ],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("voxelgi_voxelize"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: program.module(),
                entry_point: Some(program.vertex_entry()),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[
                        wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                        wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x3 },
                        wgpu::VertexAttribute { offset: 24, shader_location: 2, format: wgpu::VertexFormat::Float32x2 },
                    ],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: program.module(),
                entry_point: Some(program.entry_point()),
                targets: &[Some(CAPTURE_FORMAT.into())],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState { cull_mode: None, ..Default::default() },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        VoxelizePipeline { program: program.id(), pipeline }
    }

    fn build_pipelines(&self, device: &wgpu::Device, volume: &VolumeResources) -> Option<Pipelines> {
        let storage = volume.storage()?;
        let globals_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_globals_bg"),
            layout: &self.globals_layout,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: self.globals_buf.as_entire_binding() }],
        });
        let p = &self.programs;
        Some(Pipelines {
            generation: volume.generation(),
            globals_bg,
            clear: p.clear.as_ref().map(|prog| self.build_compute(device, storage, ComputeStage::Clear, prog)),
            voxelize: p.voxelize.as_ref().map(|prog| self.build_voxelize(device, storage, prog)),
            resolve: p.resolve.as_ref().map(|prog| self.build_compute(device, storage, ComputeStage::Resolve, prog)),
            build_hierarchy: p
                .build_hierarchy
                .as_ref()
                .map(|prog| self.build_compute(device, storage, ComputeStage::BuildHierarchy, prog)),
        })
    }

    fn encode_compute(
        encoder: &mut wgpu::CommandEncoder,
        pipelines: &Pipelines,
        storage: &dyn VolumeStorage,
        stage: ComputeStage,
    ) -> bool {
        let Some(stage_pipeline) = pipelines.stage(stage) else {
            log::debug!("{} program absent, stage skipped", stage.label());
            return false;
        };
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(stage.label()),
            timestamp_writes: None,
        });
        pass.set_bind_group(0, &pipelines.globals_bg, &[]);
        storage.encode_stage(&mut pass, stage, &stage_pipeline.pipeline);
        true
    }
}

impl FramePass for VoxelizationPass {
    fn name(&self) -> &str { "voxelgi_voxelization" }

    fn event(&self) -> PassEvent { PassEvent::BeforeRenderingOpaques }

    fn setup(&mut self, device: &wgpu::Device, volume: &VolumeResources) -> Result<(), String> {
        self.pipelines = self.build_pipelines(device, volume);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), String> {
        let mut report = FrameReport::default();
        if !ctx.capture_this_frame {
            self.last_report = report;
            return Ok(());
        }
        let (Some(storage), Some(layout), Some(placement)) = (ctx.volume.storage(), ctx.volume.layout(), ctx.placement) else {
            log::debug!("voxel volume not ready, voxelization skipped");
            self.last_report = report;
            return Ok(());
        };
        let device = ctx.device;
        let queue = ctx.queue;
        let up_to_date = self.pipelines.as_ref().is_some_and(|p| p.matches(ctx.volume.generation(), &self.programs));
        if !up_to_date {
            self.pipelines = self.build_pipelines(device, ctx.volume);
        }
        let Some(pipelines) = self.pipelines.as_ref() else {
            self.last_report = report;
            return Ok(());
        };

        queue.write_buffer(&self.globals_buf, 0, bytemuck::bytes_of(&VolumeGlobals::new(placement, layout)));
        let encoder = &mut *ctx.encoder;

        report.cleared = Self::encode_compute(encoder, pipelines, storage, ComputeStage::Clear);

        match (&pipelines.voxelize, &self.programs.voxelize, ctx.capture) {
            (Some(voxelize), Some(program), Some(target)) => {
                // Resolve geometry first so every drawn entry gets a model slot before the pass opens.
                let mut drawable = Vec::with_capacity(ctx.draws.count());
                let mut matrices = Vec::with_capacity(ctx.draws.count());
                for (i, entry) in ctx.draws.iter().enumerate() {
                    if !entry.is_active() {
                        report.inactive_skipped += 1;
                        continue;
                    }
                    let sub = ctx.assets.mesh(entry.mesh.id).and_then(|m| m.submeshes.get(entry.submesh).copied());
                    let Some(sub) = sub else {
                        report.missing_geometry += 1;
                        continue;
                    };
                    drawable.push((i, sub));
                    matrices.push(entry.model_matrix());
                }
                ModelSlots::upload(&mut self.model_slots, device, queue, &self.model_layout, &matrices);

                let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("voxelgi_voxelize"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                rp.set_pipeline(&voxelize.pipeline);
                rp.set_bind_group(0, &pipelines.globals_bg, &[]);
                rp.set_bind_group(1, storage.accumulation_bind_group(), &[]);
                let Some(slots) = self.model_slots.as_ref() else {
                    return Err("model slots unavailable".to_string());
                };
                for (slot, (i, sub)) in drawable.into_iter().enumerate() {
                    let Some(entry) = ctx.draws.entry_at_mut(i as isize) else { continue };
                    let Some(mesh) = ctx.assets.mesh(entry.mesh.id) else { continue };
                    let material = entry.material_for(program, device, queue, &self.material_layout, ctx.assets);
                    rp.set_bind_group(2, &slots.bind_group, &[slots.offset(slot as u64)]);
                    rp.set_bind_group(3, material.bind_group(), &[]);
                    rp.set_vertex_buffer(0, mesh.vertex_buf.slice(..));
                    rp.set_index_buffer(mesh.index_buf.slice(..), wgpu::IndexFormat::Uint32);
                    rp.draw_indexed(sub.index_start..sub.index_start + sub.index_count, 0, 0..1);
                    report.draws_issued += 1;
                }
                report.voxelized = true;
            }
            (None, _, _) | (_, None, _) => log::debug!("voxelize program absent, stage skipped"),
            (_, _, None) => log::debug!("no capture target, voxelize stage skipped"),
        }

        report.resolved = Self::encode_compute(encoder, pipelines, storage, ComputeStage::Resolve);
        report.hierarchy_built = Self::encode_compute(encoder, pipelines, storage, ComputeStage::BuildHierarchy);
        self.last_report = report;
        Ok(())
    }

    fn dispose(&mut self) {
        self.pipelines = None;
        self.model_slots = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
