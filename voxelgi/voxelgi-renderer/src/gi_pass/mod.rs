//! Fullscreen GI pass: cone-trace the resolved volume from each visible surface and add the
//! result onto the view colour target. Reads the volume, never writes it.

use std::any::Any;

use glam::Mat4;

use crate::config::GiSettings;
use crate::graph::{FrameContext, FramePass, PassEvent, PassInputs};
use crate::placement::VolumePlacement;
use crate::programs::{GiPrograms, ProgramId};
use crate::resources::{VolumeLayout, VolumeResources};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GiUniform {
    pub inv_view_proj: [f32; 16],
    pub camera_position: [f32; 3],
    pub intensity: f32,
    pub volume_center: [f32; 3],
    pub voxel_size: f32,
    pub volume_min: [f32; 3],
    pub volume_size: u32,
    pub mip_count: u32,
    pub octree_size: u32,
    pub max_distance: f32,
    pub _pad0: u32,
    pub viewport: [f32; 2],
    pub _pad1: [f32; 2],
}

impl GiUniform {
    pub fn new(
        view_proj: &[f32; 16],
        camera_position: [f32; 3],
        viewport: (u32, u32),
        placement: &VolumePlacement,
        layout: &VolumeLayout,
        settings: &GiSettings,
    ) -> Self {
        let vp = Mat4::from_cols_array(view_proj);
        let inv = if vp.determinant().abs() > 1e-10 { vp.inverse() } else { Mat4::IDENTITY };
        Self {
            inv_view_proj: inv.to_cols_array(),
            camera_position,
            intensity: settings.intensity,
            volume_center: placement.center.to_array(),
            voxel_size: placement.voxel_size,
            volume_min: placement.volume_min().to_array(),
            volume_size: layout.edge(),
            mip_count: layout.mip_count(),
            octree_size: layout.octree_edge(),
            max_distance: settings.max_distance_voxels,
            _pad0: 0,
            viewport: [viewport.0.max(1) as f32, viewport.1.max(1) as f32],
            _pad1: [0.0; 2],
        }
    }
}

struct GiPipeline {
    program: ProgramId,
    generation: u64,
    format: wgpu::TextureFormat,
    pipeline: wgpu::RenderPipeline,
    uniform_bg: wgpu::BindGroup,
}

pub struct GiPass {
    programs: GiPrograms,
    settings: GiSettings,
    uniform_layout: wgpu::BindGroupLayout,
    scene_layout: wgpu::BindGroupLayout,
    uniform_buf: wgpu::Buffer,
    pipeline: Option<GiPipeline>,
    drawn_last_frame: bool,
}

impl GiPass {
    pub fn new(device: &wgpu::Device, programs: GiPrograms, settings: GiSettings) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_gi_uniform_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: std::num::NonZeroU64::new(std::mem::size_of::<GiUniform>() as u64),
                },
                count: None,
            }],
        });
        let scene_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxelgi_gi_scene_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let uniform_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxelgi_gi_uniform"),
            size: std::mem::size_of::<GiUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            programs,
            settings,
            uniform_layout,
            scene_layout,
            uniform_buf,
            pipeline: None,
            drawn_last_frame: false,
        }
    }

    pub fn settings(&self) -> &GiSettings { &self.settings }

    pub fn set_settings(&mut self, settings: GiSettings) {
        self.settings = settings;
    }

    pub fn set_programs(&mut self, programs: GiPrograms) {
        self.programs = programs;
        self.pipeline = None;
    }

    /// Whether the last `execute` recorded a draw.
    pub fn drawn_last_frame(&self) -> bool { self.drawn_last_frame }

    fn build_pipeline(&self, device: &wgpu::Device, volume: &VolumeResources, format: wgpu::TextureFormat) -> Option<GiPipeline> {
        let program = self.programs.shade.as_ref()?;
        let storage = volume.storage()?;
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("voxelgi_gi_layout"),
            bind_group_layouts: &[&self.uniform_layout, storage.sampling_bind_group_layout(), &self.scene_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("voxelgi_gi"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: program.module(),
                entry_point: Some(program.vertex_entry()),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: program.module(),
                entry_point: Some(program.entry_point()),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState {
                        color: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::One,
                            dst_factor: wgpu::BlendFactor::One,
                            operation: wgpu::BlendOperation::Add,
                        },
                        alpha: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::Zero,
                            dst_factor: wgpu::BlendFactor::One,
                            operation: wgpu::BlendOperation::Add,
                        },
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let uniform_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_gi_uniform_bg"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: self.uniform_buf.as_entire_binding() }],
        });
        Some(GiPipeline { program: program.id(), generation: volume.generation(), format, pipeline, uniform_bg })
    }
}

impl FramePass for GiPass {
    fn name(&self) -> &str { "voxelgi_gi" }

    fn event(&self) -> PassEvent { PassEvent::BeforeRenderingPostProcessing }

    fn required_inputs(&self) -> PassInputs {
        PassInputs::DEPTH | PassInputs::NORMALS
    }

    fn setup(&mut self, _device: &wgpu::Device, _volume: &VolumeResources) -> Result<(), String> {
        // The pipeline depends on the view format, so it is built on first execute.
        self.pipeline = None;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), String> {
        self.drawn_last_frame = false;
        if !self.settings.enabled {
            return Ok(());
        }
        let Some(program_id) = self.programs.shade.as_ref().map(|p| p.id()) else {
            log::debug!("GI program absent, pass skipped");
            return Ok(());
        };
        let (Some(storage), Some(layout), Some(placement), Some(view)) =
            (ctx.volume.storage(), ctx.volume.layout(), ctx.placement, ctx.view.as_ref())
        else {
            return Ok(());
        };
        let (Some(depth), Some(normals)) = (view.depth, view.normals) else {
            return Ok(());
        };
        let generation = ctx.volume.generation();
        let stale = self
            .pipeline
            .as_ref()
            .map_or(true, |p| p.program != program_id || p.generation != generation || p.format != view.color_format);
        if stale {
            self.pipeline = self.build_pipeline(ctx.device, ctx.volume, view.color_format);
        }
        let Some(gi) = self.pipeline.as_ref() else {
            return Ok(());
        };

        let uniform = GiUniform::new(
            &ctx.camera.view_proj,
            ctx.camera.camera_position,
            view.size,
            placement,
            layout,
            &self.settings,
        );
        ctx.queue.write_buffer(&self.uniform_buf, 0, bytemuck::bytes_of(&uniform));
        let scene_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxelgi_gi_scene_bg"),
            layout: &self.scene_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(depth) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(normals) },
            ],
        });
        let mut rp = ctx.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("voxelgi_gi"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: view.color,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        rp.set_pipeline(&gi.pipeline);
        rp.set_bind_group(0, &gi.uniform_bg, &[]);
        rp.set_bind_group(1, storage.sampling_bind_group(), &[]);
        rp.set_bind_group(2, &scene_bg, &[]);
        rp.draw(0..3, 0..1);
        drop(rp);
        self.drawn_last_frame = true;
        Ok(())
    }

    fn dispose(&mut self) {
        self.pipeline = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn uniform_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<GiUniform>(), 144);
    }

    #[test]
    fn singular_view_proj_falls_back_to_identity() {
        let placement = VolumePlacement::follow(Vec3::ZERO, Vec3::ZERO, 16, 1.0);
        let u = GiUniform::new(&[0.0; 16], [0.0; 3], (0, 0), &placement, &VolumeLayout::new(16), &GiSettings::default());
        assert_eq!(u.inv_view_proj, Mat4::IDENTITY.to_cols_array());
        assert_eq!(u.viewport, [1.0, 1.0]);
    }

    #[test]
    fn uniform_inverts_view_proj() {
        let vp = Mat4::perspective_rh(1.0, 1.5, 0.1, 100.0) * Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        let placement = VolumePlacement::follow(Vec3::ZERO, Vec3::ZERO, 16, 1.0);
        let u = GiUniform::new(&vp.to_cols_array(), [0.0, 2.0, 5.0], (640, 480), &placement, &VolumeLayout::new(16), &GiSettings::default());
        let back = Mat4::from_cols_array(&u.inv_view_proj) * vp;
        assert!(back.abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert_eq!(u.max_distance, GiSettings::default().max_distance_voxels);
    }
}
