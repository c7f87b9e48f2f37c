//! Volume placement: snap the tracked viewpoint onto the voxel lattice and derive the
//! orthographic capture camera that spans the grid. Recomputed every frame; nothing persists
//! beyond the latest value.

use glam::{Mat4, Vec3};

use crate::config::CaptureMode;
use crate::resources::VolumeResources;

/// Colour format of the capture target. The voxelize program writes colour only.
///
/// The target has no depth attachment, so custom voxelize programs cannot rely on depth
/// testing: every covered fragment reaches the fragment stage and contributes.
pub const CAPTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Round each axis to the nearest multiple of `voxel_size`. Halves go to the even multiple.
pub fn snap_to_grid(p: Vec3, voxel_size: f32) -> Vec3 {
    let v = p / voxel_size;
    Vec3::new(v.x.round_ties_even(), v.y.round_ties_even(), v.z.round_ties_even()) * voxel_size
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumePlacement {
    /// Grid centre, lattice aligned.
    pub center: Vec3,
    /// Capture viewpoint: centre pulled back by half the extent along -Z.
    pub capture_position: Vec3,
    pub edge: u32,
    pub voxel_size: f32,
}

impl VolumePlacement {
    pub fn follow(tracked: Vec3, offset: Vec3, edge: u32, voxel_size: f32) -> Self {
        let center = snap_to_grid(tracked + offset, voxel_size);
        let half_extent = 0.5 * edge as f32 * voxel_size;
        Self {
            center,
            capture_position: center - Vec3::Z * half_extent,
            edge,
            voxel_size,
        }
    }

    pub fn extent(&self) -> f32 {
        self.edge as f32 * self.voxel_size
    }

    /// World-space corner of voxel (0, 0, 0).
    pub fn volume_min(&self) -> Vec3 {
        self.center - Vec3::splat(0.5 * self.extent())
    }

    pub fn contains(&self, p: Vec3) -> bool {
        let rel = p - self.volume_min();
        rel.cmpge(Vec3::ZERO).all() && rel.cmplt(Vec3::splat(self.extent())).all()
    }

    /// Voxel containing `p`, if inside the grid.
    pub fn voxel_of(&self, p: Vec3) -> Option<[u32; 3]> {
        if !self.contains(p) {
            return None;
        }
        let c = ((p - self.volume_min()) / self.voxel_size).floor();
        let max = (self.edge - 1) as f32;
        Some([c.x.min(max) as u32, c.y.min(max) as u32, c.z.min(max) as u32])
    }

    /// Identity rotation looking down +Z from the capture position.
    pub fn capture_view(&self) -> Mat4 {
        Mat4::from_translation(-self.capture_position)
    }

    /// Orthographic: near 0, far = extent, half-size = extent / 2. Depth maps to [0, 1].
    pub fn capture_projection(&self) -> Mat4 {
        let far = self.extent();
        let half = far * 0.5;
        Mat4::orthographic_lh(-half, half, -half, half, 0.0, far)
    }

    pub fn capture_view_proj(&self) -> Mat4 {
        self.capture_projection() * self.capture_view()
    }
}

/// Capture target side: `edge * density`, clamped to the 2D texture limit.
pub fn capture_target_size(edge: u32, density: u32, max_dimension: u32) -> u32 {
    let wanted = edge.saturating_mul(density);
    if wanted > max_dimension {
        log::warn!("capture target {}px exceeds max texture dimension {}, clamping", wanted, max_dimension);
        return max_dimension;
    }
    wanted
}

/// Colour-only render target the voxelize draw rasterises into (no depth buffer).
pub struct CaptureTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub size: u32,
}

/// Off-screen viewpoint driving voxelization. Owns the capture target and the capture trigger.
pub struct CaptureCamera {
    mode: CaptureMode,
    capture_requested: bool,
    target: Option<CaptureTarget>,
    placement: Option<VolumePlacement>,
}

impl CaptureCamera {
    pub fn new(mode: CaptureMode) -> Self {
        Self { mode, capture_requested: false, target: None, placement: None }
    }

    pub fn mode(&self) -> CaptureMode { self.mode }

    pub fn set_mode(&mut self, mode: CaptureMode) {
        self.mode = mode;
        self.capture_requested = false;
    }

    /// Reallocate the capture target for the current volume parameters. The previous target is
    /// released first. Returns the new side length, or `None` when the volume is not ready.
    pub fn update_settings(&mut self, device: &wgpu::Device, resources: &VolumeResources) -> Option<u32> {
        self.release();
        let edge = resources.edge()?;
        let density = resources.output_density()?.factor();
        let size = capture_target_size(edge, density, device.limits().max_texture_dimension_2d);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("voxelgi_capture_target"),
            size: wgpu::Extent3d { width: size, height: size, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: CAPTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&Default::default());
        self.target = Some(CaptureTarget { texture, view, size });
        log::info!("capture target {}x{} ({}x{} density)", size, size, edge, density);
        Some(size)
    }

    pub fn release(&mut self) {
        self.target = None;
        self.placement = None;
    }

    pub fn target(&self) -> Option<&CaptureTarget> { self.target.as_ref() }

    /// Recompute placement from the tracked viewpoint. `None` when the volume is not ready.
    pub fn follow(&mut self, tracked: Vec3, offset: Vec3, resources: &VolumeResources) -> Option<VolumePlacement> {
        let placement = VolumePlacement::follow(tracked, offset, resources.edge()?, resources.voxel_size()?);
        self.placement = Some(placement);
        Some(placement)
    }

    pub fn placement(&self) -> Option<&VolumePlacement> { self.placement.as_ref() }

    /// Ask for one voxelization in `OnDemand` mode.
    pub fn request_capture(&mut self) {
        self.capture_requested = true;
    }

    /// Whether this frame re-voxelizes. Consumes a pending request in `OnDemand` mode.
    pub fn take_capture_request(&mut self) -> bool {
        match self.mode {
            CaptureMode::EveryFrame => true,
            CaptureMode::OnDemand => std::mem::take(&mut self.capture_requested),
        }
    }
}
