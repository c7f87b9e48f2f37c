//! Volume resources: GPU storage for one grid generation plus its scalar parameters.
//! `setup` always disposes the previous generation first; nothing is exposed before it succeeds.

pub mod layout;
pub mod storage;

use std::fmt;

use crate::config::{OutputDensity, StorageKind, VoxelGiConfig};
pub use layout::VolumeLayout;
pub use storage::{ComputeStage, OctreeNode, VolumeStorage, VOLUME_TEXTURE_FORMAT};

/// Device features the volume needs, captured from the adapter/device at init.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub limits: wgpu::Limits,
    pub downlevel: wgpu::DownlevelFlags,
}

impl Capabilities {
    pub fn from_device(adapter: &wgpu::Adapter, device: &wgpu::Device) -> Self {
        Self { limits: device.limits(), downlevel: adapter.get_downlevel_capabilities().flags }
    }

    /// Full WebGPU feature level with default limits.
    pub fn full() -> Self {
        Self { limits: wgpu::Limits::default(), downlevel: wgpu::DownlevelFlags::all() }
    }

    /// Check that a volume with `layout` and `kind` can be allocated and dispatched.
    pub fn check(&self, layout: &VolumeLayout, kind: StorageKind) -> Result<(), CapabilityError> {
        if !self.downlevel.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(CapabilityError::ComputeShaders);
        }
        if !self.downlevel.contains(wgpu::DownlevelFlags::FRAGMENT_WRITABLE_STORAGE)
            || self.limits.max_storage_buffers_per_shader_stage < 5
        {
            return Err(CapabilityError::FragmentStorage);
        }
        let edge = VolumeLayout::max_workgroup_edge();
        let invocations = edge.pow(3);
        let limits = &self.limits;
        if invocations > limits.max_compute_invocations_per_workgroup
            || edge > limits.max_compute_workgroup_size_x
            || edge > limits.max_compute_workgroup_size_y
            || edge > limits.max_compute_workgroup_size_z
        {
            return Err(CapabilityError::WorkgroupTooLarge { edge, limit: limits.max_compute_invocations_per_workgroup });
        }
        let dispatch = layout.voxel_dispatch()[0];
        if dispatch > limits.max_compute_workgroups_per_dimension {
            return Err(CapabilityError::DispatchTooLarge { groups: dispatch, limit: limits.max_compute_workgroups_per_dimension });
        }
        let needed = layout.largest_buffer_bytes();
        let limit = (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size);
        if needed > limit {
            return Err(CapabilityError::BufferTooLarge { needed, limit });
        }
        if kind == StorageKind::Texture3d && layout.edge() > self.limits.max_texture_dimension_3d {
            return Err(CapabilityError::TextureTooLarge { edge: layout.edge(), limit: self.limits.max_texture_dimension_3d });
        }
        Ok(())
    }
}

/// Why `setup` refused to allocate. The volume stays not ready.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityError {
    ComputeShaders,
    FragmentStorage,
    /// A bundled kernel's `edge`^3 workgroup does not fit the device's compute limits.
    WorkgroupTooLarge { edge: u32, limit: u32 },
    DispatchTooLarge { groups: u32, limit: u32 },
    BufferTooLarge { needed: u64, limit: u64 },
    TextureTooLarge { edge: u32, limit: u32 },
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::ComputeShaders => write!(f, "device does not support compute shaders"),
            CapabilityError::FragmentStorage => write!(f, "device does not support writable storage buffers in fragment shaders"),
            CapabilityError::WorkgroupTooLarge { edge, limit } => write!(
                f,
                "compute workgroup {}x{}x{} exceeds device limit of {} invocations",
                edge, edge, edge, limit
            ),
            CapabilityError::DispatchTooLarge { groups, limit } => {
                write!(f, "volume dispatch needs {} workgroups per dimension, limit is {}", groups, limit)
            }
            CapabilityError::BufferTooLarge { needed, limit } => {
                write!(f, "volume buffer needs {} bytes, storage binding limit is {}", needed, limit)
            }
            CapabilityError::TextureTooLarge { edge, limit } => {
                write!(f, "volume texture edge {} exceeds max 3D texture dimension {}", edge, limit)
            }
        }
    }
}

impl std::error::Error for CapabilityError {}

impl From<CapabilityError> for String {
    fn from(e: CapabilityError) -> Self {
        e.to_string()
    }
}

/// Parameters of the live generation.
#[derive(Clone, Copy, Debug)]
struct VolumeParams {
    layout: VolumeLayout,
    voxel_size: f32,
    output_density: OutputDensity,
}

#[derive(Default)]
pub struct VolumeResources {
    params: Option<VolumeParams>,
    storage: Option<Box<dyn VolumeStorage>>,
    generation: u64,
    last_error: Option<CapabilityError>,
}

impl VolumeResources {
    pub fn new() -> Self { Self::default() }

    /// Release the current generation, validate `config`, and allocate a new one.
    /// On a capability failure the error is logged and returned, and the volume stays not ready.
    pub fn setup(&mut self, device: &wgpu::Device, caps: &Capabilities, config: &VoxelGiConfig) -> Result<(), CapabilityError> {
        self.dispose();
        let config = config.validated();
        let layout = VolumeLayout::new(config.volume_size.edge());
        if let Err(e) = caps.check(&layout, config.storage) {
            log::error!("voxel volume setup refused: {}", e);
            self.last_error = Some(e.clone());
            return Err(e);
        }
        self.storage = Some(storage::create_storage(device, config.storage, layout));
        self.params = Some(VolumeParams { layout, voxel_size: config.voxel_size, output_density: config.output_density });
        self.generation += 1;
        self.last_error = None;
        log::info!(
            "voxel volume ready: {}^3 voxels, voxel size {}, storage {:?}, generation {}",
            layout.edge(),
            config.voxel_size,
            config.storage,
            self.generation
        );
        Ok(())
    }

    /// Release all GPU storage. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.storage.take().is_some() {
            log::debug!("voxel volume generation {} released", self.generation);
        }
        self.params = None;
    }

    pub fn is_ready(&self) -> bool {
        self.storage.is_some()
    }

    /// Increments on every successful `setup`; 0 before the first.
    pub fn generation(&self) -> u64 { self.generation }

    /// Error from the most recent refused `setup`, cleared by a successful one.
    pub fn last_error(&self) -> Option<&CapabilityError> { self.last_error.as_ref() }

    pub fn layout(&self) -> Option<&VolumeLayout> { self.params.as_ref().map(|p| &p.layout) }
    pub fn edge(&self) -> Option<u32> { self.params.map(|p| p.layout.edge()) }
    pub fn voxel_size(&self) -> Option<f32> { self.params.map(|p| p.voxel_size) }
    pub fn output_density(&self) -> Option<OutputDensity> { self.params.map(|p| p.output_density) }
    pub fn total_count(&self) -> Option<u32> { self.params.map(|p| p.layout.total_count()) }
    pub fn octree_count(&self) -> Option<u32> { self.params.map(|p| p.layout.octree_count()) }
    /// World-space extent along one axis.
    pub fn extent(&self) -> Option<f32> { self.params.map(|p| p.layout.edge() as f32 * p.voxel_size) }

    pub fn storage(&self) -> Option<&dyn VolumeStorage> { self.storage.as_deref() }
    pub fn storage_kind(&self) -> Option<StorageKind> { self.storage.as_ref().map(|s| s.kind()) }

    pub fn accumulation_buffer(&self) -> Option<&wgpu::Buffer> { self.storage().map(|s| s.accumulation_buffer()) }
    pub fn count_buffer(&self) -> Option<&wgpu::Buffer> { self.storage().map(|s| s.count_buffer()) }
    pub fn resolved_buffer(&self) -> Option<&wgpu::Buffer> { self.storage().and_then(|s| s.resolved_buffer()) }
    pub fn octree_buffer(&self) -> Option<&wgpu::Buffer> { self.storage().and_then(|s| s.octree_buffer()) }
    pub fn octree_index_buffer(&self) -> Option<&wgpu::Buffer> { self.storage().and_then(|s| s.octree_index_buffer()) }
    pub fn volume_texture(&self) -> Option<&wgpu::Texture> { self.storage().and_then(|s| s.volume_texture()) }
}

impl Drop for VolumeResources {
    fn drop(&mut self) {
        self.dispose();
    }
}
