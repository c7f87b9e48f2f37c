//! Voxel GI configuration: grid size, capture density, voxel size, storage and capture modes.

use std::fmt;

pub const MIN_VOXEL_SIZE: f32 = 0.01;
pub const MAX_VOXEL_SIZE: f32 = 1.0;

/// Edge length of the voxel grid in voxels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VolumeSize {
    V8,
    V16,
    V32,
    #[default]
    V64,
    V128,
}

impl VolumeSize {
    pub const ALL: [VolumeSize; 5] = [VolumeSize::V8, VolumeSize::V16, VolumeSize::V32, VolumeSize::V64, VolumeSize::V128];

    pub fn edge(self) -> u32 {
        match self {
            VolumeSize::V8 => 8,
            VolumeSize::V16 => 16,
            VolumeSize::V32 => 32,
            VolumeSize::V64 => 64,
            VolumeSize::V128 => 128,
        }
    }
}

impl TryFrom<u32> for VolumeSize {
    type Error = ConfigError;

    fn try_from(edge: u32) -> Result<Self, Self::Error> {
        VolumeSize::ALL
            .into_iter()
            .find(|s| s.edge() == edge)
            .ok_or(ConfigError::VolumeSize(edge))
    }
}

/// Capture target texels per voxel along each axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputDensity {
    #[default]
    X1,
    X10,
    X20,
    X40,
}

impl OutputDensity {
    pub const ALL: [OutputDensity; 4] = [OutputDensity::X1, OutputDensity::X10, OutputDensity::X20, OutputDensity::X40];

    pub fn factor(self) -> u32 {
        match self {
            OutputDensity::X1 => 1,
            OutputDensity::X10 => 10,
            OutputDensity::X20 => 20,
            OutputDensity::X40 => 40,
        }
    }
}

impl TryFrom<u32> for OutputDensity {
    type Error = ConfigError;

    fn try_from(factor: u32) -> Result<Self, Self::Error> {
        OutputDensity::ALL
            .into_iter()
            .find(|d| d.factor() == factor)
            .ok_or(ConfigError::OutputDensity(factor))
    }
}

/// How resolved voxels and the coarse hierarchy are stored on the GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Resolved colour buffer plus one-level octree buffer and index buffer.
    #[default]
    Buffer,
    /// Rgba16Float 3D texture with a full mip chain.
    Texture3d,
}

impl std::str::FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buffer" => Ok(StorageKind::Buffer),
            "texture3d" | "texture" => Ok(StorageKind::Texture3d),
            _ => Err(ConfigError::Storage(s.to_string())),
        }
    }
}

/// When the capture viewpoint re-voxelizes the scene.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Follow the tracked camera and voxelize every frame.
    #[default]
    EveryFrame,
    /// Voxelize only after an explicit capture request.
    OnDemand,
}

/// Fullscreen GI shading parameters.
#[derive(Clone, Copy, Debug)]
pub struct GiSettings {
    pub enabled: bool,
    /// Scale applied to the gathered indirect light before compositing.
    pub intensity: f32,
    /// Maximum cone trace distance, in voxels.
    pub max_distance_voxels: f32,
}

impl Default for GiSettings {
    fn default() -> Self {
        Self { enabled: true, intensity: 1.0, max_distance_voxels: 24.0 }
    }
}

/// Voxel GI renderer configuration. Validated by `VolumeResources::setup`.
#[derive(Clone, Debug)]
pub struct VoxelGiConfig {
    pub volume_size: VolumeSize,
    pub output_density: OutputDensity,
    /// World size of one voxel; clamped to [MIN_VOXEL_SIZE, MAX_VOXEL_SIZE].
    pub voxel_size: f32,
    pub storage: StorageKind,
    pub capture_mode: CaptureMode,
    /// Offset added to the tracked camera position before snapping.
    pub camera_offset: [f32; 3],
    pub gi: GiSettings,
}

impl Default for VoxelGiConfig {
    fn default() -> Self {
        Self {
            volume_size: VolumeSize::default(),
            output_density: OutputDensity::default(),
            voxel_size: 1.0,
            storage: StorageKind::default(),
            capture_mode: CaptureMode::default(),
            camera_offset: [0.0, 0.0, 0.0],
            gi: GiSettings::default(),
        }
    }
}

impl VoxelGiConfig {
    /// Copy with voxel size clamped into the supported range. Logs when clamping happens.
    pub fn validated(&self) -> Self {
        let mut out = self.clone();
        let clamped = if self.voxel_size.is_finite() {
            self.voxel_size.clamp(MIN_VOXEL_SIZE, MAX_VOXEL_SIZE)
        } else {
            MAX_VOXEL_SIZE
        };
        if clamped != self.voxel_size {
            log::warn!(
                "voxel_size {} outside [{}, {}], using {}",
                self.voxel_size,
                MIN_VOXEL_SIZE,
                MAX_VOXEL_SIZE,
                clamped
            );
        }
        out.voxel_size = clamped;
        out
    }

    /// World-space extent of the grid along one axis.
    pub fn extent(&self) -> f32 {
        self.volume_size.edge() as f32 * self.voxel_size
    }

    /// Override fields from `VOXELGI_*` environment variables. Invalid values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VOXELGI_VOLUME_SIZE") {
            match v.trim().parse::<u32>().map_err(|_| ConfigError::VolumeSize(0)).and_then(VolumeSize::try_from) {
                Ok(size) => self.volume_size = size,
                Err(e) => log::warn!("VOXELGI_VOLUME_SIZE={}: {}", v, e),
            }
        }
        if let Some(v) = lookup("VOXELGI_DENSITY") {
            match v.trim().parse::<u32>().map_err(|_| ConfigError::OutputDensity(0)).and_then(OutputDensity::try_from) {
                Ok(density) => self.output_density = density,
                Err(e) => log::warn!("VOXELGI_DENSITY={}: {}", v, e),
            }
        }
        if let Some(v) = lookup("VOXELGI_VOXEL_SIZE") {
            match v.trim().parse::<f32>() {
                Ok(size) => self.voxel_size = size,
                Err(e) => log::warn!("VOXELGI_VOXEL_SIZE={}: {}", v, e),
            }
        }
        if let Some(v) = lookup("VOXELGI_STORAGE") {
            match v.trim().parse::<StorageKind>() {
                Ok(kind) => self.storage = kind,
                Err(e) => log::warn!("VOXELGI_STORAGE={}: {}", v, e),
            }
        }
    }
}

/// Invalid enumerated configuration value.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    VolumeSize(u32),
    OutputDensity(u32),
    Storage(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::VolumeSize(v) => write!(f, "unsupported volume size {} (expected 8, 16, 32, 64 or 128)", v),
            ConfigError::OutputDensity(v) => write!(f, "unsupported output density {} (expected 1, 10, 20 or 40)", v),
            ConfigError::Storage(s) => write!(f, "unknown storage kind '{}' (expected buffer or texture3d)", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for String {
    fn from(e: ConfigError) -> Self {
        e.to_string()
    }
}
