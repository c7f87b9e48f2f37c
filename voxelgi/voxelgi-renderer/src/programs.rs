//! GPU programs the passes dispatch. Every program is optional: a stage whose program is
//! `None` is skipped for the frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::StorageKind;
use crate::encoding::wgsl_prelude;

const VOLUME_COMMON: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/volume_common.wgsl"));
const CLEAR_BUFFER: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/clear_buffer.wgsl"));
const CLEAR_TEXTURE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/clear_texture.wgsl"));
const VOXELIZE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/voxelize.wgsl"));
const RESOLVE_BUFFER: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/resolve_buffer.wgsl"));
const RESOLVE_TEXTURE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/resolve_texture.wgsl"));
const BUILD_OCTREE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/build_octree.wgsl"));
const DOWNSAMPLE_MIP: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/downsample_mip.wgsl"));
const GI_COMMON: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/gi_common.wgsl"));
const GI_BUFFER: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/gi_buffer.wgsl"));
const GI_TEXTURE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/gi_texture.wgsl"));

/// Process-unique program identity. Material caches compare against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(u64);

impl ProgramId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ProgramId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A compiled shader module plus the entry point the pass should use.
#[derive(Clone, Debug)]
pub struct ShaderProgram {
    id: ProgramId,
    label: String,
    module: Arc<wgpu::ShaderModule>,
    entry_point: String,
    vertex_entry: String,
}

impl ShaderProgram {
    pub fn new(label: impl Into<String>, module: Arc<wgpu::ShaderModule>, entry_point: impl Into<String>) -> Self {
        Self {
            id: ProgramId::next(),
            label: label.into(),
            module,
            entry_point: entry_point.into(),
            vertex_entry: "vs".to_string(),
        }
    }

    /// Compile `source` (WGSL) into a new program.
    pub fn from_wgsl(device: &wgpu::Device, label: &str, source: &str, entry_point: &str) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        Self::new(label, Arc::new(module), entry_point)
    }

    /// Vertex entry for raster programs (default `vs`).
    pub fn with_vertex_entry(mut self, entry: impl Into<String>) -> Self {
        self.vertex_entry = entry.into();
        self
    }

    pub fn id(&self) -> ProgramId { self.id }
    pub fn label(&self) -> &str { &self.label }
    pub fn module(&self) -> &wgpu::ShaderModule { &self.module }
    /// Compute entry for compute programs, fragment entry for raster programs.
    pub fn entry_point(&self) -> &str { &self.entry_point }
    pub fn vertex_entry(&self) -> &str { &self.vertex_entry }
}

/// Concatenate the encoding prelude with program sources.
pub fn compose_source(parts: &[&str]) -> String {
    let mut src = wgsl_prelude();
    for part in parts {
        src.push('\n');
        src.push_str(part);
    }
    src
}

/// Programs of the four voxelization stages.
#[derive(Clone, Debug, Default)]
pub struct VoxelizationPrograms {
    pub clear: Option<ShaderProgram>,
    pub voxelize: Option<ShaderProgram>,
    pub resolve: Option<ShaderProgram>,
    pub build_hierarchy: Option<ShaderProgram>,
}

impl VoxelizationPrograms {
    /// Bundled kernels for `kind`.
    pub fn builtin(device: &wgpu::Device, kind: StorageKind) -> Self {
        let (clear, resolve, hierarchy) = match kind {
            StorageKind::Buffer => (CLEAR_BUFFER, RESOLVE_BUFFER, BUILD_OCTREE),
            StorageKind::Texture3d => (CLEAR_TEXTURE, RESOLVE_TEXTURE, DOWNSAMPLE_MIP),
        };
        let program = |label: &str, body: &str, entry: &str| {
            Some(ShaderProgram::from_wgsl(device, label, &compose_source(&[VOLUME_COMMON, body]), entry))
        };
        Self {
            clear: program("voxelgi_clear", clear, "clear"),
            voxelize: program("voxelgi_voxelize", VOXELIZE, "fs"),
            resolve: program("voxelgi_resolve", resolve, "resolve"),
            build_hierarchy: program("voxelgi_build_hierarchy", hierarchy, "build_hierarchy"),
        }
    }
}

/// Program of the fullscreen GI pass.
#[derive(Clone, Debug, Default)]
pub struct GiPrograms {
    pub shade: Option<ShaderProgram>,
}

impl GiPrograms {
    pub fn builtin(device: &wgpu::Device, kind: StorageKind) -> Self {
        let sampling = match kind {
            StorageKind::Buffer => GI_BUFFER,
            StorageKind::Texture3d => GI_TEXTURE,
        };
        let source = compose_source(&[sampling, GI_COMMON]);
        Self { shade: Some(ShaderProgram::from_wgsl(device, "voxelgi_gi_shade", &source, "fs")) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_ids_are_unique() {
        let a = ProgramId::next();
        let b = ProgramId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn composed_source_starts_with_prelude() {
        let src = compose_source(&[VOLUME_COMMON, CLEAR_BUFFER]);
        assert!(src.starts_with(&wgsl_prelude()));
        assert!(src.contains("fn clear("));
        assert!(src.contains("struct VolumeGlobals"));
    }

    #[test]
    fn bundled_sources_define_their_entry_points() {
        for (src, entry) in [
            (CLEAR_BUFFER, "fn clear("),
            (CLEAR_TEXTURE, "fn clear("),
            (VOXELIZE, "fn fs("),
            (VOXELIZE, "fn vs("),
            (RESOLVE_BUFFER, "fn resolve("),
            (RESOLVE_TEXTURE, "fn resolve("),
            (BUILD_OCTREE, "fn build_hierarchy("),
            (DOWNSAMPLE_MIP, "fn build_hierarchy("),
            (GI_COMMON, "fn fs("),
            (GI_BUFFER, "fn sample_volume("),
            (GI_TEXTURE, "fn sample_volume("),
        ] {
            assert!(src.contains(entry), "missing {}", entry);
        }
    }

    #[test]
    fn default_programs_are_absent() {
        let p = VoxelizationPrograms::default();
        assert!(p.clear.is_none() && p.voxelize.is_none() && p.resolve.is_none() && p.build_hierarchy.is_none());
        assert!(GiPrograms::default().shade.is_none());
    }
}
