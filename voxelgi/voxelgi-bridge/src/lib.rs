//! Voxel GI bridge: implements render_api::RenderBackend using voxelgi-renderer.

mod plugin;

pub use plugin::{SharedRegistry, VolumeSnapshot, VoxelGiPlugin};
