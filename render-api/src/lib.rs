//! Shared host API for the voxel GI renderer.
//! Defines the scene extraction types and the RenderBackend trait so a host can hand its scene
//! graph and per-frame view to the renderer without depending on any GPU types.

mod extract;
mod backend;

pub use extract::{
    ExtractedView, MaterialData, MeshData, MeshRenderer, SceneGraph, SceneNode, SceneObject, SubMesh,
    TextureData, IDENTITY, VERTEX_STRIDE,
};
pub use backend::RenderBackend;
