//! Data types for extraction from the host scene into the render world.
//! Host builds a SceneGraph once (or whenever the scene changes) and fills an ExtractedView each frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Column-major 4x4 identity.
pub const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
];

/// Interleaved vertex layout shared with the voxelize program: position (3) + normal (3) + uv (2).
pub const VERTEX_STRIDE: u64 = 32;

/// A contiguous range of the index buffer drawn with one material slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubMesh {
    pub index_start: u32,
    pub index_count: u32,
}

/// Mesh geometry in the `VERTEX_STRIDE` layout with u32 indices.
#[derive(Debug)]
pub struct MeshData {
    /// Host-defined id; the renderer uploads each id once.
    pub id: u64,
    pub name: String,
    pub vertex_data: Vec<u8>,
    pub index_data: Vec<u8>,
    pub submeshes: Vec<SubMesh>,
}

impl MeshData {
    pub fn new(id: u64, name: impl Into<String>, vertex_data: Vec<u8>, index_data: Vec<u8>, submeshes: Vec<SubMesh>) -> Self {
        Self { id, name: name.into(), vertex_data, index_data, submeshes }
    }

    /// Mesh with a single submesh spanning the whole index buffer.
    pub fn single(id: u64, name: impl Into<String>, vertex_data: Vec<u8>, index_data: Vec<u8>) -> Self {
        let index_count = (index_data.len() / 4) as u32;
        Self::new(id, name, vertex_data, index_data, vec![SubMesh { index_start: 0, index_count }])
    }

    pub fn submesh_count(&self) -> usize { self.submeshes.len() }
    pub fn vertex_count(&self) -> usize { self.vertex_data.len() / VERTEX_STRIDE as usize }
    pub fn index_count(&self) -> usize { self.index_data.len() / 4 }

    /// Position of vertex `i` (first three floats of the interleaved layout).
    pub fn position(&self, i: usize) -> Option<[f32; 3]> {
        let start = i * VERTEX_STRIDE as usize;
        let bytes = self.vertex_data.get(start..start + 12)?;
        let mut p = [0.0f32; 3];
        for (k, chunk) in bytes.chunks_exact(4).enumerate() {
            p[k] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(p)
    }

    /// UV of vertex `i` (last two floats of the interleaved layout).
    pub fn uv(&self, i: usize) -> Option<[f32; 2]> {
        let start = i * VERTEX_STRIDE as usize + 24;
        let bytes = self.vertex_data.get(start..start + 8)?;
        Some([
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        ])
    }

    pub fn index(&self, i: usize) -> Option<u32> {
        let bytes = self.index_data.get(i * 4..i * 4 + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// RGBA8 texture data (row-major, tightly packed).
#[derive(Debug)]
pub struct TextureData {
    pub id: u64,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl TextureData {
    /// Nearest texel lookup with wrapping, returned as linear 0..1 floats.
    pub fn texel(&self, uv: [f32; 2]) -> [f32; 4] {
        if self.width == 0 || self.height == 0 {
            return [1.0; 4];
        }
        let x = ((uv[0].rem_euclid(1.0)) * self.width as f32) as u32 % self.width;
        let y = ((uv[1].rem_euclid(1.0)) * self.height as f32) as u32 % self.height;
        let i = ((y * self.width + x) * 4) as usize;
        match self.data.get(i..i + 4) {
            Some(px) => [px[0] as f32 / 255.0, px[1] as f32 / 255.0, px[2] as f32 / 255.0, px[3] as f32 / 255.0],
            None => [1.0; 4],
        }
    }
}

/// Material inputs the voxelizer cares about: base colour texture and tint.
#[derive(Clone, Debug)]
pub struct MaterialData {
    pub base_color: Option<Arc<TextureData>>,
    pub tint: [f32; 4],
}

impl Default for MaterialData {
    fn default() -> Self {
        Self { base_color: None, tint: [1.0, 1.0, 1.0, 1.0] }
    }
}

/// Scene node: transform and active flag shared between the host and collected draws.
#[derive(Debug)]
pub struct SceneNode {
    id: u64,
    name: String,
    transform: RwLock<[f32; 16]>,
    active: AtomicBool,
}

impl SceneNode {
    pub fn new(id: u64, name: impl Into<String>, transform: [f32; 16]) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            transform: RwLock::new(transform),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 { self.id }
    pub fn name(&self) -> &str { &self.name }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Local-to-world matrix (column-major).
    pub fn transform(&self) -> [f32; 16] {
        match self.transform.read() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_transform(&self, transform: [f32; 16]) {
        match self.transform.write() {
            Ok(mut t) => *t = transform,
            Err(poisoned) => *poisoned.into_inner() = transform,
        }
    }
}

/// Renderer component: a mesh plus one material slot per submesh.
#[derive(Clone, Debug, Default)]
pub struct MeshRenderer {
    pub mesh: Option<Arc<MeshData>>,
    /// Slot i is used by submesh i. `None` slots are left unassigned.
    pub materials: Vec<Option<MaterialData>>,
}

/// One object in the scene graph.
#[derive(Debug)]
pub struct SceneObject {
    pub node: Arc<SceneNode>,
    pub renderer: Option<MeshRenderer>,
    pub children: Vec<SceneObject>,
}

impl SceneObject {
    pub fn new(node: Arc<SceneNode>) -> Self {
        Self { node, renderer: None, children: Vec::new() }
    }

    pub fn with_renderer(mut self, renderer: MeshRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_child(mut self, child: SceneObject) -> Self {
        self.children.push(child);
        self
    }
}

/// Active scene: a forest of root objects.
#[derive(Debug, Default)]
pub struct SceneGraph {
    pub roots: Vec<SceneObject>,
}

impl SceneGraph {
    pub fn new() -> Self { Self::default() }

    /// Depth-first visit of every object, parents before children.
    pub fn walk(&self, mut f: impl FnMut(&SceneObject)) {
        let mut stack: Vec<&SceneObject> = self.roots.iter().rev().collect();
        while let Some(obj) = stack.pop() {
            f(obj);
            stack.extend(obj.children.iter().rev());
        }
    }
}

/// View/camera data for the current frame.
#[derive(Clone, Debug)]
pub struct ExtractedView {
    pub view_proj: [f32; 16],
    /// World-space position of the main camera; the voxel volume follows it.
    pub camera_position: [f32; 3],
    pub viewport_size: (u32, u32),
}

impl Default for ExtractedView {
    fn default() -> Self {
        Self {
            view_proj: IDENTITY,
            camera_position: [0.0, 0.0, 0.0],
            viewport_size: (800, 600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_visits_parents_before_children() {
        let mut scene = SceneGraph::new();
        scene.roots.push(
            SceneObject::new(SceneNode::new(1, "root", IDENTITY))
                .with_child(SceneObject::new(SceneNode::new(2, "a", IDENTITY)))
                .with_child(SceneObject::new(SceneNode::new(3, "b", IDENTITY))),
        );
        scene.roots.push(SceneObject::new(SceneNode::new(4, "other", IDENTITY)));
        let mut ids = Vec::new();
        scene.walk(|o| ids.push(o.node.id()));
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn mesh_accessors_read_interleaved_layout() {
        let vertex: Vec<u8> = [1.0f32, 2.0, 3.0, 0.0, 1.0, 0.0, 0.25, 0.75]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let index: Vec<u8> = [0u32, 0, 0].iter().flat_map(|i| i.to_le_bytes()).collect();
        let mesh = MeshData::single(7, "tri", vertex, index);
        assert_eq!(mesh.vertex_count(), 1);
        assert_eq!(mesh.submesh_count(), 1);
        assert_eq!(mesh.submeshes[0].index_count, 3);
        assert_eq!(mesh.position(0), Some([1.0, 2.0, 3.0]));
        assert_eq!(mesh.uv(0), Some([0.25, 0.75]));
        assert_eq!(mesh.position(1), None);
    }

    #[test]
    fn node_active_flag_toggles() {
        let node = SceneNode::new(1, "n", IDENTITY);
        assert!(node.is_active());
        node.set_active(false);
        assert!(!node.is_active());
    }

    #[test]
    fn texel_wraps_uv() {
        let tex = TextureData { id: 1, data: vec![255, 0, 0, 255, 0, 255, 0, 255], width: 2, height: 1 };
        assert_eq!(tex.texel([0.1, 0.0]), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(tex.texel([0.6, 0.0]), [0.0, 1.0, 0.0, 1.0]);
        assert_eq!(tex.texel([1.1, 0.0]), [1.0, 0.0, 0.0, 1.0]);
    }
}
