//! Scene draw list: the (node, mesh, submesh, base colour, tint) tuples the voxelization pass draws.
//! Each entry owns the temporary material derived for it; removing or clearing entries releases it.

use std::sync::Arc;

use render_api::{MeshData, SceneGraph, SceneNode, TextureData};

use crate::assets::{GpuAssetCache, TextureKey};
use crate::programs::{ProgramId, ShaderProgram};

/// Tint uniform of the voxelize material group.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MaterialUniform {
    tint: [f32; 4],
}

/// Per-entry material for one voxelize program: tint uniform + base colour binding.
pub struct TemporaryMaterial {
    program: ProgramId,
    texture: Option<TextureKey>,
    _tint_buf: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl TemporaryMaterial {
    pub fn program(&self) -> ProgramId { self.program }
    /// Base colour texture the bind group references; `None` for the white fallback.
    pub fn texture(&self) -> Option<TextureKey> { self.texture }
    pub fn bind_group(&self) -> &wgpu::BindGroup { &self.bind_group }
}

fn build_material(
    program: &ShaderProgram,
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
    assets: &GpuAssetCache,
    tint: [f32; 4],
    texture_id: Option<u64>,
) -> TemporaryMaterial {
    let tint_buf = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("voxelgi_material_tint"),
        size: std::mem::size_of::<MaterialUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    queue.write_buffer(&tint_buf, 0, bytemuck::bytes_of(&MaterialUniform { tint }));
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("voxelgi_material_bg"),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: tint_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(assets.texture_view(texture_id)) },
            wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::Sampler(assets.sampler()) },
        ],
    });
    TemporaryMaterial { program: program.id(), texture: assets.texture_key(texture_id), _tint_buf: tint_buf, bind_group }
}

pub struct DrawEntry {
    pub node: Arc<SceneNode>,
    pub mesh: Arc<MeshData>,
    pub submesh: usize,
    pub base_color: Option<Arc<TextureData>>,
    tint: [f32; 4],
    material: Option<TemporaryMaterial>,
}

impl DrawEntry {
    pub fn new(node: Arc<SceneNode>, mesh: Arc<MeshData>, submesh: usize, base_color: Option<Arc<TextureData>>, tint: [f32; 4]) -> Self {
        Self { node, mesh, submesh, base_color, tint, material: None }
    }

    pub fn is_active(&self) -> bool {
        self.node.is_active()
    }

    pub fn model_matrix(&self) -> [f32; 16] {
        self.node.transform()
    }

    pub fn tint(&self) -> [f32; 4] { self.tint }

    /// Change the tint; the material is rebuilt on next use.
    pub fn set_tint(&mut self, tint: [f32; 4]) {
        self.tint = tint;
        self.material = None;
    }

    pub fn material(&self) -> Option<&TemporaryMaterial> { self.material.as_ref() }

    /// Material for `program`, created on first use and rebuilt when the program or the
    /// uploaded base colour texture changes.
    pub fn material_for(
        &mut self,
        program: &ShaderProgram,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
        assets: &GpuAssetCache,
    ) -> &TemporaryMaterial {
        let (tint, texture_id) = (self.tint, self.base_color.as_ref().map(|t| t.id));
        let texture = assets.texture_key(texture_id);
        if self.material.as_ref().is_some_and(|m| m.program != program.id() || m.texture != texture) {
            self.release_material();
        }
        let (node, submesh) = (self.node.id(), self.submesh);
        self.material.get_or_insert_with(|| {
            log::trace!("material for node {} submesh {} built for {:?}", node, submesh, program.id());
            build_material(program, device, queue, layout, assets, tint, texture_id)
        })
    }

    pub fn release_material(&mut self) {
        self.material = None;
    }
}

/// Result of `collect_from_scene`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub entries: usize,
    pub renderers: usize,
    /// Renderers whose submesh and material counts differ.
    pub mismatches: usize,
}

#[derive(Default)]
pub struct SceneDrawList {
    entries: Vec<DrawEntry>,
}

impl SceneDrawList {
    pub fn new() -> Self { Self::default() }

    pub fn count(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entry `index`, or `None` when out of range (including negative).
    pub fn entry_at(&self, index: isize) -> Option<&DrawEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn entry_at_mut(&mut self, index: isize) -> Option<&mut DrawEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get_mut(i))
    }

    pub fn push(&mut self, entry: DrawEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, index: usize) -> Option<DrawEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Drop every entry and its temporary material.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrawEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DrawEntry> {
        self.entries.iter_mut()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &DrawEntry> {
        self.entries.iter().filter(|e| e.is_active())
    }

    /// Rebuild the list from `scene`: one entry per submesh that has a material slot. Objects
    /// without a mesh are skipped; count mismatches are logged and collection continues.
    pub fn collect_from_scene(&mut self, scene: &SceneGraph) -> CollectReport {
        self.clear_all();
        let mut report = CollectReport::default();
        scene.walk(|obj| {
            let Some(renderer) = &obj.renderer else { return };
            let Some(mesh) = &renderer.mesh else { return };
            report.renderers += 1;
            if mesh.submesh_count() != renderer.materials.len() {
                report.mismatches += 1;
                log::warn!(
                    "'{}' has {} submeshes and {} materials",
                    obj.node.name(),
                    mesh.submesh_count(),
                    renderer.materials.len()
                );
            }
            for i in 0..mesh.submesh_count() {
                let Some(Some(material)) = renderer.materials.get(i) else { continue };
                self.entries.push(DrawEntry::new(
                    Arc::clone(&obj.node),
                    Arc::clone(mesh),
                    i,
                    material.base_color.clone(),
                    material.tint,
                ));
            }
        });
        report.entries = self.entries.len();
        log::info!("collected {} draw entries from {} renderers", report.entries, report.renderers);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_api::{MaterialData, MeshRenderer, SceneObject, SubMesh, IDENTITY};

    fn mesh(id: u64, submeshes: usize) -> Arc<MeshData> {
        let subs = (0..submeshes as u32).map(|i| SubMesh { index_start: i * 3, index_count: 3 }).collect();
        Arc::new(MeshData::new(id, "m", vec![0; 32 * 3], vec![0; 4 * 3 * submeshes], subs))
    }

    fn object(id: u64, mesh: Option<Arc<MeshData>>, materials: Vec<Option<MaterialData>>) -> SceneObject {
        SceneObject::new(SceneNode::new(id, format!("obj{}", id), IDENTITY)).with_renderer(MeshRenderer { mesh, materials })
    }

    #[test]
    fn entry_at_out_of_range_is_none() {
        let mut list = SceneDrawList::new();
        assert!(list.entry_at(0).is_none());
        list.push(DrawEntry::new(SceneNode::new(1, "n", IDENTITY), mesh(1, 1), 0, None, [1.0; 4]));
        assert!(list.entry_at(0).is_some());
        assert!(list.entry_at(-1).is_none());
        assert!(list.entry_at(1).is_none());
        assert!(list.entry_at(isize::MIN).is_none());
        assert!(list.entry_at_mut(5).is_none());
    }

    #[test]
    fn collect_emits_one_entry_per_material_slot() {
        let mut scene = SceneGraph::new();
        let red = MaterialData { base_color: None, tint: [1.0, 0.0, 0.0, 1.0] };
        scene.roots.push(
            object(1, Some(mesh(10, 2)), vec![Some(red.clone()), Some(MaterialData::default())])
                .with_child(object(2, Some(mesh(11, 3)), vec![Some(red.clone())]))
                .with_child(object(3, None, vec![Some(red.clone())])),
        );
        scene.roots.push(SceneObject::new(SceneNode::new(4, "empty", IDENTITY)));
        scene.roots.push(object(5, Some(mesh(12, 2)), vec![None, Some(red)]));

        let mut list = SceneDrawList::new();
        let report = list.collect_from_scene(&scene);
        assert_eq!(report, CollectReport { entries: 4, renderers: 3, mismatches: 1 });
        assert_eq!(list.count(), 4);
        let tags: Vec<(u64, usize)> = list.iter().map(|e| (e.node.id(), e.submesh)).collect();
        assert_eq!(tags, vec![(1, 0), (1, 1), (2, 0), (5, 1)]);
        assert_eq!(list.entry_at(0).map(|e| e.tint()), Some([1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn collect_then_clear_is_empty() {
        let mut scene = SceneGraph::new();
        scene.roots.push(object(1, Some(mesh(1, 1)), vec![Some(MaterialData::default())]));
        let mut list = SceneDrawList::new();
        list.collect_from_scene(&scene);
        assert_eq!(list.count(), 1);
        list.clear_all();
        assert_eq!(list.count(), 0);
        assert!(list.entry_at(0).is_none());
    }

    #[test]
    fn collect_replaces_previous_entries() {
        let mut scene = SceneGraph::new();
        scene.roots.push(object(1, Some(mesh(1, 1)), vec![Some(MaterialData::default())]));
        let mut list = SceneDrawList::new();
        list.push(DrawEntry::new(SceneNode::new(9, "stale", IDENTITY), mesh(9, 1), 0, None, [1.0; 4]));
        list.collect_from_scene(&scene);
        assert_eq!(list.count(), 1);
        assert_eq!(list.entry_at(0).map(|e| e.node.id()), Some(1));
    }

    #[test]
    fn iter_active_follows_node_flag() {
        let node = SceneNode::new(1, "n", IDENTITY);
        let mut list = SceneDrawList::new();
        list.push(DrawEntry::new(Arc::clone(&node), mesh(1, 1), 0, None, [1.0; 4]));
        list.push(DrawEntry::new(SceneNode::new(2, "m", IDENTITY), mesh(2, 1), 0, None, [1.0; 4]));
        assert_eq!(list.iter_active().count(), 2);
        node.set_active(false);
        assert_eq!(list.iter_active().count(), 1);
        assert_eq!(list.count(), 2);
    }

    #[test]
    fn remove_returns_entry() {
        let mut list = SceneDrawList::new();
        list.push(DrawEntry::new(SceneNode::new(1, "n", IDENTITY), mesh(1, 1), 0, None, [1.0; 4]));
        assert!(list.remove(3).is_none());
        assert_eq!(list.remove(0).map(|e| e.node.id()), Some(1));
        assert!(list.is_empty());
    }
}
