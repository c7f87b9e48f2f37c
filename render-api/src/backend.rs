//! Trait for render backends. Host uses this to drive scene collection and per-frame rendering uniformly.

use crate::{ExtractedView, SceneGraph};

/// Render backend the host drives once per frame.
pub trait RenderBackend: Send {
    /// Rebuild the set of draws the backend voxelizes from the current scene.
    /// This is an author-triggered, one-shot operation, not part of the per-frame path.
    fn collect_from_scene(&mut self, scene: &SceneGraph);

    /// Drop every collected draw.
    fn clear_scene(&mut self);

    /// Render one frame. Submits work internally; caller does not need to submit command buffers.
    fn render_frame(&mut self, view: &ExtractedView) -> Result<(), String>;
}
