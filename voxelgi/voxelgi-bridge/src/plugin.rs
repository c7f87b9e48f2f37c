//! Voxel GI plugin: implements RenderBackend for the host and publishes the live volume
//! through a per-session registry.

use std::sync::{Arc, Mutex, MutexGuard};

use render_api::{ExtractedView, RenderBackend, SceneGraph};
use voxelgi_renderer::{
    Capabilities, InstanceRegistry, InstanceToken, SessionId, ViewTargets, VoxelGiConfig, VoxelGiRenderer,
};

/// Where the live volume sits, as seen by other systems of the same session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeSnapshot {
    pub center: [f32; 3],
    pub voxel_size: f32,
    pub edge: u32,
    pub generation: u64,
}

pub type SharedRegistry = Arc<Mutex<InstanceRegistry<VolumeSnapshot>>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, InstanceRegistry<VolumeSnapshot>> {
    match registry.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Voxel GI plugin: owns the wgpu device/queue and renderer; implements RenderBackend.
pub struct VoxelGiPlugin {
    renderer: VoxelGiRenderer,
    session: SessionId,
    registry: SharedRegistry,
    token: Option<InstanceToken>,
    enabled: bool,
}

impl VoxelGiPlugin {
    /// Create with an existing device. A capability failure disables the feature for the
    /// session instead of failing construction.
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        caps: Capabilities,
        config: VoxelGiConfig,
        session: SessionId,
        registry: SharedRegistry,
    ) -> Self {
        let mut renderer = VoxelGiRenderer::new(device, queue, caps, config);
        let enabled = match renderer.setup() {
            Ok(()) => true,
            Err(e) => {
                log::error!("voxel GI disabled for session {}: {}", session.raw(), e);
                false
            }
        };
        let mut plugin = Self { renderer, session, registry, token: None, enabled };
        if enabled {
            let snapshot = plugin.snapshot();
            plugin.token = Some(lock(&plugin.registry).register(session, snapshot));
        }
        plugin
    }

    /// Request the default adapter and device, then `new`.
    pub fn headless(config: VoxelGiConfig, session: SessionId, registry: SharedRegistry) -> Result<Self, String> {
        let (device, queue, caps) = pollster::block_on(request_device())?;
        Ok(Self::new(device, queue, caps, config, session, registry))
    }

    pub fn is_enabled(&self) -> bool { self.enabled }
    pub fn session(&self) -> SessionId { self.session }
    pub fn device(&self) -> &wgpu::Device { self.renderer.device() }
    pub fn queue(&self) -> &wgpu::Queue { self.renderer.queue() }
    pub fn renderer(&self) -> &VoxelGiRenderer { &self.renderer }
    pub fn renderer_mut(&mut self) -> &mut VoxelGiRenderer { &mut self.renderer }

    /// Apply a new config. On failure the feature is disabled and the volume unregistered.
    pub fn reconfigure(&mut self, config: VoxelGiConfig) -> Result<(), String> {
        match self.renderer.reconfigure(config) {
            Ok(()) => {
                self.enabled = true;
                self.publish();
                Ok(())
            }
            Err(e) => {
                log::error!("voxel GI disabled for session {}: {}", self.session.raw(), e);
                self.enabled = false;
                self.unregister();
                Err(e.into())
            }
        }
    }

    /// Render one frame with host view targets so the GI pass can composite onto `targets.color`.
    pub fn render_frame_to_view(&mut self, view: &ExtractedView, targets: ViewTargets<'_>) -> Result<(), String> {
        self.render_frame_impl(view, Some(targets))
    }

    fn render_frame_impl(&mut self, view: &ExtractedView, targets: Option<ViewTargets<'_>>) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        let cmd = self.renderer.render_frame(view, targets)?;
        self.renderer.submit([cmd]);
        self.publish();
        Ok(())
    }

    fn snapshot(&self) -> VolumeSnapshot {
        let volume = self.renderer.volume();
        VolumeSnapshot {
            center: self.renderer.capture().placement().map_or([0.0; 3], |p| p.center.to_array()),
            voxel_size: volume.voxel_size().unwrap_or(0.0),
            edge: volume.edge().unwrap_or(0),
            generation: volume.generation(),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        let mut registry = lock(&self.registry);
        match self.token {
            Some(token) if registry.update(self.session, token, snapshot) => {}
            Some(_) => log::debug!("volume of session {} is no longer the active instance", self.session.raw()),
            None => self.token = Some(registry.register(self.session, snapshot)),
        }
    }

    fn unregister(&mut self) {
        if let Some(token) = self.token.take() {
            lock(&self.registry).unregister(self.session, token);
        }
    }
}

impl RenderBackend for VoxelGiPlugin {
    fn collect_from_scene(&mut self, scene: &SceneGraph) {
        let report = self.renderer.collect_from_scene(scene);
        log::info!(
            "collected {} draw entries from {} renderers ({} mismatched)",
            report.entries,
            report.renderers,
            report.mismatches
        );
    }

    fn clear_scene(&mut self) {
        self.renderer.draws_mut().clear_all();
    }

    fn render_frame(&mut self, view: &ExtractedView) -> Result<(), String> {
        self.render_frame_impl(view, None)
    }
}

impl Drop for VoxelGiPlugin {
    fn drop(&mut self) {
        self.unregister();
    }
}

async fn request_device() -> Result<(wgpu::Device, wgpu::Queue, Capabilities), String> {
    let instance = wgpu::Instance::default();
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions::default())
        .await
        .ok_or("No adapter")?;
    let desc = wgpu::DeviceDescriptor { required_limits: adapter.limits(), ..Default::default() };
    let (device, queue) = adapter.request_device(&desc, None).await.map_err(|e| e.to_string())?;
    let caps = Capabilities::from_device(&adapter, &device);
    Ok((device, queue, caps))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(config: VoxelGiConfig, session: SessionId, registry: &SharedRegistry) -> Option<VoxelGiPlugin> {
        match VoxelGiPlugin::headless(config, session, Arc::clone(registry)) {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("{}, skipping", e);
                None
            }
        }
    }

    #[test]
    fn plugin_publishes_and_unregisters_its_volume() {
        let registry: SharedRegistry = Arc::default();
        let session = SessionId::new();
        let Some(mut p) = plugin(VoxelGiConfig::default(), session, &registry) else { return };
        if !p.is_enabled() {
            assert!(lock(&registry).active(session).is_none());
            return;
        }
        let view = ExtractedView { camera_position: [2.4, 0.0, -1.6], ..Default::default() };
        p.render_frame(&view).expect("frame");
        let snap = lock(&registry).active(session).copied().expect("snapshot");
        assert_eq!(snap.edge, 64);
        assert_eq!(snap.center, [2.0, 0.0, -2.0]);
        drop(p);
        assert!(lock(&registry).active(session).is_none());
    }

    #[test]
    fn second_plugin_in_a_session_takes_over() {
        let registry: SharedRegistry = Arc::default();
        let session = SessionId::new();
        let Some(first) = plugin(VoxelGiConfig::default(), session, &registry) else { return };
        let Some(second) = plugin(VoxelGiConfig::default(), session, &registry) else { return };
        if !(first.is_enabled() && second.is_enabled()) {
            return;
        }
        drop(first);
        assert!(lock(&registry).active(session).is_some());
        drop(second);
        assert!(lock(&registry).active(session).is_none());
    }
}
