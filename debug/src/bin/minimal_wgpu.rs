//! Minimal wgpu init (no window). Verifies voxelgi-renderer can allocate a volume on this adapter.

use voxelgi_renderer::{Capabilities, VoxelGiConfig, VoxelGiRenderer};

fn main() -> Result<(), String> {
    env_logger::init();
    pollster::block_on(async {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or("No adapter")?;
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor { required_limits: adapter.limits(), ..Default::default() }, None)
            .await
            .map_err(|e| e.to_string())?;
        let caps = Capabilities::from_device(&adapter, &device);
        let mut config = VoxelGiConfig::default();
        config.apply_env_overrides();
        let mut renderer = VoxelGiRenderer::new(device, queue, caps, config);
        renderer.setup().map_err(|e| format!("{} on {} ({:?})", e, info.name, info.backend))?;
        println!(
            "voxelgi minimal_wgpu: OK ({} {:?}, {}^3 voxels, {:?} storage)",
            info.name,
            info.backend,
            renderer.volume().edge().unwrap_or(0),
            renderer.config().storage
        );
        Ok(())
    })
}
