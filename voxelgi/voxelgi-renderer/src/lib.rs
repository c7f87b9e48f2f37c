//! Voxel GI renderer: wgpu voxelization volume, resolve/hierarchy compute chain and fullscreen GI pass.

pub mod assets;
pub mod config;
pub mod draw_list;
pub mod encoding;
pub mod gi_pass;
pub mod graph;
pub mod placement;
pub mod programs;
pub mod readback;
pub mod reference;
pub mod registry;
pub mod resources;
pub mod voxelize;

use glam::Vec3;
use render_api::{ExtractedView, SceneGraph};

pub use assets::{GpuAssetCache, TextureKey};
pub use config::{CaptureMode, GiSettings, OutputDensity, StorageKind, VolumeSize, VoxelGiConfig};
pub use draw_list::{CollectReport, DrawEntry, SceneDrawList};
pub use gi_pass::{GiPass, GiUniform};
pub use graph::{FrameContext, FramePass, PassEvent, PassId, PassInputs, PassSchedule, ScheduleReport, ViewTargets};
pub use placement::{CaptureCamera, CaptureTarget, VolumePlacement};
pub use programs::{GiPrograms, ShaderProgram, VoxelizationPrograms};
pub use registry::{InstanceRegistry, InstanceToken, SessionId};
pub use resources::{Capabilities, CapabilityError, OctreeNode, VolumeResources};
pub use voxelize::{FrameReport, VolumeGlobals, VoxelizationPass};

pub struct VoxelGiRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: Capabilities,
    config: VoxelGiConfig,
    volume: VolumeResources,
    capture: CaptureCamera,
    draws: SceneDrawList,
    assets: GpuAssetCache,
    schedule: PassSchedule,
    /// Storage kind the bundled programs were compiled for.
    programs_kind: Option<StorageKind>,
    last_schedule: ScheduleReport,
}

impl VoxelGiRenderer {
    /// Create the renderer and its passes. Nothing is allocated for the volume until `setup`.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, caps: Capabilities, config: VoxelGiConfig) -> Self {
        let assets = GpuAssetCache::new(&device, &queue);
        let mut schedule = PassSchedule::new();
        schedule.add_pass(Box::new(VoxelizationPass::new(&device, VoxelizationPrograms::default())));
        schedule.add_pass(Box::new(GiPass::new(&device, GiPrograms::default(), config.gi)));
        Self {
            device,
            queue,
            caps,
            capture: CaptureCamera::new(config.capture_mode),
            config,
            volume: VolumeResources::new(),
            draws: SceneDrawList::new(),
            assets,
            schedule,
            programs_kind: None,
            last_schedule: ScheduleReport::default(),
        }
    }

    pub fn device(&self) -> &wgpu::Device { &self.device }
    pub fn queue(&self) -> &wgpu::Queue { &self.queue }
    pub fn config(&self) -> &VoxelGiConfig { &self.config }
    pub fn volume(&self) -> &VolumeResources { &self.volume }
    pub fn capture(&self) -> &CaptureCamera { &self.capture }

    /// (Re)allocate the volume for the current config and rebuild pass pipelines.
    /// On failure the volume stays not ready and frames become no-ops.
    pub fn setup(&mut self) -> Result<(), CapabilityError> {
        self.capture.set_mode(self.config.capture_mode);
        if let Err(e) = self.volume.setup(&self.device, &self.caps, &self.config) {
            self.capture.release();
            self.schedule.dispose_all();
            return Err(e);
        }
        let kind = self.config.storage;
        if self.programs_kind != Some(kind) {
            if let Some(pass) = self.schedule.find_mut::<VoxelizationPass>() {
                pass.set_programs(VoxelizationPrograms::builtin(&self.device, kind));
            }
            if let Some(pass) = self.schedule.find_mut::<GiPass>() {
                pass.set_programs(GiPrograms::builtin(&self.device, kind));
            }
            self.programs_kind = Some(kind);
        }
        if let Some(pass) = self.schedule.find_mut::<GiPass>() {
            pass.set_settings(self.config.gi);
        }
        self.capture.update_settings(&self.device, &self.volume);
        if let Err(e) = self.schedule.setup_all(&self.device, &self.volume) {
            log::error!("voxel GI pass setup failed: {}", e);
        }
        Ok(())
    }

    /// Replace the config and run `setup` again.
    pub fn reconfigure(&mut self, config: VoxelGiConfig) -> Result<(), CapabilityError> {
        self.config = config;
        self.setup()
    }

    /// Release the volume, the capture target and every cached pipeline and material.
    pub fn dispose(&mut self) {
        self.schedule.dispose_all();
        self.capture.release();
        for entry in self.draws.iter_mut() {
            entry.release_material();
        }
        self.volume.dispose();
    }

    /// Install custom programs. Absent programs turn the matching stage into a no-op.
    pub fn set_voxelization_programs(&mut self, programs: VoxelizationPrograms) {
        if let Some(pass) = self.schedule.find_mut::<VoxelizationPass>() {
            pass.set_programs(programs);
        }
    }

    pub fn set_gi_programs(&mut self, programs: GiPrograms) {
        if let Some(pass) = self.schedule.find_mut::<GiPass>() {
            pass.set_programs(programs);
        }
    }

    pub fn set_gi_settings(&mut self, settings: GiSettings) {
        self.config.gi = settings;
        if let Some(pass) = self.schedule.find_mut::<GiPass>() {
            pass.set_settings(settings);
        }
    }

    pub fn set_capture_mode(&mut self, mode: CaptureMode) {
        self.config.capture_mode = mode;
        self.capture.set_mode(mode);
    }

    /// Re-center the volume on `tracked` plus the configured offset.
    pub fn follow(&mut self, tracked: Vec3) -> Option<VolumePlacement> {
        self.capture.follow(tracked, Vec3::from(self.config.camera_offset), &self.volume)
    }

    pub fn request_capture(&mut self) {
        self.capture.request_capture();
    }

    pub fn draws(&self) -> &SceneDrawList { &self.draws }
    pub fn draws_mut(&mut self) -> &mut SceneDrawList { &mut self.draws }

    pub fn collect_from_scene(&mut self, scene: &SceneGraph) -> CollectReport {
        self.draws.collect_from_scene(scene)
    }

    /// Encode one frame: follow the camera, upload assets, then run the pass schedule.
    /// In on-demand mode the placement only moves on frames that re-voxelize, so the GI pass
    /// samples the volume where it was captured.
    pub fn encode_frame(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        camera: &ExtractedView,
        view: Option<ViewTargets<'_>>,
    ) -> Result<ScheduleReport, String> {
        let capture_this_frame = self.capture.take_capture_request();
        if capture_this_frame || self.capture.placement().is_none() {
            self.follow(Vec3::from(camera.camera_position));
        }
        self.assets.prepare(&self.device, &self.queue, &self.draws);
        let mut ctx = FrameContext {
            device: &self.device,
            queue: &self.queue,
            encoder,
            camera,
            volume: &self.volume,
            placement: self.capture.placement(),
            capture: self.capture.target(),
            capture_this_frame,
            draws: &mut self.draws,
            assets: &self.assets,
            view,
        };
        let report = self.schedule.execute(&mut ctx)?;
        self.last_schedule = report.clone();
        Ok(report)
    }

    pub fn render_frame(&mut self, camera: &ExtractedView, view: Option<ViewTargets<'_>>) -> Result<wgpu::CommandBuffer, String> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("voxelgi_frame") });
        self.encode_frame(&mut encoder, camera, view)?;
        Ok(encoder.finish())
    }

    pub fn submit(&self, command_buffers: impl IntoIterator<Item = wgpu::CommandBuffer>) {
        self.queue.submit(command_buffers);
    }

    /// Voxelization stages run in the last frame.
    pub fn frame_report(&self) -> Option<&FrameReport> {
        self.schedule.find::<VoxelizationPass>().map(|p| p.last_report())
    }

    pub fn schedule_report(&self) -> &ScheduleReport { &self.last_schedule }

    pub fn gi_drawn_last_frame(&self) -> bool {
        self.schedule.find::<GiPass>().is_some_and(|p| p.drawn_last_frame())
    }

    /// Resolved colour per voxel, x fastest. Texture storage reads mip 0.
    pub fn read_resolved(&self) -> Result<Vec<[f32; 4]>, String> {
        if let Some(buf) = self.volume.resolved_buffer() {
            return readback::read_pod(&self.device, &self.queue, buf);
        }
        let texture = self.volume.volume_texture().ok_or("read_resolved: volume not ready")?;
        readback::read_volume_texture(&self.device, &self.queue, texture, 0)
    }

    /// One mip level of the 3D texture; only available with texture storage.
    pub fn read_mip(&self, level: u32) -> Result<Vec<[f32; 4]>, String> {
        let texture = self.volume.volume_texture().ok_or("read_mip: no volume texture")?;
        readback::read_volume_texture(&self.device, &self.queue, texture, level)
    }

    pub fn read_counts(&self) -> Result<Vec<u32>, String> {
        let buf = self.volume.count_buffer().ok_or("read_counts: volume not ready")?;
        readback::read_pod(&self.device, &self.queue, buf)
    }

    pub fn read_accumulation(&self) -> Result<Vec<[u32; 4]>, String> {
        let buf = self.volume.accumulation_buffer().ok_or("read_accumulation: volume not ready")?;
        readback::read_pod(&self.device, &self.queue, buf)
    }

    pub fn read_octree(&self) -> Result<Vec<OctreeNode>, String> {
        let buf = self.volume.octree_buffer().ok_or("read_octree: no octree with this storage")?;
        readback::read_pod(&self.device, &self.queue, buf)
    }

    /// Number of occupied 2x2x2 blocks counted by the last hierarchy build.
    pub fn read_occupied_blocks(&self) -> Result<u32, String> {
        let buf = self.volume.octree_index_buffer().ok_or("read_occupied_blocks: no octree with this storage")?;
        let v: Vec<u32> = readback::read_pod(&self.device, &self.queue, buf)?;
        Ok(v.first().copied().unwrap_or(0))
    }
}

impl Drop for VoxelGiRenderer {
    fn drop(&mut self) {
        self.dispose();
    }
}
