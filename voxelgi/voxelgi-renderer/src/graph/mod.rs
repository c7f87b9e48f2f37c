//! Pass schedule: frame passes tagged with a host event, ordered by event then registration
//! (plus explicit edges), executed once per frame against a shared `FrameContext`.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bitflags::bitflags;
use render_api::ExtractedView;

use crate::assets::GpuAssetCache;
use crate::draw_list::SceneDrawList;
use crate::placement::{CaptureTarget, VolumePlacement};
use crate::resources::VolumeResources;

/// Point in the host frame a pass runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PassEvent {
    BeforeRenderingOpaques,
    AfterRenderingOpaques,
    BeforeRenderingPostProcessing,
    AfterRenderingPostProcessing,
}

bitflags! {
    /// Per-view inputs a pass needs from the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PassInputs: u32 {
        const DEPTH = 1 << 0;
        const NORMALS = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub usize);

/// Host view targets for the frame.
pub struct ViewTargets<'a> {
    pub color: &'a wgpu::TextureView,
    pub color_format: wgpu::TextureFormat,
    /// Depth32Float scene depth.
    pub depth: Option<&'a wgpu::TextureView>,
    /// World-space normals encoded as `n * 0.5 + 0.5`.
    pub normals: Option<&'a wgpu::TextureView>,
    pub size: (u32, u32),
}

impl ViewTargets<'_> {
    pub fn available_inputs(&self) -> PassInputs {
        let mut inputs = PassInputs::empty();
        inputs.set(PassInputs::DEPTH, self.depth.is_some());
        inputs.set(PassInputs::NORMALS, self.normals.is_some());
        inputs
    }
}

/// Everything a pass may touch during `execute`. Borrowed for the call only.
pub struct FrameContext<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub camera: &'a ExtractedView,
    pub volume: &'a VolumeResources,
    pub placement: Option<&'a VolumePlacement>,
    pub capture: Option<&'a CaptureTarget>,
    /// False when an on-demand capture camera has no pending request.
    pub capture_this_frame: bool,
    pub draws: &'a mut SceneDrawList,
    pub assets: &'a GpuAssetCache,
    pub view: Option<ViewTargets<'a>>,
}

impl FrameContext<'_> {
    pub fn available_inputs(&self) -> PassInputs {
        self.view.as_ref().map_or(PassInputs::empty(), |v| v.available_inputs())
    }
}

pub trait FramePass: Send {
    fn name(&self) -> &str;
    fn event(&self) -> PassEvent;
    fn required_inputs(&self) -> PassInputs {
        PassInputs::empty()
    }
    /// Build pipelines against the current volume generation.
    fn setup(&mut self, device: &wgpu::Device, volume: &VolumeResources) -> Result<(), String>;
    fn execute(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), String>;
    /// Drop pipelines and cached bind groups.
    fn dispose(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Which passes ran in the last `execute`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Default)]
pub struct PassSchedule {
    passes: Vec<Box<dyn FramePass>>,
    edges: Vec<(PassId, PassId)>,
    warned_inputs: Vec<bool>,
}

impl PassSchedule {
    pub fn new() -> Self { Self::default() }

    pub fn add_pass(&mut self, pass: Box<dyn FramePass>) -> PassId {
        let id = PassId(self.passes.len());
        self.passes.push(pass);
        self.warned_inputs.push(false);
        id
    }

    pub fn add_edge(&mut self, before: PassId, after: PassId) {
        self.edges.push((before, after));
    }

    pub fn len(&self) -> usize { self.passes.len() }
    pub fn is_empty(&self) -> bool { self.passes.is_empty() }

    /// First pass of concrete type `T`.
    pub fn find<T: FramePass + 'static>(&self) -> Option<&T> {
        self.passes.iter().find_map(|p| p.as_any().downcast_ref::<T>())
    }

    pub fn find_mut<T: FramePass + 'static>(&mut self) -> Option<&mut T> {
        self.passes.iter_mut().find_map(|p| p.as_any_mut().downcast_mut::<T>())
    }

    /// Execution order: event edges plus explicit edges, ties broken by registration order.
    pub fn order(&self) -> Result<Vec<PassId>, String> {
        let n = self.passes.len();
        let mut in_degree = vec![0usize; n];
        let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut link = |a: usize, b: usize| {
            in_degree[b] += 1;
            out_edges[a].push(b);
        };
        for a in 0..n {
            for b in 0..n {
                if self.passes[a].event() < self.passes[b].event() {
                    link(a, b);
                }
            }
        }
        for &(PassId(a), PassId(b)) in &self.edges {
            if a < n && b < n {
                link(a, b);
            }
        }
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(u)) = ready.pop() {
            order.push(PassId(u));
            for &v in &out_edges[u] {
                in_degree[v] -= 1;
                if in_degree[v] == 0 {
                    ready.push(Reverse(v));
                }
            }
        }
        if order.len() != n {
            return Err("pass schedule has a cycle".to_string());
        }
        Ok(order)
    }

    pub fn setup_all(&mut self, device: &wgpu::Device, volume: &VolumeResources) -> Result<(), String> {
        for pass in &mut self.passes {
            pass.setup(device, volume).map_err(|e| format!("{}: {}", pass.name(), e))?;
        }
        Ok(())
    }

    /// Run every pass in order. A pass with missing inputs is skipped (warned once); a pass
    /// that fails is logged and the remaining passes still run.
    pub fn execute(&mut self, ctx: &mut FrameContext<'_>) -> Result<ScheduleReport, String> {
        let order = self.order()?;
        let available = ctx.available_inputs();
        let mut report = ScheduleReport::default();
        for PassId(i) in order {
            let pass = &mut self.passes[i];
            let missing = pass.required_inputs() - available;
            if !missing.is_empty() {
                if !self.warned_inputs[i] {
                    log::warn!("{} skipped: missing inputs {:?}", pass.name(), missing);
                    self.warned_inputs[i] = true;
                }
                report.skipped.push(pass.name().to_string());
                continue;
            }
            match pass.execute(ctx) {
                Ok(()) => report.executed.push(pass.name().to_string()),
                Err(e) => {
                    log::error!("{} failed: {}", pass.name(), e);
                    report.failed.push(pass.name().to_string());
                }
            }
        }
        Ok(report)
    }

    pub fn dispose_all(&mut self) {
        for pass in &mut self.passes {
            pass.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, PassEvent);

    impl FramePass for Named {
        fn name(&self) -> &str { self.0 }
        fn event(&self) -> PassEvent { self.1 }
        fn setup(&mut self, _: &wgpu::Device, _: &VolumeResources) -> Result<(), String> { Ok(()) }
        fn execute(&mut self, _: &mut FrameContext<'_>) -> Result<(), String> { Ok(()) }
        fn dispose(&mut self) {}
        fn as_any(&self) -> &dyn Any { self }
        fn as_any_mut(&mut self) -> &mut dyn Any { self }
    }

    fn names(s: &PassSchedule) -> Vec<&str> {
        s.order().map(|o| o.into_iter().map(|PassId(i)| s.passes[i].name()).collect()).unwrap_or_default()
    }

    #[test]
    fn orders_by_event_then_registration() {
        let mut s = PassSchedule::new();
        s.add_pass(Box::new(Named("gi", PassEvent::BeforeRenderingPostProcessing)));
        s.add_pass(Box::new(Named("voxelize", PassEvent::BeforeRenderingOpaques)));
        s.add_pass(Box::new(Named("late", PassEvent::AfterRenderingPostProcessing)));
        s.add_pass(Box::new(Named("voxelize2", PassEvent::BeforeRenderingOpaques)));
        assert_eq!(names(&s), vec!["voxelize", "voxelize2", "gi", "late"]);
    }

    #[test]
    fn explicit_edge_overrides_registration() {
        let mut s = PassSchedule::new();
        let a = s.add_pass(Box::new(Named("a", PassEvent::AfterRenderingOpaques)));
        let b = s.add_pass(Box::new(Named("b", PassEvent::AfterRenderingOpaques)));
        s.add_edge(b, a);
        assert_eq!(names(&s), vec!["b", "a"]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut s = PassSchedule::new();
        let a = s.add_pass(Box::new(Named("a", PassEvent::AfterRenderingOpaques)));
        let b = s.add_pass(Box::new(Named("b", PassEvent::AfterRenderingOpaques)));
        s.add_edge(a, b);
        s.add_edge(b, a);
        assert!(s.order().is_err());
    }

    #[test]
    fn edge_against_event_order_is_a_cycle() {
        let mut s = PassSchedule::new();
        let early = s.add_pass(Box::new(Named("early", PassEvent::BeforeRenderingOpaques)));
        let late = s.add_pass(Box::new(Named("late", PassEvent::BeforeRenderingPostProcessing)));
        s.add_edge(late, early);
        assert!(s.order().is_err());
    }

    #[test]
    fn find_downcasts() {
        let mut s = PassSchedule::new();
        s.add_pass(Box::new(Named("a", PassEvent::AfterRenderingOpaques)));
        assert_eq!(s.find::<Named>().map(|p| p.0), Some("a"));
    }

    #[test]
    fn missing_inputs_are_computed() {
        let needed = PassInputs::DEPTH | PassInputs::NORMALS;
        assert_eq!(needed - PassInputs::DEPTH, PassInputs::NORMALS);
        assert!((needed - needed).is_empty());
    }
}
