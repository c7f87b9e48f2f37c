//! CPU model of the volume programs, used as the oracle for the GPU path.
//!
//! `ReferenceVolume` mirrors the clear / accumulate / resolve / hierarchy kernels with the same
//! fixed-point arithmetic. `ReferenceVoxelizer` rasterises a draw list the way the capture
//! camera does: orthographic along +Z, one sample per pixel centre, top-left fill rule.

use glam::{Mat4, Vec2, Vec3, Vec4Swizzles};

use crate::draw_list::SceneDrawList;
use crate::encoding::{decode_average, encode_color};
use crate::placement::VolumePlacement;
use crate::resources::{OctreeNode, VolumeLayout};

pub struct ReferenceVolume {
    layout: VolumeLayout,
    accumulation: Vec<[u32; 4]>,
    counts: Vec<u32>,
    resolved: Vec<[f32; 4]>,
    octree: Vec<OctreeNode>,
    occupied_blocks: u32,
}

impl ReferenceVolume {
    pub fn new(edge: u32) -> Self {
        let layout = VolumeLayout::new(edge);
        let n = layout.total_count() as usize;
        Self {
            layout,
            accumulation: vec![[0; 4]; n],
            counts: vec![0; n],
            resolved: vec![[0.0; 4]; n],
            octree: vec![OctreeNode::default(); layout.octree_count() as usize],
            occupied_blocks: 0,
        }
    }

    pub fn layout(&self) -> &VolumeLayout { &self.layout }

    /// Zero accumulation, counts and the occupied-block counter.
    pub fn clear(&mut self) {
        self.accumulation.fill([0; 4]);
        self.counts.fill(0);
        self.occupied_blocks = 0;
    }

    /// Add one encoded sample to voxel `index` (wrapping like the GPU atomics).
    pub fn splat(&mut self, index: usize, color: [f32; 4]) {
        let e = encode_color(color);
        let acc = &mut self.accumulation[index];
        for k in 0..4 {
            acc[k] = acc[k].wrapping_add(e[k]);
        }
        self.counts[index] = self.counts[index].wrapping_add(1);
    }

    pub fn resolve(&mut self) {
        for (out, (sum, &count)) in self.resolved.iter_mut().zip(self.accumulation.iter().zip(&self.counts)) {
            *out = decode_average(*sum, count);
        }
    }

    /// One node per 2x2x2 block: mean of the non-zero children plus occupancy mask.
    pub fn build_octree(&mut self) {
        let oe = self.layout.octree_edge();
        let mut occupied = 0;
        for bz in 0..oe {
            for by in 0..oe {
                for bx in 0..oe {
                    let mut sum = [0.0f32; 4];
                    let mut mask = 0u32;
                    let mut n = 0u32;
                    for k in 0..8u32 {
                        let c = self.resolved[self.layout.index(bx * 2 + (k & 1), by * 2 + ((k >> 1) & 1), bz * 2 + ((k >> 2) & 1))];
                        if c.iter().any(|&v| v != 0.0) {
                            for i in 0..4 {
                                sum[i] += c[i];
                            }
                            mask |= 1 << k;
                            n += 1;
                        }
                    }
                    let d = n.max(1) as f32;
                    let node = OctreeNode {
                        color: [sum[0] / d, sum[1] / d, sum[2] / d, sum[3] / d],
                        occupancy: mask,
                        child_count: n,
                        _pad: [0; 2],
                    };
                    self.octree[(bx + oe * (by + oe * bz)) as usize] = node;
                    if n > 0 {
                        occupied += 1;
                    }
                }
            }
        }
        self.occupied_blocks = occupied;
    }

    /// Box-filtered mip chain of the resolved volume; level 0 is the resolved data.
    pub fn build_mips(&self) -> Vec<Vec<[f32; 4]>> {
        let mut levels = vec![self.resolved.clone()];
        let mut edge = self.layout.edge();
        while edge > 1 {
            let src = levels.last().map(Vec::as_slice).unwrap_or(&[]);
            let dst_edge = edge / 2;
            let mut dst = vec![[0.0f32; 4]; (dst_edge * dst_edge * dst_edge) as usize];
            for z in 0..dst_edge {
                for y in 0..dst_edge {
                    for x in 0..dst_edge {
                        let mut sum = [0.0f32; 4];
                        for k in 0..8u32 {
                            let (sx, sy, sz) = (x * 2 + (k & 1), y * 2 + ((k >> 1) & 1), z * 2 + ((k >> 2) & 1));
                            let c = src[(sx + edge * (sy + edge * sz)) as usize];
                            for i in 0..4 {
                                sum[i] += c[i];
                            }
                        }
                        dst[(x + dst_edge * (y + dst_edge * z)) as usize] = sum.map(|v| v * 0.125);
                    }
                }
            }
            levels.push(dst);
            edge = dst_edge;
        }
        levels
    }

    pub fn accumulation(&self) -> &[[u32; 4]] { &self.accumulation }
    pub fn counts(&self) -> &[u32] { &self.counts }
    pub fn resolved(&self) -> &[[f32; 4]] { &self.resolved }
    pub fn octree(&self) -> &[OctreeNode] { &self.octree }
    pub fn occupied_blocks(&self) -> u32 { self.occupied_blocks }
}

/// Screen-space vertex after capture projection.
#[derive(Clone, Copy)]
struct RasterVertex {
    screen: Vec2,
    world: Vec3,
    uv: Vec2,
}

fn edge_function(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (p.x - a.x) * (b.y - a.y) - (p.y - a.y) * (b.x - a.x)
}

/// Top or left edge for a triangle wound so that `edge_function` is positive inside.
fn is_top_left(a: Vec2, b: Vec2) -> bool {
    let d = b - a;
    (d.y == 0.0 && d.x > 0.0) || d.y < 0.0
}

/// CPU rasteriser matching the capture camera.
pub struct ReferenceVoxelizer {
    placement: VolumePlacement,
    target_size: u32,
}

impl ReferenceVoxelizer {
    pub fn new(placement: VolumePlacement, target_size: u32) -> Self {
        Self { placement, target_size }
    }

    /// Accumulate every active entry of `draws` into `volume`. Returns the number of draws.
    pub fn voxelize(&self, draws: &SceneDrawList, volume: &mut ReferenceVolume) -> usize {
        let view_proj = self.placement.capture_view_proj();
        let mut drawn = 0;
        for entry in draws.iter_active() {
            let Some(sub) = entry.mesh.submeshes.get(entry.submesh) else { continue };
            let model = Mat4::from_cols_array(&entry.model_matrix());
            let tint = entry.tint();
            let start = sub.index_start as usize;
            for tri in 0..(sub.index_count as usize / 3) {
                let mut verts = [RasterVertex { screen: Vec2::ZERO, world: Vec3::ZERO, uv: Vec2::ZERO }; 3];
                let mut ok = true;
                for (k, v) in verts.iter_mut().enumerate() {
                    let Some(vi) = entry.mesh.index(start + tri * 3 + k) else {
                        ok = false;
                        break;
                    };
                    let (Some(p), Some(uv)) = (entry.mesh.position(vi as usize), entry.mesh.uv(vi as usize)) else {
                        ok = false;
                        break;
                    };
                    let world = model * Vec3::from(p).extend(1.0);
                    let clip = view_proj * world;
                    let ndc = clip.xy() / clip.w;
                    let size = self.target_size as f32;
                    *v = RasterVertex {
                        screen: Vec2::new((ndc.x + 1.0) * 0.5 * size, (1.0 - ndc.y) * 0.5 * size),
                        world: world.xyz() / world.w,
                        uv: Vec2::from(uv),
                    };
                }
                if ok {
                    self.raster_triangle(verts, |world, uv| {
                        if let Some([x, y, z]) = self.placement.voxel_of(world) {
                            let base = match &entry.base_color {
                                Some(tex) => tex.texel(uv.to_array()),
                                None => [1.0; 4],
                            };
                            let color = [base[0] * tint[0], base[1] * tint[1], base[2] * tint[2], base[3] * tint[3]];
                            volume.splat(volume.layout().index(x, y, z), color);
                        }
                    });
                }
            }
            drawn += 1;
        }
        drawn
    }

    fn raster_triangle(&self, mut v: [RasterVertex; 3], mut fragment: impl FnMut(Vec3, Vec2)) {
        let mut area = edge_function(v[0].screen, v[1].screen, v[2].screen);
        if area == 0.0 {
            return;
        }
        if area < 0.0 {
            v.swap(1, 2);
            area = -area;
        }
        let size = self.target_size as f32;
        let min = v[0].screen.min(v[1].screen).min(v[2].screen).max(Vec2::ZERO);
        let max = v[0].screen.max(v[1].screen).max(v[2].screen).min(Vec2::splat(size));
        let (x0, y0) = (min.x.floor() as u32, min.y.floor() as u32);
        let (x1, y1) = (max.x.ceil() as u32, max.y.ceil() as u32);
        let edges = [(1usize, 2usize), (2, 0), (0, 1)];
        for py in y0..y1.min(self.target_size) {
            for px in x0..x1.min(self.target_size) {
                let p = Vec2::new(px as f32 + 0.5, py as f32 + 0.5);
                let mut w = [0.0f32; 3];
                let mut inside = true;
                for (i, &(a, b)) in edges.iter().enumerate() {
                    let e = edge_function(v[a].screen, v[b].screen, p);
                    if e < 0.0 || (e == 0.0 && !is_top_left(v[a].screen, v[b].screen)) {
                        inside = false;
                        break;
                    }
                    w[i] = e / area;
                }
                if inside {
                    let world = v[0].world * w[0] + v[1].world * w[1] + v[2].world * w[2];
                    let uv = v[0].uv * w[0] + v[1].uv * w[1] + v[2].uv * w[2];
                    fragment(world, uv);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw_list::DrawEntry;
    use crate::encoding::decode_tolerance;
    use render_api::{MeshData, SceneNode, IDENTITY};
    use std::sync::Arc;

    /// Axis-aligned quad in the plane z = `z`, spanning [x0, x1] x [y0, y1].
    fn quad(id: u64, x0: f32, y0: f32, x1: f32, y1: f32, z: f32) -> Arc<MeshData> {
        let corners = [[x0, y0], [x1, y0], [x1, y1], [x0, y1]];
        let mut vertex = Vec::new();
        for (i, c) in corners.iter().enumerate() {
            let uv = [(i == 1 || i == 2) as u8 as f32, (i >= 2) as u8 as f32];
            for f in [c[0], c[1], z, 0.0, 0.0, -1.0, uv[0], uv[1]] {
                vertex.extend_from_slice(&f.to_le_bytes());
            }
        }
        let index: Vec<u8> = [0u32, 1, 2, 0, 2, 3].iter().flat_map(|i| i.to_le_bytes()).collect();
        Arc::new(MeshData::single(id, "quad", vertex, index))
    }

    fn entry(mesh: &Arc<MeshData>, tint: [f32; 4]) -> DrawEntry {
        DrawEntry::new(SceneNode::new(1, "n", IDENTITY), Arc::clone(mesh), 0, None, tint)
    }

    fn placement() -> VolumePlacement {
        // 8^3 grid of unit voxels spanning [-4, 4) on every axis.
        VolumePlacement::follow(Vec3::ZERO, Vec3::ZERO, 8, 1.0)
    }

    #[test]
    fn clear_then_resolve_is_all_zero() {
        let mut vol = ReferenceVolume::new(8);
        vol.splat(3, [1.0, 1.0, 1.0, 1.0]);
        vol.resolve();
        vol.clear();
        vol.resolve();
        assert!(vol.resolved().iter().all(|c| *c == [0.0; 4]));
        assert!(vol.counts().iter().all(|&c| c == 0));
    }

    #[test]
    fn repeated_draws_average_to_tint() {
        let tint = [0.9, 0.4, 0.1, 1.0];
        // One voxel footprint: x in [0, 1], y in [0, 1] at z = 0.5 -> voxel (4, 4, 4).
        let mesh = quad(1, 0.0, 0.0, 1.0, 1.0, 0.5);
        let mut draws = SceneDrawList::new();
        let n = 5;
        for _ in 0..n {
            draws.push(entry(&mesh, tint));
        }
        let mut vol = ReferenceVolume::new(8);
        let vox = ReferenceVoxelizer::new(placement(), 8);
        assert_eq!(vox.voxelize(&draws, &mut vol), n);
        vol.resolve();
        let target = vol.layout().index(4, 4, 4);
        assert_eq!(vol.counts()[target], n as u32);
        for k in 0..4 {
            assert!((vol.resolved()[target][k] - tint[k]).abs() <= decode_tolerance());
        }
        for (i, c) in vol.resolved().iter().enumerate() {
            if i != target {
                assert_eq!(*c, [0.0; 4], "voxel {} touched", i);
            }
        }
    }

    #[test]
    fn inactive_entries_do_not_contribute() {
        let mesh = quad(1, -2.0, -2.0, 2.0, 2.0, 0.5);
        let mut draws = SceneDrawList::new();
        draws.push(entry(&mesh, [1.0, 0.0, 0.0, 1.0]));
        let red_only = {
            let mut vol = ReferenceVolume::new(8);
            ReferenceVoxelizer::new(placement(), 8).voxelize(&draws, &mut vol);
            vol.resolve();
            vol.resolved().to_vec()
        };
        let blue = entry(&mesh, [0.0, 0.0, 1.0, 1.0]);
        blue.node.set_active(false);
        draws.push(blue);
        let mut vol = ReferenceVolume::new(8);
        let drawn = ReferenceVoxelizer::new(placement(), 8).voxelize(&draws, &mut vol);
        vol.resolve();
        assert_eq!(drawn, 1);
        assert_eq!(vol.resolved(), red_only.as_slice());
    }

    #[test]
    fn quad_covers_its_footprint_once_per_pixel() {
        let mesh = quad(1, -2.0, -2.0, 2.0, 2.0, -3.5);
        let mut draws = SceneDrawList::new();
        draws.push(entry(&mesh, [1.0; 4]));
        let mut vol = ReferenceVolume::new(8);
        ReferenceVoxelizer::new(placement(), 16).voxelize(&draws, &mut vol);
        // 4x4 voxels at z = 0, each hit by 2x2 pixels at density 2.
        let hit: Vec<usize> = (0..vol.counts().len()).filter(|&i| vol.counts()[i] > 0).collect();
        assert_eq!(hit.len(), 16);
        for i in hit {
            assert_eq!(vol.counts()[i], 4);
            assert_eq!(vol.layout().coord(i)[2], 0);
        }
    }

    #[test]
    fn geometry_outside_the_grid_is_ignored() {
        let mesh = quad(1, 10.0, 10.0, 12.0, 12.0, 0.5);
        let mut draws = SceneDrawList::new();
        draws.push(entry(&mesh, [1.0; 4]));
        let mut vol = ReferenceVolume::new(8);
        ReferenceVoxelizer::new(placement(), 8).voxelize(&draws, &mut vol);
        assert!(vol.counts().iter().all(|&c| c == 0));
    }

    #[test]
    fn octree_summarises_blocks() {
        let mut vol = ReferenceVolume::new(8);
        let l = *vol.layout();
        vol.splat(l.index(0, 0, 0), [1.0, 0.0, 0.0, 1.0]);
        vol.splat(l.index(1, 1, 1), [0.0, 1.0, 0.0, 1.0]);
        vol.splat(l.index(7, 7, 7), [0.0, 0.0, 1.0, 1.0]);
        vol.resolve();
        vol.build_octree();
        assert_eq!(vol.octree().len(), 64);
        assert_eq!(vol.occupied_blocks(), 2);
        let first = vol.octree()[l.block_index(0, 0, 0)];
        assert_eq!(first.child_count, 2);
        assert_eq!(first.occupancy, 0b1000_0001);
        assert!((first.color[0] - 0.5).abs() < 1e-3 && (first.color[1] - 0.5).abs() < 1e-3);
        let last = vol.octree()[l.block_index(7, 7, 7)];
        assert_eq!(last.occupancy, 0b1000_0000);
        assert_eq!(vol.octree()[l.block_index(2, 0, 0)], OctreeNode::default());
    }

    #[test]
    fn mips_reach_a_single_texel() {
        let mut vol = ReferenceVolume::new(8);
        let l = *vol.layout();
        for i in 0..8 {
            vol.splat(l.index(i, 0, 0), [1.0, 1.0, 1.0, 1.0]);
        }
        vol.resolve();
        let mips = vol.build_mips();
        assert_eq!(mips.len() as u32, l.mip_count());
        assert_eq!(mips.last().map(Vec::len), Some(1));
        // 8 of 512 voxels set.
        let top = mips[mips.len() - 1][0];
        assert!((top[0] - 8.0 / 512.0).abs() < 1e-6);
    }

    #[test]
    fn counters_wrap_instead_of_panicking() {
        let mut vol = ReferenceVolume::new(8);
        vol.accumulation[0] = [u32::MAX; 4];
        vol.splat(0, [1.0; 4]);
        assert_eq!(vol.accumulation()[0], [1023; 4]);
    }
}
