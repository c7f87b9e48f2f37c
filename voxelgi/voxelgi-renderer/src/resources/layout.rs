//! Element counts and byte sizes of every volume buffer, derived from the grid edge.

use crate::encoding::{ACCUMULATION_STRIDE, COUNT_STRIDE, INDEX_STRIDE, OCTREE_NODE_STRIDE, RESOLVED_STRIDE};

/// Compute workgroup edge used by the clear and resolve kernels (4x4x4 threads).
pub const VOXEL_WORKGROUP: u32 = 4;
/// Compute workgroup edge used by the hierarchy kernels (4x4x4 threads).
pub const BLOCK_WORKGROUP: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeLayout {
    edge: u32,
}

impl VolumeLayout {
    /// `edge` must be a power of two >= 2.
    pub fn new(edge: u32) -> Self {
        debug_assert!(edge >= 2 && edge.is_power_of_two());
        Self { edge }
    }

    pub fn edge(&self) -> u32 { self.edge }

    /// Number of voxels: edge^3.
    pub fn total_count(&self) -> u32 { self.edge * self.edge * self.edge }

    /// Edge of the 2x2x2 block grid.
    pub fn octree_edge(&self) -> u32 { self.edge / 2 }

    /// One octree node per 8-voxel block: edge^3 / 8.
    pub fn octree_count(&self) -> u32 { self.total_count() / 8 }

    /// Full mip chain down to 1x1x1.
    pub fn mip_count(&self) -> u32 { self.edge.trailing_zeros() + 1 }

    pub fn accumulation_bytes(&self) -> u64 { self.total_count() as u64 * ACCUMULATION_STRIDE }
    pub fn count_bytes(&self) -> u64 { self.total_count() as u64 * COUNT_STRIDE }
    pub fn resolved_bytes(&self) -> u64 { self.total_count() as u64 * RESOLVED_STRIDE }
    pub fn octree_bytes(&self) -> u64 { self.octree_count() as u64 * OCTREE_NODE_STRIDE }
    pub fn index_bytes(&self) -> u64 { INDEX_STRIDE }

    /// Largest single buffer the chosen storage binds.
    pub fn largest_buffer_bytes(&self) -> u64 {
        self.accumulation_bytes().max(self.resolved_bytes())
    }

    /// Largest workgroup edge of any bundled kernel.
    pub fn max_workgroup_edge() -> u32 {
        VOXEL_WORKGROUP.max(BLOCK_WORKGROUP)
    }

    /// Workgroups for a per-voxel dispatch.
    pub fn voxel_dispatch(&self) -> [u32; 3] {
        let g = self.edge.div_ceil(VOXEL_WORKGROUP);
        [g, g, g]
    }

    /// Workgroups for a per-block dispatch over a grid of `edge` cells.
    pub fn block_dispatch(edge: u32) -> [u32; 3] {
        let g = edge.max(1).div_ceil(BLOCK_WORKGROUP);
        [g, g, g]
    }

    /// Linear voxel index, x fastest.
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (x + self.edge * (y + self.edge * z)) as usize
    }

    /// Voxel coordinate of a linear index.
    pub fn coord(&self, index: usize) -> [u32; 3] {
        let i = index as u32;
        [i % self.edge, (i / self.edge) % self.edge, i / (self.edge * self.edge)]
    }

    /// Linear octree node index of the block containing voxel (x, y, z).
    pub fn block_index(&self, x: u32, y: u32, z: u32) -> usize {
        let e = self.octree_edge();
        (x / 2 + e * (y / 2 + e * (z / 2))) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSize;

    #[test]
    fn counts_for_all_supported_sizes() {
        for size in VolumeSize::ALL {
            let e = size.edge();
            let layout = VolumeLayout::new(e);
            assert_eq!(layout.total_count(), e * e * e);
            assert_eq!(layout.octree_count(), e * e * e / 8);
            assert_eq!(layout.octree_edge().pow(3), layout.octree_count());
            assert_eq!(layout.accumulation_bytes(), (e * e * e) as u64 * 16);
            assert_eq!(layout.octree_bytes(), (e * e * e / 8) as u64 * 32);
        }
    }

    #[test]
    fn mip_count_reaches_one_voxel() {
        assert_eq!(VolumeLayout::new(8).mip_count(), 4);
        assert_eq!(VolumeLayout::new(128).mip_count(), 8);
    }

    #[test]
    fn dispatch_covers_grid() {
        assert_eq!(VolumeLayout::new(8).voxel_dispatch(), [2, 2, 2]);
        assert_eq!(VolumeLayout::new(64).voxel_dispatch(), [16, 16, 16]);
        assert_eq!(VolumeLayout::new(128).voxel_dispatch(), [32, 32, 32]);
        assert_eq!(VolumeLayout::block_dispatch(4), [1, 1, 1]);
        assert_eq!(VolumeLayout::block_dispatch(64), [16, 16, 16]);
        assert_eq!(VolumeLayout::block_dispatch(1), [1, 1, 1]);
    }

    #[test]
    fn index_and_coord_agree() {
        let layout = VolumeLayout::new(16);
        for &(x, y, z) in &[(0, 0, 0), (15, 0, 0), (3, 7, 11), (15, 15, 15)] {
            let i = layout.index(x, y, z);
            assert_eq!(layout.coord(i), [x, y, z]);
        }
        assert_eq!(layout.block_index(3, 7, 11), (1 + 8 * (3 + 8 * 5)) as usize);
    }
}
