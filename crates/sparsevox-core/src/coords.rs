//! Coordinate decomposition for the two-level voxel grid.

use glam::IVec3;

/// Side length, in bottom-level bricks, of one top-level brick.
pub const TL_SIDE: i32 = 8;
/// Side length, in voxels, of one bottom-level brick.
pub const BL_SIDE: i32 = 8;
/// Bottom-level brick pointers per top-level brick (`TL_SIDE^3`).
pub const CELLS_PER_TL_BRICK: usize = (TL_SIDE * TL_SIDE * TL_SIDE) as usize;
/// Voxels per bottom-level brick (`BL_SIDE^3`).
pub const CELLS_PER_BL_BRICK: usize = (BL_SIDE * BL_SIDE * BL_SIDE) as usize;
/// Voxels covered by one top-level brick along each axis (`TL_SIDE * BL_SIDE`).
pub const VOXELS_PER_TOP_BRICK_SIDE: i32 = TL_SIDE * BL_SIDE;

/// The three-level decomposition of a voxel-space position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridCoords {
    /// Index of the top-level brick, in top-level-brick units.
    pub top: IVec3,
    /// Index of the bottom-level brick within its top-level brick, in bottom-level-brick units.
    pub bl: IVec3,
    /// Index of the voxel within its bottom-level brick.
    pub local: IVec3,
}

/// Decompose a voxel-space position into top/bottom/local coordinates.
///
/// `p` may be negative or otherwise out of bounds; callers are responsible for bounds-checking
/// against the grid's dimensions before using the result to index storage.
#[inline]
pub fn decompose_voxel_coord(p: IVec3) -> GridCoords {
    GridCoords {
        top: p.div_euclid(IVec3::splat(VOXELS_PER_TOP_BRICK_SIDE)),
        bl: p.div_euclid(IVec3::splat(BL_SIDE)).rem_euclid(IVec3::splat(TL_SIDE)),
        local: p.rem_euclid(IVec3::splat(BL_SIDE)),
    }
}

/// Flatten a top-level brick coordinate into an index into the top-level brick-pointer array.
///
/// Linearization is z-major, then y, then x; this order is normative for save files, GPU
/// indexing, and occupancy bit indices.
#[inline]
pub fn flatten_top_coord(c: IVec3, top_level_dims: IVec3) -> usize {
    (c.z * top_level_dims.x * top_level_dims.y + c.y * top_level_dims.x + c.x) as usize
}

/// Flatten a bottom-level-brick-local coordinate (range `0..TL_SIDE`) into an index into a
/// top-level brick's array of bottom-level brick pointers.
#[inline]
pub fn flatten_bl_coord(c: IVec3) -> usize {
    (c.z * TL_SIDE * TL_SIDE + c.y * TL_SIDE + c.x) as usize
}

/// Flatten a voxel-local coordinate (range `0..BL_SIDE`) into an index into a bottom-level
/// brick's voxel array. Uses the same formula as [`flatten_bl_coord`] since both bricks have the
/// same side length.
#[inline]
pub fn flatten_voxel_coord(c: IVec3) -> usize {
    (c.z * BL_SIDE * BL_SIDE + c.y * BL_SIDE + c.x) as usize
}

/// True if `p` (voxel-space) lies within `[0, top_level_dims * VOXELS_PER_TOP_BRICK_SIDE)`.
#[inline]
pub fn is_in_bounds(p: IVec3, top_level_dims: IVec3) -> bool {
    let dims = top_level_dims * VOXELS_PER_TOP_BRICK_SIDE;
    p.x >= 0 && p.y >= 0 && p.z >= 0 && p.x < dims.x && p.y < dims.y && p.z < dims.z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompose_matches_spec_example() {
        // p = (64+8+3, ...) exercises all three levels at once on one axis.
        let p = IVec3::new(64 + 8 * 3 + 5, 0, 0);
        let c = decompose_voxel_coord(p);
        assert_eq!(c.top, IVec3::new(1, 0, 0));
        assert_eq!(c.bl, IVec3::new(3, 0, 0));
        assert_eq!(c.local, IVec3::new(5, 0, 0));
    }

    #[test]
    fn flatten_is_z_major() {
        // Index should increase fastest along x, then y, then z.
        assert_eq!(flatten_top_coord(IVec3::new(1, 0, 0), IVec3::new(4, 4, 4)), 1);
        assert_eq!(flatten_top_coord(IVec3::new(0, 1, 0), IVec3::new(4, 4, 4)), 4);
        assert_eq!(flatten_top_coord(IVec3::new(0, 0, 1), IVec3::new(4, 4, 4)), 16);
    }

    #[test]
    fn bounds_check() {
        let dims = IVec3::new(2, 2, 2); // 128 voxels per axis
        assert!(is_in_bounds(IVec3::ZERO, dims));
        assert!(is_in_bounds(IVec3::splat(127), dims));
        assert!(!is_in_bounds(IVec3::new(-1, 0, 0), dims));
        assert!(!is_in_bounds(IVec3::new(128, 0, 0), dims));
    }
}
