//! Amanatides-Woo integer ray traversal over a [`TwoLevelGrid`].

use glam::{IVec3, Vec3};
use sparsevox_core::VoxelId;

use crate::grid::TwoLevelGrid;

/// The first solid voxel a ray crosses, if any within `max_steps` cell traversals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub voxel: VoxelId,
    pub voxel_position: IVec3,
    pub position_world: Vec3,
    pub normal: Vec3,
}

/// Step a ray through `grid` cell by cell, starting from (and excluding) the cell containing
/// `origin`, stopping at the first voxel for which `is_solid` returns `true`, or after
/// `max_steps` cells with no hit.
///
/// `direction` need not be normalized but must be non-zero in every component that should be
/// traversed; an axis-aligned ray (a zero component) is handled without producing NaNs, since a
/// zero direction component yields an infinite `delta_dist` on that axis, which never becomes the
/// selected step axis.
pub fn trace_ray(
    grid: &TwoLevelGrid,
    origin: Vec3,
    direction: Vec3,
    max_steps: u32,
    is_solid: impl Fn(VoxelId) -> bool,
) -> Option<RayHit> {
    let mut map_pos = origin.floor();

    let delta_dist = Vec3::ONE / direction.abs();

    let step_sign = Vec3::new(
        if direction.x >= 0.0 { 1.0 } else { -1.0 },
        if direction.y >= 0.0 { 1.0 } else { -1.0 },
        if direction.z >= 0.0 { 1.0 } else { -1.0 },
    );
    let s = (step_sign + Vec3::ONE) * 0.5; // 1 where direction is non-negative, else 0

    let mut side_dist = (s - step_sign * fract(origin)) * delta_dist;

    let top_dims = grid.top_level_dims();
    let dims = Vec3::new(
        (top_dims.x * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE) as f32,
        (top_dims.y * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE) as f32,
        (top_dims.z * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE) as f32,
    );

    for _ in 0..max_steps {
        // Select the axis with the smallest accumulated side distance.
        let step_axis = if side_dist.x <= side_dist.y && side_dist.x <= side_dist.z {
            0
        } else if side_dist.y <= side_dist.z {
            1
        } else {
            2
        };

        match step_axis {
            0 => {
                side_dist.x += delta_dist.x;
                map_pos.x += step_sign.x;
            }
            1 => {
                side_dist.y += delta_dist.y;
                map_pos.y += step_sign.y;
            }
            _ => {
                side_dist.z += delta_dist.z;
                map_pos.z += step_sign.z;
            }
        }

        if map_pos.x < 0.0
            || map_pos.y < 0.0
            || map_pos.z < 0.0
            || map_pos.x >= dims.x
            || map_pos.y >= dims.y
            || map_pos.z >= dims.z
        {
            continue;
        }

        let voxel_position = map_pos.as_ivec3();
        let voxel = grid.get_voxel(voxel_position);
        if is_solid(voxel) {
            let mut normal = Vec3::ZERO;
            let normal_sign = match step_axis {
                0 => -step_sign.x,
                1 => -step_sign.y,
                _ => -step_sign.z,
            };
            match step_axis {
                0 => normal.x = normal_sign,
                1 => normal.y = normal_sign,
                _ => normal.z = normal_sign,
            }

            let p = map_pos + 0.5 - step_sign * 0.5;
            let t = normal.dot(p - origin) / normal.dot(direction);
            let position_world = origin + direction * t;

            return Some(RayHit { voxel, voxel_position, position_world, normal });
        }
    }

    None
}

fn fract(v: Vec3) -> Vec3 {
    v - v.floor()
}
