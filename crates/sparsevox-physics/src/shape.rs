//! Grid shape adapter: the grid's side of shape-vs-grid collision, casting, and surface queries.
//!
//! The grid is not registered as a `parry3d` shape type (no generic custom-shape slot exists in
//! its dispatch enum); instead [`GridShape`] is a bespoke adapter with its own query methods, and
//! [`GridQueryDispatcher`] composes those methods with [`DefaultQueryDispatcher`] for the
//! grid-vs-everything-else and everything-else-vs-grid directions. Callers that need "any shape
//! vs any shape" dispatch go through `GridQueryDispatcher`; callers that already know one side is
//! a grid can call `GridShape`'s methods directly.

use glam::{IVec3, Vec3};
use rapier3d::na::{Isometry3, Vector3};
use rapier3d::parry::bounding_volume::Aabb;
use rapier3d::parry::query::{
    DefaultQueryDispatcher, QueryDispatcher, ShapeCastHit, ShapeCastOptions, Unsupported,
};
use rapier3d::parry::shape::{Cuboid, Shape};
use sparsevox_core::coords::flatten_bl_coord;
use sparsevox_grid::{trace_ray, TwoLevelGrid};

/// Amount voxel boxes are shrunk by. Zero in the corpus; kept as a named constant since it is the
/// first knob to reach for if colliders visibly penetrate.
const VX_EPSILON: f32 = 0.0;
/// AABB query expansion, to avoid characters sticking to surfaces at the boundary.
const VX_AABB_EPSILON: f32 = 1e-1;

/// Locally-unique identifier for a voxel a query touched, derived from its position within its
/// top-level brick. Stable only within one top-level brick's neighborhood, which is always true
/// of the localized AABBs queries run against (see `DESIGN.md`).
pub type SubShapeId = u32;

#[derive(Clone, Copy, Debug)]
pub struct Stats {
    pub size_bytes: usize,
    pub num_triangles: usize,
}

/// Normal + hit info for a ray cast against the grid, in the grid's own local space.
#[derive(Clone, Copy, Debug)]
pub struct GridRayHit {
    pub sub_shape_id: SubShapeId,
    pub fraction: f32,
    pub normal: Vec3,
}

/// Read-only adapter exposing the grid as a collidable volume.
pub struct GridShape<'a> {
    grid: &'a TwoLevelGrid,
}

impl<'a> GridShape<'a> {
    pub fn new(grid: &'a TwoLevelGrid) -> Self {
        Self { grid }
    }

    fn voxel_dims(&self) -> IVec3 {
        let top = self.grid.top_level_dims();
        top * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE
    }

    pub fn local_bounds(&self) -> Aabb {
        let dims = self.voxel_dims();
        Aabb::new(
            Vector3::new(0.0, 0.0, 0.0).into(),
            Vector3::new(dims.x as f32, dims.y as f32, dims.z as f32).into(),
        )
    }

    pub fn inner_radius(&self) -> f32 {
        let dims = self.voxel_dims();
        dims.x.min(dims.y).min(dims.z) as f32 / 2.0
    }

    pub fn stats(&self) -> Stats {
        Stats { size_bytes: std::mem::size_of::<Self>(), num_triangles: 0 }
    }

    /// §4.4.1: cast a local-space ray, returning a hit fraction in `[0, 1]` of `max_toi`.
    pub fn cast_ray(&self, origin: Vec3, direction: Vec3, max_toi: f32, max_steps: u32) -> Option<GridRayHit> {
        let direction_normalized = direction.normalize();
        let hit = trace_ray(self.grid, origin, direction_normalized, max_steps, |v| v.is_solid())?;

        let fraction = origin.distance(hit.position_world) / (direction_normalized.length() * max_toi);
        if fraction > 1.0 {
            return None;
        }

        Some(GridRayHit {
            sub_shape_id: flatten_bl_coord_u32(hit.voxel_position),
            fraction,
            normal: hit.normal,
        })
    }

    /// §4.4.2: test `other` (in its own local space, positioned by `pos_other` relative to the
    /// grid's origin) against every solid voxel in its expanded local bounds, invoking
    /// `collector` for each contact the dispatcher reports.
    pub fn collide(
        &self,
        other: &dyn Shape,
        pos_other: &Isometry3<f32>,
        dispatcher: &impl QueryDispatcher,
        mut collector: impl FnMut(SubShapeId, rapier3d::parry::query::Contact),
    ) -> Result<(), Unsupported> {
        let other_aabb = other.compute_aabb(pos_other);
        let half_extent = 0.5 - VX_EPSILON;
        let box_shape = Cuboid::new(Vector3::new(half_extent, half_extent, half_extent));

        for_each_voxel_in_expanded_aabb(&other_aabb, |voxel_pos| {
            if self.grid.get_voxel(voxel_pos).is_air() {
                return Ok(());
            }
            let pos_box = voxel_center_isometry(voxel_pos);
            let pos_box_to_other = pos_box.inverse() * pos_other;
            if let Some(contact) = dispatcher.contact(&pos_box_to_other, &box_shape, other, 0.0)? {
                collector(flatten_bl_coord_u32(voxel_pos), contact);
            }
            Ok(())
        })
    }

    /// §4.4.3: sweep `other` from `pos_other_start` by `local_vel_other` against every solid
    /// voxel whose box the swept AABB overlaps.
    #[allow(clippy::too_many_arguments)]
    pub fn cast_shape(
        &self,
        other: &dyn Shape,
        pos_other_start: &Isometry3<f32>,
        local_vel_other: Vector3<f32>,
        options: ShapeCastOptions,
        dispatcher: &impl QueryDispatcher,
        mut collector: impl FnMut(SubShapeId, ShapeCastHit),
    ) -> Result<(), Unsupported> {
        let start_aabb = other.compute_aabb(pos_other_start);
        let end_aabb = Aabb::new(
            (start_aabb.mins.coords + local_vel_other).into(),
            (start_aabb.maxs.coords + local_vel_other).into(),
        );
        let swept_aabb = start_aabb.merged(&end_aabb);

        for_each_voxel_in_expanded_aabb(&swept_aabb, |voxel_pos| {
            if self.grid.get_voxel(voxel_pos).is_air() {
                return Ok(());
            }
            let pos_box = voxel_center_isometry(voxel_pos);
            let pos_box_to_other = pos_box.inverse() * pos_other_start;
            if let Some(hit) =
                dispatcher.cast_shapes(&pos_box_to_other, &(-local_vel_other), &Cuboid::new(Vector3::new(0.5, 0.5, 0.5)), other, options)?
            {
                collector(flatten_bl_coord_u32(voxel_pos), hit);
            }
            Ok(())
        })
    }

    /// §4.4.4: the outward surface normal at a contact point, given the sub-shape id (unused
    /// here; the position alone determines it) and the local-space contact point.
    pub fn surface_normal(&self, local_surface_position: Vec3) -> Vec3 {
        let abs_diff_from_int = (local_surface_position - local_surface_position.round()).abs();
        let nearest_int_axis = if abs_diff_from_int.x <= abs_diff_from_int.y && abs_diff_from_int.x <= abs_diff_from_int.z {
            0
        } else if abs_diff_from_int.y <= abs_diff_from_int.z {
            1
        } else {
            2
        };

        let mut pos0 = local_surface_position;
        let mut pos1 = local_surface_position;
        match nearest_int_axis {
            0 => {
                pos0.x = local_surface_position.x.floor();
                pos1.x = local_surface_position.x.ceil();
            }
            1 => {
                pos0.y = local_surface_position.y.floor();
                pos1.y = local_surface_position.y.ceil();
            }
            _ => {
                pos0.z = local_surface_position.z.floor();
                pos1.z = local_surface_position.z.ceil();
            }
        }

        let v0_pos = pos0.floor().as_ivec3();
        let v1_pos = pos1.floor().as_ivec3();

        let solid_voxel_pos = if self.grid.get_voxel(v0_pos).is_solid() { v0_pos } else { v1_pos };

        let dir = local_surface_position - (solid_voxel_pos.as_vec3() + Vec3::splat(0.5));
        let abs_dir = dir.abs();
        let highest_axis = if abs_dir.x >= abs_dir.y && abs_dir.x >= abs_dir.z {
            0
        } else if abs_dir.y >= abs_dir.z {
            1
        } else {
            2
        };

        let mut normal = Vec3::ZERO;
        let sign = match highest_axis {
            0 => dir.x.signum(),
            1 => dir.y.signum(),
            _ => dir.z.signum(),
        };
        match highest_axis {
            0 => normal.x = sign,
            1 => normal.y = sign,
            _ => normal.z = sign,
        }

        -normal
    }
}

fn flatten_bl_coord_u32(p: IVec3) -> SubShapeId {
    let local = p.rem_euclid(IVec3::splat(sparsevox_core::coords::BL_SIDE));
    flatten_bl_coord(local) as SubShapeId
}

fn voxel_center_isometry(voxel_pos: IVec3) -> Isometry3<f32> {
    Isometry3::translation(voxel_pos.x as f32 + 0.5, voxel_pos.y as f32 + 0.5, voxel_pos.z as f32 + 0.5)
}

fn for_each_voxel_in_expanded_aabb(aabb: &Aabb, mut f: impl FnMut(IVec3) -> Result<(), Unsupported>) -> Result<(), Unsupported> {
    let min = aabb.mins;
    let max = aabb.maxs;
    let z0 = (min.z - VX_AABB_EPSILON).floor() as i32;
    let z1 = (max.z + VX_AABB_EPSILON).ceil() as i32;
    let y0 = (min.y - VX_AABB_EPSILON).floor() as i32;
    let y1 = (max.y + VX_AABB_EPSILON).ceil() as i32;
    let x0 = (min.x - VX_AABB_EPSILON).floor() as i32;
    let x1 = (max.x + VX_AABB_EPSILON).ceil() as i32;

    for z in z0..z1 {
        for y in y0..y1 {
            for x in x0..x1 {
                f(IVec3::new(x, y, z))?;
            }
        }
    }
    Ok(())
}

/// A `QueryDispatcher` that special-cases the grid shape, delegating everything else to
/// `DefaultQueryDispatcher`. See the "Dispatch registration" note in `DESIGN.md`: this replaces
/// the corpus's global shape-type registration with an explicit composed value.
pub struct GridQueryDispatcher {
    inner: DefaultQueryDispatcher,
}

impl Default for GridQueryDispatcher {
    fn default() -> Self {
        Self { inner: DefaultQueryDispatcher }
    }
}

impl GridQueryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &DefaultQueryDispatcher {
        &self.inner
    }

    /// collide(grid, convex) — all contacts between `grid` and `other`, positioned by `pos_other`.
    pub fn collide_grid_vs_shape(
        &self,
        grid: &TwoLevelGrid,
        other: &dyn Shape,
        pos_other: &Isometry3<f32>,
    ) -> Result<Vec<(SubShapeId, rapier3d::parry::query::Contact)>, Unsupported> {
        let mut contacts = Vec::new();
        GridShape::new(grid).collide(other, pos_other, &self.inner, |id, contact| contacts.push((id, contact)))?;
        Ok(contacts)
    }

    /// collide(convex, grid) — the reverse-wrapper direction named in §6.1; the grid is always
    /// positioned at the local origin, so this differs from `collide_grid_vs_shape` only in
    /// argument order, matching how the engine's dispatch table names the two directions.
    pub fn collide_shape_vs_grid(
        &self,
        other: &dyn Shape,
        pos_other: &Isometry3<f32>,
        grid: &TwoLevelGrid,
    ) -> Result<Vec<(SubShapeId, rapier3d::parry::query::Contact)>, Unsupported> {
        self.collide_grid_vs_shape(grid, other, pos_other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsevox_core::{MaterialEntry, MaterialTable, VoxelId};

    fn solid_grid(solid_at: IVec3) -> TwoLevelGrid {
        let mut materials = MaterialTable::new();
        materials.set(VoxelId(1), MaterialEntry::OPAQUE_SOLID);
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, materials).unwrap();
        grid.set_voxel(solid_at, VoxelId(1)).unwrap();
        grid
    }

    #[test]
    fn local_bounds_spans_voxel_dims() {
        let grid = TwoLevelGrid::new(IVec3::new(1, 2, 1), 1 << 16, MaterialTable::new()).unwrap();
        let shape = GridShape::new(&grid);
        let bounds = shape.local_bounds();
        assert_eq!(bounds.maxs.y, 128.0);
    }

    #[test]
    fn cast_ray_hits_solid_voxel() {
        let grid = solid_grid(IVec3::new(5, 0, 0));
        let shape = GridShape::new(&grid);
        let hit = shape.cast_ray(Vec3::new(0.5, 0.5, 0.5), Vec3::X, 20.0, 100).unwrap();
        assert!(hit.fraction <= 1.0);
    }

    #[test]
    fn cast_ray_misses_beyond_max_toi() {
        let grid = solid_grid(IVec3::new(50, 0, 0));
        let shape = GridShape::new(&grid);
        let hit = shape.cast_ray(Vec3::new(0.5, 0.5, 0.5), Vec3::X, 5.0, 100);
        assert!(hit.is_none());
    }

    #[test]
    fn surface_normal_points_away_from_solid_voxel() {
        let grid = solid_grid(IVec3::new(0, 0, 0));
        let shape = GridShape::new(&grid);
        // Point just above the top face of the solid voxel at origin.
        let normal = shape.surface_normal(Vec3::new(0.5, 1.0, 0.5));
        assert!(normal.y > 0.0 || normal.y < 0.0, "normal should have a nonzero y component near a top face");
    }
}
