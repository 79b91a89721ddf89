//! The two-level sparse voxel grid: top-level brick pointers over top-level bricks of
//! bottom-level brick pointers over bottom-level bricks of voxel IDs, with uniform-value
//! ("all same") collapse and a per-brick visibility occupancy bitmap.

use bytemuck::{Pod, Zeroable};
use glam::IVec3;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use sparsevox_core::coords::{
    decompose_voxel_coord, flatten_bl_coord, flatten_top_coord, flatten_voxel_coord,
    is_in_bounds, CELLS_PER_BL_BRICK, CELLS_PER_TL_BRICK,
};
use sparsevox_core::{Error, MaterialEntry, MaterialTable, Result, VoxelId};

use crate::sketchy_buffer::{Alloc, SketchyBuffer};

/// Number of `u32` words in a bottom-level brick's occupancy bitmap (`512` bits).
pub const OCCUPANCY_WORDS: usize = CELLS_PER_BL_BRICK / 32;
const OCCUPANCY_BYTES: usize = OCCUPANCY_WORDS * 4;

/// A brick pointer: either a collapsed uniform value or a typed index to brick storage.
///
/// Identical shape at both grid levels, matching the data model. Packed to 8 bytes (`tag` byte
/// plus explicit padding, then a 32-bit payload) to stay bit-identical with the GPU-side layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct BrickPtr {
    all_same: u8,
    _pad: [u8; 3],
    payload: u32,
}

impl BrickPtr {
    #[inline]
    pub fn all_same(voxel: VoxelId) -> Self {
        Self { all_same: 1, _pad: [0; 3], payload: voxel.0 }
    }

    #[inline]
    pub fn brick(index: u32) -> Self {
        Self { all_same: 0, _pad: [0; 3], payload: index }
    }

    #[inline]
    pub fn is_all_same(self) -> bool {
        self.all_same != 0
    }

    #[inline]
    pub fn uniform_voxel(self) -> VoxelId {
        debug_assert!(self.is_all_same());
        VoxelId(self.payload)
    }

    #[inline]
    pub fn brick_index(self) -> u32 {
        debug_assert!(!self.is_all_same());
        self.payload
    }
}

const BRICK_PTR_SIZE: usize = std::mem::size_of::<BrickPtr>();
const TOP_BRICK_SIZE: usize = CELLS_PER_TL_BRICK * BRICK_PTR_SIZE;

/// A bottom-level brick: an occupancy bitmap followed by 512 voxel IDs, matching the save
/// format's field order so in-memory and on-disk layout agree.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BottomBrick {
    occupancy: [u32; OCCUPANCY_WORDS],
    voxels: [u32; CELLS_PER_BL_BRICK],
}

const BOTTOM_BRICK_SIZE: usize = std::mem::size_of::<BottomBrick>();

struct GridState {
    buffer: SketchyBuffer,
    top_ptrs_alloc: Alloc,
    top_level_dims: IVec3,
    num_top_bricks: usize,
    top_brick_index_to_alloc: HashMap<u32, Alloc>,
    bottom_brick_index_to_alloc: HashMap<u32, Alloc>,
    dirty_top_ptr_offsets: HashSet<usize>,
    dirty_bottom_ptr_offsets: HashSet<usize>,
    materials: MaterialTable,
    change_generation: u64,
}

impl GridState {
    fn top_ptr_offset(&self, top_flat: usize) -> usize {
        self.top_ptrs_alloc.offset + top_flat * BRICK_PTR_SIZE
    }

    fn bottom_ptr_offset(top_brick_index: u32, bl_flat: usize) -> usize {
        top_brick_index as usize * TOP_BRICK_SIZE + bl_flat * BRICK_PTR_SIZE
    }

    fn top_ptr(&self, top_flat: usize) -> BrickPtr {
        self.buffer.read_struct(self.top_ptr_offset(top_flat))
    }

    fn bottom_ptr(&self, top_brick_index: u32, bl_flat: usize) -> BrickPtr {
        self.buffer.read_struct(Self::bottom_ptr_offset(top_brick_index, bl_flat))
    }

    fn allocate_top_brick(&mut self, fill: BrickPtr, track_dirty: bool) -> Result<u32> {
        let alloc = self.buffer.allocate(TOP_BRICK_SIZE, TOP_BRICK_SIZE)?;
        let index = (alloc.offset / TOP_BRICK_SIZE) as u32;
        for local in 0..CELLS_PER_TL_BRICK {
            let offset = alloc.offset + local * BRICK_PTR_SIZE;
            if track_dirty {
                self.buffer.write_struct(offset, fill);
            } else {
                self.buffer.write_struct_no_dirty(offset, fill);
            }
        }
        self.top_brick_index_to_alloc.insert(index, alloc);
        Ok(index)
    }

    fn free_top_brick(&mut self, index: u32) {
        if let Some(alloc) = self.top_brick_index_to_alloc.remove(&index) {
            self.buffer.free(alloc);
        }
    }

    fn allocate_bottom_brick(
        &mut self,
        fill_voxel: VoxelId,
        occupancy_bit: bool,
        track_dirty: bool,
    ) -> Result<u32> {
        let alloc = self.buffer.allocate(BOTTOM_BRICK_SIZE, BOTTOM_BRICK_SIZE)?;
        let index = (alloc.offset / BOTTOM_BRICK_SIZE) as u32;
        let occupancy = if occupancy_bit { [u32::MAX; OCCUPANCY_WORDS] } else { [0u32; OCCUPANCY_WORDS] };
        let brick = BottomBrick { occupancy, voxels: [fill_voxel.0; CELLS_PER_BL_BRICK] };
        if track_dirty {
            self.buffer.write_struct(alloc.offset, brick);
        } else {
            self.buffer.write_struct_no_dirty(alloc.offset, brick);
        }
        self.bottom_brick_index_to_alloc.insert(index, alloc);
        Ok(index)
    }

    fn free_bottom_brick(&mut self, index: u32) {
        if let Some(alloc) = self.bottom_brick_index_to_alloc.remove(&index) {
            self.buffer.free(alloc);
        }
    }

    fn set_top_ptr(&mut self, top_flat: usize, ptr: BrickPtr, track_dirty: bool) {
        let offset = self.top_ptr_offset(top_flat);
        if track_dirty {
            self.buffer.write_struct(offset, ptr);
        } else {
            self.buffer.write_struct_no_dirty(offset, ptr);
        }
    }

    fn set_bottom_ptr(&mut self, top_brick_index: u32, bl_flat: usize, ptr: BrickPtr, track_dirty: bool) {
        let offset = Self::bottom_ptr_offset(top_brick_index, bl_flat);
        if track_dirty {
            self.buffer.write_struct(offset, ptr);
        } else {
            self.buffer.write_struct_no_dirty(offset, ptr);
        }
    }

    fn get_voxel(&self, p: IVec3) -> VoxelId {
        if !is_in_bounds(p, self.top_level_dims) {
            return VoxelId::AIR;
        }
        let c = decompose_voxel_coord(p);
        let top_flat = flatten_top_coord(c.top, self.top_level_dims);
        let top_ptr = self.top_ptr(top_flat);
        if top_ptr.is_all_same() {
            return top_ptr.uniform_voxel();
        }
        let bl_flat = flatten_bl_coord(c.bl);
        let bottom_ptr = self.bottom_ptr(top_ptr.brick_index(), bl_flat);
        if bottom_ptr.is_all_same() {
            return bottom_ptr.uniform_voxel();
        }
        let voxel_flat = flatten_voxel_coord(c.local);
        let offset =
            bottom_ptr.brick_index() as usize * BOTTOM_BRICK_SIZE + OCCUPANCY_BYTES + voxel_flat * 4;
        VoxelId(self.buffer.read_struct(offset))
    }

    fn set_voxel_impl(&mut self, p: IVec3, v: VoxelId, track_dirty: bool) -> Result<()> {
        if !is_in_bounds(p, self.top_level_dims) {
            return Err(Error::InvalidCoordinate { x: p.x, y: p.y, z: p.z });
        }
        let material = self.materials.get(v).ok_or(Error::MaterialMissing(v.0))?;

        let c = decompose_voxel_coord(p);
        let top_flat = flatten_top_coord(c.top, self.top_level_dims);

        let mut top_ptr = self.top_ptr(top_flat);
        if top_ptr.is_all_same() {
            let uniform = top_ptr.uniform_voxel();
            let new_index = self.allocate_top_brick(BrickPtr::all_same(uniform), track_dirty)?;
            top_ptr = BrickPtr::brick(new_index);
            self.set_top_ptr(top_flat, top_ptr, track_dirty);
        }
        let top_brick_index = top_ptr.brick_index();

        let bl_flat = flatten_bl_coord(c.bl);
        let mut bottom_ptr = self.bottom_ptr(top_brick_index, bl_flat);
        if bottom_ptr.is_all_same() {
            let uniform = bottom_ptr.uniform_voxel();
            let uniform_visible = self.materials.get(uniform).unwrap_or(MaterialEntry::AIR).is_visible;
            let new_index = self.allocate_bottom_brick(uniform, uniform_visible, track_dirty)?;
            bottom_ptr = BrickPtr::brick(new_index);
            self.set_bottom_ptr(top_brick_index, bl_flat, bottom_ptr, track_dirty);
        }
        let bottom_brick_index = bottom_ptr.brick_index();

        let voxel_flat = flatten_voxel_coord(c.local);
        let brick_base = bottom_brick_index as usize * BOTTOM_BRICK_SIZE;
        let voxel_offset = brick_base + OCCUPANCY_BYTES + voxel_flat * 4;
        if track_dirty {
            self.buffer.write_struct(voxel_offset, v.0);
        } else {
            self.buffer.write_struct_no_dirty(voxel_offset, v.0);
        }

        let occ_word_offset = brick_base + (voxel_flat / 32) * 4;
        let mut word: u32 = self.buffer.read_struct(occ_word_offset);
        let bit = voxel_flat % 32;
        if material.is_visible {
            word |= 1 << bit;
        } else {
            word &= !(1 << bit);
        }
        if track_dirty {
            self.buffer.write_struct(occ_word_offset, word);
        } else {
            self.buffer.write_struct_no_dirty(occ_word_offset, word);
        }

        if track_dirty {
            self.dirty_top_ptr_offsets.insert(self.top_ptr_offset(top_flat));
            self.dirty_bottom_ptr_offsets
                .insert(Self::bottom_ptr_offset(top_brick_index, bl_flat));
        }
        self.change_generation += 1;
        Ok(())
    }

    fn try_coalesce_bottom_at(&mut self, ptr_offset: usize) {
        let ptr: BrickPtr = self.buffer.read_struct(ptr_offset);
        if ptr.is_all_same() {
            return;
        }
        let brick_index = ptr.brick_index();
        let base = brick_index as usize * BOTTOM_BRICK_SIZE + OCCUPANCY_BYTES;
        let first: u32 = self.buffer.read_struct(base);
        let all_same = (1..CELLS_PER_BL_BRICK)
            .all(|i| self.buffer.read_struct::<u32>(base + i * 4) == first);
        if all_same {
            self.free_bottom_brick(brick_index);
            self.buffer.write_struct(ptr_offset, BrickPtr::all_same(VoxelId(first)));
        }
    }

    fn try_coalesce_top_at(&mut self, ptr_offset: usize) {
        let ptr: BrickPtr = self.buffer.read_struct(ptr_offset);
        if ptr.is_all_same() {
            return;
        }
        let brick_index = ptr.brick_index();
        let base = brick_index as usize * TOP_BRICK_SIZE;
        let first: BrickPtr = self.buffer.read_struct(base);
        if !first.is_all_same() {
            return;
        }
        let uniform = first.uniform_voxel();
        let all_same = (1..CELLS_PER_TL_BRICK).all(|i| {
            let child: BrickPtr = self.buffer.read_struct(base + i * BRICK_PTR_SIZE);
            child.is_all_same() && child.uniform_voxel() == uniform
        });
        if all_same {
            self.free_top_brick(brick_index);
            self.buffer.write_struct(ptr_offset, BrickPtr::all_same(uniform));
        }
    }
}

/// Sparse, finite voxel volume with uniform-brick collapse, backed by a [`SketchyBuffer`].
///
/// Mutating operations (`set_voxel`, `coalesce_dirty_bricks`, `coalesce_all`) and read-only
/// queries (`get_voxel`) share one reader-writer lock, giving parallel readers and a single
/// mutator as required by the concurrency model.
pub struct TwoLevelGrid {
    state: RwLock<GridState>,
}

impl TwoLevelGrid {
    /// Construct a grid of `top_level_dims` top-level bricks (each covering 64 voxels per axis),
    /// backed by a Sketchy Buffer of `buffer_capacity_bytes`. `materials` must at minimum cover
    /// voxel ID 0; an empty table is replaced with `MaterialTable::new()`.
    pub fn new(top_level_dims: IVec3, buffer_capacity_bytes: usize, materials: MaterialTable) -> Result<Self> {
        let num_top_bricks =
            (top_level_dims.x * top_level_dims.y * top_level_dims.z).max(0) as usize;
        let mut buffer = SketchyBuffer::new(buffer_capacity_bytes);
        let top_ptrs_alloc = buffer.allocate(num_top_bricks * BRICK_PTR_SIZE, BRICK_PTR_SIZE)?;
        for i in 0..num_top_bricks {
            buffer.write_struct(top_ptrs_alloc.offset + i * BRICK_PTR_SIZE, BrickPtr::all_same(VoxelId::AIR));
        }

        let materials = if materials.is_empty() { MaterialTable::new() } else { materials };

        tracing::debug!(
            top_level_dims = ?top_level_dims,
            buffer_capacity_bytes,
            "constructed two-level grid"
        );

        Ok(Self {
            state: RwLock::new(GridState {
                buffer,
                top_ptrs_alloc,
                top_level_dims,
                num_top_bricks,
                top_brick_index_to_alloc: HashMap::new(),
                bottom_brick_index_to_alloc: HashMap::new(),
                dirty_top_ptr_offsets: HashSet::new(),
                dirty_bottom_ptr_offsets: HashSet::new(),
                materials,
                change_generation: 0,
            }),
        })
    }

    /// Top-level brick dimensions this grid was constructed with.
    pub fn top_level_dims(&self) -> IVec3 {
        self.state.read().top_level_dims
    }

    /// Base index (in units of `size_of::<BrickPtr>()`) of the top-level pointer array, for
    /// publishing to GPU shaders and save files.
    pub fn top_ptrs_base_index(&self) -> u32 {
        (self.state.read().top_ptrs_alloc.offset / BRICK_PTR_SIZE) as u32
    }

    /// A snapshot copy of the current material table.
    pub fn material_table(&self) -> MaterialTable {
        self.state.read().materials.clone()
    }

    /// Monotonically increasing counter bumped on every successful `set_voxel`. Used by the path
    /// cache to detect "the grid changed" without taking the grid's own lock from outside.
    pub fn change_generation(&self) -> u64 {
        self.state.read().change_generation
    }

    /// Returns `0` (air) for any out-of-bounds coordinate; never fails.
    pub fn get_voxel(&self, p: IVec3) -> VoxelId {
        self.state.read().get_voxel(p)
    }

    /// Write a voxel. `p` must be in-bounds; out-of-bounds is reported as `InvalidCoordinate`
    /// rather than silently ignored, since unlike reads this is a mutating call.
    pub fn set_voxel(&self, p: IVec3, v: VoxelId) -> Result<()> {
        self.state.write().set_voxel_impl(p, v, true)
    }

    /// Like `set_voxel` but skips per-write dirty-page tracking and dirty-for-coalesce
    /// bookkeeping. Used only by the bulk loader (see `crate::save`), which marks everything
    /// dirty in one pass after the whole grid is reconstructed.
    pub(crate) fn set_voxel_no_dirty(&self, p: IVec3, v: VoxelId) -> Result<()> {
        self.state.write().set_voxel_impl(p, v, false)
    }

    /// Replace the material table wholesale. Used by the loader before replaying voxel writes.
    pub(crate) fn set_material_table(&self, materials: MaterialTable) {
        self.state.write().materials = materials;
    }

    /// Collapse uniform bricks back to scalars and free their storage, but only among bricks
    /// touched since the last coalesce. Bottom level is processed before top level, since a
    /// freshly-collapsed bottom brick can make its parent top brick collapsible too.
    pub fn coalesce_dirty_bricks(&self) {
        let mut state = self.state.write();
        let bottom: Vec<usize> = state.dirty_bottom_ptr_offsets.drain().collect();
        for offset in bottom {
            state.try_coalesce_bottom_at(offset);
        }
        let top: Vec<usize> = state.dirty_top_ptr_offsets.drain().collect();
        for offset in top {
            state.try_coalesce_top_at(offset);
        }
        tracing::trace!("coalesced dirty bricks");
    }

    /// Like `coalesce_dirty_bricks` but walks every top-level pointer, regardless of dirty
    /// tracking. Used after a bulk load, where no per-write dirty bookkeeping was kept.
    pub fn coalesce_all(&self) {
        let mut state = self.state.write();
        let num_top = state.num_top_bricks;
        for top_flat in 0..num_top {
            let top_ptr = state.top_ptr(top_flat);
            if top_ptr.is_all_same() {
                continue;
            }
            let brick_index = top_ptr.brick_index();
            for local in 0..CELLS_PER_TL_BRICK {
                let offset = GridState::bottom_ptr_offset(brick_index, local);
                state.try_coalesce_bottom_at(offset);
            }
        }
        for top_flat in 0..num_top {
            let offset = state.top_ptr_offset(top_flat);
            state.try_coalesce_top_at(offset);
        }
        state.dirty_top_ptr_offsets.clear();
        state.dirty_bottom_ptr_offsets.clear();
        tracing::debug!("coalesced all bricks");
    }

    /// Walk the whole TL -> BL -> voxel tree and mark every page dirty, so the next
    /// `flush_to_gpu` republishes the entire grid. Used right after a bulk load.
    pub(crate) fn mark_all_dirty_for_gpu(&self) {
        let mut state = self.state.write();
        let top_alloc_offset = state.top_ptrs_alloc.offset;
        let num_top = state.num_top_bricks;
        state.buffer.mark_dirty(top_alloc_offset, num_top * BRICK_PTR_SIZE);

        let top_indices: Vec<u32> = state.top_brick_index_to_alloc.keys().copied().collect();
        for index in top_indices {
            state.buffer.mark_dirty(index as usize * TOP_BRICK_SIZE, TOP_BRICK_SIZE);
        }
        let bottom_indices: Vec<u32> = state.bottom_brick_index_to_alloc.keys().copied().collect();
        for index in bottom_indices {
            state.buffer.mark_dirty(index as usize * BOTTOM_BRICK_SIZE, BOTTOM_BRICK_SIZE);
        }
    }

    /// Flush every dirty page to the attached GPU mirror (a no-op if none is attached).
    pub fn flush_to_gpu(&self) -> Result<()> {
        self.state.write().buffer.flush_to_gpu()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.state.read().buffer.dirty_page_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsevox_core::MaterialEntry;

    fn test_materials() -> MaterialTable {
        let mut t = MaterialTable::new();
        t.set(VoxelId(1), MaterialEntry::OPAQUE_SOLID);
        t
    }

    #[test]
    fn air_everywhere_in_fresh_grid() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        assert_eq!(grid.get_voxel(IVec3::new(10, 10, 10)), VoxelId::AIR);
    }

    #[test]
    fn out_of_bounds_read_is_air() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        assert_eq!(grid.get_voxel(IVec3::new(-1, 0, 0)), VoxelId::AIR);
        assert_eq!(grid.get_voxel(IVec3::new(1000, 0, 0)), VoxelId::AIR);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        grid.set_voxel(IVec3::new(3, 3, 3), VoxelId(1)).unwrap();
        assert_eq!(grid.get_voxel(IVec3::new(3, 3, 3)), VoxelId(1));
        assert_eq!(grid.get_voxel(IVec3::new(3, 3, 4)), VoxelId::AIR);
    }

    #[test]
    fn out_of_bounds_write_is_invalid_coordinate() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        let err = grid.set_voxel(IVec3::new(-1, 0, 0), VoxelId(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidCoordinate { .. }));
    }

    #[test]
    fn missing_material_is_rejected() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        let err = grid.set_voxel(IVec3::ZERO, VoxelId(99)).unwrap_err();
        assert!(matches!(err, Error::MaterialMissing(99)));
    }

    #[test]
    fn scenario_a_coalesce_round_trip() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        grid.set_voxel(IVec3::new(3, 3, 3), VoxelId(1)).unwrap();
        grid.coalesce_dirty_bricks();
        assert_eq!(grid.get_voxel(IVec3::new(3, 3, 3)), VoxelId(1));

        grid.set_voxel(IVec3::new(3, 3, 3), VoxelId(0)).unwrap();
        grid.coalesce_dirty_bricks();

        let state = grid.state.read();
        for top_flat in 0..state.num_top_bricks {
            let ptr = state.top_ptr(top_flat);
            assert!(ptr.is_all_same());
            assert_eq!(ptr.uniform_voxel(), VoxelId::AIR);
        }
        assert!(state.top_brick_index_to_alloc.is_empty());
        assert!(state.bottom_brick_index_to_alloc.is_empty());
    }

    #[test]
    fn occupancy_bit_follows_material_visibility() {
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 20, test_materials()).unwrap();
        grid.set_voxel(IVec3::new(0, 0, 0), VoxelId(1)).unwrap();
        let state = grid.state.read();
        let top_ptr = state.top_ptr(0);
        let brick_index = top_ptr.brick_index();
        let bottom_ptr = state.bottom_ptr(brick_index, 0);
        let base = bottom_ptr.brick_index() as usize * BOTTOM_BRICK_SIZE;
        let word: u32 = state.buffer.read_struct(base);
        assert_eq!(word & 1, 1, "voxel 0's occupancy bit should be set (material is visible)");
    }

    #[test]
    fn coalesce_twice_is_idempotent() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 20, test_materials()).unwrap();
        grid.set_voxel(IVec3::new(3, 3, 3), VoxelId(1)).unwrap();
        grid.coalesce_dirty_bricks();
        let pages_before = grid.dirty_page_count();
        grid.coalesce_dirty_bricks();
        assert_eq!(grid.dirty_page_count(), pages_before);
    }

    #[test]
    fn dirty_page_count_is_bounded_after_single_write() {
        let grid = TwoLevelGrid::new(IVec3::splat(4), 1 << 22, test_materials()).unwrap();
        grid.flush_to_gpu().unwrap(); // clear construction-time dirtying
        grid.set_voxel(IVec3::new(5, 5, 5), VoxelId(1)).unwrap();
        // top ptr page + TL brick page(s) + BL brick page(s) + voxel page: a small constant, not
        // the whole arena.
        assert!(grid.dirty_page_count() < 16, "expected a bounded number of dirty pages");
    }
}
