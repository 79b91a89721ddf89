//! Fixed-capacity LRU cache over [`FindPathParams`], invalidated wholesale on grid change.

use hashbrown::HashMap;
use sparsevox_grid::TwoLevelGrid;

use crate::pathfinder::{find_path, FindPathParams, Path};

const DEFAULT_CAPACITY: usize = 64;

struct Entry {
    path: Path,
    last_access: u64,
}

/// Sits in front of [`find_path`], returning cached results for repeated queries.
///
/// Entirely invalidated whenever the grid's `change_generation` advances past the value recorded
/// at the last cache population, rather than tracking which regions a cached path touched.
pub struct PathCache {
    capacity: usize,
    entries: HashMap<FindPathParams, Entry>,
    clock: u64,
    grid_generation_at_last_use: Option<u64>,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
            grid_generation_at_last_use: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached path for `params`, or compute it via `find_path`, cache it, and return
    /// it. The entire cache is dropped first if `grid` changed since the last call.
    pub fn find_or_compute(&mut self, grid: &TwoLevelGrid, params: FindPathParams) -> Path {
        let current_generation = grid.change_generation();
        if self.grid_generation_at_last_use != Some(current_generation) {
            if !self.entries.is_empty() {
                tracing::debug!("grid changed, invalidating path cache");
            }
            self.entries.clear();
            self.grid_generation_at_last_use = Some(current_generation);
        }

        self.clock += 1;
        let now = self.clock;

        if let Some(entry) = self.entries.get_mut(&params) {
            entry.last_access = now;
            return entry.path.clone();
        }

        let path = find_path(grid, params);
        self.insert(params, path.clone(), now);
        path
    }

    fn insert(&mut self, params: FindPathParams, path: Path, now: u64) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&params) {
            if let Some(oldest) = self.entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| *k) {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(params, Entry { path, last_access: now });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;
    use sparsevox_core::{MaterialEntry, MaterialTable, VoxelId};

    fn flat_floor_grid(size: i32) -> TwoLevelGrid {
        let mut materials = MaterialTable::new();
        materials.set(VoxelId(1), MaterialEntry::OPAQUE_SOLID);
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 20, materials).unwrap();
        for x in 0..size {
            for z in 0..size {
                grid.set_voxel(IVec3::new(x, 0, z), VoxelId(1)).unwrap();
            }
        }
        grid
    }

    fn params(start: IVec3, goal: IVec3) -> FindPathParams {
        FindPathParams { start, goal, height: 2, weight_millis: 1000, max_nodes_to_search: 10_000, can_fly: false }
    }

    #[test]
    fn hit_returns_same_path_without_recomputing() {
        let grid = flat_floor_grid(16);
        let mut cache = PathCache::default();
        let p = params(IVec3::new(1, 1, 1), IVec3::new(5, 1, 1));
        let first = cache.find_or_compute(&grid, p);
        assert_eq!(cache.len(), 1);
        let second = cache.find_or_compute(&grid, p);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn grid_change_invalidates_whole_cache() {
        let grid = flat_floor_grid(16);
        let mut cache = PathCache::default();
        let p = params(IVec3::new(1, 1, 1), IVec3::new(5, 1, 1));
        cache.find_or_compute(&grid, p);
        assert_eq!(cache.len(), 1);

        grid.set_voxel(IVec3::new(8, 0, 8), VoxelId(1)).unwrap();
        cache.find_or_compute(&grid, p);
        assert_eq!(cache.len(), 1, "old entry should have been dropped and replaced by exactly one fresh entry");
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let grid = flat_floor_grid(16);
        let mut cache = PathCache::new(2);
        let a = params(IVec3::new(1, 1, 1), IVec3::new(2, 1, 1));
        let b = params(IVec3::new(1, 1, 1), IVec3::new(3, 1, 1));
        let c = params(IVec3::new(1, 1, 1), IVec3::new(4, 1, 1));

        cache.find_or_compute(&grid, a);
        cache.find_or_compute(&grid, b);
        cache.find_or_compute(&grid, a); // touch a, so b becomes least recently used
        cache.find_or_compute(&grid, c); // evicts b

        assert_eq!(cache.len(), 2);
        assert!(cache.entries.contains_key(&a));
        assert!(cache.entries.contains_key(&c));
        assert!(!cache.entries.contains_key(&b));
    }
}
