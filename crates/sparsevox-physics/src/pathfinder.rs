//! Weighted A* over a grid's implicit walkability graph.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::{IVec3, Vec3};
use hashbrown::HashMap;
use sparsevox_core::VoxelId;
use sparsevox_grid::TwoLevelGrid;

/// Parameters identifying a single pathfinding request; also the Path Cache's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FindPathParams {
    pub start: IVec3,
    pub goal: IVec3,
    /// Voxels of head clearance the agent needs above its feet.
    pub height: i32,
    /// Heuristic weight, as a fixed-point thousandths value so the struct can derive `Hash`/`Eq`
    /// (typical range 1.0-1.5, i.e. 1000-1500).
    pub weight_millis: u32,
    pub max_nodes_to_search: u32,
    pub can_fly: bool,
}

impl FindPathParams {
    pub fn weight(&self) -> f32 {
        self.weight_millis as f32 / 1000.0
    }
}

/// A path as a sequence of world-space voxel-center points, in travel order.
pub type Path = Vec<Vec3>;

struct FrontierNode {
    pos: IVec3,
    priority: f32,
    goal: IVec3,
}

impl PartialEq for FrontierNode {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.pos == other.pos
    }
}
impl Eq for FrontierNode {}

impl PartialOrd for FrontierNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the lowest priority first, so invert the comparison.
        // Ties (within 1e-3) break toward the candidate closer to goal (squared Euclidean).
        if (self.priority - other.priority).abs() < 1e-3 {
            let a = self.pos.as_vec3() - self.goal.as_vec3();
            let b = other.pos.as_vec3() - other.goal.as_vec3();
            b.length_squared().partial_cmp(&a.length_squared()).unwrap_or(Ordering::Equal)
        } else {
            other.priority.partial_cmp(&self.priority).unwrap_or(Ordering::Equal)
        }
    }
}

fn is_solid(grid: &TwoLevelGrid, p: IVec3) -> bool {
    grid.get_voxel(p).is_solid()
}

fn fits_clearance(grid: &TwoLevelGrid, pos: IVec3, height: i32) -> bool {
    (0..height).all(|i| !is_solid(grid, pos + IVec3::new(0, i, 0)))
}

fn neighbors_walking(grid: &TwoLevelGrid, pos: IVec3, height: i32) -> Vec<IVec3> {
    let mut neighbors = Vec::new();
    if !fits_clearance(grid, pos, height) {
        return neighbors;
    }

    let has_floor = is_solid(grid, pos + IVec3::new(0, -1, 0));

    if has_floor || is_solid(grid, pos + IVec3::new(1, -1, 0)) {
        neighbors.push(pos + IVec3::new(1, 0, 0));
    }
    if has_floor || is_solid(grid, pos + IVec3::new(-1, -1, 0)) {
        neighbors.push(pos + IVec3::new(-1, 0, 0));
    }
    if has_floor || is_solid(grid, pos + IVec3::new(0, -1, 1)) {
        neighbors.push(pos + IVec3::new(0, 0, 1));
    }
    if has_floor || is_solid(grid, pos + IVec3::new(0, -1, -1)) {
        neighbors.push(pos + IVec3::new(0, 0, -1));
    }

    if has_floor {
        neighbors.push(pos + IVec3::new(0, 1, 0));
    }
    neighbors.push(pos + IVec3::new(0, -1, 0));

    neighbors
}

fn neighbors_flying(grid: &TwoLevelGrid, pos: IVec3, height: i32) -> Vec<IVec3> {
    if !fits_clearance(grid, pos, height) {
        return Vec::new();
    }
    vec![
        pos + IVec3::new(1, 0, 0),
        pos + IVec3::new(-1, 0, 0),
        pos + IVec3::new(0, 1, 0),
        pos + IVec3::new(0, -1, 0),
        pos + IVec3::new(0, 0, 1),
        pos + IVec3::new(0, 0, -1),
    ]
}

fn determine_cost_walking(grid: &TwoLevelGrid, from: IVec3, to: IVec3) -> f32 {
    if from.y > to.y {
        return 0.5;
    }
    if !is_solid(grid, to - IVec3::new(0, 1, 0)) {
        return 1.125;
    }
    1.0
}

fn heuristic_cost(from: IVec3, to: IVec3) -> f32 {
    (from - to).abs().element_sum() as f32
}

fn reconstruct_path(came_from: &HashMap<IVec3, IVec3>, start: IVec3, goal: IVec3) -> Path {
    let mut path = Vec::new();
    let mut current = goal;
    while current != start {
        path.push(current.as_vec3() + Vec3::splat(0.5));
        current = came_from[&current];
    }
    path.reverse();
    path
}

/// Run weighted A* for `params` over `grid`. Returns an empty path if the frontier empties or the
/// node budget is exhausted before `goal` is reached; this is a normal outcome, not an error.
pub fn find_path(grid: &TwoLevelGrid, params: FindPathParams) -> Path {
    let mut frontier = BinaryHeap::new();
    let mut came_from: HashMap<IVec3, IVec3> = HashMap::new();
    let mut cost_so_far: HashMap<IVec3, f32> = HashMap::new();

    frontier.push(FrontierNode { pos: params.start, priority: 0.0, goal: params.goal });
    cost_so_far.insert(params.start, 0.0);
    came_from.insert(params.start, params.start);

    let weight = params.weight();

    for _ in 0..params.max_nodes_to_search {
        let Some(current_node) = frontier.pop() else { break };
        let current = current_node.pos;
        let current_cost = cost_so_far[&current];

        let neighbors = if params.can_fly {
            neighbors_flying(grid, current, params.height)
        } else {
            neighbors_walking(grid, current, params.height)
        };

        for next in neighbors {
            let step_cost = if params.can_fly { 1.0 } else { determine_cost_walking(grid, current, next) };
            let new_cost = current_cost + step_cost;

            let is_better = match cost_so_far.get(&next) {
                Some(&existing) => new_cost < existing,
                None => true,
            };
            if is_better {
                let priority = new_cost + weight * heuristic_cost(next, params.goal);
                frontier.push(FrontierNode { pos: next, priority, goal: params.goal });
                cost_so_far.insert(next, new_cost);
                came_from.insert(next, current);
            }

            if next == params.goal {
                return reconstruct_path(&came_from, params.start, params.goal);
            }
        }
    }

    tracing::debug!(?params.start, ?params.goal, "pathfinder exhausted budget without reaching goal");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsevox_core::MaterialEntry;
    use sparsevox_core::MaterialTable;

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

    fn default_params(start: IVec3, goal: IVec3) -> FindPathParams {
        FindPathParams { start, goal, height: 2, weight_millis: 1000, max_nodes_to_search: 10_000, can_fly: false }
    }

    #[test]
    fn finds_straight_line_path_on_flat_floor() {
        let grid = flat_floor_grid(16);
        let path = find_path(&grid, default_params(IVec3::new(1, 1, 1), IVec3::new(5, 1, 1)));
        assert!(!path.is_empty());
        assert_eq!(*path.last().unwrap(), Vec3::new(5.5, 1.5, 1.5));
    }

    #[test]
    fn no_path_returns_empty_not_error() {
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 20, MaterialTable::new()).unwrap();
        let path = find_path(&grid, default_params(IVec3::new(0, 0, 0), IVec3::new(1000, 1000, 1000)));
        assert!(path.is_empty());
    }

    #[test]
    fn budget_exhaustion_returns_empty() {
        let grid = flat_floor_grid(64);
        let mut params = default_params(IVec3::new(1, 1, 1), IVec3::new(60, 1, 1));
        params.max_nodes_to_search = 2;
        let path = find_path(&grid, params);
        assert!(path.is_empty());
    }

    #[test]
    fn flying_agent_moves_vertically() {
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 20, MaterialTable::new()).unwrap();
        let mut params = default_params(IVec3::new(1, 1, 1), IVec3::new(1, 5, 1));
        params.can_fly = true;
        let path = find_path(&grid, params);
        assert!(!path.is_empty());
        assert_eq!(*path.last().unwrap(), Vec3::new(1.5, 5.5, 1.5));
    }

    #[test]
    fn path_consecutive_points_are_adjacent_voxel_centers() {
        let grid = flat_floor_grid(16);
        let path = find_path(&grid, default_params(IVec3::new(1, 1, 1), IVec3::new(5, 1, 3)));
        assert!(!path.is_empty());
        for pair in path.windows(2) {
            let delta = (pair[1] - pair[0]).abs();
            let steps = (delta.x > 0.01) as i32 + (delta.y > 0.01) as i32 + (delta.z > 0.01) as i32;
            assert!(steps <= 1, "non-adjacent step between {:?} and {:?}", pair[0], pair[1]);
        }
    }
}
