//! Grid shape adapter, weighted A* pathfinder, and path cache over a `sparsevox_grid::TwoLevelGrid`.

pub mod path_cache;
pub mod pathfinder;
pub mod shape;

pub use path_cache::PathCache;
pub use pathfinder::{find_path, FindPathParams, Path};
pub use shape::{GridQueryDispatcher, GridRayHit, GridShape, Stats, SubShapeId};
