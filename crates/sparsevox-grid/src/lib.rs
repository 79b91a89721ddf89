//! The Sketchy Buffer suballocator and the two-level sparse voxel grid built on top of it.
//!
//! - [`sketchy_buffer`] — CPU-authoritative byte arena with an offset suballocator and a
//!   page-level dirty tracker for an optional GPU mirror.
//! - [`grid`] — the two-level brick grid itself: `TwoLevelGrid`, brick pointers, and coalescing.
//! - [`dda`] — integer ray traversal over a `TwoLevelGrid`.
//! - [`save`] — binary serialization of a grid to/from a byte stream.

pub mod dda;
pub mod grid;
pub mod save;
pub mod sketchy_buffer;

pub use dda::{trace_ray, RayHit};
pub use grid::{BrickPtr, TwoLevelGrid, OCCUPANCY_WORDS};
pub use save::{load, save, SAVE_FORMAT_VERSION};
pub use sketchy_buffer::{Alloc, GpuMirror, NullGpuMirror, SketchyBuffer, PAGE_SIZE};
