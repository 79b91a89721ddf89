//! Core types, math, and errors shared by the grid and physics crates.
//!
//! This crate provides the foundations the rest of the workspace builds on:
//! - Voxel and material types (`types`)
//! - Grid coordinate decomposition (`coords`)
//! - The shared error taxonomy (`error`)

pub mod coords;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{MaterialEntry, MaterialTable, VoxelId};
