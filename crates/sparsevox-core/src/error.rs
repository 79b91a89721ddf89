//! Error types shared across the core, grid, and physics crates.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The Sketchy Buffer has no space left for a requested allocation.
    #[error("out of arena space: requested {requested} bytes, {available} available")]
    OutOfArena { requested: usize, available: usize },

    /// A brick could not be allocated; the underlying cause is the same as `OutOfArena` but the
    /// call site is brick-shaped rather than raw-bytes-shaped.
    #[error("brick allocation exhausted")]
    BrickAllocExhausted,

    /// `setVoxel` (or an equivalent mutating call) was given an out-of-bounds coordinate.
    #[error("coordinate {x}, {y}, {z} is out of bounds")]
    InvalidCoordinate { x: i32, y: i32, z: i32 },

    /// A voxel ID was written with no corresponding material table entry.
    #[error("voxel id {0} has no material table entry")]
    MaterialMissing(u32),

    /// A save stream ended before a complete grid could be read.
    #[error("save data truncated: {0}")]
    SerializationTruncated(String),

    /// A save stream's tag, version, or lengths did not match what was expected.
    #[error("save data invalid: {0}")]
    SerializationInvalid(String),

    /// I/O error encountered while reading or writing a save stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// GPU mirror error, reported by a caller-supplied `GpuMirror` implementation.
    #[error("GPU mirror error: {0}")]
    Gpu(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
