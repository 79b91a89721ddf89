//! Core voxel identifier and material types.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Identifier for a voxel stored in the grid.
///
/// Voxel ID 0 is reserved for air (empty space). Appearance (color, roughness, etc.) is not
/// part of the core; it is owned by whatever consumes the material table's opaque IDs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct VoxelId(pub u32);

impl VoxelId {
    /// Air voxel (empty space).
    pub const AIR: Self = Self(0);

    /// Returns true if this voxel is air.
    #[inline]
    pub const fn is_air(self) -> bool {
        self.0 == 0
    }

    /// Returns true if this voxel is not air.
    #[inline]
    pub const fn is_solid(self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for VoxelId {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A material table entry, indexed by `VoxelId`.
///
/// Travels via `serde`/`bincode` in save files only; it is never read or written through the
/// Sketchy Buffer, so unlike `VoxelId` it does not derive `Pod`/`Zeroable` (`bool` is not a `Pod`
/// type: only 0x00 and 0x01 are valid bit patterns for it).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialEntry {
    /// Participates in surface occupancy; governs what the DDA and collision treat as solid.
    pub is_visible: bool,
    /// Participates in physics collision.
    pub is_solid: bool,
}

impl MaterialEntry {
    /// The entry conventionally used for voxel ID 0 (air): invisible, non-solid.
    pub const AIR: Self = Self {
        is_visible: false,
        is_solid: false,
    };

    /// A fully opaque, fully solid entry, the common case for "rock"-like materials.
    pub const OPAQUE_SOLID: Self = Self {
        is_visible: true,
        is_solid: true,
    };
}

/// A dense, index-by-`VoxelId` table of material properties.
///
/// The table must cover every voxel ID stored anywhere in a grid that references it; indexing
/// past the end is a defect (writing such a voxel ID is rejected with `MaterialMissing`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialTable {
    entries: Vec<MaterialEntry>,
}

impl MaterialTable {
    /// Create a table with entry 0 set to `MaterialEntry::AIR` and nothing else.
    pub fn new() -> Self {
        Self {
            entries: vec![MaterialEntry::AIR],
        }
    }

    /// Create a table from an explicit dense vector of entries. `entries[0]` should usually be
    /// `MaterialEntry::AIR` to match the grid's air convention, but this is not enforced here.
    pub fn from_entries(entries: Vec<MaterialEntry>) -> Self {
        Self { entries }
    }

    /// Number of entries in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a voxel ID's material entry, if it's within range.
    #[inline]
    pub fn get(&self, voxel: VoxelId) -> Option<MaterialEntry> {
        self.entries.get(voxel.0 as usize).copied()
    }

    /// Append or overwrite the entry for `voxel`, growing the table if needed.
    pub fn set(&mut self, voxel: VoxelId, entry: MaterialEntry) {
        let index = voxel.0 as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, MaterialEntry::default());
        }
        self.entries[index] = entry;
    }

    pub fn as_slice(&self) -> &[MaterialEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_id_air() {
        assert!(VoxelId::AIR.is_air());
        assert!(!VoxelId::AIR.is_solid());
    }

    #[test]
    fn voxel_id_solid() {
        let stone = VoxelId(1);
        assert!(!stone.is_air());
        assert!(stone.is_solid());
    }

    #[test]
    fn material_table_grows_on_set() {
        let mut table = MaterialTable::new();
        assert_eq!(table.len(), 1);
        table.set(VoxelId(3), MaterialEntry::OPAQUE_SOLID);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(VoxelId(3)), Some(MaterialEntry::OPAQUE_SOLID));
        assert_eq!(table.get(VoxelId(1)), Some(MaterialEntry::default()));
        assert_eq!(table.get(VoxelId(100)), None);
    }
}
