//! Binary save/restore of a [`TwoLevelGrid`].
//!
//! Wire order: a `u32` format version, the material table (length-prefixed), `topLevelDims`
//! (three `i32`), then the top-level pointer array in z-y-x order, each pointer either a uniform
//! voxel or (recursively) a top brick of 512 bottom pointers, each bottom pointer either a
//! uniform voxel or a bottom brick (16-`u32` occupancy bitmap followed by 512 voxel IDs).
//!
//! No attempt is made to preserve the corpus's unversioned format exactly; a version tag is
//! prepended so a future format change can be detected instead of silently misread.

use std::io::{Read, Write};

use glam::IVec3;
use serde::{Deserialize, Serialize};
use sparsevox_core::coords::{CELLS_PER_BL_BRICK, CELLS_PER_TL_BRICK};
use sparsevox_core::{Error, MaterialEntry, MaterialTable, Result, VoxelId};

use crate::grid::TwoLevelGrid;

/// Bumped whenever the wire format changes incompatibly.
pub const SAVE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Header {
    version: u32,
    materials: Vec<MaterialEntry>,
    top_level_dims: [i32; 3],
}

const TAG_UNIFORM: u8 = 0;
const TAG_BRICK: u8 = 1;

/// Serialize `grid` to `writer`.
pub fn save(grid: &TwoLevelGrid, writer: &mut impl Write) -> Result<()> {
    let materials = grid.material_table();
    let top_level_dims = grid.top_level_dims();
    let header = Header {
        version: SAVE_FORMAT_VERSION,
        materials: materials.as_slice().to_vec(),
        top_level_dims: [top_level_dims.x, top_level_dims.y, top_level_dims.z],
    };
    let encoded = bincode::serialize(&header)
        .map_err(|e| Error::SerializationInvalid(format!("header: {e}")))?;
    writer.write_all(&(encoded.len() as u64).to_le_bytes())?;
    writer.write_all(&encoded)?;

    let num_top = (top_level_dims.x * top_level_dims.y * top_level_dims.z).max(0) as usize;
    for top_flat in 0..num_top {
        let p = top_brick_origin(top_flat, top_level_dims);
        write_top_brick(grid, p, writer)?;
    }

    Ok(())
}

fn write_top_brick(grid: &TwoLevelGrid, top_origin: IVec3, writer: &mut impl Write) -> Result<()> {
    // Use the top-left corner voxel to detect a uniform top brick cheaply via get_voxel; a false
    // positive (every bottom brick individually uniform with the same value but the top brick
    // itself not collapsed) is still correctly handled by recursing, it just costs more bytes.
    if let Some(uniform) = uniform_region_value(grid, top_origin, sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE) {
        writer.write_all(&[TAG_UNIFORM])?;
        writer.write_all(&uniform.0.to_le_bytes())?;
        return Ok(());
    }

    writer.write_all(&[TAG_BRICK])?;
    for bl_flat in 0..CELLS_PER_TL_BRICK {
        let bl_local = unflatten_tl_local(bl_flat);
        let bl_origin = top_origin + bl_local * sparsevox_core::coords::BL_SIDE;
        write_bottom_brick(grid, bl_origin, writer)?;
    }
    Ok(())
}

fn write_bottom_brick(grid: &TwoLevelGrid, bl_origin: IVec3, writer: &mut impl Write) -> Result<()> {
    if let Some(uniform) = uniform_region_value(grid, bl_origin, sparsevox_core::coords::BL_SIDE) {
        writer.write_all(&[TAG_UNIFORM])?;
        writer.write_all(&uniform.0.to_le_bytes())?;
        return Ok(());
    }

    writer.write_all(&[TAG_BRICK])?;
    let materials = grid.material_table();
    let mut occupancy = [0u32; crate::grid::OCCUPANCY_WORDS];
    let mut voxels = [0u32; CELLS_PER_BL_BRICK];
    for local_flat in 0..CELLS_PER_BL_BRICK {
        let local = unflatten_bl_local(local_flat);
        let v = grid.get_voxel(bl_origin + local);
        voxels[local_flat] = v.0;
        if materials.get(v).unwrap_or(MaterialEntry::AIR).is_visible {
            occupancy[local_flat / 32] |= 1 << (local_flat % 32);
        }
    }
    for word in occupancy {
        writer.write_all(&word.to_le_bytes())?;
    }
    for voxel in voxels {
        writer.write_all(&voxel.to_le_bytes())?;
    }
    Ok(())
}

fn uniform_region_value(grid: &TwoLevelGrid, origin: IVec3, side: i32) -> Option<VoxelId> {
    let first = grid.get_voxel(origin);
    for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                if grid.get_voxel(origin + IVec3::new(x, y, z)) != first {
                    return None;
                }
            }
        }
    }
    Some(first)
}

fn top_brick_origin(top_flat: usize, top_level_dims: IVec3) -> IVec3 {
    let x = top_flat as i32 % top_level_dims.x;
    let y = (top_flat as i32 / top_level_dims.x) % top_level_dims.y;
    let z = top_flat as i32 / (top_level_dims.x * top_level_dims.y);
    IVec3::new(x, y, z) * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE
}

fn unflatten_tl_local(flat: usize) -> IVec3 {
    let side = sparsevox_core::coords::TL_SIDE;
    let x = flat as i32 % side;
    let y = (flat as i32 / side) % side;
    let z = flat as i32 / (side * side);
    IVec3::new(x, y, z)
}

fn unflatten_bl_local(flat: usize) -> IVec3 {
    let side = sparsevox_core::coords::BL_SIDE;
    let x = flat as i32 % side;
    let y = (flat as i32 / side) % side;
    let z = flat as i32 / (side * side);
    IVec3::new(x, y, z)
}

/// Deserialize a grid from `reader`. On any truncation or tag mismatch the grid is not mutated
/// and the error is returned; the caller's existing grid (if any) is left untouched since this
/// constructs a fresh one.
pub fn load(reader: &mut impl Read, buffer_capacity_bytes: usize) -> Result<TwoLevelGrid> {
    let mut len_bytes = [0u8; 8];
    read_exact(reader, &mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;
    let mut encoded = vec![0u8; len];
    read_exact(reader, &mut encoded)?;
    let header: Header = bincode::deserialize(&encoded)
        .map_err(|e| Error::SerializationInvalid(format!("header: {e}")))?;

    if header.version != SAVE_FORMAT_VERSION {
        return Err(Error::SerializationInvalid(format!(
            "unsupported save format version {} (expected {})",
            header.version, SAVE_FORMAT_VERSION
        )));
    }

    let top_level_dims = IVec3::new(
        header.top_level_dims[0],
        header.top_level_dims[1],
        header.top_level_dims[2],
    );
    let materials = MaterialTable::from_entries(header.materials);
    let grid = TwoLevelGrid::new(top_level_dims, buffer_capacity_bytes, materials)?;

    let num_top = (top_level_dims.x * top_level_dims.y * top_level_dims.z).max(0) as usize;
    for top_flat in 0..num_top {
        let p = top_brick_origin(top_flat, top_level_dims);
        read_top_brick(&grid, p, reader)?;
    }

    grid.coalesce_all();
    grid.mark_all_dirty_for_gpu();

    tracing::debug!(top_level_dims = ?top_level_dims, "loaded two-level grid");
    Ok(grid)
}

fn read_top_brick(grid: &TwoLevelGrid, top_origin: IVec3, reader: &mut impl Read) -> Result<()> {
    let tag = read_tag(reader)?;
    match tag {
        TAG_UNIFORM => {
            let voxel = read_voxel_id(reader)?;
            if voxel.is_air() {
                return Ok(());
            }
            fill_region_no_dirty(grid, top_origin, sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE, voxel)
        }
        TAG_BRICK => {
            for bl_flat in 0..CELLS_PER_TL_BRICK {
                let bl_local = unflatten_tl_local(bl_flat);
                let bl_origin = top_origin + bl_local * sparsevox_core::coords::BL_SIDE;
                read_bottom_brick(grid, bl_origin, reader)?;
            }
            Ok(())
        }
        other => Err(Error::SerializationInvalid(format!("unexpected tag byte {other}"))),
    }
}

fn read_bottom_brick(grid: &TwoLevelGrid, bl_origin: IVec3, reader: &mut impl Read) -> Result<()> {
    let tag = read_tag(reader)?;
    match tag {
        TAG_UNIFORM => {
            let voxel = read_voxel_id(reader)?;
            if voxel.is_air() {
                return Ok(());
            }
            fill_region_no_dirty(grid, bl_origin, sparsevox_core::coords::BL_SIDE, voxel)
        }
        TAG_BRICK => {
            let mut occupancy = [0u32; crate::grid::OCCUPANCY_WORDS];
            for word in &mut occupancy {
                let mut bytes = [0u8; 4];
                read_exact(reader, &mut bytes)?;
                *word = u32::from_le_bytes(bytes);
            }
            for local_flat in 0..CELLS_PER_BL_BRICK {
                let mut bytes = [0u8; 4];
                read_exact(reader, &mut bytes)?;
                let voxel = VoxelId(u32::from_le_bytes(bytes));
                if voxel.is_air() {
                    continue;
                }
                let local = unflatten_bl_local(local_flat);
                grid.set_voxel_no_dirty(bl_origin + local, voxel)?;
            }
            Ok(())
        }
        other => Err(Error::SerializationInvalid(format!("unexpected tag byte {other}"))),
    }
}

fn fill_region_no_dirty(grid: &TwoLevelGrid, origin: IVec3, side: i32, voxel: VoxelId) -> Result<()> {
    for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                grid.set_voxel_no_dirty(origin + IVec3::new(x, y, z), voxel)?;
            }
        }
    }
    Ok(())
}

fn read_tag(reader: &mut impl Read) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte)?;
    Ok(byte[0])
}

fn read_voxel_id(reader: &mut impl Read) -> Result<VoxelId> {
    let mut bytes = [0u8; 4];
    read_exact(reader, &mut bytes)?;
    Ok(VoxelId(u32::from_le_bytes(bytes)))
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|_| Error::SerializationTruncated("unexpected end of save data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparsevox_core::MaterialEntry;

    fn test_materials() -> MaterialTable {
        let mut t = MaterialTable::new();
        t.set(VoxelId(1), MaterialEntry::OPAQUE_SOLID);
        t.set(VoxelId(2), MaterialEntry::OPAQUE_SOLID);
        t
    }

    #[test]
    fn scenario_f_round_trip_with_scattered_writes_and_uniform_regions() {
        let grid = TwoLevelGrid::new(IVec3::splat(2), 1 << 22, test_materials()).unwrap();
        for i in 0..200 {
            let p = IVec3::new(i % 16, (i / 16) % 16, (i / 256) % 16);
            grid.set_voxel(p, VoxelId(1 + (i % 2) as u32)).unwrap();
        }
        grid.coalesce_all();

        let mut bytes = Vec::new();
        save(&grid, &mut bytes).unwrap();

        let loaded = load(&mut bytes.as_slice(), 1 << 22).unwrap();

        let dims = grid.top_level_dims();
        let side = dims.x * sparsevox_core::coords::VOXELS_PER_TOP_BRICK_SIDE;
        for z in 0..side {
            for y in 0..side {
                for x in 0..side {
                    let p = IVec3::new(x, y, z);
                    assert_eq!(grid.get_voxel(p), loaded.get_voxel(p), "mismatch at {p:?}");
                }
            }
        }
    }

    #[test]
    fn load_rejects_wrong_version() {
        let header = Header { version: 999, materials: vec![], top_level_dims: [1, 1, 1] };
        let encoded = bincode::serialize(&header).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&encoded);

        let err = load(&mut bytes.as_slice(), 1 << 16).unwrap_err();
        assert!(matches!(err, Error::SerializationInvalid(_)));
    }

    #[test]
    fn load_rejects_truncated_data() {
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 16, test_materials()).unwrap();
        let mut bytes = Vec::new();
        save(&grid, &mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);

        let err = load(&mut bytes.as_slice(), 1 << 16).unwrap_err();
        assert!(matches!(err, Error::SerializationTruncated(_)));
    }

    #[test]
    fn loaded_grid_is_coalesced() {
        let grid = TwoLevelGrid::new(IVec3::splat(1), 1 << 16, test_materials()).unwrap();
        let mut bytes = Vec::new();
        save(&grid, &mut bytes).unwrap();
        let loaded = load(&mut bytes.as_slice(), 1 << 16).unwrap();
        assert_eq!(loaded.dirty_page_count() > 0, true, "load should mark pages dirty for re-upload");
    }
}
