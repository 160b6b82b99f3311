//! The opaque per-cell value stored in chunks.
//!
//! The storage engine never interprets voxel contents beyond asking whether a
//! cell is empty. Emptiness drives octree occupancy: a node exists only while
//! its octant holds at least one non-empty voxel.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// A fixed-size value stored per voxel cell.
///
/// `Default::default()` is the empty voxel. Fresh chunks and chunks whose
/// page-in failed are filled with it.
pub trait Voxel: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    /// Returns `true` if this cell counts as empty space.
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Voxel for u8 {}
impl Voxel for u16 {}
impl Voxel for u32 {}

/// Compact voxel identifier (2 bytes). `VoxelId(0)` is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelId(pub u16);

impl VoxelId {
    /// The empty voxel.
    pub const EMPTY: VoxelId = VoxelId(0);
}

impl Voxel for VoxelId {
    fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for VoxelId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}
