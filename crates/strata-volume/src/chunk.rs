//! Dense fixed-size voxel blocks, the unit of paging and eviction.
//!
//! A chunk covers exactly one chunk-grid cell of `size³` voxels where `size`
//! is a power of two fixed by the owning volume. Voxel coordinates map to
//! chunk coordinates by an arithmetic right shift, so negative coordinates
//! floor correctly without branches.

use glam::IVec3;

use crate::region::Region;
use crate::voxel::Voxel;

/// Position of a chunk on the chunk grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing the voxel at `pos` for chunks of `1 << size_log2`.
    pub fn from_voxel(pos: IVec3, size_log2: u32) -> Self {
        Self {
            x: pos.x >> size_log2,
            y: pos.y >> size_log2,
            z: pos.z >> size_log2,
        }
    }

    /// Neighboring chunk offset by `(dx, dy, dz)`.
    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }

    /// Lowest voxel coordinate covered by this chunk.
    pub fn lower_corner(self, size_log2: u32) -> IVec3 {
        IVec3::new(self.x << size_log2, self.y << size_log2, self.z << size_log2)
    }

    /// The voxel region covered by this chunk.
    pub fn region(self, size_log2: u32) -> Region {
        let lower = self.lower_corner(size_log2);
        let edge = (1i32 << size_log2) - 1;
        Region::from_ordered(lower, lower + IVec3::splat(edge))
    }

    pub fn as_ivec3(self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }
}

/// Lifecycle state of a resident chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChunkState {
    /// Contents match what the pager last provided or persisted.
    #[default]
    Clean,
    /// Modified since page-in or the last successful page-out.
    Dirty,
    /// Selected for eviction; no further access is allowed.
    Evicting,
}

/// A dense cube of voxels.
#[derive(Clone, Debug)]
pub struct Chunk<V> {
    pos: ChunkPos,
    region: Region,
    size_log2: u32,
    voxels: Box<[V]>,
    state: ChunkState,
}

impl<V: Voxel> Chunk<V> {
    /// Creates an empty chunk at `pos` with edge length `1 << size_log2`.
    pub fn new(pos: ChunkPos, size_log2: u32) -> Self {
        let volume = 1usize << (3 * size_log2);
        Self {
            pos,
            region: pos.region(size_log2),
            size_log2,
            voxels: vec![V::default(); volume].into_boxed_slice(),
            state: ChunkState::Clean,
        }
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Edge length in voxels.
    pub fn size(&self) -> u32 {
        1 << self.size_log2
    }

    pub fn size_log2(&self) -> u32 {
        self.size_log2
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == ChunkState::Dirty
    }

    pub(crate) fn set_state(&mut self, state: ChunkState) {
        self.state = state;
    }

    pub(crate) fn mark_dirty(&mut self) {
        debug_assert_ne!(self.state, ChunkState::Evicting, "write to evicting chunk {:?}", self.pos);
        self.state = ChunkState::Dirty;
    }

    /// Voxel at chunk-local `(x, y, z)`; each coordinate must be below [`Chunk::size`].
    pub fn get(&self, x: u32, y: u32, z: u32) -> V {
        self.voxels[self.linear_index(x, y, z)]
    }

    /// Writes a chunk-local voxel and returns the previous value.
    ///
    /// Does not touch the chunk state: the volume decides whether the write
    /// counts as a change.
    pub fn set(&mut self, x: u32, y: u32, z: u32, voxel: V) -> V {
        let index = self.linear_index(x, y, z);
        std::mem::replace(&mut self.voxels[index], voxel)
    }

    /// Voxel at a world position inside this chunk's region.
    pub fn get_world(&self, pos: IVec3) -> V {
        let local = self.local(pos);
        self.get(local.x as u32, local.y as u32, local.z as u32)
    }

    /// World-position counterpart of [`Chunk::set`].
    pub fn set_world(&mut self, pos: IVec3, voxel: V) -> V {
        let local = self.local(pos);
        self.set(local.x as u32, local.y as u32, local.z as u32, voxel)
    }

    /// Overwrites every voxel.
    pub fn fill(&mut self, voxel: V) {
        self.voxels.fill(voxel);
    }

    /// Resets every voxel to the empty default.
    pub fn clear(&mut self) {
        self.fill(V::default());
    }

    /// Raw voxel buffer, x varying fastest, then y, then z.
    pub fn voxels(&self) -> &[V] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [V] {
        &mut self.voxels
    }

    /// Number of non-empty voxels.
    pub fn solid_count(&self) -> u32 {
        self.voxels.iter().filter(|v| !v.is_empty()).count() as u32
    }

    /// Bytes held by the voxel buffer.
    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of_val(&*self.voxels)
    }

    /// Converts a world position to chunk-local coordinates.
    pub(crate) fn local(&self, pos: IVec3) -> IVec3 {
        debug_assert!(self.region.contains_point(pos), "{pos} outside {}", self.region);
        pos & IVec3::splat((1 << self.size_log2) - 1)
    }

    fn linear_index(&self, x: u32, y: u32, z: u32) -> usize {
        let size = 1u32 << self.size_log2;
        debug_assert!(x < size && y < size && z < size);
        (x | (y << self.size_log2) | (z << (2 * self.size_log2))) as usize
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
