//! Cursor over a [`PagedVolume`] for neighbourhood access.
//!
//! A [`Sampler`] caches the chunk under its current position, so reads and
//! unit moves that stay inside that chunk skip the chunk table entirely. The
//! cached chunk is pinned for as long as the sampler holds it and cannot be
//! evicted underneath it.
//!
//! Samplers are meant to be owned by one thread. Each read takes the chunk's
//! read lock briefly, so other threads may keep writing the same chunk.

use std::sync::Arc;

use glam::IVec3;

use crate::change::ChangeSet;
use crate::chunk::ChunkPos;
use crate::error::VolumeError;
use crate::paged_volume::{ChunkSlot, PagedVolume, write_voxel};
use crate::voxel::Voxel;

/// Repositionable read/write cursor into a volume.
pub struct Sampler<'a, V: Voxel> {
    volume: &'a PagedVolume<V>,
    pos: IVec3,
    slot: Option<Arc<ChunkSlot<V>>>,
}

impl<'a, V: Voxel> Sampler<'a, V> {
    /// Creates an unpositioned sampler. Call [`Sampler::set_position`] first.
    pub fn new(volume: &'a PagedVolume<V>) -> Self {
        Self {
            volume,
            pos: IVec3::ZERO,
            slot: None,
        }
    }

    /// Current absolute voxel position.
    pub fn position(&self) -> IVec3 {
        self.pos
    }

    /// Whether the sampler currently pins a chunk.
    pub fn is_positioned(&self) -> bool {
        self.slot.is_some()
    }

    /// Moves to `(x, y, z)`, paging in its chunk if needed.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] outside the volume's max region. The
    /// sampler is left unpositioned and releases its chunk.
    pub fn set_position(&mut self, x: i32, y: i32, z: i32) -> Result<(), VolumeError> {
        self.move_to(IVec3::new(x, y, z))
    }

    /// Moves by an arbitrary offset.
    ///
    /// # Errors
    ///
    /// As for [`Sampler::set_position`]. An offset that overflows `i32` is
    /// out of bounds as well.
    pub fn move_by(&mut self, dx: i32, dy: i32, dz: i32) -> Result<(), VolumeError> {
        match self.offset(dx, dy, dz) {
            Ok(target) => self.move_to(target),
            Err(e) => {
                self.slot = None;
                Err(e)
            }
        }
    }

    pub fn move_positive_x(&mut self) -> Result<(), VolumeError> {
        self.move_by(1, 0, 0)
    }

    pub fn move_positive_y(&mut self) -> Result<(), VolumeError> {
        self.move_by(0, 1, 0)
    }

    pub fn move_positive_z(&mut self) -> Result<(), VolumeError> {
        self.move_by(0, 0, 1)
    }

    pub fn move_negative_x(&mut self) -> Result<(), VolumeError> {
        self.move_by(-1, 0, 0)
    }

    pub fn move_negative_y(&mut self) -> Result<(), VolumeError> {
        self.move_by(0, -1, 0)
    }

    pub fn move_negative_z(&mut self) -> Result<(), VolumeError> {
        self.move_by(0, 0, -1)
    }

    /// Voxel at the current position. An unpositioned sampler reads empty.
    pub fn voxel(&self) -> V {
        match &self.slot {
            Some(slot) => slot.read().get_world(self.pos),
            None => V::default(),
        }
    }

    /// Voxel at an offset from the current position without moving.
    ///
    /// Served from the cached chunk when the neighbour lies inside it.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] if the neighbour is outside the max region.
    pub fn peek(&self, dx: i32, dy: i32, dz: i32) -> Result<V, VolumeError> {
        let target = self.offset(dx, dy, dz)?;
        if let Some(slot) = &self.slot {
            if self.covers(slot, target) {
                return Ok(slot.read().get_world(target));
            }
        }
        self.volume.get_voxel(target.x, target.y, target.z)
    }

    /// Writes at the current position through the cached chunk.
    ///
    /// Same semantics as [`PagedVolume::set_voxel`], without the chunk lookup.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] if the sampler is unpositioned.
    pub fn set_voxel(&mut self, voxel: V) -> Result<bool, VolumeError> {
        let Some(slot) = &self.slot else {
            return Err(VolumeError::out_of_bounds(self.pos));
        };
        let mut changes = ChangeSet::new();
        let changed = write_voxel(&mut slot.write(), self.pos, voxel, &mut changes);
        self.volume.commit(&changes);
        Ok(changed)
    }

    fn offset(&self, dx: i32, dy: i32, dz: i32) -> Result<IVec3, VolumeError> {
        let pos = self.pos;
        match (pos.x.checked_add(dx), pos.y.checked_add(dy), pos.z.checked_add(dz)) {
            (Some(x), Some(y), Some(z)) => Ok(IVec3::new(x, y, z)),
            _ => Err(VolumeError::out_of_bounds(IVec3::new(
                pos.x.saturating_add(dx),
                pos.y.saturating_add(dy),
                pos.z.saturating_add(dz),
            ))),
        }
    }

    fn covers(&self, slot: &ChunkSlot<V>, pos: IVec3) -> bool {
        ChunkPos::from_voxel(pos, self.volume.chunk_log2()) == slot.pos()
    }

    fn move_to(&mut self, target: IVec3) -> Result<(), VolumeError> {
        if let Err(e) = self.volume.check_bounds(target) {
            self.slot = None;
            self.pos = target;
            return Err(e);
        }
        self.pos = target;
        let stays = self.slot.as_ref().is_some_and(|slot| self.covers(slot, target));
        if !stays {
            // Release the old chunk first so it can be evicted to make room.
            self.slot = None;
            let chunk = ChunkPos::from_voxel(target, self.volume.chunk_log2());
            let (slot, _) = self.volume.resolve(chunk);
            self.slot = Some(slot);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
