//! The paging contract between a volume and its backing store.
//!
//! A [`Pager`] fills chunks on a cache miss and persists dirty chunks when
//! they are evicted or flushed. Both calls run synchronously on the thread
//! that triggered them, with the volume's chunk table unlocked; only the
//! chunk being paged is locked. A pager must not call back into the volume
//! that invoked it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use glam::IVec3;
use rustc_hash::FxHashMap;

use crate::chunk::{Chunk, ChunkPos};
use crate::error::PagerError;
use crate::region::Region;
use crate::voxel::Voxel;

/// Supplies and persists chunk contents.
pub trait Pager<V: Voxel>: Send + Sync {
    /// Fills the chunk described by `ctx`.
    ///
    /// On error the volume resets the chunk to empty voxels and keeps going.
    fn page_in(&self, ctx: &mut PagerContext<'_, V>) -> Result<(), PagerError>;

    /// Persists a chunk that is about to be dropped or flushed.
    ///
    /// On error the volume logs the failure; an evicted chunk is dropped anyway.
    fn page_out(&self, chunk: &Chunk<V>) -> Result<(), PagerError>;
}

/// Access handed to [`Pager::page_in`]: the chunk being filled plus the volume seed.
///
/// Writes are clipped to the chunk region; anything outside is rejected.
pub struct PagerContext<'a, V: Voxel> {
    chunk: &'a mut Chunk<V>,
    seed: u64,
}

impl<'a, V: Voxel> PagerContext<'a, V> {
    pub fn new(chunk: &'a mut Chunk<V>, seed: u64) -> Self {
        Self { chunk, seed }
    }

    /// Region of the chunk being paged in.
    pub fn region(&self) -> Region {
        self.chunk.region()
    }

    pub fn pos(&self) -> ChunkPos {
        self.chunk.pos()
    }

    /// Volume-wide seed for procedural generation.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Voxel at `pos`, or `None` outside the chunk.
    pub fn get_voxel(&self, pos: IVec3) -> Option<V> {
        self.chunk
            .region()
            .contains_point(pos)
            .then(|| self.chunk.get_world(pos))
    }

    /// Writes a voxel inside the chunk. Returns `false` if `pos` is outside.
    pub fn set_voxel(&mut self, pos: IVec3, voxel: V) -> bool {
        if !self.chunk.region().contains_point(pos) {
            return false;
        }
        self.chunk.set_world(pos, voxel);
        true
    }

    /// Writes the column at `(x, z)` for `y` in `0..column.len()`, keeping only
    /// the part that falls inside the chunk. Returns the number of voxels written.
    pub fn set_voxels(&mut self, x: i32, z: i32, column: &[V]) -> usize {
        let region = self.chunk.region();
        let lower = region.lower_corner();
        let upper = region.upper_corner();
        if x < lower.x || x > upper.x || z < lower.z || z > upper.z || column.is_empty() {
            return 0;
        }
        let top = (column.len() - 1).min(i32::MAX as usize) as i32;
        let y_start = lower.y.max(0);
        let y_end = upper.y.min(top);
        let mut written = 0;
        for y in y_start..=y_end {
            self.chunk.set_world(IVec3::new(x, y, z), column[y as usize]);
            written += 1;
        }
        written
    }

    pub fn chunk(&self) -> &Chunk<V> {
        self.chunk
    }

    /// Direct access for bulk fills (e.g. decoding a stored buffer).
    pub fn chunk_mut(&mut self) -> &mut Chunk<V> {
        self.chunk
    }
}

/// Pager that leaves chunks empty and discards page-outs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPager;

impl<V: Voxel> Pager<V> for NullPager {
    fn page_in(&self, _ctx: &mut PagerContext<'_, V>) -> Result<(), PagerError> {
        Ok(())
    }

    fn page_out(&self, _chunk: &Chunk<V>) -> Result<(), PagerError> {
        Ok(())
    }
}

/// Keeps copies of paged-out chunks in memory and restores them on page-in.
///
/// Chunks never paged out come back empty.
pub struct MemoryPager<V> {
    store: Mutex<FxHashMap<ChunkPos, Box<[V]>>>,
    page_ins: AtomicUsize,
    page_outs: AtomicUsize,
}

impl<V: Voxel> MemoryPager<V> {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(FxHashMap::default()),
            page_ins: AtomicUsize::new(0),
            page_outs: AtomicUsize::new(0),
        }
    }

    /// Number of chunks currently persisted.
    pub fn stored_chunks(&self) -> usize {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pos)
    }

    pub fn page_in_count(&self) -> usize {
        self.page_ins.load(Ordering::Relaxed)
    }

    pub fn page_out_count(&self) -> usize {
        self.page_outs.load(Ordering::Relaxed)
    }
}

impl<V: Voxel> Default for MemoryPager<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Voxel> Pager<V> for MemoryPager<V> {
    fn page_in(&self, ctx: &mut PagerContext<'_, V>) -> Result<(), PagerError> {
        self.page_ins.fetch_add(1, Ordering::Relaxed);
        let pos = ctx.pos();
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = store.get(&pos) else {
            return Ok(());
        };
        let target = ctx.chunk_mut().voxels_mut();
        if stored.len() != target.len() {
            return Err(PagerError::Corrupt {
                pos: pos.as_ivec3(),
                reason: format!("stored {} voxels, chunk holds {}", stored.len(), target.len()),
            });
        }
        target.copy_from_slice(stored);
        Ok(())
    }

    fn page_out(&self, chunk: &Chunk<V>) -> Result<(), PagerError> {
        self.page_outs.fetch_add(1, Ordering::Relaxed);
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chunk.pos(), chunk.voxels().into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
