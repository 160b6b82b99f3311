//! Logical change clock and per-batch edit bookkeeping.
//!
//! Every committed mutation batch advances the [`ChangeClock`] exactly once.
//! Edits made inside one batch are collected into a [`ChangeSet`] (per-chunk
//! solid-count delta and changed bounds) and applied to the octree and
//! extraction queue under a single timestamp, so sibling edits compare as
//! simultaneous.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::IVec3;
use rustc_hash::FxHashMap;

use crate::chunk::ChunkPos;
use crate::region::Region;

/// Logical time. `0` means "never": fresh mirrors start there.
pub type Timestamp = u64;

/// Monotonic logical clock scoped to one volume/octree pair.
#[derive(Debug, Default)]
pub struct ChangeClock {
    now: AtomicU64,
}

impl ChangeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time without advancing.
    pub fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }

    /// Advances the clock and returns the new time.
    pub fn advance(&self) -> Timestamp {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Accumulated edits to a single chunk within one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkEdit {
    /// Net change in the number of non-empty voxels.
    pub solid_delta: i64,
    /// Bounding box of every changed voxel.
    pub bounds: Region,
    /// Number of voxels whose value changed.
    pub changed: u32,
}

impl Default for ChunkEdit {
    fn default() -> Self {
        Self {
            solid_delta: 0,
            bounds: Region::INVALID,
            changed: 0,
        }
    }
}

/// All edits of one mutation batch, keyed by chunk.
#[derive(Debug, Default)]
pub struct ChangeSet {
    chunks: FxHashMap<ChunkPos, ChunkEdit>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one voxel whose value changed from `was_empty` to `is_empty`.
    pub fn record(&mut self, chunk: ChunkPos, pos: IVec3, was_empty: bool, is_empty: bool) {
        let edit = self.chunks.entry(chunk).or_default();
        edit.bounds = edit.bounds.union_point(pos);
        edit.changed += 1;
        match (was_empty, is_empty) {
            (true, false) => edit.solid_delta += 1,
            (false, true) => edit.solid_delta -= 1,
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of changed voxels across all chunks.
    pub fn changed_voxels(&self) -> usize {
        self.chunks.values().map(|e| e.changed as usize).sum()
    }

    /// Iterates edits in ascending chunk order so application is deterministic.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkPos, ChunkEdit)> + '_ {
        let mut keys: Vec<ChunkPos> = self.chunks.keys().copied().collect();
        keys.sort_unstable();
        keys.into_iter().map(move |k| (k, self.chunks[&k]))
    }

    pub fn get(&self, chunk: &ChunkPos) -> Option<&ChunkEdit> {
        self.chunks.get(chunk)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
