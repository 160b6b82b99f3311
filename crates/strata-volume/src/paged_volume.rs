//! Demand-paged voxel volume with a bounded LRU chunk cache.
//!
//! The [`PagedVolume`] is the single owner of every resident [`Chunk`]. A
//! chunk table maps [`ChunkPos`] to a shared slot; the slot's `RwLock`
//! guards the voxel buffer so resident chunks can be read and written
//! without holding the table lock.
//!
//! Locking rules:
//!
//! - While the table is locked, only unpinned chunks are locked (eviction
//!   victims, uncontended). Every other chunk lock is taken with the table
//!   unlocked.
//! - The change tracker is locked last and nothing is acquired under it.
//! - Pager calls run with the table unlocked. A chunk being paged in is
//!   inserted write-locked, so concurrent accessors block on that chunk
//!   only, and at most one page-in per position is ever in flight.
//! - A chunk is pinned while anything besides the table holds its slot
//!   (an in-flight operation or a [`Sampler`](crate::Sampler)). Pinned
//!   chunks are never evicted.
//! - Eviction victims move to an `evicting` map and stay write-locked
//!   until their page-out finishes and they have left the map again; a miss
//!   on such a position waits for that lock once. Re-locking the table with
//!   victims still locked is the one exception to the first rule.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use glam::{IVec3, Vec3};
use rustc_hash::FxHashMap;

use crate::change::{ChangeClock, ChangeSet, Timestamp};
use crate::chunk::{Chunk, ChunkPos, ChunkState};
use crate::error::VolumeError;
use crate::extraction::ExtractionQueue;
use crate::octree::Octree;
use crate::pager::{Pager, PagerContext};
use crate::region::Region;
use crate::sync::{MirrorNode, SyncHandler, SyncStats, sync_mirror};
use crate::voxel::Voxel;

/// Construction parameters for a [`PagedVolume`].
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSettings {
    /// Chunk edge length in voxels; a power of two in `2..=256`.
    pub chunk_size: u32,
    /// Maximum number of resident chunks.
    pub max_chunks: usize,
    /// Addressable voxels. Accesses outside fail with `OutOfBounds`.
    pub max_region: Region,
    /// Seed handed to the pager for procedural generation.
    pub seed: u64,
    /// Region tracked by the octree. Defaults to `max_region`.
    pub octree_region: Option<Region>,
    /// Mesh cell edge length. Defaults to `chunk_size`.
    pub extraction_cell_size: Option<u32>,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            max_chunks: 1024,
            max_region: Region::MAX,
            seed: 0,
            octree_region: None,
            extraction_cell_size: None,
        }
    }
}

impl VolumeSettings {
    /// Checks every parameter.
    ///
    /// # Errors
    ///
    /// Returns the first problem found as a [`VolumeError`].
    pub fn validate(&self) -> Result<(), VolumeError> {
        if !valid_cell_size(self.chunk_size) {
            return Err(VolumeError::InvalidChunkSize(self.chunk_size));
        }
        if self.max_chunks == 0 {
            return Err(VolumeError::InvalidConfig("max_chunks must be at least 1".into()));
        }
        for region in std::iter::once(&self.max_region).chain(self.octree_region.iter()) {
            if !region.is_valid() || !Region::MAX.contains_region(region) {
                return Err(VolumeError::InvalidRegion {
                    lower: region.lower_corner(),
                    upper: region.upper_corner(),
                });
            }
        }
        if let Some(cell) = self.extraction_cell_size {
            if !valid_cell_size(cell) {
                return Err(VolumeError::InvalidConfig(format!(
                    "extraction cell size {cell} must be a power of two between 2 and 256"
                )));
            }
        }
        Ok(())
    }
}

fn valid_cell_size(size: u32) -> bool {
    size.is_power_of_two() && (2..=256).contains(&size)
}

/// Snapshot of paging counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub page_ins: u64,
    pub page_in_failures: u64,
    pub page_outs: u64,
    pub page_out_failures: u64,
    pub evictions: u64,
    /// Times the cache stayed over budget because every surplus chunk was pinned.
    pub pinned_overflows: u64,
}

/// Outcome of [`PagedVolume::flush`] and [`PagedVolume::flush_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Dirty chunks successfully paged out.
    pub written: usize,
    /// Dirty chunks whose page-out failed; they stay dirty and resident.
    pub failed: usize,
    /// Chunks dropped from the cache (only `flush_all`).
    pub evicted: usize,
}

#[derive(Default)]
struct Counters {
    page_ins: AtomicU64,
    page_in_failures: AtomicU64,
    page_outs: AtomicU64,
    page_out_failures: AtomicU64,
    evictions: AtomicU64,
    pinned_overflows: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> VolumeStats {
        VolumeStats {
            page_ins: self.page_ins.load(Ordering::Relaxed),
            page_in_failures: self.page_in_failures.load(Ordering::Relaxed),
            page_outs: self.page_outs.load(Ordering::Relaxed),
            page_out_failures: self.page_out_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pinned_overflows: self.pinned_overflows.load(Ordering::Relaxed),
        }
    }
}

/// A resident chunk behind its own lock.
pub(crate) struct ChunkSlot<V> {
    pos: ChunkPos,
    chunk: RwLock<Chunk<V>>,
}

impl<V: Voxel> ChunkSlot<V> {
    fn new(chunk: Chunk<V>) -> Self {
        Self {
            pos: chunk.pos(),
            chunk: RwLock::new(chunk),
        }
    }

    pub(crate) fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Chunk<V>> {
        self.chunk.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Chunk<V>> {
        self.chunk.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Entry<V> {
    slot: Arc<ChunkSlot<V>>,
    key: (u64, u64),
}

/// Chunk map plus LRU index, guarded together by one mutex.
struct ChunkTable<V> {
    resident: FxHashMap<ChunkPos, Entry<V>>,
    /// `(last_used, insertion_seq)` to position; oldest first.
    lru: BTreeMap<(u64, u64), ChunkPos>,
    evicting: FxHashMap<ChunkPos, Arc<ChunkSlot<V>>>,
    access: u64,
    next_seq: u64,
}

impl<V: Voxel> ChunkTable<V> {
    fn new() -> Self {
        Self {
            resident: FxHashMap::default(),
            lru: BTreeMap::new(),
            evicting: FxHashMap::default(),
            access: 0,
            next_seq: 0,
        }
    }

    /// Returns the resident slot for `pos` and marks it most recently used.
    fn touch(&mut self, pos: ChunkPos) -> Option<Arc<ChunkSlot<V>>> {
        let entry = self.resident.get_mut(&pos)?;
        self.access += 1;
        let key = (self.access, entry.key.1);
        self.lru.remove(&entry.key);
        self.lru.insert(key, pos);
        entry.key = key;
        Some(Arc::clone(&entry.slot))
    }

    fn insert(&mut self, slot: Arc<ChunkSlot<V>>) {
        self.access += 1;
        self.next_seq += 1;
        let key = (self.access, self.next_seq);
        let pos = slot.pos();
        self.lru.insert(key, pos);
        if let Some(old) = self.resident.insert(pos, Entry { slot, key }) {
            tracing::error!("chunk {:?} inserted twice", pos);
            self.lru.remove(&old.key);
        }
    }

    /// Moves least recently used unpinned chunks to the evicting map until at
    /// most `budget` remain. Returns the victims and whether pinned chunks
    /// kept the table over budget.
    fn take_victims(&mut self, budget: usize) -> (Vec<Arc<ChunkSlot<V>>>, bool) {
        let excess = self.resident.len().saturating_sub(budget);
        if excess == 0 {
            return (Vec::new(), false);
        }
        let chosen: Vec<((u64, u64), ChunkPos)> = self
            .lru
            .iter()
            .filter(|(_, pos)| {
                self.resident
                    .get(pos)
                    .is_some_and(|entry| Arc::strong_count(&entry.slot) == 1)
            })
            .take(excess)
            .map(|(key, pos)| (*key, *pos))
            .collect();

        let mut victims = Vec::with_capacity(chosen.len());
        for (key, pos) in chosen {
            self.lru.remove(&key);
            if let Some(entry) = self.resident.remove(&pos) {
                self.evicting.insert(pos, Arc::clone(&entry.slot));
                victims.push(entry.slot);
            }
        }
        let overflow = victims.len() < excess;
        (victims, overflow)
    }

    fn finish_eviction(&mut self, slot: &Arc<ChunkSlot<V>>) {
        match self.evicting.remove(&slot.pos()) {
            Some(parked) if Arc::ptr_eq(&parked, slot) => {}
            Some(other) => {
                tracing::error!("evicting map held a different slot for {:?}", slot.pos());
                self.evicting.insert(slot.pos(), other);
            }
            None => tracing::error!("evicted chunk {:?} missing from evicting map", slot.pos()),
        }
    }
}

/// Octree and extraction queue, updated together under one lock.
struct ChangeTracker {
    octree: Octree,
    extraction: ExtractionQueue,
}

/// Sparse voxel volume backed by a bounded cache of chunks and a [`Pager`].
///
/// Every method takes `&self`; share the volume across threads with `Arc`.
/// Dropping the volume does not flush: call [`PagedVolume::flush_all`] first
/// to persist dirty chunks.
pub struct PagedVolume<V: Voxel> {
    settings: VolumeSettings,
    chunk_log2: u32,
    pager: Arc<dyn Pager<V>>,
    table: Mutex<ChunkTable<V>>,
    clock: Arc<ChangeClock>,
    tracker: Mutex<ChangeTracker>,
    counters: Counters,
}

impl<V: Voxel> PagedVolume<V> {
    /// Creates an empty volume. No chunk is paged in until first accessed.
    ///
    /// # Errors
    ///
    /// Returns a [`VolumeError`] describing the first invalid setting.
    pub fn new(settings: VolumeSettings, pager: Arc<dyn Pager<V>>) -> Result<Self, VolumeError> {
        settings.validate()?;
        let clock = Arc::new(ChangeClock::new());
        let octree_region = settings.octree_region.unwrap_or(settings.max_region);
        let octree = Octree::new(octree_region, settings.chunk_size, Arc::clone(&clock))?;
        let cell_size = settings.extraction_cell_size.unwrap_or(settings.chunk_size);
        let extraction = ExtractionQueue::new(cell_size.trailing_zeros());

        tracing::debug!(
            "paged volume: chunk size {}, max {} chunks, region {}",
            settings.chunk_size,
            settings.max_chunks,
            settings.max_region
        );

        Ok(Self {
            chunk_log2: settings.chunk_size.trailing_zeros(),
            settings,
            pager,
            table: Mutex::new(ChunkTable::new()),
            clock,
            tracker: Mutex::new(ChangeTracker { octree, extraction }),
            counters: Counters::default(),
        })
    }

    pub fn settings(&self) -> &VolumeSettings {
        &self.settings
    }

    pub fn chunk_size(&self) -> u32 {
        self.settings.chunk_size
    }

    pub fn max_chunks(&self) -> usize {
        self.settings.max_chunks
    }

    pub fn max_region(&self) -> Region {
        self.settings.max_region
    }

    /// Current value of the change clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn stats(&self) -> VolumeStats {
        self.counters.snapshot()
    }

    // -- voxel access -------------------------------------------------------

    /// Reads one voxel, paging its chunk in if needed.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] outside the max region.
    pub fn get_voxel(&self, x: i32, y: i32, z: i32) -> Result<V, VolumeError> {
        let pos = IVec3::new(x, y, z);
        self.check_bounds(pos)?;
        let (slot, _) = self.resolve(ChunkPos::from_voxel(pos, self.chunk_log2));
        let voxel = slot.read().get_world(pos);
        Ok(voxel)
    }

    /// Writes one voxel. Returns `true` if the stored value changed.
    ///
    /// A write of the value already stored leaves the chunk clean and does
    /// not advance the change clock.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] outside the max region.
    pub fn set_voxel(&self, x: i32, y: i32, z: i32, voxel: V) -> Result<bool, VolumeError> {
        let pos = IVec3::new(x, y, z);
        self.check_bounds(pos)?;
        let (slot, _) = self.resolve(ChunkPos::from_voxel(pos, self.chunk_log2));
        let mut changes = ChangeSet::new();
        let changed = write_voxel(&mut slot.write(), pos, voxel, &mut changes);
        self.commit(&changes);
        Ok(changed)
    }

    /// Writes the column at `(x, z)` for `y` in `0..column.len()`.
    ///
    /// Equivalent to one [`set_voxel`](Self::set_voxel) per element, but the
    /// chunk is looked up once per chunk crossed and all edits are committed
    /// as one change batch. Returns the number of voxels that changed.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] if either end of the column lies outside
    /// the max region; nothing is written in that case.
    pub fn set_voxels(&self, x: i32, z: i32, column: &[V]) -> Result<usize, VolumeError> {
        if column.is_empty() {
            return Ok(0);
        }
        let top = i32::try_from(column.len() - 1)
            .map_err(|_| VolumeError::out_of_bounds(IVec3::new(x, i32::MAX, z)))?;
        self.check_bounds(IVec3::new(x, 0, z))?;
        self.check_bounds(IVec3::new(x, top, z))?;

        let mut changes = ChangeSet::new();
        let mut changed = 0;
        // Touched chunks stay pinned until the batch is committed.
        let mut pinned = Vec::new();
        let size = self.settings.chunk_size as i32;
        let mut y = 0;
        while y <= top {
            let segment_end = ((y >> self.chunk_log2) * size + size - 1).min(top);
            let (slot, _) = self.resolve(ChunkPos::from_voxel(IVec3::new(x, y, z), self.chunk_log2));
            let mut chunk = slot.write();
            for (offset, voxel) in column[y as usize..=segment_end as usize].iter().enumerate() {
                let pos = IVec3::new(x, y + offset as i32, z);
                if write_voxel(&mut chunk, pos, *voxel, &mut changes) {
                    changed += 1;
                }
            }
            drop(chunk);
            pinned.push(slot);
            y = segment_end + 1;
        }
        self.commit(&changes);
        drop(pinned);
        Ok(changed)
    }

    /// Applies arbitrary edits as one change batch (one clock tick).
    ///
    /// Edits are grouped by chunk; within a chunk they apply in slice order,
    /// so a later edit to the same voxel wins. Returns the number of edits
    /// that changed a voxel.
    ///
    /// # Errors
    ///
    /// [`VolumeError::OutOfBounds`] for the first edit outside the max region;
    /// nothing is written in that case.
    pub fn set_voxels_batch(&self, edits: &[(IVec3, V)]) -> Result<usize, VolumeError> {
        for (pos, _) in edits {
            self.check_bounds(*pos)?;
        }
        let mut order: Vec<(ChunkPos, usize)> = edits
            .iter()
            .enumerate()
            .map(|(i, (pos, _))| (ChunkPos::from_voxel(*pos, self.chunk_log2), i))
            .collect();
        order.sort_by_key(|(chunk, _)| *chunk);

        let mut changes = ChangeSet::new();
        let mut changed = 0;
        let mut pinned = Vec::new();
        for group in order.chunk_by(|a, b| a.0 == b.0) {
            let (slot, _) = self.resolve(group[0].0);
            let mut chunk = slot.write();
            for &(_, i) in group {
                let (pos, voxel) = edits[i];
                if write_voxel(&mut chunk, pos, voxel, &mut changes) {
                    changed += 1;
                }
            }
            drop(chunk);
            pinned.push(slot);
        }
        self.commit(&changes);
        drop(pinned);
        Ok(changed)
    }

    /// Pages in the chunks overlapping `region`, clipped to the max region and
    /// capped at `max_chunks`. Returns how many chunks were newly paged in.
    ///
    /// # Errors
    ///
    /// [`VolumeError::InvalidRegion`] for the invalid sentinel.
    pub fn prefetch(&self, region: &Region) -> Result<usize, VolumeError> {
        if !region.is_valid() {
            return Err(VolumeError::InvalidRegion {
                lower: region.lower_corner(),
                upper: region.upper_corner(),
            });
        }
        let Some(clipped) = region.intersection(&self.settings.max_region) else {
            return Ok(0);
        };
        let lo = clipped.lower_corner() >> self.chunk_log2;
        let hi = clipped.upper_corner() >> self.chunk_log2;
        let mut visited = 0;
        let mut paged = 0;
        'outer: for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if visited == self.settings.max_chunks {
                        break 'outer;
                    }
                    visited += 1;
                    let (_, paged_in) = self.resolve(ChunkPos::new(x, y, z));
                    if paged_in {
                        paged += 1;
                    }
                }
            }
        }
        Ok(paged)
    }

    // -- persistence --------------------------------------------------------

    /// Pages out every dirty chunk and marks it clean. Chunks stay resident.
    pub fn flush(&self) -> FlushReport {
        let mut slots: Vec<Arc<ChunkSlot<V>>> = {
            let table = self.lock_table();
            table.resident.values().map(|e| Arc::clone(&e.slot)).collect()
        };
        slots.sort_by_key(|slot| slot.pos());

        let mut report = FlushReport::default();
        for slot in &slots {
            let mut chunk = slot.write();
            if !chunk.is_dirty() {
                continue;
            }
            if self.page_out(&chunk) {
                chunk.set_state(ChunkState::Clean);
                report.written += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.written + report.failed > 0 {
            tracing::debug!("flushed {} chunks ({} failed)", report.written, report.failed);
        }
        report
    }

    /// Flushes, then evicts every chunk that is not pinned.
    pub fn flush_all(&self) -> FlushReport {
        let mut report = self.flush();
        report.evicted = self.evict_down_to(self.lock_table(), 0);
        report
    }

    // -- introspection ------------------------------------------------------

    /// Number of chunks currently in the cache.
    pub fn resident_chunks(&self) -> usize {
        self.lock_table().resident.len()
    }

    /// Positions of resident chunks in ascending order.
    pub fn resident_positions(&self) -> Vec<ChunkPos> {
        let mut positions: Vec<ChunkPos> = self.lock_table().resident.keys().copied().collect();
        positions.sort_unstable();
        positions
    }

    /// Whether the chunk holding voxel `(x, y, z)` is resident. Does not page.
    pub fn is_resident(&self, x: i32, y: i32, z: i32) -> bool {
        let pos = ChunkPos::from_voxel(IVec3::new(x, y, z), self.chunk_log2);
        self.lock_table().resident.contains_key(&pos)
    }

    /// Bytes held by resident voxel buffers.
    pub fn size_in_bytes(&self) -> usize {
        let per_chunk = (1usize << (3 * self.chunk_log2)) * std::mem::size_of::<V>();
        self.resident_chunks() * per_chunk
    }

    // -- change tracking ----------------------------------------------------

    /// Runs `f` with shared access to the change-tracking octree.
    pub fn with_octree<R>(&self, f: impl FnOnce(&Octree) -> R) -> R {
        f(&self.lock_tracker().octree)
    }

    /// Brings a consumer mirror up to date with the octree.
    ///
    /// The tracker stays locked for the whole pass, so `handler` must not
    /// call back into this volume.
    pub fn sync_mirror<T, H>(&self, mirror: &mut MirrorNode<T>, handler: &mut H) -> SyncStats
    where
        H: SyncHandler<T> + ?Sized,
    {
        let tracker = self.lock_tracker();
        sync_mirror(&tracker.octree, mirror, handler)
    }

    /// Recomputes which octree nodes render for a viewer at `viewer`.
    pub fn update_visibility(&self, viewer: Vec3, lod_threshold: f32) -> usize {
        self.lock_tracker().octree.update_visibility(viewer, lod_threshold)
    }

    /// Number of mesh cells waiting for extraction.
    pub fn pending_extractions(&self) -> usize {
        self.lock_tracker().extraction.pending()
    }

    /// Takes the oldest pending mesh cell.
    pub fn pop_extraction(&self) -> Option<Region> {
        self.lock_tracker().extraction.pop()
    }

    /// Takes every pending mesh cell in scheduling order.
    pub fn drain_extractions(&self) -> Vec<Region> {
        self.lock_tracker().extraction.drain()
    }

    // -- crate internals ----------------------------------------------------

    pub(crate) fn chunk_log2(&self) -> u32 {
        self.chunk_log2
    }

    pub(crate) fn check_bounds(&self, pos: IVec3) -> Result<(), VolumeError> {
        if self.settings.max_region.contains_point(pos) {
            Ok(())
        } else {
            Err(VolumeError::out_of_bounds(pos))
        }
    }

    /// Returns the slot for `pos`, paging it in on a miss. The second value
    /// is `true` if this call performed the page-in.
    ///
    /// The returned `Arc` pins the chunk until dropped.
    pub(crate) fn resolve(&self, pos: ChunkPos) -> (Arc<ChunkSlot<V>>, bool) {
        loop {
            let mut table = self.lock_table();
            if let Some(slot) = table.touch(pos) {
                self.evict_down_to(table, self.settings.max_chunks);
                return (slot, false);
            }

            if let Some(parked) = table.evicting.get(&pos).map(Arc::clone) {
                drop(table);
                // The evicting thread clears its map entry before unlocking
                // the slot, so one wait suffices.
                drop(parked.read());
                continue;
            }

            let slot = Arc::new(ChunkSlot::new(Chunk::new(pos, self.chunk_log2)));
            let mut chunk = slot.write();
            table.insert(Arc::clone(&slot));
            self.evict_down_to(table, self.settings.max_chunks);

            self.page_in(&mut chunk);
            // Reported under the chunk lock so no edit can slip in between.
            self.chunk_paged_in(&chunk);
            drop(chunk);
            return (slot, true);
        }
    }

    /// Commits one change batch: a single clock tick stamped on the octree
    /// and the extraction queue.
    ///
    /// Callers must still pin every chunk in `changes`, so none of them can
    /// be evicted and re-paged before its solid-count delta lands.
    pub(crate) fn commit(&self, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let mut tracker = self.lock_tracker();
        let now = self.clock.advance();
        let ChangeTracker { octree, extraction } = &mut *tracker;
        for (pos, edit) in changes.iter() {
            let anchor = pos.lower_corner(self.chunk_log2);
            octree.adjust_occupancy(anchor, edit.solid_delta, now);
            octree.mark_mesh_changed(&edit.bounds.grown(1), now);
        }
        extraction.schedule_batch(changes.iter().map(|(_, edit)| edit.bounds));
        tracing::trace!("committed {} voxel changes at t={}", changes.changed_voxels(), now);
    }

    // -- paging -------------------------------------------------------------

    fn lock_table(&self) -> MutexGuard<'_, ChunkTable<V>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evicts unpinned chunks until at most `budget` remain, consuming the
    /// table guard. Returns the number of chunks evicted.
    fn evict_down_to(&self, mut table: MutexGuard<'_, ChunkTable<V>>, budget: usize) -> usize {
        let (victims, overflow) = table.take_victims(budget);
        if overflow {
            Counters::bump(&self.counters.pinned_overflows);
            tracing::warn!(
                "chunk cache over budget: {} resident, {} allowed, surplus pinned",
                table.resident.len(),
                budget
            );
        }
        if victims.is_empty() {
            return 0;
        }
        // Victims are unpinned, so these locks are uncontended.
        let mut guards: Vec<_> = victims.iter().map(|slot| slot.write()).collect();
        drop(table);

        for chunk in guards.iter_mut() {
            let dirty = chunk.is_dirty();
            chunk.set_state(ChunkState::Evicting);
            if dirty {
                self.page_out(&**chunk);
            }
            Counters::bump(&self.counters.evictions);
            tracing::debug!("evicted chunk {:?} (dirty: {})", chunk.pos(), dirty);
        }

        // Nobody waits on the table while holding a victim's lock.
        let mut table = self.lock_table();
        for slot in &victims {
            table.finish_eviction(slot);
        }
        drop(table);
        drop(guards);
        victims.len()
    }

    fn page_in(&self, chunk: &mut Chunk<V>) {
        let pos = chunk.pos();
        let result = self.pager.page_in(&mut PagerContext::new(chunk, self.settings.seed));
        match result {
            Ok(()) => {
                Counters::bump(&self.counters.page_ins);
                tracing::debug!("paged in chunk {:?}", pos);
            }
            Err(e) => {
                chunk.clear();
                Counters::bump(&self.counters.page_in_failures);
                tracing::warn!("page-in of chunk {:?} failed, using empty chunk: {}", pos, e);
            }
        }
        chunk.set_state(ChunkState::Clean);
    }

    /// Hands a chunk to the pager. Returns `true` on success.
    fn page_out(&self, chunk: &Chunk<V>) -> bool {
        match self.pager.page_out(chunk) {
            Ok(()) => {
                Counters::bump(&self.counters.page_outs);
                tracing::debug!("paged out chunk {:?}", chunk.pos());
                true
            }
            Err(e) => {
                Counters::bump(&self.counters.page_out_failures);
                tracing::warn!("page-out of chunk {:?} failed: {}", chunk.pos(), e);
                false
            }
        }
    }

    /// Reconciles octree occupancy with freshly paged-in content.
    fn chunk_paged_in(&self, chunk: &Chunk<V>) {
        let solid = u64::from(chunk.solid_count());
        let anchor = chunk.region().lower_corner();
        let mut tracker = self.lock_tracker();
        if tracker.octree.solid_balance(anchor) == solid as i64 {
            return;
        }
        let now = self.clock.advance();
        tracker.octree.set_occupancy(anchor, solid, now);
        tracker.extraction.schedule_change(&chunk.region());
    }
}

/// Writes `voxel` into `chunk` and records the change. Returns `false` if the
/// stored value was already `voxel`.
pub(crate) fn write_voxel<V: Voxel>(
    chunk: &mut Chunk<V>,
    pos: IVec3,
    voxel: V,
    changes: &mut ChangeSet,
) -> bool {
    let old = chunk.set_world(pos, voxel);
    if old == voxel {
        return false;
    }
    chunk.mark_dirty();
    changes.record(chunk.pos(), pos, old.is_empty(), voxel.is_empty());
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PagerError;
    use crate::pager::{MemoryPager, NullPager};
    use crate::voxel::VoxelId;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        PageIn(Region),
        PageOut(Region),
    }

    /// Records every pager call in order. Fails page-ins at `fail_in`.
    #[derive(Default)]
    struct RecordingPager {
        events: Mutex<Vec<Event>>,
        fail_in: Option<ChunkPos>,
        fail_out: bool,
    }

    impl RecordingPager {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn page_outs(&self) -> usize {
            self.events().iter().filter(|e| matches!(e, Event::PageOut(_))).count()
        }
    }

    impl Pager<VoxelId> for RecordingPager {
        fn page_in(&self, ctx: &mut PagerContext<'_, VoxelId>) -> Result<(), PagerError> {
            self.events.lock().unwrap().push(Event::PageIn(ctx.region()));
            if self.fail_in == Some(ctx.pos()) {
                // Partially filled before failing; the volume must discard it.
                ctx.chunk_mut().fill(VoxelId(9));
                return Err(PagerError::Unavailable("test backend down".into()));
            }
            Ok(())
        }

        fn page_out(&self, chunk: &Chunk<VoxelId>) -> Result<(), PagerError> {
            self.events.lock().unwrap().push(Event::PageOut(chunk.region()));
            if self.fail_out {
                return Err(PagerError::Unavailable("test backend down".into()));
            }
            Ok(())
        }
    }

    fn settings(max_chunks: usize) -> VolumeSettings {
        VolumeSettings {
            chunk_size: 16,
            max_chunks,
            max_region: Region::cube(-1024, 1023).unwrap(),
            ..Default::default()
        }
    }

    fn volume_with(max_chunks: usize, pager: Arc<RecordingPager>) -> PagedVolume<VoxelId> {
        PagedVolume::new(settings(max_chunks), pager).unwrap()
    }

    fn chunk_region(x: i32, y: i32, z: i32) -> Region {
        ChunkPos::new(x, y, z).region(4)
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let pager: Arc<dyn Pager<VoxelId>> = Arc::new(NullPager);
        let bad_size = VolumeSettings { chunk_size: 24, ..settings(4) };
        assert!(matches!(
            PagedVolume::new(bad_size, Arc::clone(&pager)),
            Err(VolumeError::InvalidChunkSize(24))
        ));
        let no_chunks = settings(0);
        assert!(matches!(
            PagedVolume::new(no_chunks, Arc::clone(&pager)),
            Err(VolumeError::InvalidConfig(_))
        ));
        let bad_region = VolumeSettings { max_region: Region::INVALID, ..settings(4) };
        assert!(matches!(
            PagedVolume::new(bad_region, pager),
            Err(VolumeError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_write_then_read_back() {
        let volume = volume_with(8, Arc::default());
        assert!(volume.set_voxel(3, -7, 12, VoxelId(5)).unwrap());
        assert_eq!(volume.get_voxel(3, -7, 12).unwrap(), VoxelId(5));
        assert_eq!(volume.get_voxel(4, -7, 12).unwrap(), VoxelId::EMPTY);
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let volume = volume_with(8, Arc::default());
        assert_eq!(
            volume.get_voxel(2000, 0, 0),
            Err(VolumeError::OutOfBounds { x: 2000, y: 0, z: 0 })
        );
        assert!(volume.set_voxel(0, -1025, 0, VoxelId(1)).is_err());
        assert_eq!(volume.resident_chunks(), 0);
    }

    #[test]
    fn test_opposite_corners_share_one_chunk() {
        let volume = volume_with(8, Arc::default());
        volume.set_voxel(0, 0, 0, VoxelId(1)).unwrap();
        volume.set_voxel(15, 15, 15, VoxelId(1)).unwrap();
        assert_eq!(volume.resident_chunks(), 1);
        assert_eq!(volume.resident_positions(), vec![ChunkPos::new(0, 0, 0)]);
    }

    #[test]
    fn test_noop_write_changes_nothing() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(1, Arc::clone(&pager));
        assert!(!volume.set_voxel(1, 1, 1, VoxelId::EMPTY).unwrap());
        assert_eq!(volume.now(), 0);
        assert_eq!(volume.pending_extractions(), 0);

        // Still clean: evicting it must not page out.
        volume.get_voxel(100, 0, 0).unwrap();
        assert_eq!(pager.page_outs(), 0);
    }

    #[test]
    fn test_dirty_victim_paged_out_before_next_page_in() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(1, Arc::clone(&pager));
        volume.set_voxel(0, 0, 0, VoxelId(1)).unwrap();
        volume.set_voxel(100, 0, 0, VoxelId(1)).unwrap();

        assert_eq!(
            pager.events(),
            vec![
                Event::PageIn(chunk_region(0, 0, 0)),
                Event::PageOut(chunk_region(0, 0, 0)),
                Event::PageIn(chunk_region(6, 0, 0)),
            ]
        );
        assert_eq!(volume.resident_chunks(), 1);
        assert!(volume.is_resident(100, 0, 0));
        assert_eq!(volume.stats().evictions, 1);
    }

    #[test]
    fn test_clean_victim_not_paged_out() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(1, Arc::clone(&pager));
        volume.get_voxel(0, 0, 0).unwrap();
        volume.get_voxel(100, 0, 0).unwrap();
        assert_eq!(pager.page_outs(), 0);
        assert_eq!(volume.stats().evictions, 1);
    }

    #[test]
    fn test_lru_order_with_touch() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(2, Arc::clone(&pager));
        volume.get_voxel(0, 0, 0).unwrap();
        volume.get_voxel(16, 0, 0).unwrap();
        // Touch the first chunk so the second becomes least recently used.
        volume.get_voxel(1, 0, 0).unwrap();
        volume.get_voxel(32, 0, 0).unwrap();
        assert_eq!(
            volume.resident_positions(),
            vec![ChunkPos::new(0, 0, 0), ChunkPos::new(2, 0, 0)]
        );
    }

    #[test]
    fn test_resident_count_bounded() {
        let volume = volume_with(3, Arc::default());
        for i in 0..20 {
            volume.set_voxel(i * 16, 0, 0, VoxelId(1)).unwrap();
            assert!(volume.resident_chunks() <= 3);
        }
        assert_eq!(volume.resident_chunks(), 3);
    }

    #[test]
    fn test_evicted_data_survives_with_memory_pager() {
        let pager = Arc::new(MemoryPager::<VoxelId>::new());
        let volume: PagedVolume<VoxelId> = PagedVolume::new(settings(1), pager.clone()).unwrap();
        volume.set_voxel(5, 5, 5, VoxelId(7)).unwrap();
        volume.get_voxel(500, 0, 0).unwrap();
        assert!(!volume.is_resident(5, 5, 5));
        assert_eq!(volume.get_voxel(5, 5, 5).unwrap(), VoxelId(7));
        assert_eq!(pager.page_out_count(), 1);
    }

    #[test]
    fn test_page_in_failure_yields_empty_chunk() {
        let pager = Arc::new(RecordingPager {
            fail_in: Some(ChunkPos::new(0, 0, 0)),
            ..Default::default()
        });
        let volume = volume_with(4, pager);
        assert_eq!(volume.get_voxel(1, 2, 3).unwrap(), VoxelId::EMPTY);
        assert!(volume.set_voxel(1, 2, 3, VoxelId(4)).unwrap());
        assert_eq!(volume.get_voxel(1, 2, 3).unwrap(), VoxelId(4));
        let stats = volume.stats();
        assert_eq!(stats.page_in_failures, 1);
        assert_eq!(stats.page_ins, 0);
    }

    #[test]
    fn test_page_out_failure_still_evicts() {
        let pager = Arc::new(RecordingPager {
            fail_out: true,
            ..Default::default()
        });
        let volume = volume_with(1, Arc::clone(&pager));
        volume.set_voxel(0, 0, 0, VoxelId(1)).unwrap();
        volume.get_voxel(100, 0, 0).unwrap();
        assert_eq!(volume.resident_chunks(), 1);
        assert_eq!(volume.stats().page_out_failures, 1);
        assert_eq!(volume.stats().evictions, 1);
    }

    #[test]
    fn test_flush_keeps_chunks_resident_and_clean() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(4, Arc::clone(&pager));
        volume.set_voxel(0, 0, 0, VoxelId(1)).unwrap();
        volume.set_voxel(20, 0, 0, VoxelId(1)).unwrap();
        volume.get_voxel(40, 0, 0).unwrap();

        let report = volume.flush();
        assert_eq!(report, FlushReport { written: 2, failed: 0, evicted: 0 });
        assert_eq!(volume.resident_chunks(), 3);
        assert_eq!(volume.flush().written, 0);
    }

    #[test]
    fn test_flush_all_empties_cache() {
        let pager = Arc::new(RecordingPager::default());
        let volume = volume_with(4, Arc::clone(&pager));
        volume.set_voxel(0, 0, 0, VoxelId(1)).unwrap();
        volume.get_voxel(40, 0, 0).unwrap();
        let report = volume.flush_all();
        assert_eq!(report.written, 1);
        assert_eq!(report.evicted, 2);
        assert_eq!(volume.resident_chunks(), 0);
        // The flushed chunk was clean when evicted: one page-out total.
        assert_eq!(pager.page_outs(), 1);
    }

    #[test]
    fn test_column_write_matches_single_writes() {
        let column: Vec<VoxelId> = (0..40).map(|y| VoxelId(y % 3)).collect();
        let a = volume_with(8, Arc::default());
        let b = volume_with(8, Arc::default());

        let changed = a.set_voxels(-3, 7, &column).unwrap();
        let mut expected = 0;
        for (y, v) in column.iter().enumerate() {
            if b.set_voxel(-3, y as i32, 7, *v).unwrap() {
                expected += 1;
            }
        }
        assert_eq!(changed, expected);
        for y in 0..40 {
            assert_eq!(a.get_voxel(-3, y, 7).unwrap(), b.get_voxel(-3, y, 7).unwrap());
        }
        // One change batch versus one per changed voxel.
        assert_eq!(a.now(), 1);
        assert_eq!(b.now(), expected as u64);
        assert_eq!(a.resident_chunks(), 3);
    }

    #[test]
    fn test_column_leaving_region_writes_nothing() {
        let volume = volume_with(8, Arc::default());
        let column = vec![VoxelId(1); 2000];
        assert!(volume.set_voxels(0, 0, &column).is_err());
        assert_eq!(volume.resident_chunks(), 0);
        assert_eq!(volume.now(), 0);
    }

    #[test]
    fn test_batch_is_one_clock_tick() {
        let volume = volume_with(8, Arc::default());
        let edits = vec![
            (IVec3::new(0, 0, 0), VoxelId(1)),
            (IVec3::new(40, 0, 0), VoxelId(2)),
            (IVec3::new(0, 0, 0), VoxelId(3)),
        ];
        assert_eq!(volume.set_voxels_batch(&edits).unwrap(), 3);
        assert_eq!(volume.now(), 1);
        assert_eq!(volume.get_voxel(0, 0, 0).unwrap(), VoxelId(3));
        assert_eq!(volume.get_voxel(40, 0, 0).unwrap(), VoxelId(2));
    }

    #[test]
    fn test_batch_rejects_out_of_bounds_up_front() {
        let volume = volume_with(8, Arc::default());
        let edits = vec![(IVec3::ZERO, VoxelId(1)), (IVec3::new(0, 5000, 0), VoxelId(1))];
        assert!(volume.set_voxels_batch(&edits).is_err());
        assert_eq!(volume.get_voxel(0, 0, 0).unwrap(), VoxelId::EMPTY);
    }

    #[test]
    fn test_writes_around_origin_schedule_eight_cells() {
        let volume = volume_with(8, Arc::default());
        let mut edits = Vec::new();
        for x in -1..=1 {
            for y in -1..=1 {
                for z in -1..=1 {
                    edits.push((IVec3::new(x, y, z), VoxelId(1)));
                }
            }
        }
        assert_eq!(volume.set_voxels_batch(&edits).unwrap(), 27);
        assert_eq!(volume.pending_extractions(), 8);
        assert_eq!(volume.with_octree(|o| o.root_node().children().count()), 8);
        assert_eq!(volume.drain_extractions().len(), 8);
        assert_eq!(volume.pending_extractions(), 0);
    }

    #[test]
    fn test_separate_writes_queue_cells_again() {
        let volume = volume_with(8, Arc::default());
        volume.set_voxel(15, 15, 15, VoxelId(1)).unwrap();
        assert_eq!(volume.pending_extractions(), 8);
        volume.set_voxel(14, 14, 14, VoxelId(1)).unwrap();
        assert_eq!(volume.pending_extractions(), 9);
    }

    #[test]
    fn test_clearing_voxel_prunes_octree() {
        let volume = volume_with(8, Arc::default());
        volume.set_voxel(3, 3, 3, VoxelId(1)).unwrap();
        assert!(volume.with_octree(|o| o.find_leaf(IVec3::new(3, 3, 3)).is_some()));
        volume.set_voxel(3, 3, 3, VoxelId::EMPTY).unwrap();
        assert!(volume.with_octree(|o| o.find_leaf(IVec3::new(3, 3, 3)).is_none()));
        assert_eq!(volume.with_octree(Octree::node_count), 1);
    }

    #[test]
    fn test_page_in_reports_occupancy() {
        let pager = Arc::new(MemoryPager::<VoxelId>::new());
        let mut chunk = Chunk::new(ChunkPos::new(1, 0, 0), 4);
        chunk.fill(VoxelId(2));
        pager.page_out(&chunk).unwrap();

        let volume: PagedVolume<VoxelId> = PagedVolume::new(settings(4), pager).unwrap();
        volume.get_voxel(20, 0, 0).unwrap();
        assert_eq!(volume.with_octree(|o| o.occupancy(IVec3::new(16, 0, 0))), 4096);
        assert_eq!(volume.now(), 1);

        // Same content again after a re-page: no new tick.
        volume.flush_all();
        volume.get_voxel(20, 0, 0).unwrap();
        assert_eq!(volume.now(), 1);
    }

    #[test]
    fn test_prefetch_counts_new_chunks_only() {
        let volume = volume_with(16, Arc::default());
        volume.get_voxel(0, 0, 0).unwrap();
        let region = Region::new(IVec3::ZERO, IVec3::new(31, 31, 15)).unwrap();
        assert_eq!(volume.prefetch(&region).unwrap(), 3);
        assert_eq!(volume.resident_chunks(), 4);
        assert!(volume.prefetch(&Region::INVALID).is_err());
    }

    #[test]
    fn test_prefetch_capped_at_budget() {
        let volume = volume_with(2, Arc::default());
        let region = Region::cube(0, 63).unwrap();
        assert_eq!(volume.prefetch(&region).unwrap(), 2);
        assert_eq!(volume.resident_chunks(), 2);
    }

    #[test]
    fn test_size_in_bytes_tracks_residency() {
        let volume = volume_with(8, Arc::default());
        assert_eq!(volume.size_in_bytes(), 0);
        volume.get_voxel(0, 0, 0).unwrap();
        assert_eq!(volume.size_in_bytes(), 4096 * std::mem::size_of::<VoxelId>());
    }
}
