//! Scheduling of mesh-extraction work after voxel edits.
//!
//! The volume is divided into cubic mesh cells. Each committed change region
//! is grown by one voxel (a cell's surface depends on the voxels bordering it)
//! and every cell it touches is queued. One change batch never queues a cell
//! twice, but separate batches each queue their own requests; consumers
//! coalesce repeats when they drain. The mesh extractor itself lives outside
//! this crate and pulls cells with [`ExtractionQueue::pop`].

use std::collections::VecDeque;

use glam::IVec3;
use rustc_hash::FxHashSet;
use crate::region::Region;

/// FIFO of mesh cells awaiting extraction, one entry per scheduled request.
#[derive(Debug)]
pub struct ExtractionQueue {
    cell_log2: u32,
    order: VecDeque<IVec3>,
}

impl ExtractionQueue {
    /// Creates a queue for cells of `1 << cell_log2` voxels per edge.
    pub fn new(cell_log2: u32) -> Self {
        Self {
            cell_log2,
            order: VecDeque::new(),
        }
    }

    /// Edge length of a mesh cell in voxels.
    pub fn cell_size(&self) -> i32 {
        1 << self.cell_log2
    }

    /// Voxel region of the cell at cell coordinate `cell`.
    pub fn cell_region(&self, cell: IVec3) -> Region {
        let lower = cell << self.cell_log2;
        Region::from_ordered(lower, lower + IVec3::splat(self.cell_size() - 1))
    }

    /// Queues every cell whose mesh depends on voxels in `changed`.
    ///
    /// Returns the number of cells queued.
    pub fn schedule_change(&mut self, changed: &Region) -> usize {
        self.schedule_region(&changed.grown(1))
    }

    /// Queues the cells of one change batch. A cell touched by several
    /// regions of the batch is queued once. Returns the number queued.
    pub fn schedule_batch(&mut self, changed: impl IntoIterator<Item = Region>) -> usize {
        let mut seen = FxHashSet::default();
        let before = self.order.len();
        for region in changed {
            let grown = region.grown(1);
            for cell in self.cells(&grown) {
                if seen.insert(cell) {
                    self.order.push_back(cell);
                }
            }
        }
        let added = self.order.len() - before;
        tracing::trace!("scheduled {} mesh cells for one batch", added);
        added
    }

    /// Queues every cell intersecting `region` as-is. Returns the number queued.
    pub fn schedule_region(&mut self, region: &Region) -> usize {
        let cells: Vec<IVec3> = self.cells(region).collect();
        self.order.extend(&cells);
        tracing::trace!("scheduled {} mesh cells for {}", cells.len(), region);
        cells.len()
    }

    fn cells(&self, region: &Region) -> impl Iterator<Item = IVec3> + use<> {
        let (lo, hi) = if region.is_valid() {
            (region.lower_corner() >> self.cell_log2, region.upper_corner() >> self.cell_log2)
        } else {
            (IVec3::ONE, IVec3::ZERO)
        };
        (lo.z..=hi.z).flat_map(move |z| {
            (lo.y..=hi.y).flat_map(move |y| (lo.x..=hi.x).map(move |x| IVec3::new(x, y, z)))
        })
    }

    /// Number of cells waiting for extraction.
    pub fn pending(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Takes the oldest pending cell and returns its voxel region.
    pub fn pop(&mut self) -> Option<Region> {
        let cell = self.order.pop_front()?;
        Some(self.cell_region(cell))
    }

    /// Takes every pending cell in scheduling order.
    pub fn drain(&mut self) -> Vec<Region> {
        let mut regions = Vec::with_capacity(self.order.len());
        while let Some(region) = self.pop() {
            regions.push(region);
        }
        regions
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
