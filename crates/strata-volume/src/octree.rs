//! Change-tracking octree over the chunk grid.
//!
//! Nodes live in an index arena; children are index slots and the parent link
//! is a plain index, so there are no ownership cycles. Leaves are exactly one
//! chunk in size. A node exists only while its octant contains at least one
//! non-empty voxel; the root always exists.
//!
//! Each node carries three independent change timestamps (properties, mesh,
//! structure) plus `subtree_changed`, the maximum over the node and all of its
//! descendants. Consumers compare those stamps against what they last synced
//! and skip whole subtrees that did not change (see [`crate::sync`]).

use std::sync::Arc;

use glam::{IVec3, Vec3};
use rustc_hash::FxHashMap;

use crate::change::{ChangeClock, Timestamp};
use crate::error::VolumeError;
use crate::region::Region;

/// Index of a node inside the octree arena.
pub type NodeIndex = u32;

/// One node of the [`Octree`].
#[derive(Clone, Debug)]
pub struct OctreeNode {
    region: Region,
    parent: Option<NodeIndex>,
    children: [Option<NodeIndex>; 8],
    solid_voxels: u64,
    visible: bool,
    properties_changed: Timestamp,
    mesh_changed: Timestamp,
    structure_changed: Timestamp,
    subtree_changed: Timestamp,
}

impl OctreeNode {
    fn new(region: Region, parent: Option<NodeIndex>, now: Timestamp) -> Self {
        Self {
            region,
            parent,
            children: [None; 8],
            solid_voxels: 0,
            visible: true,
            properties_changed: now,
            mesh_changed: now,
            structure_changed: now,
            subtree_changed: now,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    /// Child in `octant` (`x | y << 1 | z << 2`), if it exists.
    pub fn child(&self, octant: usize) -> Option<NodeIndex> {
        self.children.get(octant).copied().flatten()
    }

    /// Existing children as `(octant, index)` pairs.
    pub fn children(&self) -> impl Iterator<Item = (usize, NodeIndex)> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(octant, child)| child.map(|c| (octant, c)))
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    /// Number of non-empty voxels tracked for a leaf node. Inner nodes report 0.
    pub fn solid_voxels(&self) -> u64 {
        self.solid_voxels
    }

    /// Whether this node renders its own mesh (node-level property).
    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn properties_changed(&self) -> Timestamp {
        self.properties_changed
    }

    pub fn mesh_changed(&self) -> Timestamp {
        self.mesh_changed
    }

    pub fn structure_changed(&self) -> Timestamp {
        self.structure_changed
    }

    /// Latest change anywhere in this node or below it.
    pub fn subtree_changed(&self) -> Timestamp {
        self.subtree_changed
    }

    fn bump_subtree(&mut self, now: Timestamp) {
        self.subtree_changed = self.subtree_changed.max(now);
    }
}

/// Sparse octree recording when each part of the volume last changed.
#[derive(Clone, Debug)]
pub struct Octree {
    region: Region,
    leaf_log2: u32,
    nodes: Vec<Option<OctreeNode>>,
    free: Vec<NodeIndex>,
    root: NodeIndex,
    clock: Arc<ChangeClock>,
    /// Negative solid counts per leaf anchor. Deltas from concurrent batches
    /// can commit out of order, so a count may dip below zero until the
    /// matching increment arrives. Such a leaf does not exist meanwhile.
    deficits: FxHashMap<IVec3, i64>,
}

impl Octree {
    /// Builds an empty octree over `region` with leaves of `leaf_size³` voxels.
    ///
    /// The region is aligned outward to the leaf grid.
    ///
    /// # Errors
    ///
    /// [`VolumeError::InvalidChunkSize`] if `leaf_size` is not a power of two
    /// in `2..=256`, [`VolumeError::InvalidRegion`] for the invalid sentinel.
    pub fn new(region: Region, leaf_size: u32, clock: Arc<ChangeClock>) -> Result<Self, VolumeError> {
        if !leaf_size.is_power_of_two() || !(2..=256).contains(&leaf_size) {
            return Err(VolumeError::InvalidChunkSize(leaf_size));
        }
        if !region.is_valid() {
            return Err(VolumeError::InvalidRegion {
                lower: region.lower_corner(),
                upper: region.upper_corner(),
            });
        }
        let region = region.aligned_outward(leaf_size as i32);
        let root = OctreeNode::new(region, None, clock.now());
        Ok(Self {
            region,
            leaf_log2: leaf_size.trailing_zeros(),
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: 0,
            clock,
            deficits: FxHashMap::default(),
        })
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Edge length of a leaf node in voxels.
    pub fn leaf_size(&self) -> i32 {
        1 << self.leaf_log2
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn root_node(&self) -> &OctreeNode {
        // The root slot is allocated in `new` and never freed.
        self.nodes[self.root as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("octree root missing"))
    }

    pub fn node(&self, index: NodeIndex) -> Option<&OctreeNode> {
        self.nodes.get(index as usize).and_then(Option::as_ref)
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Current logical time of the clock shared with the volume.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Calls `f(octant, index, node)` for every existing child of `index`.
    pub fn visit_existing_children<F>(&self, index: NodeIndex, mut f: F)
    where
        F: FnMut(usize, NodeIndex, &OctreeNode),
    {
        let Some(node) = self.node(index) else {
            return;
        };
        for (octant, child) in node.children() {
            if let Some(child_node) = self.node(child) {
                f(octant, child, child_node);
            }
        }
    }

    /// The leaf covering `pos`, if it exists.
    pub fn find_leaf(&self, pos: IVec3) -> Option<NodeIndex> {
        if !self.region.contains_point(pos) {
            return None;
        }
        let mut index = self.root;
        loop {
            let node = self.node(index)?;
            if self.is_leaf_level(&node.region) {
                return Some(index);
            }
            index = node.child(self.octant_of(&node.region, pos))?;
        }
    }

    /// Solid voxel count recorded for the leaf covering `pos`.
    pub fn occupancy(&self, pos: IVec3) -> u64 {
        self.find_leaf(pos)
            .and_then(|leaf| self.node(leaf))
            .map_or(0, OctreeNode::solid_voxels)
    }

    /// Records that the chunk containing `pos` holds `solid` non-empty voxels.
    ///
    /// Creates the leaf (and any missing ancestors) when a chunk gains its
    /// first solid voxel and prunes it when it becomes empty. Returns `true`
    /// if anything changed. Positions outside the octree region are ignored.
    pub fn set_occupancy(&mut self, pos: IVec3, solid: u64, now: Timestamp) -> bool {
        if !self.region.contains_point(pos) {
            return false;
        }
        self.deficits.remove(&self.leaf_anchor(pos));
        self.store_occupancy(pos, solid, now)
    }

    /// Applies a signed solid-count delta to the chunk containing `pos`.
    ///
    /// Deltas commute: the count is kept exactly, including below zero, and
    /// the leaf exists only while it is positive.
    pub fn adjust_occupancy(&mut self, pos: IVec3, delta: i64, now: Timestamp) -> bool {
        if delta == 0 || !self.region.contains_point(pos) {
            return false;
        }
        let anchor = self.leaf_anchor(pos);
        let current = match self.deficits.remove(&anchor) {
            Some(deficit) => deficit,
            None => self.occupancy(pos) as i64,
        };
        let updated = current + delta;
        if updated < 0 {
            self.deficits.insert(anchor, updated);
        }
        self.store_occupancy(pos, updated.max(0) as u64, now)
    }

    /// Signed solid count for the leaf covering `pos`, negative while
    /// decrements are waiting for their increments.
    pub fn solid_balance(&self, pos: IVec3) -> i64 {
        self.deficits
            .get(&self.leaf_anchor(pos))
            .copied()
            .unwrap_or_else(|| self.occupancy(pos) as i64)
    }

    fn leaf_anchor(&self, pos: IVec3) -> IVec3 {
        (pos >> self.leaf_log2) << self.leaf_log2
    }

    fn store_occupancy(&mut self, pos: IVec3, solid: u64, now: Timestamp) -> bool {
        let leaf_region = match self.find_leaf(pos) {
            Some(leaf) => {
                let Some(node) = self.node_mut(leaf) else {
                    return false;
                };
                if node.solid_voxels == solid {
                    return false;
                }
                node.solid_voxels = solid;
                let region = node.region;
                if solid == 0 {
                    self.prune(leaf, now);
                }
                region
            }
            None => {
                if solid == 0 {
                    return false;
                }
                let Some(leaf) = self.create_path(pos, now) else {
                    return false;
                };
                let Some(node) = self.node_mut(leaf) else {
                    return false;
                };
                node.solid_voxels = solid;
                node.region
            }
        };
        self.mark_mesh_changed(&leaf_region, now);
        true
    }

    /// Stamps `mesh_changed` on every node intersecting `region` and
    /// `subtree_changed` along the way. Returns the number of nodes stamped.
    pub fn mark_mesh_changed(&mut self, region: &Region, now: Timestamp) -> usize {
        let mut stamped = 0;
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let Some(node) = self.node_mut(index) else {
                continue;
            };
            if !node.region.intersects(region) {
                continue;
            }
            node.mesh_changed = now;
            node.bump_subtree(now);
            stamped += 1;
            stack.extend(node.children.iter().flatten());
        }
        stamped
    }

    /// Sets a node's visibility property, advancing the clock if it changed.
    pub fn set_visible(&mut self, index: NodeIndex, visible: bool) -> bool {
        match self.node(index) {
            Some(node) if node.visible != visible => {}
            _ => return false,
        }
        let now = self.clock.advance();
        self.apply_visibility(index, visible, now);
        true
    }

    /// Decides which nodes render their own mesh for a viewer at `viewer`.
    ///
    /// A node renders itself when no ancestor does and it is either childless
    /// or far enough away (`distance / width > lod_threshold`). The clock
    /// advances once if any node flipped. Returns the number of flipped nodes.
    pub fn update_visibility(&mut self, viewer: Vec3, lod_threshold: f32) -> usize {
        let mut flips = Vec::new();
        let mut stack = vec![(self.root, false)];
        while let Some((index, ancestor_renders)) = stack.pop() {
            let Some(node) = self.node(index) else {
                continue;
            };
            let renders = if ancestor_renders {
                false
            } else if !node.has_children() {
                true
            } else {
                let center = node.region.center().as_vec3() + Vec3::splat(0.5);
                let width = node.region.width_in_voxels() as f32;
                viewer.distance(center) / width > lod_threshold
            };
            if renders != node.visible {
                flips.push((index, renders));
            }
            let covered = ancestor_renders || renders;
            stack.extend(node.children().map(|(_, child)| (child, covered)));
        }

        if flips.is_empty() {
            return 0;
        }
        let now = self.clock.advance();
        for &(index, visible) in &flips {
            self.apply_visibility(index, visible, now);
        }
        tracing::debug!("visibility update flipped {} nodes at t={}", flips.len(), now);
        flips.len()
    }

    // -- internals ----------------------------------------------------------

    fn node_mut(&mut self, index: NodeIndex) -> Option<&mut OctreeNode> {
        self.nodes.get_mut(index as usize).and_then(Option::as_mut)
    }

    fn apply_visibility(&mut self, index: NodeIndex, visible: bool, now: Timestamp) {
        if let Some(node) = self.node_mut(index) {
            node.visible = visible;
            node.properties_changed = now;
            node.bump_subtree(now);
        }
        self.bump_ancestors(index, now);
    }

    fn bump_ancestors(&mut self, index: NodeIndex, now: Timestamp) {
        let mut parent = self.node(index).and_then(OctreeNode::parent);
        while let Some(p) = parent {
            let Some(node) = self.node_mut(p) else {
                break;
            };
            node.bump_subtree(now);
            parent = node.parent;
        }
    }

    fn is_leaf_level(&self, region: &Region) -> bool {
        region.dimensions().cmple(IVec3::splat(self.leaf_size())).all()
    }

    /// Last voxel of the lower half on each axis, and which axes are split.
    fn split(&self, region: &Region) -> (IVec3, [bool; 3]) {
        let leaf = self.leaf_size();
        let lower = region.lower_corner();
        let leaves = region.dimensions() / leaf;
        let mut mid = region.upper_corner();
        let mut split = [false; 3];
        for axis in 0..3 {
            if leaves[axis] > 1 {
                let lower_half = (leaves[axis] + 1) / 2;
                mid[axis] = lower[axis] + lower_half * leaf - 1;
                split[axis] = true;
            }
        }
        (mid, split)
    }

    fn octant_of(&self, region: &Region, pos: IVec3) -> usize {
        let (mid, split) = self.split(region);
        let mut octant = 0;
        for axis in 0..3 {
            if split[axis] && pos[axis] > mid[axis] {
                octant |= 1 << axis;
            }
        }
        octant
    }

    /// Region covered by `octant` of `region`, or `None` if that octant does
    /// not exist because the axis is a single leaf wide.
    pub fn child_region(&self, region: &Region, octant: usize) -> Option<Region> {
        let (mid, split) = self.split(region);
        let mut lower = region.lower_corner();
        let mut upper = region.upper_corner();
        for axis in 0..3 {
            let upper_half = octant & (1 << axis) != 0;
            match (split[axis], upper_half) {
                (false, true) => return None,
                (false, false) => {}
                (true, false) => upper[axis] = mid[axis],
                (true, true) => lower[axis] = mid[axis] + 1,
            }
        }
        Some(Region::from_ordered(lower, upper))
    }

    fn alloc(&mut self, node: OctreeNode) -> NodeIndex {
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = Some(node);
            index
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as NodeIndex
        }
    }

    /// Walks from the root to the leaf covering `pos`, creating missing nodes.
    fn create_path(&mut self, pos: IVec3, now: Timestamp) -> Option<NodeIndex> {
        let mut index = self.root;
        loop {
            let node = self.node(index)?;
            let region = node.region;
            if self.is_leaf_level(&region) {
                return Some(index);
            }
            let octant = self.octant_of(&region, pos);
            if let Some(child) = node.child(octant) {
                index = child;
                continue;
            }
            let Some(child_region) = self.child_region(&region, octant) else {
                tracing::error!("octant {} of {} does not exist", octant, region);
                return None;
            };
            let child = self.alloc(OctreeNode::new(child_region, Some(index), now));
            let parent = self.node_mut(index)?;
            parent.children[octant] = Some(child);
            parent.structure_changed = now;
            parent.bump_subtree(now);
            index = child;
        }
    }

    /// Removes an empty leaf and every ancestor left without children.
    fn prune(&mut self, leaf: NodeIndex, now: Timestamp) {
        let mut current = leaf;
        while current != self.root {
            let Some(node) = self.nodes.get_mut(current as usize).and_then(Option::take) else {
                break;
            };
            self.free.push(current);
            let Some(parent_index) = node.parent else {
                break;
            };
            let Some(parent) = self.node_mut(parent_index) else {
                break;
            };
            for slot in parent.children.iter_mut() {
                if *slot == Some(current) {
                    *slot = None;
                }
            }
            parent.structure_changed = now;
            parent.bump_subtree(now);
            if parent.has_children() {
                break;
            }
            current = parent_index;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
