//! Incremental synchronization of consumer-side mirror trees.
//!
//! A consumer (renderer, collision builder, network replicator) keeps a tree of
//! [`MirrorNode`]s shaped like the [`Octree`]. Each mirror node remembers the
//! source timestamps it last saw; [`sync_mirror`] walks the octree, skips every
//! subtree whose `subtree_changed` stamp is not newer than the mirror's, and
//! calls the [`SyncHandler`] only for the change classes that actually moved.
//!
//! Mirrors record the source node's timestamps rather than the current clock
//! time, so an edit committed concurrently with a sync is never skipped by the
//! next one.

use crate::change::Timestamp;
use crate::octree::{NodeIndex, Octree, OctreeNode};

/// Consumer-side copy of one octree node.
#[derive(Debug)]
pub struct MirrorNode<T> {
    pub data: T,
    properties_synced: Timestamp,
    mesh_synced: Timestamp,
    structure_synced: Timestamp,
    subtree_synced: Timestamp,
    children: [Option<Box<MirrorNode<T>>>; 8],
}

impl<T> MirrorNode<T> {
    /// A mirror that has never been synced.
    pub fn new(data: T) -> Self {
        Self {
            data,
            properties_synced: 0,
            mesh_synced: 0,
            structure_synced: 0,
            subtree_synced: 0,
            children: Default::default(),
        }
    }

    pub fn child(&self, octant: usize) -> Option<&MirrorNode<T>> {
        self.children.get(octant).and_then(|c| c.as_deref())
    }

    pub fn children(&self) -> impl Iterator<Item = (usize, &MirrorNode<T>)> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(octant, c)| c.as_deref().map(|c| (octant, c)))
    }

    /// Number of mirror nodes in this subtree, this one included.
    pub fn node_count(&self) -> usize {
        1 + self.children().map(|(_, c)| c.node_count()).sum::<usize>()
    }

    pub fn properties_synced(&self) -> Timestamp {
        self.properties_synced
    }

    pub fn mesh_synced(&self) -> Timestamp {
        self.mesh_synced
    }

    pub fn structure_synced(&self) -> Timestamp {
        self.structure_synced
    }

    pub fn subtree_synced(&self) -> Timestamp {
        self.subtree_synced
    }
}

/// Callbacks that refresh consumer state from octree nodes.
pub trait SyncHandler<T> {
    /// Builds consumer data for a newly discovered octree node.
    fn create(&mut self, node: &OctreeNode) -> T;

    /// The node's properties (e.g. visibility) changed.
    fn sync_properties(&mut self, node: &OctreeNode, data: &mut T);

    /// The node's mesh is stale: voxels under it changed.
    fn sync_mesh(&mut self, node: &OctreeNode, data: &mut T);

    /// The octree node went away; release its consumer data.
    fn destroy(&mut self, data: T) {
        drop(data);
    }
}

/// Work done by one [`sync_mirror`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Nodes whose stamps were compared.
    pub visited: usize,
    /// Subtrees skipped because nothing below them changed.
    pub skipped: usize,
    pub properties_fetched: usize,
    pub meshes_fetched: usize,
    /// Nodes whose child set was reconciled.
    pub structure_synced: usize,
    pub created: usize,
    pub destroyed: usize,
}

impl SyncStats {
    /// True if the pass changed nothing on the consumer side.
    pub fn is_noop(&self) -> bool {
        self.properties_fetched == 0
            && self.meshes_fetched == 0
            && self.structure_synced == 0
            && self.created == 0
            && self.destroyed == 0
    }
}

/// Brings `mirror` (which mirrors the octree root) up to date.
pub fn sync_mirror<T, H>(octree: &Octree, mirror: &mut MirrorNode<T>, handler: &mut H) -> SyncStats
where
    H: SyncHandler<T> + ?Sized,
{
    let mut stats = SyncStats::default();
    sync_node(octree, octree.root(), mirror, handler, &mut stats);
    stats
}

fn sync_node<T, H>(
    octree: &Octree,
    index: NodeIndex,
    mirror: &mut MirrorNode<T>,
    handler: &mut H,
    stats: &mut SyncStats,
) where
    H: SyncHandler<T> + ?Sized,
{
    let Some(node) = octree.node(index) else {
        return;
    };
    stats.visited += 1;
    if node.subtree_changed() <= mirror.subtree_synced {
        stats.skipped += 1;
        return;
    }

    if node.properties_changed() > mirror.properties_synced {
        handler.sync_properties(node, &mut mirror.data);
        mirror.properties_synced = node.properties_changed();
        stats.properties_fetched += 1;
    }
    if node.mesh_changed() > mirror.mesh_synced {
        handler.sync_mesh(node, &mut mirror.data);
        mirror.mesh_synced = node.mesh_changed();
        stats.meshes_fetched += 1;
    }
    if node.structure_changed() > mirror.structure_synced {
        for octant in 0..8 {
            match (node.child(octant), mirror.children[octant].is_some()) {
                (Some(child), false) => {
                    if let Some(child_node) = octree.node(child) {
                        let data = handler.create(child_node);
                        mirror.children[octant] = Some(Box::new(MirrorNode::new(data)));
                        stats.created += 1;
                    }
                }
                (None, true) => {
                    if let Some(gone) = mirror.children[octant].take() {
                        stats.destroyed += destroy_subtree(*gone, handler);
                    }
                }
                _ => {}
            }
        }
        mirror.structure_synced = node.structure_changed();
        stats.structure_synced += 1;
    }

    for (octant, child) in node.children() {
        if let Some(child_mirror) = mirror.children[octant].as_deref_mut() {
            sync_node(octree, child, child_mirror, handler, stats);
        }
    }
    mirror.subtree_synced = node.subtree_changed();
}

fn destroy_subtree<T, H>(mirror: MirrorNode<T>, handler: &mut H) -> usize
where
    H: SyncHandler<T> + ?Sized,
{
    let MirrorNode { data, children, .. } = mirror;
    let mut destroyed = 1;
    for child in children.into_iter().flatten() {
        destroyed += destroy_subtree(*child, handler);
    }
    handler.destroy(data);
    destroyed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::{IVec3, Vec3};

    use super::*;
    use crate::change::ChangeClock;
    use crate::region::Region;

    #[derive(Default)]
    struct Recorder {
        created: Vec<Region>,
        meshes: Vec<Region>,
        properties: Vec<Region>,
        destroyed: Vec<Region>,
    }

    impl SyncHandler<Region> for Recorder {
        fn create(&mut self, node: &OctreeNode) -> Region {
            self.created.push(node.region());
            node.region()
        }

        fn sync_properties(&mut self, node: &OctreeNode, _data: &mut Region) {
            self.properties.push(node.region());
        }

        fn sync_mesh(&mut self, node: &OctreeNode, _data: &mut Region) {
            self.meshes.push(node.region());
        }

        fn destroy(&mut self, data: Region) {
            self.destroyed.push(data);
        }
    }

    fn setup() -> (Octree, Arc<ChangeClock>) {
        let clock = Arc::new(ChangeClock::new());
        let tree = Octree::new(Region::cube(-64, 63).unwrap(), 16, Arc::clone(&clock)).unwrap();
        (tree, clock)
    }

    fn root_mirror(tree: &Octree) -> MirrorNode<Region> {
        MirrorNode::new(tree.region())
    }

    #[test]
    fn test_first_sync_builds_whole_mirror() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::new(1, 1, 1), 1, t);
        tree.set_occupancy(IVec3::new(-30, 1, 1), 1, t);

        let mut mirror = root_mirror(&tree);
        let mut handler = Recorder::default();
        let stats = sync_mirror(&tree, &mut mirror, &mut handler);

        assert_eq!(mirror.node_count(), tree.node_count());
        assert_eq!(stats.created, tree.node_count() - 1);
        assert_eq!(stats.meshes_fetched, tree.node_count());
        assert_eq!(mirror.subtree_synced(), tree.root_node().subtree_changed());
    }

    #[test]
    fn test_second_sync_is_noop() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::ZERO, 4, t);
        let mut mirror = root_mirror(&tree);
        let mut handler = Recorder::default();
        sync_mirror(&tree, &mut mirror, &mut handler);

        let stats = sync_mirror(&tree, &mut mirror, &mut handler);
        assert!(stats.is_noop());
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_local_edit_skips_untouched_subtrees() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::new(1, 1, 1), 1, t);
        tree.set_occupancy(IVec3::new(-30, -30, -30), 1, t);
        let mut mirror = root_mirror(&tree);
        let mut handler = Recorder::default();
        sync_mirror(&tree, &mut mirror, &mut handler);
        handler.meshes.clear();

        let t = clock.advance();
        tree.mark_mesh_changed(&Region::single(IVec3::new(2, 2, 2)), t);
        let stats = sync_mirror(&tree, &mut mirror, &mut handler);

        // Root, 64, 32 and the leaf on the positive branch; the negative branch is skipped.
        assert_eq!(stats.meshes_fetched, 4);
        assert_eq!(stats.skipped, 1);
        assert!(handler.meshes.iter().all(|r| r.contains_point(IVec3::new(2, 2, 2))));
        assert_eq!(stats.created + stats.destroyed, 0);
    }

    #[test]
    fn test_pruned_nodes_are_destroyed_in_mirror() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::new(1, 1, 1), 1, t);
        tree.set_occupancy(IVec3::new(-30, 1, 1), 1, t);
        let mut mirror = root_mirror(&tree);
        let mut handler = Recorder::default();
        sync_mirror(&tree, &mut mirror, &mut handler);
        let before = mirror.node_count();

        let t = clock.advance();
        tree.set_occupancy(IVec3::new(1, 1, 1), 0, t);
        let stats = sync_mirror(&tree, &mut mirror, &mut handler);

        assert_eq!(stats.destroyed, 3);
        assert_eq!(handler.destroyed.len(), 3);
        assert_eq!(mirror.node_count(), before - 3);
        assert_eq!(mirror.node_count(), tree.node_count());
    }

    #[test]
    fn test_visibility_change_fetches_properties_only() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::ZERO, 1, t);
        let mut mirror = root_mirror(&tree);
        let mut handler = Recorder::default();
        sync_mirror(&tree, &mut mirror, &mut handler);

        tree.update_visibility(Vec3::splat(10_000.0), 1.0);
        let stats = sync_mirror(&tree, &mut mirror, &mut handler);
        assert_eq!(stats.properties_fetched, 3);
        assert_eq!(stats.meshes_fetched, 0);
        assert_eq!(stats.structure_synced, 0);
    }

    #[test]
    fn test_mirror_records_source_stamps_not_clock() {
        let (mut tree, clock) = setup();
        let t = clock.advance();
        tree.set_occupancy(IVec3::ZERO, 1, t);
        // Clock moves on without touching the tree.
        clock.advance();
        clock.advance();
        let mut mirror = root_mirror(&tree);
        sync_mirror(&tree, &mut mirror, &mut Recorder::default());
        assert_eq!(mirror.mesh_synced(), t);
        assert_eq!(mirror.subtree_synced(), t);
    }
}
