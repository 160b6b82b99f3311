//! Renderer-side mirror of the volume's change octree.
//!
//! Stands in for a real mesh cache: every node carries the mesh stamp it was
//! last rebuilt at, and rebuilds are counted instead of performed.

use strata_volume::{
    MirrorNode, OctreeNode, PagedVolume, Region, SyncHandler, SyncStats, Timestamp, VoxelId,
};

/// Per-node renderer state.
#[derive(Clone, Debug, Default)]
pub struct NodeMesh {
    pub region: Region,
    pub visible: bool,
    /// `mesh_changed` stamp of the octree node when this mesh was built.
    pub built_at: Timestamp,
    pub rebuilds: u32,
}

/// Counts the work a renderer would do while syncing.
#[derive(Debug, Default)]
pub struct MeshCounter {
    pub live_nodes: usize,
    pub mesh_rebuilds: usize,
    pub property_updates: usize,
}

impl SyncHandler<NodeMesh> for MeshCounter {
    fn create(&mut self, node: &OctreeNode) -> NodeMesh {
        self.live_nodes += 1;
        NodeMesh {
            region: node.region(),
            visible: node.visible(),
            ..Default::default()
        }
    }

    fn sync_properties(&mut self, node: &OctreeNode, data: &mut NodeMesh) {
        self.property_updates += 1;
        data.visible = node.visible();
    }

    fn sync_mesh(&mut self, node: &OctreeNode, data: &mut NodeMesh) {
        self.mesh_rebuilds += 1;
        data.built_at = node.mesh_changed();
        data.rebuilds += 1;
    }

    fn destroy(&mut self, _data: NodeMesh) {
        self.live_nodes -= 1;
    }
}

/// Mirror tree plus its handler, synced once per frame.
pub struct RenderMirror {
    root: MirrorNode<NodeMesh>,
    counter: MeshCounter,
}

impl RenderMirror {
    pub fn new(volume: &PagedVolume<VoxelId>) -> Self {
        let region = volume.with_octree(|octree| octree.region());
        Self {
            root: MirrorNode::new(NodeMesh {
                region,
                ..Default::default()
            }),
            // The root mirror exists before the first sync.
            counter: MeshCounter {
                live_nodes: 1,
                ..Default::default()
            },
        }
    }

    pub fn sync(&mut self, volume: &PagedVolume<VoxelId>) -> SyncStats {
        volume.sync_mirror(&mut self.root, &mut self.counter)
    }

    pub fn counter(&self) -> &MeshCounter {
        &self.counter
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Nodes currently flagged for rendering.
    pub fn visible_nodes(&self) -> usize {
        fn count(node: &MirrorNode<NodeMesh>) -> usize {
            usize::from(node.data.visible) + node.children().map(|(_, c)| count(c)).sum::<usize>()
        }
        count(&self.root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
