//! Sparse, demand-paged voxel storage with LRU eviction and octree change tracking.
//!
//! A [`PagedVolume`] addresses voxels by signed integer coordinates and keeps a
//! bounded set of fixed-size [`Chunk`]s resident. Misses are filled through a
//! [`Pager`]; dirty chunks are handed back to it on eviction. Every committed
//! edit advances a per-volume [`ChangeClock`] and stamps the affected
//! [`Octree`] nodes so consumers can resynchronize incrementally with
//! [`sync_mirror`].

pub mod change;
pub mod chunk;
pub mod error;
pub mod extraction;
pub mod octree;
pub mod paged_volume;
pub mod pager;
pub mod region;
pub mod sampler;
pub mod sync;
pub mod voxel;

pub use change::{ChangeClock, Timestamp};
pub use chunk::{Chunk, ChunkPos, ChunkState};
pub use error::{PagerError, VolumeError};
pub use extraction::ExtractionQueue;
pub use octree::{NodeIndex, Octree, OctreeNode};
pub use paged_volume::{FlushReport, PagedVolume, VolumeSettings, VolumeStats};
pub use pager::{MemoryPager, NullPager, Pager, PagerContext};
pub use region::Region;
pub use sampler::Sampler;
pub use sync::{MirrorNode, SyncHandler, SyncStats, sync_mirror};
pub use voxel::{Voxel, VoxelId};
