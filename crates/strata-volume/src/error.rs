//! Error types for volume access and pager collaborators.

use glam::IVec3;
use thiserror::Error;

/// Errors surfaced to volume callers.
///
/// Pager failures are not part of this enum: they are recovered inside the
/// volume (empty chunk substituted, or data dropped on eviction) and only
/// logged and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VolumeError {
    /// The voxel address lies outside the configured maximum world region.
    #[error("voxel ({x}, {y}, {z}) is outside the volume bounds")]
    OutOfBounds { x: i32, y: i32, z: i32 },
    /// A region with `lower > upper` on some axis was requested.
    #[error("invalid region: lower {lower} exceeds upper {upper}")]
    InvalidRegion { lower: IVec3, upper: IVec3 },
    /// Chunk edge length is not a power of two in `2..=256`.
    #[error("chunk size {0} must be a power of two between 2 and 256")]
    InvalidChunkSize(u32),
    /// Any other rejected construction parameter.
    #[error("invalid volume configuration: {0}")]
    InvalidConfig(String),
}

impl VolumeError {
    pub(crate) fn out_of_bounds(pos: IVec3) -> Self {
        Self::OutOfBounds {
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// Errors reported by a [`Pager`](crate::Pager) implementation.
#[derive(Debug, Error)]
pub enum PagerError {
    /// Underlying storage I/O failed.
    #[error("pager I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The backing store (network peer, generator) could not serve the request.
    #[error("pager backend unavailable: {0}")]
    Unavailable(String),
    /// Stored chunk data could not be decoded.
    #[error("chunk at {pos} is corrupt: {reason}")]
    Corrupt { pos: IVec3, reason: String },
}
