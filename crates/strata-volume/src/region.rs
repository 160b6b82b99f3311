//! Inclusive integer boxes used to address voxels, chunks and octree nodes.

use std::fmt;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

/// Axis-aligned voxel box with inclusive `lower` and `upper` corners.
///
/// Invariant: either `lower <= upper` on every axis, or the region is the
/// [`Region::INVALID`] sentinel. The fields are private so the invariant
/// cannot be broken after construction. Deserialization goes through the
/// same check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RegionCorners", into = "RegionCorners")]
pub struct Region {
    lower: IVec3,
    upper: IVec3,
}

/// Unchecked serialized form of a [`Region`].
#[derive(Clone, Copy, Serialize, Deserialize)]
struct RegionCorners {
    lower: IVec3,
    upper: IVec3,
}

impl TryFrom<RegionCorners> for Region {
    type Error = VolumeError;

    fn try_from(corners: RegionCorners) -> Result<Self, Self::Error> {
        let RegionCorners { lower, upper } = corners;
        if lower == Region::INVALID.lower && upper == Region::INVALID.upper {
            return Ok(Region::INVALID);
        }
        Region::new(lower, upper)
    }
}

impl From<Region> for RegionCorners {
    fn from(region: Region) -> Self {
        Self {
            lower: region.lower,
            upper: region.upper,
        }
    }
}

impl Region {
    /// Sentinel for "no region". Acts as the identity for [`Region::union`].
    pub const INVALID: Region = Region {
        lower: IVec3::splat(i32::MAX),
        upper: IVec3::splat(i32::MIN),
    };

    /// The largest addressable region. A quarter of the `i32` range on each
    /// side so that widths, growth and outward alignment never overflow.
    pub const MAX: Region = Region {
        lower: IVec3::splat(i32::MIN / 4),
        upper: IVec3::splat(i32::MAX / 4),
    };

    /// Creates a region from inclusive corners.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidRegion`] if `lower > upper` on any axis.
    pub fn new(lower: IVec3, upper: IVec3) -> Result<Self, VolumeError> {
        if lower.cmpgt(upper).any() {
            return Err(VolumeError::InvalidRegion { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// Creates the cube `[min, max]` on every axis.
    pub fn cube(min: i32, max: i32) -> Result<Self, VolumeError> {
        Self::new(IVec3::splat(min), IVec3::splat(max))
    }

    /// Region covering exactly one voxel.
    pub fn single(pos: IVec3) -> Self {
        Self {
            lower: pos,
            upper: pos,
        }
    }

    /// Builds a region from corners that are already known to be ordered.
    pub(crate) fn from_ordered(lower: IVec3, upper: IVec3) -> Self {
        debug_assert!(lower.cmple(upper).all(), "unordered corners {lower} {upper}");
        Self { lower, upper }
    }

    pub fn is_valid(&self) -> bool {
        self.lower.cmple(self.upper).all()
    }

    pub fn lower_corner(&self) -> IVec3 {
        self.lower
    }

    pub fn upper_corner(&self) -> IVec3 {
        self.upper
    }

    /// Number of voxels along each axis.
    pub fn dimensions(&self) -> IVec3 {
        self.upper - self.lower + IVec3::ONE
    }

    pub fn width_in_voxels(&self) -> i32 {
        self.upper.x - self.lower.x + 1
    }

    pub fn height_in_voxels(&self) -> i32 {
        self.upper.y - self.lower.y + 1
    }

    pub fn depth_in_voxels(&self) -> i32 {
        self.upper.z - self.lower.z + 1
    }

    /// Center voxel, rounded towards the lower corner.
    pub fn center(&self) -> IVec3 {
        self.lower + (self.upper - self.lower) / 2
    }

    /// Total number of voxels (`0` for the invalid sentinel).
    pub fn voxel_count(&self) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        let d = self.dimensions().as_i64vec3();
        (d.x * d.y * d.z) as u64
    }

    pub fn contains_point(&self, pos: IVec3) -> bool {
        pos.cmpge(self.lower).all() && pos.cmple(self.upper).all()
    }

    /// `true` if `other` lies entirely inside this region.
    pub fn contains_region(&self, other: &Region) -> bool {
        other.is_valid() && self.contains_point(other.lower) && self.contains_point(other.upper)
    }

    /// `true` if the two regions share at least one voxel.
    pub fn intersects(&self, other: &Region) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.lower.cmple(other.upper).all()
            && self.upper.cmpge(other.lower).all()
    }

    /// The overlapping part of both regions, if any.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        if !self.intersects(other) {
            return None;
        }
        Some(Region {
            lower: self.lower.max(other.lower),
            upper: self.upper.min(other.upper),
        })
    }

    /// Smallest region enclosing both.
    pub fn union(&self, other: &Region) -> Region {
        if !self.is_valid() {
            return *other;
        }
        if !other.is_valid() {
            return *self;
        }
        Region {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Extends the region to include `pos`.
    pub fn union_point(&self, pos: IVec3) -> Region {
        self.union(&Region::single(pos))
    }

    /// Expands every face outward by `amount` voxels, saturating at the `i32` range.
    pub fn grown(&self, amount: i32) -> Region {
        if !self.is_valid() {
            return *self;
        }
        let a = IVec3::splat(amount);
        Region {
            lower: self.lower.saturating_sub(a),
            upper: self.upper.saturating_add(a),
        }
    }

    pub fn shifted(&self, offset: IVec3) -> Region {
        if !self.is_valid() {
            return *self;
        }
        Region {
            lower: self.lower + offset,
            upper: self.upper + offset,
        }
    }

    /// Snaps the region outward to multiples of `cell` (a power of two).
    pub fn aligned_outward(&self, cell: i32) -> Region {
        debug_assert!(cell > 0 && (cell & (cell - 1)) == 0);
        if !self.is_valid() {
            return *self;
        }
        let mask = !(cell - 1);
        let lower = IVec3::new(self.lower.x & mask, self.lower.y & mask, self.lower.z & mask);
        let upper = IVec3::new(
            (self.upper.x & mask) + (cell - 1),
            (self.upper.y & mask) + (cell - 1),
            (self.upper.z & mask) + (cell - 1),
        );
        Region { lower, upper }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "region[invalid]");
        }
        write!(
            f,
            "region[({}, {}, {})..=({}, {}, {})]",
            self.lower.x, self.lower.y, self.lower.z, self.upper.x, self.upper.y, self.upper.z
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn region(l: (i32, i32, i32), u: (i32, i32, i32)) -> Region {
        Region::new(IVec3::new(l.0, l.1, l.2), IVec3::new(u.0, u.1, u.2)).unwrap()
    }

    #[test]
    fn test_inverted_region_rejected() {
        let result = Region::new(IVec3::new(5, 0, 0), IVec3::new(4, 10, 10));
        assert!(matches!(result, Err(VolumeError::InvalidRegion { .. })));
    }

    #[test]
    fn test_deserialize_rejects_inverted_corners() {
        let json = r#"{"lower":[5,0,0],"upper":[4,10,10]}"#;
        let err = serde_json::from_str::<Region>(json).unwrap_err();
        assert!(err.to_string().contains("invalid region"));

        let ok: Region = serde_json::from_str(r#"{"lower":[0,0,0],"upper":[4,10,10]}"#).unwrap();
        assert_eq!(ok, region((0, 0, 0), (4, 10, 10)));
    }

    #[test]
    fn test_serialized_sentinel_reads_back() {
        let json = serde_json::to_string(&Region::INVALID).unwrap();
        assert_eq!(serde_json::from_str::<Region>(&json).unwrap(), Region::INVALID);
    }

    #[test]
    fn test_single_voxel_region_is_valid() {
        let r = Region::single(IVec3::new(-3, 2, 9));
        assert!(r.is_valid());
        assert_eq!(r.voxel_count(), 1);
        assert_eq!(r.dimensions(), IVec3::ONE);
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!Region::INVALID.is_valid());
        assert_eq!(Region::INVALID.voxel_count(), 0);
        assert!(!Region::INVALID.contains_point(IVec3::ZERO));
        assert_eq!(Region::default(), Region::INVALID);
    }

    #[test]
    fn test_dimensions_and_center() {
        let r = region((-1, -1, -1), (1, 1, 1));
        assert_eq!(r.width_in_voxels(), 3);
        assert_eq!(r.height_in_voxels(), 3);
        assert_eq!(r.depth_in_voxels(), 3);
        assert_eq!(r.center(), IVec3::ZERO);
        assert_eq!(r.voxel_count(), 27);
    }

    #[test]
    fn test_contains_point_on_boundary() {
        let r = region((0, 0, 0), (15, 15, 15));
        assert!(r.contains_point(IVec3::ZERO));
        assert!(r.contains_point(IVec3::splat(15)));
        assert!(!r.contains_point(IVec3::new(16, 0, 0)));
        assert!(!r.contains_point(IVec3::new(0, -1, 0)));
    }

    #[test]
    fn test_intersection_of_overlapping() {
        let a = region((0, 0, 0), (10, 10, 10));
        let b = region((5, -5, 8), (20, 5, 30));
        let i = a.intersection(&b).expect("regions overlap");
        assert_eq!(i, region((5, 0, 8), (10, 5, 10)));
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn test_touching_faces_intersect_but_adjacent_do_not() {
        let a = region((0, 0, 0), (15, 15, 15));
        let touching = region((15, 0, 0), (31, 15, 15));
        let adjacent = region((16, 0, 0), (31, 15, 15));
        assert!(a.intersects(&touching));
        assert!(!a.intersects(&adjacent));
        assert!(a.intersection(&adjacent).is_none());
    }

    #[test]
    fn test_union_with_invalid_is_identity() {
        let a = region((1, 2, 3), (4, 5, 6));
        assert_eq!(Region::INVALID.union(&a), a);
        assert_eq!(a.union(&Region::INVALID), a);
        let grown = Region::INVALID.union_point(IVec3::ZERO).union_point(IVec3::new(3, -1, 2));
        assert_eq!(grown, region((0, -1, 0), (3, 0, 2)));
    }

    #[test]
    fn test_grown_and_shifted() {
        let r = Region::single(IVec3::splat(15)).grown(1);
        assert_eq!(r, region((14, 14, 14), (16, 16, 16)));
        assert_eq!(r.shifted(IVec3::new(1, 0, -1)), region((15, 14, 13), (17, 16, 15)));
    }

    #[test]
    fn test_grown_saturates() {
        let r = Region::new(IVec3::splat(i32::MIN), IVec3::splat(i32::MAX)).unwrap();
        assert_eq!(r.grown(4), r);
    }

    #[test]
    fn test_aligned_outward_handles_negative_coordinates() {
        let r = region((-1, 0, 17), (3, 15, 17));
        assert_eq!(r.aligned_outward(16), region((-16, 0, 16), (15, 15, 31)));
    }

    #[test]
    fn test_contains_region() {
        let outer = region((-8, -8, -8), (8, 8, 8));
        assert!(outer.contains_region(&region((-1, -1, -1), (1, 1, 1))));
        assert!(!outer.contains_region(&region((-1, -1, -1), (9, 1, 1))));
        assert!(!outer.contains_region(&Region::INVALID));
    }
}
