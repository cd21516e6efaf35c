//! HEALPix quad-tree addressing on the sphere.
//!
//! Twelve equal-area base patches, each recursively split into four. A tile
//! is named by (level, root, patch) where `patch` is the Morton index of the
//! tile within its base patch. All functions here are pure; together they
//! define the on-the-wire meaning of a [`TileId`] and must not change.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_4, PI};

/// Number of HEALPix base patches.
pub const NUM_ROOTS: usize = 12;

/// Maximum depth of a tile quad tree, including the root level. The Morton
/// patch index of a level-31 tile occupies 62 bits, so this bound also keeps
/// [`TileId::patch`] well-formed.
pub const MAX_TREE_DEPTH: usize = 32;

/// Northing offsets of the twelve base patches, in units of one patch side.
/// Index is the root index; rows of four cover the north, equator and south
/// bands respectively.
const F1: [i32; NUM_ROOTS] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];

/// Easting offsets of the twelve base patches, in units of pi/4 longitude.
const F2: [i32; NUM_ROOTS] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Identifier of one patch of the subdivided sphere.
///
/// `patch` interleaves the x (even bits) and y (odd bits) coordinates of the
/// tile within its base patch; the four children of a tile extend its patch
/// index by two low bits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TileId {
    pub level: i32,
    pub root: u8,
    pub patch: u64,
}

impl TileId {
    pub const fn new(level: i32, root: u8, patch: u64) -> Self {
        Self { level, root, patch }
    }

    /// The level-0 tile covering base patch `root`.
    pub const fn root_id(root: u8) -> Self {
        Self::new(0, root, 0)
    }

    /// Child `k` (0..4) of this tile; bit 0 of `k` steps in x, bit 1 in y.
    pub fn child(self, k: usize) -> TileId {
        debug_assert!(k < 4);
        debug_assert!((self.level as usize) < MAX_TREE_DEPTH - 1);
        TileId::new(self.level + 1, self.root, (self.patch << 2) | k as u64)
    }

    /// Parent tile, or `None` for a base patch.
    pub fn parent(self) -> Option<TileId> {
        if self.level == 0 {
            None
        } else {
            Some(TileId::new(self.level - 1, self.root, self.patch >> 2))
        }
    }

    /// Which of its parent's children this tile is.
    pub fn child_index(self) -> usize {
        (self.patch & 3) as usize
    }

    /// Sibling `k` of this tile (the parent's k-th child).
    pub fn sibling(self, k: usize) -> TileId {
        self.parent()
            .expect("base patches have no siblings")
            .child(k)
    }

    /// Number of tiles along one side of the base patch at this level.
    pub fn n_side(self) -> i64 {
        1_i64 << self.level
    }

    /// (root, x, y) integer coordinates of the tile within its base patch.
    pub fn base_xy(self) -> (u8, u64, u64) {
        (self.root, compact_bits(self.patch), compact_bits(self.patch >> 1))
    }

    /// Northing projection factor of the base patch, a shader uniform used
    /// to reconstruct vertex positions.
    pub fn f1(self) -> i32 {
        F1[self.root as usize]
    }

    /// Easting projection factor of the base patch.
    pub fn f2(self) -> i32 {
        F2[self.root as usize]
    }

    /// The four spherical corners of the tile in canonical order
    /// (north, west, south, east), each as (longitude, latitude) radians.
    pub fn corners_lng_lat(self) -> [DVec2; 4] {
        let (root, x, y) = self.base_xy();
        let n = self.n_side() as f64;
        let x = x as f64;
        let y = y as f64;
        [
            patch_to_lng_lat(root, (x + 1.0) / n, (y + 1.0) / n),
            patch_to_lng_lat(root, x / n, (y + 1.0) / n),
            patch_to_lng_lat(root, x / n, y / n),
            patch_to_lng_lat(root, (x + 1.0) / n, y / n),
        ]
    }

    /// Spherical center of the tile as (longitude, latitude) radians.
    pub fn center_lng_lat(self) -> DVec2 {
        let (root, x, y) = self.base_xy();
        let n = self.n_side() as f64;
        patch_to_lng_lat(root, (x as f64 + 0.5) / n, (y as f64 + 0.5) / n)
    }
}

/// Inverse HEALPix projection: map face-local coordinates (u, v) in [0, 1]
/// of base patch `root` to (longitude, latitude) in radians.
///
/// u increases towards the east corner, v towards the west corner; (1, 1) is
/// the north corner of the patch.
pub fn patch_to_lng_lat(root: u8, u: f64, v: f64) -> DVec2 {
    let f1 = F1[root as usize] as f64;
    let f2 = F2[root as usize] as f64;

    // Ring coordinate: 0 at the north pole, 4 at the south pole.
    let jr = f1 - u - v;

    let (z, phi) = if jr < 1.0 {
        // north polar cap; longitude contracts towards the pole
        let t = jr;
        let z = 1.0 - t * t / 3.0;
        let phi = if t.abs() < 1e-12 {
            FRAC_PI_4 * f2
        } else {
            FRAC_PI_4 * (f2 + (u - v) / t)
        };
        (z, phi)
    } else if jr > 3.0 {
        // south polar cap
        let t = 4.0 - jr;
        let z = -1.0 + t * t / 3.0;
        let phi = if t.abs() < 1e-12 {
            FRAC_PI_4 * f2
        } else {
            FRAC_PI_4 * (f2 + (u - v) / t)
        };
        (z, phi)
    } else {
        // equatorial band
        ((2.0 - jr) * 2.0 / 3.0, FRAC_PI_4 * (f2 + (u - v)))
    };

    let lng = wrap_lng(phi);
    DVec2::new(lng, z.clamp(-1.0, 1.0).asin())
}

/// Unit surface normal of the sphere at (longitude, latitude).
pub fn lng_lat_to_normal(lng_lat: DVec2) -> DVec3 {
    let (sin_lng, cos_lng) = lng_lat.x.sin_cos();
    let (sin_lat, cos_lat) = lng_lat.y.sin_cos();
    DVec3::new(cos_lat * cos_lng, cos_lat * sin_lng, sin_lat)
}

/// Map (longitude, latitude) plus an elevation to a cartesian point in the
/// planet's local frame, for an ellipsoid with the given radii. Elevation is
/// applied along the geocentric normal.
pub fn to_cartesian(lng_lat: DVec2, radii: DVec3, height: f64) -> DVec3 {
    let normal = lng_lat_to_normal(lng_lat);
    radii * normal + height * normal
}

/// Wrap a longitude into (-pi, pi].
fn wrap_lng(phi: f64) -> f64 {
    let w = (phi + PI).rem_euclid(2.0 * PI) - PI;
    if w <= -PI {
        w + 2.0 * PI
    } else {
        w
    }
}

/// Drop the odd bits of `v` and pack the even bits together.
fn compact_bits(v: u64) -> u64 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    v = (v | (v >> 16)) & 0x0000_0000_ffff_ffff;
    v
}
