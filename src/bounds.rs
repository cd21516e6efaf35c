//! Model-space bounding volumes and view frusta.
//!
//! All geometry here is double precision; planetary scales leave f32 short
//! of a usable epsilon near the surface.

use glam::{DMat4, DVec3, DVec4};

use crate::healpix::{patch_to_lng_lat, to_cartesian, TileId};

/// Axis-aligned box in the planet's local frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub min: DVec3,
    pub max: DVec3,
}

impl BoundingBox {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Smallest box enclosing all `points`.
    pub fn from_points(points: &[DVec3]) -> Self {
        let mut min = DVec3::splat(f64::MAX);
        let mut max = DVec3::splat(f64::MIN);
        for p in points {
            min = min.min(*p);
            max = max.max(*p);
        }
        Self { min, max }
    }

    pub fn center(&self) -> DVec3 {
        0.5 * (self.min + self.max)
    }

    /// The eight corners of the box, bottom face first.
    pub fn corners(&self) -> [DVec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            DVec3::new(lo.x, lo.y, lo.z),
            DVec3::new(hi.x, lo.y, lo.z),
            DVec3::new(hi.x, lo.y, hi.z),
            DVec3::new(lo.x, lo.y, hi.z),
            DVec3::new(lo.x, hi.y, lo.z),
            DVec3::new(hi.x, hi.y, lo.z),
            DVec3::new(hi.x, hi.y, hi.z),
            DVec3::new(lo.x, hi.y, hi.z),
        ]
    }
}

/// Frustum plane indices.
pub const PLANE_LEFT: usize = 0;
pub const PLANE_RIGHT: usize = 1;
pub const PLANE_BOTTOM: usize = 2;
pub const PLANE_TOP: usize = 3;
pub const PLANE_NEAR: usize = 4;
pub const PLANE_FAR: usize = 5;

/// View frustum as six inward-facing planes (xyz = normal, w = offset).
/// A point p is inside a plane's positive half-space iff
/// `dot(normal, p) + w >= 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Frustum {
    planes: [DVec4; 6],
}

impl Frustum {
    /// Extract the planes from a projection matrix (eye-space frustum) or a
    /// projection * view matrix (model-space frustum).
    pub fn from_matrix(m: &DMat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        Self {
            planes: [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2],
        }
    }

    pub fn planes(&self) -> &[DVec4; 6] {
        &self.planes
    }

    /// Opening angle between the left and right planes.
    pub fn horizontal_fov(&self) -> f64 {
        Self::opening_angle(self.planes[PLANE_LEFT], self.planes[PLANE_RIGHT])
    }

    /// Opening angle between the bottom and top planes.
    pub fn vertical_fov(&self) -> f64 {
        Self::opening_angle(self.planes[PLANE_BOTTOM], self.planes[PLANE_TOP])
    }

    fn opening_angle(a: DVec4, b: DVec4) -> f64 {
        let na = a.truncate().normalize();
        let nb = b.truncate().normalize();
        std::f64::consts::PI - na.dot(nb).clamp(-1.0, 1.0).acos()
    }

    /// Returns whether `bb` intersects the frustum. For each plane, the box
    /// is outside iff all eight corners lie in the negative half-space; the
    /// test stops at the first excluding plane.
    pub fn contains_box(&self, bb: &BoundingBox) -> bool {
        let corners = bb.corners();
        for plane in &self.planes {
            let normal = plane.truncate();
            let mut outside = true;
            for corner in &corners {
                if normal.dot(*corner) + plane.w >= 0.0 {
                    outside = false;
                    break;
                }
            }
            if outside {
                return false;
            }
        }
        true
    }
}

/// Returns true if at least one corner of `bb` is not occluded by the proxy
/// sphere of the planet body, i.e. the box pokes out over the horizon.
///
/// A corner is unoccluded if the ray from the camera towards it misses the
/// sphere, if both intersections lie behind the camera (inside a deep
/// crater looking up), or if the corner is closer than the first
/// intersection (tile in front of the planet).
pub fn box_front_facing(cam_pos: DVec3, proxy_radius: f64, bb: &BoundingBox) -> bool {
    let c = cam_pos.dot(cam_pos) - proxy_radius * proxy_radius;

    for corner in bb.corners() {
        let ray_len = (corner - cam_pos).length();
        if ray_len == 0.0 {
            return true;
        }
        let ray_dir = (corner - cam_pos) / ray_len;
        let b = cam_pos.dot(ray_dir);
        let det = b * b - c;

        // ray misses the sphere entirely
        if det < 0.0 {
            return true;
        }

        let det = det.sqrt();
        // both intersections behind the camera; requires the box to have
        // passed frustum culling already
        if (-b - det) < 0.0 && (-b + det) < 0.0 {
            return true;
        }

        // corner in front of the sphere
        if ray_len < -b - det {
            return true;
        }
    }

    false
}

/// Model-space bounds of a tile's geometry: a 3x3 grid over the patch mapped
/// to the ellipsoid at the tile's scaled minimum and maximum elevations.
pub fn calc_tile_bounds(
    id: TileId,
    min_sample: f32,
    max_sample: f32,
    radii: DVec3,
    height_scale: f64,
) -> BoundingBox {
    let (root, x, y) = id.base_xy();
    let n = id.n_side() as f64;
    let lo = min_sample as f64 * height_scale;
    let hi = max_sample as f64 * height_scale;

    let mut points = [DVec3::ZERO; 18];
    let mut i = 0;
    for sv in 0..3 {
        for su in 0..3 {
            let u = (x as f64 + su as f64 * 0.5) / n;
            let v = (y as f64 + sv as f64 * 0.5) / n;
            let lng_lat = patch_to_lng_lat(root, u, v);
            points[i] = to_cartesian(lng_lat, radii, lo);
            points[i + 1] = to_cartesian(lng_lat, radii, hi);
            i += 2;
        }
    }

    BoundingBox::from_points(&points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn look_at_projection() -> DMat4 {
        let view = DMat4::look_at_rh(DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO, DVec3::Y);
        let proj = DMat4::perspective_rh(60.0_f64.to_radians(), 1.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn test_frustum_contains_origin_box() {
        let frustum = Frustum::from_matrix(&look_at_projection());
        let bb = BoundingBox::new(DVec3::splat(-0.5), DVec3::splat(0.5));
        assert!(frustum.contains_box(&bb));
    }

    #[test]
    fn test_frustum_excludes_box_behind_camera() {
        let frustum = Frustum::from_matrix(&look_at_projection());
        let bb = BoundingBox::new(DVec3::new(-0.5, -0.5, 9.0), DVec3::new(0.5, 0.5, 10.0));
        assert!(!frustum.contains_box(&bb));
    }

    #[test]
    fn test_frustum_excludes_box_far_off_axis() {
        let frustum = Frustum::from_matrix(&look_at_projection());
        let bb = BoundingBox::new(DVec3::new(50.0, -0.5, -0.5), DVec3::new(51.0, 0.5, 0.5));
        assert!(!frustum.contains_box(&bb));
    }

    #[test]
    fn test_fov_extraction() {
        let fov_y = 50.0_f64.to_radians();
        let proj = DMat4::perspective_rh(fov_y, 2.0, 0.1, 100.0);
        let frustum = Frustum::from_matrix(&proj);

        assert!((frustum.vertical_fov() - fov_y).abs() < 1e-9);
        let expected_h = 2.0 * ((fov_y * 0.5).tan() * 2.0).atan();
        assert!((frustum.horizontal_fov() - expected_h).abs() < 1e-9);
    }

    #[test]
    fn test_horizon_corner_cases() {
        let cam = DVec3::new(0.0, 0.0, 2.0);

        // box on the camera side of the sphere
        let near = BoundingBox::new(DVec3::new(-0.2, -0.2, 0.9), DVec3::new(0.2, 0.2, 1.1));
        assert!(box_front_facing(cam, 1.0, &near));

        // box strictly on the far side, fully behind the horizon
        let far = BoundingBox::new(DVec3::new(-0.2, -0.2, -1.1), DVec3::new(0.2, 0.2, -0.9));
        assert!(!box_front_facing(cam, 1.0, &far));

        // box well off to the side misses the sphere
        let side = BoundingBox::new(DVec3::new(2.5, -0.2, -0.5), DVec3::new(3.0, 0.2, 0.5));
        assert!(box_front_facing(cam, 1.0, &side));
    }

    #[test]
    fn test_horizon_from_inside_crater() {
        // camera barely above the proxy radius looking straight up, as on a
        // crater floor: both sphere intersections lie behind the camera
        let cam = DVec3::new(0.0, 0.0, 1.05);
        let overhead = BoundingBox::new(DVec3::new(-0.1, -0.1, 1.2), DVec3::new(0.1, 0.1, 1.4));
        assert!(box_front_facing(cam, 1.0, &overhead));
    }

    #[test]
    fn test_tile_bounds_enclose_surface_samples() {
        let id = TileId::root_id(4);
        let bb = calc_tile_bounds(id, -0.1, 0.2, DVec3::ONE, 1.0);

        for corner in id.corners_lng_lat() {
            for h in [-0.1_f64, 0.0, 0.2] {
                let p = to_cartesian(corner, DVec3::ONE, h);
                assert!(p.cmpge(bb.min - 1e-9).all() && p.cmple(bb.max + 1e-9).all());
            }
        }

        let center = to_cartesian(id.center_lng_lat(), DVec3::ONE, 0.2);
        assert!(center.cmpge(bb.min - 1e-9).all() && center.cmple(bb.max + 1e-9).all());
    }

    #[test]
    fn test_tile_bounds_track_height_scale() {
        let id = TileId::root_id(0);
        let flat = calc_tile_bounds(id, 0.0, 1.0, DVec3::ONE, 0.0);
        let tall = calc_tile_bounds(id, 0.0, 1.0, DVec3::ONE, 0.5);
        // patch 0 contains the north pole, so scaling heights grows +z
        assert!(tall.max.z > flat.max.z + 0.4);
    }
}
