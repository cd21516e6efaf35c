//! Planet-level configuration.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Shape and refinement parameters of one planet instance.
///
/// Changing `radii` or `height_scale` through the [`crate::planet::Planet`]
/// setters invalidates every cached tile bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanetParameters {
    /// Ellipsoid radii of the body, model-space units.
    pub radii: DVec3,
    /// Multiplier applied to elevation samples.
    pub height_scale: f64,
    /// Scales refinement aggressiveness; 1.0 is the calibrated default,
    /// larger values request more refinement.
    pub lod_factor: f64,
    /// Tiles coarser than this level are always refined.
    pub min_level: i32,
    /// No loads are issued beyond this level.
    pub max_level: i32,
}

impl Default for PlanetParameters {
    fn default() -> Self {
        Self {
            radii: DVec3::ONE,
            height_scale: 1.0,
            lod_factor: 1.0,
            min_level: 0,
            max_level: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let params = PlanetParameters {
            radii: DVec3::new(6378137.0, 6378137.0, 6356752.0),
            height_scale: 2.0,
            lod_factor: 1.5,
            min_level: 1,
            max_level: 12,
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: PlanetParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let params: PlanetParameters = serde_json::from_str(r#"{"lod_factor": 3.0}"#).unwrap();
        assert_eq!(params.lod_factor, 3.0);
        assert_eq!(params.max_level, PlanetParameters::default().max_level);
    }
}
