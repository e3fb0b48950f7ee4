//! Reference data loaded once per run: camera calibration and site zones.
//!
//! Both files are JSON. Any problem with them is fatal for the run, so loading
//! is strict: non-finite numbers, singular transforms, degenerate polygons and
//! duplicate zone names are rejected here rather than discovered mid-run.

use anyhow::{anyhow, Context, Result};
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::frame::BBox;

/// Which point of a bounding box stands for the object's ground position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    #[default]
    BottomCenter,
    Center,
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    homography: [[f64; 3]; 3],
    #[serde(default)]
    anchor: Anchor,
}

/// Pixel to world (metres) planar homography for a fixed camera.
#[derive(Clone, Debug)]
pub struct Calibration {
    homography: Matrix3<f64>,
    anchor: Anchor,
}

impl Calibration {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read calibration {}", path.display()))?;
        let file: CalibrationFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid calibration {}", path.display()))?;
        Self::from_rows(file.homography, file.anchor)
            .with_context(|| format!("unusable calibration {}", path.display()))
    }

    pub fn from_rows(rows: [[f64; 3]; 3], anchor: Anchor) -> Result<Self> {
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(anyhow!("homography contains non-finite values"));
        }
        let homography = Matrix3::from_fn(|r, c| rows[r][c]);
        if homography.determinant().abs() < 1e-12 {
            return Err(anyhow!("homography is singular"));
        }
        Ok(Self { homography, anchor })
    }

    /// Uniform scale with no perspective: `world = pixel / pixels_per_metre`.
    pub fn scale(pixels_per_metre: f64) -> Result<Self> {
        if !(pixels_per_metre.is_finite() && pixels_per_metre > 0.0) {
            return Err(anyhow!("pixels_per_metre must be positive"));
        }
        let s = 1.0 / pixels_per_metre;
        Self::from_rows(
            [[s, 0.0, 0.0], [0.0, s, 0.0], [0.0, 0.0, 1.0]],
            Anchor::BottomCenter,
        )
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn anchor_point(&self, bbox: &BBox) -> (f64, f64) {
        match self.anchor {
            Anchor::BottomCenter => bbox.bottom_center(),
            Anchor::Center => bbox.center(),
        }
    }

    /// Project a pixel to world metres. `None` when the point maps to infinity.
    pub fn to_world(&self, u: f64, v: f64) -> Option<(f64, f64)> {
        let p = self.homography * Vector3::new(u, v, 1.0);
        if p.z.abs() < 1e-12 {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        (x.is_finite() && y.is_finite()).then_some((x, y))
    }
}

#[derive(Debug, Deserialize)]
struct ZonesFile {
    zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
struct ZoneEntry {
    name: String,
    polygon: Vec<[f64; 2]>,
}

/// Named site area, polygon in world metres.
#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    pub name: String,
    polygon: Vec<(f64, f64)>,
}

impl Zone {
    pub fn new(name: &str, polygon: Vec<(f64, f64)>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(anyhow!("zone name must not be empty"));
        }
        if polygon.len() < 3 {
            return Err(anyhow!("zone '{}' needs at least 3 vertices", name));
        }
        if polygon.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(anyhow!("zone '{}' has non-finite vertices", name));
        }
        Ok(Self {
            name: name.trim().to_string(),
            polygon,
        })
    }

    pub fn polygon(&self) -> &[(f64, f64)] {
        &self.polygon
    }

    /// Even-odd ray casting; points on an edge count as inside.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.polygon.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.polygon[i];
            let (xj, yj) = self.polygon[j];
            if on_segment((xi, yi), (xj, yj), (x, y)) {
                return true;
            }
            if (yi > y) != (yj > y) {
                let cross_x = xj + (y - yj) * (xi - xj) / (yi - yj);
                if x < cross_x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    const EPS: f64 = 1e-9;
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > EPS {
        return false;
    }
    p.0 >= a.0.min(b.0) - EPS
        && p.0 <= a.0.max(b.0) + EPS
        && p.1 >= a.1.min(b.1) - EPS
        && p.1 <= a.1.max(b.1) + EPS
}

/// Load the zone list. An empty list is valid; duplicate names are not.
pub fn load_zones(path: &Path) -> Result<Vec<Zone>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read zones {}", path.display()))?;
    let file: ZonesFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid zones {}", path.display()))?;
    let mut seen = BTreeSet::new();
    let mut zones = Vec::with_capacity(file.zones.len());
    for entry in file.zones {
        let zone = Zone::new(
            &entry.name,
            entry.polygon.iter().map(|p| (p[0], p[1])).collect(),
        )
        .with_context(|| format!("invalid zones {}", path.display()))?;
        if !seen.insert(zone.name.clone()) {
            return Err(anyhow!(
                "invalid zones {}: duplicate zone name '{}'",
                path.display(),
                zone.name
            ));
        }
        zones.push(zone);
    }
    Ok(zones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn square(name: &str) -> Zone {
        Zone::new(
            name,
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
        )
        .unwrap()
    }

    #[test]
    fn point_in_polygon() {
        let zone = square("pit");
        assert!(zone.contains(5.0, 5.0));
        assert!(zone.contains(0.0, 5.0));
        assert!(zone.contains(10.0, 10.0));
        assert!(!zone.contains(10.5, 5.0));
        assert!(!zone.contains(-0.1, -0.1));
    }

    #[test]
    fn concave_polygon() {
        // L-shape: the notch at (7, 7) is outside.
        let zone = Zone::new(
            "l",
            vec![
                (0.0, 0.0),
                (10.0, 0.0),
                (10.0, 5.0),
                (5.0, 5.0),
                (5.0, 10.0),
                (0.0, 10.0),
            ],
        )
        .unwrap();
        assert!(zone.contains(2.0, 8.0));
        assert!(!zone.contains(7.0, 7.0));
    }

    #[test]
    fn scale_calibration_projects() {
        let cal = Calibration::scale(10.0).unwrap();
        assert_eq!(cal.to_world(100.0, 50.0), Some((10.0, 5.0)));
        let b = BBox::new(90.0, 10.0, 110.0, 50.0);
        assert_eq!(cal.anchor_point(&b), (100.0, 50.0));
    }

    #[test]
    fn singular_homography_rejected() {
        let err = Calibration::from_rows([[0.0; 3]; 3], Anchor::Center);
        assert!(err.is_err());
    }

    #[test]
    fn loads_files_and_rejects_duplicates() {
        let mut cal = tempfile::NamedTempFile::new().unwrap();
        write!(
            cal,
            r#"{{"homography": [[0.1,0,0],[0,0.1,0],[0,0,1]], "anchor": "center"}}"#
        )
        .unwrap();
        let cal = Calibration::load(cal.path()).unwrap();
        assert_eq!(cal.anchor(), Anchor::Center);

        let mut zones = tempfile::NamedTempFile::new().unwrap();
        write!(
            zones,
            r#"{{"zones": [
                {{"name": "crane_radius", "polygon": [[0,0],[5,0],[5,5]]}},
                {{"name": "crane_radius", "polygon": [[0,0],[5,0],[5,5]]}}
            ]}}"#
        )
        .unwrap();
        assert!(load_zones(zones.path()).is_err());
    }

    #[test]
    fn degenerate_zone_rejected() {
        assert!(Zone::new("line", vec![(0.0, 0.0), (1.0, 1.0)]).is_err());
        assert!(Zone::new(" ", vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0)]).is_err());
    }
}
