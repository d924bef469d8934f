//! Geometry primitives stored in tiles

use serde::{Deserialize, Serialize};

/// A 3D point
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3d {
    /// Separates consecutive polylines inside a flattened skirt
    pub const SEPARATOR: Point3d = Point3d {
        x: f64::MAX,
        y: f64::MAX,
        z: f64::MAX,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Point3d { x, y, z }
    }

    pub fn is_separator(&self) -> bool {
        *self == Self::SEPARATOR
    }
}

/// A 2D point, used for texture coordinates
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2d {
    pub x: f64,
    pub y: f64,
}

impl Point2d {
    pub const fn new(x: f64, y: f64) -> Self {
        Point2d { x, y }
    }
}

/// Axis-aligned 3D box
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Extent3d {
    pub min: Point3d,
    pub max: Point3d,
}

impl Extent3d {
    pub const fn new(min: Point3d, max: Point3d) -> Self {
        Extent3d { min, max }
    }

    /// The six doubles in persisted order (min xyz, then max xyz)
    pub fn to_array(&self) -> [f64; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    pub fn from_array(v: [f64; 6]) -> Self {
        Extent3d {
            min: Point3d::new(v[0], v[1], v[2]),
            max: Point3d::new(v[3], v[4], v[5]),
        }
    }

    /// Smallest extent holding every point; `None` for an empty slice
    pub fn of_points(points: &[Point3d]) -> Option<Self> {
        let first = points.first()?;
        let mut extent = Extent3d::new(*first, *first);
        for p in &points[1..] {
            extent.min.x = extent.min.x.min(p.x);
            extent.min.y = extent.min.y.min(p.y);
            extent.min.z = extent.min.z.min(p.z);
            extent.max.x = extent.max.x.max(p.x);
            extent.max.y = extent.max.y.max(p.y);
            extent.max.z = extent.max.z.max(p.z);
        }
        Some(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_of_points() {
        let points = [
            Point3d::new(1.0, 5.0, -2.0),
            Point3d::new(-3.0, 2.0, 4.0),
            Point3d::new(0.0, 7.0, 0.0),
        ];
        let extent = Extent3d::of_points(&points).unwrap();
        assert_eq!(extent.min, Point3d::new(-3.0, 2.0, -2.0));
        assert_eq!(extent.max, Point3d::new(1.0, 7.0, 4.0));
        assert!(Extent3d::of_points(&[]).is_none());
    }

    #[test]
    fn test_extent_array_order() {
        let extent = Extent3d::new(Point3d::new(1.0, 2.0, 3.0), Point3d::new(4.0, 5.0, 6.0));
        assert_eq!(extent.to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(Extent3d::from_array(extent.to_array()), extent);
    }
}
