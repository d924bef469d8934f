//! Polygon, edit-set and feature records

use super::{BlockId, Point3d};
use serde::{Deserialize, Serialize};

/// Shape of a clip polygon's volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryType {
    /// Planar polygon extruded infinitely along z
    #[default]
    Polygon,
    /// Polygon extruded between z bounds
    Prism,
    /// Arbitrary closed shape
    Shape,
}

impl GeometryType {
    pub fn as_code(&self) -> i64 {
        match self {
            GeometryType::Polygon => 0,
            GeometryType::Prism => 1,
            GeometryType::Shape => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(GeometryType::Polygon),
            1 => Some(GeometryType::Prism),
            2 => Some(GeometryType::Shape),
            _ => None,
        }
    }
}

/// What a clip does to the geometry it covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipKind {
    /// Removes the covered geometry
    #[default]
    Mask,
    /// Keeps only the covered geometry
    Boundary,
}

impl ClipKind {
    pub fn as_code(&self) -> i64 {
        match self {
            ClipKind::Mask => 0,
            ClipKind::Boundary => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ClipKind::Mask),
            1 => Some(ClipKind::Boundary),
            _ => None,
        }
    }
}

/// A clip polygon and its classification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub id: BlockId,
    pub points: Vec<Point3d>,
    pub geometry: GeometryType,
    pub kind: ClipKind,
    pub active: bool,
    pub importance: f64,
    pub dimension: i32,
}

impl ClipRecord {
    /// An active mask polygon with default metadata
    pub fn new(id: BlockId, points: Vec<Point3d>) -> Self {
        ClipRecord {
            id,
            points,
            geometry: GeometryType::default(),
            kind: ClipKind::default(),
            active: true,
            importance: 0.0,
            dimension: 0,
        }
    }
}

/// Polylines filling gaps along tile boundaries, flattened with separators
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkirtRecord {
    pub id: BlockId,
    pub points: Vec<Point3d>,
}

impl SkirtRecord {
    /// Flatten polylines, inserting [`Point3d::SEPARATOR`] between them.
    ///
    /// Empty polylines carry no geometry and are dropped, so
    /// [`polylines`](Self::polylines) returns only the non-empty ones.
    pub fn from_polylines(id: BlockId, polylines: &[Vec<Point3d>]) -> Self {
        let total = polylines.iter().map(Vec::len).sum::<usize>() + polylines.len();
        let mut points = Vec::with_capacity(total);
        for line in polylines.iter().filter(|line| !line.is_empty()) {
            if !points.is_empty() {
                points.push(Point3d::SEPARATOR);
            }
            points.extend_from_slice(line);
        }
        SkirtRecord { id, points }
    }

    /// Split the flattened points back into polylines, skipping empty runs
    pub fn polylines(&self) -> Vec<Vec<Point3d>> {
        self.points
            .split(|p| p.is_separator())
            .filter(|line| !line.is_empty())
            .map(<[Point3d]>::to_vec)
            .collect()
    }
}

/// A named ground region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub id: BlockId,
    pub points: Vec<Point3d>,
    pub name: String,
}

/// A list of serialized edit operations applied to one node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSet {
    pub id: BlockId,
    /// Each entry is one opaque serialized edit operation
    pub records: Vec<Vec<u8>>,
}

impl DiffSet {
    pub fn new(id: BlockId, records: Vec<Vec<u8>>) -> Self {
        DiffSet { id, records }
    }

    /// Logical element count
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

/// A typed linear feature (breakline, boundary, ...)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Caller-defined feature type code
    pub kind: u32,
    pub points: Vec<Point3d>,
}

impl Feature {
    pub fn new(kind: u32, points: Vec<Point3d>) -> Self {
        Feature { kind, points }
    }
}
