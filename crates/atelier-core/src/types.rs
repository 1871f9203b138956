//! Fundamental dataset types shared across the pipeline.

use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sample identifier as it appears in the dataset tables
pub type SampleId = String;

/// Total number of landmark heatmap channels (6 upper + 4 lower + 8 full)
pub const LANDMARK_CHANNELS: usize = 18;

/// Number of pose joints (COCO-18 layout)
pub const JOINT_COUNT: usize = 18;

/// Garment category selecting the landmark schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClothType {
    /// Upper-body garment, 6 landmarks
    Upper,
    /// Lower-body garment, 4 landmarks
    Lower,
    /// Full-body garment, 8 landmarks
    Full,
}

impl ClothType {
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ClothType::Upper),
            2 => Ok(ClothType::Lower),
            3 => Ok(ClothType::Full),
            other => Err(Error::UnknownClothType(other)),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ClothType::Upper => 1,
            ClothType::Lower => 2,
            ClothType::Full => 3,
        }
    }

    /// Number of landmarks annotated for this cloth type
    pub fn landmark_count(&self) -> usize {
        match self {
            ClothType::Upper => 6,
            ClothType::Lower => 4,
            ClothType::Full => 8,
        }
    }

    /// Heatmap channels owned by this cloth type
    pub fn channel_range(&self) -> Range<usize> {
        match self {
            ClothType::Upper => 0..6,
            ClothType::Lower => 6..10,
            ClothType::Full => 10..18,
        }
    }

    /// Segmentation labels that make up the garment region
    /// (0 background, 1 hair, 2 head, 3 upper body, 4 lower body, 5 leg, 6 arm)
    pub fn garment_labels(&self) -> &'static [u8] {
        match self {
            ClothType::Upper => &[3],
            ClothType::Lower => &[4],
            ClothType::Full => &[3, 4],
        }
    }
}

/// Landmark visibility flag as stored in the label tables
pub const VISIBILITY_INVISIBLE: u8 = 2;

/// A single `(x, y, visibility)` landmark annotation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    pub visibility: u8,
}

impl LandmarkPoint {
    pub fn new(x: f32, y: f32, visibility: u8) -> Self {
        Self { x, y, visibility }
    }

    pub fn is_visible(&self) -> bool {
        self.visibility != VISIBILITY_INVISIBLE
    }
}

impl From<[f32; 3]> for LandmarkPoint {
    fn from(v: [f32; 3]) -> Self {
        Self {
            x: v[0],
            y: v[1],
            visibility: v[2].round().clamp(0.0, 255.0) as u8,
        }
    }
}

impl From<LandmarkPoint> for [f32; 3] {
    fn from(p: LandmarkPoint) -> Self {
        [p.x, p.y, p.visibility as f32]
    }
}

/// Pose joint coordinates in pixels; negative values mark a missing joint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointCoords(pub Vec<[f32; 2]>);

impl JointCoords {
    pub fn missing(n: usize) -> Self {
        Self(vec![[-1.0, -1.0]; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `None` when the joint is absent or flagged with a negative coordinate
    pub fn get(&self, index: usize) -> Option<[f32; 2]> {
        self.0
            .get(index)
            .copied()
            .filter(|[x, y]| *x >= 0.0 && *y >= 0.0)
    }

    /// Scale valid coordinates, keeping the negative sentinel untouched
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self(
            self.0
                .iter()
                .map(|&[x, y]| {
                    if x < 0.0 || y < 0.0 {
                        [-1.0, -1.0]
                    } else {
                        [x * sx, y * sy]
                    }
                })
                .collect(),
        )
    }
}

/// Axis-aligned bounding box `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self {
            x1: v[0],
            y1: v[1],
            x2: v[2],
            y2: v[3],
        }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One entry of the sample index file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub img_path: PathBuf,
    /// Raw cloth type code (1 upper, 2 lower, 3 full); validated on use
    pub cloth_type: i64,
    /// Original, unaligned image used by the preprocessing step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_path_org: Option<PathBuf>,
}

impl SampleRecord {
    pub fn cloth_type(&self) -> Result<ClothType> {
        ClothType::from_code(self.cloth_type)
    }
}

/// Fully resolved per-sample metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub img_path: PathBuf,
    pub cloth_type: i64,
    pub attr_label: Vec<f32>,
    pub landmarks: Vec<LandmarkPoint>,
    pub seg_path: PathBuf,
    pub edge_path: PathBuf,
    pub category: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloth_type_schema() {
        for code in 1..=3 {
            let ct = ClothType::from_code(code).unwrap();
            assert_eq!(ct.code(), code);
            assert_eq!(ct.channel_range().len(), ct.landmark_count());
        }
        assert!(matches!(
            ClothType::from_code(4),
            Err(Error::UnknownClothType(4))
        ));
    }

    #[test]
    fn test_landmark_point_from_triplet() {
        let p: LandmarkPoint = serde_json::from_str("[12.5, 40.0, 2]").unwrap();
        assert_eq!(p, LandmarkPoint::new(12.5, 40.0, 2));
        assert!(!p.is_visible());
    }

    #[test]
    fn test_joint_scaling_keeps_sentinel() {
        let joints = JointCoords(vec![[10.0, 20.0], [-1.0, 5.0]]);
        let scaled = joints.scaled(0.5, 2.0);
        assert_eq!(scaled.get(0), Some([5.0, 40.0]));
        assert_eq!(scaled.get(1), None);
        assert_eq!(scaled.0[1], [-1.0, -1.0]);
    }
}
