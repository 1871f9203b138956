//! Offline alignment of raw dataset images.
//!
//! Each original image is warped so that its garment bounding box, grown to
//! a square with a relative margin, fills an `out_size x out_size` canvas.
//! Work is split into disjoint id shards processed on scoped threads and
//! merged into one sample table when every shard has joined.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, Point2};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use atelier_core::{BoundingBox, DataConfig, Error, LandmarkPoint, Result, SampleId, SampleRecord};

use crate::image_ops::{load_rgb, save_rgb};
use crate::index::load_alignment_table;

/// Alignment job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignConfig {
    pub out_size: usize,
    /// Extra border around the bounding box, relative to its longer side
    pub margin: f32,
    pub num_workers: usize,
    /// Directory receiving the aligned images
    pub out_dir: PathBuf,
    /// Value of pixels mapped from outside the source image
    pub fill: f32,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            out_size: 256,
            margin: 0.1,
            num_workers: 4,
            out_dir: PathBuf::from("Img_aligned"),
            fill: 255.0,
        }
    }
}

/// Result of aligning one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedSample {
    pub record: SampleRecord,
    /// Row-major top two rows of the source-to-target affine
    pub transform: [f32; 6],
}

/// Affine map sending the square around `bbox` onto the output canvas
pub fn alignment_transform(bbox: &BoundingBox, out_size: usize, margin: f32) -> Matrix3<f32> {
    let side = bbox.width().max(bbox.height()).max(1.0) * (1.0 + margin);
    let scale = out_size as f32 / side;
    let cx = (bbox.x1 + bbox.x2) / 2.0;
    let cy = (bbox.y1 + bbox.y2) / 2.0;
    let half = out_size as f32 / 2.0;
    Matrix3::new(
        scale, 0.0, half - scale * cx,
        0.0, scale, half - scale * cy,
        0.0, 0.0, 1.0,
    )
}

/// Warp an HWC image with a source-to-target affine, sampling bilinearly
pub fn warp_affine(
    img: &Array3<f32>,
    transform: &Matrix3<f32>,
    out_h: usize,
    out_w: usize,
    fill: f32,
) -> Result<Array3<f32>> {
    let inverse = transform
        .try_inverse()
        .ok_or_else(|| Error::ShapeMismatch("alignment transform is singular".into()))?;
    let (h, w, c) = img.dim();
    let mut out = Array3::from_elem((out_h, out_w, c), fill);

    for y in 0..out_h {
        for x in 0..out_w {
            let src = inverse.transform_point(&Point2::new(x as f32, y as f32));
            if src.x < 0.0 || src.y < 0.0 || src.x > (w - 1) as f32 || src.y > (h - 1) as f32 {
                continue;
            }
            let (x0, y0) = (src.x.floor() as usize, src.y.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
            let (fx, fy) = (src.x - x0 as f32, src.y - y0 as f32);
            for ch in 0..c {
                let top = img[[y0, x0, ch]] * (1.0 - fx) + img[[y0, x1, ch]] * fx;
                let bottom = img[[y1, x0, ch]] * (1.0 - fx) + img[[y1, x1, ch]] * fx;
                out[[y, x, ch]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    Ok(out)
}

/// Move landmark annotations into the aligned frame, keeping visibility
pub fn transform_landmarks(landmarks: &[LandmarkPoint], transform: &Matrix3<f32>) -> Vec<LandmarkPoint> {
    landmarks
        .iter()
        .map(|lm| {
            let p = transform.transform_point(&Point2::new(lm.x, lm.y));
            LandmarkPoint::new(p.x, p.y, lm.visibility)
        })
        .collect()
}

fn align_one(
    id: &SampleId,
    record: &SampleRecord,
    org_path: &Path,
    bbox: &BoundingBox,
    align: &AlignConfig,
) -> Result<AlignedSample> {
    let img = load_rgb(org_path)?;
    let transform = alignment_transform(bbox, align.out_size, align.margin);
    let aligned = warp_affine(&img, &transform, align.out_size, align.out_size, align.fill)?;

    let out_path = align.out_dir.join(format!("{id}.png"));
    save_rgb(&aligned, &out_path)?;
    debug!(%id, path = %out_path.display(), "aligned");

    Ok(AlignedSample {
        record: SampleRecord {
            img_path: out_path,
            cloth_type: record.cloth_type,
            img_path_org: Some(org_path.to_path_buf()),
        },
        transform: [
            transform[(0, 0)],
            transform[(0, 1)],
            transform[(0, 2)],
            transform[(1, 0)],
            transform[(1, 1)],
            transform[(1, 2)],
        ],
    })
}

/// Align every sample carrying a bounding box and write the aligned sample table
pub fn align_dataset(
    cfg: &DataConfig,
    align: &AlignConfig,
    table_out: &Path,
) -> Result<BTreeMap<SampleId, AlignedSample>> {
    let jobs = load_alignment_table(cfg)?;
    fs::create_dir_all(&align.out_dir)?;

    let shard_len = jobs.len().div_ceil(align.num_workers.max(1)).max(1);
    let shard_results: Vec<Result<Vec<(SampleId, AlignedSample)>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .chunks(shard_len)
            .map(|shard| {
                scope.spawn(move || {
                    shard
                        .iter()
                        .map(|(id, record, org, bbox)| {
                            align_one(id, record, org, bbox, align)
                                .map(|aligned| (id.clone(), aligned))
                                .map_err(|e| e.for_sample(id.clone()))
                        })
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Io(std::io::Error::other("alignment worker panicked"))))
            })
            .collect()
    });

    let mut merged = BTreeMap::new();
    for shard in shard_results {
        merged.extend(shard?);
    }

    let records: BTreeMap<&SampleId, &SampleRecord> =
        merged.iter().map(|(id, a)| (id, &a.record)).collect();
    fs::write(table_out, serde_json::to_vec_pretty(&records)?)?;
    info!(samples = merged.len(), table = %table_out.display(), "alignment finished");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    #[test]
    fn test_transform_centres_bbox() {
        let bbox = BoundingBox::from([20.0, 40.0, 60.0, 120.0]);
        let m = alignment_transform(&bbox, 100, 0.0);
        let centre = m.transform_point(&Point2::new(40.0, 80.0));
        assert_abs_diff_eq!(centre.x, 50.0, epsilon = 1e-4);
        assert_abs_diff_eq!(centre.y, 50.0, epsilon = 1e-4);
        // longer side spans the canvas
        let top = m.transform_point(&Point2::new(40.0, 40.0));
        assert_abs_diff_eq!(top.y, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_identity_warp() {
        let img = Array3::from_shape_fn((4, 4, 3), |(y, x, c)| (y * 16 + x * 4 + c) as f32);
        let out = warp_affine(&img, &Matrix3::identity(), 4, 4, 0.0).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_landmarks_follow_transform() {
        let m = Matrix3::new(2.0, 0.0, 1.0, 0.0, 2.0, -1.0, 0.0, 0.0, 1.0);
        let out = transform_landmarks(&[LandmarkPoint::new(3.0, 4.0, 2)], &m);
        assert_eq!(out[0], LandmarkPoint::new(7.0, 7.0, 2));
    }

    #[test]
    fn test_align_dataset_writes_table() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("raw")).unwrap();
        fs::create_dir_all(root.join("Label")).unwrap();
        let raw = Array3::from_elem((40, 30, 3), 128.0f32);
        for id in ["a", "b", "c"] {
            save_rgb(&raw, &root.join(format!("raw/{id}.png"))).unwrap();
        }
        let samples = json!({
            "a": {"img_path": "img/a.png", "cloth_type": 1, "img_path_org": "raw/a.png"},
            "b": {"img_path": "img/b.png", "cloth_type": 2, "img_path_org": "raw/b.png"},
            "c": {"img_path": "img/c.png", "cloth_type": 3, "img_path_org": "raw/c.png"},
        });
        let boxes = json!({"a": [0, 0, 30, 40], "b": [5, 5, 25, 35], "c": [10, 10, 20, 20]});
        fs::write(root.join("Label/ca_samples.json"), samples.to_string()).unwrap();
        fs::write(root.join("Label/bbox.json"), boxes.to_string()).unwrap();

        let cfg = DataConfig {
            data_root: root.to_path_buf(),
            fn_bbox: Some(PathBuf::from("Label/bbox.json")),
            ..DataConfig::default()
        };
        let align = AlignConfig {
            out_size: 16,
            num_workers: 2,
            out_dir: root.join("aligned"),
            ..AlignConfig::default()
        };
        let table = root.join("Label/aligned_samples.json");
        let aligned = align_dataset(&cfg, &align, &table).unwrap();

        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned["b"].record.cloth_type, 2);
        assert!(root.join("aligned/c.png").is_file());
        let written: BTreeMap<String, SampleRecord> =
            serde_json::from_slice(&fs::read(&table).unwrap()).unwrap();
        assert_eq!(written["a"].img_path, root.join("aligned/a.png"));
    }
}
