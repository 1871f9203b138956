//! Pose-pair samples for the pose-transfer models.
//!
//! Each side of a pair yields its image, joint heatmap, stickman rendering,
//! segmentation labels and one-hot mask, joint coordinates and optionally
//! the limb crops, all at `fine_size x fine_size`.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use ndarray::{s, Array3};

use atelier_core::{DataConfig, JointCoords, Result, SampleId};

use crate::assembly::one_hot;
use crate::batch::Collate;
use crate::heatmap::joint_heatmap;
use crate::image_ops::{
    chw_array_to_tensor, load_gray, load_rgb, resize, to_chw_tensor, Interpolation,
};
use crate::index::{PoseIndex, PoseRecord};
use crate::normalize::{normalize_hwc, Normalization};

/// Joint connections of the COCO-18 skeleton drawn in the stickman
pub const SKELETON: [(usize, usize); 17] = [
    (1, 2),
    (1, 5),
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (1, 8),
    (8, 9),
    (9, 10),
    (1, 11),
    (11, 12),
    (12, 13),
    (1, 0),
    (0, 14),
    (14, 16),
    (0, 15),
    (15, 17),
];

/// Arm and leg segments cropped as appearance patches
pub const LIMBS: [(usize, usize); 8] = [
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (8, 9),
    (9, 10),
    (11, 12),
    (12, 13),
];

fn limb_color(i: usize) -> [f32; 3] {
    // hue wheel, one step per connection
    let hue = i as f32 / SKELETON.len() as f32 * 6.0;
    let x = 1.0 - ((hue % 2.0) - 1.0).abs();
    match hue as usize {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}

fn segment_distance(px: f32, py: f32, a: [f32; 2], b: [f32; 2]) -> f32 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len2 = dx * dx + dy * dy;
    let t = if len2 > 0.0 {
        (((px - a[0]) * dx + (py - a[1]) * dy) / len2).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Render the skeleton as a 3-channel `(H, W, 3)` image in `[0, 1]`.
/// Connections with a missing endpoint are skipped.
pub fn stickman(joints: &JointCoords, height: usize, width: usize) -> Array3<f32> {
    let thickness = (height.max(width) as f32 / 64.0).max(2.0);
    let mut canvas = Array3::<f32>::zeros((height, width, 3));
    for (i, &(ja, jb)) in SKELETON.iter().enumerate() {
        let (Some(a), Some(b)) = (joints.get(ja), joints.get(jb)) else {
            continue;
        };
        let color = limb_color(i);
        let x0 = (a[0].min(b[0]) - thickness).floor().max(0.0) as usize;
        let x1 = ((a[0].max(b[0]) + thickness).ceil().max(0.0) as usize).min(width);
        let y0 = (a[1].min(b[1]) - thickness).floor().max(0.0) as usize;
        let y1 = ((a[1].max(b[1]) + thickness).ceil().max(0.0) as usize).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                if segment_distance(x as f32, y as f32, a, b) <= thickness / 2.0 {
                    canvas.slice_mut(s![y, x, ..]).assign(&ndarray::arr1(&color));
                }
            }
        }
    }
    canvas
}

/// Crop a `patch x patch` window centred on each limb, resized to `out`.
/// Limbs with a missing joint yield a zero block.
pub fn limb_crops(img: &Array3<f32>, joints: &JointCoords, patch: usize, out: usize) -> Array3<f32> {
    let (h, w, c) = img.dim();
    let mut crops = Array3::<f32>::zeros((out, out, c * LIMBS.len()));
    let half = patch as isize / 2;
    for (k, &(ja, jb)) in LIMBS.iter().enumerate() {
        let (Some(a), Some(b)) = (joints.get(ja), joints.get(jb)) else {
            continue;
        };
        let cx = ((a[0] + b[0]) / 2.0).round() as isize;
        let cy = ((a[1] + b[1]) / 2.0).round() as isize;
        let mut window = Array3::<f32>::zeros((patch, patch, c));
        for py in 0..patch {
            let sy = cy - half + py as isize;
            if sy < 0 || sy >= h as isize {
                continue;
            }
            for px in 0..patch {
                let sx = cx - half + px as isize;
                if sx < 0 || sx >= w as isize {
                    continue;
                }
                window
                    .slice_mut(s![py, px, ..])
                    .assign(&img.slice(s![sy as usize, sx as usize, ..]));
            }
        }
        let window = resize(&window, out, out, Interpolation::Bilinear);
        crops
            .slice_mut(s![.., .., k * c..(k + 1) * c])
            .assign(&window);
    }
    crops
}

/// Tensors of one side of a pair
#[derive(Debug, Clone)]
pub struct PoseView {
    pub img: Tensor,
    pub joint: Tensor,
    pub stickman: Tensor,
    pub seg: Tensor,
    pub seg_mask: Tensor,
    /// `(n_joints, 2)` pixel coordinates at output size, `-1` when missing
    pub joint_c: Tensor,
    pub limb: Option<Tensor>,
}

/// A reference/target pose pair
#[derive(Debug, Clone)]
pub struct PairSample {
    pub id: SampleId,
    pub first: PoseView,
    pub second: PoseView,
}

impl Collate for PairSample {
    fn sample_id(&self) -> &str {
        &self.id
    }

    fn into_fields(self) -> Vec<(&'static str, Tensor)> {
        let mut fields = vec![
            ("img_1", self.first.img),
            ("joint_1", self.first.joint),
            ("stickman_1", self.first.stickman),
            ("seg_1", self.first.seg),
            ("seg_mask_1", self.first.seg_mask),
            ("joint_c_1", self.first.joint_c),
            ("img_2", self.second.img),
            ("joint_2", self.second.joint),
            ("stickman_2", self.second.stickman),
            ("seg_2", self.second.seg),
            ("seg_mask_2", self.second.seg_mask),
            ("joint_c_2", self.second.joint_c),
        ];
        if let Some(limb) = self.first.limb {
            fields.push(("limb_1", limb));
        }
        if let Some(limb) = self.second.limb {
            fields.push(("limb_2", limb));
        }
        fields
    }
}

/// Builds pose pairs from the shared pose index
#[derive(Debug, Clone)]
pub struct PairAssembler {
    cfg: DataConfig,
    index: Arc<PoseIndex>,
    device: Device,
}

impl PairAssembler {
    pub fn new(cfg: &DataConfig, index: Arc<PoseIndex>) -> Self {
        Self {
            cfg: cfg.clone(),
            index,
            device: Device::Cpu,
        }
    }

    pub fn index(&self) -> &PoseIndex {
        &self.index
    }

    fn view(&self, record: &PoseRecord) -> Result<PoseView> {
        let size = self.cfg.fine_size;
        let raw = load_rgb(&record.img_path)?;
        let (h, w, _) = raw.dim();
        let joints = record
            .joints
            .scaled(size as f32 / w as f32, size as f32 / h as f32);

        let mut img = resize(&raw, size, size, Interpolation::Bilinear).mapv(|v| v / 255.0);
        let limb = if self.cfg.with_limbs {
            let mut crops = limb_crops(&img, &joints, self.cfg.limb_patch_size, size);
            // blank crops stay at zero after normalization
            crops.mapv_inplace(|v| v * 2.0 - 1.0);
            for (k, &(ja, jb)) in LIMBS.iter().enumerate() {
                if joints.get(ja).is_none() || joints.get(jb).is_none() {
                    crops.slice_mut(s![.., .., 3 * k..3 * k + 3]).fill(0.0);
                }
            }
            Some(to_chw_tensor(crops.view(), &self.device)?)
        } else {
            None
        };
        normalize_hwc(&mut img, Normalization::Standard)?;

        let seg = resize(&load_gray(&record.seg_path)?, size, size, Interpolation::Nearest);
        let seg_mask = one_hot(&seg, self.cfg.seg_nc);
        let heatmap = joint_heatmap(size, size, &joints, self.cfg.joint_delta);
        let stick = stickman(&joints, size, size);

        let coords: Vec<f32> = joints.0.iter().flat_map(|p| [p[0], p[1]]).collect();
        Ok(PoseView {
            img: to_chw_tensor(img.view(), &self.device)?,
            joint: chw_array_to_tensor(&heatmap, &self.device)?,
            stickman: to_chw_tensor(stick.view(), &self.device)?,
            seg: to_chw_tensor(seg.view(), &self.device)?,
            seg_mask: to_chw_tensor(seg_mask.view(), &self.device)?,
            joint_c: Tensor::from_vec(coords, (joints.len(), 2), &self.device)?,
            limb,
        })
    }

    /// Assemble pair number `index`
    pub fn assemble(&self, index: usize) -> Result<PairSample> {
        let (first, second) = self.index.pair(index)?;
        Ok(PairSample {
            id: format!("{}_{}", first.id, second.id),
            first: self.view(first)?,
            second: self.view(second)?,
        })
    }

    /// Id of pair number `index`, used for error reporting
    pub fn pair_id(&self, index: usize) -> String {
        self.index
            .pair(index)
            .map(|(a, b)| format!("{}_{}", a.id, b.id))
            .unwrap_or_else(|_| format!("pair#{index}"))
    }
}
