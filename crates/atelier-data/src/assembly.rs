//! Multi-modal sample assembly.
//!
//! Image, landmark heatmap, edge map and color map of a sample are stacked
//! along channels and transformed together so they stay pixel aligned. The
//! segmentation label map is resized separately with nearest-neighbour
//! interpolation, then appended as the last channel for the shared
//! crop/flip, and finally every block is split back out by its recorded
//! channel range.

use std::ops::Range;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use ndarray::{concatenate, s, Array3, Axis};
use rand::Rng;

use atelier_core::{ClothType, DataConfig, Error, InputMaskMode, Result, Sample, SampleId};

use crate::batch::Collate;
use crate::heatmap::landmark_heatmap;
use crate::image_ops::{
    chw_to_hwc, gaussian_blur, load_gray, load_rgb, resize, to_chw_tensor, CropPolicy, Geometry,
    Interpolation,
};
use crate::index::DatasetIndex;
use crate::normalize::{normalize_hwc, Normalization};

/// Channel offsets of the blocks stacked into one HWC array
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelLayout {
    blocks: Vec<(&'static str, Range<usize>)>,
}

impl ChannelLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block of `width` channels and return its range
    pub fn push(&mut self, name: &'static str, width: usize) -> Range<usize> {
        let start = self.total();
        let range = start..start + width;
        self.blocks.push((name, range.clone()));
        range
    }

    pub fn range(&self, name: &str) -> Option<Range<usize>> {
        self.blocks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| r.clone())
    }

    pub fn total(&self) -> usize {
        self.blocks.last().map(|(_, r)| r.end).unwrap_or(0)
    }

    /// Concatenate HWC blocks of equal spatial size along channels
    pub fn stack(blocks: &[(&'static str, &Array3<f32>)]) -> Result<(Array3<f32>, Self)> {
        let mut layout = Self::new();
        let Some((_, first)) = blocks.first() else {
            return Err(Error::ShapeMismatch("nothing to stack".into()));
        };
        let (h, w, _) = first.dim();
        let mut views = Vec::with_capacity(blocks.len());
        for (name, arr) in blocks {
            let (bh, bw, c) = arr.dim();
            if (bh, bw) != (h, w) {
                return Err(Error::ShapeMismatch(format!(
                    "{name} is {bh}x{bw}, expected {h}x{w}"
                )));
            }
            layout.push(*name, c);
            views.push(arr.view());
        }
        let stacked =
            concatenate(Axis(2), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        Ok((stacked, layout))
    }

    /// Split a stacked array back into its named blocks
    pub fn split(&self, arr: &Array3<f32>) -> Result<SplitMaps> {
        let channels = arr.len_of(Axis(2));
        if channels != self.total() {
            return Err(Error::ShapeMismatch(format!(
                "stack has {channels} channels, layout expects {}",
                self.total()
            )));
        }
        Ok(SplitMaps(
            self.blocks
                .iter()
                .map(|(name, r)| (*name, arr.slice(s![.., .., r.clone()]).to_owned()))
                .collect(),
        ))
    }
}

/// Named HWC maps produced by [`ChannelLayout::split`]
#[derive(Debug, Clone)]
pub struct SplitMaps(Vec<(&'static str, Array3<f32>)>);

impl SplitMaps {
    pub fn take(&mut self, name: &str) -> Result<Array3<f32>> {
        let pos = self
            .0
            .iter()
            .position(|(n, _)| *n == name)
            .ok_or_else(|| Error::Schema(format!("no block named {name}")))?;
        Ok(self.0.swap_remove(pos).1)
    }
}

/// Apply one geometry to a channel stack plus an optional label map
pub fn joint_transform(
    geometry: &Geometry,
    blocks: &[(&'static str, &Array3<f32>)],
    seg: Option<&Array3<f32>>,
) -> Result<SplitMaps> {
    let (stacked, mut layout) = ChannelLayout::stack(blocks)?;
    let mut resized = geometry.resize(&stacked, Interpolation::Bilinear);
    if let Some(seg) = seg {
        let seg = geometry.resize(seg, Interpolation::Nearest);
        layout.push("seg", seg.len_of(Axis(2)));
        resized = concatenate(Axis(2), &[resized.view(), seg.view()])
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    }
    layout.split(&geometry.crop_flip(&resized)?)
}

/// Zero edge pixels below `threshold`, then scale to `[0, 1]`
pub fn threshold_edges(edge: &mut Array3<f32>, threshold: u8) {
    let t = threshold as f32;
    edge.mapv_inplace(|v| if v < t { 0.0 } else { v / 255.0 });
}

/// Derive the conditioning mask channels from a `(H, W, 1)` label map
pub fn seg_mask(
    seg_map: &Array3<f32>,
    mode: InputMaskMode,
    cloth_type: ClothType,
    seg_nc: usize,
) -> Array3<f32> {
    let (h, w, _) = seg_map.dim();
    let labels = seg_map.index_axis(Axis(2), 0);
    match mode {
        InputMaskMode::Binary => {
            let garment = cloth_type.garment_labels();
            let mut mask = Array3::<f32>::zeros((h, w, 1));
            for ((y, x), &label) in labels.indexed_iter() {
                if garment.contains(&(label.round() as u8)) {
                    mask[[y, x, 0]] = 1.0;
                }
            }
            mask
        }
        InputMaskMode::OneHot => one_hot(seg_map, seg_nc),
        InputMaskMode::None => Array3::<f32>::zeros((h, w, 1)),
    }
}

/// One channel per label; labels outside `0..seg_nc` produce no activation
pub fn one_hot(seg_map: &Array3<f32>, seg_nc: usize) -> Array3<f32> {
    let (h, w, _) = seg_map.dim();
    let mut mask = Array3::<f32>::zeros((h, w, seg_nc));
    for ((y, x), &label) in seg_map.index_axis(Axis(2), 0).indexed_iter() {
        let label = label.round() as usize;
        if label < seg_nc {
            mask[[y, x, label]] = 1.0;
        }
    }
    mask
}

/// Tensors of one designer sample, all CHW at `fine_size`
#[derive(Debug, Clone)]
pub struct SampleTensors {
    pub id: SampleId,
    /// Standard-normalized RGB image
    pub img: Tensor,
    pub lm_map: Tensor,
    pub edge_map: Tensor,
    pub color_map: Tensor,
    /// Raw segmentation labels as floats
    pub seg_map: Tensor,
    pub seg_mask: Tensor,
    pub attr_label: Tensor,
}

impl Collate for SampleTensors {
    fn sample_id(&self) -> &str {
        &self.id
    }

    fn into_fields(self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("img", self.img),
            ("lm_map", self.lm_map),
            ("edge_map", self.edge_map),
            ("color_map", self.color_map),
            ("seg_map", self.seg_map),
            ("seg_mask", self.seg_mask),
            ("attr_label", self.attr_label),
        ]
    }
}

/// Tensors of one attribute-encoder sample
#[derive(Debug, Clone)]
pub struct AttributeSample {
    pub id: SampleId,
    pub img: Tensor,
    pub lm_map: Option<Tensor>,
    pub attr_label: Tensor,
    /// Category index as a `u32` scalar, when the index carries categories
    pub category: Option<Tensor>,
}

impl Collate for AttributeSample {
    fn sample_id(&self) -> &str {
        &self.id
    }

    fn into_fields(self) -> Vec<(&'static str, Tensor)> {
        let mut fields = vec![("img", self.img), ("attr_label", self.attr_label)];
        if let Some(lm) = self.lm_map {
            fields.push(("lm_map", lm));
        }
        if let Some(cat) = self.category {
            fields.push(("cat_label", cat));
        }
        fields
    }
}

/// Builds per-sample tensors from the shared index
#[derive(Debug, Clone)]
pub struct SampleAssembler {
    cfg: DataConfig,
    index: Arc<DatasetIndex>,
    policy: CropPolicy,
    device: Device,
}

impl SampleAssembler {
    pub fn new(cfg: &DataConfig, index: Arc<DatasetIndex>, is_train: bool) -> Self {
        Self {
            cfg: cfg.clone(),
            index,
            policy: CropPolicy::for_phase(is_train),
            device: Device::Cpu,
        }
    }

    /// Force a crop/flip policy instead of the phase default
    pub fn with_crop_policy(mut self, policy: CropPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn index(&self) -> &DatasetIndex {
        &self.index
    }

    pub fn config(&self) -> &DataConfig {
        &self.cfg
    }

    fn lm_hwc(&self, sample: &Sample, h: usize, w: usize) -> Result<Array3<f32>> {
        let map = landmark_heatmap(w, h, &sample.landmarks, sample.cloth_type, self.cfg.lm_delta)?;
        Ok(chw_to_hwc(map))
    }

    fn label_tensor(&self, sample: &Sample) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &sample.attr_label,
            sample.attr_label.len(),
            &self.device,
        )?)
    }

    /// Assemble the designer tensors of sample `id`
    pub fn assemble<R: Rng + ?Sized>(&self, id: &str, rng: &mut R) -> Result<SampleTensors> {
        let sample = self.index.get(id)?;
        let cloth = ClothType::from_code(sample.cloth_type)?;

        let img = load_rgb(&sample.img_path)?;
        let (h, w, _) = img.dim();
        let lm = self.lm_hwc(sample, h, w)?;

        let mut edge = load_gray(&sample.edge_path)?;
        if edge.dim().0 != h || edge.dim().1 != w {
            edge = resize(&edge, h, w, Interpolation::Bilinear);
        }
        threshold_edges(&mut edge, self.cfg.edge_threshold);

        let color = gaussian_blur(
            &img,
            self.cfg.color_gaussian_ksz,
            self.cfg.color_gaussian_sigma,
        )
        .mapv(|v| v / 255.0);
        let img = img.mapv(|v| v / 255.0);
        let seg = load_gray(&sample.seg_path)?;

        let geometry = Geometry::plan(&self.cfg, self.policy, rng)?;
        let mut maps = joint_transform(
            &geometry,
            &[("img", &img), ("lm", &lm), ("edge", &edge), ("color", &color)],
            Some(&seg),
        )?;

        let mut img = maps.take("img")?;
        normalize_hwc(&mut img, Normalization::Standard)?;
        let color = maps.take("color")?;
        let seg = maps.take("seg")?;
        let mask = seg_mask(&seg, self.cfg.input_mask_mode, cloth, self.cfg.seg_nc);

        Ok(SampleTensors {
            id: sample.id.clone(),
            img: to_chw_tensor(img.view(), &self.device)?,
            lm_map: to_chw_tensor(maps.take("lm")?.view(), &self.device)?,
            edge_map: to_chw_tensor(maps.take("edge")?.view(), &self.device)?,
            color_map: to_chw_tensor(color.view(), &self.device)?,
            seg_map: to_chw_tensor(seg.view(), &self.device)?,
            seg_mask: to_chw_tensor(mask.view(), &self.device)?,
            attr_label: self.label_tensor(sample)?,
        })
    }

    /// Assemble the attribute-encoder tensors of sample `id`
    pub fn assemble_attribute<R: Rng + ?Sized>(
        &self,
        id: &str,
        with_landmarks: bool,
        rng: &mut R,
    ) -> Result<AttributeSample> {
        let sample = self.index.get(id)?;
        let img = load_rgb(&sample.img_path)?.mapv(|v| v / 255.0);
        let (h, w, _) = img.dim();
        let geometry = Geometry::plan(&self.cfg, self.policy, rng)?;

        let (mut img, lm_map) = if with_landmarks {
            let lm = self.lm_hwc(sample, h, w)?;
            let mut maps = joint_transform(&geometry, &[("img", &img), ("lm", &lm)], None)?;
            let lm = to_chw_tensor(maps.take("lm")?.view(), &self.device)?;
            (maps.take("img")?, Some(lm))
        } else {
            (geometry.apply(&img, Interpolation::Bilinear)?, None)
        };
        normalize_hwc(&mut img, self.cfg.image_normalize)?;

        Ok(AttributeSample {
            id: sample.id.clone(),
            img: to_chw_tensor(img.view(), &self.device)?,
            lm_map,
            attr_label: self.label_tensor(sample)?,
            category: sample
                .category
                .map(|c| Tensor::new(c, &self.device))
                .transpose()?,
        })
    }
}

/// Convert a `(C, H, W)` tensor holding labels to `u32` class indices of shape `(H, W)`
pub fn labels_to_indices(seg_map: &Tensor) -> Result<Tensor> {
    Ok(seg_map.squeeze(0)?.round()?.to_dtype(DType::U32)?)
}
