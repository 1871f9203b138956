//! Joint-centred patch extraction and the patch style loss.

use candle_core::{DType, Device, Result, Tensor};

use atelier_core::PatchPadding;

use crate::networks::FeatureExtractor;

/// Style loss over square patches centred on pose joints.
///
/// A joint whose coordinates are negative in either image yields a zero
/// patch on both sides, so it contributes nothing to the loss.
#[derive(Debug, Clone)]
pub struct PatchStyleLoss {
    pub patch_size: usize,
    /// Joint indices used as patch centres
    pub joints: Vec<usize>,
    pub padding: PatchPadding,
}

impl PatchStyleLoss {
    pub fn new(patch_size: usize, joints: Vec<usize>, padding: PatchPadding) -> Self {
        Self {
            patch_size,
            joints,
            padding,
        }
    }

    /// `coords_*`: (B, J, 2) joint `(x, y)` positions in pixels
    pub fn loss(
        &self,
        extractor: &FeatureExtractor,
        images_1: &Tensor,
        coords_1: &Tensor,
        images_2: &Tensor,
        coords_2: &Tensor,
    ) -> Result<Tensor> {
        let c1 = coords_1.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let c2 = coords_2.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let (valid_1, valid_2) = mask_invalid(&c1, &c2);
        let patches_1 = self.extract(images_1, &valid_1)?;
        let patches_2 = self.extract(images_2, &valid_2)?;
        extractor.style_loss(&patches_1, &patches_2)
    }

    /// Patches stacked joint-major: (J * B, C, P, P)
    pub fn extract(&self, images: &Tensor, coords: &[Vec<[f32; 2]>]) -> Result<Tensor> {
        let (b, c, h, w) = images.dims4()?;
        if coords.len() != b {
            return Err(candle_core::Error::Msg(format!(
                "{} coordinate rows for a batch of {b}",
                coords.len()
            )));
        }
        let mut patches = Vec::with_capacity(self.joints.len() * b);
        for &j in &self.joints {
            for (i, sample) in coords.iter().enumerate() {
                let patch = match sample.get(j) {
                    Some(&[x, y]) if x >= 0.0 && y >= 0.0 => {
                        let img = images.get(i)?;
                        self.crop(&img, x as usize, y as usize, h, w)?
                    }
                    _ => Tensor::zeros((c, self.patch_size, self.patch_size), images.dtype(), images.device())?,
                };
                patches.push(patch);
            }
        }
        Tensor::stack(&patches, 0)
    }

    fn crop(&self, img: &Tensor, x: usize, y: usize, h: usize, w: usize) -> Result<Tensor> {
        let ps = self.patch_size as i64;
        let left = x.min(w - 1) as i64 - ps / 2;
        let top = y.min(h - 1) as i64 - ps / 2;
        match self.padding {
            PatchPadding::Reflect => {
                let rows = reflect_indices(top, self.patch_size, h, img.device())?;
                let cols = reflect_indices(left, self.patch_size, w, img.device())?;
                img.index_select(&rows, 1)?.index_select(&cols, 2)
            }
            PatchPadding::Zero => {
                let (y0, y1) = (top.max(0), (top + ps).min(h as i64));
                let (x0, x1) = (left.max(0), (left + ps).min(w as i64));
                let patch = img
                    .narrow(1, y0 as usize, (y1 - y0) as usize)?
                    .narrow(2, x0 as usize, (x1 - x0) as usize)?;
                patch
                    .pad_with_zeros(1, (y0 - top) as usize, (top + ps - y1) as usize)?
                    .pad_with_zeros(2, (x0 - left) as usize, (left + ps - x1) as usize)
            }
        }
    }
}

/// Per joint, mark both sides invalid when either side has a negative coordinate
fn mask_invalid(c1: &[Vec<Vec<f32>>], c2: &[Vec<Vec<f32>>]) -> (Vec<Vec<[f32; 2]>>, Vec<Vec<[f32; 2]>>) {
    let mut out_1 = Vec::with_capacity(c1.len());
    let mut out_2 = Vec::with_capacity(c2.len());
    for (s1, s2) in c1.iter().zip(c2) {
        let mut row_1 = Vec::with_capacity(s1.len());
        let mut row_2 = Vec::with_capacity(s2.len());
        for (p1, p2) in s1.iter().zip(s2) {
            let invalid = p1.iter().chain(p2.iter()).any(|&v| v < 0.0);
            if invalid {
                row_1.push([-1.0, -1.0]);
                row_2.push([-1.0, -1.0]);
            } else {
                row_1.push([p1[0], p1[1]]);
                row_2.push([p2[0], p2[1]]);
            }
        }
        out_1.push(row_1);
        out_2.push(row_2);
    }
    (out_1, out_2)
}

/// Source indices of `len` positions starting at `start`, mirrored at the
/// borders of `0..size` without repeating the edge pixel
fn reflect_indices(start: i64, len: usize, size: usize, device: &Device) -> Result<Tensor> {
    let n = size as i64;
    let period = (2 * (n - 1)).max(1);
    let idx: Vec<u32> = (0..len as i64)
        .map(|k| {
            if n == 1 {
                return 0;
            }
            let m = (start + k).rem_euclid(period);
            (if m < n { m } else { period - m }) as u32
        })
        .collect();
    Tensor::new(idx.as_slice(), device)
}
