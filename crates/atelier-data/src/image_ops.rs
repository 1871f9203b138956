//! HWC image arrays: decoding, resizing, cropping, flipping and blurring.
//!
//! All spatial maps travel through the pipeline as `Array3<f32>` laid out
//! `(height, width, channels)` and are only converted to CHW candle tensors
//! at the very end of sample assembly.

use std::path::Path;

use candle_core::{Device, Tensor};
use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use rand::Rng;

use atelier_core::{DataConfig, Error, ResizeOrCrop, Result};

/// Interpolation used when resizing a map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Half-pixel-centred bilinear, for images and continuous maps
    Bilinear,
    /// Nearest neighbour, for label maps
    Nearest,
}

/// Decode an RGB image into a `(H, W, 3)` array with values in `[0, 255]`
pub fn load_rgb(path: &Path) -> Result<Array3<f32>> {
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    let img = image::open(path)?.to_rgb8();
    let (w, h) = img.dimensions();
    let raw: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
    Array3::from_shape_vec((h as usize, w as usize, 3), raw)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// Decode a single-channel image into a `(H, W, 1)` array with values in `[0, 255]`
pub fn load_gray(path: &Path) -> Result<Array3<f32>> {
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    let img = image::open(path)?.to_luma8();
    let (w, h) = img.dimensions();
    let raw: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
    Array3::from_shape_vec((h as usize, w as usize, 1), raw)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// Encode a `(H, W, 3)` array with values in `[0, 255]` as an RGB file
pub fn save_rgb(arr: &Array3<f32>, path: &Path) -> Result<()> {
    let (h, w, c) = arr.dim();
    if c != 3 {
        return Err(Error::ShapeMismatch(format!("expected 3 channels, got {c}")));
    }
    let raw: Vec<u8> = arr.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
    let img = image::RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| Error::Image("buffer does not match image size".into()))?;
    img.save(path)?;
    Ok(())
}

/// Encode a `(H, W, 1)` array as a grayscale file
pub fn save_gray(arr: &Array3<f32>, path: &Path) -> Result<()> {
    let (h, w, _) = arr.dim();
    let raw: Vec<u8> = arr
        .index_axis(Axis(2), 0)
        .iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    let img = image::GrayImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| Error::Image("buffer does not match image size".into()))?;
    img.save(path)?;
    Ok(())
}

/// Resize every channel of an HWC array to `(out_h, out_w)`
pub fn resize(arr: &Array3<f32>, out_h: usize, out_w: usize, interp: Interpolation) -> Array3<f32> {
    let (h, w, c) = arr.dim();
    if h == out_h && w == out_w {
        return arr.clone();
    }
    let sy = h as f32 / out_h as f32;
    let sx = w as f32 / out_w as f32;
    let mut out = Array3::<f32>::zeros((out_h, out_w, c));

    match interp {
        Interpolation::Nearest => {
            for y in 0..out_h {
                let iy = ((y as f32 * sy).floor() as usize).min(h - 1);
                for x in 0..out_w {
                    let ix = ((x as f32 * sx).floor() as usize).min(w - 1);
                    out.slice_mut(s![y, x, ..]).assign(&arr.slice(s![iy, ix, ..]));
                }
            }
        }
        Interpolation::Bilinear => {
            let axis = |o: usize, scale: f32, n: usize| {
                let src = ((o as f32 + 0.5) * scale - 0.5).clamp(0.0, (n - 1) as f32);
                let lo = src.floor() as usize;
                let hi = (lo + 1).min(n - 1);
                (lo, hi, src - lo as f32)
            };
            for y in 0..out_h {
                let (y0, y1, fy) = axis(y, sy, h);
                for x in 0..out_w {
                    let (x0, x1, fx) = axis(x, sx, w);
                    for ch in 0..c {
                        let top = arr[[y0, x0, ch]] * (1.0 - fx) + arr[[y0, x1, ch]] * fx;
                        let bottom = arr[[y1, x0, ch]] * (1.0 - fx) + arr[[y1, x1, ch]] * fx;
                        out[[y, x, ch]] = top * (1.0 - fy) + bottom * fy;
                    }
                }
            }
        }
    }
    out
}

/// Offset of a centred window of `target` inside `size`
pub fn center_offset(size: usize, target: usize) -> usize {
    ((size.saturating_sub(target)) as f64 / 2.0).round() as usize
}

/// Crop a `size_h x size_w` window at `(top, left)`
pub fn crop(arr: &Array3<f32>, top: usize, left: usize, size_h: usize, size_w: usize) -> Result<Array3<f32>> {
    let (h, w, _) = arr.dim();
    if top + size_h > h || left + size_w > w {
        return Err(Error::ShapeMismatch(format!(
            "crop ({top}, {left}, {size_h}x{size_w}) exceeds {h}x{w}"
        )));
    }
    Ok(arr
        .slice(s![top..top + size_h, left..left + size_w, ..])
        .to_owned())
}

/// Mirror an HWC array left-to-right
pub fn flip_horizontal(arr: &Array3<f32>) -> Array3<f32> {
    arr.slice(s![.., ..;-1, ..]).to_owned()
}

/// How the crop window and flip are chosen for `resize_and_crop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropPolicy {
    /// Deterministic centre crop, no flip (evaluation)
    Center,
    /// Uniform random crop and independent 50% flip (training)
    Random,
    /// Caller-chosen crop window and flip
    Fixed { top: usize, left: usize, flip: bool },
}

impl CropPolicy {
    pub fn for_phase(is_train: bool) -> Self {
        if is_train {
            CropPolicy::Random
        } else {
            CropPolicy::Center
        }
    }
}

/// Resolved geometric transform shared by all maps of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Side of the square every map is first resized to
    pub scaled: usize,
    pub top: usize,
    pub left: usize,
    /// Side of the final square window
    pub size: usize,
    pub flip: bool,
}

impl Geometry {
    /// Draw the transform for one sample
    pub fn plan<R: Rng + ?Sized>(cfg: &DataConfig, policy: CropPolicy, rng: &mut R) -> Result<Self> {
        let fine = cfg.fine_size;
        match cfg.resize_or_crop {
            ResizeOrCrop::Resize => Ok(Self {
                scaled: fine,
                top: 0,
                left: 0,
                size: fine,
                flip: false,
            }),
            ResizeOrCrop::ResizeAndCrop => {
                let load = cfg.load_size;
                let (top, left, flip) = match policy {
                    CropPolicy::Center => (center_offset(load, fine), center_offset(load, fine), false),
                    CropPolicy::Random => (
                        rng.gen_range(0..=load.saturating_sub(fine)),
                        rng.gen_range(0..=load.saturating_sub(fine)),
                        rng.gen_bool(0.5),
                    ),
                    CropPolicy::Fixed { top, left, flip } => {
                        if top + fine > load || left + fine > load {
                            return Err(Error::Config(format!(
                                "fixed crop ({top}, {left}) does not fit {fine} inside {load}"
                            )));
                        }
                        (top, left, flip)
                    }
                };
                Ok(Self {
                    scaled: load,
                    top,
                    left,
                    size: fine,
                    flip,
                })
            }
        }
    }

    pub fn resize(&self, arr: &Array3<f32>, interp: Interpolation) -> Array3<f32> {
        resize(arr, self.scaled, self.scaled, interp)
    }

    /// Crop then optionally flip an array already at `scaled` resolution
    pub fn crop_flip(&self, arr: &Array3<f32>) -> Result<Array3<f32>> {
        let cropped = crop(arr, self.top, self.left, self.size, self.size)?;
        Ok(if self.flip {
            flip_horizontal(&cropped)
        } else {
            cropped
        })
    }

    pub fn apply(&self, arr: &Array3<f32>, interp: Interpolation) -> Result<Array3<f32>> {
        self.crop_flip(&self.resize(arr, interp))
    }
}

/// 1-D Gaussian kernel, normalised to unit sum.
///
/// A nonpositive `sigma` is derived from `ksize` the way OpenCV does it.
pub fn gaussian_kernel(ksize: usize, sigma: f32) -> Vec<f32> {
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let center = (ksize as f32 - 1.0) / 2.0;
    let kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.into_iter().map(|k| k / sum).collect()
}

fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    while i < 0 || i >= n {
        i = if i < 0 { -i } else { 2 * n - 2 - i };
    }
    i as usize
}

/// Separable Gaussian blur with mirrored borders
pub fn gaussian_blur(arr: &Array3<f32>, ksize: usize, sigma: f32) -> Array3<f32> {
    let kernel = gaussian_kernel(ksize, sigma);
    let half = (ksize / 2) as isize;
    let (h, w, c) = arr.dim();

    let mut horizontal = Array3::<f32>::zeros((h, w, c));
    for y in 0..h {
        for x in 0..w {
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - half, w);
                for ch in 0..c {
                    horizontal[[y, x, ch]] += weight * arr[[y, sx, ch]];
                }
            }
        }
    }

    let mut out = Array3::<f32>::zeros((h, w, c));
    for y in 0..h {
        for (k, weight) in kernel.iter().enumerate() {
            let sy = reflect_101(y as isize + k as isize - half, h);
            for x in 0..w {
                for ch in 0..c {
                    out[[y, x, ch]] += weight * horizontal[[sy, x, ch]];
                }
            }
        }
    }
    out
}

/// Convert an HWC array to a CHW tensor
pub fn to_chw_tensor(arr: ArrayView3<f32>, device: &Device) -> Result<Tensor> {
    let (h, w, c) = arr.dim();
    let chw = arr.permuted_axes([2, 0, 1]);
    let data: Vec<f32> = chw.iter().copied().collect();
    Ok(Tensor::from_vec(data, (c, h, w), device)?)
}

/// Convert a CHW array (as produced by the heatmap generators) to a tensor
pub fn chw_array_to_tensor(arr: &Array3<f32>, device: &Device) -> Result<Tensor> {
    let (c, h, w) = arr.dim();
    let data: Vec<f32> = arr.iter().copied().collect();
    Ok(Tensor::from_vec(data, (c, h, w), device)?)
}

/// Reorder a CHW array to HWC
pub fn chw_to_hwc(arr: Array3<f32>) -> Array3<f32> {
    arr.permuted_axes([1, 2, 0]).as_standard_layout().to_owned()
}

/// Reorder an HWC array to CHW
pub fn hwc_to_chw(arr: &Array3<f32>) -> Array3<f32> {
    arr.view().permuted_axes([2, 0, 1]).as_standard_layout().to_owned()
}

/// Drop the channel axis of a single-channel map
pub fn squeeze_channel(arr: &Array3<f32>) -> Array2<f32> {
    arr.index_axis(Axis(2), 0).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 1), |(y, x, _)| (y * w + x) as f32)
    }

    #[test]
    fn test_center_offset_rounding() {
        assert_eq!(center_offset(256, 224), 16);
        assert_eq!(center_offset(257, 224), 17);
        assert_eq!(center_offset(224, 224), 0);
    }

    #[test]
    fn test_flip_mirrors_columns() {
        let arr = ramp(2, 3);
        let flipped = flip_horizontal(&arr);
        assert_eq!(flipped[[0, 0, 0]], 2.0);
        assert_eq!(flipped[[1, 2, 0]], 3.0);
    }

    #[test]
    fn test_nearest_resize_keeps_labels() {
        let labels = Array3::from_shape_fn((4, 4, 1), |(y, _, _)| if y < 2 { 3.0 } else { 4.0 });
        let out = resize(&labels, 8, 8, Interpolation::Nearest);
        assert!(out.iter().all(|&v| v == 3.0 || v == 4.0));
        assert_eq!(out[[0, 0, 0]], 3.0);
        assert_eq!(out[[7, 7, 0]], 4.0);
    }

    #[test]
    fn test_bilinear_constant_is_preserved() {
        let arr = Array3::from_elem((5, 7, 3), 0.25f32);
        let out = resize(&arr, 11, 3, Interpolation::Bilinear);
        for v in out.iter() {
            assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_gaussian_blur_preserves_mean_of_constant() {
        let kernel = gaussian_kernel(15, 10.0);
        assert_abs_diff_eq!(kernel.iter().sum::<f32>(), 1.0, epsilon = 1e-5);

        let arr = Array3::from_elem((9, 9, 3), 100.0f32);
        let blurred = gaussian_blur(&arr, 5, 1.0);
        for v in blurred.iter() {
            assert_abs_diff_eq!(*v, 100.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_nonpositive_sigma_derived_from_kernel_size() {
        let derived = gaussian_kernel(5, 0.0);
        let explicit = gaussian_kernel(5, 1.1);
        for (d, e) in derived.iter().zip(&explicit) {
            assert_abs_diff_eq!(*d, *e, epsilon = 1e-6);
        }
        assert_eq!(gaussian_kernel(5, -3.0), derived);

        let arr = Array3::from_elem((4, 4, 3), 100.0f32);
        let blurred = gaussian_blur(&arr, 5, 0.0);
        assert!(blurred.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(blurred[[0, 0, 0]], 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_geometry_policies() {
        let mut cfg = DataConfig::default();
        cfg.resize_or_crop = ResizeOrCrop::ResizeAndCrop;
        cfg.load_size = 256;
        cfg.fine_size = 224;
        let mut rng = StdRng::seed_from_u64(3);

        let center = Geometry::plan(&cfg, CropPolicy::Center, &mut rng).unwrap();
        assert_eq!((center.top, center.left, center.flip), (16, 16, false));

        let random = Geometry::plan(&cfg, CropPolicy::Random, &mut rng).unwrap();
        assert!(random.top <= 32 && random.left <= 32);

        let bad = CropPolicy::Fixed {
            top: 40,
            left: 0,
            flip: false,
        };
        assert!(Geometry::plan(&cfg, bad, &mut rng).is_err());
    }

    #[test]
    fn test_to_chw_tensor_layout() {
        let arr = Array3::from_shape_fn((2, 2, 3), |(y, x, c)| (c * 100 + y * 10 + x) as f32);
        let t = to_chw_tensor(arr.view(), &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 2, 2]);
        let v: Vec<Vec<Vec<f32>>> = t.to_vec3().unwrap();
        assert_eq!(v[2][1][0], 210.0);
    }
}
