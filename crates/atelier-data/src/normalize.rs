//! Per-channel image normalization.
//!
//! Images enter the generators in the standard `[-1, 1]` range. The
//! attribute encoder may have been trained on ImageNet statistics, in which
//! case generated images are remapped with the per-channel affine
//! `x_imagenet = a_c * x_std + b_c`, `a_c = 0.5 / σ_c`, `b_c = (0.5 - μ_c) / σ_c`.

use candle_core::{Device, Tensor};
use ndarray::{Array3, Axis};

pub use atelier_core::ImageNormalize as Normalization;
use atelier_core::{Error, Result};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel `(mean, std)` of a normalization convention
pub fn channel_stats(norm: Normalization) -> ([f32; 3], [f32; 3]) {
    match norm {
        Normalization::Standard => ([0.5; 3], [0.5; 3]),
        Normalization::ImageNet => (IMAGENET_MEAN, IMAGENET_STD),
    }
}

/// Normalize an HWC RGB array holding values in `[0, 1]`
pub fn normalize_hwc(arr: &mut Array3<f32>, norm: Normalization) -> Result<()> {
    let channels = arr.len_of(Axis(2));
    if channels != 3 {
        return Err(Error::ShapeMismatch(format!(
            "normalization expects 3 channels, got {channels}"
        )));
    }
    let (mean, std) = channel_stats(norm);
    for (c, mut plane) in arr.axis_iter_mut(Axis(2)).enumerate() {
        plane.mapv_inplace(|v| (v - mean[c]) / std[c]);
    }
    Ok(())
}

/// Per-channel `(a_c, b_c)` mapping standard-normalized values to ImageNet-normalized ones
pub fn std_to_imagenet_coeffs() -> [(f32, f32); 3] {
    let mut coeffs = [(0.0, 0.0); 3];
    for (c, coeff) in coeffs.iter_mut().enumerate() {
        *coeff = (
            0.5 / IMAGENET_STD[c],
            (0.5 - IMAGENET_MEAN[c]) / IMAGENET_STD[c],
        );
    }
    coeffs
}

/// Remap a CHW array from standard to ImageNet normalization
pub fn std_to_imagenet_array(arr: &Array3<f32>) -> Result<Array3<f32>> {
    if arr.len_of(Axis(0)) != 3 {
        return Err(Error::ShapeMismatch(format!(
            "expected 3 leading channels, got {:?}",
            arr.dim()
        )));
    }
    let mut out = arr.clone();
    for (c, (a, b)) in std_to_imagenet_coeffs().into_iter().enumerate() {
        out.index_axis_mut(Axis(0), c).mapv_inplace(|v| a * v + b);
    }
    Ok(out)
}

/// Remap an `(N, 3, H, W)` or `(3, H, W)` tensor from standard to ImageNet normalization
pub fn std_to_imagenet(t: &Tensor) -> Result<Tensor> {
    let rank = t.rank();
    let channel_dim = match rank {
        3 => 0,
        4 => 1,
        _ => {
            return Err(Error::ShapeMismatch(format!(
                "expected a 3-d or 4-d image tensor, got {:?}",
                t.dims()
            )))
        }
    };
    if t.dim(channel_dim)? != 3 {
        return Err(Error::ShapeMismatch(format!(
            "expected 3 channels, got {:?}",
            t.dims()
        )));
    }
    let coeffs = std_to_imagenet_coeffs();
    let mut shape = vec![1usize; rank];
    shape[channel_dim] = 3;
    let device: &Device = t.device();
    let a = Tensor::from_vec(coeffs.iter().map(|c| c.0).collect::<Vec<_>>(), shape.as_slice(), device)?
        .to_dtype(t.dtype())?;
    let b = Tensor::from_vec(coeffs.iter().map(|c| c.1).collect::<Vec<_>>(), shape.as_slice(), device)?
        .to_dtype(t.dtype())?;
    Ok(t.broadcast_mul(&a)?.broadcast_add(&b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_affine_matches_direct_imagenet_normalization() {
        // raw values in [0, 1]
        let raw = Array3::from_shape_fn((4, 5, 3), |(y, x, c)| ((y * 5 + x) as f32 * 0.05 + c as f32 * 0.1) % 1.0);

        let mut std_norm = raw.clone();
        normalize_hwc(&mut std_norm, Normalization::Standard).unwrap();
        let mut imagenet = raw.clone();
        normalize_hwc(&mut imagenet, Normalization::ImageNet).unwrap();

        let remapped = std_to_imagenet_array(&crate::image_ops::hwc_to_chw(&std_norm)).unwrap();
        let expected = crate::image_ops::hwc_to_chw(&imagenet);
        for (a, b) in remapped.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_tensor_affine_matches_array_affine() {
        let arr = Array3::from_shape_fn((3, 2, 2), |(c, y, x)| (c as f32 - 1.0) * 0.3 + (y + x) as f32 * 0.1);
        let expected = std_to_imagenet_array(&arr).unwrap();

        let t = Tensor::from_vec(arr.iter().copied().collect::<Vec<_>>(), (1, 3, 2, 2), &Device::Cpu).unwrap();
        let mapped = std_to_imagenet(&t).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in mapped.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_coefficients() {
        let coeffs = std_to_imagenet_coeffs();
        assert_abs_diff_eq!(coeffs[0].0, 0.5 / 0.229, epsilon = 1e-6);
        assert_abs_diff_eq!(coeffs[2].1, (0.5 - 0.406) / 0.225, epsilon = 1e-6);
    }

    #[test]
    fn test_wrong_channel_count_rejected() {
        let t = Tensor::zeros((2, 4, 8, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(std_to_imagenet(&t).is_err());
    }
}
