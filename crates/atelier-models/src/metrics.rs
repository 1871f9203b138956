//! Image quality metrics computed at evaluation time.

use candle_core::{DType, Result, Tensor};

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;
const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

/// PSNR in dB of images in `[-1, 1]`, measured after mapping to `[0, 1]`
pub fn psnr(img: &Tensor, target: &Tensor) -> Result<f32> {
    let a = img.affine(0.5, 0.5)?;
    let b = target.affine(0.5, 0.5)?;
    let mse = (a - b)?.sqr()?.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    Ok(10.0 * (1.0 / mse.max(1e-10)).log10())
}

fn gaussian_window(channels: usize, img: &Tensor) -> Result<Tensor> {
    let half = (SSIM_WINDOW / 2) as f64;
    let g: Vec<f64> = (0..SSIM_WINDOW)
        .map(|i| (-((i as f64 - half).powi(2)) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp())
        .collect();
    let sum: f64 = g.iter().sum();
    let mut window = Vec::with_capacity(SSIM_WINDOW * SSIM_WINDOW);
    for gy in &g {
        for gx in &g {
            window.push((gy * gx / (sum * sum)) as f32);
        }
    }
    Tensor::from_vec(window, (1, 1, SSIM_WINDOW, SSIM_WINDOW), img.device())?
        .to_dtype(img.dtype())?
        .repeat((channels, 1, 1, 1))
}

/// Mean SSIM of (B, C, H, W) images in `[-1, 1]`, 11x11 Gaussian window with sigma 1.5
pub fn ssim(img: &Tensor, target: &Tensor) -> Result<f32> {
    let (_, c, _, _) = img.dims4()?;
    let a = img.affine(0.5, 0.5)?;
    let b = target.affine(0.5, 0.5)?;
    let window = gaussian_window(c, &a)?;
    let pad = SSIM_WINDOW / 2;
    let blur = |x: &Tensor| x.conv2d(&window, pad, 1, 1, c);

    let mu_a = blur(&a)?;
    let mu_b = blur(&b)?;
    let mu_a2 = mu_a.sqr()?;
    let mu_b2 = mu_b.sqr()?;
    let mu_ab = (&mu_a * &mu_b)?;
    let var_a = (blur(&a.sqr()?)? - &mu_a2)?;
    let var_b = (blur(&b.sqr()?)? - &mu_b2)?;
    let cov = (blur(&(&a * &b)?)? - &mu_ab)?;

    let num = (mu_ab.affine(2.0, SSIM_C1)? * cov.affine(2.0, SSIM_C2)?)?;
    let den = ((mu_a2 + mu_b2)?.affine(1.0, SSIM_C1)? * (var_a + var_b)?.affine(1.0, SSIM_C2)?)?;
    (num / den)?.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_psnr_known_error() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?;
        // 0.2 in [-1, 1] is 0.1 in [0, 1]: mse 0.01 -> 20 dB
        let b = (a.ones_like()? * 0.2)?;
        assert_abs_diff_eq!(psnr(&a, &b)?, 20.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_ssim_identity_and_noise() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::rand(-1f32, 1f32, (2, 3, 16, 16), &device)?;
        assert_abs_diff_eq!(ssim(&a, &a)?, 1.0, epsilon = 1e-4);

        let noise = Tensor::rand(-1f32, 1f32, (2, 3, 16, 16), &device)?;
        assert!(ssim(&a, &noise)? < 0.5);
        Ok(())
    }
}
