//! Loss terms shared by the pipeline models.

use candle_core::{DType, Result, Tensor, D};

use atelier_core::GanKind;

const LOG_EPS: f64 = 1e-12;

/// Adversarial objective for one critic output
#[derive(Debug, Clone, Copy)]
pub struct GanLoss {
    kind: GanKind,
}

impl GanLoss {
    pub fn new(kind: GanKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> GanKind {
        self.kind
    }

    /// Loss of raw critic scores `pred` against the real (`true`) or fake label.
    ///
    /// For `wgan` this is the signed critic mean: `-mean` for real,
    /// `+mean` for fake.
    pub fn loss(&self, pred: &Tensor, target_real: bool) -> Result<Tensor> {
        let target = if target_real { 1.0 } else { 0.0 };
        match self.kind {
            GanKind::Dcgan => {
                let labels = (pred.ones_like()? * target)?;
                candle_nn::loss::binary_cross_entropy_with_logit(pred, &labels)
            }
            GanKind::Lsgan => {
                let labels = (pred.ones_like()? * target)?;
                candle_nn::loss::mse(pred, &labels)
            }
            GanKind::Wgan => {
                let mean = pred.mean_all()?;
                if target_real {
                    mean.neg()
                } else {
                    Ok(mean)
                }
            }
        }
    }

    /// Critic loss from its fake and real outputs
    pub fn discriminator_loss(&self, pred_fake: &Tensor, pred_real: &Tensor) -> Result<Tensor> {
        let fake = self.loss(pred_fake, false)?;
        let real = self.loss(pred_real, true)?;
        match self.kind {
            GanKind::Wgan => fake + real,
            _ => ((fake + real)? * 0.5),
        }
    }
}

pub fn l1_loss(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    (a - b)?.abs()?.mean_all()
}

/// Binary cross entropy of probabilities in `[0, 1]`
pub fn bce_loss(prob: &Tensor, target: &Tensor) -> Result<Tensor> {
    let p = prob.clamp(LOG_EPS, 1.0 - 1e-7)?;
    let pos = (target * p.log()?)?;
    let neg = (target.affine(-1.0, 1.0)? * p.affine(-1.0, 1.0)?.log()?)?;
    (pos + neg)?.mean_all()?.neg()
}

/// Class-balanced binary cross entropy on logits.
///
/// `pos_rate` (n_attr) holds the fraction of positive samples per class;
/// positives are weighted `0.5 / rate`, negatives `0.5 / (1 - rate)`.
pub fn weighted_bce_with_logits(logits: &Tensor, target: &Tensor, pos_rate: &Tensor) -> Result<Tensor> {
    let rate = pos_rate.clamp(1e-3, 1.0 - 1e-3)?;
    let w_pos = rate.recip()?.affine(0.5, 0.0)?;
    let w_neg = rate.affine(-1.0, 1.0)?.recip()?.affine(0.5, 0.0)?;

    let log_p = candle_nn::ops::sigmoid(logits)?.clamp(LOG_EPS, 1.0)?.log()?;
    let log_not_p = candle_nn::ops::sigmoid(&logits.neg()?)?.clamp(LOG_EPS, 1.0)?.log()?;
    let pos = target.broadcast_mul(&w_pos)?.mul(&log_p)?;
    let neg = target.affine(-1.0, 1.0)?.broadcast_mul(&w_neg)?.mul(&log_not_p)?;
    (pos + neg)?.mean_all()?.neg()
}

/// Per-pixel cross entropy of `logits` (B, C, H, W) against a label map
/// (B, 1, H, W) or (B, H, W) holding class indices as floats
pub fn cross_entropy_map(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = logits.dims4()?;
    let flat_logits = logits.permute((0, 2, 3, 1))?.reshape((b * h * w, c))?;
    let flat_labels = labels.flatten_all()?.round()?.to_dtype(DType::U32)?;
    candle_nn::loss::cross_entropy(&flat_logits, &flat_labels)
}

/// Normalized Gram matrices (B, C, C) of feature maps (B, C, H, W)
pub fn gram_matrix(features: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = features.dims4()?;
    let f = features.reshape((b, c, h * w))?;
    let gram = f.matmul(&f.t()?)?;
    gram / (c * h * w) as f64
}

/// KL divergence between unit-variance Gaussians, summed over latent scales.
///
/// Each scale contributes `0.5 * sum((q - p)^2)` per sample; the result is
/// averaged over the batch.
pub fn kl_loss(ps: &[Tensor], qs: &[Tensor]) -> Result<Tensor> {
    if ps.len() != qs.len() || ps.is_empty() {
        return Err(candle_core::Error::Msg(format!(
            "kl expects matching non-empty latent lists, got {} and {}",
            ps.len(),
            qs.len()
        )));
    }
    let mut total: Option<Tensor> = None;
    for (p, q) in ps.iter().zip(qs) {
        let per_sample = (q - p)?.sqr()?.flatten_from(1)?.sum(D::Minus1)?;
        let term = (per_sample.mean_all()? * 0.5)?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    total.ok_or_else(|| candle_core::Error::Msg("no latent scales".into()))
}

/// Convert standard-normalized RGB (B, 3, H, W) in `[-1, 1]` to CIE Lab (D65)
pub fn rgb_to_lab(img: &Tensor) -> Result<Tensor> {
    let rgb = img.affine(0.5, 0.5)?.clamp(0.0, 1.0)?;

    // sRGB companding
    let linear_hi = rgb.affine(1.0 / 1.055, 0.055 / 1.055)?.maximum(1e-6)?.powf(2.4)?;
    let linear_lo = rgb.affine(1.0 / 12.92, 0.0)?;
    let linear = rgb.gt(0.04045)?.where_cond(&linear_hi, &linear_lo)?;

    let r = linear.narrow(1, 0, 1)?;
    let g = linear.narrow(1, 1, 1)?;
    let b = linear.narrow(1, 2, 1)?;
    let mix = |cr: f64, cg: f64, cb: f64| -> Result<Tensor> {
        ((r.affine(cr, 0.0)? + g.affine(cg, 0.0)?)? + b.affine(cb, 0.0)?)
    };
    // reference white normalization folded into the rows
    let x = mix(0.412453 / 0.950456, 0.357580 / 0.950456, 0.180423 / 0.950456)?;
    let y = mix(0.212671, 0.715160, 0.072169)?;
    let z = mix(0.019334 / 1.088754, 0.119193 / 1.088754, 0.950227 / 1.088754)?;

    let f = |t: &Tensor| -> Result<Tensor> {
        let cube = t.maximum(1e-6)?.powf(1.0 / 3.0)?;
        let lin = t.affine(7.787, 16.0 / 116.0)?;
        t.gt(0.008856)?.where_cond(&cube, &lin)
    };
    let (fx, fy, fz) = (f(&x)?, f(&y)?, f(&z)?);

    let l = fy.affine(116.0, -16.0)?;
    let a = ((&fx - &fy)? * 500.0)?;
    let b = ((&fy - &fz)? * 200.0)?;
    Tensor::cat(&[&l, &a, &b], 1)
}

/// Lab luminance mapped to `[-1, 1]` and repeated over three channels
pub fn lab_luminance(lab: &Tensor) -> Result<Tensor> {
    let l = lab.narrow(1, 0, 1)?.affine(1.0 / 50.0, -1.0)?;
    Tensor::cat(&[&l, &l, &l], 1)
}

/// Lab chroma channels scaled by 1/100
pub fn lab_chroma(lab: &Tensor) -> Result<Tensor> {
    lab.narrow(1, 1, 2)? / 100.0
}

/// MSE between the Lab chroma of two standard-normalized images
pub fn color_loss(img: &Tensor, target: &Tensor) -> Result<Tensor> {
    let a = lab_chroma(&rgb_to_lab(img)?)?;
    let b = lab_chroma(&rgb_to_lab(target)?)?;
    candle_nn::loss::mse(&a, &b.detach())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_lsgan_and_wgan_targets() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::new(&[[0.5f32, 1.5]], &device)?;

        let ls = GanLoss::new(GanKind::Lsgan);
        assert_abs_diff_eq!(ls.loss(&pred, true)?.to_scalar::<f32>()?, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(ls.loss(&pred, false)?.to_scalar::<f32>()?, 1.25, epsilon = 1e-6);

        let w = GanLoss::new(GanKind::Wgan);
        assert_abs_diff_eq!(w.loss(&pred, true)?.to_scalar::<f32>()?, -1.0, epsilon = 1e-6);
        let fake = Tensor::new(&[[0.0f32, 2.0]], &device)?;
        // critic: mean(fake) - mean(real)
        assert_abs_diff_eq!(w.discriminator_loss(&fake, &pred)?.to_scalar::<f32>()?, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_dcgan_matches_logistic_loss() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::new(&[0.0f32], &device)?;
        let loss = GanLoss::new(GanKind::Dcgan).loss(&pred, true)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(loss, std::f32::consts::LN_2, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_bce_of_probabilities() -> Result<()> {
        let device = Device::Cpu;
        let prob = Tensor::new(&[0.5f32, 0.5], &device)?;
        let target = Tensor::new(&[1.0f32, 0.0], &device)?;
        assert_abs_diff_eq!(bce_loss(&prob, &target)?.to_scalar::<f32>()?, std::f32::consts::LN_2, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_weighted_bce_balances_rare_positives() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32, 0.0]], &device)?;
        let target = Tensor::new(&[[1.0f32, 0.0]], &device)?;
        let rate = Tensor::new(&[0.5f32, 0.5], &device)?;
        // balanced classes reduce to plain BCE
        let loss = weighted_bce_with_logits(&logits, &target, &rate)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(loss, std::f32::consts::LN_2, epsilon = 1e-5);

        let rare = Tensor::new(&[0.1f32, 0.1], &device)?;
        let weighted = weighted_bce_with_logits(&logits, &target, &rare)?.to_scalar::<f32>()?;
        assert!(weighted > loss);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_map_prefers_correct_labels() -> Result<()> {
        let device = Device::Cpu;
        // 2 classes, 1x2 image: pixel 0 favours class 0, pixel 1 favours class 1
        let logits = Tensor::new(&[[[[4.0f32, -4.0]], [[-4.0f32, 4.0]]]], &device)?;
        let good = Tensor::new(&[[[[0.0f32, 1.0]]]], &device)?;
        let bad = Tensor::new(&[[[[1.0f32, 0.0]]]], &device)?;
        let lg = cross_entropy_map(&logits, &good)?.to_scalar::<f32>()?;
        let lb = cross_entropy_map(&logits, &bad)?.to_scalar::<f32>()?;
        assert!(lg < 0.01 && lb > 7.0);
        Ok(())
    }

    #[test]
    fn test_kl_sums_scales() -> Result<()> {
        let device = Device::Cpu;
        let p0 = Tensor::zeros((2, 1, 2, 2), DType::F32, &device)?;
        let q0 = Tensor::ones((2, 1, 2, 2), DType::F32, &device)?;
        let p1 = Tensor::zeros((2, 2, 1, 1), DType::F32, &device)?;
        let q1 = (Tensor::ones((2, 2, 1, 1), DType::F32, &device)? * 2.0)?;
        // 0.5 * 4 + 0.5 * (2 * 4) = 6
        let kl = kl_loss(&[p0, p1], &[q0, q1])?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(kl, 6.0, epsilon = 1e-6);
        assert!(kl_loss(&[], &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_lab_of_white_and_black() -> Result<()> {
        let device = Device::Cpu;
        let white = Tensor::ones((1, 3, 1, 1), DType::F32, &device)?;
        let lab = rgb_to_lab(&white)?.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(lab[0], 100.0, epsilon = 0.05);
        assert_abs_diff_eq!(lab[1], 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(lab[2], 0.0, epsilon = 0.05);

        let black = white.neg()?;
        let lab = rgb_to_lab(&black)?.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(lab[0], 0.0, epsilon = 0.05);

        let lum = lab_luminance(&rgb_to_lab(&white)?)?;
        assert_eq!(lum.dims(), &[1, 3, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_color_loss_ignores_luminance() -> Result<()> {
        let device = Device::Cpu;
        let grey = Tensor::zeros((1, 3, 2, 2), DType::F32, &device)?;
        let white = Tensor::ones((1, 3, 2, 2), DType::F32, &device)?;
        assert!(color_loss(&grey, &white)?.to_scalar::<f32>()? < 1e-6);
        Ok(())
    }
}
