//! U-Net encoder-decoder generator.
//!
//! Used by the designer GAN (shape code in, optional attribute vector
//! injected at the bottleneck) and by supervised pose transfer
//! (reference image + target pose in).

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{Activation, ConvBlock, UpBlock};

/// U-Net generator configuration
#[derive(Debug, Clone)]
pub struct UnetConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    /// Channels after the first downsampling stage
    pub ngf: usize,
    /// Number of stride-2 stages; input sides must be divisible by `2^n_downsample`
    pub n_downsample: usize,
    /// Width of the condition vector broadcast at the bottleneck, 0 for none
    pub cond_nc: usize,
    /// Cap on the channel multiplier
    pub max_mult: usize,
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self {
            input_nc: 18,
            output_nc: 3,
            ngf: 64,
            n_downsample: 4,
            cond_nc: 0,
            max_mult: 8,
        }
    }
}

impl UnetConfig {
    fn channels(&self, stage: usize) -> usize {
        self.ngf * (1usize << stage).min(self.max_mult)
    }
}

/// Skip-connected encoder-decoder with a tanh output
pub struct UnetGenerator {
    downs: Vec<ConvBlock>,
    fuse: Option<ConvBlock>,
    ups: Vec<UpBlock>,
    config: UnetConfig,
}

impl UnetGenerator {
    pub fn new(config: UnetConfig, vb: VarBuilder) -> Result<Self> {
        let n = config.n_downsample.max(1);

        let mut downs = Vec::with_capacity(n);
        for i in 0..n {
            let in_c = if i == 0 { config.input_nc } else { config.channels(i - 1) };
            // no normalization on the outermost and innermost stages
            let norm = i > 0 && i + 1 < n;
            downs.push(ConvBlock::new(
                in_c,
                config.channels(i),
                4,
                2,
                1,
                norm,
                Activation::LeakyRelu,
                vb.pp(format!("down_{i}")),
            )?);
        }

        let bottleneck = config.channels(n - 1);
        let fuse = if config.cond_nc > 0 {
            Some(ConvBlock::new(
                bottleneck + config.cond_nc,
                bottleneck,
                1,
                1,
                0,
                false,
                Activation::Relu,
                vb.pp("fuse"),
            )?)
        } else {
            None
        };

        let mut ups = Vec::with_capacity(n);
        for k in 0..n {
            let j = n - 1 - k;
            let in_c = if k == 0 { bottleneck } else { 2 * config.channels(j) };
            let up = if j == 0 {
                UpBlock::new(in_c, config.output_nc, false, Activation::Tanh, vb.pp(format!("up_{j}")))?
            } else {
                UpBlock::new(in_c, config.channels(j - 1), true, Activation::Relu, vb.pp(format!("up_{j}")))?
            };
            ups.push(up);
        }

        Ok(Self {
            downs,
            fuse,
            ups,
            config,
        })
    }

    /// Generate from `x` (B, input_nc, H, W) and an optional (B, cond_nc) condition
    pub fn forward_t(&self, x: &Tensor, cond: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.downs.len());
        let mut h = x.clone();
        for down in &self.downs {
            h = down.forward_t(&h, train)?;
            skips.push(h.clone());
        }

        if let Some(fuse) = &self.fuse {
            let cond = cond.ok_or_else(|| candle_core::Error::Msg("generator expects a condition vector".into()))?;
            let (b, _, hh, ww) = h.dims4()?;
            let cond = cond
                .reshape((b, self.config.cond_nc, 1, 1))?
                .broadcast_as((b, self.config.cond_nc, hh, ww))?
                .contiguous()?;
            h = fuse.forward_t(&Tensor::cat(&[&h, &cond], 1)?, train)?;
        }

        let n = skips.len();
        for (k, up) in self.ups.iter().enumerate() {
            if k > 0 {
                h = Tensor::cat(&[&h, &skips[n - 1 - k]], 1)?;
            }
            h = up.forward_t(&h, train)?;
        }
        Ok(h)
    }

    pub fn config(&self) -> &UnetConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small(cond_nc: usize) -> UnetConfig {
        UnetConfig {
            input_nc: 5,
            output_nc: 3,
            ngf: 8,
            n_downsample: 3,
            cond_nc,
            max_mult: 4,
        }
    }

    #[test]
    fn test_unet_output_shape_and_range() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = UnetGenerator::new(small(0), vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 5, 16, 16), &device)?;
        let y = net.forward_t(&x, None, true)?;
        assert_eq!(y.dims(), &[2, 3, 16, 16]);
        let max = y.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }

    #[test]
    fn test_conditioned_unet_requires_condition() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = UnetGenerator::new(small(6), vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 5, 16, 16), &device)?;
        assert!(net.forward_t(&x, None, false).is_err());

        let cond = Tensor::randn(0f32, 1f32, (2, 6), &device)?;
        let y = net.forward_t(&x, Some(&cond), true)?;
        assert_eq!(y.dims(), &[2, 3, 16, 16]);
        Ok(())
    }
}
